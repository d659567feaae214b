pub mod config;
pub mod fqn;
pub mod messages;
pub mod redact;

pub use config::*;
pub use fqn::*;
pub use messages::*;
pub use redact::*;
