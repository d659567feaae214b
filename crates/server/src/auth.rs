use anyhow::{Context, Result, bail};
use cnc_protocol::SessionTokenConfig;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, TokenData, Validation};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Claims carried by a node session token, minted once the static-token
/// phase of registration succeeds and presented on every reconnect after.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// Issuer: identifies this control plane instance.
    pub iss: String,
    /// Audience: identifies this token as a node session token.
    pub aud: String,
    /// Subject: the node id the token was minted for.
    pub sub: String,
    pub iat: u64,
    pub exp: u64,
}

/// Mint a session token for `node_id`. Always signs with the first secret
/// in the rotation list. Returns the token and its expiry as a Unix
/// timestamp.
pub fn mint_session_token(node_id: &str, config: &SessionTokenConfig) -> Result<(String, u64)> {
    let signing_secret = config.secrets.first().context("session_token.secrets has no signing secret configured")?;

    let now = SystemTime::now().duration_since(UNIX_EPOCH).context("system clock error")?.as_secs();
    let exp = now + config.ttl_seconds;

    let claims = Claims { iss: config.issuer.clone(), aud: config.audience.clone(), sub: node_id.to_string(), iat: now, exp };

    let token = jsonwebtoken::encode(&Header::default(), &claims, &EncodingKey::from_secret(signing_secret.as_bytes()))
        .context("failed to encode session token")?;

    Ok((token, exp))
}

/// Verify a session token against every secret in the rotation list, in
/// order, returning as soon as one of them validates it. This lets a
/// secret be retired by dropping it from the list once the longest-lived
/// token signed with it has expired, without invalidating tokens signed by
/// secrets still ahead of it.
pub fn verify_session_token(token: &str, config: &SessionTokenConfig) -> Result<Claims> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.set_issuer(&[config.issuer.clone()]);
    validation.set_audience(&[config.audience.clone()]);

    for secret in &config.secrets {
        let result: Result<TokenData<Claims>, _> =
            jsonwebtoken::decode(token, &DecodingKey::from_secret(secret.as_bytes()), &validation);
        if let Ok(token_data) = result {
            return Ok(token_data.claims);
        }
    }

    bail!("session token did not validate against any configured secret")
}

/// Check a static, pre-shared token presented during the opening phase of
/// registration against the configured allowlist. Constant-time so token
/// length and prefix don't leak through comparison timing.
pub fn check_static_node_token(presented: &str, configured_tokens: &[String]) -> bool {
    configured_tokens.iter().any(|candidate| constant_time_eq(presented, candidate))
}

/// Constant-time string comparison: always walks the full length of the
/// longer operand so equality doesn't short-circuit on the first mismatch.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Generate a cryptographically secure random secret, for bootstrapping a
/// `session_token.secrets` entry when none is configured.
///
/// Uses `/dev/urandom` for CSPRNG on Linux.
pub fn generate_secret() -> String {
    use std::fmt::Write;
    let mut bytes = [0u8; 32];
    let f = std::fs::File::open("/dev/urandom").expect("failed to open /dev/urandom");
    use std::io::Read;
    (&f).read_exact(&mut bytes).expect("failed to read random bytes");
    let mut hex = String::with_capacity(64);
    for b in &bytes {
        write!(hex, "{b:02x}").unwrap();
    }
    hex
}
