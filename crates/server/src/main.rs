mod auth;
mod config;
mod error;
mod metrics;
mod node_manager;
mod router;
mod stores;
mod tls;
mod wake_schedule;
mod web;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::Level;
use tracing_subscriber::EnvFilter;

use crate::metrics::RuntimeMetrics;
use crate::node_manager::{NodeManager, NodeManagerConfig};
use crate::router::{CommandRouter, CommandRouterConfig};
use crate::stores::{InMemoryCommandStore, InMemoryHostAggregator, InMemoryNodeStore, InMemoryWakeScheduleStore};
use crate::wake_schedule::{WakeScheduleWorker, stop_wake_schedule_worker};
use crate::web::AppState;

fn parse_args() -> (PathBuf, Option<u16>) {
    let args: Vec<String> = std::env::args().collect();
    let mut config_path = PathBuf::from("./config/cnc.toml");
    let mut port_override = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    config_path = PathBuf::from(&args[i + 1]);
                    i += 1;
                }
            }
            "--port" | "-p" => {
                if i + 1 < args.len() {
                    port_override = args[i + 1].parse().ok();
                    i += 1;
                }
            }
            _ => {}
        }
        i += 1;
    }

    (config_path, port_override)
}

#[tokio::main]
async fn main() -> Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let (config_path, port_override) = parse_args();

    let mut cnc_config = config::load_config(&config_path)?;
    if let Some(p) = port_override {
        cnc_config.server.port = p;
    }

    if let Err(issues) = cnc_config.validate() {
        let has_errors = issues.iter().any(|i| i.starts_with("ERROR:"));
        for issue in &issues {
            if issue.starts_with("ERROR:") {
                tracing::error!("{}", issue);
            } else {
                tracing::warn!("{}", issue);
            }
        }
        if has_errors {
            tracing::error!("Configuration has {} issue(s). Fix the ERROR(s) above and restart.", issues.len());
            std::process::exit(1);
        }
    }

    let port = cnc_config.server.port;
    let bind_addr: SocketAddr = format!("{}:{}", cnc_config.server.bind, port).parse().context("Invalid bind address")?;

    let tls_result = tls::build_tls_config(cnc_config.server.tls_cert.as_deref(), cnc_config.server.tls_key.as_deref())?;
    let tls_acceptor = tls::make_acceptor(tls_result.config);

    let metrics = Arc::new(RuntimeMetrics::new());
    let host_aggregator = Arc::new(InMemoryHostAggregator::new());

    let node_manager = NodeManager::new(
        Arc::new(InMemoryNodeStore::new()),
        Arc::clone(&host_aggregator),
        Arc::clone(&metrics),
        NodeManagerConfig {
            heartbeat_interval: Duration::from_millis(cnc_config.node.heartbeat_interval_ms),
            node_timeout: Duration::from_millis(cnc_config.node.timeout_ms),
            supported_protocol_versions: cnc_config.node.supported_protocol_versions.clone(),
            node_auth_tokens: cnc_config.auth.node_auth_tokens.clone(),
            session_token: cnc_config.session_token.clone(),
        },
    );
    node_manager.start_heartbeat_supervisor().await;

    let (command_router, result_listener) = CommandRouter::new(
        Arc::clone(&node_manager),
        Arc::new(InMemoryCommandStore::new()),
        Arc::clone(&host_aggregator),
        Arc::clone(&metrics),
        CommandRouterConfig {
            command_timeout: Duration::from_millis(cnc_config.command.timeout_ms),
            max_retries: cnc_config.command.max_retries,
            retry_base_delay_ms: cnc_config.command.retry_base_delay_ms,
        },
    );
    let reconciled = command_router.reconcile_stale_in_flight().await;
    if reconciled > 0 {
        tracing::info!(reconciled, "reconciled in-flight commands abandoned by a previous process lifetime");
    }

    let wake_schedule_worker = WakeScheduleWorker::new(Arc::clone(&command_router), Arc::new(InMemoryWakeScheduleStore::new()), cnc_config.schedule_worker.clone());
    let wake_schedule_handle = wake_schedule_worker.spawn();

    let state = Arc::new(AppState {
        node_manager: Arc::clone(&node_manager),
        metrics: Arc::clone(&metrics),
        metrics_require_auth: cnc_config.server.metrics_require_auth,
        started_at: std::time::Instant::now(),
    });

    let app = web::build_router(Arc::clone(&state))
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &axum::http::Request<_>| {
                    let request_id = request.headers().get("x-request-id").and_then(|v| v.to_str().ok()).unwrap_or("-");
                    tracing::info_span!("request", method = %request.method(), path = %request.uri().path(), request_id = %request_id)
                })
                .on_request(|_request: &axum::http::Request<_>, _span: &tracing::Span| {
                    tracing::event!(Level::INFO, "started");
                })
                .on_response(|response: &axum::http::Response<_>, latency: std::time::Duration, _span: &tracing::Span| {
                    tracing::event!(Level::INFO, status = %response.status().as_u16(), duration_ms = %latency.as_millis(), "completed");
                }),
        )
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid));

    tracing::info!("===========================================");
    tracing::info!("  CNC Control Plane");
    tracing::info!("  Listening on https://{bind_addr}");
    tracing::info!("===========================================");

    let listener = TcpListener::bind(bind_addr).await.with_context(|| format!("Failed to bind to {bind_addr}"))?;
    tracing::info!("Server ready, accepting connections");

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (stream, peer_addr) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::warn!("Failed to accept TCP connection: {e}");
                        continue;
                    }
                };

                let acceptor = tls_acceptor.clone();
                let app = app.clone();

                tokio::spawn(async move {
                    let tls_stream = match tokio::time::timeout(Duration::from_secs(10), acceptor.accept(stream)).await {
                        Ok(Ok(s)) => s,
                        Ok(Err(e)) => {
                            tracing::debug!(%peer_addr, "TLS handshake failed: {e}");
                            return;
                        }
                        Err(_) => {
                            tracing::debug!(%peer_addr, "TLS handshake timed out");
                            return;
                        }
                    };

                    let io = hyper_util::rt::TokioIo::new(tls_stream);
                    let hyper_service = hyper_util::service::TowerToHyperService::new(app);
                    let builder = hyper_util::server::conn::auto::Builder::new(hyper_util::rt::TokioExecutor::new());

                    if let Err(e) = builder.serve_connection_with_upgrades(io, hyper_service).await {
                        tracing::debug!(%peer_addr, "Connection error: {e}");
                    }
                });
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received SIGINT, initiating graceful shutdown");
                break;
            }
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, initiating graceful shutdown");
                break;
            }
        }
    }

    tracing::info!("Stopping wake schedule worker");
    stop_wake_schedule_worker(&wake_schedule_worker, wake_schedule_handle).await;

    tracing::info!("Closing node sessions");
    node_manager.shutdown().await;

    result_listener.abort();

    tracing::info!("cnc-server shut down cleanly");

    Ok(())
}
