//! Server entry point: loads config, connects the store and the device
//! link, wires the mediation service, and serves REST + WebSocket until a
//! shutdown signal arrives.

use std::env;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::{mpsc, RwLock};
use tracing::{error, info, warn};

use ventylab_server::auth::TokenVerifier;
use ventylab_server::config;
use ventylab_server::db::Db;
use ventylab_server::gateway::Gateway;
use ventylab_server::link::DeviceLink;
use ventylab_server::mediator::Mediator;
use ventylab_server::reservation::ReservationManager;
use ventylab_server::simulation::SimulationManager;
use ventylab_server::state::MediationState;
use ventylab_server::web::{self, AppState};

/// Raw frame payloads buffered between the link task and the mediator.
const FRAME_CHANNEL_CAPACITY: usize = 1_024;

#[tokio::main]
async fn main() -> Result<()> {
    // ── Structured logging ──────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    // ── Config ──────────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let cfg = config::from_env(&config_path)?;
    info!(
        device = %cfg.device_id,
        broker = %format!("{}:{}", cfg.mqtt.host, cfg.mqtt.port),
        "configuration loaded"
    );
    if cfg.auth.token_secret == config::AuthConfig::default().token_secret {
        warn!("auth token secret is the development default — set AUTH_TOKEN_SECRET in production");
    }

    // ── Store ───────────────────────────────────────────────────────
    let db = Db::connect(&cfg.database.url).await?;
    db.migrate().await?;
    info!("database ready");

    // ── Mediation plane ─────────────────────────────────────────────
    let gateway = Arc::new(Gateway::new());
    let (frame_tx, frame_rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
    let link = DeviceLink::connect(&cfg.mqtt, frame_tx);

    let mediator = Arc::new(Mediator {
        state: Arc::new(RwLock::new(MediationState::new())),
        gateway: Arc::clone(&gateway),
        link,
        reservations: ReservationManager::new(db.clone(), cfg.device_id.clone(), Arc::clone(&gateway)),
        simulations: SimulationManager::new(),
        db,
        device_id: cfg.device_id.clone(),
    });

    let mut frame_pump = mediator.spawn_frame_pump(frame_rx);

    // ── Web server ──────────────────────────────────────────────────
    let app_state = AppState {
        mediator: Arc::clone(&mediator),
        verifier: Arc::new(TokenVerifier::new(cfg.auth.token_secret.clone())),
    };
    let web_port = cfg.web.port;
    let mut web_handle = tokio::spawn(async move {
        if let Err(e) = web::serve(app_state, web_port).await {
            error!("web server failed: {e:#}");
        }
    });

    // ── Signal handling ─────────────────────────────────────────────
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    let exit_reason: &str;
    loop {
        tokio::select! {
            result = &mut frame_pump => {
                error!("frame pump exited unexpectedly: {result:?}");
                exit_reason = "frame pump died";
                break;
            }
            result = &mut web_handle => {
                error!("web server exited unexpectedly: {result:?}");
                exit_reason = "web server died";
                break;
            }
            _ = &mut ctrl_c => {
                exit_reason = "SIGINT";
                break;
            }
            _ = sigterm.recv() => {
                exit_reason = "SIGTERM";
                break;
            }
        }
    }

    // ── Graceful shutdown ───────────────────────────────────────────
    warn!(signal = exit_reason, "shutting down");
    mediator.shutdown().await;
    info!("shutdown complete");
    Ok(())
}
