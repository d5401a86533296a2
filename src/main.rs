//! Arena - Match Lifecycle & Settlement Engine
//!
//! Coordinates live tournament matches: the authoritative match state
//! machine, per-match broadcast rooms for viewers, and the wallet ledger
//! that turns match outcomes into prize credits exactly once.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use arena_backend::{
    api::{create_router, AppState},
    auth::JwtHandler,
    matches::{run_promotion_sweep, MatchEngine, MatchStore},
    models::Config,
    rooms::{run_event_dispatcher, RoomRouter},
    settlement::SettlementEngine,
    wallet::WalletLedger,
};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = Config::from_env()?;
    info!("🎮 Arena backend starting (db: {})", config.database_path);

    let store = Arc::new(MatchStore::new(&config.database_path)?);
    let ledger = Arc::new(WalletLedger::new(&config.database_path)?);
    let settlement = Arc::new(SettlementEngine::new(
        Arc::clone(&store),
        Arc::clone(&ledger),
    ));
    let engine = Arc::new(MatchEngine::new(store, settlement));

    // The room router is an explicit instance passed by handle; it dies with
    // the process.
    let rooms = Arc::new(RoomRouter::new(
        config.room_close_grace_secs,
        config.room_close_warning_secs,
    ));
    let jwt = Arc::new(JwtHandler::new(config.jwt_secret.clone()));

    // Fan engine events out to match rooms.
    tokio::spawn(run_event_dispatcher(
        engine.subscribe_events(),
        Arc::clone(&rooms),
    ));

    // Time-based upcoming -> ongoing promotion, as an explicit sweep.
    tokio::spawn(run_promotion_sweep(
        Arc::clone(&engine),
        config.sweep_interval_secs,
    ));

    let state = AppState {
        engine,
        ledger,
        rooms,
        jwt,
    };
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!("🚀 Listening on {}", addr);

    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
