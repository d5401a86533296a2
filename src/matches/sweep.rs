//! Scheduled promotion sweep
//!
//! Time-based upcoming -> ongoing promotion is an explicit reconciliation
//! step driven from here, so the state machine's transition rules stay the
//! single source of truth (no persistence-hook status flips).

use crate::matches::MatchEngine;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Periodically promote due upcoming matches. Runs until the process exits.
pub async fn run_promotion_sweep(engine: Arc<MatchEngine>, interval_secs: u64) {
    let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        match engine.promote_due(Utc::now()) {
            Ok(promoted) if !promoted.is_empty() => {
                info!(count = promoted.len(), "⏰ Promotion sweep started due matches");
            }
            Ok(_) => {}
            Err(e) => {
                // Next tick retries; a missed sweep only delays promotion.
                warn!("promotion sweep failed: {}", e);
            }
        }
    }
}
