//! Settlement Orchestration
//!
//! Converts a completed match's outcome into wallet credits. Settlement is a
//! best-effort fan-out over independently-atomic credits, not one multi-party
//! transaction: each award carries an idempotency key derived from
//! (match, participant, rank), so re-invoking after a partial failure pays
//! only what is still owed and never double-pays anyone.

use crate::errors::{DomainError, DomainResult};
use crate::matches::MatchStore;
use crate::models::{MatchStatus, TransactionType};
use crate::rewards::{calculate_rewards, TemplateRegistry};
use crate::wallet::WalletLedger;
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Outcome of one award's credit attempt.
#[derive(Debug, Clone, Serialize)]
pub struct AwardResult {
    pub participant_id: Uuid,
    pub rank: u32,
    pub amount: u64,
    /// True when this award had already been paid by an earlier run.
    pub duplicate: bool,
    pub error: Option<String>,
}

/// Report of one settlement run. Per-award failures are listed here while the
/// match stays completed; the run is safely re-invocable.
#[derive(Debug, Clone, Serialize)]
pub struct SettlementReport {
    pub match_id: Uuid,
    pub prize_pool: u64,
    /// Total paid out for this match across all runs.
    pub total_distributed: u64,
    /// Amount newly credited by this run (zero on a clean re-run).
    pub newly_credited: u64,
    pub awards: Vec<AwardResult>,
    pub failed: usize,
}

impl SettlementReport {
    pub fn fully_settled(&self) -> bool {
        self.failed == 0
    }
}

/// Settlement engine: Reward Calculator -> Wallet Ledger, per award.
pub struct SettlementEngine {
    store: Arc<MatchStore>,
    ledger: Arc<WalletLedger>,
    templates: TemplateRegistry,
}

impl SettlementEngine {
    pub fn new(store: Arc<MatchStore>, ledger: Arc<WalletLedger>) -> Self {
        Self {
            store,
            ledger,
            templates: TemplateRegistry::default(),
        }
    }

    pub fn with_templates(
        store: Arc<MatchStore>,
        ledger: Arc<WalletLedger>,
        templates: TemplateRegistry,
    ) -> Self {
        Self {
            store,
            ledger,
            templates,
        }
    }

    /// Idempotency key for one award. Stable across runs so a retried
    /// settlement resolves to the original credit.
    fn award_key(match_id: Uuid, participant_id: Uuid, rank: u32) -> String {
        format!("match_reward_{}_{}_{}", match_id, participant_id, rank)
    }

    /// Settle a completed match. Safe to call any number of times.
    pub fn settle(&self, match_id: Uuid) -> DomainResult<SettlementReport> {
        let m = self.store.get(match_id)?;
        if m.status != MatchStatus::Completed {
            return Err(DomainError::InvalidTransition {
                from: m.status,
                action: "settle",
            });
        }

        if m.prize_pool == 0 {
            info!(match_id = %match_id, "settlement: no prize pool, nothing to distribute");
            return Ok(SettlementReport {
                match_id,
                prize_pool: 0,
                total_distributed: 0,
                newly_credited: 0,
                awards: Vec::new(),
                failed: 0,
            });
        }

        let leaderboard = m.leaderboard();
        let awards = calculate_rewards(
            &leaderboard,
            m.prize_pool,
            self.templates.resolve(&m.prize_template),
        );

        let source = format!("match:{}", match_id);
        let mut results = Vec::with_capacity(awards.len());
        let mut total_distributed = 0u64;
        let mut newly_credited = 0u64;
        let mut failed = 0usize;

        for award in &awards {
            let key = Self::award_key(match_id, award.participant_id, award.rank);
            let description = format!("Rank #{} match reward", award.rank);

            match self.ledger.credit(
                award.participant_id,
                award.amount,
                TransactionType::Reward,
                &source,
                &description,
                Some(&key),
            ) {
                Ok(outcome) => {
                    total_distributed += award.amount;
                    if !outcome.duplicate {
                        newly_credited += award.amount;
                    }
                    results.push(AwardResult {
                        participant_id: award.participant_id,
                        rank: award.rank,
                        amount: award.amount,
                        duplicate: outcome.duplicate,
                        error: None,
                    });
                }
                Err(e) => {
                    // One failed award never blocks the others; the match
                    // stays completed and the run can be re-triggered.
                    error!(
                        match_id = %match_id,
                        participant = %award.participant_id,
                        rank = award.rank,
                        "settlement credit failed: {}",
                        e
                    );
                    failed += 1;
                    results.push(AwardResult {
                        participant_id: award.participant_id,
                        rank: award.rank,
                        amount: award.amount,
                        duplicate: false,
                        error: Some(e.to_string()),
                    });
                }
            }
        }

        if failed == 0 {
            self.store.record_settlement(match_id, total_distributed)?;
            info!(
                match_id = %match_id,
                total_distributed,
                newly_credited,
                "✅ Settlement complete"
            );
        } else {
            warn!(
                match_id = %match_id,
                failed,
                "⚠️  Settlement partially failed, re-trigger to retry unpaid awards"
            );
        }

        Ok(SettlementReport {
            match_id,
            prize_pool: m.prize_pool,
            total_distributed,
            newly_credited,
            awards: results,
            failed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{channel_id_for, Match};
    use chrono::Utc;
    use std::collections::HashMap;
    use tempfile::NamedTempFile;

    fn setup() -> (Arc<MatchStore>, Arc<WalletLedger>, SettlementEngine, NamedTempFile) {
        let temp = NamedTempFile::new().unwrap();
        let path = temp.path().to_str().unwrap();
        let store = Arc::new(MatchStore::new(path).unwrap());
        let ledger = Arc::new(WalletLedger::new(path).unwrap());
        let engine = SettlementEngine::new(Arc::clone(&store), Arc::clone(&ledger));
        (store, ledger, engine, temp)
    }

    fn upcoming_match(participants: Vec<Uuid>, pool: u64) -> Match {
        let id = Uuid::new_v4();
        let now = Utc::now();
        Match {
            id,
            competition_id: Uuid::new_v4(),
            organizer_id: Uuid::new_v4(),
            participants,
            scores: HashMap::new(),
            status: MatchStatus::Upcoming,
            winner: None,
            started_at: None,
            ended_at: None,
            scheduled_at: None,
            channel_id: channel_id_for(id),
            prize_pool: pool,
            prize_template: "top3".to_string(),
            match_number: 1,
            game_mode: String::new(),
            total_distributed: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn drive_to_completed(store: &MatchStore, m: &Match, scores: &[(Uuid, u64)]) {
        store.insert(m).unwrap();
        store.start(m.id, Utc::now()).unwrap();
        for (p, s) in scores {
            store.update_score(m.id, *p, *s, Utc::now()).unwrap();
        }
        store.end(m.id, Utc::now()).unwrap();
    }

    #[test]
    fn test_settles_top3_and_records_total() {
        let (store, ledger, engine, _temp) = setup();
        let p1 = Uuid::new_v4();
        let p2 = Uuid::new_v4();
        let p3 = Uuid::new_v4();
        let scores = [(p1, 100), (p2, 80), (p3, 50)];
        let m = upcoming_match(vec![p1, p2, p3], 1000);
        drive_to_completed(&store, &m, &scores);

        let report = engine.settle(m.id).unwrap();
        assert!(report.fully_settled());
        assert_eq!(report.total_distributed, 1000);
        assert_eq!(report.newly_credited, 1000);

        assert_eq!(ledger.get_wallet(p1, 5).unwrap().balance, 500);
        assert_eq!(ledger.get_wallet(p2, 5).unwrap().balance, 300);
        assert_eq!(ledger.get_wallet(p3, 5).unwrap().balance, 200);
        assert_eq!(store.get(m.id).unwrap().total_distributed, 1000);
    }

    #[test]
    fn test_resettle_pays_nothing_extra() {
        let (store, ledger, engine, _temp) = setup();
        let p1 = Uuid::new_v4();
        let p2 = Uuid::new_v4();
        let m = upcoming_match(vec![p1, p2], 1000);
        drive_to_completed(&store, &m, &[(p1, 10), (p2, 20)]);

        engine.settle(m.id).unwrap();
        let rerun = engine.settle(m.id).unwrap();

        assert!(rerun.fully_settled());
        assert_eq!(rerun.newly_credited, 0);
        assert!(rerun.awards.iter().all(|a| a.duplicate));

        // Exactly one credit per award, ever.
        assert_eq!(ledger.get_wallet(p2, 10).unwrap().balance, 500);
        assert_eq!(ledger.get_wallet(p1, 10).unwrap().balance, 300);
    }

    #[test]
    fn test_settle_requires_completed_match() {
        let (store, _ledger, engine, _temp) = setup();
        let p1 = Uuid::new_v4();
        let m = upcoming_match(vec![p1], 1000);
        store.insert(&m).unwrap();

        let err = engine.settle(m.id).unwrap_err();
        assert!(matches!(
            err,
            DomainError::InvalidTransition {
                from: MatchStatus::Upcoming,
                action: "settle"
            }
        ));
    }

    #[test]
    fn test_zero_pool_is_clean_noop() {
        let (store, _ledger, engine, _temp) = setup();
        let p1 = Uuid::new_v4();
        let m = upcoming_match(vec![p1], 0);
        drive_to_completed(&store, &m, &[(p1, 1)]);

        let report = engine.settle(m.id).unwrap();
        assert!(report.fully_settled());
        assert!(report.awards.is_empty());
        assert_eq!(report.total_distributed, 0);
    }

    #[test]
    fn test_fewer_participants_than_template_ranks() {
        let (store, ledger, engine, _temp) = setup();
        let p1 = Uuid::new_v4();
        let p2 = Uuid::new_v4();
        let m = upcoming_match(vec![p1, p2], 1000);
        drive_to_completed(&store, &m, &[(p1, 5), (p2, 9)]);

        let report = engine.settle(m.id).unwrap();
        // top3 over two players pays ranks 1 and 2 only.
        assert_eq!(report.awards.len(), 2);
        assert_eq!(report.total_distributed, 800);
        assert_eq!(ledger.get_wallet(p2, 5).unwrap().balance, 500);
        assert_eq!(ledger.get_wallet(p1, 5).unwrap().balance, 300);
    }
}
