//! Prize Distribution
//!
//! Pure reward calculation: final leaderboard + prize pool + distribution
//! template -> awards. No I/O, fully unit-testable.

use crate::errors::{DomainError, DomainResult};
use crate::models::{LeaderboardEntry, PrizeAward};
use std::collections::HashMap;

/// Default template used when a competition names an unknown one.
pub const DEFAULT_TEMPLATE: &str = "top3";

/// Registry of prize distribution templates.
///
/// A template is a list of percentages by rank (index 0 = rank 1). Custom
/// templates are validated at registration; resolution of an unknown name
/// falls back to `top3`.
#[derive(Debug, Clone)]
pub struct TemplateRegistry {
    templates: HashMap<String, Vec<u32>>,
}

impl Default for TemplateRegistry {
    fn default() -> Self {
        let mut templates = HashMap::new();
        templates.insert("winner_takes_all".to_string(), vec![100]);
        templates.insert("top3".to_string(), vec![50, 30, 20]);
        templates.insert("top5".to_string(), vec![40, 25, 15, 12, 8]);
        templates.insert(
            "top10".to_string(),
            vec![30, 20, 15, 10, 8, 6, 4, 3, 2, 2],
        );
        Self { templates }
    }
}

impl TemplateRegistry {
    /// Register a custom template. Percentages must be positive and sum to at
    /// most 100.
    pub fn register(&mut self, name: &str, percentages: Vec<u32>) -> DomainResult<()> {
        if percentages.is_empty() {
            return Err(DomainError::InvalidTemplate {
                reason: "template has no ranks".to_string(),
            });
        }
        if percentages.iter().any(|&p| p == 0) {
            return Err(DomainError::InvalidTemplate {
                reason: "every rank percentage must be positive".to_string(),
            });
        }
        let total: u32 = percentages.iter().sum();
        if total > 100 {
            return Err(DomainError::InvalidTemplate {
                reason: format!("percentages sum to {} (max 100)", total),
            });
        }
        self.templates.insert(name.to_string(), percentages);
        Ok(())
    }

    /// Resolve a template by name, falling back to `top3` for unknown names.
    pub fn resolve(&self, name: &str) -> &[u32] {
        self.templates
            .get(name)
            .or_else(|| self.templates.get(DEFAULT_TEMPLATE))
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }
}

/// Compute prize awards from a final leaderboard.
///
/// For each (rank, percentage) in the template with a leaderboard entry at
/// that rank, amount = floor(pool * percentage / 100). Ranks beyond the
/// leaderboard yield no award, so a 2-player match under `top3` pays two.
pub fn calculate_rewards(
    leaderboard: &[LeaderboardEntry],
    prize_pool: u64,
    percentages: &[u32],
) -> Vec<PrizeAward> {
    let mut awards = Vec::with_capacity(percentages.len());

    for (i, &percentage) in percentages.iter().enumerate() {
        let Some(entry) = leaderboard.get(i) else {
            continue;
        };
        let amount = prize_pool * percentage as u64 / 100;
        awards.push(PrizeAward {
            participant_id: entry.participant_id,
            rank: (i + 1) as u32,
            percentage,
            amount,
        });
    }

    awards
}

/// Split of an entry fee between platform, organizer, and the prize pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeeSplit {
    pub entry_fee: u64,
    pub platform_fee: u64,
    pub organizer_fee: u64,
    pub prize_pool_contribution: u64,
}

/// Compute the entry fee split. Fees floor; the remainder goes to the pool.
pub fn fee_split(entry_fee: u64, platform_pct: u32, organizer_pct: u32) -> FeeSplit {
    let platform_fee = entry_fee * platform_pct as u64 / 100;
    let organizer_fee = entry_fee * organizer_pct as u64 / 100;
    FeeSplit {
        entry_fee,
        platform_fee,
        organizer_fee,
        prize_pool_contribution: entry_fee - platform_fee - organizer_fee,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn board(scores: &[u64]) -> Vec<LeaderboardEntry> {
        scores
            .iter()
            .enumerate()
            .map(|(i, &score)| LeaderboardEntry {
                participant_id: Uuid::new_v4(),
                score,
                rank: (i + 1) as u32,
            })
            .collect()
    }

    #[test]
    fn test_top3_split_on_1000() {
        let registry = TemplateRegistry::default();
        let leaderboard = board(&[100, 80, 50]);

        let awards = calculate_rewards(&leaderboard, 1000, registry.resolve("top3"));

        assert_eq!(awards.len(), 3);
        assert_eq!(awards[0].amount, 500);
        assert_eq!(awards[1].amount, 300);
        assert_eq!(awards[2].amount, 200);
        assert_eq!(awards[0].participant_id, leaderboard[0].participant_id);
        assert_eq!(awards[2].rank, 3);
    }

    #[test]
    fn test_unmatched_ranks_yield_no_award() {
        let registry = TemplateRegistry::default();
        let leaderboard = board(&[10, 5]);

        let awards = calculate_rewards(&leaderboard, 1000, registry.resolve("top5"));

        assert_eq!(awards.len(), 2);
        assert_eq!(awards[0].amount, 400);
        assert_eq!(awards[1].amount, 250);
    }

    #[test]
    fn test_amounts_floor() {
        let registry = TemplateRegistry::default();
        let leaderboard = board(&[3, 2, 1]);

        // 333 * 50 / 100 = 166.5 -> 166
        let awards = calculate_rewards(&leaderboard, 333, registry.resolve("top3"));
        assert_eq!(awards[0].amount, 166);
        assert_eq!(awards[1].amount, 99);
        assert_eq!(awards[2].amount, 66);
    }

    #[test]
    fn test_winner_takes_all() {
        let registry = TemplateRegistry::default();
        let leaderboard = board(&[1, 0]);

        let awards = calculate_rewards(&leaderboard, 750, registry.resolve("winner_takes_all"));
        assert_eq!(awards.len(), 1);
        assert_eq!(awards[0].amount, 750);
        assert_eq!(awards[0].percentage, 100);
    }

    #[test]
    fn test_unknown_template_falls_back_to_top3() {
        let registry = TemplateRegistry::default();
        assert_eq!(registry.resolve("no_such_template"), &[50, 30, 20]);
    }

    #[test]
    fn test_zero_pool_yields_zero_amounts() {
        let registry = TemplateRegistry::default();
        let awards = calculate_rewards(&board(&[9, 8, 7]), 0, registry.resolve("top3"));
        assert!(awards.iter().all(|a| a.amount == 0));
    }

    #[test]
    fn test_register_rejects_over_100() {
        let mut registry = TemplateRegistry::default();
        let err = registry.register("greedy", vec![70, 40]).unwrap_err();
        assert!(matches!(err, DomainError::InvalidTemplate { .. }));
    }

    #[test]
    fn test_register_rejects_zero_percentage() {
        let mut registry = TemplateRegistry::default();
        assert!(registry.register("holey", vec![50, 0, 10]).is_err());
    }

    #[test]
    fn test_register_and_resolve_custom() {
        let mut registry = TemplateRegistry::default();
        registry.register("top2_even", vec![50, 50]).unwrap();
        assert_eq!(registry.resolve("top2_even"), &[50, 50]);
    }

    #[test]
    fn test_fee_split() {
        let split = fee_split(1000, 10, 5);
        assert_eq!(split.platform_fee, 100);
        assert_eq!(split.organizer_fee, 50);
        assert_eq!(split.prize_pool_contribution, 850);
    }

    #[test]
    fn test_fee_split_floors() {
        let split = fee_split(99, 10, 5);
        assert_eq!(split.platform_fee, 9);
        assert_eq!(split.organizer_fee, 4);
        assert_eq!(split.prize_pool_contribution, 86);
    }
}
