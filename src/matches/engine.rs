//! Match Engine
//!
//! Command surface over the match store: organizer authorization, the actual
//! transitions, and typed domain-event emission. Events go onto a broadcast
//! channel; the room router is just a subscriber, so state logic stays
//! independent of the transport.

use crate::errors::{DomainError, DomainResult};
use crate::matches::MatchStore;
use crate::models::{channel_id_for, LeaderboardEntry, Match, MatchEvent, MatchStatus};
use crate::settlement::{SettlementEngine, SettlementReport};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, warn};
use uuid::Uuid;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Parameters for `create_match`.
#[derive(Debug, Clone)]
pub struct NewMatch {
    pub competition_id: Uuid,
    pub organizer_id: Uuid,
    pub participants: Vec<Uuid>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub prize_pool: u64,
    pub prize_template: String,
    pub match_number: u32,
    pub game_mode: String,
}

pub struct MatchEngine {
    store: Arc<MatchStore>,
    settlement: Arc<SettlementEngine>,
    events: broadcast::Sender<MatchEvent>,
}

impl MatchEngine {
    pub fn new(store: Arc<MatchStore>, settlement: Arc<SettlementEngine>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            store,
            settlement,
            events,
        }
    }

    /// Subscribe to the domain-event stream (used by the room dispatcher).
    pub fn subscribe_events(&self) -> broadcast::Receiver<MatchEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: MatchEvent) {
        // No subscribers is fine; events are fan-out, not commands.
        let _ = self.events.send(event);
    }

    /// Create a match in the upcoming state. The channel id is assigned here,
    /// once, derived from the match id.
    pub fn create_match(&self, new: NewMatch) -> DomainResult<Match> {
        // Registration order matters for tie-breaks; drop duplicates, keep
        // first occurrence.
        let mut participants = Vec::with_capacity(new.participants.len());
        for p in new.participants {
            if !participants.contains(&p) {
                participants.push(p);
            }
        }

        let id = Uuid::new_v4();
        let now = Utc::now();
        let m = Match {
            id,
            competition_id: new.competition_id,
            organizer_id: new.organizer_id,
            participants,
            scores: HashMap::new(),
            status: MatchStatus::Upcoming,
            winner: None,
            started_at: None,
            ended_at: None,
            scheduled_at: new.scheduled_at,
            channel_id: channel_id_for(id),
            prize_pool: new.prize_pool,
            prize_template: new.prize_template,
            match_number: new.match_number,
            game_mode: new.game_mode,
            total_distributed: 0,
            created_at: now,
            updated_at: now,
        };
        self.store.insert(&m)?;
        Ok(m)
    }

    fn authorize_organizer(&self, m: &Match, caller: Uuid) -> DomainResult<()> {
        if m.organizer_id != caller {
            return Err(DomainError::Forbidden {
                reason: "only the match organizer may issue this command",
            });
        }
        Ok(())
    }

    pub fn start_match(&self, match_id: Uuid, caller: Uuid) -> DomainResult<Match> {
        let m = self.store.get(match_id)?;
        self.authorize_organizer(&m, caller)?;

        let started = self.store.start(match_id, Utc::now())?;
        if let Some(started_at) = started.started_at {
            self.emit(MatchEvent::MatchStarted {
                match_id,
                started_at,
            });
        }
        Ok(started)
    }

    pub fn update_score(
        &self,
        match_id: Uuid,
        caller: Uuid,
        participant_id: Uuid,
        score: u64,
    ) -> DomainResult<Match> {
        let m = self.store.get(match_id)?;
        self.authorize_organizer(&m, caller)?;

        let updated = self
            .store
            .update_score(match_id, participant_id, score, Utc::now())?;
        self.emit(MatchEvent::ScoreUpdated {
            match_id,
            participant_id,
            score,
            leaderboard: updated.leaderboard(),
        });
        Ok(updated)
    }

    /// Complete the match, then settle. Settlement is a decoupled side
    /// effect: its failure is logged and left for a manual `settle_match`
    /// re-trigger, never rolling back completion.
    pub fn end_match(
        &self,
        match_id: Uuid,
        caller: Uuid,
    ) -> DomainResult<(Match, Option<SettlementReport>)> {
        let m = self.store.get(match_id)?;
        self.authorize_organizer(&m, caller)?;

        let ended = self.store.end(match_id, Utc::now())?;

        let report = if ended.prize_pool > 0 {
            match self.settlement.settle(match_id) {
                Ok(report) => {
                    if !report.fully_settled() {
                        warn!(
                            match_id = %match_id,
                            failed = report.failed,
                            "match completed with partially failed settlement"
                        );
                    }
                    Some(report)
                }
                Err(e) => {
                    error!(
                        match_id = %match_id,
                        "settlement failed after completion, re-trigger manually: {}",
                        e
                    );
                    None
                }
            }
        } else {
            None
        };

        let total_distributed = report.as_ref().map(|r| r.total_distributed).unwrap_or(0);
        if let Some(ended_at) = ended.ended_at {
            self.emit(MatchEvent::MatchEnded {
                match_id,
                ended_at,
                winner: ended.winner,
                leaderboard: ended.leaderboard(),
                total_distributed,
            });
        }

        Ok((ended, report))
    }

    pub fn cancel_match(&self, match_id: Uuid, caller: Uuid) -> DomainResult<Match> {
        let m = self.store.get(match_id)?;
        self.authorize_organizer(&m, caller)?;
        self.store.cancel(match_id, Utc::now())
    }

    pub fn delete_match(&self, match_id: Uuid, caller: Uuid) -> DomainResult<()> {
        let m = self.store.get(match_id)?;
        self.authorize_organizer(&m, caller)?;
        self.store.delete(match_id)
    }

    /// Idempotent settlement re-trigger for a completed match.
    pub fn settle_match(&self, match_id: Uuid) -> DomainResult<SettlementReport> {
        self.settlement.settle(match_id)
    }

    pub fn get_match(&self, match_id: Uuid) -> DomainResult<Match> {
        self.store.get(match_id)
    }

    pub fn get_leaderboard(&self, match_id: Uuid) -> DomainResult<Vec<LeaderboardEntry>> {
        Ok(self.store.get(match_id)?.leaderboard())
    }

    pub fn list_by_competition(&self, competition_id: Uuid) -> DomainResult<Vec<Match>> {
        self.store.list_by_competition(competition_id)
    }

    pub fn list_for_player(&self, user_id: Uuid) -> DomainResult<Vec<Match>> {
        self.store.list_for_player(user_id)
    }

    /// Promote upcoming matches whose scheduled start has passed, through the
    /// same transition rules as an organizer `start`. Returns the promoted
    /// ids. Invoked by the scheduled sweep, never implicitly on save.
    pub fn promote_due(&self, now: DateTime<Utc>) -> DomainResult<Vec<Uuid>> {
        let due = self.store.due_upcoming(now)?;
        let mut promoted = Vec::with_capacity(due.len());

        for id in due {
            match self.store.start(id, now) {
                Ok(started) => {
                    if let Some(started_at) = started.started_at {
                        self.emit(MatchEvent::MatchStarted {
                            match_id: id,
                            started_at,
                        });
                    }
                    promoted.push(id);
                }
                // Lost a race with an explicit start; nothing to do.
                Err(DomainError::InvalidTransition { .. }) => {}
                Err(e) => {
                    warn!(match_id = %id, "promotion sweep failed for match: {}", e);
                }
            }
        }

        Ok(promoted)
    }
}
