//! Match storage with SQLite backend
//!
//! Each transition runs inside a `BEGIN IMMEDIATE` transaction and re-checks
//! the current status before writing, so concurrent commands on one match
//! serialize at the store and illegal transitions fail with the state they
//! actually observed.

use crate::errors::{DomainError, DomainResult};
use crate::models::{Match, MatchStatus};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::collections::HashMap;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Match store with SQLite backend
pub struct MatchStore {
    db_path: String,
}

impl MatchStore {
    /// Create the store and install the schema.
    pub fn new(db_path: &str) -> DomainResult<Self> {
        let store = Self {
            db_path: db_path.to_string(),
        };
        store.init_db()?;
        Ok(store)
    }

    fn open(&self) -> DomainResult<Connection> {
        let conn = Connection::open(&self.db_path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Ok(conn)
    }

    fn init_db(&self) -> DomainResult<()> {
        let conn = self.open()?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS matches (
                id TEXT PRIMARY KEY,
                competition_id TEXT NOT NULL,
                organizer_id TEXT NOT NULL,
                participants TEXT NOT NULL,
                scores TEXT NOT NULL DEFAULT '{}',
                status TEXT NOT NULL DEFAULT 'upcoming',
                winner TEXT,
                started_at TEXT,
                ended_at TEXT,
                scheduled_at TEXT,
                channel_id TEXT NOT NULL UNIQUE,
                prize_pool INTEGER NOT NULL DEFAULT 0,
                prize_template TEXT NOT NULL DEFAULT 'top3',
                match_number INTEGER NOT NULL DEFAULT 1,
                game_mode TEXT NOT NULL DEFAULT '',
                total_distributed INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_matches_competition_status
             ON matches(competition_id, status)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_matches_status_scheduled
             ON matches(status, scheduled_at)",
            [],
        )?;

        Ok(())
    }

    pub fn insert(&self, m: &Match) -> DomainResult<()> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO matches
                (id, competition_id, organizer_id, participants, scores, status, winner,
                 started_at, ended_at, scheduled_at, channel_id, prize_pool, prize_template,
                 match_number, game_mode, total_distributed, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
            params![
                m.id.to_string(),
                m.competition_id.to_string(),
                m.organizer_id.to_string(),
                serde_json::to_string(&m.participants)?,
                serde_json::to_string(&m.scores)?,
                m.status.as_str(),
                m.winner.map(|w| w.to_string()),
                m.started_at.map(|t| t.to_rfc3339()),
                m.ended_at.map(|t| t.to_rfc3339()),
                m.scheduled_at.map(|t| t.to_rfc3339()),
                m.channel_id,
                m.prize_pool as i64,
                m.prize_template,
                m.match_number,
                m.game_mode,
                m.total_distributed as i64,
                m.created_at.to_rfc3339(),
                m.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get(&self, id: Uuid) -> DomainResult<Match> {
        let conn = self.open()?;
        read_match(&conn, id)
    }

    pub fn list_by_competition(&self, competition_id: Uuid) -> DomainResult<Vec<Match>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM matches WHERE competition_id = ?1
             ORDER BY match_number ASC, created_at DESC",
            MATCH_COLUMNS
        ))?;
        let rows = stmt
            .query_map(params![competition_id.to_string()], row_to_match)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn list_for_player(&self, user_id: Uuid) -> DomainResult<Vec<Match>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM matches WHERE participants LIKE ?1 ORDER BY created_at DESC",
            MATCH_COLUMNS
        ))?;
        let pattern = format!("%\"{}\"%", user_id);
        let rows = stmt
            .query_map(params![pattern], row_to_match)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// upcoming -> ongoing. Fails `InvalidTransition` from any other state.
    pub fn start(&self, id: Uuid, now: DateTime<Utc>) -> DomainResult<Match> {
        let mut conn = self.open()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let m = read_match(&tx, id)?;
        if m.status != MatchStatus::Upcoming {
            return Err(DomainError::InvalidTransition {
                from: m.status,
                action: "start",
            });
        }

        let changed = tx.execute(
            "UPDATE matches SET status = 'ongoing', started_at = ?1, updated_at = ?1
             WHERE id = ?2 AND status = 'upcoming'",
            params![now.to_rfc3339(), id.to_string()],
        )?;
        if changed == 0 {
            return Err(DomainError::PersistenceConflict);
        }

        let updated = read_match(&tx, id)?;
        tx.commit()?;
        info!(match_id = %id, "🚀 Match started");
        Ok(updated)
    }

    /// upcoming -> cancelled, the only other terminal branch. An ongoing
    /// match cannot cancel; it must complete.
    pub fn cancel(&self, id: Uuid, now: DateTime<Utc>) -> DomainResult<Match> {
        let mut conn = self.open()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let m = read_match(&tx, id)?;
        if m.status != MatchStatus::Upcoming {
            return Err(DomainError::InvalidTransition {
                from: m.status,
                action: "cancel",
            });
        }

        tx.execute(
            "UPDATE matches SET status = 'cancelled', updated_at = ?1
             WHERE id = ?2 AND status = 'upcoming'",
            params![now.to_rfc3339(), id.to_string()],
        )?;

        let updated = read_match(&tx, id)?;
        tx.commit()?;
        Ok(updated)
    }

    /// Overwrite one participant's score. Only while ongoing; the participant
    /// must be a member, which keeps score-map keys a subset of participants.
    pub fn update_score(
        &self,
        id: Uuid,
        participant_id: Uuid,
        score: u64,
        now: DateTime<Utc>,
    ) -> DomainResult<Match> {
        let mut conn = self.open()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut m = read_match(&tx, id)?;
        if m.status != MatchStatus::Ongoing {
            return Err(DomainError::NotOngoing { status: m.status });
        }
        if !m.is_participant(&participant_id) {
            return Err(DomainError::UnknownParticipant { participant_id });
        }

        m.scores.insert(participant_id, score);
        let changed = tx.execute(
            "UPDATE matches SET scores = ?1, updated_at = ?2
             WHERE id = ?3 AND status = 'ongoing'",
            params![
                serde_json::to_string(&m.scores)?,
                now.to_rfc3339(),
                id.to_string()
            ],
        )?;
        if changed == 0 {
            return Err(DomainError::PersistenceConflict);
        }

        m.updated_at = now;
        tx.commit()?;
        Ok(m)
    }

    /// ongoing -> completed. Winner is the rank-1 leaderboard entry at the
    /// moment of completion, ties broken by registration order.
    pub fn end(&self, id: Uuid, now: DateTime<Utc>) -> DomainResult<Match> {
        let mut conn = self.open()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let m = read_match(&tx, id)?;
        if m.status != MatchStatus::Ongoing {
            return Err(DomainError::NotOngoing { status: m.status });
        }

        let winner = m.winner_by_score();
        let changed = tx.execute(
            "UPDATE matches SET status = 'completed', ended_at = ?1, updated_at = ?1, winner = ?2
             WHERE id = ?3 AND status = 'ongoing'",
            params![
                now.to_rfc3339(),
                winner.map(|w| w.to_string()),
                id.to_string()
            ],
        )?;
        if changed == 0 {
            return Err(DomainError::PersistenceConflict);
        }

        let updated = read_match(&tx, id)?;
        tx.commit()?;
        info!(match_id = %id, winner = ?winner, "🏁 Match completed");
        Ok(updated)
    }

    /// Delete is permitted only while upcoming.
    pub fn delete(&self, id: Uuid) -> DomainResult<()> {
        let mut conn = self.open()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let m = read_match(&tx, id)?;
        if m.status != MatchStatus::Upcoming {
            return Err(DomainError::Immutable { status: m.status });
        }

        tx.execute("DELETE FROM matches WHERE id = ?1", params![id.to_string()])?;
        tx.commit()?;
        info!(match_id = %id, "🗑️  Match deleted");
        Ok(())
    }

    /// Upcoming matches whose scheduled start has passed, for the promotion
    /// sweep.
    pub fn due_upcoming(&self, now: DateTime<Utc>) -> DomainResult<Vec<Uuid>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT id FROM matches
             WHERE status = 'upcoming' AND scheduled_at IS NOT NULL AND scheduled_at <= ?1",
        )?;
        let ids = stmt
            .query_map(params![now.to_rfc3339()], |row| {
                let id: String = row.get(0)?;
                Ok(id)
            })?
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .filter_map(|s| Uuid::parse_str(&s).ok())
            .collect();
        Ok(ids)
    }

    /// Record the settled total on a completed match. Informational; the
    /// ledger's idempotency keys are what make settlement re-invocable.
    pub fn record_settlement(&self, id: Uuid, total_distributed: u64) -> DomainResult<()> {
        let conn = self.open()?;
        conn.execute(
            "UPDATE matches SET total_distributed = ?1, updated_at = ?2
             WHERE id = ?3 AND status = 'completed'",
            params![
                total_distributed as i64,
                Utc::now().to_rfc3339(),
                id.to_string()
            ],
        )?;
        Ok(())
    }
}

const MATCH_COLUMNS: &str = "id, competition_id, organizer_id, participants, scores, status, \
     winner, started_at, ended_at, scheduled_at, channel_id, prize_pool, prize_template, \
     match_number, game_mode, total_distributed, created_at, updated_at";

fn read_match(conn: &Connection, id: Uuid) -> DomainResult<Match> {
    let row = conn
        .query_row(
            &format!("SELECT {} FROM matches WHERE id = ?1", MATCH_COLUMNS),
            params![id.to_string()],
            row_to_match,
        )
        .optional()?;

    row.ok_or(DomainError::NotFound {
        entity: "match",
        id: id.to_string(),
    })
}

fn row_to_match(row: &rusqlite::Row<'_>) -> rusqlite::Result<Match> {
    let bad = |idx: usize, what: &str| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            format!("bad {}", what).into(),
        )
    };
    let parse_ts = |idx: usize, s: Option<String>| -> rusqlite::Result<Option<DateTime<Utc>>> {
        s.map(|s| {
            DateTime::parse_from_rfc3339(&s)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|_| bad(idx, "timestamp"))
        })
        .transpose()
    };

    let id: String = row.get(0)?;
    let competition_id: String = row.get(1)?;
    let organizer_id: String = row.get(2)?;
    let participants: String = row.get(3)?;
    let scores: String = row.get(4)?;
    let status: String = row.get(5)?;
    let winner: Option<String> = row.get(6)?;
    let prize_pool: i64 = row.get(11)?;
    let total_distributed: i64 = row.get(15)?;
    let created_at: String = row.get(16)?;
    let updated_at: String = row.get(17)?;

    let participants: Vec<Uuid> =
        serde_json::from_str(&participants).map_err(|_| bad(3, "participants"))?;
    let scores: HashMap<Uuid, u64> =
        serde_json::from_str(&scores).map_err(|_| bad(4, "scores"))?;

    Ok(Match {
        id: Uuid::parse_str(&id).map_err(|_| bad(0, "uuid"))?,
        competition_id: Uuid::parse_str(&competition_id).map_err(|_| bad(1, "uuid"))?,
        organizer_id: Uuid::parse_str(&organizer_id).map_err(|_| bad(2, "uuid"))?,
        participants,
        scores,
        status: MatchStatus::from_str(&status).ok_or_else(|| bad(5, "status"))?,
        winner: winner
            .map(|w| Uuid::parse_str(&w).map_err(|_| bad(6, "uuid")))
            .transpose()?,
        started_at: parse_ts(7, row.get(7)?)?,
        ended_at: parse_ts(8, row.get(8)?)?,
        scheduled_at: parse_ts(9, row.get(9)?)?,
        channel_id: row.get(10)?,
        prize_pool: prize_pool as u64,
        prize_template: row.get(12)?,
        match_number: row.get(13)?,
        game_mode: row.get(14)?,
        total_distributed: total_distributed as u64,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map_err(|_| bad(16, "timestamp"))?
            .with_timezone(&Utc),
        updated_at: DateTime::parse_from_rfc3339(&updated_at)
            .map_err(|_| bad(17, "timestamp"))?
            .with_timezone(&Utc),
    })
}
