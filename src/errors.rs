//! Domain Error Taxonomy
//!
//! Caller-input errors (invalid transition, unknown participant, insufficient
//! funds) surface verbatim to the organizer and are never retried. Transient
//! persistence conflicts are safe to retry with the same idempotency key.

use crate::models::MatchStatus;
use std::fmt;
use uuid::Uuid;

#[derive(Debug)]
pub enum DomainError {
    /// The requested transition is not legal from the match's current state.
    InvalidTransition {
        from: MatchStatus,
        action: &'static str,
    },
    /// Operation requires an ongoing match.
    NotOngoing { status: MatchStatus },
    /// Score update for a user who is not in the participant set.
    UnknownParticipant { participant_id: Uuid },
    /// Mutation attempted on a match that left the upcoming state.
    Immutable { status: MatchStatus },
    /// Debit would drive the balance negative. Never clamped.
    InsufficientFunds { balance: u64, requested: u64 },
    /// Entity lookup failed.
    NotFound { entity: &'static str, id: String },
    /// Command issued by someone other than the match organizer.
    Forbidden { reason: &'static str },
    /// Prize template failed validation at registration.
    InvalidTemplate { reason: String },
    /// Transient storage contention; the whole command is safe to retry.
    PersistenceConflict,
    /// Non-transient storage or serialization failure.
    Storage(anyhow::Error),
}

impl fmt::Display for DomainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DomainError::InvalidTransition { from, action } => {
                write!(f, "invalid transition: cannot {} a {} match", action, from.as_str())
            }
            DomainError::NotOngoing { status } => {
                write!(f, "match is not ongoing (status: {})", status.as_str())
            }
            DomainError::UnknownParticipant { participant_id } => {
                write!(f, "user {} is not a participant of this match", participant_id)
            }
            DomainError::Immutable { status } => {
                write!(f, "match is {} and can no longer be modified", status.as_str())
            }
            DomainError::InsufficientFunds { balance, requested } => {
                write!(f, "insufficient wallet balance: have {}, need {}", balance, requested)
            }
            DomainError::NotFound { entity, id } => write!(f, "{} {} not found", entity, id),
            DomainError::Forbidden { reason } => write!(f, "forbidden: {}", reason),
            DomainError::InvalidTemplate { reason } => {
                write!(f, "invalid prize template: {}", reason)
            }
            DomainError::PersistenceConflict => {
                write!(f, "storage conflict, retry the command")
            }
            DomainError::Storage(e) => write!(f, "storage error: {}", e),
        }
    }
}

impl std::error::Error for DomainError {}

impl From<rusqlite::Error> for DomainError {
    fn from(err: rusqlite::Error) -> Self {
        // Busy/locked means another writer holds the database; the command is
        // retry-safe because every mutation is idempotent or atomically checked.
        if let rusqlite::Error::SqliteFailure(e, _) = &err {
            if matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ) {
                return DomainError::PersistenceConflict;
            }
        }
        DomainError::Storage(err.into())
    }
}

impl From<serde_json::Error> for DomainError {
    fn from(err: serde_json::Error) -> Self {
        DomainError::Storage(err.into())
    }
}

pub type DomainResult<T> = Result<T, DomainError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        let e = DomainError::NotOngoing {
            status: MatchStatus::Completed,
        };
        assert!(e.to_string().contains("completed"));

        let e = DomainError::InsufficientFunds {
            balance: 100,
            requested: 150,
        };
        assert!(e.to_string().contains("100"));
        assert!(e.to_string().contains("150"));
    }

    #[test]
    fn test_busy_maps_to_persistence_conflict() {
        let err = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        );
        assert!(matches!(
            DomainError::from(err),
            DomainError::PersistenceConflict
        ));
    }
}
