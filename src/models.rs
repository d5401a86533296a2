use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Match lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStatus {
    Upcoming,
    Ongoing,
    Completed,
    Cancelled,
}

impl MatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchStatus::Upcoming => "upcoming",
            MatchStatus::Ongoing => "ongoing",
            MatchStatus::Completed => "completed",
            MatchStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "upcoming" => Some(MatchStatus::Upcoming),
            "ongoing" => Some(MatchStatus::Ongoing),
            "completed" => Some(MatchStatus::Completed),
            "cancelled" => Some(MatchStatus::Cancelled),
            _ => None,
        }
    }

    /// Terminal states accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, MatchStatus::Completed | MatchStatus::Cancelled)
    }
}

/// A single scored contest within a competition.
///
/// `participants` is ordered by registration; that order is the tie-break for
/// leaderboard ranks and winner selection. `scores` keys are always a subset
/// of `participants` (enforced at the store).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Match {
    pub id: Uuid,
    pub competition_id: Uuid,
    pub organizer_id: Uuid,
    pub participants: Vec<Uuid>,
    pub scores: HashMap<Uuid, u64>,
    pub status: MatchStatus,
    pub winner: Option<Uuid>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub channel_id: String,
    pub prize_pool: u64,
    pub prize_template: String,
    pub match_number: u32,
    pub game_mode: String,
    pub total_distributed: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Match {
    /// Current ranking, recomputed on every call, never cached.
    ///
    /// All participants appear, unscored ones at 0. Sort is score descending
    /// with a stable tie-break on registration order.
    pub fn leaderboard(&self) -> Vec<LeaderboardEntry> {
        let mut entries: Vec<LeaderboardEntry> = self
            .participants
            .iter()
            .map(|p| LeaderboardEntry {
                participant_id: *p,
                score: self.scores.get(p).copied().unwrap_or(0),
                rank: 0,
            })
            .collect();

        // Stable sort keeps registration order among equal scores.
        entries.sort_by(|a, b| b.score.cmp(&a.score));

        for (i, entry) in entries.iter_mut().enumerate() {
            entry.rank = (i + 1) as u32;
        }

        entries
    }

    /// Rank-1 participant, ties broken by registration order.
    pub fn winner_by_score(&self) -> Option<Uuid> {
        self.leaderboard().first().map(|e| e.participant_id)
    }

    pub fn is_participant(&self, user_id: &Uuid) -> bool {
        self.participants.contains(user_id)
    }
}

/// One row of a match leaderboard. Derived on demand, never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderboardEntry {
    pub participant_id: Uuid,
    pub score: u64,
    pub rank: u32,
}

/// Namespace for deriving room channel ids from match ids.
const CHANNEL_NAMESPACE: Uuid = Uuid::from_bytes([
    0x8f, 0x2a, 0x11, 0xd4, 0x5c, 0x3e, 0x4b, 0x9a, 0x8d, 0x17, 0x6f, 0x02, 0xe4, 0x9b, 0x31,
    0x7c,
]);

/// Channel id for a match room. Deterministic: the same match always maps to
/// the same channel, so reconnecting viewers land in the same room.
pub fn channel_id_for(match_id: Uuid) -> String {
    format!(
        "match_{}",
        Uuid::new_v5(&CHANNEL_NAMESPACE, match_id.as_bytes())
    )
}

/// Transaction types in the wallet journal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TransactionType {
    Credit,
    Debit,
    Reward,
    EntryFee,
    Payout,
    Refund,
    Topup,
    OrganizerFee,
    PlatformFee,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Credit => "credit",
            TransactionType::Debit => "debit",
            TransactionType::Reward => "reward",
            TransactionType::EntryFee => "entryFee",
            TransactionType::Payout => "payout",
            TransactionType::Refund => "refund",
            TransactionType::Topup => "topup",
            TransactionType::OrganizerFee => "organizerFee",
            TransactionType::PlatformFee => "platformFee",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "credit" => Some(TransactionType::Credit),
            "debit" => Some(TransactionType::Debit),
            "reward" => Some(TransactionType::Reward),
            "entryFee" => Some(TransactionType::EntryFee),
            "payout" => Some(TransactionType::Payout),
            "refund" => Some(TransactionType::Refund),
            "topup" => Some(TransactionType::Topup),
            "organizerFee" => Some(TransactionType::OrganizerFee),
            "platformFee" => Some(TransactionType::PlatformFee),
            _ => None,
        }
    }

    /// Whether this type increases the wallet balance. Everything else is a
    /// deduction. The journal stores amounts unsigned; direction comes from
    /// the type.
    pub fn is_credit(&self) -> bool {
        matches!(
            self,
            TransactionType::Credit
                | TransactionType::Reward
                | TransactionType::Refund
                | TransactionType::Topup
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Completed,
    Failed,
    Cancelled,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Completed => "completed",
            TransactionStatus::Failed => "failed",
            TransactionStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TransactionStatus::Pending),
            "completed" => Some(TransactionStatus::Completed),
            "failed" => Some(TransactionStatus::Failed),
            "cancelled" => Some(TransactionStatus::Cancelled),
            _ => None,
        }
    }
}

/// A wallet journal entry. Append-only: after creation only status and
/// balance_after may change, via the single pending -> completed|failed
/// transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: Uuid,
    pub user_id: Uuid,
    pub tx_type: TransactionType,
    pub amount: u64,
    pub currency: String,
    pub source: String,
    pub description: String,
    pub status: TransactionStatus,
    pub idempotency_key: Option<String>,
    pub balance_after: u64,
    pub created_at: DateTime<Utc>,
}

impl Transaction {
    /// Signed contribution to the wallet balance, zero unless completed.
    pub fn signed_delta(&self) -> i64 {
        if self.status != TransactionStatus::Completed {
            return 0;
        }
        if self.tx_type.is_credit() {
            self.amount as i64
        } else {
            -(self.amount as i64)
        }
    }
}

/// Read-only wallet projection: balance plus the recent journal tail.
#[derive(Debug, Clone, Serialize)]
pub struct WalletView {
    pub user_id: Uuid,
    pub balance: u64,
    pub currency: String,
    pub total_earnings: u64,
    pub recent_transactions: Vec<Transaction>,
}

/// A single prize computed from the final leaderboard and a distribution
/// template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrizeAward {
    pub participant_id: Uuid,
    pub rank: u32,
    pub percentage: u32,
    pub amount: u64,
}

/// Domain events emitted by the match engine and fanned out per room.
///
/// Serialized form is what viewers receive over the WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum MatchEvent {
    MatchStarted {
        match_id: Uuid,
        started_at: DateTime<Utc>,
    },
    ScoreUpdated {
        match_id: Uuid,
        participant_id: Uuid,
        score: u64,
        leaderboard: Vec<LeaderboardEntry>,
    },
    MatchEnded {
        match_id: Uuid,
        ended_at: DateTime<Utc>,
        winner: Option<Uuid>,
        leaderboard: Vec<LeaderboardEntry>,
        total_distributed: u64,
    },
    ViewerJoined {
        match_id: Uuid,
        viewer_id: Uuid,
        count: usize,
    },
    ViewerLeft {
        match_id: Uuid,
        viewer_id: Uuid,
        count: usize,
    },
    RoomClosing {
        match_id: Uuid,
        close_in_secs: u64,
    },
}

impl MatchEvent {
    pub fn match_id(&self) -> Uuid {
        match self {
            MatchEvent::MatchStarted { match_id, .. }
            | MatchEvent::ScoreUpdated { match_id, .. }
            | MatchEvent::MatchEnded { match_id, .. }
            | MatchEvent::ViewerJoined { match_id, .. }
            | MatchEvent::ViewerLeft { match_id, .. }
            | MatchEvent::RoomClosing { match_id, .. } => *match_id,
        }
    }
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    pub port: u16,
    pub jwt_secret: String,
    pub room_close_grace_secs: u64,
    pub room_close_warning_secs: u64,
    pub sweep_interval_secs: u64,
    pub platform_fee_percentage: u32,
    pub organizer_fee_percentage: u32,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let database_path =
            std::env::var("DATABASE_PATH").unwrap_or_else(|_| "./arena.db".to_string());

        let port = std::env::var("PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse()
            .unwrap_or(8080);

        let jwt_secret = std::env::var("JWT_SECRET")
            .unwrap_or_else(|_| "dev-secret-change-in-production".to_string());

        let room_close_grace_secs = std::env::var("ROOM_CLOSE_GRACE_SECS")
            .unwrap_or_else(|_| "30".to_string())
            .parse()
            .unwrap_or(30);

        let room_close_warning_secs = std::env::var("ROOM_CLOSE_WARNING_SECS")
            .unwrap_or_else(|_| "10".to_string())
            .parse()
            .unwrap_or(10);

        let sweep_interval_secs = std::env::var("SWEEP_INTERVAL_SECS")
            .unwrap_or_else(|_| "15".to_string())
            .parse()
            .unwrap_or(15);

        let platform_fee_percentage = std::env::var("PLATFORM_FEE_PERCENTAGE")
            .unwrap_or_else(|_| "10".to_string())
            .parse()
            .unwrap_or(10);

        let organizer_fee_percentage = std::env::var("ORGANIZER_FEE_PERCENTAGE")
            .unwrap_or_else(|_| "5".to_string())
            .parse()
            .unwrap_or(5);

        Ok(Self {
            database_path,
            port,
            jwt_secret,
            room_close_grace_secs,
            room_close_warning_secs,
            sweep_interval_secs,
            platform_fee_percentage,
            organizer_fee_percentage,
        })
    }
}
