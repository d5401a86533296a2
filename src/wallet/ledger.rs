//! Ledger storage with SQLite backend
//!
//! Every balance mutation runs as one `BEGIN IMMEDIATE` transaction: balance
//! read, journal insert, and balance write commit together or not at all.
//! SQLite is the serialization point for concurrent writers; connections are
//! opened per operation and wait on the busy handler rather than holding an
//! in-process lock around domain logic.

use crate::errors::{DomainError, DomainResult};
use crate::models::{Transaction, TransactionStatus, TransactionType, WalletView};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

const DEFAULT_CURRENCY: &str = "INR";
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Result of a credit or debit call.
///
/// `duplicate` is true when the supplied idempotency key matched an existing
/// journal entry; the prior transaction is returned and nothing was mutated.
#[derive(Debug, Clone)]
pub struct LedgerOutcome {
    pub transaction: Transaction,
    pub balance: u64,
    pub duplicate: bool,
}

/// Journal query filters for `get_transactions`.
#[derive(Debug, Clone, Default)]
pub struct TransactionFilter {
    pub tx_type: Option<TransactionType>,
    pub status: Option<TransactionStatus>,
    pub source: Option<String>,
    pub limit: Option<u32>,
}

/// Balance-vs-journal audit result.
#[derive(Debug, Clone, Copy)]
pub struct BalanceAudit {
    pub balance: i64,
    pub journal_sum: i64,
}

impl BalanceAudit {
    pub fn consistent(&self) -> bool {
        self.balance == self.journal_sum
    }
}

/// Wallet ledger with SQLite backend
pub struct WalletLedger {
    db_path: String,
}

impl WalletLedger {
    /// Create the ledger and install the schema.
    pub fn new(db_path: &str) -> DomainResult<Self> {
        let ledger = Self {
            db_path: db_path.to_string(),
        };
        ledger.init_db()?;
        Ok(ledger)
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
            "CREATE TABLE IF NOT EXISTS wallets (
                user_id TEXT PRIMARY KEY,
                balance INTEGER NOT NULL DEFAULT 0 CHECK (balance >= 0),
                currency TEXT NOT NULL DEFAULT 'INR',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS transactions (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                tx_type TEXT NOT NULL,
                amount INTEGER NOT NULL CHECK (amount > 0),
                currency TEXT NOT NULL,
                source TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                status TEXT NOT NULL,
                idempotency_key TEXT UNIQUE,
                balance_after INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_transactions_user_created
             ON transactions(user_id, created_at DESC)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_transactions_source ON transactions(source)",
            [],
        )?;

        Ok(())
    }

    /// Credit a wallet (add funds). Atomic and idempotent.
    pub fn credit(
        &self,
        user_id: Uuid,
        amount: u64,
        tx_type: TransactionType,
        source: &str,
        description: &str,
        idempotency_key: Option<&str>,
    ) -> DomainResult<LedgerOutcome> {
        self.apply(user_id, amount, tx_type, source, description, idempotency_key, true)
    }

    /// Debit a wallet (deduct funds). Atomic and idempotent; fails
    /// `InsufficientFunds` inside the same transaction that would move the
    /// balance, so two racing debits can never overdraw.
    pub fn debit(
        &self,
        user_id: Uuid,
        amount: u64,
        tx_type: TransactionType,
        source: &str,
        description: &str,
        idempotency_key: Option<&str>,
    ) -> DomainResult<LedgerOutcome> {
        self.apply(user_id, amount, tx_type, source, description, idempotency_key, false)
    }

    #[allow(clippy::too_many_arguments)]
    fn apply(
        &self,
        user_id: Uuid,
        amount: u64,
        tx_type: TransactionType,
        source: &str,
        description: &str,
        idempotency_key: Option<&str>,
        is_credit: bool,
    ) -> DomainResult<LedgerOutcome> {
        if amount == 0 {
            return Err(DomainError::Storage(anyhow::anyhow!(
                "transaction amount must be positive"
            )));
        }

        let mut conn = self.open()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        // Idempotency: a repeated request has no effect beyond the first.
        if let Some(key) = idempotency_key {
            if let Some(existing) = find_by_idempotency_key(&tx, key)? {
                debug!(key, "ledger: idempotency key already used, returning prior result");
                let balance = wallet_balance(&tx, user_id)?.unwrap_or(0);
                return Ok(LedgerOutcome {
                    transaction: existing,
                    balance: balance as u64,
                    duplicate: true,
                });
            }
        }

        let now = Utc::now();
        let now_str = now.to_rfc3339();

        // Wallet rows are created lazily on first financial operation.
        let (balance, currency) = match wallet_row(&tx, user_id)? {
            Some(row) => row,
            None => {
                tx.execute(
                    "INSERT INTO wallets (user_id, balance, currency, created_at, updated_at)
                     VALUES (?1, 0, ?2, ?3, ?3)",
                    params![user_id.to_string(), DEFAULT_CURRENCY, &now_str],
                )?;
                (0, DEFAULT_CURRENCY.to_string())
            }
        };

        let new_balance = if is_credit {
            balance + amount as i64
        } else {
            if balance < amount as i64 {
                return Err(DomainError::InsufficientFunds {
                    balance: balance as u64,
                    requested: amount,
                });
            }
            balance - amount as i64
        };

        let record = Transaction {
            id: Uuid::new_v4(),
            user_id,
            tx_type,
            amount,
            currency: currency.clone(),
            source: source.to_string(),
            description: description.to_string(),
            status: TransactionStatus::Completed,
            idempotency_key: idempotency_key.map(|k| k.to_string()),
            balance_after: new_balance as u64,
            created_at: now,
        };

        tx.execute(
            "INSERT INTO transactions
                (id, user_id, tx_type, amount, currency, source, description, status,
                 idempotency_key, balance_after, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                record.id.to_string(),
                user_id.to_string(),
                tx_type.as_str(),
                amount as i64,
                currency,
                source,
                description,
                record.status.as_str(),
                record.idempotency_key,
                new_balance,
                &now_str,
            ],
        )?;

        tx.execute(
            "UPDATE wallets SET balance = ?1, updated_at = ?2 WHERE user_id = ?3",
            params![new_balance, &now_str, user_id.to_string()],
        )?;

        tx.commit()?;

        info!(
            user = %user_id,
            amount,
            tx_type = tx_type.as_str(),
            balance = new_balance,
            "💰 {} wallet",
            if is_credit { "Credited" } else { "Debited" }
        );

        Ok(LedgerOutcome {
            transaction: record,
            balance: new_balance as u64,
            duplicate: false,
        })
    }

    /// Read-only wallet projection: balance, currency, and the recent journal
    /// tail. Users without a wallet yet see a zero balance.
    pub fn get_wallet(&self, user_id: Uuid, limit: u32) -> DomainResult<WalletView> {
        let conn = self.open()?;

        let (balance, currency) =
            wallet_row(&conn, user_id)?.unwrap_or((0, DEFAULT_CURRENCY.to_string()));

        let total_earnings: i64 = conn.query_row(
            "SELECT COALESCE(SUM(amount), 0) FROM transactions
             WHERE user_id = ?1 AND tx_type = 'reward' AND status = 'completed'",
            params![user_id.to_string()],
            |row| row.get(0),
        )?;

        let mut stmt = conn.prepare(
            "SELECT id, user_id, tx_type, amount, currency, source, description, status,
                    idempotency_key, balance_after, created_at
             FROM transactions WHERE user_id = ?1
             ORDER BY created_at DESC, rowid DESC LIMIT ?2",
        )?;
        let recent = stmt
            .query_map(params![user_id.to_string(), limit], row_to_transaction)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(WalletView {
            user_id,
            balance: balance as u64,
            currency,
            total_earnings: total_earnings as u64,
            recent_transactions: recent,
        })
    }

    /// Query the journal with optional type/status/source filters.
    pub fn get_transactions(
        &self,
        user_id: Uuid,
        filter: &TransactionFilter,
    ) -> DomainResult<Vec<Transaction>> {
        let conn = self.open()?;

        let mut sql = String::from(
            "SELECT id, user_id, tx_type, amount, currency, source, description, status,
                    idempotency_key, balance_after, created_at
             FROM transactions WHERE user_id = ?1",
        );
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(user_id.to_string())];

        if let Some(t) = filter.tx_type {
            args.push(Box::new(t.as_str().to_string()));
            sql.push_str(&format!(" AND tx_type = ?{}", args.len()));
        }
        if let Some(s) = filter.status {
            args.push(Box::new(s.as_str().to_string()));
            sql.push_str(&format!(" AND status = ?{}", args.len()));
        }
        if let Some(src) = &filter.source {
            args.push(Box::new(src.clone()));
            sql.push_str(&format!(" AND source = ?{}", args.len()));
        }

        sql.push_str(" ORDER BY created_at DESC, rowid DESC");
        let limit = filter.limit.unwrap_or(50).min(500);
        args.push(Box::new(limit));
        sql.push_str(&format!(" LIMIT ?{}", args.len()));

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(args), row_to_transaction)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(rows)
    }

    /// Audit: the wallet balance must equal the sum of completed signed
    /// deltas in the journal.
    pub fn verify_balance(&self, user_id: Uuid) -> DomainResult<BalanceAudit> {
        let conn = self.open()?;

        let balance = wallet_balance(&conn, user_id)?.unwrap_or(0);

        let journal_sum: i64 = conn.query_row(
            "SELECT COALESCE(SUM(CASE
                 WHEN tx_type IN ('credit', 'reward', 'refund', 'topup') THEN amount
                 ELSE -amount END), 0)
             FROM transactions WHERE user_id = ?1 AND status = 'completed'",
            params![user_id.to_string()],
            |row| row.get(0),
        )?;

        Ok(BalanceAudit {
            balance,
            journal_sum,
        })
    }
}

fn wallet_row(conn: &Connection, user_id: Uuid) -> DomainResult<Option<(i64, String)>> {
    let row = conn
        .query_row(
            "SELECT balance, currency FROM wallets WHERE user_id = ?1",
            params![user_id.to_string()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    Ok(row)
}

fn wallet_balance(conn: &Connection, user_id: Uuid) -> DomainResult<Option<i64>> {
    Ok(wallet_row(conn, user_id)?.map(|(b, _)| b))
}

fn find_by_idempotency_key(conn: &Connection, key: &str) -> DomainResult<Option<Transaction>> {
    let tx = conn
        .query_row(
            "SELECT id, user_id, tx_type, amount, currency, source, description, status,
                    idempotency_key, balance_after, created_at
             FROM transactions WHERE idempotency_key = ?1",
            params![key],
            row_to_transaction,
        )
        .optional()?;
    Ok(tx)
}

fn row_to_transaction(row: &rusqlite::Row<'_>) -> rusqlite::Result<Transaction> {
    let parse_col = |idx: usize, what: &str| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            format!("bad {}", what).into(),
        )
    };

    let id: String = row.get(0)?;
    let user_id: String = row.get(1)?;
    let tx_type: String = row.get(2)?;
    let amount: i64 = row.get(3)?;
    let status: String = row.get(7)?;
    let balance_after: i64 = row.get(9)?;
    let created_at: String = row.get(10)?;

    Ok(Transaction {
        id: Uuid::parse_str(&id).map_err(|_| parse_col(0, "uuid"))?,
        user_id: Uuid::parse_str(&user_id).map_err(|_| parse_col(1, "uuid"))?,
        tx_type: TransactionType::from_str(&tx_type).ok_or_else(|| parse_col(2, "tx_type"))?,
        amount: amount as u64,
        currency: row.get(4)?,
        source: row.get(5)?,
        description: row.get(6)?,
        status: TransactionStatus::from_str(&status).ok_or_else(|| parse_col(7, "status"))?,
        idempotency_key: row.get(8)?,
        balance_after: balance_after as u64,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map_err(|_| parse_col(10, "timestamp"))?
            .with_timezone(&Utc),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::NamedTempFile;

    fn create_test_ledger() -> (WalletLedger, NamedTempFile) {
        let temp_file = NamedTempFile::new().unwrap();
        let db_path = temp_file.path().to_str().unwrap();
        let ledger = WalletLedger::new(db_path).unwrap();
        (ledger, temp_file)
    }

    #[test]
    fn test_credit_creates_wallet_lazily() {
        let (ledger, _temp) = create_test_ledger();
        let user = Uuid::new_v4();

        let out = ledger
            .credit(user, 500, TransactionType::Topup, "topup:t1", "", None)
            .unwrap();

        assert!(!out.duplicate);
        assert_eq!(out.balance, 500);
        assert_eq!(out.transaction.balance_after, 500);
        assert_eq!(out.transaction.status, TransactionStatus::Completed);

        let view = ledger.get_wallet(user, 10).unwrap();
        assert_eq!(view.balance, 500);
        assert_eq!(view.currency, "INR");
        assert_eq!(view.recent_transactions.len(), 1);
    }

    #[test]
    fn test_debit_insufficient_funds_leaves_balance() {
        let (ledger, _temp) = create_test_ledger();
        let user = Uuid::new_v4();

        ledger
            .credit(user, 100, TransactionType::Topup, "topup:t1", "", None)
            .unwrap();

        let err = ledger
            .debit(user, 150, TransactionType::EntryFee, "competition:c1", "", None)
            .unwrap_err();
        assert!(matches!(
            err,
            DomainError::InsufficientFunds {
                balance: 100,
                requested: 150
            }
        ));

        // No balance change, no journal entry.
        let view = ledger.get_wallet(user, 10).unwrap();
        assert_eq!(view.balance, 100);
        assert_eq!(view.recent_transactions.len(), 1);
    }

    #[test]
    fn test_repeated_credit_with_same_key_is_duplicate() {
        let (ledger, _temp) = create_test_ledger();
        let user = Uuid::new_v4();

        let first = ledger
            .credit(user, 300, TransactionType::Reward, "match:m1", "", Some("pay-1"))
            .unwrap();
        let second = ledger
            .credit(user, 300, TransactionType::Reward, "match:m1", "", Some("pay-1"))
            .unwrap();

        assert!(!first.duplicate);
        assert!(second.duplicate);
        assert_eq!(second.transaction.id, first.transaction.id);
        assert_eq!(second.balance, 300);

        let view = ledger.get_wallet(user, 10).unwrap();
        assert_eq!(view.balance, 300);
        assert_eq!(view.recent_transactions.len(), 1);
    }

    #[test]
    fn test_repeated_debit_with_same_key_is_duplicate() {
        let (ledger, _temp) = create_test_ledger();
        let user = Uuid::new_v4();

        ledger
            .credit(user, 500, TransactionType::Topup, "topup:t1", "", None)
            .unwrap();
        ledger
            .debit(user, 200, TransactionType::EntryFee, "competition:c1", "", Some("fee-1"))
            .unwrap();
        let repeat = ledger
            .debit(user, 200, TransactionType::EntryFee, "competition:c1", "", Some("fee-1"))
            .unwrap();

        assert!(repeat.duplicate);
        assert_eq!(ledger.get_wallet(user, 10).unwrap().balance, 300);
    }

    #[test]
    fn test_balance_matches_journal_after_mixed_ops() {
        let (ledger, _temp) = create_test_ledger();
        let user = Uuid::new_v4();

        ledger
            .credit(user, 1000, TransactionType::Topup, "topup:t1", "", None)
            .unwrap();
        ledger
            .debit(user, 250, TransactionType::EntryFee, "competition:c1", "", None)
            .unwrap();
        ledger
            .credit(user, 400, TransactionType::Reward, "match:m1", "", Some("r1"))
            .unwrap();
        // Failed debit must not affect the audit.
        let _ = ledger.debit(user, 10_000, TransactionType::Payout, "payout:p1", "", None);

        let audit = ledger.verify_balance(user).unwrap();
        assert!(audit.consistent());
        assert_eq!(audit.balance, 1150);
    }

    #[test]
    fn test_total_earnings_counts_only_rewards() {
        let (ledger, _temp) = create_test_ledger();
        let user = Uuid::new_v4();

        ledger
            .credit(user, 1000, TransactionType::Topup, "topup:t1", "", None)
            .unwrap();
        ledger
            .credit(user, 300, TransactionType::Reward, "match:m1", "", None)
            .unwrap();

        let view = ledger.get_wallet(user, 10).unwrap();
        assert_eq!(view.total_earnings, 300);
    }

    #[test]
    fn test_transaction_filters() {
        let (ledger, _temp) = create_test_ledger();
        let user = Uuid::new_v4();

        ledger
            .credit(user, 1000, TransactionType::Topup, "topup:t1", "", None)
            .unwrap();
        ledger
            .debit(user, 100, TransactionType::EntryFee, "competition:c1", "", None)
            .unwrap();
        ledger
            .credit(user, 300, TransactionType::Reward, "match:m1", "", None)
            .unwrap();

        let rewards = ledger
            .get_transactions(
                user,
                &TransactionFilter {
                    tx_type: Some(TransactionType::Reward),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(rewards.len(), 1);
        assert_eq!(rewards[0].amount, 300);

        let by_source = ledger
            .get_transactions(
                user,
                &TransactionFilter {
                    source: Some("competition:c1".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(by_source.len(), 1);
        assert_eq!(by_source[0].tx_type, TransactionType::EntryFee);
    }

    #[test]
    fn test_concurrent_credits_preserve_invariant() {
        let (ledger, temp) = create_test_ledger();
        let user = Uuid::new_v4();
        let path = temp.path().to_str().unwrap().to_string();
        drop(ledger);

        let ledger = Arc::new(WalletLedger::new(&path).unwrap());
        let mut handles = Vec::new();
        for t in 0..8 {
            let ledger = Arc::clone(&ledger);
            handles.push(std::thread::spawn(move || {
                for i in 0..10 {
                    ledger
                        .credit(
                            user,
                            5,
                            TransactionType::Credit,
                            &format!("test:{}:{}", t, i),
                            "",
                            None,
                        )
                        .unwrap();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        let audit = ledger.verify_balance(user).unwrap();
        assert!(audit.consistent());
        assert_eq!(audit.balance, 8 * 10 * 5);
    }

    #[test]
    fn test_racing_debits_never_overdraw() {
        let (ledger, temp) = create_test_ledger();
        let user = Uuid::new_v4();
        let path = temp.path().to_str().unwrap().to_string();
        ledger
            .credit(user, 100, TransactionType::Topup, "topup:t1", "", None)
            .unwrap();
        drop(ledger);

        let ledger = Arc::new(WalletLedger::new(&path).unwrap());
        let mut handles = Vec::new();
        for t in 0..4 {
            let ledger = Arc::clone(&ledger);
            handles.push(std::thread::spawn(move || {
                ledger
                    .debit(
                        user,
                        30,
                        TransactionType::Debit,
                        &format!("race:{}", t),
                        "",
                        None,
                    )
                    .is_ok()
            }));
        }
        let successes = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();

        // Only three of the four 30-unit debits can fit in 100.
        assert_eq!(successes, 3);
        let audit = ledger.verify_balance(user).unwrap();
        assert!(audit.consistent());
        assert_eq!(audit.balance, 10);
    }
}
