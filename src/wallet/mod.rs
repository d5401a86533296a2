//! Wallet Ledger
//!
//! Per-user balances with an append-only transaction journal. Credit and
//! debit are the only two mutation entry points, both atomic and idempotent.

mod ledger;

pub use ledger::{BalanceAudit, LedgerOutcome, TransactionFilter, WalletLedger};
