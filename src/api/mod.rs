//! HTTP/WS Gateway
//!
//! Transport layer over the match engine, wallet ledger, and room router.

mod routes;

pub use routes::{create_router, AppState};
