//! Authentication (consumed interface)
//!
//! Identity is issued elsewhere; this core only validates the bearer token on
//! each command and exposes the authenticated identity to handlers.

mod jwt;
mod middleware;

pub use jwt::{Claims, JwtHandler};
pub use middleware::{auth_middleware, Identity};
