//! Room Broadcast Router
//!
//! One broadcast room per match, fanning every domain event out to current
//! viewers in per-match emission order.

mod router;

pub use router::{run_event_dispatcher, RoomRouter};
