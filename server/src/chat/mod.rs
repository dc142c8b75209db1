//! Message dispatch and room-scoped realtime traffic.

pub mod dispatch;
pub mod target;
pub mod typing;
