use std::sync::Arc;

use crate::presence::rooms::RoomTracker;
use crate::presence::PresenceRegistry;
use crate::store::Store;

/// Shared application state passed to all handlers via axum State extractor.
#[derive(Clone)]
pub struct AppState {
    /// Persistence boundary. Everything durable goes through this trait.
    pub store: Arc<dyn Store>,
    /// Live WebSocket sessions per user
    pub presence: PresenceRegistry,
    /// Volatile room membership per user
    pub rooms: RoomTracker,
    /// JWT signing secret (256-bit random key)
    pub jwt_secret: Vec<u8>,
}
