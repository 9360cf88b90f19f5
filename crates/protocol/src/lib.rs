//! mdxai Protocol
//!
//! Shared types for the mdxai session service: the session state record,
//! the inbound execution events it folds, and the messages pushed to
//! WebSocket subscribers. Everything is serialized as JSON.

use uuid::Uuid;

// Re-exports
pub mod event;
pub mod server;
pub mod types;

pub use event::StreamEvent;
pub use server::WebSocketMessage;
pub use types::*;

/// Generate a new unique ID
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}
