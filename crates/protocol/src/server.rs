//! Server → subscriber messages sent over `GET /sessions/:id/ws`

use serde::{Deserialize, Serialize};

use crate::event::StreamEvent;
use crate::types::SessionState;

/// Messages pushed to WebSocket subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WebSocketMessage {
    /// Full snapshot, sent once when a subscriber attaches
    State { data: SessionState },

    /// Sent after every applied event, with the state it produced
    Event {
        event: StreamEvent,
        state: SessionState,
    },
}
