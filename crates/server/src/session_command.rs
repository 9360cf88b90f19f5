//! Commands sent to a session actor by HTTP and WebSocket handlers.

use tokio::sync::oneshot;

use mdxai_protocol::{SessionState, StreamEvent};

use crate::broadcaster::{Sink, SubscriberId};
use crate::session_actor::ActorError;

/// A command that can be sent to a session actor.
pub enum SessionCommand {
    /// Reduce, persist, then broadcast one event.
    /// Replies with the committed state once every subscriber was notified.
    PostEvent {
        event: StreamEvent,
        reply: oneshot::Sender<Result<SessionState, ActorError>>,
    },

    /// Attach a streaming subscriber. It receives the current state first.
    /// Replies `None` if the sink closed before the snapshot was delivered.
    Subscribe {
        sink: Sink,
        reply: oneshot::Sender<Option<SubscriberId>>,
    },

    /// Detach a streaming subscriber (idempotent)
    Unsubscribe { subscriber_id: SubscriberId },
}
