//! Session actor: owns one `SessionState` and processes commands sequentially.
//!
//! Each session runs as an independent tokio task. External callers
//! communicate via `SessionActorHandle`, which sends `SessionCommand`
//! messages over an mpsc channel. Lock-free reads go through `ArcSwap`
//! and only ever observe committed (persisted) states.
//!
//! With an idle timeout configured, an actor that has had no commands and
//! no subscribers for that long stops itself; the store keeps its state
//! and the registry activates a new actor on the next request.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use chrono::Utc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use mdxai_protocol::{SessionState, StreamEvent, WebSocketMessage};

use crate::broadcaster::{Broadcaster, Sink, SubscriberId};
use crate::persistence::{load_state, save_state, DurableStore, StoreError};
use crate::projection;
use crate::reducer::{create_initial_state, reduce, SessionInit};
use crate::session_command::SessionCommand;

const COMMAND_BUFFER: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum ActorError {
    #[error("failed to persist session state: {0}")]
    Store(#[from] StoreError),

    #[error("session actor {0} is no longer running")]
    Closed(String),
}

/// Handle to a running session actor (cheap to Clone).
#[derive(Clone)]
pub struct SessionActorHandle {
    pub id: String,
    command_tx: mpsc::Sender<SessionCommand>,
    snapshot: Arc<ArcSwap<SessionState>>,
    /// Sender half lives inside the actor; closes when the loop has exited.
    stopped: watch::Receiver<()>,
}

impl SessionActorHandle {
    /// Restore the session from `store`, or create and persist a fresh one,
    /// then spawn its actor loop.
    pub async fn activate(
        id: &str,
        init: &SessionInit,
        store: Arc<dyn DurableStore>,
        idle_timeout: Option<Duration>,
    ) -> Result<SessionActorHandle, StoreError> {
        let state = match load_state(store.as_ref(), id).await? {
            Some(state) => {
                info!(
                    component = "session_actor",
                    event = "session.restored",
                    session_id = %id,
                    status = state.status.as_str(),
                    tools = state.tools.len(),
                    messages = state.messages.len(),
                    "Session restored from store"
                );
                state
            }
            None => {
                let state = create_initial_state(id, init, Utc::now());
                save_state(store.as_ref(), &state).await?;
                info!(
                    component = "session_actor",
                    event = "session.created",
                    session_id = %id,
                    model = %state.model,
                    execution_mode = %state.execution_mode,
                    "Session created"
                );
                state
            }
        };

        Ok(Self::spawn(state, store, idle_timeout))
    }

    /// Spawn an actor around an already-loaded state.
    pub fn spawn(
        state: SessionState,
        store: Arc<dyn DurableStore>,
        idle_timeout: Option<Duration>,
    ) -> SessionActorHandle {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let id = state.id.clone();
        let snapshot = Arc::new(ArcSwap::from_pointee(state.clone()));
        let (stopped_tx, stopped) = watch::channel(());

        let actor = SessionActor {
            broadcaster: Broadcaster::new(id.clone()),
            snapshot: Arc::clone(&snapshot),
            state,
            store,
            idle_timeout,
            _stopped: stopped_tx,
        };
        tokio::spawn(actor.run(command_rx));

        SessionActorHandle {
            id,
            command_tx,
            snapshot,
            stopped,
        }
    }

    /// Lock-free read of the last committed state.
    pub fn state(&self) -> Arc<SessionState> {
        self.snapshot.load_full()
    }

    pub fn markdown(&self) -> String {
        projection::render_markdown(&self.state())
    }

    pub fn mdx(&self) -> String {
        projection::render_mdx(&self.state())
    }

    /// True once the actor refuses new commands, e.g. after going idle.
    /// Queued commands may still be finishing; see `stopped`.
    pub fn is_closed(&self) -> bool {
        self.command_tx.is_closed()
    }

    /// True once the actor loop has exited and its last write is durable.
    pub fn has_stopped(&self) -> bool {
        self.stopped.has_changed().is_err()
    }

    /// Wait for the actor loop to exit.
    pub async fn stopped(&self) {
        let mut stopped = self.stopped.clone();
        while stopped.changed().await.is_ok() {}
    }

    /// Apply one event. Resolves after the new state is durable and every
    /// subscriber has been notified.
    pub async fn post_event(&self, event: StreamEvent) -> Result<SessionState, ActorError> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::PostEvent { event, reply }).await?;
        rx.await.map_err(|_| self.closed())?
    }

    /// Attach a streaming subscriber; it is sent the current state first.
    pub async fn subscribe(&self, sink: Sink) -> Result<Option<SubscriberId>, ActorError> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::Subscribe { sink, reply }).await?;
        rx.await.map_err(|_| self.closed())
    }

    pub async fn unsubscribe(&self, subscriber_id: SubscriberId) {
        let _ = self
            .send(SessionCommand::Unsubscribe { subscriber_id })
            .await;
    }

    async fn send(&self, cmd: SessionCommand) -> Result<(), ActorError> {
        self.command_tx.send(cmd).await.map_err(|_| {
            warn!(
                component = "session_actor",
                session_id = %self.id,
                "Actor channel closed, command dropped"
            );
            self.closed()
        })
    }

    fn closed(&self) -> ActorError {
        ActorError::Closed(self.id.clone())
    }
}

/// The single writer for one session.
struct SessionActor {
    state: SessionState,
    snapshot: Arc<ArcSwap<SessionState>>,
    store: Arc<dyn DurableStore>,
    broadcaster: Broadcaster,
    idle_timeout: Option<Duration>,
    _stopped: watch::Sender<()>,
}

impl SessionActor {
    async fn run(mut self, mut command_rx: mpsc::Receiver<SessionCommand>) {
        loop {
            let next = match self.idle_timeout {
                None => command_rx.recv().await,
                Some(window) => match tokio::time::timeout(window, command_rx.recv()).await {
                    Ok(next) => next,
                    Err(_) => {
                        self.broadcaster.prune_closed();
                        if self.broadcaster.is_empty() {
                            self.shut_down_idle(&mut command_rx).await;
                            return;
                        }
                        continue;
                    }
                },
            };
            match next {
                Some(cmd) => self.handle(cmd).await,
                None => break,
            }
        }
        debug!(
            component = "session_actor",
            event = "session.actor_stopped",
            session_id = %self.state.id,
        );
    }

    /// Refuse new commands, finish the ones already queued, then stop.
    async fn shut_down_idle(&mut self, command_rx: &mut mpsc::Receiver<SessionCommand>) {
        command_rx.close();
        while let Some(cmd) = command_rx.recv().await {
            self.handle(cmd).await;
        }
        info!(
            component = "session_actor",
            event = "session.idle_stopped",
            session_id = %self.state.id,
            subscribers = self.broadcaster.len(),
            "Idle session actor stopped"
        );
    }

    async fn handle(&mut self, cmd: SessionCommand) {
        match cmd {
            SessionCommand::PostEvent { event, reply } => {
                let result = self.apply(event).await;
                let _ = reply.send(result);
            }
            SessionCommand::Subscribe { sink, reply } => {
                let id = self.broadcaster.attach(sink, &self.state).await;
                let _ = reply.send(id);
            }
            SessionCommand::Unsubscribe { subscriber_id } => {
                self.broadcaster.detach(subscriber_id);
            }
        }
    }

    /// Reduce into a candidate state and commit it only once it is durable.
    async fn apply(&mut self, event: StreamEvent) -> Result<SessionState, ActorError> {
        let next = reduce(self.state.clone(), &event, Utc::now());

        if let Err(e) = save_state(self.store.as_ref(), &next).await {
            error!(
                component = "session_actor",
                event = "session.persist_failed",
                session_id = %self.state.id,
                event_type = event.kind(),
                error = %e,
                "Failed to persist session state, event not applied"
            );
            return Err(e.into());
        }

        self.state = next;
        self.snapshot.store(Arc::new(self.state.clone()));

        debug!(
            component = "session_actor",
            event = "session.event_applied",
            session_id = %self.state.id,
            event_type = event.kind(),
            status = self.state.status.as_str(),
            subscribers = self.broadcaster.len(),
        );

        self.broadcaster
            .notify(WebSocketMessage::Event {
                event,
                state: self.state.clone(),
            })
            .await;

        Ok(self.state.clone())
    }
}
