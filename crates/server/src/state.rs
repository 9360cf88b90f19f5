//! Session registry: maps session ids to their single live actor.

use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tracing::debug;

use mdxai_protocol::{SessionState, StreamEvent};

use crate::persistence::{DurableStore, StoreError};
use crate::reducer::SessionInit;
use crate::session_actor::{ActorError, SessionActorHandle};

/// At most one actor per session id. Concurrent first requests for the same
/// id share one activation; a failed activation is retried by the next
/// request. Different ids activate independently.
///
/// Actors that stopped after going idle are replaced on the next request,
/// only after the old loop has fully exited, so the replacement always
/// restores the latest durable state.
pub struct SessionRegistry {
    actors: DashMap<String, Arc<OnceCell<SessionActorHandle>>>,
    store: Arc<dyn DurableStore>,
    defaults: SessionInit,
    idle_timeout: Option<Duration>,
}

impl SessionRegistry {
    pub fn new(store: Arc<dyn DurableStore>, defaults: SessionInit) -> Self {
        Self {
            actors: DashMap::new(),
            store,
            defaults,
            idle_timeout: None,
        }
    }

    /// Stop actors with no commands and no subscribers for `idle_timeout`.
    pub fn with_idle_timeout(mut self, idle_timeout: Option<Duration>) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Metadata used for sessions created without explicit values
    pub fn defaults(&self) -> &SessionInit {
        &self.defaults
    }

    /// Resolve the actor for `id`, activating it on first use.
    ///
    /// `init` only matters when the session does not exist yet, neither in
    /// memory nor in the store.
    pub async fn get_or_activate(
        &self,
        id: &str,
        init: Option<SessionInit>,
    ) -> Result<SessionActorHandle, StoreError> {
        loop {
            let cell = self.actors.entry(id.to_string()).or_default().clone();
            let init = init.clone();

            let handle = cell
                .get_or_try_init(|| async move {
                    let init = init.unwrap_or_else(|| self.defaults.clone());
                    let store = Arc::clone(&self.store);
                    SessionActorHandle::activate(id, &init, store, self.idle_timeout).await
                })
                .await?
                .clone();

            if !handle.is_closed() {
                return Ok(handle);
            }

            handle.stopped().await;
            self.actors.remove_if(id, |_, current| Arc::ptr_eq(current, &cell));
            debug!(
                component = "registry",
                event = "session.reactivating",
                session_id = %id,
                "Replacing stopped session actor"
            );
        }
    }

    /// Post an event, reactivating the session once if its actor stopped
    /// between lookup and delivery.
    pub async fn post_event(
        &self,
        id: &str,
        event: StreamEvent,
    ) -> Result<SessionState, ActorError> {
        let handle = self.get_or_activate(id, None).await?;
        match handle.post_event(event.clone()).await {
            Err(ActorError::Closed(_)) => {
                self.get_or_activate(id, None).await?.post_event(event).await
            }
            result => result,
        }
    }

    /// Number of sessions with a live actor
    pub fn active_count(&self) -> usize {
        self.actors
            .iter()
            .filter(|entry| entry.value().get().is_some_and(|h| !h.is_closed()))
            .count()
    }

    /// Forget entries whose actor has stopped, and empty cells left by
    /// failed activations. Entries some request is still using are kept.
    pub fn prune_stopped(&self) -> usize {
        let before = self.actors.len();
        self.actors.retain(|_, cell| {
            let in_use = Arc::strong_count(cell) > 1;
            let stopped = cell.get().map_or(true, SessionActorHandle::has_stopped);
            in_use || !stopped
        });
        before.saturating_sub(self.actors.len())
    }

    /// Periodically prune stopped actors until the registry is dropped.
    pub fn spawn_reaper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let registry: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                let pruned = registry.prune_stopped();
                if pruned > 0 {
                    debug!(
                        component = "registry",
                        event = "registry.pruned",
                        pruned,
                        active = registry.active_count(),
                    );
                }
            }
        })
    }
}
