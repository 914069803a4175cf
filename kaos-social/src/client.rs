//! Social client: wires the backend, cache, correlator and dispatcher
//! together and hands out friend and lobby views.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::backend::{Backend, EventSink};
use crate::cache::{CacheEvent, EntityCache};
use crate::config::SocialConfig;
use crate::correlator::AsyncCallCorrelator;
use crate::dispatch::Dispatcher;
use crate::error::{Error, Result};
use crate::friend::Friend;
use crate::lobby::{Lobby, Membership};
use crate::session::{ConnectionStatus, Session};
use crate::types::EntityId;

/// Shared state behind every view.
pub(crate) struct ClientCore {
    pub(crate) config: SocialConfig,
    pub(crate) session: Arc<Session>,
    pub(crate) backend: Arc<dyn Backend>,
    pub(crate) cache: Arc<EntityCache>,
    pub(crate) correlator: Arc<AsyncCallCorrelator>,
    pub(crate) dispatcher: Arc<Dispatcher>,
}

impl ClientCore {
    pub(crate) fn local_user(&self) -> EntityId {
        self.session.local_user()
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.session.is_connected()
    }

    /// Cancel every pending request of one entity.
    pub(crate) fn teardown(&self, entity: EntityId) -> usize {
        self.dispatcher
            .serialized(|_, correlator| correlator.cancel_entity(entity))
    }
}

/// Client for friends and lobbies.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use kaos_social::{Backend, EntityId, Session, SocialClient};
///
/// # async fn example(backend: Arc<impl Backend>) -> kaos_social::Result<()> {
/// let session = Arc::new(Session::connected(EntityId(76561197960287930), 480));
/// let client = SocialClient::builder()
///     .session(session)
///     .backend(backend)
///     .build()?;
///
/// let friend = client.friend(EntityId(76561197960265728));
/// if friend.request_info().await? {
///     println!("{friend} is {:?}", friend.state());
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct SocialClient {
    core: Arc<ClientCore>,
    sink: EventSink,
    dispatch_task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl SocialClient {
    pub fn builder() -> SocialClientBuilder {
        SocialClientBuilder::default()
    }

    /// View over a user. Creates its cache slot on first reference.
    pub fn friend(&self, id: EntityId) -> Friend {
        Friend::new(id, self.core.clone())
    }

    /// View over the local user.
    pub fn me(&self) -> Friend {
        self.friend(self.core.local_user())
    }

    /// View over a lobby. Creates a minimal record on first reference.
    pub fn lobby(&self, id: EntityId) -> Lobby {
        Lobby::new(id, self.core.clone())
    }

    /// Cached users whose relationship is `Friend`.
    pub fn friends(&self) -> Vec<Friend> {
        self.core
            .cache
            .entity_ids()
            .into_iter()
            .map(|id| self.friend(id))
            .filter(|f| f.is_friend())
            .collect()
    }

    /// Lobbies the local user is currently in.
    pub fn joined_lobbies(&self) -> Vec<Lobby> {
        self.core
            .cache
            .lobby_ids()
            .into_iter()
            .filter(|id| {
                self.core
                    .cache
                    .with_lobby(*id, |l| l.membership == Membership::Joined)
                    .unwrap_or(false)
            })
            .map(|id| self.lobby(id))
            .collect()
    }

    pub fn local_user(&self) -> EntityId {
        self.core.local_user()
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.core.session
    }

    pub fn config(&self) -> &SocialConfig {
        &self.core.config
    }

    pub fn cache(&self) -> &EntityCache {
        &self.core.cache
    }

    pub fn correlator(&self) -> &AsyncCallCorrelator {
        &self.core.correlator
    }

    #[cfg(test)]
    pub(crate) fn dispatcher(&self) -> Arc<Dispatcher> {
        self.core.dispatcher.clone()
    }

    /// Number of events the dispatcher has applied.
    pub fn applied_events(&self) -> u64 {
        self.core.dispatcher.applied()
    }

    /// Subscribe to cache changes.
    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.core.cache.subscribe()
    }

    /// The sink the backend was attached to.
    pub fn event_sink(&self) -> EventSink {
        self.sink.clone()
    }

    /// Cancel every pending request and stop the dispatch task. Cached data
    /// stays readable.
    pub fn shutdown(&self) {
        let cancelled = self
            .core
            .dispatcher
            .serialized(|_, correlator| correlator.cancel_all());
        if let Some(task) = self.dispatch_task.lock().take() {
            task.abort();
        }
        info!(cancelled, "social client shut down");
    }
}

/// Builder for [`SocialClient`].
#[derive(Default)]
pub struct SocialClientBuilder {
    config: SocialConfig,
    session: Option<Arc<Session>>,
    backend: Option<Arc<dyn Backend>>,
}

impl SocialClientBuilder {
    pub fn config(mut self, config: SocialConfig) -> Self {
        self.config = config;
        self
    }

    /// The local user's session. Required.
    pub fn session(mut self, session: Arc<Session>) -> Self {
        self.session = Some(session);
        self
    }

    /// The backend to talk to. Required.
    pub fn backend<B: Backend>(mut self, backend: Arc<B>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Build the client and start its dispatch task on the current tokio
    /// runtime.
    pub fn build(self) -> Result<SocialClient> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| Error::NoRuntime)?;
        let session = self
            .session
            .ok_or_else(|| Error::config("a session is required"))?;
        let backend = self
            .backend
            .ok_or_else(|| Error::config("a backend is required"))?;
        let local_user = session.local_user();
        if !local_user.is_valid() {
            return Err(Error::config("local user id must be non-zero"));
        }

        let cache = Arc::new(EntityCache::new(self.config.listener_capacity));
        let correlator = Arc::new(AsyncCallCorrelator::new(
            backend.clone(),
            session.clone(),
            self.config.resolved_history,
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            cache.clone(),
            correlator.clone(),
            local_user,
        ));

        let (sink, events) = EventSink::channel();
        backend.attach(sink.clone());
        let task = runtime.spawn(dispatcher.clone().run(events));
        debug!(user = %local_user, app_id = session.app_id(), "social client started");

        Ok(SocialClient {
            core: Arc::new(ClientCore {
                config: self.config,
                session,
                backend,
                cache,
                correlator,
                dispatcher,
            }),
            sink,
            dispatch_task: Arc::new(Mutex::new(Some(task))),
        })
    }
}
