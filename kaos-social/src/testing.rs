//! In-crate test backend and helpers.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::backend::{Backend, CallHandle, Command, Completion, EventSink, Request};
use crate::client::SocialClient;
use crate::config::SocialConfig;
use crate::error::Result;
use crate::session::Session;
use crate::types::EntityId;

pub(crate) const ME: EntityId = EntityId(1);

/// Backend that records what it is sent and only answers when told to.
#[derive(Default)]
pub(crate) struct StubBackend {
    next: AtomicU64,
    sink: Mutex<Option<EventSink>>,
    requests: Mutex<Vec<(CallHandle, Request)>>,
    commands: Mutex<Vec<Command>>,
    refuse_commands: AtomicBool,
    on_dispatch: Mutex<Option<DispatchHook>>,
}

type DispatchHook = Box<dyn Fn(&Command) + Send + Sync>;

impl StubBackend {
    pub(crate) fn sink(&self) -> Option<EventSink> {
        self.sink.lock().clone()
    }

    pub(crate) fn requests(&self) -> Vec<(CallHandle, Request)> {
        self.requests.lock().clone()
    }

    pub(crate) fn commands(&self) -> Vec<Command> {
        self.commands.lock().clone()
    }

    pub(crate) fn refuse_commands(&self, refuse: bool) {
        self.refuse_commands.store(refuse, Ordering::Relaxed);
    }

    /// Run `hook` inside every accepted `dispatch`, before it returns.
    pub(crate) fn on_dispatch(&self, hook: impl Fn(&Command) + Send + Sync + 'static) {
        *self.on_dispatch.lock() = Some(Box::new(hook));
    }

    /// Answer the most recent request.
    pub(crate) fn complete_last(&self, completion: Completion) -> bool {
        let Some((handle, _)) = self.requests.lock().last().cloned() else {
            return false;
        };
        self.sink()
            .is_some_and(|sink| sink.complete(handle, completion))
    }
}

impl Backend for StubBackend {
    fn attach(&self, sink: EventSink) {
        *self.sink.lock() = Some(sink);
    }

    fn submit(&self, request: &Request) -> Result<CallHandle> {
        let handle = CallHandle(self.next.fetch_add(1, Ordering::Relaxed) + 1);
        self.requests.lock().push((handle, request.clone()));
        Ok(handle)
    }

    fn dispatch(&self, command: Command) -> bool {
        if self.refuse_commands.load(Ordering::Relaxed) {
            return false;
        }
        if let Some(hook) = self.on_dispatch.lock().as_ref() {
            hook(&command);
        }
        self.commands.lock().push(command);
        true
    }
}

/// Connected client for the local user [`ME`].
pub(crate) fn client() -> (SocialClient, Arc<StubBackend>) {
    client_with(SocialConfig::default())
}

pub(crate) fn client_with(config: SocialConfig) -> (SocialClient, Arc<StubBackend>) {
    let backend = Arc::new(StubBackend::default());
    let client = SocialClient::builder()
        .config(config)
        .session(Arc::new(Session::connected(ME, 480)))
        .backend(backend.clone())
        .build()
        .unwrap();
    (client, backend)
}

/// Yield to the dispatch task until `pred` holds.
pub(crate) async fn until(mut pred: impl FnMut() -> bool) {
    for _ in 0..2000 {
        if pred() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition not reached");
}

/// Wait until the dispatcher has applied at least `events` events.
pub(crate) async fn settle(client: &SocialClient, events: u64) {
    until(|| client.applied_events() >= events).await;
}
