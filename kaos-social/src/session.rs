//! Backend session: local identity and connection status.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use tracing::debug;

use crate::types::{now_millis, EntityId};

/// Answers whether the backend can currently be reached.
///
/// Queried before every request or command is issued.
pub trait ConnectionStatus: Send + Sync {
    fn is_connected(&self) -> bool;
}

/// The local user's backend session.
///
/// Starts closed. `open` marks the backend reachable, `close` marks it
/// unreachable again; both may be called any number of times over the
/// process lifetime as the transport comes and goes.
#[derive(Debug)]
pub struct Session {
    local_user: EntityId,
    app_id: u32,
    connected: AtomicBool,
    /// Unix millis of the last `open`, 0 if never opened.
    opened_at: AtomicI64,
}

impl Session {
    pub fn new(local_user: EntityId, app_id: u32) -> Self {
        Self {
            local_user,
            app_id,
            connected: AtomicBool::new(false),
            opened_at: AtomicI64::new(0),
        }
    }

    /// Session that starts out connected.
    pub fn connected(local_user: EntityId, app_id: u32) -> Self {
        let session = Self::new(local_user, app_id);
        session.open();
        session
    }

    pub fn local_user(&self) -> EntityId {
        self.local_user
    }

    pub fn app_id(&self) -> u32 {
        self.app_id
    }

    pub fn open(&self) {
        self.opened_at.store(now_millis(), Ordering::Relaxed);
        self.connected.store(true, Ordering::Release);
        debug!(user = %self.local_user, "backend session opened");
    }

    pub fn close(&self) {
        self.connected.store(false, Ordering::Release);
        debug!(user = %self.local_user, "backend session closed");
    }

    /// Unix millis of the last `open`, if any.
    pub fn opened_at(&self) -> Option<i64> {
        match self.opened_at.load(Ordering::Relaxed) {
            0 => None,
            t => Some(t),
        }
    }
}

impl ConnectionStatus for Session {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}
