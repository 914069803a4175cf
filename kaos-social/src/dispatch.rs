//! The apply-path.
//!
//! Completions and push updates are drained from one channel by one task and
//! applied to the cache one at a time, in arrival order. Local mutations made
//! by the views take the same lock, so every cache write is serialized.
//!
//! Each event is stamped with a watermark: the backend's tick when it sends
//! one, otherwise the arrival sequence number. A backend should either stamp
//! every event or none, since the two scales are not comparable.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::backend::{CallHandle, Completion, Event, PersonaChange, PersonaUpdate, Request};
use crate::cache::{EntityCache, FieldGroup, FieldValue};
use crate::correlator::{AsyncCallCorrelator, CallResult};
use crate::lobby::LobbyState;
use crate::sync::MembershipSynchronizer;
use crate::types::{EntityId, FriendProfile};

pub(crate) struct Dispatcher {
    cache: Arc<EntityCache>,
    correlator: Arc<AsyncCallCorrelator>,
    sync: MembershipSynchronizer,
    /// Arrival sequence of the last applied event.
    apply_lock: Mutex<u64>,
}

impl Dispatcher {
    pub fn new(
        cache: Arc<EntityCache>,
        correlator: Arc<AsyncCallCorrelator>,
        local_user: EntityId,
    ) -> Self {
        Self {
            sync: MembershipSynchronizer::new(cache.clone(), local_user),
            cache,
            correlator,
            apply_lock: Mutex::new(0),
        }
    }

    /// Drain events until every sink is dropped.
    pub async fn run(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<Event>) {
        debug!("dispatch task started");
        while let Some(event) = events.recv().await {
            self.apply(event);
        }
        debug!("dispatch task stopped");
    }

    /// Apply one event.
    pub fn apply(&self, event: Event) {
        let mut seq = self.apply_lock.lock();
        *seq += 1;
        let arrival = *seq;

        match event {
            Event::Completed {
                handle,
                tick,
                completion,
            } => self.apply_completion(handle, tick, arrival, completion),
            Event::Persona(update) => self.apply_persona(update, arrival),
            Event::Lobby(update) => {
                let observed_at = update.tick.unwrap_or(arrival);
                let outcome = self.sync.apply(&update, observed_at);
                trace!(lobby = %update.lobby, ?outcome, "lobby update");
            }
        }
    }

    /// Cache first, then wake the callers, so an awaiting caller always sees
    /// the data its request fetched.
    fn apply_completion(
        &self,
        handle: CallHandle,
        tick: Option<u64>,
        arrival: u64,
        completion: Completion,
    ) {
        let Some(request) = self.correlator.expected(handle) else {
            // Logged as duplicate or unknown by the correlator.
            self.correlator
                .on_completion(handle, CallResult::Completed(completion));
            return;
        };

        let (entity, kind) = (request.entity(), request.kind());
        if completion.entity() != entity || completion.kind() != kind {
            let reason = format!(
                "{handle} was issued as {kind:?} for {entity}, answered as {:?} for {}",
                completion.kind(),
                completion.entity()
            );
            warn!(%handle, "malformed completion: {reason}");
            self.correlator
                .on_completion(handle, CallResult::Malformed(reason));
            return;
        }

        let observed_at = tick.unwrap_or(arrival);
        match &completion {
            Completion::FriendInfo {
                user,
                profile,
                rich_presence,
            } => {
                if let Some(profile) = profile {
                    let name_only = matches!(request, Request::FriendInfo { name_only: true, .. });
                    let profile = if name_only {
                        self.merge_name(*user, profile)
                    } else {
                        profile.clone()
                    };
                    self.cache
                        .put(*user, FieldValue::Profile(profile), observed_at);
                }
                if let Some(values) = rich_presence {
                    self.cache
                        .put(*user, FieldValue::RichPresence(values.clone()), observed_at);
                }
            }
            Completion::UserStats {
                user,
                success,
                stats,
            } => match stats.as_ref().filter(|_| *success) {
                Some(stats) => {
                    self.cache
                        .put(*user, FieldValue::UserStats(stats.clone()), observed_at);
                }
                None => debug!(user = %user, "user stats request failed"),
            },
            Completion::RoomEnter {
                lobby,
                response,
                snapshot,
            } => self.sync.apply_join(*lobby, *response, snapshot.as_ref()),
            Completion::LobbyData {
                lobby,
                success,
                snapshot,
            } => self.sync.apply_refresh(*lobby, *success, snapshot.as_ref()),
        }

        self.correlator
            .on_completion(handle, CallResult::Completed(completion));
    }

    /// A name-only answer carries nothing but the name; keep the rest of
    /// what is known.
    fn merge_name(&self, user: EntityId, answer: &FriendProfile) -> FriendProfile {
        let mut profile = match self.cache.last_value(user, FieldGroup::Profile) {
            Some(FieldValue::Profile(known)) => known,
            _ => FriendProfile::default(),
        };
        profile.name = answer.name.clone();
        profile
    }

    fn apply_persona(&self, update: PersonaUpdate, arrival: u64) {
        let observed_at = update.tick.unwrap_or(arrival);
        let value = match update.change {
            PersonaChange::Presence { state } => FieldValue::Presence(state),
            PersonaChange::Relationship { state } => FieldValue::Relationship(state),
            PersonaChange::Profile { profile } => FieldValue::Profile(profile),
            PersonaChange::RichPresence { values } => FieldValue::RichPresence(values),
        };
        self.cache.put(update.user, value, observed_at);
    }

    /// Mutate a lobby record on the apply-path.
    pub(crate) fn apply_local<R>(&self, lobby: EntityId, f: impl FnOnce(&mut LobbyState) -> R) -> R {
        let _guard = self.apply_lock.lock();
        self.cache.update_lobby(lobby, f)
    }

    /// Drop a field group's value on the apply-path.
    pub(crate) fn invalidate(&self, entity: EntityId, group: FieldGroup) -> bool {
        let _guard = self.apply_lock.lock();
        self.cache.invalidate(entity, group)
    }

    /// Run `f` with no event being applied concurrently. Cancelling under
    /// this lock means a completion is either applied in full before the
    /// cancel or not at all.
    pub(crate) fn serialized<R>(
        &self,
        f: impl FnOnce(&EntityCache, &AsyncCallCorrelator) -> R,
    ) -> R {
        let _guard = self.apply_lock.lock();
        f(&self.cache, &self.correlator)
    }

    /// Number of events applied so far.
    pub fn applied(&self) -> u64 {
        *self.apply_lock.lock()
    }
}
