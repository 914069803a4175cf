//! Entity cache.
//!
//! Keyed store of what the client knows about remote users and lobbies.
//! User attributes live in field groups, each of which is either unknown or
//! known as of a watermark. A write older than the stored watermark is
//! rejected, so a slow response can never roll a group back.
//!
//! Reads are lock-free with respect to each other. All writes come from the
//! dispatcher's serialized apply-path.

use std::collections::HashMap;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::lobby::LobbyState;
use crate::types::{EntityId, FriendProfile, PresenceState, RelationshipState, UserStats};

/// A set of user attributes populated together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldGroup {
    Profile,
    Presence,
    Relationship,
    RichPresence,
    UserStats,
}

/// Value of one field group.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Profile(FriendProfile),
    Presence(PresenceState),
    Relationship(RelationshipState),
    RichPresence(HashMap<String, String>),
    UserStats(UserStats),
}

impl FieldValue {
    pub fn group(&self) -> FieldGroup {
        match self {
            Self::Profile(_) => FieldGroup::Profile,
            Self::Presence(_) => FieldGroup::Presence,
            Self::Relationship(_) => FieldGroup::Relationship,
            Self::RichPresence(_) => FieldGroup::RichPresence,
            Self::UserStats(_) => FieldGroup::UserStats,
        }
    }
}

/// Result of a cache read.
#[derive(Debug, Clone, PartialEq)]
pub enum Cached<T> {
    Unknown,
    Known { value: T, observed_at: u64 },
}

impl<T> Cached<T> {
    pub fn is_known(&self) -> bool {
        matches!(self, Self::Known { .. })
    }

    pub fn known(&self) -> Option<&T> {
        match self {
            Self::Known { value, .. } => Some(value),
            Self::Unknown => None,
        }
    }

    pub fn into_known(self) -> Option<T> {
        match self {
            Self::Known { value, .. } => Some(value),
            Self::Unknown => None,
        }
    }
}

/// Outcome of a cache write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Accepted,
    /// Older than what is stored; the stored value was kept.
    Stale { watermark: u64 },
}

/// Change notification fanned out to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheEvent {
    Updated { entity: EntityId, group: FieldGroup },
    Invalidated { entity: EntityId, group: FieldGroup },
    Lobby { lobby: EntityId },
}

#[derive(Debug, Default)]
struct Slot {
    value: Option<FieldValue>,
    /// Value dropped by the last invalidation, kept for partial answers.
    retired: Option<FieldValue>,
    /// Survives invalidation so stale answers stay rejected.
    watermark: Option<u64>,
}

#[derive(Debug, Default)]
struct EntitySlots {
    groups: HashMap<FieldGroup, Slot>,
}

/// Shared cache of user field groups and lobby records.
///
/// Read-only outside the crate: every write goes through the dispatcher.
///
/// ```compile_fail
/// use kaos_social::{EntityCache, EntityId, FieldValue, UserStats};
///
/// let cache = EntityCache::default();
/// cache.put(EntityId(2), FieldValue::UserStats(UserStats::default()), 0);
/// ```
pub struct EntityCache {
    entities: DashMap<EntityId, EntitySlots>,
    lobbies: DashMap<EntityId, LobbyState>,
    updates_tx: broadcast::Sender<CacheEvent>,
}

impl EntityCache {
    pub fn new(listener_capacity: usize) -> Self {
        let (updates_tx, _) = broadcast::channel(listener_capacity.max(1));
        Self {
            entities: DashMap::new(),
            lobbies: DashMap::new(),
            updates_tx,
        }
    }

    /// Subscribe to change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.updates_tx.subscribe()
    }

    fn notify(&self, event: CacheEvent) {
        // No subscribers is the common case.
        let _ = self.updates_tx.send(event);
    }

    /// Create an empty slot for `id` if none exists yet.
    pub(crate) fn touch(&self, id: EntityId) {
        self.entities.entry(id).or_default();
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.entities.contains_key(&id)
    }

    /// Ids of every user the cache has a slot for.
    pub fn entity_ids(&self) -> Vec<EntityId> {
        self.entities.iter().map(|e| *e.key()).collect()
    }

    /// Read a field group. Creates the slot on first reference.
    pub fn get(&self, id: EntityId, group: FieldGroup) -> Cached<FieldValue> {
        if let Some(slots) = self.entities.get(&id) {
            return match slots.groups.get(&group) {
                Some(Slot {
                    value: Some(value),
                    watermark: Some(observed_at),
                    ..
                }) => Cached::Known {
                    value: value.clone(),
                    observed_at: *observed_at,
                },
                _ => Cached::Unknown,
            };
        }
        self.touch(id);
        Cached::Unknown
    }

    /// Write a field group unless `observed_at` precedes its watermark.
    pub(crate) fn put(&self, id: EntityId, value: FieldValue, observed_at: u64) -> PutOutcome {
        let group = value.group();
        {
            let mut slots = self.entities.entry(id).or_default();
            let slot = slots.groups.entry(group).or_default();
            if let Some(watermark) = slot.watermark {
                if observed_at < watermark {
                    debug!(entity = %id, ?group, observed_at, watermark, "stale write rejected");
                    return PutOutcome::Stale { watermark };
                }
            }
            slot.value = Some(value);
            slot.retired = None;
            slot.watermark = Some(observed_at);
        }
        trace!(entity = %id, ?group, observed_at, "field group updated");
        self.notify(CacheEvent::Updated { entity: id, group });
        PutOutcome::Accepted
    }

    /// Forget a field group's value so the next access re-fetches it.
    pub(crate) fn invalidate(&self, id: EntityId, group: FieldGroup) -> bool {
        let had_value = {
            let mut slots = self.entities.entry(id).or_default();
            match slots.groups.get_mut(&group) {
                Some(slot) => match slot.value.take() {
                    Some(value) => {
                        slot.retired = Some(value);
                        true
                    }
                    None => false,
                },
                None => false,
            }
        };
        if had_value {
            self.notify(CacheEvent::Invalidated { entity: id, group });
        }
        had_value
    }

    /// The current value, or the one the last invalidation dropped.
    pub(crate) fn last_value(&self, id: EntityId, group: FieldGroup) -> Option<FieldValue> {
        let slots = self.entities.get(&id)?;
        let slot = slots.groups.get(&group)?;
        slot.value.clone().or_else(|| slot.retired.clone())
    }

    pub fn watermark(&self, id: EntityId, group: FieldGroup) -> Option<u64> {
        self.entities
            .get(&id)
            .and_then(|slots| slots.groups.get(&group).and_then(|s| s.watermark))
    }

    // ==================== Lobbies ====================

    /// Copy of a lobby record, if one exists.
    pub fn lobby(&self, id: EntityId) -> Option<LobbyState> {
        self.lobbies.get(&id).map(|l| l.clone())
    }

    /// Read from a lobby record without copying it.
    pub fn with_lobby<R>(&self, id: EntityId, f: impl FnOnce(&LobbyState) -> R) -> Option<R> {
        self.lobbies.get(&id).map(|l| f(&l))
    }

    /// Create a minimal lobby record if none exists.
    pub(crate) fn touch_lobby(&self, id: EntityId) {
        self.lobbies.entry(id).or_insert_with(|| LobbyState::new(id));
    }

    /// Mutate a lobby record, creating a minimal one first if needed.
    /// Only the apply-path calls this.
    pub(crate) fn update_lobby<R>(&self, id: EntityId, f: impl FnOnce(&mut LobbyState) -> R) -> R {
        let result = {
            let mut lobby = self.lobbies.entry(id).or_insert_with(|| LobbyState::new(id));
            f(&mut lobby)
        };
        self.notify(CacheEvent::Lobby { lobby: id });
        result
    }

    pub fn lobby_ids(&self) -> Vec<EntityId> {
        self.lobbies.iter().map(|l| *l.key()).collect()
    }
}

impl Default for EntityCache {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn profile(name: &str) -> FieldValue {
        FieldValue::Profile(FriendProfile::named(name))
    }

    #[test]
    fn test_unknown_before_put() {
        let cache = EntityCache::default();
        assert!(!cache.contains(EntityId(1)));
        assert_eq!(cache.get(EntityId(1), FieldGroup::Profile), Cached::Unknown);
        // First reference creates the slot.
        assert!(cache.contains(EntityId(1)));
        assert_eq!(cache.get(EntityId(1), FieldGroup::UserStats), Cached::Unknown);
    }

    #[test]
    fn test_put_then_get() {
        let cache = EntityCache::default();
        assert_eq!(cache.put(EntityId(1), profile("alice"), 3), PutOutcome::Accepted);
        assert_eq!(
            cache.get(EntityId(1), FieldGroup::Profile),
            Cached::Known {
                value: profile("alice"),
                observed_at: 3
            }
        );
        assert_eq!(cache.get(EntityId(1), FieldGroup::Presence), Cached::Unknown);
    }

    #[test]
    fn test_older_write_rejected() {
        let cache = EntityCache::default();
        cache.put(EntityId(1), profile("new"), 10);
        assert_eq!(
            cache.put(EntityId(1), profile("old"), 9),
            PutOutcome::Stale { watermark: 10 }
        );
        assert_eq!(
            cache.get(EntityId(1), FieldGroup::Profile).into_known(),
            Some(profile("new"))
        );
        // Equal watermark is not older.
        assert_eq!(cache.put(EntityId(1), profile("same"), 10), PutOutcome::Accepted);
    }

    #[test]
    fn test_watermarks_are_per_group() {
        let cache = EntityCache::default();
        cache.put(EntityId(1), profile("alice"), 50);
        assert_eq!(
            cache.put(EntityId(1), FieldValue::Presence(PresenceState::Away), 2),
            PutOutcome::Accepted
        );
        assert_eq!(cache.watermark(EntityId(1), FieldGroup::Presence), Some(2));
    }

    #[test]
    fn test_invalidate_keeps_watermark() {
        let cache = EntityCache::default();
        cache.put(EntityId(1), profile("alice"), 5);

        assert!(cache.invalidate(EntityId(1), FieldGroup::Profile));
        assert!(!cache.invalidate(EntityId(1), FieldGroup::Profile));
        assert_eq!(cache.get(EntityId(1), FieldGroup::Profile), Cached::Unknown);

        assert_eq!(
            cache.put(EntityId(1), profile("stale"), 4),
            PutOutcome::Stale { watermark: 5 }
        );
        assert_eq!(cache.get(EntityId(1), FieldGroup::Profile), Cached::Unknown);
        assert_eq!(cache.put(EntityId(1), profile("fresh"), 6), PutOutcome::Accepted);
    }

    #[test]
    fn test_listeners_see_updates() {
        let cache = EntityCache::default();
        let mut rx = cache.subscribe();

        cache.put(EntityId(1), profile("alice"), 1);
        cache.put(EntityId(1), profile("stale"), 0);
        cache.invalidate(EntityId(1), FieldGroup::Profile);
        cache.update_lobby(EntityId(9), |lobby| lobby.max_members = 4);

        assert_eq!(
            rx.try_recv().unwrap(),
            CacheEvent::Updated {
                entity: EntityId(1),
                group: FieldGroup::Profile
            }
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            CacheEvent::Invalidated {
                entity: EntityId(1),
                group: FieldGroup::Profile
            }
        );
        assert_eq!(rx.try_recv().unwrap(), CacheEvent::Lobby { lobby: EntityId(9) });
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_update_lobby_creates_minimal_record() {
        let cache = EntityCache::default();
        assert!(cache.lobby(EntityId(9)).is_none());
        cache.update_lobby(EntityId(9), |_| ());
        let lobby = cache.lobby(EntityId(9)).unwrap();
        assert_eq!(lobby.id, EntityId(9));
        assert!(lobby.members.is_empty());
    }

    proptest! {
        #[test]
        fn prop_latest_watermark_wins(writes in proptest::collection::vec((0u64..64, 0u32..1000), 1..40)) {
            let cache = EntityCache::default();
            let id = EntityId(1);
            let mut best: Option<(u64, u32)> = None;

            for (tick, level) in &writes {
                let value = FieldValue::Profile(FriendProfile { steam_level: *level as i32, ..Default::default() });
                cache.put(id, value, *tick);
                if best.map_or(true, |(t, _)| *tick >= t) {
                    best = Some((*tick, *level));
                }
            }

            let (tick, level) = best.unwrap();
            let expected = FieldValue::Profile(FriendProfile { steam_level: level as i32, ..Default::default() });
            prop_assert_eq!(
                cache.get(id, FieldGroup::Profile),
                Cached::Known { value: expected, observed_at: tick }
            );
        }
    }
}
