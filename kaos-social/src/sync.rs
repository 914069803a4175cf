//! Applies lobby push updates to cached lobby records.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::backend::{LobbyChange, LobbySnapshot, LobbyUpdate};
use crate::cache::EntityCache;
use crate::lobby::{LobbyState, Membership};
use crate::types::{EntityId, RoomEnter};

/// What became of one lobby update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SyncOutcome {
    Applied,
    /// Older than the lobby's watermark.
    Stale,
    /// Nothing to change (e.g. a join for someone already present).
    Ignored,
}

/// Keeps cached lobby records in step with membership pushes and join
/// results. Owned by the dispatcher and only called from its apply-path.
pub(crate) struct MembershipSynchronizer {
    cache: Arc<EntityCache>,
    local_user: EntityId,
}

impl MembershipSynchronizer {
    pub fn new(cache: Arc<EntityCache>, local_user: EntityId) -> Self {
        Self { cache, local_user }
    }

    /// Apply a push observed at `observed_at`. Updates for a lobby that has
    /// no record yet create a minimal one.
    pub fn apply(&self, update: &LobbyUpdate, observed_at: u64) -> SyncOutcome {
        let local = self.local_user;
        self.cache.update_lobby(update.lobby, |lobby| {
            if !lobby.accept(observed_at) {
                debug!(lobby = %lobby.id, observed_at, "stale lobby update dropped");
                return SyncOutcome::Stale;
            }
            apply_change(lobby, &update.change, local)
        })
    }

    /// Apply the answer to a join. A successful join installs the snapshot
    /// and makes the local user a member.
    pub fn apply_join(&self, lobby: EntityId, response: RoomEnter, snapshot: Option<&LobbySnapshot>) {
        let local = self.local_user;
        self.cache.update_lobby(lobby, |state| {
            if !response.is_success() {
                debug!(lobby = %lobby, ?response, "join refused");
                if state.membership == Membership::Joining {
                    state.membership = Membership::NotJoined;
                }
                return;
            }
            if let Some(snapshot) = snapshot {
                if state.apply_snapshot(snapshot) {
                    warn!(lobby = %lobby, "join snapshot had an owner outside its members");
                }
            }
            state.add_member(local);
            state.membership = Membership::Joined;
            state.last_departure = None;
            info!(lobby = %lobby, members = state.member_count(), "lobby joined");
        });
    }

    /// Apply the answer to a metadata refresh.
    pub fn apply_refresh(&self, lobby: EntityId, success: bool, snapshot: Option<&LobbySnapshot>) {
        let Some(snapshot) = snapshot.filter(|_| success) else {
            debug!(lobby = %lobby, "lobby refresh returned nothing");
            return;
        };
        self.cache.update_lobby(lobby, |state| {
            // A join may have landed while the refresh was in flight.
            if state.membership == Membership::Joined {
                return;
            }
            if state.apply_snapshot(snapshot) {
                warn!(lobby = %lobby, "refresh snapshot had an owner outside its members");
            }
        });
    }
}

fn apply_change(lobby: &mut LobbyState, change: &LobbyChange, local: EntityId) -> SyncOutcome {
    match change {
        LobbyChange::MemberJoined { member } => {
            if lobby.add_member(*member) {
                debug!(lobby = %lobby.id, %member, "member joined");
                SyncOutcome::Applied
            } else {
                SyncOutcome::Ignored
            }
        }
        LobbyChange::MemberLeft { member, reason } => {
            let removed = lobby.remove_member(*member);
            if *member == local && lobby.membership != Membership::NotJoined {
                info!(lobby = %lobby.id, ?reason, "removed from lobby");
                lobby.membership = Membership::NotJoined;
                lobby.last_departure = Some(*reason);
                return SyncOutcome::Applied;
            }
            if removed {
                debug!(lobby = %lobby.id, %member, ?reason, "member left");
                SyncOutcome::Applied
            } else {
                SyncOutcome::Ignored
            }
        }
        LobbyChange::DataChanged { key, value } => {
            match value {
                Some(value) => {
                    lobby.metadata.insert(key.clone(), value.clone());
                }
                None => {
                    lobby.metadata.remove(key);
                }
            }
            SyncOutcome::Applied
        }
        LobbyChange::MemberDataChanged { member, key, value } => {
            if !lobby.is_member(*member) {
                debug!(lobby = %lobby.id, %member, "member data for a non-member dropped");
                return SyncOutcome::Ignored;
            }
            let data = lobby.member_metadata.entry(*member).or_default();
            match value {
                Some(value) => {
                    data.insert(key.clone(), value.clone());
                }
                None => {
                    data.remove(key);
                }
            }
            SyncOutcome::Applied
        }
        LobbyChange::GameServerSet { server } => {
            lobby.game_server = Some(*server);
            SyncOutcome::Applied
        }
        LobbyChange::OwnerChanged { owner } => {
            lobby.set_owner(*owner);
            SyncOutcome::Applied
        }
        LobbyChange::Snapshot { snapshot } => {
            if lobby.apply_snapshot(snapshot) {
                warn!(lobby = %lobby.id, "lobby snapshot had an owner outside its members");
            }
            SyncOutcome::Applied
        }
    }
}
