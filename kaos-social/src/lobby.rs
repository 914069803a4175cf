//! Lobby view and the cached lobby record.
//!
//! Membership follows `NotJoined -> Joining -> Joined -> Leaving -> NotJoined`.
//! Involuntary removal (kick, ban, disconnect) arrives as a push and drops a
//! joined lobby straight back to `NotJoined`, recording why in
//! `last_departure`.
//!
//! Lobby-level mutations are owner-only and per-member data is self-only.
//! Both are checked locally before anything is sent; a refused call returns
//! `false` and changes nothing.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::backend::{Command, Completion, LobbySnapshot, Request, RequestKind};
use crate::client::ClientCore;
use crate::correlator::CallResult;
use crate::error::{Error, Result};
use crate::friend::Friend;
use crate::types::{Departure, EntityId, GameServer, RoomEnter, Visibility};

/// Hard cap on lobby size.
pub const MAX_LOBBY_MEMBERS: u32 = 250;

/// Local user's membership in a lobby.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Membership {
    #[default]
    NotJoined,
    Joining,
    Joined,
    Leaving,
}

/// Cached record of one lobby.
///
/// Whenever `members` is non-empty, `owner` is one of them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LobbyState {
    pub id: EntityId,
    pub max_members: u32,
    pub owner: Option<EntityId>,
    pub visibility: Visibility,
    pub joinable: bool,
    pub metadata: HashMap<String, String>,
    /// In join order.
    pub members: Vec<EntityId>,
    pub member_metadata: HashMap<EntityId, HashMap<String, String>>,
    pub game_server: Option<GameServer>,
    pub membership: Membership,
    pub last_departure: Option<Departure>,
    /// Watermark of the last accepted push.
    pub watermark: Option<u64>,
    /// True once a join or refresh delivered a full snapshot.
    pub populated: bool,
}

impl LobbyState {
    pub fn new(id: EntityId) -> Self {
        Self {
            id,
            max_members: 0,
            owner: None,
            visibility: Visibility::default(),
            joinable: true,
            metadata: HashMap::new(),
            members: Vec::new(),
            member_metadata: HashMap::new(),
            game_server: None,
            membership: Membership::NotJoined,
            last_departure: None,
            watermark: None,
            populated: false,
        }
    }

    pub fn is_member(&self, id: EntityId) -> bool {
        self.members.contains(&id)
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    /// Append a member. The first member of an ownerless lobby becomes its
    /// owner. False if `id` was already a member.
    pub(crate) fn add_member(&mut self, id: EntityId) -> bool {
        if self.is_member(id) {
            return false;
        }
        self.members.push(id);
        if self.owner.is_none() {
            self.owner = Some(id);
        }
        true
    }

    /// Remove a member and its data. If the owner leaves, the longest-standing
    /// remaining member holds ownership until the backend names the new owner.
    pub(crate) fn remove_member(&mut self, id: EntityId) -> bool {
        let Some(pos) = self.members.iter().position(|m| *m == id) else {
            return false;
        };
        self.members.remove(pos);
        self.member_metadata.remove(&id);
        if self.owner == Some(id) {
            self.owner = self.members.first().copied();
        }
        true
    }

    pub(crate) fn set_owner(&mut self, owner: EntityId) {
        if !self.members.is_empty() && !self.is_member(owner) {
            warn!(lobby = %self.id, %owner, "owner is not a member, adding it");
            self.members.push(owner);
        }
        self.owner = Some(owner);
    }

    /// Replace everything the snapshot covers. Returns true if the snapshot
    /// broke the owner invariant and had to be repaired.
    pub(crate) fn apply_snapshot(&mut self, snapshot: &LobbySnapshot) -> bool {
        self.max_members = snapshot.max_members.min(MAX_LOBBY_MEMBERS);
        self.visibility = snapshot.visibility;
        self.joinable = snapshot.joinable;
        self.metadata = snapshot.metadata.clone();
        self.members.clear();
        for member in &snapshot.members {
            if !self.members.contains(member) {
                self.members.push(*member);
            }
        }
        self.member_metadata = snapshot
            .member_metadata
            .iter()
            .filter(|(id, _)| self.members.contains(id))
            .map(|(id, data)| (*id, data.clone()))
            .collect();
        self.game_server = snapshot.game_server;
        self.populated = true;

        let mut repaired = false;
        self.owner = match snapshot.owner {
            Some(owner) if !self.members.is_empty() && !self.members.contains(&owner) => {
                self.members.push(owner);
                repaired = true;
                Some(owner)
            }
            Some(owner) => Some(owner),
            None if !self.members.is_empty() => {
                repaired = true;
                self.members.first().copied()
            }
            None => None,
        };
        repaired
    }

    /// Accept an update observed at `observed_at` unless it is older than the
    /// last accepted one.
    pub(crate) fn accept(&mut self, observed_at: u64) -> bool {
        if let Some(watermark) = self.watermark {
            if observed_at < watermark {
                return false;
            }
        }
        self.watermark = Some(observed_at);
        true
    }

    /// Whether `owner ∈ members` holds (vacuously true for an empty lobby).
    pub fn owner_invariant_holds(&self) -> bool {
        self.members.is_empty() || self.owner.is_some_and(|o| self.members.contains(&o))
    }
}

/// View over a single lobby.
#[derive(Clone)]
pub struct Lobby {
    id: EntityId,
    core: Arc<ClientCore>,
}

impl Lobby {
    pub(crate) fn new(id: EntityId, core: Arc<ClientCore>) -> Self {
        core.cache.touch_lobby(id);
        Self { id, core }
    }

    fn local(&self) -> EntityId {
        self.core.local_user()
    }

    fn read<R>(&self, f: impl FnOnce(&LobbyState) -> R) -> Option<R> {
        self.core.cache.with_lobby(self.id, f)
    }

    pub fn id(&self) -> EntityId {
        self.id
    }

    /// Copy of the cached record.
    pub fn state(&self) -> LobbyState {
        self.core
            .cache
            .lobby(self.id)
            .unwrap_or_else(|| LobbyState::new(self.id))
    }

    pub fn membership(&self) -> Membership {
        self.read(|l| l.membership).unwrap_or_default()
    }

    pub fn is_joined(&self) -> bool {
        self.membership() == Membership::Joined
    }

    /// Why the local user last stopped being a member.
    pub fn last_departure(&self) -> Option<Departure> {
        self.read(|l| l.last_departure).flatten()
    }

    pub fn member_count(&self) -> usize {
        self.read(|l| l.member_count()).unwrap_or(0)
    }

    pub fn member_ids(&self) -> Vec<EntityId> {
        self.read(|l| l.members.clone()).unwrap_or_default()
    }

    pub fn members(&self) -> Vec<Friend> {
        self.member_ids()
            .into_iter()
            .map(|id| Friend::new(id, self.core.clone()))
            .collect()
    }

    /// All lobby-level metadata.
    pub fn data(&self) -> Vec<(String, String)> {
        self.read(|l| {
            l.metadata
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        })
        .unwrap_or_default()
    }

    pub fn get_data(&self, key: &str) -> Option<String> {
        self.read(|l| l.metadata.get(key).cloned()).flatten()
    }

    pub fn get_member_data(&self, member: EntityId, key: &str) -> Option<String> {
        self.read(|l| l.member_metadata.get(&member).and_then(|d| d.get(key).cloned()))
            .flatten()
    }

    pub fn max_members(&self) -> u32 {
        self.read(|l| l.max_members).unwrap_or(0)
    }

    pub fn owner_id(&self) -> Option<EntityId> {
        self.read(|l| l.owner).flatten()
    }

    pub fn owner(&self) -> Option<Friend> {
        self.owner_id().map(|id| Friend::new(id, self.core.clone()))
    }

    pub fn is_owned_by(&self, id: EntityId) -> bool {
        self.owner_id() == Some(id)
    }

    pub fn visibility(&self) -> Visibility {
        self.read(|l| l.visibility).unwrap_or_default()
    }

    pub fn is_joinable(&self) -> bool {
        self.read(|l| l.joinable).unwrap_or(false)
    }

    /// Game server set for this lobby, if any. Never goes to the backend.
    pub fn game_server(&self) -> Option<GameServer> {
        self.read(|l| l.game_server).flatten()
    }

    // ==================== Membership ====================

    /// Join the lobby and wait for the backend's answer.
    ///
    /// Only `RoomEnter::Success` means joined. Nothing is retried.
    pub async fn join(&self) -> Result<RoomEnter> {
        if self.is_joined() {
            debug!(lobby = %self.id, "join on a lobby that is already joined");
            return Ok(RoomEnter::Success);
        }

        self.core.dispatcher.apply_local(self.id, |l| {
            if l.membership == Membership::NotJoined {
                l.membership = Membership::Joining;
            }
        });

        let call = match self.core.correlator.issue(Request::JoinLobby { lobby: self.id }) {
            Ok(call) => call,
            Err(e) => {
                self.abandon_join();
                return match e {
                    Error::NotConnected => Ok(RoomEnter::NotConnected),
                    other => Err(other),
                };
            }
        };

        match call.wait().await {
            CallResult::Completed(Completion::RoomEnter { response, .. }) => Ok(response),
            CallResult::Completed(other) => {
                self.abandon_join();
                Err(Error::malformed(format!(
                    "join answered with {:?}",
                    other.kind()
                )))
            }
            CallResult::Cancelled => {
                self.abandon_join();
                Ok(RoomEnter::Cancelled)
            }
            CallResult::Malformed(reason) => {
                self.abandon_join();
                Err(Error::Malformed(reason))
            }
        }
    }

    fn abandon_join(&self) {
        self.core.dispatcher.apply_local(self.id, |l| {
            if l.membership == Membership::Joining {
                l.membership = Membership::NotJoined;
            }
        });
    }

    /// Leave the lobby. Takes effect locally at once; the backend is told in
    /// the background and other members learn about it through their own
    /// push updates. Leaving a lobby that is not joined does nothing.
    pub fn leave(&self) {
        if self.membership() == Membership::NotJoined {
            debug!(lobby = %self.id, "leave on a lobby that is not joined");
            return;
        }

        let local = self.local();
        let id = self.id;
        let was_joined = self.core.dispatcher.serialized(|cache, correlator| {
            let previous = cache.update_lobby(id, |l| {
                let previous = l.membership;
                if previous != Membership::NotJoined {
                    l.membership = Membership::Leaving;
                    l.remove_member(local);
                }
                previous
            });
            if previous == Membership::Joining {
                correlator.cancel(id, RequestKind::Join);
            }
            previous != Membership::NotJoined
        });
        if !was_joined {
            return;
        }

        if !(self.core.is_connected() && self.core.backend.dispatch(Command::LeaveLobby { lobby: id })) {
            debug!(lobby = %id, "leave could not be sent, left locally");
        }

        self.core.dispatcher.apply_local(id, |l| {
            if l.membership == Membership::Leaving {
                l.membership = Membership::NotJoined;
                l.last_departure = Some(Departure::Left);
            }
        });
    }

    /// Ask the backend for this lobby's metadata.
    ///
    /// Only for lobbies the local user is not in; joined lobbies are kept
    /// current by membership pushes, so calling this on one is refused.
    /// False if not connected, refused, or the lobby does not exist.
    pub async fn refresh(&self) -> bool {
        if !self.core.is_connected() {
            return false;
        }
        if matches!(self.membership(), Membership::Joined | Membership::Joining) {
            warn!(lobby = %self.id, "refresh on a joined lobby ignored");
            return false;
        }

        let call = match self.core.correlator.issue(Request::LobbyData { lobby: self.id }) {
            Ok(call) => call,
            Err(e) => {
                debug!(lobby = %self.id, error = %e, "refresh not issued");
                return false;
            }
        };

        match call.wait().await {
            CallResult::Completed(Completion::LobbyData { success, .. }) => success,
            _ => false,
        }
    }

    /// Invite a user. True if the invite went out, whether or not it is
    /// answered.
    pub fn invite_friend(&self, user: EntityId) -> bool {
        self.core.is_connected()
            && self.core.backend.dispatch(Command::InviteToLobby {
                lobby: self.id,
                user,
            })
    }

    // ==================== Owner-only ====================

    fn is_local_owner(&self) -> bool {
        let local = self.local();
        self.read(|l| l.membership == Membership::Joined && l.owner == Some(local))
            .unwrap_or(false)
    }

    fn owner_mutation(&self, op: &str, command: Command, apply: impl FnOnce(&mut LobbyState)) -> bool {
        if !self.core.is_connected() {
            debug!(lobby = %self.id, op, "not connected");
            return false;
        }
        if !self.is_local_owner() {
            debug!(lobby = %self.id, op, "unauthorized: not the lobby owner");
            return false;
        }
        if !self.core.backend.dispatch(command) {
            return false;
        }
        // Ownership may have moved while the command was out.
        let local = self.local();
        let applied = self.core.dispatcher.apply_local(self.id, |l| {
            let still_owner = l.membership == Membership::Joined && l.owner == Some(local);
            if still_owner {
                apply(l);
            }
            still_owner
        });
        if !applied {
            debug!(lobby = %self.id, op, "ownership lost before the change was applied");
        }
        applied
    }

    pub fn set_data(&self, key: &str, value: &str) -> bool {
        let command = Command::SetLobbyData {
            lobby: self.id,
            key: key.to_string(),
            value: value.to_string(),
        };
        self.owner_mutation("set_data", command, |l| {
            l.metadata.insert(key.to_string(), value.to_string());
        })
    }

    pub fn delete_data(&self, key: &str) -> bool {
        let command = Command::DeleteLobbyData {
            lobby: self.id,
            key: key.to_string(),
        };
        self.owner_mutation("delete_data", command, |l| {
            l.metadata.remove(key);
        })
    }

    fn set_visibility(&self, visibility: Visibility) -> bool {
        let command = Command::SetVisibility {
            lobby: self.id,
            visibility,
        };
        self.owner_mutation("set_visibility", command, |l| l.visibility = visibility)
    }

    pub fn set_public(&self) -> bool {
        self.set_visibility(Visibility::Public)
    }

    pub fn set_private(&self) -> bool {
        self.set_visibility(Visibility::Private)
    }

    pub fn set_invisible(&self) -> bool {
        self.set_visibility(Visibility::Invisible)
    }

    pub fn set_friends_only(&self) -> bool {
        self.set_visibility(Visibility::FriendsOnly)
    }

    pub fn set_joinable(&self, joinable: bool) -> bool {
        let command = Command::SetJoinable {
            lobby: self.id,
            joinable,
        };
        self.owner_mutation("set_joinable", command, |l| l.joinable = joinable)
    }

    /// Between 1 and [`MAX_LOBBY_MEMBERS`].
    pub fn set_max_members(&self, max_members: u32) -> bool {
        if max_members == 0 || max_members > MAX_LOBBY_MEMBERS {
            debug!(lobby = %self.id, max_members, "max members out of range");
            return false;
        }
        let command = Command::SetMaxMembers {
            lobby: self.id,
            max_members,
        };
        self.owner_mutation("set_max_members", command, |l| l.max_members = max_members)
    }

    /// Hand ownership to another member.
    pub fn set_owner(&self, owner: EntityId) -> bool {
        if !self.read(|l| l.is_member(owner)).unwrap_or(false) {
            debug!(lobby = %self.id, %owner, "new owner is not a member");
            return false;
        }
        let command = Command::SetOwner {
            lobby: self.id,
            owner,
        };
        self.owner_mutation("set_owner", command, |l| l.set_owner(owner))
    }

    pub fn set_game_server(&self, server: GameServer) -> bool {
        let command = Command::SetGameServer {
            lobby: self.id,
            server,
        };
        self.owner_mutation("set_game_server", command, |l| l.game_server = Some(server))
    }

    // ==================== Self-only ====================

    /// Set the local user's member data.
    pub fn set_member_data(&self, key: &str, value: &str) -> bool {
        self.set_member_data_for(self.local(), key, value)
    }

    /// Set member data for `member`, which must be the local user.
    pub fn set_member_data_for(&self, member: EntityId, key: &str, value: &str) -> bool {
        let local = self.local();
        if member != local {
            debug!(lobby = %self.id, %member, "unauthorized: member data is self-only");
            return false;
        }
        if !self.core.is_connected() || !self.is_joined() {
            return false;
        }
        let command = Command::SetMemberData {
            lobby: self.id,
            key: key.to_string(),
            value: value.to_string(),
        };
        if !self.core.backend.dispatch(command) {
            return false;
        }
        let applied = self.core.dispatcher.apply_local(self.id, |l| {
            let still_member = l.membership == Membership::Joined && l.is_member(local);
            if still_member {
                l.member_metadata
                    .entry(local)
                    .or_default()
                    .insert(key.to_string(), value.to_string());
            }
            still_member
        });
        if !applied {
            debug!(lobby = %self.id, "left the lobby before member data was applied");
        }
        applied
    }

    // ==================== Chat ====================

    pub fn send_chat_string(&self, message: &str) -> bool {
        self.send_chat_bytes(message.as_bytes())
    }

    pub fn send_chat_bytes(&self, data: &[u8]) -> bool {
        self.core.is_connected()
            && self.is_joined()
            && self.core.backend.dispatch(Command::SendChat {
                lobby: self.id,
                data: data.to_vec(),
            })
    }

    /// Cancel this lobby's outstanding requests; their callers see a
    /// cancelled result.
    pub fn teardown(&self) -> usize {
        self.core.teardown(self.id)
    }
}

impl fmt::Debug for Lobby {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lobby")
            .field("id", &self.id)
            .field("membership", &self.membership())
            .field("members", &self.member_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Event, LobbyChange, LobbyUpdate};
    use crate::client::SocialClient;
    use crate::testing::{client, settle, until, StubBackend, ME};

    fn snapshot(owner: Option<u64>, members: &[u64]) -> LobbySnapshot {
        LobbySnapshot {
            owner: owner.map(EntityId),
            max_members: 10,
            members: members.iter().copied().map(EntityId).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_first_member_becomes_owner() {
        let mut lobby = LobbyState::new(EntityId(100));
        assert!(lobby.add_member(EntityId(1)));
        assert!(!lobby.add_member(EntityId(1)));
        assert!(lobby.add_member(EntityId(2)));
        assert_eq!(lobby.owner, Some(EntityId(1)));
        assert_eq!(lobby.member_count(), 2);
        assert!(lobby.owner_invariant_holds());
    }

    #[test]
    fn test_owner_departure_promotes_longest_member() {
        let mut lobby = LobbyState::new(EntityId(100));
        for id in [1, 2, 3] {
            lobby.add_member(EntityId(id));
        }
        lobby
            .member_metadata
            .insert(EntityId(1), HashMap::from([("ready".to_string(), "1".to_string())]));

        assert!(lobby.remove_member(EntityId(1)));
        assert_eq!(lobby.owner, Some(EntityId(2)));
        assert!(!lobby.member_metadata.contains_key(&EntityId(1)));
        assert!(lobby.owner_invariant_holds());

        lobby.remove_member(EntityId(2));
        lobby.remove_member(EntityId(3));
        assert_eq!(lobby.owner, None);
        assert!(lobby.owner_invariant_holds());
    }

    #[test]
    fn test_snapshot_repairs_missing_owner() {
        let mut lobby = LobbyState::new(EntityId(100));
        assert!(!lobby.apply_snapshot(&snapshot(Some(1), &[1, 2])));
        assert!(lobby.populated);

        assert!(lobby.apply_snapshot(&snapshot(Some(9), &[1, 2])));
        assert!(lobby.is_member(EntityId(9)));
        assert!(lobby.owner_invariant_holds());

        assert!(lobby.apply_snapshot(&snapshot(None, &[4, 5])));
        assert_eq!(lobby.owner, Some(EntityId(4)));
    }

    #[test]
    fn test_snapshot_clamps_max_members() {
        let mut lobby = LobbyState::new(EntityId(100));
        let mut snap = snapshot(None, &[]);
        snap.max_members = 1000;
        lobby.apply_snapshot(&snap);
        assert_eq!(lobby.max_members, MAX_LOBBY_MEMBERS);
    }

    #[test]
    fn test_accept_rejects_older() {
        let mut lobby = LobbyState::new(EntityId(100));
        assert!(lobby.accept(5));
        assert!(lobby.accept(5));
        assert!(!lobby.accept(4));
        assert!(lobby.accept(6));
    }

    const LOBBY: EntityId = EntityId(109775241000000001);

    /// Join `LOBBY` as the local user, the backend reporting `others` as
    /// members already there (first one owns it).
    async fn joined(client: &SocialClient, backend: &StubBackend, others: &[u64]) -> Lobby {
        let lobby = client.lobby(LOBBY);
        let issued = backend.requests().len();
        let waiting = tokio::spawn({
            let lobby = lobby.clone();
            async move { lobby.join().await }
        });
        until(|| backend.requests().len() == issued + 1).await;
        assert_eq!(lobby.membership(), Membership::Joining);

        let owner = others.first().copied().map(EntityId).unwrap_or(ME);
        backend.complete_last(Completion::RoomEnter {
            lobby: LOBBY,
            response: RoomEnter::Success,
            snapshot: Some(LobbySnapshot {
                owner: Some(owner),
                max_members: 10,
                joinable: true,
                members: others.iter().copied().map(EntityId).collect(),
                ..Default::default()
            }),
        });
        assert_eq!(waiting.await.unwrap().unwrap(), RoomEnter::Success);
        lobby
    }

    #[tokio::test]
    async fn test_join_adds_local_user() {
        let (client, backend) = client();
        let lobby = joined(&client, &backend, &[2, 3, 4]).await;

        assert!(lobby.is_joined());
        assert_eq!(lobby.member_count(), 4);
        assert!(lobby.member_ids().contains(&ME));
        assert_eq!(lobby.max_members(), 10);
        assert!(lobby.is_owned_by(EntityId(2)));
        assert!(client.friend(ME).is_in(LOBBY));

        // Already joined: no second request.
        assert_eq!(lobby.join().await.unwrap(), RoomEnter::Success);
        assert_eq!(backend.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_join_failure_is_reported() {
        let (client, backend) = client();
        let lobby = client.lobby(LOBBY);
        let waiting = tokio::spawn({
            let lobby = lobby.clone();
            async move { lobby.join().await }
        });
        until(|| backend.requests().len() == 1).await;
        backend.complete_last(Completion::RoomEnter {
            lobby: LOBBY,
            response: RoomEnter::Full,
            snapshot: None,
        });

        assert_eq!(waiting.await.unwrap().unwrap(), RoomEnter::Full);
        assert_eq!(lobby.membership(), Membership::NotJoined);
        assert_eq!(lobby.member_count(), 0);
    }

    #[tokio::test]
    async fn test_join_not_connected() {
        let (client, backend) = client();
        client.session().close();
        let lobby = client.lobby(LOBBY);
        assert_eq!(lobby.join().await.unwrap(), RoomEnter::NotConnected);
        assert_eq!(lobby.membership(), Membership::NotJoined);
        assert!(backend.requests().is_empty());
    }

    #[tokio::test]
    async fn test_leave_is_local_and_idempotent() {
        let (client, backend) = client();
        let lobby = joined(&client, &backend, &[2]).await;

        lobby.leave();
        assert_eq!(lobby.membership(), Membership::NotJoined);
        assert_eq!(lobby.last_departure(), Some(Departure::Left));
        assert!(!lobby.member_ids().contains(&ME));
        assert_eq!(backend.commands(), vec![Command::LeaveLobby { lobby: LOBBY }]);

        let before = lobby.state();
        lobby.leave();
        assert_eq!(lobby.state(), before);
        assert_eq!(backend.commands().len(), 1);
    }

    #[tokio::test]
    async fn test_leave_while_joining_cancels_join() {
        let (client, backend) = client();
        let lobby = client.lobby(LOBBY);
        let waiting = tokio::spawn({
            let lobby = lobby.clone();
            async move { lobby.join().await }
        });
        until(|| backend.requests().len() == 1).await;

        lobby.leave();
        assert_eq!(waiting.await.unwrap().unwrap(), RoomEnter::Cancelled);
        assert_eq!(lobby.membership(), Membership::NotJoined);

        // A late success must not resurrect the membership.
        backend.complete_last(Completion::RoomEnter {
            lobby: LOBBY,
            response: RoomEnter::Success,
            snapshot: None,
        });
        settle(&client, 1).await;
        assert_eq!(lobby.membership(), Membership::NotJoined);
    }

    #[tokio::test]
    async fn test_owner_can_mutate() {
        let (client, backend) = client();
        let lobby = joined(&client, &backend, &[]).await;
        assert!(lobby.is_owned_by(ME));

        assert!(lobby.set_data("mode", "ctf"));
        assert_eq!(lobby.get_data("mode").as_deref(), Some("ctf"));
        assert!(lobby.set_friends_only());
        assert_eq!(lobby.visibility(), Visibility::FriendsOnly);
        assert!(lobby.set_joinable(false));
        assert!(!lobby.is_joinable());
        assert!(lobby.set_max_members(4));
        assert_eq!(lobby.max_members(), 4);
        assert!(!lobby.set_max_members(0));
        assert!(!lobby.set_max_members(MAX_LOBBY_MEMBERS + 1));
        assert!(lobby.delete_data("mode"));
        assert_eq!(lobby.get_data("mode"), None);

        let server = GameServer::from_id(EntityId(90071992547409920));
        assert!(lobby.set_game_server(server));
        assert_eq!(lobby.game_server(), Some(server));
    }

    #[tokio::test]
    async fn test_non_owner_mutations_rejected() {
        let (client, backend) = client();
        let lobby = joined(&client, &backend, &[2]).await;
        let before = lobby.state();

        assert!(!lobby.set_public());
        assert!(!lobby.set_data("mode", "ctf"));
        assert!(!lobby.delete_data("mode"));
        assert!(!lobby.set_joinable(false));
        assert!(!lobby.set_max_members(2));
        assert!(!lobby.set_owner(ME));

        assert_eq!(lobby.state(), before);
        assert!(backend.commands().is_empty());
    }

    #[tokio::test]
    async fn test_set_owner_requires_member() {
        let (client, backend) = client();
        let lobby = joined(&client, &backend, &[]).await;
        client.event_sink().push_lobby(LobbyUpdate::new(
            LOBBY,
            LobbyChange::MemberJoined { member: EntityId(5) },
        ));
        settle(&client, 2).await;

        assert!(!lobby.set_owner(EntityId(6)));
        assert!(lobby.set_owner(EntityId(5)));
        assert!(lobby.is_owned_by(EntityId(5)));
        assert!(!lobby.set_data("mode", "ctf"));
    }

    #[tokio::test]
    async fn test_member_data_is_self_only() {
        let (client, backend) = client();
        let lobby = joined(&client, &backend, &[2]).await;

        assert!(!lobby.set_member_data_for(EntityId(2), "ready", "1"));
        assert_eq!(lobby.get_member_data(EntityId(2), "ready"), None);

        assert!(lobby.set_member_data("ready", "1"));
        assert_eq!(lobby.get_member_data(ME, "ready").as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn test_owner_change_during_dispatch_blocks_mutation() {
        let (client, backend) = client();
        let lobby = joined(&client, &backend, &[]).await;
        client.event_sink().push_lobby(LobbyUpdate::new(
            LOBBY,
            LobbyChange::MemberJoined { member: EntityId(5) },
        ));
        settle(&client, 2).await;
        assert!(lobby.is_owned_by(ME));

        // Ownership moves after the owner check but before the local write.
        let dispatcher = client.dispatcher();
        backend.on_dispatch(move |_| {
            dispatcher.apply(Event::Lobby(LobbyUpdate::new(
                LOBBY,
                LobbyChange::OwnerChanged { owner: EntityId(5) },
            )));
        });
        let before = lobby.visibility();

        assert!(!lobby.set_friends_only());
        assert_eq!(lobby.visibility(), before);
        assert!(lobby.is_owned_by(EntityId(5)));
        assert!(lobby.state().owner_invariant_holds());
    }

    #[tokio::test]
    async fn test_kick_during_dispatch_leaves_no_member_data() {
        let (client, backend) = client();
        let lobby = joined(&client, &backend, &[2]).await;

        let dispatcher = client.dispatcher();
        backend.on_dispatch(move |_| {
            dispatcher.apply(Event::Lobby(LobbyUpdate::new(
                LOBBY,
                LobbyChange::MemberLeft {
                    member: ME,
                    reason: Departure::Kicked,
                },
            )));
        });

        assert!(!lobby.set_member_data("ready", "1"));
        assert_eq!(lobby.membership(), Membership::NotJoined);
        assert_eq!(lobby.last_departure(), Some(Departure::Kicked));
        assert_eq!(lobby.get_member_data(ME, "ready"), None);
        assert!(!lobby.state().member_metadata.contains_key(&ME));
    }

    #[tokio::test]
    async fn test_teardown_cancels_pending_join() {
        let (client, backend) = client();
        let lobby = client.lobby(LOBBY);
        let waiting = tokio::spawn({
            let lobby = lobby.clone();
            async move { lobby.join().await }
        });
        until(|| backend.requests().len() == 1).await;

        assert_eq!(lobby.teardown(), 1);
        assert_eq!(waiting.await.unwrap().unwrap(), RoomEnter::Cancelled);
        assert_eq!(lobby.membership(), Membership::NotJoined);
        assert_eq!(lobby.teardown(), 0);
        assert_eq!(client.correlator().pending_count(), 0);
    }

    #[tokio::test]
    async fn test_refresh_rules() {
        let (client, backend) = client();
        let other = client.lobby(EntityId(42));

        client.session().close();
        assert!(!other.refresh().await);
        client.session().open();

        let waiting = tokio::spawn({
            let other = other.clone();
            async move { other.refresh().await }
        });
        until(|| backend.requests().len() == 1).await;
        backend.complete_last(Completion::LobbyData {
            lobby: EntityId(42),
            success: true,
            snapshot: Some(LobbySnapshot {
                owner: Some(EntityId(8)),
                members: vec![EntityId(8)],
                metadata: HashMap::from([("map".to_string(), "de_dust".to_string())]),
                ..Default::default()
            }),
        });
        assert!(waiting.await.unwrap());
        assert_eq!(other.get_data("map").as_deref(), Some("de_dust"));

        let lobby = joined(&client, &backend, &[2]).await;
        assert!(!lobby.refresh().await);
        assert_eq!(backend.requests().len(), 2);
    }

    #[tokio::test]
    async fn test_chat_requires_membership() {
        let (client, backend) = client();
        let lobby = client.lobby(LOBBY);
        assert!(!lobby.send_chat_string("gg"));

        let lobby = joined(&client, &backend, &[2]).await;
        assert!(lobby.send_chat_string("gg"));
        assert!(lobby.invite_friend(EntityId(3)));

        backend.refuse_commands(true);
        assert!(!lobby.send_chat_bytes(b"gg"));
    }
}
