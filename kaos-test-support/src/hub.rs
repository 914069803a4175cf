//! In-process social service.
//!
//! `LoopbackHub` plays the remote backend for any number of clients. It keeps
//! the authoritative user and lobby records, answers requests at once
//! through each client's event sink, and fans lobby changes out to every
//! member as push updates. All deliveries are stamped with one hub-wide tick
//! and made under the hub lock, so every (receiver, entity) stream is in
//! order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use kaos_social::{
    Backend, CallHandle, Command, Completion, Departure, EntityId, Error, Event, EventSink,
    FriendProfile, LobbyChange, LobbySnapshot, LobbyUpdate, PersonaChange, PersonaUpdate,
    PresenceState, Request, RequestKind, RoomEnter, Session, SocialClient, UserStats,
    Visibility,
};
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::chaos::{ChaosEvent, ChaosMonkey};

/// App id every hub session runs under.
pub const APP_ID: u32 = 480;

/// One event handed to a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub receiver: EntityId,
    pub entity: EntityId,
    pub tick: u64,
}

#[derive(Default)]
struct HubUser {
    sink: Option<EventSink>,
    profile: Option<FriendProfile>,
    rich_presence: HashMap<String, String>,
    stats: Option<UserStats>,
}

#[derive(Default)]
struct HubState {
    users: HashMap<EntityId, HubUser>,
    lobbies: HashMap<EntityId, LobbySnapshot>,
    tick: u64,
    requests: Vec<(EntityId, Request)>,
    commands: Vec<(EntityId, Command)>,
    deliveries: Vec<Delivery>,
    chat: Vec<(EntityId, EntityId, Vec<u8>)>,
}

impl HubState {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn members(&self, lobby: EntityId) -> Vec<EntityId> {
        self.lobbies
            .get(&lobby)
            .map(|l| l.members.clone())
            .unwrap_or_default()
    }

    fn is_owner(&self, lobby: EntityId, user: EntityId) -> bool {
        self.lobbies
            .get(&lobby)
            .is_some_and(|l| l.owner == Some(user))
    }

    fn is_member(&self, lobby: EntityId, user: EntityId) -> bool {
        self.lobbies
            .get(&lobby)
            .is_some_and(|l| l.members.contains(&user))
    }

    fn deliver(&mut self, receiver: EntityId, entity: EntityId, tick: u64, event: Event) {
        let Some(sink) = self.users.get(&receiver).and_then(|u| u.sink.clone()) else {
            return;
        };
        if sink.deliver(event) {
            self.deliveries.push(Delivery {
                receiver,
                entity,
                tick,
            });
        }
    }

    /// Push one lobby change to `receivers` under a single tick.
    fn push_lobby(&mut self, lobby: EntityId, receivers: &[EntityId], change: LobbyChange) {
        let tick = self.next_tick();
        trace!(%lobby, tick, ?change, "lobby push");
        for receiver in receivers {
            let update = LobbyUpdate::new(lobby, change.clone()).with_tick(tick);
            self.deliver(*receiver, lobby, tick, Event::Lobby(update));
        }
    }

    fn push_persona(&mut self, user: EntityId, change: PersonaChange) {
        let tick = self.next_tick();
        let receivers: Vec<EntityId> = self.users.keys().copied().collect();
        for receiver in receivers {
            let update = PersonaUpdate {
                user,
                tick: Some(tick),
                change: change.clone(),
            };
            self.deliver(receiver, user, tick, Event::Persona(update));
        }
    }

    fn snapshot_to_members(&mut self, lobby: EntityId) {
        if let Some(snapshot) = self.lobbies.get(&lobby).cloned() {
            let members = snapshot.members.clone();
            self.push_lobby(lobby, &members, LobbyChange::Snapshot { snapshot });
        }
    }

    /// Remove a member. `notify_member` also tells the one removed.
    fn remove_member(&mut self, lobby: EntityId, member: EntityId, reason: Departure, notify_member: bool) -> bool {
        let Some(record) = self.lobbies.get_mut(&lobby) else {
            return false;
        };
        let Some(pos) = record.members.iter().position(|m| *m == member) else {
            return false;
        };
        record.members.remove(pos);
        record.member_metadata.remove(&member);
        let owner_left = record.owner == Some(member);
        if owner_left {
            record.owner = record.members.first().copied();
        }
        let new_owner = record.owner;
        let mut receivers = record.members.clone();

        if receivers.is_empty() {
            debug!(%lobby, "last member left, lobby closed");
            self.lobbies.remove(&lobby);
        }
        if notify_member {
            receivers.push(member);
        }
        self.push_lobby(lobby, &receivers, LobbyChange::MemberLeft { member, reason });

        if let (true, Some(owner)) = (owner_left, new_owner) {
            let members = self.members(lobby);
            self.push_lobby(lobby, &members, LobbyChange::OwnerChanged { owner });
        }
        true
    }
}

/// The in-process service. Share it with `Arc`.
#[derive(Default)]
pub struct LoopbackHub {
    state: Mutex<HubState>,
    next_handle: AtomicU64,
    chaos: Mutex<Option<ChaosMonkey>>,
    hold: AtomicBool,
    held: Mutex<Vec<(EntityId, Event)>>,
}

impl LoopbackHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Apply `monkey` to every completion from now on.
    pub fn with_chaos(self: Arc<Self>, monkey: ChaosMonkey) -> Arc<Self> {
        *self.chaos.lock() = Some(monkey);
        self
    }

    // ==================== Clients ====================

    /// Backend handle for one user.
    pub fn backend(self: &Arc<Self>, user: EntityId) -> Arc<HubBackend> {
        Arc::new(HubBackend {
            hub: self.clone(),
            user,
        })
    }

    /// Connected client for `user`. Must run inside a tokio runtime.
    pub fn connect(self: &Arc<Self>, user: EntityId) -> kaos_social::Result<SocialClient> {
        SocialClient::builder()
            .session(Arc::new(Session::connected(user, APP_ID)))
            .backend(self.backend(user))
            .build()
    }

    fn attach(&self, user: EntityId, sink: EventSink) {
        self.state.lock().users.entry(user).or_default().sink = Some(sink);
    }

    // ==================== Users ====================

    pub fn add_user(&self, user: EntityId, name: &str) {
        self.state.lock().users.entry(user).or_default().profile = Some(FriendProfile::named(name));
    }

    /// Replace a profile and push it to every client.
    pub fn set_profile(&self, user: EntityId, profile: FriendProfile) {
        let mut state = self.state.lock();
        state.users.entry(user).or_default().profile = Some(profile.clone());
        state.push_persona(user, PersonaChange::Profile { profile });
    }

    pub fn set_presence(&self, user: EntityId, presence: PresenceState) {
        self.state
            .lock()
            .push_persona(user, PersonaChange::Presence { state: presence });
    }

    pub fn set_rich_presence(&self, user: EntityId, key: &str, value: &str) {
        let mut state = self.state.lock();
        let values = {
            let record = state.users.entry(user).or_default();
            record.rich_presence.insert(key.to_string(), value.to_string());
            record.rich_presence.clone()
        };
        state.push_persona(user, PersonaChange::RichPresence { values });
    }

    pub fn set_stats(&self, user: EntityId, stats: UserStats) {
        self.state.lock().users.entry(user).or_default().stats = Some(stats);
    }

    // ==================== Lobbies ====================

    /// Open a public lobby owned by `owner`.
    pub fn create_lobby(&self, lobby: EntityId, owner: EntityId, max_members: u32) {
        self.state.lock().lobbies.insert(
            lobby,
            LobbySnapshot {
                owner: Some(owner),
                max_members,
                visibility: Visibility::Public,
                joinable: true,
                members: vec![owner],
                ..Default::default()
            },
        );
    }

    /// Add a member that has no client of its own.
    pub fn seat(&self, lobby: EntityId, member: EntityId) -> bool {
        let mut state = self.state.lock();
        let Some(record) = state.lobbies.get_mut(&lobby) else {
            return false;
        };
        if record.members.contains(&member) {
            return false;
        }
        record.members.push(member);
        let others: Vec<EntityId> = record.members.iter().copied().filter(|m| *m != member).collect();
        state.push_lobby(lobby, &others, LobbyChange::MemberJoined { member });
        true
    }

    pub fn kick(&self, lobby: EntityId, member: EntityId) -> bool {
        self.state
            .lock()
            .remove_member(lobby, member, Departure::Kicked, true)
    }

    /// Drop a member as if its connection died.
    pub fn disconnect(&self, lobby: EntityId, member: EntityId) -> bool {
        self.state
            .lock()
            .remove_member(lobby, member, Departure::Disconnected, false)
    }

    /// Set lobby data as the service, bypassing owner checks.
    pub fn set_lobby_data(&self, lobby: EntityId, key: &str, value: &str) {
        let mut state = self.state.lock();
        if let Some(record) = state.lobbies.get_mut(&lobby) {
            record.metadata.insert(key.to_string(), value.to_string());
            let members = record.members.clone();
            state.push_lobby(
                lobby,
                &members,
                LobbyChange::DataChanged {
                    key: key.to_string(),
                    value: Some(value.to_string()),
                },
            );
        }
    }

    pub fn lobby(&self, lobby: EntityId) -> Option<LobbySnapshot> {
        self.state.lock().lobbies.get(&lobby).cloned()
    }

    // ==================== Delivery control ====================

    /// While held, completions queue up instead of being delivered.
    pub fn hold_completions(&self, hold: bool) {
        self.hold.store(hold, Ordering::Release);
    }

    /// Deliver every held completion in order. Returns how many.
    pub fn release(&self) -> usize {
        let held: Vec<(EntityId, Event)> = std::mem::take(&mut *self.held.lock());
        let count = held.len();
        let mut state = self.state.lock();
        for (receiver, event) in held {
            self.deliver_completion(&mut state, receiver, event);
        }
        count
    }

    pub fn held(&self) -> usize {
        self.held.lock().len()
    }

    fn deliver_completion(&self, state: &mut HubState, receiver: EntityId, event: Event) {
        let Event::Completed {
            handle,
            tick,
            completion,
        } = event
        else {
            return;
        };
        let entity = completion.entity();
        let tick = tick.unwrap_or(state.tick);

        let decision = self
            .chaos
            .lock()
            .as_mut()
            .map_or(ChaosEvent::None, ChaosMonkey::decide);

        let event = Event::Completed {
            handle,
            tick: Some(tick),
            completion: completion.clone(),
        };
        state.deliver(receiver, entity, tick, event.clone());
        match decision {
            ChaosEvent::Duplicate => {
                debug!(%handle, "chaos: duplicate completion");
                state.deliver(receiver, entity, tick, event);
            }
            ChaosEvent::Unsolicited => {
                let stray = CallHandle(u64::MAX - self.next_handle.load(Ordering::Relaxed));
                debug!(%stray, "chaos: unsolicited completion");
                state.deliver(
                    receiver,
                    entity,
                    tick,
                    Event::Completed {
                        handle: stray,
                        tick: Some(tick),
                        completion,
                    },
                );
            }
            ChaosEvent::None => {}
        }
    }

    // ==================== Inspection ====================

    /// Requests submitted so far of one kind.
    pub fn requests_of(&self, kind: RequestKind) -> usize {
        self.state
            .lock()
            .requests
            .iter()
            .filter(|(_, r)| r.kind() == kind)
            .count()
    }

    pub fn commands(&self) -> Vec<(EntityId, Command)> {
        self.state.lock().commands.clone()
    }

    pub fn deliveries(&self) -> Vec<Delivery> {
        self.state.lock().deliveries.clone()
    }

    /// Chat lines sent to a lobby, oldest first.
    pub fn chat(&self, lobby: EntityId) -> Vec<(EntityId, Vec<u8>)> {
        self.state
            .lock()
            .chat
            .iter()
            .filter(|(l, _, _)| *l == lobby)
            .map(|(_, from, data)| (*from, data.clone()))
            .collect()
    }

    // ==================== Backend side ====================

    fn submit(&self, from: EntityId, request: &Request) -> kaos_social::Result<CallHandle> {
        let mut state = self.state.lock();
        if !state.users.get(&from).is_some_and(|u| u.sink.is_some()) {
            return Err(Error::backend(format!("{from} is not attached to the hub")));
        }
        let handle = CallHandle(self.next_handle.fetch_add(1, Ordering::Relaxed) + 1);
        state.requests.push((from, request.clone()));

        let completion = match request {
            Request::FriendInfo { user, name_only } => {
                let (profile, rich_presence) = match state.users.get(user) {
                    Some(record) => {
                        let profile = record.profile.clone().map(|p| {
                            if *name_only {
                                FriendProfile::named(p.name)
                            } else {
                                p
                            }
                        });
                        let rich = (!record.rich_presence.is_empty())
                            .then(|| record.rich_presence.clone());
                        (profile, rich)
                    }
                    None => (None, None),
                };
                Completion::FriendInfo {
                    user: *user,
                    profile,
                    rich_presence,
                }
            }
            Request::UserStats { user } => {
                let stats = state.users.get(user).and_then(|u| u.stats.clone());
                Completion::UserStats {
                    user: *user,
                    success: stats.is_some(),
                    stats,
                }
            }
            Request::JoinLobby { lobby } => {
                let (response, snapshot) = Self::join(&mut state, *lobby, from);
                Completion::RoomEnter {
                    lobby: *lobby,
                    response,
                    snapshot,
                }
            }
            Request::LobbyData { lobby } => {
                let snapshot = state.lobbies.get(lobby).cloned();
                Completion::LobbyData {
                    lobby: *lobby,
                    success: snapshot.is_some(),
                    snapshot,
                }
            }
        };

        let tick = state.next_tick();
        let event = Event::Completed {
            handle,
            tick: Some(tick),
            completion,
        };
        if self.hold.load(Ordering::Acquire) {
            self.held.lock().push((from, event));
        } else {
            self.deliver_completion(&mut state, from, event);
        }
        Ok(handle)
    }

    fn join(state: &mut HubState, lobby: EntityId, user: EntityId) -> (RoomEnter, Option<LobbySnapshot>) {
        let Some(record) = state.lobbies.get_mut(&lobby) else {
            return (RoomEnter::DoesntExist, None);
        };
        if record.members.contains(&user) {
            return (RoomEnter::Success, Some(record.clone()));
        }
        if !record.joinable {
            return (RoomEnter::NotAllowed, None);
        }
        if record.members.len() >= record.max_members as usize {
            return (RoomEnter::Full, None);
        }
        record.members.push(user);
        let snapshot = record.clone();
        let others: Vec<EntityId> = snapshot.members.iter().copied().filter(|m| *m != user).collect();
        state.push_lobby(lobby, &others, LobbyChange::MemberJoined { member: user });
        (RoomEnter::Success, Some(snapshot))
    }

    fn command(&self, from: EntityId, command: Command) -> bool {
        let mut state = self.state.lock();
        state.commands.push((from, command.clone()));

        match command {
            Command::SendMessage { .. } | Command::InviteToGame { .. } | Command::InviteToLobby { .. } => true,
            Command::LeaveLobby { lobby } => {
                state.remove_member(lobby, from, Departure::Left, false);
                true
            }
            Command::SetLobbyData { lobby, key, value } => {
                if !state.is_owner(lobby, from) {
                    return false;
                }
                if let Some(record) = state.lobbies.get_mut(&lobby) {
                    record.metadata.insert(key.clone(), value.clone());
                }
                let members = state.members(lobby);
                state.push_lobby(
                    lobby,
                    &members,
                    LobbyChange::DataChanged {
                        key,
                        value: Some(value),
                    },
                );
                true
            }
            Command::DeleteLobbyData { lobby, key } => {
                if !state.is_owner(lobby, from) {
                    return false;
                }
                if let Some(record) = state.lobbies.get_mut(&lobby) {
                    record.metadata.remove(&key);
                }
                let members = state.members(lobby);
                state.push_lobby(lobby, &members, LobbyChange::DataChanged { key, value: None });
                true
            }
            Command::SetMemberData { lobby, key, value } => {
                if !state.is_member(lobby, from) {
                    return false;
                }
                if let Some(record) = state.lobbies.get_mut(&lobby) {
                    record
                        .member_metadata
                        .entry(from)
                        .or_default()
                        .insert(key.clone(), value.clone());
                }
                let members = state.members(lobby);
                state.push_lobby(
                    lobby,
                    &members,
                    LobbyChange::MemberDataChanged {
                        member: from,
                        key,
                        value: Some(value),
                    },
                );
                true
            }
            Command::SendChat { lobby, data } => {
                if !state.is_member(lobby, from) {
                    return false;
                }
                state.chat.push((lobby, from, data));
                true
            }
            Command::SetVisibility { lobby, visibility } => {
                self.owner_update(&mut state, lobby, from, |l| l.visibility = visibility)
            }
            Command::SetJoinable { lobby, joinable } => {
                self.owner_update(&mut state, lobby, from, |l| l.joinable = joinable)
            }
            Command::SetMaxMembers { lobby, max_members } => {
                self.owner_update(&mut state, lobby, from, |l| l.max_members = max_members)
            }
            Command::SetOwner { lobby, owner } => {
                if !state.is_owner(lobby, from) || !state.is_member(lobby, owner) {
                    return false;
                }
                if let Some(record) = state.lobbies.get_mut(&lobby) {
                    record.owner = Some(owner);
                }
                let members = state.members(lobby);
                state.push_lobby(lobby, &members, LobbyChange::OwnerChanged { owner });
                true
            }
            Command::SetGameServer { lobby, server } => {
                if !state.is_owner(lobby, from) {
                    return false;
                }
                if let Some(record) = state.lobbies.get_mut(&lobby) {
                    record.game_server = Some(server);
                }
                let members = state.members(lobby);
                state.push_lobby(lobby, &members, LobbyChange::GameServerSet { server });
                true
            }
        }
    }

    /// Owner-only change announced with a full snapshot.
    fn owner_update(
        &self,
        state: &mut HubState,
        lobby: EntityId,
        from: EntityId,
        f: impl FnOnce(&mut LobbySnapshot),
    ) -> bool {
        if !state.is_owner(lobby, from) {
            return false;
        }
        if let Some(record) = state.lobbies.get_mut(&lobby) {
            f(record);
        }
        state.snapshot_to_members(lobby);
        true
    }
}

/// One user's connection to a [`LoopbackHub`].
pub struct HubBackend {
    hub: Arc<LoopbackHub>,
    user: EntityId,
}

impl HubBackend {
    pub fn user(&self) -> EntityId {
        self.user
    }
}

impl Backend for HubBackend {
    fn attach(&self, sink: EventSink) {
        self.hub.attach(self.user, sink);
    }

    fn submit(&self, request: &Request) -> kaos_social::Result<CallHandle> {
        self.hub.submit(self.user, request)
    }

    fn dispatch(&self, command: Command) -> bool {
        self.hub.command(self.user, command)
    }
}
