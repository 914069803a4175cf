//! The remote social backend, seen from the client.
//!
//! The backend is a black box with two channels. Requests are fire-and-forget:
//! `submit` hands back a [`CallHandle`] and the matching [`Completion`] shows up
//! later as an [`Event`] on the [`EventSink`]. Push notifications arrive on the
//! same sink without any request. One-way [`Command`]s have no completion.
//!
//! Backends must deliver events for a single entity in order. Nothing is
//! assumed about ordering across entities.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::Result;
use crate::types::{
    Departure, EntityId, FriendProfile, GameServer, PresenceState, RelationshipState, RoomEnter,
    UserStats, Visibility,
};

/// Opaque identifier the backend assigns to an outbound call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallHandle(pub u64);

impl fmt::Display for CallHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

// ============================================================================
// Requests
// ============================================================================

/// Kind of correlated request. At most one per (entity, kind) is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    Info,
    UserStats,
    Join,
    Refresh,
}

/// Request that resolves through a later [`Completion`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum Request {
    FriendInfo { user: EntityId, name_only: bool },
    UserStats { user: EntityId },
    JoinLobby { lobby: EntityId },
    LobbyData { lobby: EntityId },
}

impl Request {
    pub fn kind(&self) -> RequestKind {
        match self {
            Self::FriendInfo { .. } => RequestKind::Info,
            Self::UserStats { .. } => RequestKind::UserStats,
            Self::JoinLobby { .. } => RequestKind::Join,
            Self::LobbyData { .. } => RequestKind::Refresh,
        }
    }

    pub fn entity(&self) -> EntityId {
        match self {
            Self::FriendInfo { user, .. } | Self::UserStats { user } => *user,
            Self::JoinLobby { lobby } | Self::LobbyData { lobby } => *lobby,
        }
    }
}

/// One-way call. The backend only reports whether it could be dispatched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum Command {
    SendMessage { to: EntityId, text: String },
    InviteToGame { to: EntityId, connect: String },
    LeaveLobby { lobby: EntityId },
    InviteToLobby { lobby: EntityId, user: EntityId },
    SetLobbyData { lobby: EntityId, key: String, value: String },
    DeleteLobbyData { lobby: EntityId, key: String },
    SetMemberData { lobby: EntityId, key: String, value: String },
    SendChat { lobby: EntityId, data: Vec<u8> },
    SetVisibility { lobby: EntityId, visibility: Visibility },
    SetJoinable { lobby: EntityId, joinable: bool },
    SetMaxMembers { lobby: EntityId, max_members: u32 },
    SetOwner { lobby: EntityId, owner: EntityId },
    SetGameServer { lobby: EntityId, server: GameServer },
}

// ============================================================================
// Completions
// ============================================================================

/// Everything the backend knows about a lobby at one point in time.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LobbySnapshot {
    pub owner: Option<EntityId>,
    pub max_members: u32,
    pub visibility: Visibility,
    pub joinable: bool,
    pub metadata: HashMap<String, String>,
    pub members: Vec<EntityId>,
    pub member_metadata: HashMap<EntityId, HashMap<String, String>>,
    pub game_server: Option<GameServer>,
}

/// Result payload of a correlated request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum Completion {
    /// `profile` is `None` when the backend has nothing for this user.
    FriendInfo {
        user: EntityId,
        profile: Option<FriendProfile>,
        #[serde(default)]
        rich_presence: Option<HashMap<String, String>>,
    },
    UserStats {
        user: EntityId,
        success: bool,
        stats: Option<UserStats>,
    },
    RoomEnter {
        lobby: EntityId,
        response: RoomEnter,
        snapshot: Option<LobbySnapshot>,
    },
    LobbyData {
        lobby: EntityId,
        success: bool,
        snapshot: Option<LobbySnapshot>,
    },
}

impl Completion {
    pub fn kind(&self) -> RequestKind {
        match self {
            Self::FriendInfo { .. } => RequestKind::Info,
            Self::UserStats { .. } => RequestKind::UserStats,
            Self::RoomEnter { .. } => RequestKind::Join,
            Self::LobbyData { .. } => RequestKind::Refresh,
        }
    }

    pub fn entity(&self) -> EntityId {
        match self {
            Self::FriendInfo { user, .. } | Self::UserStats { user, .. } => *user,
            Self::RoomEnter { lobby, .. } | Self::LobbyData { lobby, .. } => *lobby,
        }
    }
}

// ============================================================================
// Push notifications
// ============================================================================

/// Unsolicited change to a user's persona.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonaUpdate {
    pub user: EntityId,
    /// Backend sequence number, if the backend supplies one.
    #[serde(default)]
    pub tick: Option<u64>,
    pub change: PersonaChange,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum PersonaChange {
    Presence { state: PresenceState },
    Relationship { state: RelationshipState },
    Profile { profile: FriendProfile },
    RichPresence { values: HashMap<String, String> },
}

/// Unsolicited change to a lobby.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LobbyUpdate {
    pub lobby: EntityId,
    /// Backend sequence number, if the backend supplies one.
    #[serde(default)]
    pub tick: Option<u64>,
    pub change: LobbyChange,
}

impl LobbyUpdate {
    pub fn new(lobby: EntityId, change: LobbyChange) -> Self {
        Self {
            lobby,
            tick: None,
            change,
        }
    }

    pub fn with_tick(mut self, tick: u64) -> Self {
        self.tick = Some(tick);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum LobbyChange {
    MemberJoined { member: EntityId },
    MemberLeft { member: EntityId, reason: Departure },
    /// `value: None` deletes the key.
    DataChanged { key: String, value: Option<String> },
    MemberDataChanged { member: EntityId, key: String, value: Option<String> },
    GameServerSet { server: GameServer },
    OwnerChanged { owner: EntityId },
    Snapshot { snapshot: LobbySnapshot },
}

// ============================================================================
// Event delivery
// ============================================================================

/// Anything the backend delivers to the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum Event {
    Completed {
        handle: CallHandle,
        #[serde(default)]
        tick: Option<u64>,
        completion: Completion,
    },
    Persona(PersonaUpdate),
    Lobby(LobbyUpdate),
}

/// Where the backend delivers events. Cheap to clone.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<Event>,
}

impl EventSink {
    pub(crate) fn channel() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queue an event for the dispatch task. False once the client shut down.
    pub fn deliver(&self, event: Event) -> bool {
        self.tx.send(event).is_ok()
    }

    pub fn complete(&self, handle: CallHandle, completion: Completion) -> bool {
        self.deliver(Event::Completed {
            handle,
            tick: None,
            completion,
        })
    }

    pub fn push_lobby(&self, update: LobbyUpdate) -> bool {
        self.deliver(Event::Lobby(update))
    }

    pub fn push_persona(&self, update: PersonaUpdate) -> bool {
        self.deliver(Event::Persona(update))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// The native social backend.
///
/// Implementations must never deliver into the sink synchronously from
/// within `submit` in a way that waits on the client; queueing is fine.
pub trait Backend: Send + Sync + 'static {
    /// Called once by the client builder with the sink to deliver into.
    fn attach(&self, sink: EventSink);

    /// Issue a correlated request. The returned handle must be unique.
    fn submit(&self, request: &Request) -> Result<CallHandle>;

    /// Issue a one-way command. False if it could not be dispatched.
    fn dispatch(&self, command: Command) -> bool;
}
