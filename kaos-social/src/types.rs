//! Type definitions shared by the friend and lobby views.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

// ============================================================================
// Identity
// ============================================================================

/// Opaque 64-bit identifier of a remote entity (a user or a lobby).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub u64);

impl EntityId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Zero is never handed out by the backend.
    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl From<u64> for EntityId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Presence and relationship
// ============================================================================

/// Persona state of a user. Exactly one value applies at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(i32)]
pub enum PresenceState {
    #[default]
    Offline = 0,
    Online = 1,
    Busy = 2,
    Away = 3,
    Snoozing = 4,
    LookingToTrade = 5,
    LookingToPlay = 6,
    Invisible = 7,
}

impl PresenceState {
    pub fn is_online(self) -> bool {
        self != Self::Offline
    }

    pub fn is_away(self) -> bool {
        self == Self::Away
    }

    pub fn is_busy(self) -> bool {
        self == Self::Busy
    }

    pub fn is_snoozing(self) -> bool {
        self == Self::Snoozing
    }
}

impl From<i32> for PresenceState {
    fn from(code: i32) -> Self {
        match code {
            1 => Self::Online,
            2 => Self::Busy,
            3 => Self::Away,
            4 => Self::Snoozing,
            5 => Self::LookingToTrade,
            6 => Self::LookingToPlay,
            7 => Self::Invisible,
            _ => Self::Offline,
        }
    }
}

/// Relationship between the local user and another user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(i32)]
pub enum RelationshipState {
    #[default]
    None = 0,
    Blocked = 1,
    RequestRecipient = 2,
    Friend = 3,
    RequestInitiator = 4,
    Ignored = 5,
    IgnoredFriend = 6,
    Suggested = 7,
}

impl RelationshipState {
    pub fn is_friend(self) -> bool {
        self == Self::Friend
    }

    pub fn is_blocked(self) -> bool {
        matches!(self, Self::Blocked | Self::Ignored)
    }
}

impl From<i32> for RelationshipState {
    fn from(code: i32) -> Self {
        match code {
            1 => Self::Blocked,
            2 => Self::RequestRecipient,
            3 => Self::Friend,
            4 => Self::RequestInitiator,
            5 => Self::Ignored,
            6 => Self::IgnoredFriend,
            7 => Self::Suggested,
            _ => Self::None,
        }
    }
}

// ============================================================================
// Profiles
// ============================================================================

/// What a user is currently playing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FriendGameInfo {
    pub app_id: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lobby: Option<EntityId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<SocketAddrV4>,
}

/// Profile field group of a user, populated by an info request.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FriendProfile {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nickname: Option<String>,
    /// Previous names, most recent last.
    #[serde(default)]
    pub name_history: Vec<String>,
    #[serde(default)]
    pub steam_level: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub game_info: Option<FriendGameInfo>,
}

impl FriendProfile {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

// ============================================================================
// Stats and achievements
// ============================================================================

/// Numeric value of a user stat.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatNumber {
    Float(f32),
    Int(i32),
}

/// A stat value with the time it was fetched (Unix millis).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StatValue {
    pub value: StatNumber,
    pub fetched_at: i64,
}

impl StatValue {
    pub fn float(value: f32) -> Self {
        Self {
            value: StatNumber::Float(value),
            fetched_at: now_millis(),
        }
    }

    pub fn int(value: i32) -> Self {
        Self {
            value: StatNumber::Int(value),
            fetched_at: now_millis(),
        }
    }
}

/// Achievement state of a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Achievement {
    pub unlocked: bool,
    /// Unlock time as Unix seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unlock_time: Option<i64>,
    pub fetched_at: i64,
}

impl Achievement {
    pub fn locked() -> Self {
        Self {
            unlocked: false,
            unlock_time: None,
            fetched_at: now_millis(),
        }
    }

    pub fn unlocked_at(unix_secs: i64) -> Self {
        Self {
            unlocked: true,
            unlock_time: Some(unix_secs),
            fetched_at: now_millis(),
        }
    }

    pub fn unlocked_since(&self) -> Option<SystemTime> {
        if !self.unlocked {
            return None;
        }
        let secs = u64::try_from(self.unlock_time?).ok()?;
        UNIX_EPOCH.checked_add(Duration::from_secs(secs))
    }
}

/// User stats field group, populated by a stats request.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct UserStats {
    #[serde(default)]
    pub stats: HashMap<String, StatValue>,
    #[serde(default)]
    pub achievements: HashMap<String, Achievement>,
}

impl UserStats {
    pub fn with_stat(mut self, name: impl Into<String>, value: StatValue) -> Self {
        self.stats.insert(name.into(), value);
        self
    }

    pub fn with_achievement(mut self, name: impl Into<String>, achievement: Achievement) -> Self {
        self.achievements.insert(name.into(), achievement);
        self
    }
}

// ============================================================================
// Lobbies
// ============================================================================

/// Who can find and join a lobby.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(i32)]
pub enum Visibility {
    #[default]
    Private = 0,
    FriendsOnly = 1,
    Public = 2,
    Invisible = 3,
}

/// Result of a join attempt. Anything but `Success` is a failure.
///
/// `NotConnected` and `Cancelled` are produced locally; every other value
/// comes from the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomEnter {
    Success,
    DoesntExist,
    NotAllowed,
    Full,
    Error,
    Banned,
    Limited,
    ClanDisabled,
    CommunityBan,
    MemberBlockedYou,
    YouBlockedMember,
    RatelimitExceeded,
    NotConnected,
    Cancelled,
}

impl RoomEnter {
    pub fn is_success(self) -> bool {
        self == Self::Success
    }
}

impl From<i32> for RoomEnter {
    fn from(code: i32) -> Self {
        match code {
            1 => Self::Success,
            2 => Self::DoesntExist,
            3 => Self::NotAllowed,
            4 => Self::Full,
            6 => Self::Banned,
            7 => Self::Limited,
            8 => Self::ClanDisabled,
            9 => Self::CommunityBan,
            10 => Self::MemberBlockedYou,
            11 => Self::YouBlockedMember,
            15 => Self::RatelimitExceeded,
            _ => Self::Error,
        }
    }
}

/// Game server associated with a lobby.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameServer {
    pub ip: Ipv4Addr,
    pub port: u16,
    #[serde(default)]
    pub server_id: EntityId,
}

impl GameServer {
    /// Server known only by its id.
    pub fn from_id(server_id: EntityId) -> Self {
        Self {
            ip: Ipv4Addr::UNSPECIFIED,
            port: 0,
            server_id,
        }
    }

    /// Server known only by its address.
    pub fn from_addr(addr: SocketAddrV4) -> Self {
        Self {
            ip: *addr.ip(),
            port: addr.port(),
            server_id: EntityId::default(),
        }
    }

    pub fn addr(&self) -> Option<SocketAddrV4> {
        if self.ip.is_unspecified() {
            None
        } else {
            Some(SocketAddrV4::new(self.ip, self.port))
        }
    }
}

/// Why a member left a lobby.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Departure {
    Left,
    Disconnected,
    Kicked,
    Banned,
}

pub(crate) fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
