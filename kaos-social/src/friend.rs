//! Friend view.
//!
//! Accessors read whatever the cache holds, stale or not, and fall back to
//! defaults for groups that were never populated. `request_info` and
//! `request_user_stats` are the only calls that wait on the backend.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::backend::{Command, Completion, Request};
use crate::cache::{FieldGroup, FieldValue};
use crate::client::ClientCore;
use crate::correlator::CallResult;
use crate::error::{Error, Result};
use crate::types::{
    Achievement, EntityId, FriendGameInfo, FriendProfile, PresenceState, RelationshipState,
    StatNumber, UserStats,
};

/// View over a single remote user.
#[derive(Clone)]
pub struct Friend {
    id: EntityId,
    core: Arc<ClientCore>,
}

impl Friend {
    pub(crate) fn new(id: EntityId, core: Arc<ClientCore>) -> Self {
        core.cache.touch(id);
        Self { id, core }
    }

    pub fn id(&self) -> EntityId {
        self.id
    }

    pub fn is_me(&self) -> bool {
        self.id == self.core.local_user()
    }

    fn field(&self, group: FieldGroup) -> Option<FieldValue> {
        self.core.cache.get(self.id, group).into_known()
    }

    fn profile(&self) -> Option<FriendProfile> {
        match self.field(FieldGroup::Profile) {
            Some(FieldValue::Profile(profile)) => Some(profile),
            _ => None,
        }
    }

    fn stats(&self) -> Option<UserStats> {
        match self.field(FieldGroup::UserStats) {
            Some(FieldValue::UserStats(stats)) => Some(stats),
            _ => None,
        }
    }

    // ==================== Presence ====================

    pub fn state(&self) -> PresenceState {
        match self.field(FieldGroup::Presence) {
            Some(FieldValue::Presence(state)) => state,
            _ => PresenceState::default(),
        }
    }

    pub fn is_online(&self) -> bool {
        self.state().is_online()
    }

    pub fn is_away(&self) -> bool {
        self.state().is_away()
    }

    pub fn is_busy(&self) -> bool {
        self.state().is_busy()
    }

    pub fn is_snoozing(&self) -> bool {
        self.state().is_snoozing()
    }

    pub fn relationship(&self) -> RelationshipState {
        match self.field(FieldGroup::Relationship) {
            Some(FieldValue::Relationship(state)) => state,
            _ => RelationshipState::default(),
        }
    }

    pub fn is_friend(&self) -> bool {
        self.relationship().is_friend()
    }

    pub fn is_blocked(&self) -> bool {
        self.relationship().is_blocked()
    }

    // ==================== Profile ====================

    /// Whether the profile group has been populated.
    pub fn has_info(&self) -> bool {
        self.core.cache.get(self.id, FieldGroup::Profile).is_known()
    }

    pub fn name(&self) -> Option<String> {
        self.profile().map(|p| p.name)
    }

    pub fn nickname(&self) -> Option<String> {
        self.profile().and_then(|p| p.nickname)
    }

    /// Previous names, most recent last.
    pub fn name_history(&self) -> Vec<String> {
        self.profile().map(|p| p.name_history).unwrap_or_default()
    }

    pub fn steam_level(&self) -> i32 {
        self.profile().map(|p| p.steam_level).unwrap_or(0)
    }

    pub fn game_info(&self) -> Option<FriendGameInfo> {
        self.profile().and_then(|p| p.game_info)
    }

    pub fn is_playing_this_game(&self) -> bool {
        self.game_info()
            .is_some_and(|g| g.app_id == self.core.session.app_id())
    }

    /// Whether this user is a cached member of the given lobby.
    pub fn is_in(&self, group_or_room: EntityId) -> bool {
        self.core
            .cache
            .with_lobby(group_or_room, |l| l.is_member(self.id))
            .unwrap_or(false)
    }

    pub fn rich_presence(&self, key: &str) -> Option<String> {
        match self.field(FieldGroup::RichPresence) {
            Some(FieldValue::RichPresence(mut values)) => values.remove(key),
            _ => None,
        }
    }

    pub fn rich_presence_all(&self) -> HashMap<String, String> {
        match self.field(FieldGroup::RichPresence) {
            Some(FieldValue::RichPresence(values)) => values,
            _ => HashMap::new(),
        }
    }

    /// Populate the profile group. `Ok(true)` at once if it is already known.
    ///
    /// `Ok(false)` when not connected or the backend has nothing for this
    /// user. `Err` only if the view is torn down while waiting or the answer
    /// does not fit the request.
    pub async fn request_info(&self) -> Result<bool> {
        if self.has_info() {
            return Ok(true);
        }
        self.fetch_info().await
    }

    /// Drop the cached profile and fetch it again.
    pub async fn refresh_info(&self) -> Result<bool> {
        self.core.dispatcher.invalidate(self.id, FieldGroup::Profile);
        self.fetch_info().await
    }

    async fn fetch_info(&self) -> Result<bool> {
        let request = Request::FriendInfo {
            user: self.id,
            name_only: self.core.config.name_only_info,
        };
        let call = match self.core.correlator.issue(request) {
            Ok(call) => call,
            Err(Error::NotConnected) => {
                debug!(user = %self.id, "info request skipped: not connected");
                return Ok(false);
            }
            Err(e) => return Err(e),
        };

        match call.wait().await {
            CallResult::Completed(Completion::FriendInfo { profile, .. }) => Ok(profile.is_some()),
            CallResult::Completed(other) => Err(Error::malformed(format!(
                "info request answered with {:?}",
                other.kind()
            ))),
            CallResult::Cancelled => Err(Error::Cancelled),
            CallResult::Malformed(reason) => Err(Error::Malformed(reason)),
        }
    }

    // ==================== Stats ====================

    /// Populate stats and achievements. Until this succeeds every stat and
    /// achievement lookup returns its default.
    pub async fn request_user_stats(&self) -> Result<bool> {
        let call = match self.core.correlator.issue(Request::UserStats { user: self.id }) {
            Ok(call) => call,
            Err(Error::NotConnected) => {
                debug!(user = %self.id, "stats request skipped: not connected");
                return Ok(false);
            }
            Err(e) => return Err(e),
        };

        match call.wait().await {
            CallResult::Completed(Completion::UserStats { success, stats, .. }) => {
                Ok(success && stats.is_some())
            }
            CallResult::Completed(other) => Err(Error::malformed(format!(
                "stats request answered with {:?}",
                other.kind()
            ))),
            CallResult::Cancelled => Err(Error::Cancelled),
            CallResult::Malformed(reason) => Err(Error::Malformed(reason)),
        }
    }

    pub fn has_user_stats(&self) -> bool {
        self.core.cache.get(self.id, FieldGroup::UserStats).is_known()
    }

    fn stat(&self, name: &str) -> Option<StatNumber> {
        self.stats()
            .and_then(|s| s.stats.get(name).map(|v| v.value))
    }

    /// `default` unless stats were populated and `name` is a float stat.
    pub fn stat_float(&self, name: &str, default: f32) -> f32 {
        match self.stat(name) {
            Some(StatNumber::Float(value)) => value,
            _ => default,
        }
    }

    /// `default` unless stats were populated and `name` is an int stat.
    pub fn stat_int(&self, name: &str, default: i32) -> i32 {
        match self.stat(name) {
            Some(StatNumber::Int(value)) => value,
            _ => default,
        }
    }

    /// Whether an achievement is unlocked; `default` if unknown.
    pub fn achievement(&self, name: &str, default: bool) -> bool {
        self.achievement_entry(name)
            .map(|a| a.unlocked)
            .unwrap_or(default)
    }

    /// Unix seconds of the unlock, if populated and unlocked.
    pub fn achievement_unlock_time(&self, name: &str) -> Option<i64> {
        self.achievement_entry(name)
            .filter(|a| a.unlocked)
            .and_then(|a| a.unlock_time)
    }

    fn achievement_entry(&self, name: &str) -> Option<Achievement> {
        self.stats().and_then(|s| s.achievements.get(name).copied())
    }

    // ==================== Commands ====================

    /// False only if the message could not be dispatched.
    pub fn send_message(&self, text: &str) -> bool {
        self.core.is_connected()
            && self.core.backend.dispatch(Command::SendMessage {
                to: self.id,
                text: text.to_string(),
            })
    }

    /// Invite to the running game; `connect` is handed to the game on accept.
    pub fn invite_to_game(&self, connect: &str) -> bool {
        self.core.is_connected()
            && self.core.backend.dispatch(Command::InviteToGame {
                to: self.id,
                connect: connect.to_string(),
            })
    }

    /// Cancel this user's outstanding requests.
    pub fn teardown(&self) -> usize {
        self.core.teardown(self.id)
    }
}

impl fmt::Display for Friend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(&name),
            None => write!(f, "{}", self.id),
        }
    }
}

impl fmt::Debug for Friend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Friend")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{PersonaChange, PersonaUpdate};
    use crate::config::SocialConfig;
    use crate::testing::{client, client_with, settle, until, ME};
    use crate::types::{StatValue, UserStats};

    const GARRY: EntityId = EntityId(76561197960279927);

    fn info(name: &str) -> Completion {
        Completion::FriendInfo {
            user: GARRY,
            profile: Some(FriendProfile::named(name)),
            rich_presence: Some(HashMap::from([("status".to_string(), "In menus".to_string())])),
        }
    }

    #[tokio::test]
    async fn test_request_info_populates_profile() {
        let (client, backend) = client();
        let friend = client.friend(GARRY);
        assert_eq!(friend.name(), None);
        assert_eq!(friend.to_string(), GARRY.to_string());

        let waiting = tokio::spawn({
            let friend = friend.clone();
            async move { friend.request_info().await }
        });
        until(|| backend.requests().len() == 1).await;
        backend.complete_last(info("Garry"));

        assert!(waiting.await.unwrap().unwrap());
        assert_eq!(friend.name().as_deref(), Some("Garry"));
        assert_eq!(friend.rich_presence("status").as_deref(), Some("In menus"));
        assert_eq!(friend.to_string(), "Garry");

        // Known now, so no second request.
        assert!(friend.request_info().await.unwrap());
        assert_eq!(backend.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_name_only_refresh_keeps_rest_of_profile() {
        let (client, backend) = client_with(SocialConfig {
            name_only_info: true,
            ..Default::default()
        });
        let friend = client.friend(GARRY);
        client.event_sink().push_persona(PersonaUpdate {
            user: GARRY,
            tick: None,
            change: PersonaChange::Profile {
                profile: FriendProfile {
                    name_history: vec!["Bobby".into()],
                    steam_level: 42,
                    ..FriendProfile::named("Garry")
                },
            },
        });
        settle(&client, 1).await;

        let waiting = tokio::spawn({
            let friend = friend.clone();
            async move { friend.refresh_info().await }
        });
        until(|| backend.requests().len() == 1).await;
        assert!(matches!(
            backend.requests()[0].1,
            Request::FriendInfo { name_only: true, .. }
        ));
        backend.complete_last(Completion::FriendInfo {
            user: GARRY,
            profile: Some(FriendProfile::named("Garry Newman")),
            rich_presence: None,
        });

        assert!(waiting.await.unwrap().unwrap());
        assert_eq!(friend.name().as_deref(), Some("Garry Newman"));
        assert_eq!(friend.steam_level(), 42);
        assert_eq!(friend.name_history(), vec!["Bobby".to_string()]);
    }

    #[tokio::test]
    async fn test_request_info_unknown_user() {
        let (client, backend) = client();
        let friend = client.friend(GARRY);
        let waiting = tokio::spawn({
            let friend = friend.clone();
            async move { friend.request_info().await }
        });
        until(|| backend.requests().len() == 1).await;
        backend.complete_last(Completion::FriendInfo {
            user: GARRY,
            profile: None,
            rich_presence: None,
        });
        assert!(!waiting.await.unwrap().unwrap());
        assert!(!friend.has_info());
    }

    #[tokio::test]
    async fn test_not_connected_returns_false() {
        let (client, backend) = client();
        client.session().close();
        let friend = client.friend(GARRY);

        assert!(!friend.request_info().await.unwrap());
        assert!(!friend.request_user_stats().await.unwrap());
        assert!(!friend.send_message("hi"));
        assert!(!friend.invite_to_game("+connect 1.2.3.4"));
        assert!(backend.requests().is_empty());
        assert!(backend.commands().is_empty());
    }

    #[tokio::test]
    async fn test_stat_defaults_until_stats_populated() {
        let (client, backend) = client();
        let friend = client.friend(GARRY);

        // Other groups being known does not matter.
        client.event_sink().push_persona(PersonaUpdate {
            user: GARRY,
            tick: None,
            change: PersonaChange::Profile {
                profile: FriendProfile::named("Garry"),
            },
        });
        settle(&client, 1).await;
        assert_eq!(friend.stat_float("x", 5.0), 5.0);
        assert_eq!(friend.stat_int("kills", 7), 7);
        assert!(!friend.achievement("ACH_WIN", false));

        let waiting = tokio::spawn({
            let friend = friend.clone();
            async move { friend.request_user_stats().await }
        });
        until(|| backend.requests().len() == 1).await;
        backend.complete_last(Completion::UserStats {
            user: GARRY,
            success: true,
            stats: Some(
                UserStats::default()
                    .with_stat("x", StatValue::float(1.5))
                    .with_stat("kills", StatValue::int(40))
                    .with_achievement("ACH_WIN", Achievement::unlocked_at(1_600_000_000)),
            ),
        });
        assert!(waiting.await.unwrap().unwrap());

        assert_eq!(friend.stat_float("x", 5.0), 1.5);
        assert_eq!(friend.stat_int("kills", 7), 40);
        // Wrong type reads as missing.
        assert_eq!(friend.stat_int("x", 7), 7);
        assert!(friend.achievement("ACH_WIN", false));
        assert_eq!(friend.achievement_unlock_time("ACH_WIN"), Some(1_600_000_000));
        assert_eq!(friend.achievement_unlock_time("ACH_NONE"), None);
    }

    #[tokio::test]
    async fn test_failed_stats_keep_defaults() {
        let (client, backend) = client();
        let friend = client.friend(GARRY);
        let waiting = tokio::spawn({
            let friend = friend.clone();
            async move { friend.request_user_stats().await }
        });
        until(|| backend.requests().len() == 1).await;
        backend.complete_last(Completion::UserStats {
            user: GARRY,
            success: false,
            stats: Some(UserStats::default().with_stat("x", StatValue::float(1.0))),
        });
        assert!(!waiting.await.unwrap().unwrap());
        assert_eq!(friend.stat_float("x", 5.0), 5.0);
    }

    #[tokio::test]
    async fn test_presence_projections() {
        let (client, _backend) = client();
        let friend = client.friend(GARRY);
        assert!(!friend.is_online());

        client.event_sink().push_persona(PersonaUpdate {
            user: GARRY,
            tick: None,
            change: PersonaChange::Presence {
                state: PresenceState::Away,
            },
        });
        settle(&client, 1).await;

        assert!(friend.is_online());
        assert!(friend.is_away());
        assert!(!friend.is_busy());
        assert!(!friend.is_snoozing());
    }

    #[tokio::test]
    async fn test_is_playing_this_game() {
        let (client, _backend) = client();
        let friend = client.friend(GARRY);
        client.event_sink().push_persona(PersonaUpdate {
            user: GARRY,
            tick: None,
            change: PersonaChange::Profile {
                profile: FriendProfile {
                    game_info: Some(FriendGameInfo {
                        app_id: 480,
                        lobby: None,
                        server: None,
                    }),
                    ..FriendProfile::named("Garry")
                },
            },
        });
        settle(&client, 1).await;
        assert!(friend.is_playing_this_game());
        assert!(client.me().is_me());
        assert_eq!(client.me().id(), ME);
    }

    #[tokio::test]
    async fn test_teardown_cancels_waiters() {
        let (client, backend) = client();
        let friend = client.friend(GARRY);
        let waiting = tokio::spawn({
            let friend = friend.clone();
            async move { friend.request_info().await }
        });
        until(|| backend.requests().len() == 1).await;

        assert_eq!(friend.teardown(), 1);
        assert!(matches!(waiting.await.unwrap(), Err(Error::Cancelled)));

        // The late answer is dropped as an anomaly.
        backend.complete_last(info("Garry"));
        settle(&client, 1).await;
        assert!(!friend.has_info());
    }

    #[tokio::test]
    async fn test_refresh_info_refetches() {
        let (client, backend) = client();
        let friend = client.friend(GARRY);
        client.event_sink().push_persona(PersonaUpdate {
            user: GARRY,
            tick: None,
            change: PersonaChange::Profile {
                profile: FriendProfile::named("Old"),
            },
        });
        settle(&client, 1).await;

        let waiting = tokio::spawn({
            let friend = friend.clone();
            async move { friend.refresh_info().await }
        });
        until(|| backend.requests().len() == 1).await;
        assert!(!friend.has_info());
        backend.complete_last(info("New"));

        assert!(waiting.await.unwrap().unwrap());
        assert_eq!(friend.name().as_deref(), Some("New"));
    }
}
