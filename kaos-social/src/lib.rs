//! KaosNet social client
//!
//! Friend and lobby views over a callback-driven social backend. Requests
//! go out fire-and-forget and their answers arrive later on an event sink,
//! together with unsolicited push updates. One dispatch task applies all of
//! them to a shared cache in order; views read the cache and await the
//! requests they issue.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use kaos_social::{Backend, EntityId, RoomEnter, Session, SocialClient};
//!
//! # async fn example(backend: Arc<impl Backend>) -> kaos_social::Result<()> {
//! let session = Arc::new(Session::connected(EntityId(76561197960287930), 480));
//! let client = SocialClient::builder()
//!     .session(session)
//!     .backend(backend)
//!     .build()?;
//!
//! let lobby = client.lobby(EntityId(109775241000000001));
//! if lobby.join().await? == RoomEnter::Success {
//!     println!("{} players, mode {:?}", lobby.member_count(), lobby.get_data("mode"));
//!     lobby.set_member_data("ready", "1");
//! }
//! # Ok(())
//! # }
//! ```

mod backend;
mod cache;
mod client;
mod config;
mod correlator;
mod dispatch;
mod error;
mod friend;
mod lobby;
mod session;
mod sync;
mod types;

#[cfg(feature = "telemetry")]
pub mod telemetry;

#[cfg(test)]
mod testing;

pub use backend::{
    Backend, CallHandle, Command, Completion, Event, EventSink, LobbyChange, LobbySnapshot,
    LobbyUpdate, PersonaChange, PersonaUpdate, Request, RequestKind,
};
pub use cache::{CacheEvent, Cached, EntityCache, FieldGroup, FieldValue, PutOutcome};
pub use client::{SocialClient, SocialClientBuilder};
pub use config::SocialConfig;
pub use correlator::{AsyncCallCorrelator, CallResult, PendingCall};
pub use error::{Error, Result};
pub use friend::Friend;
pub use lobby::{Lobby, LobbyState, Membership, MAX_LOBBY_MEMBERS};
pub use session::{ConnectionStatus, Session};
pub use types::*;
