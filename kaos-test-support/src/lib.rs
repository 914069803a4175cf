//! Test harness for `kaos-social`.
//!
//! - [`hub::LoopbackHub`]: in-process social service driving real clients
//! - [`chaos::ChaosMonkey`]: duplicate and unsolicited completions
//! - [`verify`]: lobby invariant, convergence and ordering checks

pub mod chaos;
pub mod hub;
pub mod verify;

use std::time::Duration;

pub use chaos::{ChaosEvent, ChaosMonkey};
pub use hub::{HubBackend, LoopbackHub, APP_ID};
pub use verify::{converged, LobbyVerifier, OrderChecker, Violation};

/// Poll `pred` until it holds or two seconds pass.
pub async fn eventually(mut pred: impl FnMut() -> bool) -> bool {
    for _ in 0..2000 {
        if pred() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    pred()
}
