//! Background purge of expired sessions and dead verification tokens.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use super::storage::SessionStore;
use crate::users::UserService;

/// Run one purge pass; returns (sessions, tokens) removed.
pub async fn sweep_once(sessions: &dyn SessionStore, users: &dyn UserService) -> (u64, u64) {
    let purged_sessions = sessions.purge_expired().await.unwrap_or_else(|err| {
        error!("session purge failed: {err:#}");
        0
    });
    let purged_tokens = users.purge_expired_tokens().await.unwrap_or_else(|err| {
        error!("token purge failed: {err:#}");
        0
    });
    debug!(purged_sessions, purged_tokens, "expiry sweep finished");
    (purged_sessions, purged_tokens)
}

/// Spawn the sweeper on a fixed interval. The first pass runs immediately.
pub fn spawn_sweeper(
    sessions: Arc<dyn SessionStore>,
    users: Arc<dyn UserService>,
    interval: Duration,
) -> JoinHandle<()> {
    let interval = if interval.is_zero() {
        Duration::from_secs(1)
    } else {
        interval
    };
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            sweep_once(sessions.as_ref(), users.as_ref()).await;
        }
    })
}
