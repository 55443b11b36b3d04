//! Connection liveness heartbeat
//!
//! One prober task per connection. Each tick reads the two-state `alive`
//! flag: still false means the previous ping went unanswered, which is
//! logged as a miss. The flag is then lowered and a ping goes out; the pong
//! path raises it again and stamps `lastHeartbeat`. A miss never disconnects
//! by itself.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use uuid::Uuid;

use super::service::ConnectionService;

/// Probe interval between heartbeat ticks.
pub const HEARTBEAT_INTERVAL_MS: u64 = 30_000;

/// Spawn the heartbeat prober for a connection. The task ends on its own
/// when the record closes or the socket goes away; cleanup aborts it.
pub(crate) fn spawn_heartbeat(service: Arc<ConnectionService>, id: Uuid) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_millis(HEARTBEAT_INTERVAL_MS));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the interval fires immediately; the first tick is not a probe
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if !service.heartbeat_tick(&id) {
                break;
            }
        }
    })
}
