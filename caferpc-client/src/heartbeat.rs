//! Periodic keep-alive PINGs.

use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Heartbeat schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatConfig {
    /// Delay before the first PING.
    pub initial_delay: Duration,
    /// Period between PINGs.
    pub interval: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            interval: Duration::from_secs(3),
        }
    }
}

impl HeartbeatConfig {
    pub fn new(initial_delay: Duration, interval: Duration) -> Self {
        Self {
            initial_delay,
            interval,
        }
    }
}

/// Spawns the heartbeat driver for one connection.
///
/// `send_ping` is invoked on every tick while `closed` reads false; it
/// returns false once the connection can no longer accept frames. The task
/// ends as soon as the connection is marked closed or a send is refused, so
/// no PING is ever queued on a dead connection.
pub(crate) fn spawn<F>(
    config: HeartbeatConfig,
    mut closed: watch::Receiver<bool>,
    mut send_ping: F,
) -> JoinHandle<()>
where
    F: FnMut() -> bool + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker =
            tokio::time::interval_at(Instant::now() + config.initial_delay, config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = closed.wait_for(|is_closed| *is_closed) => break,
                _ = ticker.tick() => {
                    if !send_ping() {
                        break;
                    }
                    tracing::trace!("Heartbeat PING queued");
                }
            }
        }

        tracing::debug!("Heartbeat stopped");
    })
}
