//! Periodic background tasks of a connected session.
//!
//! Four tasks run per connection, each on its own `tokio::time::interval`:
//!
//! | Task | Period | Cycle |
//! |---|---|---|
//! | lease renewal | `lease_renew_interval_ms` | renew, escalate on exhaustion |
//! | e-stop heartbeat | `estop_heartbeat_interval_ms` | heartbeat, escalate on exhaustion |
//! | command watchdog | `watchdog_period_ms` | zero stale motion |
//! | animation pump | `animation_frame_ms` | forward the animation pose |
//!
//! Tasks hold only a weak reference to the session and stop when the
//! shutdown signal fires, the session generation moves on, or the session
//! itself is dropped.  A failed cycle never ends a task; only the cycle's
//! own verdict does.

use std::sync::{Arc, Weak};
use std::time::Duration;

use legbridge_types::KeepaliveChannel;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::debug;

use crate::session::SessionInner;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Job {
    Keepalive(KeepaliveChannel),
    Watchdog,
    Animation,
}

impl Job {
    fn name(self) -> &'static str {
        match self {
            Job::Keepalive(KeepaliveChannel::Lease) => "lease-renewal",
            Job::Keepalive(KeepaliveChannel::Estop) => "estop-heartbeat",
            Job::Watchdog => "command-watchdog",
            Job::Animation => "animation-pump",
        }
    }
}

/// Spawn every task for `generation`.
pub(crate) fn spawn_all(
    inner: &Arc<SessionInner>,
    generation: u64,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    let config = inner.config();
    let supervisor = config.supervisor();
    [
        (
            Job::Keepalive(KeepaliveChannel::Lease),
            supervisor.lease_renew_interval,
        ),
        (
            Job::Keepalive(KeepaliveChannel::Estop),
            supervisor.estop_heartbeat_interval,
        ),
        (Job::Watchdog, config.watchdog_period()),
        (Job::Animation, config.animation_frame()),
    ]
    .into_iter()
    .map(|(job, period)| {
        tokio::spawn(run(
            Arc::downgrade(inner),
            job,
            period,
            generation,
            shutdown.clone(),
        ))
    })
    .collect()
}

async fn run(
    session: Weak<SessionInner>,
    job: Job,
    period: Duration,
    generation: u64,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    debug!(task = job.name(), generation, ?period, "Session task started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }
        let Some(inner) = session.upgrade() else {
            break;
        };
        let flow = match job {
            Job::Keepalive(channel) => inner.keepalive_cycle(channel, generation).await,
            Job::Watchdog => inner.watchdog_cycle(generation).await,
            Job::Animation => inner.animation_cycle(generation).await,
        };
        if flow.is_break() {
            break;
        }
    }

    debug!(task = job.name(), generation, "Session task stopped");
}
