//! [`LeaseSupervisor`] – exclusive-control lease and software e-stop.
//!
//! The supervisor owns the session's lifecycle state and both robot handles:
//!
//! ```text
//! Disconnected --connect--> Acquiring --ok--> Active --release--> Releasing --> Disconnected
//!                               |                |
//!                               +--err-----------+--keepalive exhausted--> Faulted --release--> Disconnected
//! ```
//!
//! `connect` treats lease acquisition and e-stop registration as one unit and
//! rolls back a half-finished acquisition.  Keepalive cycles are split into a
//! lock-free network step ([`KeepaliveTarget::send`]) and a bookkeeping step
//! ([`LeaseSupervisor::record_keepalive`]) so the runtime never holds the
//! session lock across a renewal or heartbeat.

use std::time::Duration;

use legbridge_hal::RobotCapabilities;
use legbridge_types::{
    BridgeError, EstopHandle, EstopStatus, KeepaliveChannel, LeaseHandle, LeaseStatus,
    LifecycleState,
};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::call::bounded;
use crate::deadline::{ChannelHealth, KeepaliveDeadlines};

/// Keepalive and lease parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct SupervisorConfig {
    /// Name presented to the robot when taking the lease.
    pub client_name: String,
    pub lease_renew_interval: Duration,
    /// Longest tolerated gap between successful lease renewals.
    pub lease_margin: Duration,
    /// Timeout registered with the robot's e-stop endpoint.
    pub estop_timeout: Duration,
    pub estop_heartbeat_interval: Duration,
    /// Longest tolerated gap between successful heartbeats.
    pub estop_margin: Duration,
    pub max_consecutive_failures: u32,
    pub call_timeout: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            client_name: "legbridge".to_string(),
            lease_renew_interval: Duration::from_secs(2),
            lease_margin: Duration::from_secs(6),
            estop_timeout: Duration::from_secs(9),
            estop_heartbeat_interval: Duration::from_secs(1),
            estop_margin: Duration::from_secs(3),
            max_consecutive_failures: 3,
            call_timeout: Duration::from_millis(500),
        }
    }
}

impl SupervisorConfig {
    pub fn interval(&self, channel: KeepaliveChannel) -> Duration {
        match channel {
            KeepaliveChannel::Lease => self.lease_renew_interval,
            KeepaliveChannel::Estop => self.estop_heartbeat_interval,
        }
    }

    pub fn margin(&self, channel: KeepaliveChannel) -> Duration {
        match channel {
            KeepaliveChannel::Lease => self.lease_margin,
            KeepaliveChannel::Estop => self.estop_margin,
        }
    }
}

/// A cloned handle for one keepalive call made outside the session lock.
#[derive(Debug, Clone, PartialEq)]
pub enum KeepaliveTarget {
    Lease(LeaseHandle),
    Estop(EstopHandle),
}

impl KeepaliveTarget {
    pub fn channel(&self) -> KeepaliveChannel {
        match self {
            Self::Lease(_) => KeepaliveChannel::Lease,
            Self::Estop(_) => KeepaliveChannel::Estop,
        }
    }

    /// Renew the lease or send the heartbeat, bounded by `timeout`.
    ///
    /// # Errors
    ///
    /// The capability error or [`BridgeError::Timeout`].
    pub async fn send(
        &self,
        robot: &dyn RobotCapabilities,
        timeout: Duration,
    ) -> Result<(), BridgeError> {
        match self {
            Self::Lease(lease) => bounded("renew_lease", timeout, robot.renew_lease(lease)).await,
            Self::Estop(estop) => {
                bounded("send_estop_heartbeat", timeout, robot.send_estop_heartbeat(estop)).await
            }
        }
    }
}

/// Verdict on one keepalive cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum KeepaliveOutcome {
    Ok,
    /// Failed but still inside the failure budget and the safety margin.
    Retrying { consecutive: u32, error: BridgeError },
    /// Fatal for the session: stop, release, disconnect.
    Exhausted(BridgeError),
}

/// Owns the lifecycle state, the lease and the e-stop endpoint of a session.
#[derive(Default)]
pub struct LeaseSupervisor {
    config: SupervisorConfig,
    state: LifecycleState,
    lease: Option<LeaseHandle>,
    estop: Option<EstopHandle>,
    estop_triggered: bool,
    deadlines: KeepaliveDeadlines,
    last_fault: Option<String>,
}

impl LeaseSupervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == LifecycleState::Active
    }

    pub fn lease(&self) -> Option<&LeaseHandle> {
        self.lease.as_ref()
    }

    pub fn last_fault(&self) -> Option<&str> {
        self.last_fault.as_deref()
    }

    pub fn lease_status(&self) -> LeaseStatus {
        if self.lease.is_some() {
            LeaseStatus::Active
        } else {
            LeaseStatus::None
        }
    }

    pub fn estop_status(&self) -> EstopStatus {
        match (&self.estop, self.estop_triggered) {
            (None, _) => EstopStatus::NotConfigured,
            (Some(_), true) => EstopStatus::Triggered,
            (Some(_), false) => EstopStatus::Ok,
        }
    }

    pub fn consecutive_failures(&self, channel: KeepaliveChannel) -> u32 {
        self.deadlines.consecutive_failures(channel)
    }

    pub fn channel_health(&self, channel: KeepaliveChannel, now: Instant) -> ChannelHealth {
        self.deadlines.health(channel, now)
    }

    pub fn since_last_keepalive(&self, channel: KeepaliveChannel, now: Instant) -> Option<Duration> {
        self.deadlines.since_last_success(channel, now)
    }

    /// The lease, or the error an operation requiring it should return.
    ///
    /// # Errors
    ///
    /// [`BridgeError::NotConnected`] when disconnected, otherwise
    /// [`BridgeError::InvalidState`].
    pub fn require_active(&self, operation: &str) -> Result<&LeaseHandle, BridgeError> {
        match (self.state, &self.lease) {
            (LifecycleState::Active, Some(lease)) => Ok(lease),
            (LifecycleState::Disconnected, _) => Err(BridgeError::NotConnected),
            (state, _) => Err(BridgeError::invalid_state(operation, state)),
        }
    }

    // ── Connect ────────────────────────────────────────────────────────────

    /// Take the lease and register the e-stop endpoint as one unit.
    ///
    /// On any failure the partial acquisition is rolled back (best effort)
    /// and the state returns to `Disconnected`.
    ///
    /// # Errors
    ///
    /// [`BridgeError::InvalidState`] unless disconnected, otherwise the
    /// failing capability call's error (e.g. [`BridgeError::LeaseConflict`]).
    pub async fn connect(
        &mut self,
        robot: &dyn RobotCapabilities,
        now: Instant,
    ) -> Result<(), BridgeError> {
        if self.state != LifecycleState::Disconnected {
            return Err(BridgeError::invalid_state("connect", self.state));
        }
        self.state = LifecycleState::Acquiring;
        let timeout = self.config.call_timeout;
        let client = self.config.client_name.clone();

        let lease = match bounded("acquire_lease", timeout, robot.acquire_lease(&client)).await {
            Ok(lease) => lease,
            Err(e) => {
                warn!(error = %e, "Lease acquisition failed");
                self.state = LifecycleState::Disconnected;
                return Err(e);
            }
        };

        let estop = match bounded(
            "register_estop",
            timeout,
            robot.register_estop(&client, self.config.estop_timeout),
        )
        .await
        {
            Ok(estop) => estop,
            Err(e) => {
                warn!(error = %e, "E-Stop registration failed; returning lease");
                if let Err(release) =
                    bounded("release_lease", timeout, robot.release_lease(&lease)).await
                {
                    warn!(error = %release, "Rollback could not return the lease");
                }
                self.state = LifecycleState::Disconnected;
                return Err(e);
            }
        };

        self.deadlines.clear();
        for channel in [KeepaliveChannel::Lease, KeepaliveChannel::Estop] {
            self.deadlines.register(channel, self.config.margin(channel), now);
        }
        info!(lease_id = lease.id(), estop_id = estop.id(), "Lease and E-Stop acquired");
        self.lease = Some(lease);
        self.estop = Some(estop);
        self.estop_triggered = false;
        self.last_fault = None;
        self.state = LifecycleState::Active;
        Ok(())
    }

    // ── Keepalive ──────────────────────────────────────────────────────────

    /// Handle for the next keepalive call on `channel`, if active.
    pub fn keepalive_target(&self, channel: KeepaliveChannel) -> Option<KeepaliveTarget> {
        if !self.is_active() {
            return None;
        }
        match channel {
            KeepaliveChannel::Lease => self.lease.clone().map(KeepaliveTarget::Lease),
            KeepaliveChannel::Estop => self.estop.clone().map(KeepaliveTarget::Estop),
        }
    }

    /// Fold the result of one keepalive call into the channel's deadline.
    ///
    /// A lost lease is exhausted at once.  Other failures are counted and
    /// become exhausted when the count reaches `max_consecutive_failures` or
    /// the channel's margin since its last success has elapsed.
    pub fn record_keepalive(
        &mut self,
        channel: KeepaliveChannel,
        result: Result<(), BridgeError>,
        now: Instant,
    ) -> KeepaliveOutcome {
        let error = match result {
            Ok(()) => {
                self.deadlines.check_in(channel, now);
                debug!(%channel, "Keepalive ok");
                return KeepaliveOutcome::Ok;
            }
            Err(error) => error,
        };

        let consecutive = self.deadlines.record_failure(channel);
        let expired = self.deadlines.health(channel, now) == ChannelHealth::Expired;
        let lease_gone = matches!(error, BridgeError::LeaseLost(_));

        if lease_gone || expired || consecutive >= self.config.max_consecutive_failures {
            error!(%channel, consecutive, error = %error, "Keepalive exhausted");
            let details = if lease_gone {
                error.to_string()
            } else if expired {
                format!("no successful keepalive within {:?}: {error}", self.config.margin(channel))
            } else {
                format!("{consecutive} consecutive failures: {error}")
            };
            KeepaliveOutcome::Exhausted(BridgeError::KeepaliveExhausted { channel, details })
        } else {
            warn!(%channel, consecutive, error = %error, "Keepalive failed; retrying next cycle");
            KeepaliveOutcome::Retrying { consecutive, error }
        }
    }

    // ── Faults & teardown ──────────────────────────────────────────────────

    /// Enter `Faulted`.  Teardown follows through [`Self::release`].
    pub fn mark_faulted(&mut self, cause: impl Into<String>) {
        let cause = cause.into();
        error!(cause = %cause, "Session faulted");
        self.last_fault = Some(cause);
        self.state = LifecycleState::Faulted;
    }

    /// Enter `Releasing` for an operator-initiated teardown.
    ///
    /// # Errors
    ///
    /// [`BridgeError::NotConnected`] when there is nothing to release, or
    /// [`BridgeError::InvalidState`] while another transition is under way.
    pub fn begin_release(&mut self) -> Result<(), BridgeError> {
        match self.state {
            LifecycleState::Active => {
                self.state = LifecycleState::Releasing;
                Ok(())
            }
            LifecycleState::Disconnected => Err(BridgeError::NotConnected),
            state => Err(BridgeError::invalid_state("disconnect", state)),
        }
    }

    /// De-register the e-stop and return the lease, best effort, then land in
    /// `Disconnected`.  Failures are logged and returned but never stop the
    /// teardown.
    pub async fn release(&mut self, robot: &dyn RobotCapabilities) -> Vec<BridgeError> {
        let timeout = self.config.call_timeout;
        let mut failures = Vec::new();

        if let Some(estop) = self.estop.take()
            && let Err(e) = bounded("deregister_estop", timeout, robot.deregister_estop(&estop)).await
        {
            warn!(error = %e, "E-Stop de-registration failed");
            failures.push(e);
        }
        if let Some(lease) = self.lease.take()
            && let Err(e) = bounded("release_lease", timeout, robot.release_lease(&lease)).await
        {
            warn!(error = %e, "Lease release failed");
            failures.push(e);
        }

        self.deadlines.clear();
        self.estop_triggered = false;
        self.state = LifecycleState::Disconnected;
        info!(failures = failures.len(), "Lease and E-Stop released");
        failures
    }

    // ── Software e-stop ────────────────────────────────────────────────────

    /// Assert the software e-stop.
    ///
    /// # Errors
    ///
    /// [`BridgeError::EstopFault`] when no endpoint is registered, or the
    /// capability error.
    pub async fn trigger_estop(&mut self, robot: &dyn RobotCapabilities) -> Result<(), BridgeError> {
        let estop = self.registered_estop()?;
        bounded("trigger_estop", self.config.call_timeout, robot.trigger_estop(&estop)).await?;
        self.estop_triggered = true;
        Ok(())
    }

    /// Clear the software e-stop.
    ///
    /// # Errors
    ///
    /// [`BridgeError::EstopFault`] when no endpoint is registered, or the
    /// capability error.
    pub async fn release_estop(&mut self, robot: &dyn RobotCapabilities) -> Result<(), BridgeError> {
        let estop = self.registered_estop()?;
        bounded("release_estop", self.config.call_timeout, robot.release_estop(&estop)).await?;
        self.estop_triggered = false;
        Ok(())
    }

    fn registered_estop(&self) -> Result<EstopHandle, BridgeError> {
        self.estop
            .clone()
            .ok_or_else(|| BridgeError::EstopFault("no e-stop endpoint is registered".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use legbridge_hal::SimRobot;

    fn supervisor(client: &str) -> LeaseSupervisor {
        LeaseSupervisor::new(SupervisorConfig {
            client_name: client.to_string(),
            ..SupervisorConfig::default()
        })
    }

    #[tokio::test(start_paused = true)]
    async fn connect_takes_lease_and_estop() {
        let robot = SimRobot::new();
        let mut sup = supervisor("op");
        sup.connect(&robot, Instant::now()).await.unwrap();

        assert_eq!(sup.state(), LifecycleState::Active);
        assert_eq!(sup.lease_status(), LeaseStatus::Active);
        assert_eq!(sup.estop_status(), EstopStatus::Ok);
        assert_eq!(robot.lease_holder().as_deref(), Some("op"));
        assert_eq!(robot.registered_estops(), 1);

        let err = sup.connect(&robot, Instant::now()).await.unwrap_err();
        assert!(matches!(err, BridgeError::InvalidState { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn lease_conflict_leaves_session_disconnected() {
        let robot = SimRobot::new();
        robot.steal_lease("tablet");
        let mut sup = supervisor("op");
        let err = sup.connect(&robot, Instant::now()).await.unwrap_err();

        assert!(matches!(err, BridgeError::LeaseConflict(_)));
        assert_eq!(sup.state(), LifecycleState::Disconnected);
        assert_eq!(robot.registered_estops(), 0);
        assert!(sup.require_active("stand").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_estop_registration_rolls_back_lease() {
        let robot = SimRobot::new();
        robot.set_fail_estop_registration(true);
        let mut sup = supervisor("op");
        let err = sup.connect(&robot, Instant::now()).await.unwrap_err();

        assert!(matches!(err, BridgeError::EstopFault(_)));
        assert_eq!(sup.state(), LifecycleState::Disconnected);
        assert_eq!(robot.lease_holder(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_escalate_at_threshold() {
        let robot = SimRobot::new();
        let mut sup = supervisor("op");
        let t0 = Instant::now();
        sup.connect(&robot, t0).await.unwrap();

        let fail = || Err(BridgeError::transport("send_estop_heartbeat", "reset"));
        let ch = KeepaliveChannel::Estop;
        assert!(matches!(
            sup.record_keepalive(ch, fail(), t0 + Duration::from_millis(100)),
            KeepaliveOutcome::Retrying { consecutive: 1, .. }
        ));
        assert!(matches!(
            sup.record_keepalive(ch, fail(), t0 + Duration::from_millis(200)),
            KeepaliveOutcome::Retrying { consecutive: 2, .. }
        ));
        assert!(matches!(
            sup.record_keepalive(ch, fail(), t0 + Duration::from_millis(300)),
            KeepaliveOutcome::Exhausted(BridgeError::KeepaliveExhausted {
                channel: KeepaliveChannel::Estop,
                ..
            })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_failure_count() {
        let robot = SimRobot::new();
        let mut sup = supervisor("op");
        let t0 = Instant::now();
        sup.connect(&robot, t0).await.unwrap();

        let ch = KeepaliveChannel::Lease;
        let fail = || Err(BridgeError::transport("renew_lease", "reset"));
        sup.record_keepalive(ch, fail(), t0);
        sup.record_keepalive(ch, fail(), t0);
        assert_eq!(sup.record_keepalive(ch, Ok(()), t0), KeepaliveOutcome::Ok);
        assert_eq!(sup.consecutive_failures(ch), 0);
        assert!(matches!(
            sup.record_keepalive(ch, fail(), t0),
            KeepaliveOutcome::Retrying { consecutive: 1, .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn missed_margin_is_fatal_on_first_failure() {
        let robot = SimRobot::new();
        let mut sup = supervisor("op");
        let t0 = Instant::now();
        sup.connect(&robot, t0).await.unwrap();

        let late = t0 + Duration::from_millis(3_100);
        let outcome = sup.record_keepalive(
            KeepaliveChannel::Estop,
            Err(BridgeError::Timeout {
                operation: "send_estop_heartbeat".into(),
                timeout_ms: 500,
            }),
            late,
        );
        assert!(matches!(outcome, KeepaliveOutcome::Exhausted(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn lost_lease_is_fatal_immediately() {
        let robot = SimRobot::new();
        let mut sup = supervisor("op");
        let t0 = Instant::now();
        sup.connect(&robot, t0).await.unwrap();
        robot.steal_lease("tablet");

        let target = sup.keepalive_target(KeepaliveChannel::Lease).unwrap();
        let result = target.send(&robot, Duration::from_millis(500)).await;
        let outcome = sup.record_keepalive(target.channel(), result, t0);
        assert!(matches!(outcome, KeepaliveOutcome::Exhausted(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn release_is_best_effort() {
        let robot = SimRobot::new();
        let mut sup = supervisor("op");
        sup.connect(&robot, Instant::now()).await.unwrap();
        sup.mark_faulted("heartbeat lost");
        assert_eq!(sup.state(), LifecycleState::Faulted);
        assert!(sup.keepalive_target(KeepaliveChannel::Estop).is_none());

        robot.set_unreachable(true);
        let failures = sup.release(&robot).await;
        assert_eq!(failures.len(), 2);
        assert_eq!(sup.state(), LifecycleState::Disconnected);
        assert_eq!(sup.lease_status(), LeaseStatus::None);
        assert_eq!(sup.estop_status(), EstopStatus::NotConfigured);
        assert_eq!(sup.last_fault(), Some("heartbeat lost"));
    }

    #[tokio::test(start_paused = true)]
    async fn release_requires_an_active_session() {
        let robot = SimRobot::new();
        let mut sup = supervisor("op");
        assert_eq!(sup.begin_release(), Err(BridgeError::NotConnected));

        sup.connect(&robot, Instant::now()).await.unwrap();
        sup.begin_release().unwrap();
        assert_eq!(sup.state(), LifecycleState::Releasing);
        assert!(matches!(
            sup.begin_release(),
            Err(BridgeError::InvalidState { .. })
        ));
        sup.release(&robot).await;
        assert_eq!(robot.lease_holder(), None);
        assert_eq!(robot.registered_estops(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn estop_trigger_and_release_track_status() {
        let robot = SimRobot::new();
        let mut sup = supervisor("op");
        assert!(matches!(
            sup.trigger_estop(&robot).await,
            Err(BridgeError::EstopFault(_))
        ));

        sup.connect(&robot, Instant::now()).await.unwrap();
        sup.trigger_estop(&robot).await.unwrap();
        assert_eq!(sup.estop_status(), EstopStatus::Triggered);
        assert!(robot.is_estopped());
        sup.release_estop(&robot).await.unwrap();
        assert_eq!(sup.estop_status(), EstopStatus::Ok);
        assert!(!robot.is_estopped());
    }
}
