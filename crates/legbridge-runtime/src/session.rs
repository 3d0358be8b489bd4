//! [`Session`] – the session lifecycle state machine.
//!
//! A session composes the [`LeaseSupervisor`] and the [`CommandArbiter`]
//! behind a single `tokio::sync::Mutex`, which is the one exclusion boundary
//! of the whole supervisor.  Operator calls and the four background tasks
//! (lease renewal, e-stop heartbeat, command watchdog, animation pump) all go
//! through it.
//!
//! Lock discipline:
//!
//! - Motion forwarding (submissions, watchdog stops, `stop_all`) happens
//!   *while holding* the lock, so a `stop_all` can never be overtaken by a
//!   submission that started before it.
//! - Keepalive calls and one-shot commands (power, stand, sit) run *outside*
//!   the lock; the result is recorded afterwards only if the session
//!   generation has not changed in between.
//!
//! Every connect bumps the generation counter.  Background tasks carry the
//! generation they were spawned for and exit as soon as it no longer matches,
//! so no task outlives the connection it belongs to.
//!
//! Dropping the last handle of a connected session hands the lease and e-stop
//! to a detached teardown task, so they are returned even without an explicit
//! [`Session::disconnect`].

use std::ops::ControlFlow;
use std::sync::Arc;

use chrono::Utc;
use legbridge_hal::RobotCapabilities;
use legbridge_kernel::call::bounded;
use legbridge_kernel::{
    CommandArbiter, KeepaliveOutcome, LeaseSupervisor, VelocityRequest, WatchdogAction,
};
use legbridge_types::{
    AnimationKind, AnimationParams, BridgeError, Event, EventPayload, KeepaliveChannel, LeaseHandle,
    LifecycleState, MotionCommand, PoseDelta, RobotState, SessionStatus,
};
use tokio::sync::{Mutex, broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::diagnostics::{self, DiagnosticReport, DiagnosticSnapshot};
use crate::events::EventChannel;
use crate::tasks;

// ────────────────────────────────────────────────────────────────────────────
// Shared state
// ────────────────────────────────────────────────────────────────────────────

/// Everything guarded by the session lock.
pub(crate) struct SessionCore {
    pub(crate) supervisor: LeaseSupervisor,
    pub(crate) arbiter: CommandArbiter,
    pub(crate) powered: bool,
    pub(crate) standing: bool,
    pub(crate) generation: u64,
    shutdown: Option<watch::Sender<bool>>,
    tasks: Vec<JoinHandle<()>>,
}

impl SessionCore {
    /// Invalidate the current generation, signal its tasks and hand back
    /// their join handles.
    fn cancel_tasks(&mut self) -> Vec<JoinHandle<()>> {
        self.generation += 1;
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(true);
        }
        std::mem::take(&mut self.tasks)
    }
}

pub(crate) struct SessionInner {
    id: Uuid,
    robot: Arc<dyn RobotCapabilities>,
    config: SessionConfig,
    events: EventChannel,
    core: Mutex<SessionCore>,
}

impl SessionInner {
    pub(crate) fn config(&self) -> &SessionConfig {
        &self.config
    }

    fn robot(&self) -> &dyn RobotCapabilities {
        self.robot.as_ref()
    }

    /// Drop the animation and forward a neutral pose.  A forwarding failure
    /// is logged; the recorded pose is neutral either way.
    async fn clear_animation_locked(
        &self,
        core: &mut SessionCore,
        lease: &LeaseHandle,
        why: &str,
    ) {
        match core
            .arbiter
            .stop_animation(self.robot(), lease, Instant::now())
            .await
        {
            Ok(Some(kind)) => info!(%kind, why, "Animation cancelled"),
            Ok(None) => {}
            Err(e) => warn!(error = %e, why, "Animation cancelled; neutral pose not forwarded"),
        }
    }

    /// Fold a fresh robot status into the session's stance record, unless
    /// the connection it was queried for has ended.
    async fn observe_robot(&self, generation: u64, robot: &RobotState) {
        let mut core = self.core.lock().await;
        if core.generation != generation || !core.supervisor.is_active() {
            return;
        }
        if core.standing && !robot.standing {
            info!("Robot reports it is no longer standing");
        }
        core.powered = robot.powered;
        core.standing = robot.standing;
    }

    fn transition(&self, from: LifecycleState, to: LifecycleState) {
        if from == to {
            return;
        }
        info!(session = %self.id, %from, %to, "Lifecycle transition");
        self.events.publish(EventPayload::LifecycleChanged { from, to });
    }

    /// The fail-safe path: exactly one `stop_all`, then best-effort release,
    /// then `Disconnected`.  The caller holds the lock and has checked the
    /// generation.
    async fn fault_locked(&self, core: &mut SessionCore, cause: &BridgeError) {
        let from = core.supervisor.state();
        core.supervisor.mark_faulted(cause.to_string());
        self.transition(from, LifecycleState::Faulted);
        self.events.publish(EventPayload::SessionFaulted {
            cause: cause.to_string(),
        });

        if let Some(lease) = core.supervisor.lease().cloned()
            && let Err(e) = core
                .arbiter
                .stop_all(self.robot(), &lease, Instant::now())
                .await
        {
            error!(error = %e, "Fail-safe stop could not be forwarded");
        }

        // Detached: the remaining tasks observe the shutdown signal and exit.
        drop(core.cancel_tasks());

        let failures = core.supervisor.release(self.robot()).await;
        if !failures.is_empty() {
            warn!(count = failures.len(), "Teardown after fault was incomplete");
        }
        core.powered = false;
        core.standing = false;
        self.transition(LifecycleState::Faulted, LifecycleState::Disconnected);
    }

    // ── Background cycles ──────────────────────────────────────────────────

    pub(crate) async fn watchdog_cycle(&self, generation: u64) -> ControlFlow<()> {
        let mut guard = self.core.lock().await;
        let core = &mut *guard;
        if core.generation != generation {
            return ControlFlow::Break(());
        }
        let Ok(lease) = core.supervisor.require_active("tick_watchdog").cloned() else {
            return ControlFlow::Break(());
        };
        match core
            .arbiter
            .tick_watchdog(self.robot(), &lease, Instant::now())
            .await
        {
            Ok(WatchdogAction::Stopped(reason)) => {
                self.events.publish(EventPayload::WatchdogStop { reason });
            }
            Ok(WatchdogAction::Idle) => {}
            Err(e) => warn!(error = %e, "Watchdog stop not forwarded; retrying next tick"),
        }
        ControlFlow::Continue(())
    }

    pub(crate) async fn keepalive_cycle(
        &self,
        channel: KeepaliveChannel,
        generation: u64,
    ) -> ControlFlow<()> {
        let target = {
            let core = self.core.lock().await;
            if core.generation != generation {
                return ControlFlow::Break(());
            }
            match core.supervisor.keepalive_target(channel) {
                Some(target) => target,
                None => return ControlFlow::Break(()),
            }
        };

        let result = target.send(self.robot(), self.config.call_timeout()).await;

        let mut guard = self.core.lock().await;
        let core = &mut *guard;
        if core.generation != generation {
            return ControlFlow::Break(());
        }
        match core.supervisor.record_keepalive(channel, result, Instant::now()) {
            KeepaliveOutcome::Ok => ControlFlow::Continue(()),
            KeepaliveOutcome::Retrying { consecutive, error } => {
                self.events.publish(EventPayload::KeepaliveFailure {
                    channel,
                    consecutive,
                    error: error.to_string(),
                });
                ControlFlow::Continue(())
            }
            KeepaliveOutcome::Exhausted(cause) => {
                self.events.publish(EventPayload::KeepaliveFailure {
                    channel,
                    consecutive: core.supervisor.consecutive_failures(channel),
                    error: cause.to_string(),
                });
                self.fault_locked(core, &cause).await;
                ControlFlow::Break(())
            }
        }
    }

    pub(crate) async fn animation_cycle(&self, generation: u64) -> ControlFlow<()> {
        let mut guard = self.core.lock().await;
        let core = &mut *guard;
        if core.generation != generation {
            return ControlFlow::Break(());
        }
        let Ok(lease) = core.supervisor.require_active("tick_animation").cloned() else {
            return ControlFlow::Break(());
        };
        if core.arbiter.animation().is_none() {
            return ControlFlow::Continue(());
        }
        if !core.standing {
            self.clear_animation_locked(core, &lease, "robot no longer standing")
                .await;
            return ControlFlow::Continue(());
        }
        if let Err(e) = core
            .arbiter
            .tick_animation(self.robot(), &lease, Instant::now())
            .await
        {
            debug!(error = %e, "Animation frame dropped");
        }
        ControlFlow::Continue(())
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        let core = self.core.get_mut();
        if core.supervisor.lease().is_none() {
            return;
        }
        drop(core.cancel_tasks());
        let mut supervisor =
            std::mem::replace(&mut core.supervisor, LeaseSupervisor::new(self.config.supervisor()));
        let mut arbiter =
            std::mem::replace(&mut core.arbiter, CommandArbiter::new(self.config.arbiter()));
        let robot = Arc::clone(&self.robot);
        let session = self.id;

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            error!(
                %session,
                "Connected session dropped outside a runtime; lease and e-stop stay held until they expire"
            );
            return;
        };
        warn!(%session, "Connected session dropped; releasing lease and e-stop");
        runtime.spawn(async move {
            if let Some(lease) = supervisor.lease().cloned()
                && let Err(e) = arbiter.stop_all(robot.as_ref(), &lease, Instant::now()).await
            {
                error!(%session, error = %e, "Stop on drop could not be forwarded");
            }
            let failures = supervisor.release(robot.as_ref()).await;
            if !failures.is_empty() {
                warn!(%session, count = failures.len(), "Release on drop was incomplete");
            }
        });
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Session
// ────────────────────────────────────────────────────────────────────────────

/// One operator's control session over one robot.  Clones share the session.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use legbridge_hal::SimRobot;
/// use legbridge_kernel::VelocityRequest;
/// use legbridge_runtime::{Session, SessionConfig};
/// use legbridge_types::LifecycleState;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let session = Session::new(Arc::new(SimRobot::new()), SessionConfig::default()).unwrap();
/// session.connect().await.unwrap();
/// session.power_on().await.unwrap();
/// session.stand().await.unwrap();
/// session.submit_velocity(VelocityRequest::new(0.3, 0.0, 0.0)).await.unwrap();
/// session.disconnect().await.unwrap();
/// assert_eq!(session.state().await, LifecycleState::Disconnected);
/// # }
/// ```
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// # Errors
    ///
    /// [`BridgeError::Config`] when `config` fails validation.
    pub fn new(
        robot: Arc<dyn RobotCapabilities>,
        config: SessionConfig,
    ) -> Result<Self, BridgeError> {
        config.validate()?;
        let core = SessionCore {
            supervisor: LeaseSupervisor::new(config.supervisor()),
            arbiter: CommandArbiter::new(config.arbiter()),
            powered: false,
            standing: false,
            generation: 0,
            shutdown: None,
            tasks: Vec::new(),
        };
        Ok(Self {
            inner: Arc::new(SessionInner {
                id: Uuid::new_v4(),
                robot,
                config,
                events: EventChannel::default(),
                core: Mutex::new(core),
            }),
        })
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.inner.events.subscribe()
    }

    pub async fn state(&self) -> LifecycleState {
        self.inner.core.lock().await.supervisor.state()
    }

    // ── Lifecycle ──────────────────────────────────────────────────────────

    /// Acquire the lease and e-stop, then start the background tasks.
    ///
    /// # Errors
    ///
    /// [`BridgeError::InvalidState`] unless disconnected,
    /// [`BridgeError::LeaseConflict`] when another client holds the lease, or
    /// any transport failure during acquisition.  The session is left
    /// `Disconnected` on every error.
    pub async fn connect(&self) -> Result<(), BridgeError> {
        let inner = &self.inner;
        let mut guard = inner.core.lock().await;
        let core = &mut *guard;
        let from = core.supervisor.state();
        if from != LifecycleState::Disconnected {
            return Err(BridgeError::invalid_state("connect", from));
        }

        inner.transition(from, LifecycleState::Acquiring);
        let now = Instant::now();
        if let Err(e) = core.supervisor.connect(inner.robot(), now).await {
            inner.transition(LifecycleState::Acquiring, LifecycleState::Disconnected);
            return Err(e);
        }
        core.arbiter.reset(now);

        match bounded("get_status", inner.config.call_timeout(), inner.robot.get_status()).await {
            Ok(robot) => {
                core.powered = robot.powered;
                core.standing = robot.standing;
            }
            Err(e) => {
                warn!(error = %e, "Initial status query failed; assuming unpowered");
                core.powered = false;
                core.standing = false;
            }
        }

        core.generation += 1;
        let (shutdown, shutdown_rx) = watch::channel(false);
        core.tasks = tasks::spawn_all(inner, core.generation, shutdown_rx);
        core.shutdown = Some(shutdown);
        inner.transition(LifecycleState::Acquiring, LifecycleState::Active);
        Ok(())
    }

    /// Graceful teardown: `stop_all`, stop the background tasks, de-register
    /// the e-stop and return the lease.  Release failures are logged, never
    /// returned.
    ///
    /// # Errors
    ///
    /// [`BridgeError::NotConnected`] / [`BridgeError::InvalidState`] when
    /// there is no active session, or the `stop_all` forwarding error (the
    /// teardown still completes).
    pub async fn disconnect(&self) -> Result<(), BridgeError> {
        let inner = &self.inner;
        let (handles, stopped) = {
            let mut guard = inner.core.lock().await;
            let core = &mut *guard;
            core.supervisor.begin_release()?;
            inner.transition(LifecycleState::Active, LifecycleState::Releasing);

            let stopped = match core.supervisor.lease().cloned() {
                Some(lease) => {
                    core.arbiter
                        .stop_all(inner.robot(), &lease, Instant::now())
                        .await
                }
                None => Ok(()),
            };
            if let Err(e) = &stopped {
                error!(error = %e, "Stop before release could not be forwarded");
            }
            (core.cancel_tasks(), stopped)
        };

        for handle in handles {
            if let Err(e) = handle.await
                && e.is_panic()
            {
                error!(error = %e, "Session task panicked");
            }
        }

        let mut core = inner.core.lock().await;
        let failures = core.supervisor.release(inner.robot()).await;
        if !failures.is_empty() {
            warn!(count = failures.len(), "Release was incomplete");
        }
        core.powered = false;
        core.standing = false;
        inner.transition(LifecycleState::Releasing, LifecycleState::Disconnected);
        stopped
    }

    // ── One-shot robot commands ────────────────────────────────────────────

    pub async fn power_on(&self) -> Result<(), BridgeError> {
        let (lease, generation) = self.begin_one_shot("power_on", false).await?;
        self.one_shot("power_on", self.inner.robot.power_on(&lease)).await?;
        self.finish_one_shot(generation, |core| core.powered = true)
            .await;
        info!("Motors powered on");
        Ok(())
    }

    pub async fn power_off(&self) -> Result<(), BridgeError> {
        let (lease, generation) = self.begin_one_shot("power_off", true).await?;
        self.one_shot("power_off", self.inner.robot.power_off(&lease)).await?;
        self.finish_one_shot(generation, |core| {
            core.powered = false;
            core.standing = false;
        })
        .await;
        info!("Motors powered off");
        Ok(())
    }

    pub async fn stand(&self) -> Result<(), BridgeError> {
        let (lease, generation) = self.begin_one_shot("stand", false).await?;
        self.one_shot("stand", self.inner.robot.stand(&lease)).await?;
        self.finish_one_shot(generation, |core| core.standing = true)
            .await;
        info!("Robot standing");
        Ok(())
    }

    pub async fn sit(&self) -> Result<(), BridgeError> {
        let (lease, generation) = self.begin_one_shot("sit", true).await?;
        self.one_shot("sit", self.inner.robot.sit(&lease)).await?;
        self.finish_one_shot(generation, |core| core.standing = false)
            .await;
        info!("Robot sitting");
        Ok(())
    }

    /// Snapshot the lease under the lock.  Leaving the standing stance drops
    /// any running animation and returns the body to neutral first.
    async fn begin_one_shot(
        &self,
        operation: &str,
        leaves_stance: bool,
    ) -> Result<(LeaseHandle, u64), BridgeError> {
        let mut guard = self.inner.core.lock().await;
        let core = &mut *guard;
        let lease = core.supervisor.require_active(operation)?.clone();
        if leaves_stance {
            self.inner
                .clear_animation_locked(core, &lease, operation)
                .await;
        }
        Ok((lease, core.generation))
    }

    async fn one_shot<F>(&self, operation: &str, call: F) -> Result<(), BridgeError>
    where
        F: std::future::Future<Output = Result<(), BridgeError>>,
    {
        bounded(operation, self.inner.config.one_shot_timeout(), call)
            .await
            .inspect_err(|e| warn!(operation, error = %e, "Robot command failed"))
    }

    async fn finish_one_shot(&self, generation: u64, apply: impl FnOnce(&mut SessionCore)) {
        let mut core = self.inner.core.lock().await;
        if core.generation == generation && core.supervisor.is_active() {
            apply(&mut *core);
        }
    }

    // ── Stops ──────────────────────────────────────────────────────────────

    /// `stop_all` followed by the software e-stop: motors are cut.
    ///
    /// # Errors
    ///
    /// The e-stop trigger error, or the zero-velocity forwarding error.  A
    /// failed zero-velocity command always faults the session, even when the
    /// e-stop was asserted.
    pub async fn emergency_stop(&self) -> Result<(), BridgeError> {
        let inner = &self.inner;
        let mut guard = inner.core.lock().await;
        let core = &mut *guard;
        let lease = core.supervisor.require_active("emergency_stop")?.clone();
        warn!(session = %inner.id, "Emergency stop");

        let stopped = core
            .arbiter
            .stop_all(inner.robot(), &lease, Instant::now())
            .await;
        let triggered = core.supervisor.trigger_estop(inner.robot()).await;
        match (stopped, triggered) {
            (Ok(()), Ok(())) => {
                core.powered = false;
                core.standing = false;
                inner.events.publish(EventPayload::EmergencyStop {
                    source: "operator".to_string(),
                });
                Ok(())
            }
            (Err(stop_error), Ok(())) => {
                error!(error = %stop_error, "Zero-velocity command failed; e-stop asserted");
                inner.events.publish(EventPayload::EmergencyStop {
                    source: "operator".to_string(),
                });
                inner.fault_locked(core, &stop_error).await;
                Err(stop_error)
            }
            (Ok(()), Err(e)) => {
                error!(error = %e, "Software e-stop could not be asserted");
                Err(e)
            }
            (Err(stop_error), Err(e)) => {
                error!(error = %e, "Neither stop nor e-stop reached the robot");
                inner.fault_locked(core, &stop_error).await;
                Err(e)
            }
        }
    }

    /// Clear the software e-stop so the motors may be powered again.
    pub async fn release_estop(&self) -> Result<(), BridgeError> {
        let inner = &self.inner;
        let mut core = inner.core.lock().await;
        core.supervisor.require_active("release_estop")?;
        core.supervisor.release_estop(inner.robot()).await?;
        info!("Software e-stop released");
        Ok(())
    }

    /// Non-latching stop: zero velocity, neutral pose, animation cancelled.
    ///
    /// # Errors
    ///
    /// The forwarding error, after which the session has faulted.
    pub async fn stop_motion(&self) -> Result<(), BridgeError> {
        let inner = &self.inner;
        let mut guard = inner.core.lock().await;
        let core = &mut *guard;
        let lease = core.supervisor.require_active("stop_motion")?.clone();
        if let Err(e) = core
            .arbiter
            .stop_all(inner.robot(), &lease, Instant::now())
            .await
        {
            inner.fault_locked(core, &e).await;
            return Err(e);
        }
        Ok(())
    }

    // ── Motion ─────────────────────────────────────────────────────────────

    /// Clamp, layer and forward a velocity request.  Returns the command as
    /// forwarded.
    pub async fn submit_velocity(
        &self,
        request: VelocityRequest,
    ) -> Result<MotionCommand, BridgeError> {
        let inner = &self.inner;
        let mut guard = inner.core.lock().await;
        let core = &mut *guard;
        let lease = core.supervisor.require_active("submit_velocity")?.clone();
        core.arbiter
            .submit_velocity(inner.robot(), &lease, request, Instant::now())
            .await
    }

    /// Clamp and forward a standing body pose.
    ///
    /// # Errors
    ///
    /// [`BridgeError::AnimationActive`] while an animation runs.
    pub async fn submit_pose(&self, pose: PoseDelta) -> Result<MotionCommand, BridgeError> {
        let inner = &self.inner;
        let mut guard = inner.core.lock().await;
        let core = &mut *guard;
        let lease = core.supervisor.require_active("submit_pose")?.clone();
        core.arbiter
            .submit_pose(inner.robot(), &lease, pose, Instant::now())
            .await
    }

    /// Start (or replace) the procedural animation.
    ///
    /// # Errors
    ///
    /// [`BridgeError::NotStanding`] unless the robot is standing.
    pub async fn start_animation(
        &self,
        kind: AnimationKind,
        params: AnimationParams,
    ) -> Result<(), BridgeError> {
        let mut core = self.inner.core.lock().await;
        core.supervisor.require_active("start_animation")?;
        if !core.standing {
            return Err(BridgeError::NotStanding("start_animation".to_string()));
        }
        core.arbiter.start_animation(kind, params, Instant::now());
        info!(%kind, "Animation started");
        Ok(())
    }

    /// Stop the animation and return the body to neutral.  Returns the kind
    /// that was running, if any.
    pub async fn stop_animation(&self) -> Result<Option<AnimationKind>, BridgeError> {
        let inner = &self.inner;
        let mut guard = inner.core.lock().await;
        let core = &mut *guard;
        let lease = core.supervisor.require_active("stop_animation")?.clone();
        let stopped = core
            .arbiter
            .stop_animation(inner.robot(), &lease, Instant::now())
            .await?;
        if let Some(kind) = stopped {
            info!(%kind, "Animation stopped");
        }
        Ok(stopped)
    }

    // ── Introspection ──────────────────────────────────────────────────────

    /// Session snapshot plus a fresh robot status query (omitted when the
    /// robot does not answer in time).
    pub async fn get_status(&self) -> SessionStatus {
        let inner = &self.inner;
        let (mut status, generation) = {
            let core = inner.core.lock().await;
            let status = SessionStatus {
                session_id: inner.id,
                lifecycle_state: core.supervisor.state(),
                lease_status: core.supervisor.lease_status(),
                estop_status: core.supervisor.estop_status(),
                powered: core.powered,
                standing: core.standing,
                motion_active: core.arbiter.motion_active(),
                animation: core.arbiter.animation().map(|a| a.kind()),
                robot: None,
                last_fault: core.supervisor.last_fault().map(str::to_string),
                timestamp: Utc::now(),
            };
            (status, core.generation)
        };
        status.robot = bounded("get_status", inner.config.call_timeout(), inner.robot.get_status())
            .await
            .ok();
        if let Some(robot) = &status.robot {
            inner.observe_robot(generation, robot).await;
            if status.lifecycle_state == LifecycleState::Active {
                status.powered = robot.powered;
                status.standing = robot.standing;
            }
        }
        status
    }

    /// Run the health checks.
    pub async fn diagnose(&self) -> DiagnosticReport {
        let inner = &self.inner;
        let (snapshot, generation) = {
            let core = inner.core.lock().await;
            let snapshot =
                DiagnosticSnapshot::capture(&core.supervisor, &core.arbiter, Instant::now());
            (snapshot, core.generation)
        };
        let robot =
            bounded("get_status", inner.config.call_timeout(), inner.robot.get_status()).await;
        if let Ok(state) = &robot {
            inner.observe_robot(generation, state).await;
        }
        diagnostics::build_report(&snapshot, robot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use legbridge_hal::{SentCommand, SimRobot};
    use legbridge_types::{EstopStatus, LeaseStatus};
    use std::time::Duration;

    fn session(robot: &Arc<SimRobot>) -> Session {
        Session::new(robot.clone(), SessionConfig::default()).unwrap()
    }

    async fn standing(robot: &Arc<SimRobot>) -> Session {
        let s = session(robot);
        s.connect().await.unwrap();
        s.power_on().await.unwrap();
        s.stand().await.unwrap();
        s
    }

    #[tokio::test(start_paused = true)]
    async fn operations_require_a_connection() {
        let robot = Arc::new(SimRobot::new());
        let s = session(&robot);
        assert_eq!(s.power_on().await, Err(BridgeError::NotConnected));
        assert_eq!(
            s.submit_velocity(VelocityRequest::new(0.1, 0.0, 0.0)).await,
            Err(BridgeError::NotConnected)
        );
        assert_eq!(s.disconnect().await, Err(BridgeError::NotConnected));
        assert!(robot.commands().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn connect_then_disconnect_releases_everything() {
        let robot = Arc::new(SimRobot::new());
        let s = session(&robot);
        let mut events = s.subscribe();
        s.connect().await.unwrap();

        let status = s.get_status().await;
        assert_eq!(status.lifecycle_state, LifecycleState::Active);
        assert_eq!(status.lease_status, LeaseStatus::Active);
        assert_eq!(status.estop_status, EstopStatus::Ok);
        assert!(status.robot.is_some());

        s.disconnect().await.unwrap();
        assert_eq!(s.state().await, LifecycleState::Disconnected);
        assert_eq!(robot.lease_holder(), None);
        assert_eq!(robot.registered_estops(), 0);
        // Teardown always forwards a halt, even without motion.
        assert!(robot.last_command().unwrap().is_stationary());

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let EventPayload::LifecycleChanged { to, .. } = event.payload {
                seen.push(to);
            }
        }
        assert_eq!(
            seen,
            vec![
                LifecycleState::Acquiring,
                LifecycleState::Active,
                LifecycleState::Releasing,
                LifecycleState::Disconnected,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn keepalives_run_on_their_own_schedules() {
        let robot = Arc::new(SimRobot::new());
        let s = session(&robot);
        s.connect().await.unwrap();
        tokio::time::sleep(Duration::from_millis(4_100)).await;
        assert_eq!(robot.heartbeat_count(), 4);
        assert_eq!(robot.renewal_count(), 2);
        s.disconnect().await.unwrap();

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(robot.heartbeat_count(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn animation_requires_standing() {
        let robot = Arc::new(SimRobot::new());
        let s = session(&robot);
        s.connect().await.unwrap();
        let err = s
            .start_animation(AnimationKind::Bounce, AnimationParams::default())
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::NotStanding(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn sitting_cancels_the_animation() {
        let robot = Arc::new(SimRobot::new());
        let s = standing(&robot).await;
        s.start_animation(AnimationKind::Sway, AnimationParams::default())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(matches!(robot.last_command(), Some(SentCommand::BodyPose(_))));

        s.sit().await.unwrap();
        let status = s.get_status().await;
        assert!(!status.standing);
        assert_eq!(status.animation, None);
    }

    #[tokio::test(start_paused = true)]
    async fn emergency_stop_cuts_power_and_blocks_power_on() {
        let robot = Arc::new(SimRobot::new());
        let s = standing(&robot).await;
        let mut events = s.subscribe();
        s.submit_velocity(VelocityRequest::new(0.5, 0.0, 0.0))
            .await
            .unwrap();

        s.emergency_stop().await.unwrap();
        let status = s.get_status().await;
        assert_eq!(status.estop_status, EstopStatus::Triggered);
        assert!(!status.powered);
        assert!(!status.motion_active);
        assert!(robot.is_estopped());
        assert!(matches!(
            events.recv().await.unwrap().payload,
            EventPayload::EmergencyStop { .. }
        ));

        assert!(matches!(s.power_on().await, Err(BridgeError::EstopFault(_))));
        s.release_estop().await.unwrap();
        s.power_on().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn emergency_stop_with_unforwarded_halt_faults_the_session() {
        let robot = Arc::new(SimRobot::new());
        let s = standing(&robot).await;
        s.submit_velocity(VelocityRequest::new(0.5, 0.0, 0.0))
            .await
            .unwrap();

        robot.set_fail_commands(true);
        let err = s.emergency_stop().await.unwrap_err();
        assert!(matches!(err, BridgeError::Transport { .. }));

        let status = s.get_status().await;
        assert_eq!(status.lifecycle_state, LifecycleState::Disconnected);
        assert!(status.last_fault.is_some());
        assert!(robot.is_estopped());
        assert_eq!(robot.lease_holder(), None);
        assert_eq!(robot.registered_estops(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_a_connected_session_returns_lease_and_estop() {
        let robot = Arc::new(SimRobot::new());
        let s = standing(&robot).await;
        s.submit_velocity(VelocityRequest::new(0.4, 0.0, 0.0))
            .await
            .unwrap();

        drop(s);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(robot.lease_holder(), None);
        assert_eq!(robot.registered_estops(), 0);
        assert!(robot.last_command().unwrap().is_stationary());

        // The robot is free for the next operator.
        let next = session(&robot);
        next.connect().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_a_disconnected_session_touches_nothing() {
        let robot = Arc::new(SimRobot::new());
        let s = session(&robot);
        s.connect().await.unwrap();
        s.disconnect().await.unwrap();
        robot.clear_commands();

        drop(s);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(robot.commands().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn robot_sitting_on_its_own_ends_the_animation() {
        let robot = Arc::new(SimRobot::new());
        let s = standing(&robot).await;
        s.start_animation(AnimationKind::Bounce, AnimationParams::default())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;

        robot.knock_down();
        let status = s.get_status().await;
        assert!(!status.standing);
        assert!(status.powered);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(s.get_status().await.animation, None);
        assert_eq!(
            robot.last_command(),
            Some(SentCommand::BodyPose(PoseDelta::NEUTRAL))
        );
        assert!(matches!(
            s.start_animation(AnimationKind::Bounce, AnimationParams::default())
                .await,
            Err(BridgeError::NotStanding(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_one_shot_is_reported_once_and_changes_nothing() {
        let robot = Arc::new(SimRobot::new());
        let s = session(&robot);
        s.connect().await.unwrap();
        robot.set_fail_one_shots(true);
        assert!(matches!(
            s.power_on().await,
            Err(BridgeError::Transport { .. })
        ));
        assert!(!s.get_status().await.powered);
        assert_eq!(s.state().await, LifecycleState::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_motion_failure_faults_the_session() {
        let robot = Arc::new(SimRobot::new());
        let s = standing(&robot).await;
        robot.set_fail_commands(true);
        assert!(s.stop_motion().await.is_err());
        let status = s.get_status().await;
        assert_eq!(status.lifecycle_state, LifecycleState::Disconnected);
        assert!(status.last_fault.is_some());
        assert_eq!(robot.lease_holder(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn session_can_reconnect_after_disconnect() {
        let robot = Arc::new(SimRobot::new());
        let s = session(&robot);
        s.connect().await.unwrap();
        s.disconnect().await.unwrap();
        s.connect().await.unwrap();
        assert_eq!(s.state().await, LifecycleState::Active);
        assert!(matches!(
            s.connect().await,
            Err(BridgeError::InvalidState { .. })
        ));
    }
}
