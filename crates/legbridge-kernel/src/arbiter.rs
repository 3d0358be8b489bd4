//! [`CommandArbiter`] – the single authoritative motion record of a session.
//!
//! Every velocity and pose request (keyboard-hold loops, sliders, the running
//! animation) passes through the arbiter, which clamps it, layers the active
//! animation on top, records it as the current command and forwards it to
//! the robot before returning.  There is no queue: the last writer wins.
//!
//! The arbiter also carries the command watchdog.  [`CommandArbiter::tick_watchdog`]
//! is driven on a fixed period by the runtime and forces a zero-velocity
//! command when motion has gone stale, along two independent paths:
//!
//! 1. **Command expiry**: no command of either kind within `command_expiry`
//!    (250 ms) while the last commanded velocity was non-zero.
//! 2. **Velocity trigger**: no *velocity* command within `watchdog_trigger`
//!    (500 ms) while motion was active, even if pose updates kept path 1
//!    quiet.
//!
//! The arbiter holds no lock of its own.  The owning session serialises every
//! call behind one mutex, which is what lets [`CommandArbiter::stop_all`] win
//! races against submissions that began before it.

use std::time::Duration;

use legbridge_hal::RobotCapabilities;
use legbridge_types::{
    AnimationKind, AnimationParams, BridgeError, LeaseHandle, LocomotionHint, MotionCommand,
    PoseDelta, Velocity, WatchdogReason,
};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::call::bounded;
use crate::oscillator::AnimationRequest;
use crate::validator::clamp_pose;

/// Timing parameters of the arbiter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ArbiterConfig {
    /// Path 1 window: silence of either command kind after non-zero motion.
    pub command_expiry: Duration,
    /// Path 2 window: silence of velocity commands while motion is active.
    pub watchdog_trigger: Duration,
    /// End time attached to each velocity command; the robot stops on its own
    /// after this long.
    pub command_end_time: Duration,
    /// Upper bound on every forwarding call.
    pub call_timeout: Duration,
}

impl Default for ArbiterConfig {
    fn default() -> Self {
        Self {
            command_expiry: Duration::from_millis(250),
            watchdog_trigger: Duration::from_millis(500),
            command_end_time: Duration::from_millis(250),
            call_timeout: Duration::from_millis(500),
        }
    }
}

/// A velocity submission as it arrives from the operator.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct VelocityRequest {
    pub velocity: Velocity,
    pub pose_overlay: Option<PoseDelta>,
    pub hint: Option<LocomotionHint>,
}

impl VelocityRequest {
    pub fn new(vx: f64, vy: f64, yaw_rate: f64) -> Self {
        Self {
            velocity: Velocity::new(vx, vy, yaw_rate),
            ..Self::default()
        }
    }

    pub fn with_pose(mut self, pose: PoseDelta) -> Self {
        self.pose_overlay = Some(pose);
        self
    }

    pub fn with_hint(mut self, hint: LocomotionHint) -> Self {
        self.hint = Some(hint);
        self
    }
}

/// Outcome of one watchdog tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogAction {
    Idle,
    /// A zero-velocity command was forwarded.
    Stopped(WatchdogReason),
}

/// Owns the current [`MotionCommand`] and the optional running
/// [`AnimationRequest`].  Both are replaced wholesale on every update.
#[derive(Debug)]
pub struct CommandArbiter {
    config: ArbiterConfig,
    current: MotionCommand,
    animation: Option<AnimationRequest>,
    last_command_at: Option<Instant>,
    last_velocity_at: Option<Instant>,
    last_forward_at: Option<Instant>,
    motion_active: bool,
}

impl CommandArbiter {
    pub fn new(config: ArbiterConfig) -> Self {
        Self {
            config,
            current: MotionCommand::halt(std::time::Instant::now()),
            animation: None,
            last_command_at: None,
            last_velocity_at: None,
            last_forward_at: None,
            motion_active: false,
        }
    }

    pub fn config(&self) -> &ArbiterConfig {
        &self.config
    }

    pub fn current(&self) -> &MotionCommand {
        &self.current
    }

    pub fn animation(&self) -> Option<&AnimationRequest> {
        self.animation.as_ref()
    }

    /// `true` while the last recorded velocity is non-zero and has not yet
    /// been zeroed by the watchdog or a stop.
    pub fn motion_active(&self) -> bool {
        self.motion_active
    }

    pub fn last_forward_at(&self) -> Option<Instant> {
        self.last_forward_at
    }

    /// Time since the last command of either kind.
    pub fn since_last_command(&self, now: Instant) -> Option<Duration> {
        self.last_command_at
            .map(|at| now.saturating_duration_since(at))
    }

    /// Forget every record without forwarding anything.  Used when a session
    /// starts afresh.
    pub fn reset(&mut self, now: Instant) {
        self.current = MotionCommand::halt(now.into_std());
        self.animation = None;
        self.last_command_at = None;
        self.last_velocity_at = None;
        self.last_forward_at = None;
        self.motion_active = false;
    }

    // ── Submissions ────────────────────────────────────────────────────────

    /// Clamp, layer, record and forward a velocity request.
    ///
    /// The running animation's pose at `now` is added to the explicit pose
    /// overlay and the sum is clamped once.
    ///
    /// # Errors
    ///
    /// The forwarding error.  The command stays recorded, so the watchdog
    /// still zeroes it if nothing fresher arrives.
    pub async fn submit_velocity(
        &mut self,
        robot: &dyn RobotCapabilities,
        lease: &LeaseHandle,
        request: VelocityRequest,
        now: Instant,
    ) -> Result<MotionCommand, BridgeError> {
        let base = request.pose_overlay.unwrap_or(PoseDelta::NEUTRAL);
        let layered = match &self.animation {
            Some(animation) => base + animation.pose_at(now),
            None => base,
        };
        let command = MotionCommand::new(request.velocity, layered, request.hint, now.into_std());

        self.current = command.clone();
        self.last_command_at = Some(now);
        self.last_velocity_at = Some(now);
        self.motion_active = !command.velocity().is_zero();

        self.forward_velocity(robot, lease, &command, now).await?;
        Ok(command)
    }

    /// Clamp, record and forward a standing body pose.  The recorded velocity
    /// is kept, so a pose update alone never restarts velocity staleness.
    ///
    /// # Errors
    ///
    /// [`BridgeError::AnimationActive`] while an animation is running, or the
    /// forwarding error.
    pub async fn submit_pose(
        &mut self,
        robot: &dyn RobotCapabilities,
        lease: &LeaseHandle,
        pose: PoseDelta,
        now: Instant,
    ) -> Result<MotionCommand, BridgeError> {
        if self.animation.is_some() {
            return Err(BridgeError::AnimationActive);
        }
        let command = MotionCommand::new(
            self.current.velocity(),
            pose,
            self.current.hint(),
            now.into_std(),
        );
        self.current = command.clone();
        self.last_command_at = Some(now);

        self.forward_pose(robot, lease, command.pose(), now).await?;
        Ok(command)
    }

    // ── Watchdog ───────────────────────────────────────────────────────────

    /// One watchdog period.  Forwards a zero-velocity command (pose and hint
    /// kept) when either staleness path fires.
    ///
    /// # Errors
    ///
    /// The forwarding error.  Motion stays marked active, so the next tick
    /// retries the stop.
    pub async fn tick_watchdog(
        &mut self,
        robot: &dyn RobotCapabilities,
        lease: &LeaseHandle,
        now: Instant,
    ) -> Result<WatchdogAction, BridgeError> {
        let Some(reason) = self.stale_reason(now) else {
            return Ok(WatchdogAction::Idle);
        };

        let stale_for = now
            .into_std()
            .saturating_duration_since(self.current.received_at());
        let halted = self.current.with_zero_velocity(now.into_std());
        self.forward_velocity(robot, lease, &halted, now).await?;
        self.current = halted;
        self.motion_active = false;
        warn!(?reason, ?stale_for, "Watchdog forced zero velocity");
        Ok(WatchdogAction::Stopped(reason))
    }

    fn stale_reason(&self, now: Instant) -> Option<WatchdogReason> {
        if !self.motion_active {
            return None;
        }
        let elapsed = |at: Option<Instant>| {
            at.map(|at| now.saturating_duration_since(at))
                .unwrap_or(Duration::MAX)
        };
        if elapsed(self.last_command_at) > self.config.command_expiry {
            Some(WatchdogReason::CommandExpired)
        } else if elapsed(self.last_velocity_at) > self.config.watchdog_trigger {
            Some(WatchdogReason::VelocityStale)
        } else {
            None
        }
    }

    // ── Stop ───────────────────────────────────────────────────────────────

    /// Cancel the animation, zero the record and forward a zero-velocity,
    /// neutral-pose command unconditionally.
    ///
    /// # Errors
    ///
    /// The forwarding error.  The session treats it as fatal.
    pub async fn stop_all(
        &mut self,
        robot: &dyn RobotCapabilities,
        lease: &LeaseHandle,
        now: Instant,
    ) -> Result<(), BridgeError> {
        let halt = MotionCommand::halt(now.into_std());
        self.animation = None;
        self.current = halt.clone();
        self.motion_active = false;
        self.last_command_at = Some(now);
        self.last_velocity_at = Some(now);
        self.forward_velocity(robot, lease, &halt, now).await
    }

    // ── Animation ──────────────────────────────────────────────────────────

    /// Replace the running animation.  Nothing is forwarded until the next
    /// animation frame or velocity submission.
    pub fn start_animation(&mut self, kind: AnimationKind, params: AnimationParams, now: Instant) {
        if let Some(previous) = &self.animation {
            debug!(previous = %previous.kind(), next = %kind, "Replacing animation");
        }
        self.animation = Some(AnimationRequest::new(kind, params, now));
    }

    /// Drop the running animation and reset the recorded pose to neutral
    /// without forwarding anything.  Velocity and hint are kept.
    pub fn clear_animation(&mut self, now: Instant) -> Option<AnimationKind> {
        let stopped = self.animation.take()?.kind();
        self.current = MotionCommand::new(
            self.current.velocity(),
            PoseDelta::NEUTRAL,
            self.current.hint(),
            now.into_std(),
        );
        Some(stopped)
    }

    /// Stop the running animation and return the body to a neutral pose.
    /// While walking the neutral pose rides on a velocity command that keeps
    /// the current velocity; otherwise a body-pose command is sent.
    ///
    /// # Errors
    ///
    /// The forwarding error.
    pub async fn stop_animation(
        &mut self,
        robot: &dyn RobotCapabilities,
        lease: &LeaseHandle,
        now: Instant,
    ) -> Result<Option<AnimationKind>, BridgeError> {
        let Some(stopped) = self.clear_animation(now) else {
            return Ok(None);
        };
        if self.motion_active {
            let neutral = self.current.clone();
            self.forward_velocity(robot, lease, &neutral, now).await?;
        } else {
            self.forward_pose(robot, lease, PoseDelta::NEUTRAL, now).await?;
        }
        Ok(Some(stopped))
    }

    /// One animation frame: forwards the animation's pose at `now` as a body
    /// pose.  Skipped while walking, where velocity submissions carry the
    /// overlay instead.
    ///
    /// # Errors
    ///
    /// The forwarding error.
    pub async fn tick_animation(
        &mut self,
        robot: &dyn RobotCapabilities,
        lease: &LeaseHandle,
        now: Instant,
    ) -> Result<Option<PoseDelta>, BridgeError> {
        if self.motion_active {
            return Ok(None);
        }
        let Some(animation) = &self.animation else {
            return Ok(None);
        };
        let pose = clamp_pose(animation.pose_at(now));
        self.current = MotionCommand::new(
            self.current.velocity(),
            pose,
            self.current.hint(),
            now.into_std(),
        );
        self.forward_pose(robot, lease, pose, now).await?;
        Ok(Some(pose))
    }

    // ── Forwarding ─────────────────────────────────────────────────────────

    async fn forward_velocity(
        &mut self,
        robot: &dyn RobotCapabilities,
        lease: &LeaseHandle,
        command: &MotionCommand,
        now: Instant,
    ) -> Result<(), BridgeError> {
        bounded(
            "send_velocity_command",
            self.config.call_timeout,
            robot.send_velocity_command(lease, command, self.config.command_end_time),
        )
        .await?;
        self.last_forward_at = Some(now);
        Ok(())
    }

    async fn forward_pose(
        &mut self,
        robot: &dyn RobotCapabilities,
        lease: &LeaseHandle,
        pose: PoseDelta,
        now: Instant,
    ) -> Result<(), BridgeError> {
        bounded(
            "send_body_pose_command",
            self.config.call_timeout,
            robot.send_body_pose_command(lease, &pose),
        )
        .await?;
        self.last_forward_at = Some(now);
        Ok(())
    }
}
