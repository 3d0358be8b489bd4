//! In-process simulated robot for CI/CD testing without physical hardware.
//!
//! [`SimRobot`] implements [`RobotCapabilities`] with plausible behaviour:
//! a single lease holder (so two sessions sharing one `SimRobot` conflict),
//! registered e-stop endpoints, power / stance bookkeeping, and a log of the
//! most recent [`COMMAND_LOG_CAPACITY`] forwarded motion commands.  Fault-injection switches let tests break the
//! lease channel, the e-stop channel or command forwarding on demand.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use legbridge_hal::{RobotCapabilities, SimRobot};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let robot = Arc::new(SimRobot::new().with_nickname("spot-sim"));
//! let lease = robot.acquire_lease("operator").await.expect("free lease");
//! assert!(robot.acquire_lease("intruder").await.is_err());
//! robot.release_lease(&lease).await.expect("release");
//! # }
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use legbridge_types::{
    BridgeError, EstopHandle, LeaseHandle, MotionCommand, PoseDelta, RobotState,
};
use tracing::debug;

use crate::robot::RobotCapabilities;

// ────────────────────────────────────────────────────────────────────────────
// Recorded traffic
// ────────────────────────────────────────────────────────────────────────────

/// A motion command received by the simulated robot.
#[derive(Debug, Clone, PartialEq)]
pub enum SentCommand {
    Velocity {
        command: MotionCommand,
        end_time: Duration,
    },
    BodyPose(PoseDelta),
}

impl SentCommand {
    /// `true` for a zero-velocity command or any body-pose command.
    pub fn is_stationary(&self) -> bool {
        match self {
            SentCommand::Velocity { command, .. } => command.velocity().is_zero(),
            SentCommand::BodyPose(_) => true,
        }
    }

    /// The body pose carried by the command.
    pub fn pose(&self) -> PoseDelta {
        match self {
            SentCommand::Velocity { command, .. } => command.pose(),
            SentCommand::BodyPose(pose) => *pose,
        }
    }
}

/// Forwarded commands kept for inspection; older ones are dropped.  At the
/// 20 Hz animation rate this is roughly a minute of traffic.
pub const COMMAND_LOG_CAPACITY: usize = 1_024;

/// Independent fault-injection switches.
#[derive(Debug, Clone, Default)]
struct SimFaults {
    fail_heartbeats: bool,
    fail_lease_renewals: bool,
    fail_commands: bool,
    fail_one_shots: bool,
    fail_estop_registration: bool,
    unreachable: bool,
}

// ────────────────────────────────────────────────────────────────────────────
// Internal state
// ────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct SimState {
    next_id: u64,
    lease: Option<LeaseHandle>,
    estops: HashMap<u64, Duration>,
    estopped: bool,
    powered: bool,
    standing: bool,
    commands: VecDeque<SentCommand>,
    heartbeats: u64,
    renewals: u64,
    faults: SimFaults,
}

impl SimState {
    fn issue_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn check_lease(&self, lease: &LeaseHandle, operation: &str) -> Result<(), BridgeError> {
        match &self.lease {
            Some(held) if held == lease => Ok(()),
            _ => Err(BridgeError::LeaseLost(format!(
                "{operation}: lease {} is not the active lease",
                lease.id()
            ))),
        }
    }

    fn record(&mut self, sent: SentCommand) {
        if self.commands.len() == COMMAND_LOG_CAPACITY {
            self.commands.pop_front();
        }
        self.commands.push_back(sent);
    }

    fn check_estop(&self, estop: &EstopHandle, operation: &str) -> Result<(), BridgeError> {
        if self.estops.contains_key(&estop.id()) {
            Ok(())
        } else {
            Err(BridgeError::EstopFault(format!(
                "{operation}: endpoint {} is not registered",
                estop.id()
            )))
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// SimRobot
// ────────────────────────────────────────────────────────────────────────────

/// A simulated legged robot.  Share it between sessions through an `Arc`.
pub struct SimRobot {
    serial_number: String,
    nickname: String,
    battery_percent: f32,
    call_delay: Mutex<Duration>,
    state: Mutex<SimState>,
}

impl Default for SimRobot {
    fn default() -> Self {
        Self::new()
    }
}

impl SimRobot {
    /// A healthy, unpowered, sitting robot with no lease holder.
    pub fn new() -> Self {
        Self {
            serial_number: "sim-0001".to_string(),
            nickname: "sim".to_string(),
            battery_percent: 87.0,
            call_delay: Mutex::new(Duration::ZERO),
            state: Mutex::new(SimState::default()),
        }
    }

    pub fn with_nickname(mut self, nickname: impl Into<String>) -> Self {
        self.nickname = nickname.into();
        self
    }

    pub fn with_battery(mut self, percent: f32) -> Self {
        self.battery_percent = percent;
        self
    }

    /// Every capability call sleeps for `delay` before executing.
    pub fn with_call_delay(self, delay: Duration) -> Self {
        self.set_call_delay(delay);
        self
    }

    pub fn set_call_delay(&self, delay: Duration) {
        *self
            .call_delay
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = delay;
    }

    pub fn set_fail_heartbeats(&self, fail: bool) {
        self.state().faults.fail_heartbeats = fail;
    }

    pub fn set_fail_lease_renewals(&self, fail: bool) {
        self.state().faults.fail_lease_renewals = fail;
    }

    pub fn set_fail_commands(&self, fail: bool) {
        self.state().faults.fail_commands = fail;
    }

    pub fn set_fail_one_shots(&self, fail: bool) {
        self.state().faults.fail_one_shots = fail;
    }

    pub fn set_fail_estop_registration(&self, fail: bool) {
        self.state().faults.fail_estop_registration = fail;
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.state().faults.unreachable = unreachable;
    }

    /// Simulate the robot sitting down (or falling) without any command from
    /// the lease holder.
    pub fn knock_down(&self) {
        self.state().standing = false;
    }

    /// Simulate another client forcibly taking the lease.
    pub fn steal_lease(&self, thief: &str) {
        let mut state = self.state();
        let id = state.issue_id();
        state.lease = Some(LeaseHandle::new(id, thief));
    }

    /// The retained motion commands, oldest first.
    pub fn commands(&self) -> Vec<SentCommand> {
        self.state().commands.iter().cloned().collect()
    }

    pub fn last_command(&self) -> Option<SentCommand> {
        self.state().commands.back().cloned()
    }

    pub fn clear_commands(&self) {
        self.state().commands.clear();
    }

    pub fn lease_holder(&self) -> Option<String> {
        self.state().lease.as_ref().map(|l| l.holder().to_string())
    }

    pub fn registered_estops(&self) -> usize {
        self.state().estops.len()
    }

    pub fn heartbeat_count(&self) -> u64 {
        self.state().heartbeats
    }

    pub fn renewal_count(&self) -> u64 {
        self.state().renewals
    }

    pub fn is_estopped(&self) -> bool {
        self.state().estopped
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn simulate_latency(&self) {
        let delay = *self
            .call_delay
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    fn reachable(&self, state: &SimState, operation: &str) -> Result<(), BridgeError> {
        if state.faults.unreachable {
            Err(BridgeError::transport(operation, "connection refused"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl RobotCapabilities for SimRobot {
    async fn acquire_lease(&self, client: &str) -> Result<LeaseHandle, BridgeError> {
        self.simulate_latency().await;
        let mut state = self.state();
        self.reachable(&state, "acquire_lease")?;
        if let Some(held) = &state.lease {
            return Err(BridgeError::LeaseConflict(format!(
                "lease is held by '{}'",
                held.holder()
            )));
        }
        let id = state.issue_id();
        let lease = LeaseHandle::new(id, client);
        state.lease = Some(lease.clone());
        debug!(client, lease_id = id, "sim: lease acquired");
        Ok(lease)
    }

    async fn renew_lease(&self, lease: &LeaseHandle) -> Result<(), BridgeError> {
        self.simulate_latency().await;
        let mut state = self.state();
        self.reachable(&state, "renew_lease")?;
        if state.faults.fail_lease_renewals {
            return Err(BridgeError::transport("renew_lease", "injected renewal failure"));
        }
        state.check_lease(lease, "renew_lease")?;
        state.renewals += 1;
        Ok(())
    }

    async fn release_lease(&self, lease: &LeaseHandle) -> Result<(), BridgeError> {
        self.simulate_latency().await;
        let mut state = self.state();
        self.reachable(&state, "release_lease")?;
        state.check_lease(lease, "release_lease")?;
        state.lease = None;
        debug!(lease_id = lease.id(), "sim: lease returned");
        Ok(())
    }

    async fn register_estop(
        &self,
        client: &str,
        timeout: Duration,
    ) -> Result<EstopHandle, BridgeError> {
        self.simulate_latency().await;
        let mut state = self.state();
        self.reachable(&state, "register_estop")?;
        if state.faults.fail_estop_registration {
            return Err(BridgeError::EstopFault(format!(
                "register_estop: endpoint for '{client}' rejected"
            )));
        }
        let id = state.issue_id();
        state.estops.insert(id, timeout);
        debug!(client, estop_id = id, "sim: e-stop endpoint registered");
        Ok(EstopHandle::new(id, timeout))
    }

    async fn send_estop_heartbeat(&self, estop: &EstopHandle) -> Result<(), BridgeError> {
        self.simulate_latency().await;
        let mut state = self.state();
        self.reachable(&state, "send_estop_heartbeat")?;
        if state.faults.fail_heartbeats {
            return Err(BridgeError::transport(
                "send_estop_heartbeat",
                "injected heartbeat failure",
            ));
        }
        state.check_estop(estop, "send_estop_heartbeat")?;
        state.heartbeats += 1;
        Ok(())
    }

    async fn deregister_estop(&self, estop: &EstopHandle) -> Result<(), BridgeError> {
        self.simulate_latency().await;
        let mut state = self.state();
        self.reachable(&state, "deregister_estop")?;
        state.check_estop(estop, "deregister_estop")?;
        state.estops.remove(&estop.id());
        Ok(())
    }

    async fn trigger_estop(&self, estop: &EstopHandle) -> Result<(), BridgeError> {
        self.simulate_latency().await;
        let mut state = self.state();
        self.reachable(&state, "trigger_estop")?;
        state.check_estop(estop, "trigger_estop")?;
        state.estopped = true;
        state.powered = false;
        state.standing = false;
        Ok(())
    }

    async fn release_estop(&self, estop: &EstopHandle) -> Result<(), BridgeError> {
        self.simulate_latency().await;
        let mut state = self.state();
        self.reachable(&state, "release_estop")?;
        state.check_estop(estop, "release_estop")?;
        state.estopped = false;
        Ok(())
    }

    async fn send_velocity_command(
        &self,
        lease: &LeaseHandle,
        command: &MotionCommand,
        end_time: Duration,
    ) -> Result<(), BridgeError> {
        self.simulate_latency().await;
        let mut state = self.state();
        self.reachable(&state, "send_velocity_command")?;
        if state.faults.fail_commands {
            return Err(BridgeError::transport(
                "send_velocity_command",
                "injected command failure",
            ));
        }
        state.check_lease(lease, "send_velocity_command")?;
        state.record(SentCommand::Velocity {
            command: command.clone(),
            end_time,
        });
        Ok(())
    }

    async fn send_body_pose_command(
        &self,
        lease: &LeaseHandle,
        pose: &PoseDelta,
    ) -> Result<(), BridgeError> {
        self.simulate_latency().await;
        let mut state = self.state();
        self.reachable(&state, "send_body_pose_command")?;
        if state.faults.fail_commands {
            return Err(BridgeError::transport(
                "send_body_pose_command",
                "injected command failure",
            ));
        }
        state.check_lease(lease, "send_body_pose_command")?;
        state.record(SentCommand::BodyPose(*pose));
        Ok(())
    }

    async fn power_on(&self, lease: &LeaseHandle) -> Result<(), BridgeError> {
        self.simulate_latency().await;
        let mut state = self.state();
        self.reachable(&state, "power_on")?;
        if state.faults.fail_one_shots {
            return Err(BridgeError::transport("power_on", "injected failure"));
        }
        state.check_lease(lease, "power_on")?;
        if state.estopped {
            return Err(BridgeError::EstopFault(
                "power_on: software e-stop is asserted".to_string(),
            ));
        }
        state.powered = true;
        Ok(())
    }

    async fn power_off(&self, lease: &LeaseHandle) -> Result<(), BridgeError> {
        self.simulate_latency().await;
        let mut state = self.state();
        self.reachable(&state, "power_off")?;
        if state.faults.fail_one_shots {
            return Err(BridgeError::transport("power_off", "injected failure"));
        }
        state.check_lease(lease, "power_off")?;
        state.powered = false;
        state.standing = false;
        Ok(())
    }

    async fn stand(&self, lease: &LeaseHandle) -> Result<(), BridgeError> {
        self.simulate_latency().await;
        let mut state = self.state();
        self.reachable(&state, "stand")?;
        if state.faults.fail_one_shots {
            return Err(BridgeError::transport("stand", "injected failure"));
        }
        state.check_lease(lease, "stand")?;
        if !state.powered {
            return Err(BridgeError::transport("stand", "motors are not powered"));
        }
        state.standing = true;
        Ok(())
    }

    async fn sit(&self, lease: &LeaseHandle) -> Result<(), BridgeError> {
        self.simulate_latency().await;
        let mut state = self.state();
        self.reachable(&state, "sit")?;
        if state.faults.fail_one_shots {
            return Err(BridgeError::transport("sit", "injected failure"));
        }
        state.check_lease(lease, "sit")?;
        state.standing = false;
        Ok(())
    }

    async fn get_status(&self) -> Result<RobotState, BridgeError> {
        self.simulate_latency().await;
        let state = self.state();
        self.reachable(&state, "get_status")?;
        Ok(RobotState {
            serial_number: self.serial_number.clone(),
            nickname: self.nickname.clone(),
            battery_percent: self.battery_percent,
            powered: state.powered,
            standing: state.standing,
            estopped: state.estopped,
        })
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use legbridge_types::Velocity;
    use std::time::Instant;

    #[tokio::test]
    async fn second_client_gets_lease_conflict() {
        let robot = SimRobot::new();
        let lease = robot.acquire_lease("a").await.unwrap();
        let err = robot.acquire_lease("b").await.unwrap_err();
        assert!(matches!(err, BridgeError::LeaseConflict(_)));
        robot.release_lease(&lease).await.unwrap();
        assert!(robot.acquire_lease("b").await.is_ok());
    }

    #[tokio::test]
    async fn commands_require_the_active_lease() {
        let robot = SimRobot::new();
        let lease = robot.acquire_lease("a").await.unwrap();
        robot.steal_lease("thief");
        let cmd = MotionCommand::halt(Instant::now());
        let err = robot
            .send_velocity_command(&lease, &cmd, Duration::from_millis(250))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::LeaseLost(_)));
        assert!(matches!(
            robot.renew_lease(&lease).await,
            Err(BridgeError::LeaseLost(_))
        ));
    }

    #[tokio::test]
    async fn forwarded_commands_are_recorded_in_order() {
        let robot = SimRobot::new();
        let lease = robot.acquire_lease("a").await.unwrap();
        let walk = MotionCommand::new(
            Velocity::new(0.4, 0.0, 0.0),
            PoseDelta::NEUTRAL,
            None,
            Instant::now(),
        );
        robot
            .send_velocity_command(&lease, &walk, Duration::from_millis(250))
            .await
            .unwrap();
        robot
            .send_body_pose_command(&lease, &PoseDelta::new(0.1, 0.0, 0.0, 0.0))
            .await
            .unwrap();

        let sent = robot.commands();
        assert_eq!(sent.len(), 2);
        assert!(!sent[0].is_stationary());
        assert_eq!(sent[1], SentCommand::BodyPose(PoseDelta::new(0.1, 0.0, 0.0, 0.0)));
    }

    #[tokio::test]
    async fn command_log_keeps_only_the_newest_entries() {
        let robot = SimRobot::new();
        let lease = robot.acquire_lease("a").await.unwrap();
        for i in 0..COMMAND_LOG_CAPACITY + 10 {
            let pose = PoseDelta::new(0.0, 0.0, 0.0, i as f64 * 1e-4);
            robot.send_body_pose_command(&lease, &pose).await.unwrap();
        }
        let sent = robot.commands();
        assert_eq!(sent.len(), COMMAND_LOG_CAPACITY);
        assert_eq!(sent[0].pose().yaw, 10.0 * 1e-4);
        assert_eq!(
            robot.last_command().unwrap().pose().yaw,
            (COMMAND_LOG_CAPACITY + 9) as f64 * 1e-4
        );
    }

    #[tokio::test]
    async fn renewal_fault_injection() {
        let robot = SimRobot::new();
        let lease = robot.acquire_lease("a").await.unwrap();
        robot.set_fail_lease_renewals(true);
        let err = robot.renew_lease(&lease).await.unwrap_err();
        assert!(err.is_transient());
        robot.set_fail_lease_renewals(false);
        robot.renew_lease(&lease).await.unwrap();
        assert_eq!(robot.renewal_count(), 1);
    }

    #[tokio::test]
    async fn knock_down_is_visible_in_status() {
        let robot = SimRobot::new().with_battery(15.0);
        let lease = robot.acquire_lease("a").await.unwrap();
        robot.power_on(&lease).await.unwrap();
        robot.stand(&lease).await.unwrap();
        robot.knock_down();
        let status = robot.get_status().await.unwrap();
        assert!(status.powered);
        assert!(!status.standing);
        assert_eq!(status.battery_percent, 15.0);
    }

    #[tokio::test]
    async fn heartbeat_fault_injection() {
        let robot = SimRobot::new();
        let estop = robot
            .register_estop("a", Duration::from_secs(9))
            .await
            .unwrap();
        robot.send_estop_heartbeat(&estop).await.unwrap();
        robot.set_fail_heartbeats(true);
        let err = robot.send_estop_heartbeat(&estop).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(robot.heartbeat_count(), 1);
    }

    #[tokio::test]
    async fn estop_cuts_power_and_blocks_power_on() {
        let robot = SimRobot::new();
        let lease = robot.acquire_lease("a").await.unwrap();
        let estop = robot
            .register_estop("a", Duration::from_secs(9))
            .await
            .unwrap();
        robot.power_on(&lease).await.unwrap();
        robot.stand(&lease).await.unwrap();

        robot.trigger_estop(&estop).await.unwrap();
        let status = robot.get_status().await.unwrap();
        assert!(status.estopped);
        assert!(!status.powered);
        assert!(!status.standing);
        assert!(matches!(
            robot.power_on(&lease).await,
            Err(BridgeError::EstopFault(_))
        ));

        robot.release_estop(&estop).await.unwrap();
        robot.power_on(&lease).await.unwrap();
    }

    #[tokio::test]
    async fn stand_requires_power() {
        let robot = SimRobot::new();
        let lease = robot.acquire_lease("a").await.unwrap();
        assert!(robot.stand(&lease).await.is_err());
    }

    #[tokio::test]
    async fn unreachable_robot_fails_status() {
        let robot = SimRobot::new().with_nickname("rex");
        assert_eq!(robot.get_status().await.unwrap().nickname, "rex");
        robot.set_unreachable(true);
        assert!(matches!(
            robot.get_status().await,
            Err(BridgeError::Transport { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn call_delay_is_applied() {
        let robot = SimRobot::new().with_call_delay(Duration::from_millis(300));
        let started = tokio::time::Instant::now();
        robot.get_status().await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(300));
    }
}
