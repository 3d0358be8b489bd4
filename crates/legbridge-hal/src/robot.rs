//! The robot capability seam.
//!
//! The vendor SDK is opaque to legbridge: everything the supervisor needs from
//! the robot is expressed by [`RobotCapabilities`].  Drivers implement this
//! trait; the kernel and runtime only ever talk to the trait object, so a
//! simulated robot and a real one are interchangeable.
//!
//! Every method may fail with a transport-level [`BridgeError`].  Callers must
//! treat a failed call as not having happened.

use std::time::Duration;

use async_trait::async_trait;
use legbridge_types::{BridgeError, EstopHandle, LeaseHandle, MotionCommand, PoseDelta, RobotState};

/// Capability set of a legged robot's control API.
#[async_trait]
pub trait RobotCapabilities: Send + Sync {
    /// Take the exclusive-control lease for `client`.
    ///
    /// # Errors
    ///
    /// [`BridgeError::LeaseConflict`] when another client holds the lease.
    async fn acquire_lease(&self, client: &str) -> Result<LeaseHandle, BridgeError>;

    /// Renew `lease` before it expires on the robot.
    ///
    /// # Errors
    ///
    /// [`BridgeError::LeaseLost`] when the lease is no longer held.
    async fn renew_lease(&self, lease: &LeaseHandle) -> Result<(), BridgeError>;

    /// Return `lease` to the robot.
    async fn release_lease(&self, lease: &LeaseHandle) -> Result<(), BridgeError>;

    /// Register a software e-stop endpoint that halts the robot when no
    /// heartbeat arrives within `timeout`.
    async fn register_estop(&self, client: &str, timeout: Duration)
        -> Result<EstopHandle, BridgeError>;

    /// Check in on a registered e-stop endpoint.
    async fn send_estop_heartbeat(&self, estop: &EstopHandle) -> Result<(), BridgeError>;

    /// Remove a previously registered e-stop endpoint.
    async fn deregister_estop(&self, estop: &EstopHandle) -> Result<(), BridgeError>;

    /// Assert the software e-stop: motors are cut.
    async fn trigger_estop(&self, estop: &EstopHandle) -> Result<(), BridgeError>;

    /// Clear the software e-stop so motors may be powered again.
    async fn release_estop(&self, estop: &EstopHandle) -> Result<(), BridgeError>;

    /// Send a velocity command (with body-pose parameters and gait hint).
    /// The robot stops on its own once `end_time` has elapsed.
    async fn send_velocity_command(
        &self,
        lease: &LeaseHandle,
        command: &MotionCommand,
        end_time: Duration,
    ) -> Result<(), BridgeError>;

    /// Send a standing body-pose command.
    async fn send_body_pose_command(
        &self,
        lease: &LeaseHandle,
        pose: &PoseDelta,
    ) -> Result<(), BridgeError>;

    async fn power_on(&self, lease: &LeaseHandle) -> Result<(), BridgeError>;

    async fn power_off(&self, lease: &LeaseHandle) -> Result<(), BridgeError>;

    async fn stand(&self, lease: &LeaseHandle) -> Result<(), BridgeError>;

    async fn sit(&self, lease: &LeaseHandle) -> Result<(), BridgeError>;

    /// Query the robot's current state.  Does not require a lease.
    async fn get_status(&self) -> Result<RobotState, BridgeError>;
}
