//! `legbridge-kernel` – Safety Core
//!
//! Everything that decides *what* reaches the robot.  The kernel never spawns
//! tasks or reads a clock on its own; callers pass `now` in and the runtime
//! drives the periodic operations.
//!
//! # Modules
//!
//! - [`validator`] – fixed safe ranges and the clamping functions every
//!   velocity and pose passes through.
//! - [`oscillator`] – [`evaluate`][oscillator::evaluate]: the pure
//!   pose/gait oscillator engine, plus the running
//!   [`AnimationRequest`][oscillator::AnimationRequest].
//! - [`arbiter`] – [`CommandArbiter`][arbiter::CommandArbiter]: the single
//!   current-command record, synchronous forwarding and the two-path
//!   command watchdog.
//! - [`deadline`] – [`KeepaliveDeadlines`][deadline::KeepaliveDeadlines]:
//!   per-channel keepalive safety margins and failure counts.
//! - [`supervisor`] – [`LeaseSupervisor`][supervisor::LeaseSupervisor]: the
//!   lifecycle state machine over the lease and the software e-stop.
//! - [`call`] – timeout wrapper applied to every capability call.

pub mod arbiter;
pub mod call;
pub mod deadline;
pub mod oscillator;
pub mod supervisor;

pub use legbridge_types::validator;

pub use arbiter::{ArbiterConfig, CommandArbiter, VelocityRequest, WatchdogAction};
pub use deadline::{ChannelHealth, KeepaliveDeadlines};
pub use oscillator::{evaluate, AnimationRequest};
pub use supervisor::{KeepaliveOutcome, KeepaliveTarget, LeaseSupervisor, SupervisorConfig};
