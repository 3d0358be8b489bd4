//! `legbridge-hal` – Robot Abstraction
//!
//! # Modules
//!
//! - [`robot`] – [`RobotCapabilities`]: the async capability set the
//!   supervisor consumes (lease, e-stop, motion, power, stance, status).
//! - [`sim`] – [`SimRobot`]: an in-process simulated robot with fault
//!   injection for headless tests and the operator CLI.

pub mod robot;
pub mod sim;

pub use robot::RobotCapabilities;
pub use sim::{COMMAND_LOG_CAPACITY, SentCommand, SimRobot};
