//! `legbridge-runtime` – Session Orchestration
//!
//! Turns the kernel's safety components into a live, concurrent session.
//!
//! # Modules
//!
//! - [`session`] – [`Session`]: the lifecycle state machine exposed to the
//!   transport layer (`connect`, `disconnect`, power, stance, motion,
//!   animation, e-stop, status, diagnostics).
//! - `tasks` – the lease-renewal, e-stop heartbeat, command watchdog and
//!   animation pump tasks spawned for each connection.
//! - [`config`] – [`SessionConfig`]: every period, window and timeout.
//! - [`events`] – [`EventChannel`]: broadcast of lifecycle and safety events.
//! - [`diagnostics`] – pass / warn / fail health checks.
//! - [`telemetry`] – `tracing` subscriber and OTLP export setup.

pub mod config;
pub mod diagnostics;
pub mod events;
pub mod session;
mod tasks;
pub mod telemetry;

pub use config::SessionConfig;
pub use diagnostics::{CheckStatus, DiagnosticCheck, DiagnosticReport};
pub use events::EventChannel;
pub use session::Session;
