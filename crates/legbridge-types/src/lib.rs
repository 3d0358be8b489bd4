use std::fmt;
use std::ops::Add;
use std::str::FromStr;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub mod validator;

// ────────────────────────────────────────────────────────────────────────────
// Motion primitives
// ────────────────────────────────────────────────────────────────────────────

/// Planar body-frame velocity: forward `vx` and lateral `vy` in m/s, yaw rate
/// in rad/s.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
pub struct Velocity {
    pub vx: f64,
    pub vy: f64,
    pub yaw_rate: f64,
}

impl Velocity {
    pub const ZERO: Velocity = Velocity {
        vx: 0.0,
        vy: 0.0,
        yaw_rate: 0.0,
    };

    pub fn new(vx: f64, vy: f64, yaw_rate: f64) -> Self {
        Self { vx, vy, yaw_rate }
    }

    /// `true` when every component is exactly zero.
    pub fn is_zero(&self) -> bool {
        self.vx == 0.0 && self.vy == 0.0 && self.yaw_rate == 0.0
    }
}

/// Body-pose offset from the nominal stance: height in metres, roll / pitch /
/// yaw in radians.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
pub struct PoseDelta {
    pub height: f64,
    pub roll: f64,
    pub pitch: f64,
    pub yaw: f64,
}

impl PoseDelta {
    pub const NEUTRAL: PoseDelta = PoseDelta {
        height: 0.0,
        roll: 0.0,
        pitch: 0.0,
        yaw: 0.0,
    };

    pub fn new(height: f64, roll: f64, pitch: f64, yaw: f64) -> Self {
        Self {
            height,
            roll,
            pitch,
            yaw,
        }
    }

    pub fn is_neutral(&self) -> bool {
        *self == Self::NEUTRAL
    }
}

impl Add for PoseDelta {
    type Output = PoseDelta;

    fn add(self, rhs: PoseDelta) -> PoseDelta {
        PoseDelta {
            height: self.height + rhs.height,
            roll: self.roll + rhs.roll,
            pitch: self.pitch + rhs.pitch,
            yaw: self.yaw + rhs.yaw,
        }
    }
}

/// Coarse gait selector forwarded to the robot's onboard gait generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum LocomotionHint {
    Auto,
    Trot,
    SpeedSelectTrot,
    Crawl,
    SpeedSelectCrawl,
    Amble,
    SpeedSelectAmble,
    Jog,
    Hop,
}

impl LocomotionHint {
    /// Map the vendor's numeric hint code.  `0` (unknown) and unassigned codes
    /// yield `None`, meaning "let the robot choose".
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::Auto),
            2 => Some(Self::Trot),
            3 => Some(Self::SpeedSelectTrot),
            4 => Some(Self::Crawl),
            5 => Some(Self::Amble),
            6 => Some(Self::SpeedSelectAmble),
            7 => Some(Self::Jog),
            8 => Some(Self::Hop),
            10 => Some(Self::SpeedSelectCrawl),
            _ => None,
        }
    }

    /// The vendor's numeric code for this hint.
    pub fn code(self) -> u8 {
        match self {
            Self::Auto => 1,
            Self::Trot => 2,
            Self::SpeedSelectTrot => 3,
            Self::Crawl => 4,
            Self::Amble => 5,
            Self::SpeedSelectAmble => 6,
            Self::Jog => 7,
            Self::Hop => 8,
            Self::SpeedSelectCrawl => 10,
        }
    }
}

/// A fully clamped motion command.
///
/// The only constructor runs every field through the
/// [`validator`] so an unclamped value can never reach the robot.  Values are
/// replaced wholesale, never edited in place.
#[derive(Debug, Clone, PartialEq)]
pub struct MotionCommand {
    velocity: Velocity,
    pose: PoseDelta,
    hint: Option<LocomotionHint>,
    received_at: Instant,
}

impl MotionCommand {
    pub fn new(
        velocity: Velocity,
        pose: PoseDelta,
        hint: Option<LocomotionHint>,
        received_at: Instant,
    ) -> Self {
        Self {
            velocity: validator::clamp_velocity(velocity),
            pose: validator::clamp_pose(pose),
            hint,
            received_at,
        }
    }

    /// Zero velocity, neutral pose, no gait hint.
    pub fn halt(received_at: Instant) -> Self {
        Self::new(Velocity::ZERO, PoseDelta::NEUTRAL, None, received_at)
    }

    pub fn velocity(&self) -> Velocity {
        self.velocity
    }

    pub fn pose(&self) -> PoseDelta {
        self.pose
    }

    pub fn hint(&self) -> Option<LocomotionHint> {
        self.hint
    }

    pub fn received_at(&self) -> Instant {
        self.received_at
    }

    /// Same command with the velocity zeroed; pose and hint are kept.
    pub fn with_zero_velocity(&self, received_at: Instant) -> Self {
        Self::new(Velocity::ZERO, self.pose, self.hint, received_at)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Procedural animation
// ────────────────────────────────────────────────────────────────────────────

/// Named procedural pose oscillator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum AnimationKind {
    /// Vertical bob.
    Bounce,
    /// Side-to-side roll.
    Sway,
    /// Yaw oscillation.
    Twist,
    /// Walking-gait swagger: bounce, sway, twist and pitch combined.
    Swagger,
    /// Play-bow posture with a fast yaw wiggle.
    TailWag,
}

impl AnimationKind {
    pub const ALL: [AnimationKind; 5] = [
        AnimationKind::Bounce,
        AnimationKind::Sway,
        AnimationKind::Twist,
        AnimationKind::Swagger,
        AnimationKind::TailWag,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Bounce => "bounce",
            Self::Sway => "sway",
            Self::Twist => "twist",
            Self::Swagger => "swagger",
            Self::TailWag => "tail_wag",
        }
    }
}

impl fmt::Display for AnimationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AnimationKind {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "bounce" => Ok(Self::Bounce),
            "sway" => Ok(Self::Sway),
            "twist" => Ok(Self::Twist),
            "swagger" => Ok(Self::Swagger),
            "tail_wag" | "tailwag" | "wag" => Ok(Self::TailWag),
            other => Err(BridgeError::Config(format!("unknown animation kind '{other}'"))),
        }
    }
}

/// Tunable oscillator parameters.  Frequencies are in Hz, phases in radians,
/// amplitudes in metres (height) or radians (angles).
///
/// Missing fields deserialize to their defaults so a transport layer can send
/// only the values an operator touched.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct AnimationParams {
    /// Global amplitude scale applied to every oscillating term.
    pub amplitude: f64,
    /// Global speed multiplier.  For `tail_wag` this is the wiggle rate in Hz.
    pub speed: f64,
    /// Shared damping factor in `[0, 1]`; values outside are clamped.
    pub damping: f64,
    pub bounce_freq: f64,
    pub bounce_amp: f64,
    pub bob_delay: f64,
    pub sway_freq: f64,
    pub sway_amp: f64,
    pub sway_phase: f64,
    pub twist_freq: f64,
    pub twist_amp: f64,
    pub twist_phase: f64,
    pub pitch_freq: f64,
    pub pitch_amp: f64,
    pub pitch_phase: f64,
    /// Posture intensity for `tail_wag` in `[0, 1]`.
    pub intensity: f64,
}

impl Default for AnimationParams {
    fn default() -> Self {
        Self {
            amplitude: 1.0,
            speed: 1.0,
            damping: 1.0,
            bounce_freq: 2.0,
            bounce_amp: 0.05,
            bob_delay: 0.0,
            sway_freq: 1.0,
            sway_amp: 0.10,
            sway_phase: 0.0,
            twist_freq: 1.0,
            twist_amp: 0.08,
            twist_phase: 0.0,
            pitch_freq: 2.0,
            pitch_amp: 0.05,
            pitch_phase: 0.0,
            intensity: 1.0,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Session / robot state
// ────────────────────────────────────────────────────────────────────────────

/// Lease & e-stop lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    #[default]
    Disconnected,
    Acquiring,
    Active,
    Releasing,
    Faulted,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Acquiring => "acquiring",
            Self::Active => "active",
            Self::Releasing => "releasing",
            Self::Faulted => "faulted",
        };
        f.write_str(s)
    }
}

/// The two periodic keepalive channels a session maintains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum KeepaliveChannel {
    Lease,
    Estop,
}

impl fmt::Display for KeepaliveChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Lease => f.write_str("lease"),
            Self::Estop => f.write_str("estop"),
        }
    }
}

/// Proof of exclusive control, issued by the robot.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LeaseHandle {
    id: u64,
    holder: String,
}

impl LeaseHandle {
    pub fn new(id: u64, holder: impl Into<String>) -> Self {
        Self {
            id,
            holder: holder.into(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }
}

/// A registered software e-stop endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EstopHandle {
    id: u64,
    timeout: Duration,
}

impl EstopHandle {
    pub fn new(id: u64, timeout: Duration) -> Self {
        Self { id, timeout }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// How long the robot tolerates missing heartbeats before halting.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

/// Robot-reported state snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RobotState {
    pub serial_number: String,
    pub nickname: String,
    pub battery_percent: f32,
    pub powered: bool,
    pub standing: bool,
    pub estopped: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum LeaseStatus {
    Active,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum EstopStatus {
    Ok,
    Triggered,
    NotConfigured,
}

/// Operator-facing status returned by `get_status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SessionStatus {
    pub session_id: Uuid,
    pub lifecycle_state: LifecycleState,
    pub lease_status: LeaseStatus,
    pub estop_status: EstopStatus,
    pub powered: bool,
    pub standing: bool,
    pub motion_active: bool,
    pub animation: Option<AnimationKind>,
    pub robot: Option<RobotState>,
    pub last_fault: Option<String>,
    pub timestamp: DateTime<Utc>,
}

// ────────────────────────────────────────────────────────────────────────────
// Events
// ────────────────────────────────────────────────────────────────────────────

/// Which watchdog path forced a zero-velocity command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum WatchdogReason {
    /// No command of either kind within the expiry window.
    CommandExpired,
    /// No velocity command within the absolute trigger window.
    VelocityStale,
}

/// Session event wrapper published on the session event channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// e.g. "legbridge-runtime::session"
    pub source: String,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(source: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source: source.into(),
            payload,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EventPayload {
    LifecycleChanged {
        from: LifecycleState,
        to: LifecycleState,
    },
    /// A normal safety action, not an error.
    WatchdogStop { reason: WatchdogReason },
    KeepaliveFailure {
        channel: KeepaliveChannel,
        consecutive: u32,
        error: String,
    },
    SessionFaulted { cause: String },
    EmergencyStop { source: String },
}

// ────────────────────────────────────────────────────────────────────────────
// Errors
// ────────────────────────────────────────────────────────────────────────────

/// Global error type spanning robot transport failures, lease conflicts,
/// keepalive exhaustion and lifecycle misuse.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BridgeError {
    #[error("Not connected to robot")]
    NotConnected,

    #[error("Invalid state: cannot {operation} while {state}")]
    InvalidState {
        operation: String,
        state: LifecycleState,
    },

    #[error("Lease conflict: {0}")]
    LeaseConflict(String),

    #[error("Lease lost: {0}")]
    LeaseLost(String),

    #[error("E-Stop fault: {0}")]
    EstopFault(String),

    #[error("Transport error during {operation}: {details}")]
    Transport { operation: String, details: String },

    #[error("{operation} timed out after {timeout_ms} ms")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("Animation active: stop the running animation before adjusting the pose manually")]
    AnimationActive,

    #[error("Robot is not standing: {0} requires a standing robot")]
    NotStanding(String),

    #[error("Keepalive exhausted on {channel} channel: {details}")]
    KeepaliveExhausted {
        channel: KeepaliveChannel,
        details: String,
    },

    #[error("Configuration error: {0}")]
    Config(String),
}

impl BridgeError {
    pub fn transport(operation: &str, details: impl Into<String>) -> Self {
        Self::Transport {
            operation: operation.to_string(),
            details: details.into(),
        }
    }

    pub fn invalid_state(operation: &str, state: LifecycleState) -> Self {
        Self::InvalidState {
            operation: operation.to_string(),
            state,
        }
    }

    /// Stable, machine-readable label for the error variant.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotConnected => "not_connected",
            Self::InvalidState { .. } => "invalid_state",
            Self::LeaseConflict(_) => "lease_conflict",
            Self::LeaseLost(_) => "lease_lost",
            Self::EstopFault(_) => "estop_fault",
            Self::Transport { .. } => "transport",
            Self::Timeout { .. } => "timeout",
            Self::AnimationActive => "animation_active",
            Self::NotStanding(_) => "not_standing",
            Self::KeepaliveExhausted { .. } => "keepalive_exhausted",
            Self::Config(_) => "config",
        }
    }

    /// Single-call I/O failures that a periodic cycle may retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport { .. } | Self::Timeout { .. })
    }

    /// Operator-facing hint for resolving the failure.
    pub fn suggested_fix(&self) -> &'static str {
        match self {
            Self::NotConnected => "Connect to the robot first",
            Self::InvalidState { .. } => "Check the session state; the robot may need to stand or be powered on",
            Self::LeaseConflict(_) => {
                "Another client may have the lease. Check the robot admin page or release other clients."
            }
            Self::LeaseLost(_) => "The lease was revoked or expired. Reconnect to regain control.",
            Self::EstopFault(_) => {
                "Check E-Stop status - physical or software E-Stop may be active"
            }
            Self::Transport { .. } | Self::Timeout { .. } => {
                "Check the robot host address and network connectivity"
            }
            Self::AnimationActive => "Stop the running animation first",
            Self::NotStanding(_) => "Power on and stand the robot first",
            Self::KeepaliveExhausted { .. } => {
                "The link to the robot went stale. Check the network, then reconnect."
            }
            Self::Config(_) => "Check the legbridge configuration file and LEGBRIDGE_* variables",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn motion_command_clamps_on_construction() {
        let cmd = MotionCommand::new(
            Velocity::new(2.0, -2.0, 9.0),
            PoseDelta::new(1.0, -1.0, 0.1, 5.0),
            Some(LocomotionHint::Trot),
            Instant::now(),
        );
        assert_eq!(cmd.velocity(), Velocity::new(0.5, -0.5, 0.5));
        assert_eq!(cmd.pose(), PoseDelta::new(0.3, -0.3, 0.1, 0.3));
        assert_eq!(cmd.hint(), Some(LocomotionHint::Trot));
    }

    #[test]
    fn halt_is_zero_and_neutral() {
        let cmd = MotionCommand::halt(Instant::now());
        assert!(cmd.velocity().is_zero());
        assert!(cmd.pose().is_neutral());
        assert_eq!(cmd.hint(), None);
    }

    #[test]
    fn with_zero_velocity_keeps_pose() {
        let cmd = MotionCommand::new(
            Velocity::new(0.3, 0.0, 0.1),
            PoseDelta::new(0.1, 0.0, 0.0, 0.0),
            None,
            Instant::now(),
        );
        let stopped = cmd.with_zero_velocity(Instant::now());
        assert!(stopped.velocity().is_zero());
        assert_eq!(stopped.pose(), cmd.pose());
    }

    #[test]
    fn pose_addition_is_componentwise() {
        let a = PoseDelta::new(0.1, 0.02, 0.0, -0.1);
        let b = PoseDelta::new(0.05, 0.0, 0.2, 0.1);
        let sum = a + b;
        assert!((sum.height - 0.15).abs() < 1e-12);
        assert!((sum.pitch - 0.2).abs() < 1e-12);
        assert!(sum.yaw.abs() < 1e-12);
    }

    #[test]
    fn locomotion_hint_codes() {
        assert_eq!(LocomotionHint::from_code(2), Some(LocomotionHint::Trot));
        assert_eq!(LocomotionHint::from_code(10), Some(LocomotionHint::SpeedSelectCrawl));
        assert_eq!(LocomotionHint::from_code(0), None);
        assert_eq!(LocomotionHint::from_code(9), None);
        assert_eq!(LocomotionHint::Jog.code(), 7);
    }

    #[test]
    fn animation_kind_parses_common_spellings() {
        assert_eq!("tail-wag".parse::<AnimationKind>().unwrap(), AnimationKind::TailWag);
        assert_eq!("Swagger".parse::<AnimationKind>().unwrap(), AnimationKind::Swagger);
        assert!(matches!(
            "moonwalk".parse::<AnimationKind>(),
            Err(BridgeError::Config(_))
        ));
    }

    #[test]
    fn animation_params_fill_missing_fields_with_defaults() {
        let params: AnimationParams =
            serde_json::from_str(r#"{"amplitude": 0.5, "speed": 3.0}"#).unwrap();
        assert_eq!(params.amplitude, 0.5);
        assert_eq!(params.speed, 3.0);
        assert_eq!(params.bounce_amp, AnimationParams::default().bounce_amp);
    }

    #[test]
    fn session_status_schema_names_lifecycle_field() {
        let schema = schemars::schema_for!(SessionStatus);
        let json = serde_json::to_string(&schema).unwrap();
        assert!(json.contains("lifecycle_state"));
        assert!(json.contains("estop_status"));
    }

    #[test]
    fn bridge_error_display_and_hints() {
        let err = BridgeError::LeaseConflict("held by tablet-01".into());
        assert!(err.to_string().contains("tablet-01"));
        assert!(err.suggested_fix().contains("lease"));
        assert!(!err.is_transient());

        let err = BridgeError::transport("renew_lease", "connection reset");
        assert_eq!(err.kind(), "transport");
        assert!(err.is_transient());
        assert!(err.to_string().contains("renew_lease"));
    }

    #[test]
    fn event_payload_serializes_with_variant_name() {
        let event = Event::new(
            "legbridge-runtime::session",
            EventPayload::WatchdogStop {
                reason: WatchdogReason::CommandExpired,
            },
        );
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("WatchdogStop"));
        assert!(json.contains("command_expired"));
    }
}
