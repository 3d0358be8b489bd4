//! Session health checks.
//!
//! [`DiagnosticSnapshot::capture`] copies the relevant supervisor and
//! arbiter state under the session lock; [`build_report`] turns it and a
//! fresh robot status query into pass / warn / fail checks.  A session is
//! *healthy* when no check fails.

use std::time::Duration;

use legbridge_kernel::{ChannelHealth, CommandArbiter, LeaseSupervisor};
use legbridge_types::{
    BridgeError, EstopStatus, KeepaliveChannel, LeaseStatus, LifecycleState, RobotState,
};
use serde::Serialize;
use tokio::time::Instant;

/// Battery level below which the robot check warns.
const LOW_BATTERY_PERCENT: f32 = 20.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Pass,
    Warn,
    Fail,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiagnosticCheck {
    pub name: &'static str,
    pub status: CheckStatus,
    pub detail: String,
    /// Present on warnings and failures.
    pub fix: Option<String>,
}

impl DiagnosticCheck {
    fn pass(name: &'static str, detail: impl Into<String>) -> Self {
        Self {
            name,
            status: CheckStatus::Pass,
            detail: detail.into(),
            fix: None,
        }
    }

    fn warn(name: &'static str, detail: impl Into<String>, fix: impl Into<String>) -> Self {
        Self {
            name,
            status: CheckStatus::Warn,
            detail: detail.into(),
            fix: Some(fix.into()),
        }
    }

    fn fail(name: &'static str, detail: impl Into<String>, fix: impl Into<String>) -> Self {
        Self {
            name,
            status: CheckStatus::Fail,
            detail: detail.into(),
            fix: Some(fix.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiagnosticReport {
    pub checks: Vec<DiagnosticCheck>,
    pub summary: String,
    pub healthy: bool,
}

impl DiagnosticReport {
    pub fn count(&self, status: CheckStatus) -> usize {
        self.checks.iter().filter(|c| c.status == status).count()
    }

    pub fn check(&self, name: &str) -> Option<&DiagnosticCheck> {
        self.checks.iter().find(|c| c.name == name)
    }

    pub fn to_json_pretty(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelSnapshot {
    pub health: ChannelHealth,
    pub since_success: Option<Duration>,
    pub failures: u32,
    pub margin: Duration,
}

/// Supervisor and arbiter state copied out of the session lock.
#[derive(Debug, Clone, PartialEq)]
pub struct DiagnosticSnapshot {
    pub lifecycle: LifecycleState,
    pub lease_status: LeaseStatus,
    pub estop_status: EstopStatus,
    pub lease: ChannelSnapshot,
    pub estop: ChannelSnapshot,
    pub motion_active: bool,
    pub since_last_command: Option<Duration>,
    pub command_expiry: Duration,
}

impl DiagnosticSnapshot {
    pub fn capture(supervisor: &LeaseSupervisor, arbiter: &CommandArbiter, now: Instant) -> Self {
        let channel = |ch: KeepaliveChannel| ChannelSnapshot {
            health: supervisor.channel_health(ch, now),
            since_success: supervisor.since_last_keepalive(ch, now),
            failures: supervisor.consecutive_failures(ch),
            margin: supervisor.config().margin(ch),
        };
        Self {
            lifecycle: supervisor.state(),
            lease_status: supervisor.lease_status(),
            estop_status: supervisor.estop_status(),
            lease: channel(KeepaliveChannel::Lease),
            estop: channel(KeepaliveChannel::Estop),
            motion_active: arbiter.motion_active(),
            since_last_command: arbiter.since_last_command(now),
            command_expiry: arbiter.config().command_expiry,
        }
    }
}

pub fn build_report(
    snapshot: &DiagnosticSnapshot,
    robot: Result<RobotState, BridgeError>,
) -> DiagnosticReport {
    let connected = snapshot.lifecycle == LifecycleState::Active;
    let mut checks = Vec::with_capacity(6);

    checks.push(match &robot {
        Ok(state) if state.battery_percent < LOW_BATTERY_PERCENT => DiagnosticCheck::warn(
            "robot",
            format!("{} reachable, battery {:.0}%", state.nickname, state.battery_percent),
            "Charge the robot before walking",
        ),
        Ok(state) => DiagnosticCheck::pass(
            "robot",
            format!(
                "{} ({}) reachable, battery {:.0}%",
                state.nickname, state.serial_number, state.battery_percent
            ),
        ),
        Err(e) => DiagnosticCheck::fail("robot", e.to_string(), e.suggested_fix()),
    });

    checks.push(match (snapshot.lifecycle, snapshot.lease_status) {
        (LifecycleState::Active, LeaseStatus::Active) => {
            DiagnosticCheck::pass("lease", "lease held")
        }
        (LifecycleState::Disconnected, _) => DiagnosticCheck::warn(
            "lease",
            "not connected",
            BridgeError::NotConnected.suggested_fix(),
        ),
        (state, _) => DiagnosticCheck::fail(
            "lease",
            format!("session is {state}"),
            "Wait for the transition to finish, then reconnect",
        ),
    });

    let robot_estopped = robot.as_ref().map(|r| r.estopped).unwrap_or(false);
    checks.push(match snapshot.estop_status {
        EstopStatus::Triggered => DiagnosticCheck::warn(
            "estop",
            "software e-stop asserted",
            "Release the e-stop, then power on",
        ),
        _ if robot_estopped => DiagnosticCheck::warn(
            "estop",
            "robot reports an active e-stop",
            BridgeError::EstopFault(String::new()).suggested_fix(),
        ),
        EstopStatus::Ok => DiagnosticCheck::pass("estop", "endpoint registered"),
        EstopStatus::NotConfigured => DiagnosticCheck::warn(
            "estop",
            "no endpoint registered",
            BridgeError::NotConnected.suggested_fix(),
        ),
    });

    for (name, channel) in [
        ("lease_keepalive", &snapshot.lease),
        ("estop_heartbeat", &snapshot.estop),
    ] {
        checks.push(keepalive_check(name, channel, connected));
    }

    let stale = snapshot.motion_active
        && snapshot
            .since_last_command
            .is_some_and(|elapsed| elapsed > snapshot.command_expiry);
    checks.push(if stale {
        DiagnosticCheck::warn(
            "command_watchdog",
            "stale motion awaiting watchdog stop",
            "Check the operator input loop",
        )
    } else if snapshot.motion_active {
        DiagnosticCheck::pass("command_watchdog", "motion commands fresh")
    } else {
        DiagnosticCheck::pass("command_watchdog", "idle")
    });

    let (pass, warn, fail) = checks.iter().fold((0, 0, 0), |(p, w, f), c| match c.status {
        CheckStatus::Pass => (p + 1, w, f),
        CheckStatus::Warn => (p, w + 1, f),
        CheckStatus::Fail => (p, w, f + 1),
    });
    DiagnosticReport {
        summary: format!("{pass} passed, {warn} warnings, {fail} failures"),
        healthy: fail == 0,
        checks,
    }
}

fn keepalive_check(name: &'static str, channel: &ChannelSnapshot, connected: bool) -> DiagnosticCheck {
    if !connected {
        return DiagnosticCheck::warn(name, "inactive", BridgeError::NotConnected.suggested_fix());
    }
    let since = channel
        .since_success
        .map(|d| format!("{} ms ago", d.as_millis()))
        .unwrap_or_else(|| "never".to_string());
    match (channel.health, channel.failures) {
        (ChannelHealth::Expired, _) => DiagnosticCheck::fail(
            name,
            format!("last success {since}, margin {} ms", channel.margin.as_millis()),
            "Check the network link to the robot",
        ),
        (ChannelHealth::Healthy, 0) => DiagnosticCheck::pass(name, format!("last success {since}")),
        (ChannelHealth::Healthy, n) => DiagnosticCheck::warn(
            name,
            format!("{n} consecutive failures, last success {since}"),
            "Check the network link to the robot",
        ),
    }
}
