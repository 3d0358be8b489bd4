//! Session timing configuration.
//!
//! All periods are stored in milliseconds so the struct maps one-to-one onto
//! a `[session]` table in the operator's `config.toml`.  Missing keys fall
//! back to the defaults below.
//!
//! | Key | Default | Meaning |
//! |---|---|---|
//! | `watchdog_period_ms` | 100 | Command watchdog tick |
//! | `command_expiry_ms` | 250 | Expiry path window |
//! | `watchdog_trigger_ms` | 500 | Velocity trigger path window |
//! | `command_end_time_ms` | 250 | End time attached to velocity commands |
//! | `call_timeout_ms` | 500 | Bound on forwarding and keepalive calls |
//! | `one_shot_timeout_ms` | 20000 | Bound on power / stand / sit |
//! | `animation_frame_ms` | 50 | Animation pump period |
//! | `lease_renew_interval_ms` | 2000 | Lease renewal period |
//! | `lease_margin_ms` | 6000 | Longest gap between successful renewals |
//! | `estop_timeout_ms` | 9000 | Timeout registered with the e-stop endpoint |
//! | `estop_heartbeat_interval_ms` | 1000 | Heartbeat period |
//! | `estop_margin_ms` | 3000 | Longest gap between successful heartbeats |
//! | `max_keepalive_failures` | 3 | Consecutive failures before faulting |

use std::time::Duration;

use legbridge_kernel::{ArbiterConfig, SupervisorConfig};
use legbridge_types::BridgeError;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Client name presented to the robot's lease service.
    pub client_name: String,
    pub watchdog_period_ms: u64,
    pub command_expiry_ms: u64,
    pub watchdog_trigger_ms: u64,
    pub command_end_time_ms: u64,
    pub call_timeout_ms: u64,
    pub one_shot_timeout_ms: u64,
    pub animation_frame_ms: u64,
    pub lease_renew_interval_ms: u64,
    pub lease_margin_ms: u64,
    pub estop_timeout_ms: u64,
    pub estop_heartbeat_interval_ms: u64,
    pub estop_margin_ms: u64,
    pub max_keepalive_failures: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            client_name: "legbridge".to_string(),
            watchdog_period_ms: 100,
            command_expiry_ms: 250,
            watchdog_trigger_ms: 500,
            command_end_time_ms: 250,
            call_timeout_ms: 500,
            one_shot_timeout_ms: 20_000,
            animation_frame_ms: 50,
            lease_renew_interval_ms: 2_000,
            lease_margin_ms: 6_000,
            estop_timeout_ms: 9_000,
            estop_heartbeat_interval_ms: 1_000,
            estop_margin_ms: 3_000,
            max_keepalive_failures: 3,
        }
    }
}

impl SessionConfig {
    pub fn watchdog_period(&self) -> Duration {
        Duration::from_millis(self.watchdog_period_ms)
    }

    pub fn animation_frame(&self) -> Duration {
        Duration::from_millis(self.animation_frame_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn one_shot_timeout(&self) -> Duration {
        Duration::from_millis(self.one_shot_timeout_ms)
    }

    pub fn arbiter(&self) -> ArbiterConfig {
        ArbiterConfig {
            command_expiry: Duration::from_millis(self.command_expiry_ms),
            watchdog_trigger: Duration::from_millis(self.watchdog_trigger_ms),
            command_end_time: Duration::from_millis(self.command_end_time_ms),
            call_timeout: self.call_timeout(),
        }
    }

    pub fn supervisor(&self) -> SupervisorConfig {
        SupervisorConfig {
            client_name: self.client_name.clone(),
            lease_renew_interval: Duration::from_millis(self.lease_renew_interval_ms),
            lease_margin: Duration::from_millis(self.lease_margin_ms),
            estop_timeout: Duration::from_millis(self.estop_timeout_ms),
            estop_heartbeat_interval: Duration::from_millis(self.estop_heartbeat_interval_ms),
            estop_margin: Duration::from_millis(self.estop_margin_ms),
            max_consecutive_failures: self.max_keepalive_failures,
            call_timeout: self.call_timeout(),
        }
    }

    /// Reject timings that would defeat the safety guarantees.
    ///
    /// # Errors
    ///
    /// [`BridgeError::Config`] naming the first offending key.
    pub fn validate(&self) -> Result<(), BridgeError> {
        let periods = [
            ("watchdog_period_ms", self.watchdog_period_ms),
            ("command_expiry_ms", self.command_expiry_ms),
            ("call_timeout_ms", self.call_timeout_ms),
            ("one_shot_timeout_ms", self.one_shot_timeout_ms),
            ("animation_frame_ms", self.animation_frame_ms),
            ("lease_renew_interval_ms", self.lease_renew_interval_ms),
            ("estop_heartbeat_interval_ms", self.estop_heartbeat_interval_ms),
        ];
        if let Some((key, _)) = periods.iter().find(|(_, v)| *v == 0) {
            return Err(BridgeError::Config(format!("{key} must be greater than zero")));
        }
        if self.client_name.trim().is_empty() {
            return Err(BridgeError::Config("client_name must not be empty".into()));
        }
        if self.watchdog_trigger_ms < self.command_expiry_ms {
            return Err(BridgeError::Config(
                "watchdog_trigger_ms must not be shorter than command_expiry_ms".into(),
            ));
        }
        if self.watchdog_period_ms >= self.command_expiry_ms {
            return Err(BridgeError::Config(
                "watchdog_period_ms must be shorter than command_expiry_ms".into(),
            ));
        }
        if self.lease_margin_ms <= self.lease_renew_interval_ms {
            return Err(BridgeError::Config(
                "lease_margin_ms must exceed lease_renew_interval_ms".into(),
            ));
        }
        if self.estop_margin_ms <= self.estop_heartbeat_interval_ms
            || self.estop_margin_ms >= self.estop_timeout_ms
        {
            return Err(BridgeError::Config(
                "estop_margin_ms must lie between estop_heartbeat_interval_ms and estop_timeout_ms"
                    .into(),
            ));
        }
        if self.max_keepalive_failures == 0 {
            return Err(BridgeError::Config(
                "max_keepalive_failures must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
