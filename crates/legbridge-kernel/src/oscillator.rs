//! Pose/gait oscillator engine.
//!
//! [`evaluate`] maps an [`AnimationKind`], an elapsed time and a set of
//! [`AnimationParams`] to a [`PoseDelta`].  It is a pure function of its
//! arguments: it never reads a clock, so re-evaluating at any time argument
//! always yields the same pose.  Every output goes through the validator.
//!
//! # Example
//!
//! ```
//! use legbridge_kernel::oscillator::evaluate;
//! use legbridge_types::{AnimationKind, AnimationParams};
//!
//! let params = AnimationParams::default();
//! let start = evaluate(AnimationKind::Bounce, 0.0, &params);
//! assert_eq!(start.height, 0.0);
//! assert_eq!(evaluate(AnimationKind::Bounce, 0.37, &params),
//!            evaluate(AnimationKind::Bounce, 0.37, &params));
//! ```

use std::f64::consts::TAU;

use legbridge_types::validator::{clamp_pose, MAX_BODY_ANGLE};
use legbridge_types::{AnimationKind, AnimationParams, PoseDelta};
use tokio::time::Instant;

/// Yaw amplitude of the tail-wag wiggle at full intensity, in radians.
const TAIL_WAG_YAW_AMP: f64 = 0.25;
/// Roll amplitude that accompanies the tail-wag yaw, in radians.
const TAIL_WAG_ROLL_AMP: f64 = 0.08;
/// Height wiggle of the tail-wag hips, in metres.
const TAIL_WAG_HEIGHT_AMP: f64 = 0.02;

/// Evaluate `kind` at `elapsed_secs` since the animation started.
pub fn evaluate(kind: AnimationKind, elapsed_secs: f64, params: &AnimationParams) -> PoseDelta {
    let t = if elapsed_secs.is_finite() {
        elapsed_secs.max(0.0)
    } else {
        0.0
    };
    let damping = unit(params.damping);
    let scale = params.amplitude * damping;
    let speed = params.speed;

    let raw = match kind {
        AnimationKind::Bounce => PoseDelta {
            height: wave(params.bounce_freq, t, speed, params.bob_delay) * params.bounce_amp * scale,
            ..PoseDelta::NEUTRAL
        },
        AnimationKind::Sway => PoseDelta {
            roll: wave(params.sway_freq, t, speed, params.sway_phase) * params.sway_amp * scale,
            ..PoseDelta::NEUTRAL
        },
        AnimationKind::Twist => PoseDelta {
            yaw: wave(params.twist_freq, t, speed, params.twist_phase) * params.twist_amp * scale,
            ..PoseDelta::NEUTRAL
        },
        AnimationKind::Swagger => PoseDelta {
            height: wave(params.bounce_freq, t, speed, params.bob_delay) * params.bounce_amp * scale,
            roll: wave(params.sway_freq, t, speed, params.sway_phase) * params.sway_amp * scale,
            yaw: wave(params.twist_freq, t, speed, params.twist_phase) * params.twist_amp * scale,
            pitch: wave(params.pitch_freq, t, speed, params.pitch_phase) * params.pitch_amp * scale,
        },
        AnimationKind::TailWag => {
            let intensity = unit(params.intensity);
            // `speed` is the wiggle rate in Hz for this kind.
            let phase = TAU * speed * t;
            let wiggle = phase.sin();
            PoseDelta {
                height: (2.0 * phase).sin() * TAIL_WAG_HEIGHT_AMP * intensity * scale,
                roll: wiggle * TAIL_WAG_ROLL_AMP * intensity * scale,
                pitch: MAX_BODY_ANGLE * intensity,
                yaw: wiggle * TAIL_WAG_YAW_AMP * intensity * scale,
            }
        }
    };

    clamp_pose(raw)
}

fn wave(freq_hz: f64, t: f64, speed: f64, phase: f64) -> f64 {
    (TAU * freq_hz * t * speed + phase).sin()
}

fn unit(value: f64) -> f64 {
    if value.is_nan() { 0.0 } else { value.clamp(0.0, 1.0) }
}

/// A running procedural animation.  Owned by the command arbiter; at most one
/// exists per session.
#[derive(Debug, Clone, PartialEq)]
pub struct AnimationRequest {
    kind: AnimationKind,
    params: AnimationParams,
    started_at: Instant,
}

impl AnimationRequest {
    pub fn new(kind: AnimationKind, params: AnimationParams, started_at: Instant) -> Self {
        Self {
            kind,
            params,
            started_at,
        }
    }

    pub fn kind(&self) -> AnimationKind {
        self.kind
    }

    /// Pose delta of this animation at wall time `now`.
    pub fn pose_at(&self, now: Instant) -> PoseDelta {
        let elapsed = now.saturating_duration_since(self.started_at);
        evaluate(self.kind, elapsed.as_secs_f64(), &self.params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use legbridge_types::validator::{MAX_BODY_ANGLE, MAX_BODY_HEIGHT};
    use std::time::Duration;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn evaluation_is_deterministic() {
        let params = AnimationParams {
            speed: 1.7,
            ..AnimationParams::default()
        };
        for kind in AnimationKind::ALL {
            for t in [0.0, 0.013, 0.5, 3.25, 120.0] {
                assert_eq!(evaluate(kind, t, &params), evaluate(kind, t, &params));
            }
        }
    }

    #[test]
    fn bounce_starts_at_zero_height() {
        let params = AnimationParams {
            amplitude: 0.8,
            ..AnimationParams::default()
        };
        let pose = evaluate(AnimationKind::Bounce, 0.0, &params);
        assert_eq!(pose.height, 0.0);
        assert!(pose.is_neutral());
    }

    #[test]
    fn bounce_peaks_at_quarter_period() {
        let params = AnimationParams::default();
        // 2 Hz bounce -> quarter period is 0.125 s.
        let pose = evaluate(AnimationKind::Bounce, 0.125, &params);
        assert!(approx(pose.height, params.bounce_amp));
    }

    #[test]
    fn phase_offset_shifts_start() {
        let params = AnimationParams {
            bob_delay: std::f64::consts::FRAC_PI_2,
            ..AnimationParams::default()
        };
        let pose = evaluate(AnimationKind::Bounce, 0.0, &params);
        assert!(approx(pose.height, params.bounce_amp));
    }

    #[test]
    fn speed_multiplier_compresses_time() {
        let slow = AnimationParams::default();
        let fast = AnimationParams {
            speed: 2.0,
            ..AnimationParams::default()
        };
        assert!(approx(
            evaluate(AnimationKind::Sway, 0.2, &slow).roll,
            evaluate(AnimationKind::Sway, 0.1, &fast).roll,
        ));
    }

    #[test]
    fn swagger_moves_all_four_axes() {
        let params = AnimationParams::default();
        let pose = evaluate(AnimationKind::Swagger, 0.1, &params);
        assert!(pose.height != 0.0);
        assert!(pose.roll != 0.0);
        assert!(pose.pitch != 0.0);
        assert!(pose.yaw != 0.0);
    }

    #[test]
    fn zero_damping_silences_oscillation() {
        let params = AnimationParams {
            damping: 0.0,
            ..AnimationParams::default()
        };
        assert!(evaluate(AnimationKind::Swagger, 0.3, &params).is_neutral());
    }

    #[test]
    fn huge_amplitude_is_clamped() {
        let params = AnimationParams {
            amplitude: 1000.0,
            ..AnimationParams::default()
        };
        for t in [0.05, 0.1, 0.2, 0.33] {
            let pose = evaluate(AnimationKind::Swagger, t, &params);
            assert!(pose.height.abs() <= MAX_BODY_HEIGHT);
            assert!(pose.roll.abs() <= MAX_BODY_ANGLE);
            assert!(pose.pitch.abs() <= MAX_BODY_ANGLE);
            assert!(pose.yaw.abs() <= MAX_BODY_ANGLE);
        }
    }

    #[test]
    fn tail_wag_holds_bow_and_wiggles_at_speed_hz() {
        let params = AnimationParams {
            intensity: 0.5,
            speed: 2.0,
            ..AnimationParams::default()
        };
        let start = evaluate(AnimationKind::TailWag, 0.0, &params);
        assert!(approx(start.pitch, 0.15));
        assert_eq!(start.yaw, 0.0);

        // 2 Hz wiggle -> peak yaw at 0.125 s, back through zero at 0.25 s.
        let peak = evaluate(AnimationKind::TailWag, 0.125, &params);
        assert!(approx(peak.yaw, 0.25 * 0.5));
        assert!(peak.roll > 0.0);
        let zero = evaluate(AnimationKind::TailWag, 0.25, &params);
        assert!(zero.yaw.abs() < 1e-9);
        assert!(approx(zero.pitch, 0.15));
    }

    #[test]
    fn negative_or_nan_time_evaluates_as_start() {
        let params = AnimationParams::default();
        let start = evaluate(AnimationKind::Twist, 0.0, &params);
        assert_eq!(evaluate(AnimationKind::Twist, -4.0, &params), start);
        assert_eq!(evaluate(AnimationKind::Twist, f64::NAN, &params), start);
    }

    #[test]
    fn request_evaluates_relative_to_its_start() {
        let started = Instant::now();
        let req = AnimationRequest::new(AnimationKind::Bounce, AnimationParams::default(), started);
        assert!(req.pose_at(started).is_neutral());
        let later = req.pose_at(started + Duration::from_millis(125));
        assert!(approx(later.height, AnimationParams::default().bounce_amp));
        // Evaluating before the start clamps to zero elapsed time.
        assert!(req.pose_at(started - Duration::from_millis(10)).is_neutral());
    }
}
