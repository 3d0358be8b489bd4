//! Parameter validator – fixed safe ranges for every motion and pose field.
//!
//! Nothing here ever fails.  Out-of-range operator input (a slider pushed to
//! its end stop, a key held for too long) is clamped to the nearest safe
//! value.  Non-finite input collapses to `0.0`, the neutral value for every
//! field.
//!
//! | Field | Range |
//! |---|---|
//! | linear velocity `vx`, `vy` | ±0.5 m/s |
//! | yaw rate | ±0.5 rad/s |
//! | body height | ±0.30 m |
//! | body roll / pitch / yaw | ±0.30 rad |

use crate::{PoseDelta, Velocity};

/// Maximum absolute linear velocity on either planar axis, in m/s.
pub const MAX_LINEAR_VELOCITY: f64 = 0.5;
/// Maximum absolute yaw rate, in rad/s.
pub const MAX_YAW_RATE: f64 = 0.5;
/// Maximum absolute body-height offset from the nominal stance, in metres.
pub const MAX_BODY_HEIGHT: f64 = 0.30;
/// Maximum absolute body roll, pitch or yaw, in radians (~17°).
pub const MAX_BODY_ANGLE: f64 = 0.30;

/// Clamp `value` into `[-limit, limit]`.  `NaN` maps to `0.0`.
pub fn clamp_symmetric(value: f64, limit: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(-limit, limit)
    }
}

/// Clamp a forward or lateral velocity.
pub fn clamp_linear(value: f64) -> f64 {
    clamp_symmetric(value, MAX_LINEAR_VELOCITY)
}

/// Clamp a yaw rate.
pub fn clamp_yaw_rate(value: f64) -> f64 {
    clamp_symmetric(value, MAX_YAW_RATE)
}

/// Clamp a body-height offset.
pub fn clamp_height(value: f64) -> f64 {
    clamp_symmetric(value, MAX_BODY_HEIGHT)
}

/// Clamp a body roll, pitch or yaw angle.
pub fn clamp_angle(value: f64) -> f64 {
    clamp_symmetric(value, MAX_BODY_ANGLE)
}

/// Clamp every component of a [`Velocity`].
pub fn clamp_velocity(v: Velocity) -> Velocity {
    Velocity {
        vx: clamp_linear(v.vx),
        vy: clamp_linear(v.vy),
        yaw_rate: clamp_yaw_rate(v.yaw_rate),
    }
}

/// Clamp every component of a [`PoseDelta`].
pub fn clamp_pose(p: PoseDelta) -> PoseDelta {
    PoseDelta {
        height: clamp_height(p.height),
        roll: clamp_angle(p.roll),
        pitch: clamp_angle(p.pitch),
        yaw: clamp_angle(p.yaw),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLES: [f64; 11] = [
        -1e9,
        -3.0,
        -0.5,
        -0.3,
        -0.1,
        0.0,
        0.29,
        0.5,
        0.75,
        f64::INFINITY,
        f64::NEG_INFINITY,
    ];

    #[test]
    fn velocity_always_within_limits_and_idempotent() {
        for &vx in &SAMPLES {
            for &yaw in &SAMPLES {
                let once = clamp_velocity(Velocity {
                    vx,
                    vy: -vx,
                    yaw_rate: yaw,
                });
                assert!(once.vx.abs() <= MAX_LINEAR_VELOCITY);
                assert!(once.vy.abs() <= MAX_LINEAR_VELOCITY);
                assert!(once.yaw_rate.abs() <= MAX_YAW_RATE);
                assert_eq!(clamp_velocity(once), once);
            }
        }
    }

    #[test]
    fn pose_always_within_limits_and_idempotent() {
        for &v in &SAMPLES {
            let once = clamp_pose(PoseDelta {
                height: v,
                roll: v,
                pitch: -v,
                yaw: v * 0.5,
            });
            assert!(once.height.abs() <= MAX_BODY_HEIGHT);
            assert!(once.roll.abs() <= MAX_BODY_ANGLE);
            assert!(once.pitch.abs() <= MAX_BODY_ANGLE);
            assert!(once.yaw.abs() <= MAX_BODY_ANGLE);
            assert_eq!(clamp_pose(once), once);
        }
    }

    #[test]
    fn in_range_values_pass_through_unchanged() {
        assert_eq!(clamp_linear(0.42), 0.42);
        assert_eq!(clamp_yaw_rate(-0.2), -0.2);
        assert_eq!(clamp_height(0.1), 0.1);
        assert_eq!(clamp_angle(-0.3), -0.3);
    }

    #[test]
    fn nan_collapses_to_neutral() {
        assert_eq!(clamp_linear(f64::NAN), 0.0);
        assert_eq!(clamp_angle(f64::NAN), 0.0);
    }

    #[test]
    fn infinities_clamp_to_end_stops() {
        assert_eq!(clamp_linear(f64::INFINITY), MAX_LINEAR_VELOCITY);
        assert_eq!(clamp_height(f64::NEG_INFINITY), -MAX_BODY_HEIGHT);
    }
}
