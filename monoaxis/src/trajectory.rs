//! Trapezoidal trajectory generator.
//!
//! One setpoint per cycle, integrated open-loop against the drive's own
//! position loop: the engine only consults the measured position once, to
//! seed the model at commit time. Per-cycle work is a handful of float
//! operations, bounded and allocation-free.

use core::fmt;

/// Band around the target inside which the move is considered complete.
pub const POSITION_TOLERANCE_COUNTS: f64 = 100.0;

/// Phase of the velocity profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MotionPhase {
    #[default]
    Idle = 0,
    Accelerating = 1,
    Cruising = 2,
    Decelerating = 3,
}

impl MotionPhase {
    pub fn from_discriminant(value: u8) -> Self {
        match value {
            1 => Self::Accelerating,
            2 => Self::Cruising,
            3 => Self::Decelerating,
            _ => Self::Idle,
        }
    }
}

impl fmt::Display for MotionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "Idle",
            Self::Accelerating => "Accelerating",
            Self::Cruising => "Cruising",
            Self::Decelerating => "Decelerating",
        };
        write!(f, "{name}")
    }
}

/// A profile was rejected at commit time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProfileError {
    /// Velocity limit must be strictly positive; direction comes from the
    /// signed distance, never from the speed.
    NonPositiveVelocity(f64),
    /// Acceleration must be strictly positive (it divides the braking
    /// distance).
    NonPositiveAcceleration(f64),
}

impl fmt::Display for ProfileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NonPositiveVelocity(v) => {
                write!(f, "maximum velocity must be > 0, got {v}")
            }
            Self::NonPositiveAcceleration(a) => {
                write!(f, "acceleration must be > 0, got {a}")
            }
        }
    }
}

impl std::error::Error for ProfileError {}

/// One committed move: fixed parameters plus the modelled runtime state.
#[derive(Debug, Clone)]
pub struct TrapezoidalProfile {
    target: f64,
    max_velocity: f64,
    acceleration: f64,
    direction: f64,

    position: f64,
    velocity: f64,
    phase: MotionPhase,
}

impl TrapezoidalProfile {
    /// Commit a move from `start` to `target` (both in counts), with speed
    /// and acceleration limits in counts/s and counts/s². Direction is
    /// fixed here from the signed distance; the engine does not plan
    /// reversals within a move.
    pub fn commit(
        start: f64,
        target: f64,
        max_velocity: f64,
        acceleration: f64,
    ) -> Result<Self, ProfileError> {
        if !(max_velocity > 0.0) {
            return Err(ProfileError::NonPositiveVelocity(max_velocity));
        }
        if !(acceleration > 0.0) {
            return Err(ProfileError::NonPositiveAcceleration(acceleration));
        }

        let distance = target - start;
        let direction = if distance >= 0.0 { 1.0 } else { -1.0 };
        let phase = if distance == 0.0 {
            MotionPhase::Idle
        } else {
            MotionPhase::Accelerating
        };

        Ok(Self {
            target,
            max_velocity,
            acceleration,
            direction,
            position: if phase == MotionPhase::Idle { target } else { start },
            velocity: 0.0,
            phase,
        })
    }

    /// A profile that is already at its target and does nothing.
    pub fn idle_at(position: f64) -> Self {
        Self {
            target: position,
            max_velocity: 1.0,
            acceleration: 1.0,
            direction: 1.0,
            position,
            velocity: 0.0,
            phase: MotionPhase::Idle,
        }
    }

    pub fn phase(&self) -> MotionPhase {
        self.phase
    }

    pub fn target(&self) -> f64 {
        self.target
    }

    /// Modelled position in counts, rounded toward zero.
    pub fn position_counts(&self) -> i32 {
        self.position as i32
    }

    /// Modelled velocity in counts/s, rounded toward zero.
    pub fn velocity_counts(&self) -> i32 {
        self.velocity as i32
    }

    /// Advance the model by one cycle of `dt` seconds and return the phase
    /// in effect after the step. Phase transitions are evaluated before
    /// the velocity integration.
    pub fn advance(&mut self, dt: f64) -> MotionPhase {
        if self.phase == MotionPhase::Idle {
            self.velocity = 0.0;
            return MotionPhase::Idle;
        }

        let distance = self.target - self.position;
        let braking = (self.velocity * self.velocity) / (2.0 * self.acceleration);

        match self.phase {
            MotionPhase::Accelerating => {
                if distance.abs() <= braking {
                    self.phase = MotionPhase::Decelerating;
                } else if self.velocity.abs() >= self.max_velocity {
                    self.phase = MotionPhase::Cruising;
                }
            }
            MotionPhase::Cruising => {
                if distance.abs() <= braking {
                    self.phase = MotionPhase::Decelerating;
                }
            }
            MotionPhase::Decelerating => {
                let crossed = self.direction * distance <= 0.0;
                if crossed || distance.abs() <= POSITION_TOLERANCE_COUNTS {
                    return self.finish();
                }
            }
            MotionPhase::Idle => unreachable!(),
        }

        match self.phase {
            MotionPhase::Accelerating => {
                self.velocity += self.direction * self.acceleration * dt;
                if self.velocity.abs() > self.max_velocity {
                    self.velocity = self.direction * self.max_velocity;
                }
            }
            MotionPhase::Cruising => {
                self.velocity = self.direction * self.max_velocity;
            }
            MotionPhase::Decelerating => {
                self.velocity -= self.direction * self.acceleration * dt;
                if self.velocity * self.direction <= 0.0 {
                    // The profile has no energy left; discretisation can
                    // leave the model short of the target by up to half a
                    // cycle's travel, so finish rather than stall.
                    return self.finish();
                }
            }
            MotionPhase::Idle => unreachable!(),
        }

        self.position += self.velocity * dt;
        self.phase
    }

    /// Enter Idle: snap the model onto the target and kill the velocity.
    fn finish(&mut self) -> MotionPhase {
        self.velocity = 0.0;
        self.position = self.target;
        self.phase = MotionPhase::Idle;
        MotionPhase::Idle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use monoaxis_shared::{COUNTS_PER_DEGREE, CYCLE_TIME_S};

    fn profile_deg(start_deg: f64, target_deg: f64, speed_dps: f64, accel_dps2: f64) -> TrapezoidalProfile {
        TrapezoidalProfile::commit(
            start_deg * COUNTS_PER_DEGREE,
            target_deg * COUNTS_PER_DEGREE,
            speed_dps * COUNTS_PER_DEGREE,
            accel_dps2 * COUNTS_PER_DEGREE,
        )
        .unwrap()
    }

    /// Run to Idle, returning cycles spent in each phase.
    fn run_to_idle(profile: &mut TrapezoidalProfile, max_cycles: usize) -> (usize, usize, usize) {
        let (mut accel, mut cruise, mut decel) = (0, 0, 0);
        for _ in 0..max_cycles {
            match profile.advance(CYCLE_TIME_S) {
                MotionPhase::Accelerating => accel += 1,
                MotionPhase::Cruising => cruise += 1,
                MotionPhase::Decelerating => decel += 1,
                MotionPhase::Idle => return (accel, cruise, decel),
            }
        }
        panic!("profile did not reach Idle within {max_cycles} cycles");
    }

    #[test]
    fn full_turn_profile_is_symmetric_and_lands_on_target() {
        let mut profile = profile_deg(0.0, 360.0, 180.0, 360.0);

        // 0.5 s ramp each way, 1.5 s cruise.
        let (accel, cruise, decel) = run_to_idle(&mut profile, 2_000);
        assert!((248..=252).contains(&accel), "accel cycles: {accel}");
        assert!((740..=760).contains(&cruise), "cruise cycles: {cruise}");
        assert!(decel <= 252, "decel cycles: {decel}");

        let target = (360.0 * COUNTS_PER_DEGREE) as i32;
        assert_eq!(profile.position_counts(), target);
        assert_eq!(profile.velocity_counts(), 0);
        assert!((target - 2_097_152).abs() <= 1);
    }

    #[test]
    fn reverse_move_is_symmetric() {
        let mut profile = profile_deg(0.0, -90.0, 180.0, 360.0);
        run_to_idle(&mut profile, 2_000);

        let expected = (-90.0 * COUNTS_PER_DEGREE) as i32;
        assert_eq!(profile.position_counts(), expected);
    }

    #[test]
    fn zero_distance_commits_directly_to_idle() {
        let profile = TrapezoidalProfile::commit(1000.0, 1000.0, 50.0, 50.0).unwrap();
        assert_eq!(profile.phase(), MotionPhase::Idle);
        assert_eq!(profile.position_counts(), 1000);

        let mut profile = profile;
        assert_eq!(profile.advance(CYCLE_TIME_S), MotionPhase::Idle);
        assert_eq!(profile.velocity_counts(), 0);
    }

    #[test]
    fn terminates_within_the_analytic_bound() {
        for (distance_deg, speed, accel) in [
            (360.0, 180.0, 360.0),
            (10.0, 720.0, 360.0),
            (0.03, 180.0, 360.0),
            (-123.4, 90.0, 1000.0),
        ] {
            let mut profile = profile_deg(0.0, distance_deg, speed, accel);

            let distance = (distance_deg * COUNTS_PER_DEGREE).abs();
            let max_v = speed * COUNTS_PER_DEGREE;
            let a = accel * COUNTS_PER_DEGREE;
            let bound = ((2.0 * max_v / a + distance / max_v) / CYCLE_TIME_S).ceil() as usize + 1;

            run_to_idle(&mut profile, bound);
        }
    }

    #[test]
    fn short_move_never_cruises() {
        // Too short to reach the velocity limit: triangular profile.
        let mut profile = profile_deg(0.0, 5.0, 360.0, 360.0);
        let (accel, cruise, decel) = run_to_idle(&mut profile, 2_000);
        assert_eq!(cruise, 0);
        assert!(accel > 0 && decel > 0);
    }

    #[test]
    fn cruise_velocity_is_clamped_to_the_limit() {
        let mut profile = profile_deg(0.0, 360.0, 180.0, 3600.0);
        let limit = 180.0 * COUNTS_PER_DEGREE;

        loop {
            let phase = profile.advance(CYCLE_TIME_S);
            assert!(
                profile.velocity_counts().unsigned_abs() as f64 <= limit + 1.0,
                "velocity exceeded the limit"
            );
            if phase == MotionPhase::Idle {
                break;
            }
        }
    }

    #[test]
    fn rejects_non_positive_limits() {
        assert_eq!(
            TrapezoidalProfile::commit(0.0, 100.0, 0.0, 10.0).unwrap_err(),
            ProfileError::NonPositiveVelocity(0.0)
        );
        assert_eq!(
            TrapezoidalProfile::commit(0.0, 100.0, -5.0, 10.0).unwrap_err(),
            ProfileError::NonPositiveVelocity(-5.0)
        );
        assert_eq!(
            TrapezoidalProfile::commit(0.0, 100.0, 10.0, 0.0).unwrap_err(),
            ProfileError::NonPositiveAcceleration(0.0)
        );
        assert_eq!(
            TrapezoidalProfile::commit(0.0, 100.0, 10.0, -1.0).unwrap_err(),
            ProfileError::NonPositiveAcceleration(-1.0)
        );
    }

    #[test]
    fn idle_snaps_exactly_onto_the_target() {
        let mut profile = profile_deg(0.0, 90.0, 180.0, 360.0);
        run_to_idle(&mut profile, 2_000);
        assert_eq!(profile.position_counts(), profile.target() as i32);
    }
}
