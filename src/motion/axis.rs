// Single stepper axis: position, target, speed profile
//
// Speeds are steps/second (sign = direction), positions are signed step counts.
// An axis takes at most one step per tick; a fractional accumulator carries the
// partial step between ticks.

use crate::config::AxisConfig;

/// Result of advancing an axis by one tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AxisAdvance {
    /// `Some(forward)` when a step was taken (logical direction)
    pub step: Option<bool>,
    /// Steps remain before the target is reached
    pub busy: bool,
}

#[derive(Debug, Clone)]
pub struct Axis {
    id: usize,
    current_position: i32,
    target_position: i32,
    current_speed: f32,
    commanded_speed: f32,
    max_speed: f32,
    acceleration: f32,
    inverted: bool,
    limit_switch: bool,
    step_progress: f32,
}

impl Axis {
    pub fn new(id: usize, config: &AxisConfig) -> Self {
        Self {
            id,
            current_position: 0,
            target_position: 0,
            current_speed: 0.0,
            commanded_speed: 0.0,
            max_speed: config.max_speed,
            acceleration: config.acceleration,
            inverted: config.inverted,
            limit_switch: false,
            step_progress: 0.0,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn current_position(&self) -> i32 {
        self.current_position
    }

    pub fn target_position(&self) -> i32 {
        self.target_position
    }

    pub fn current_speed(&self) -> f32 {
        self.current_speed
    }

    pub fn commanded_speed(&self) -> f32 {
        self.commanded_speed
    }

    pub fn max_speed(&self) -> f32 {
        self.max_speed
    }

    pub fn acceleration(&self) -> f32 {
        self.acceleration
    }

    pub fn is_inverted(&self) -> bool {
        self.inverted
    }

    /// Debounced limit switch level, refreshed by the controller every tick
    pub fn limit_switch(&self) -> bool {
        self.limit_switch
    }

    pub fn set_limit_switch(&mut self, pressed: bool) {
        self.limit_switch = pressed;
    }

    pub fn distance_to_go(&self) -> i32 {
        self.target_position.saturating_sub(self.current_position)
    }

    /// Absolute target with a cruise speed cap
    pub fn move_to(&mut self, target: i32, speed: f32) {
        self.target_position = target;
        self.commanded_speed = speed;
    }

    /// Relative target, added to the current target
    pub fn move_by(&mut self, delta: i32, speed: f32) {
        self.target_position = self.target_position.saturating_add(delta);
        self.commanded_speed = speed;
    }

    /// Fixed speed for continuous motion
    pub fn set_speed(&mut self, speed: f32) {
        self.commanded_speed = speed.clamp(-self.max_speed, self.max_speed);
    }

    /// Redefine the current position (and target) without moving
    pub fn set_current_position(&mut self, position: i32) {
        self.current_position = position;
        self.target_position = position;
        self.current_speed = 0.0;
        self.step_progress = 0.0;
    }

    /// Zero both speeds and drop any remaining distance
    pub fn halt(&mut self) {
        self.commanded_speed = 0.0;
        self.current_speed = 0.0;
        self.target_position = self.current_position;
        self.step_progress = 0.0;
    }

    /// Zero speeds but keep the target so a later enable resumes the move
    pub fn cut_power(&mut self) {
        self.commanded_speed = 0.0;
        self.current_speed = 0.0;
        self.step_progress = 0.0;
    }

    fn cruise_speed(&self) -> f32 {
        let requested = self.commanded_speed.abs();
        if requested == 0.0 {
            self.max_speed
        } else {
            requested.min(self.max_speed)
        }
    }

    /// Run at the commanded speed, no position target
    pub(crate) fn run_speed(&mut self, dt: f32) -> AxisAdvance {
        self.current_speed = self.commanded_speed.clamp(-self.max_speed, self.max_speed);
        AxisAdvance {
            step: self.advance(dt),
            busy: false,
        }
    }

    /// Ramp towards the target respecting acceleration and the cruise cap
    pub(crate) fn run_to_target(&mut self, dt: f32) -> AxisAdvance {
        let remaining = self.distance_to_go();
        if remaining == 0 {
            self.current_speed = 0.0;
            self.step_progress = 0.0;
            return AxisAdvance {
                step: None,
                busy: false,
            };
        }

        let direction = remaining.signum() as f32;
        let cruise = self.cruise_speed();
        let braking = (2.0 * self.acceleration * remaining.unsigned_abs() as f32).sqrt();
        let creep = (2.0 * self.acceleration).sqrt().min(cruise);
        let desired = direction * cruise.min(braking).max(creep);

        let dv = self.acceleration * dt;
        let mut speed = if self.current_speed < desired {
            (self.current_speed + dv).min(desired)
        } else {
            (self.current_speed - dv).max(desired)
        };
        // Never crawl below creep speed once heading the right way
        if speed * direction >= 0.0 && speed.abs() < creep {
            speed = direction * creep;
        }
        self.current_speed = speed.clamp(-self.max_speed, self.max_speed);

        let step = self.advance(dt);
        let busy = self.distance_to_go() != 0;
        if !busy {
            self.current_speed = 0.0;
            self.step_progress = 0.0;
        }
        AxisAdvance { step, busy }
    }

    fn advance(&mut self, dt: f32) -> Option<bool> {
        if self.current_speed == 0.0 {
            self.step_progress = 0.0;
            return None;
        }

        self.step_progress = (self.step_progress + self.current_speed.abs() * dt).min(1.0);
        if self.step_progress < 1.0 {
            return None;
        }

        self.step_progress -= 1.0;
        let forward = self.current_speed > 0.0;
        self.current_position += if forward { 1 } else { -1 };
        Some(forward)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DT: f32 = 0.001;

    fn axis() -> Axis {
        Axis::new(
            0,
            &AxisConfig {
                max_speed: 100.0,
                acceleration: 75.0,
                inverted: false,
            },
        )
    }

    #[test]
    fn test_run_to_target_reaches_target_monotonically() {
        let mut a = axis();
        a.move_to(25, 80.0);

        let mut last = a.current_position();
        let mut ticks = 0;
        loop {
            let adv = a.run_to_target(DT);
            assert!(a.current_position() >= last, "position went backwards");
            assert!(a.current_speed().abs() <= a.max_speed());
            last = a.current_position();
            ticks += 1;
            if !adv.busy {
                break;
            }
            assert!(ticks < 100_000, "axis never arrived");
        }
        assert_eq!(a.current_position(), 25);
        assert_eq!(a.current_speed(), 0.0);
    }

    #[test]
    fn test_busy_clears_exactly_on_arrival() {
        let mut a = axis();
        a.move_to(-3, 0.0);
        loop {
            let adv = a.run_to_target(DT);
            assert_eq!(adv.busy, a.current_position() != a.target_position());
            if !adv.busy {
                break;
            }
        }
        assert_eq!(a.current_position(), -3);
    }

    #[test]
    fn test_at_most_one_step_per_tick() {
        let mut a = axis();
        a.set_speed(100.0);
        // dt large enough for many steps still yields one
        let adv = a.run_speed(1.0);
        assert_eq!(adv.step, Some(true));
        assert_eq!(a.current_position(), 1);
        assert!(!adv.busy);
    }

    #[test]
    fn test_speed_clamped_to_max() {
        let mut a = axis();
        a.set_speed(-500.0);
        a.run_speed(DT);
        assert_eq!(a.current_speed(), -100.0);
    }

    #[test]
    fn test_cruise_cap_respected() {
        let mut a = axis();
        a.move_to(1000, 30.0);
        for _ in 0..5000 {
            a.run_to_target(DT);
            assert!(a.current_speed() <= 30.0 + f32::EPSILON);
        }
    }

    #[test]
    fn test_halt_drops_remaining_distance() {
        let mut a = axis();
        a.move_to(50, 50.0);
        for _ in 0..200 {
            a.run_to_target(DT);
        }
        a.halt();
        assert_eq!(a.distance_to_go(), 0);
        assert_eq!(a.current_speed(), 0.0);
        assert!(!a.run_to_target(DT).busy);
    }

    #[test]
    fn test_move_by_accumulates_on_target() {
        let mut a = axis();
        a.move_by(10, 20.0);
        a.move_by(5, 20.0);
        assert_eq!(a.target_position(), 15);
        assert_eq!(a.current_position(), 0);
    }
}
