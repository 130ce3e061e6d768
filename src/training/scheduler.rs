/// Lowest multiplier the schedule decays to
pub const LR_FLOOR: f64 = 0.1;

/// Per-step decay factor
pub const LR_GAMMA: f64 = 0.975;

/// Step-decay learning rate schedule with a floor
///
/// At step `t` the learning rate is `base_lr * max(0.1, 0.975^t)`. The step
/// counter belongs to the schedule, not to the optimizer it drives, so a
/// schedule moved onto a new optimizer keeps decaying where it left off.
#[derive(Debug, Clone, PartialEq)]
pub struct LrSchedule {
    base_lr: f64,
    step: usize,
}

impl LrSchedule {
    /// Create a fresh schedule at step 0
    pub fn new(base_lr: f64) -> Self {
        Self { base_lr, step: 0 }
    }

    /// Multiplier applied at step `t`
    pub fn multiplier(t: usize) -> f64 {
        let t = i32::try_from(t).unwrap_or(i32::MAX);
        LR_GAMMA.powi(t).max(LR_FLOOR)
    }

    /// Learning rate for the next optimizer step
    pub fn get_lr(&self) -> f64 {
        self.base_lr * Self::multiplier(self.step)
    }

    /// Advance by one optimizer step
    pub fn step(&mut self) {
        self.step += 1;
    }

    /// Number of steps taken so far
    pub fn current_step(&self) -> usize {
        self.step
    }

    pub fn base_lr(&self) -> f64 {
        self.base_lr
    }
}
