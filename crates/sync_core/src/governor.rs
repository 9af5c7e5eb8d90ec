//! Hill-climbing controller for the worker pool's concurrency ceiling.
//!
//! Each tick feeds one smoothed CPU reading. A reading below the target band
//! asks for more workers, one above asks for fewer. A change is applied only
//! after `consecutive_required` readings in a row agree on the direction; any
//! reading inside the band, or pointing the other way, resets the count.

use std::time::Duration;

use serde::{Deserialize, Serialize};

const DEFAULT_TICK_MS: u64 = 100;
const DEFAULT_BAND_LOW: f64 = 70.0;
const DEFAULT_BAND_HIGH: f64 = 85.0;
const DEFAULT_STEP: usize = 1;
const DEFAULT_CONSECUTIVE_REQUIRED: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernorSettings {
    pub tick_ms: u64,
    /// Lower bound of the target CPU band, in percent.
    pub band_low: f64,
    /// Upper bound of the target CPU band, in percent.
    pub band_high: f64,
    pub step: usize,
    pub consecutive_required: u8,
    /// Upper bound for the ceiling; `None` means twice the host parallelism.
    pub ceiling: Option<usize>,
}

impl Default for GovernorSettings {
    fn default() -> Self {
        Self {
            tick_ms: DEFAULT_TICK_MS,
            band_low: DEFAULT_BAND_LOW,
            band_high: DEFAULT_BAND_HIGH,
            step: DEFAULT_STEP,
            consecutive_required: DEFAULT_CONSECUTIVE_REQUIRED,
            ceiling: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("invalid governor setting {field}: {reason}")]
pub struct InvalidGovernorSettings {
    pub field: &'static str,
    pub reason: &'static str,
}

impl GovernorSettings {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(1))
    }

    pub fn validate(self) -> Result<Self, InvalidGovernorSettings> {
        if !(0.0..=100.0).contains(&self.band_low) || !(0.0..=100.0).contains(&self.band_high) {
            return Err(InvalidGovernorSettings {
                field: "governor.band",
                reason: "bounds must be within 0..=100",
            });
        }
        if self.band_low >= self.band_high {
            return Err(InvalidGovernorSettings {
                field: "governor.band",
                reason: "band_low must be below band_high",
            });
        }
        if self.step == 0 {
            return Err(InvalidGovernorSettings {
                field: "governor.step",
                reason: "must be >= 1",
            });
        }
        if self.consecutive_required == 0 {
            return Err(InvalidGovernorSettings {
                field: "governor.consecutive_required",
                reason: "must be >= 1",
            });
        }
        Ok(self)
    }
}

/// Job-scoped pool sizing, owned by the governor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoolState {
    pub core_size: usize,
    /// Live concurrency ceiling; workers only read it when scheduling.
    pub max_size: usize,
    /// Upper bound the governor may raise `max_size` to.
    pub ceiling: usize,
    pub queue_capacity: usize,
    pub current_load: f64,
}

impl PoolState {
    pub fn new(core_size: usize, ceiling: usize, queue_capacity: usize) -> Self {
        let ceiling = ceiling.max(1);
        let core_size = core_size.clamp(1, ceiling);
        Self {
            core_size,
            max_size: core_size,
            ceiling,
            queue_capacity,
            current_load: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Grow,
    Shrink,
}

/// A change the governor applied to `PoolState::max_size`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Adjustment {
    pub from: usize,
    pub to: usize,
    pub load: f64,
}

#[derive(Debug, Clone)]
pub struct GovernorController {
    settings: GovernorSettings,
    pending: Option<Direction>,
    consecutive: u8,
    adjustments: u64,
}

impl GovernorController {
    pub fn new(settings: GovernorSettings) -> Self {
        Self {
            settings,
            pending: None,
            consecutive: 0,
            adjustments: 0,
        }
    }

    pub fn settings(&self) -> &GovernorSettings {
        &self.settings
    }

    /// Number of adjustments applied so far.
    pub fn adjustments(&self) -> u64 {
        self.adjustments
    }

    /// Feed one load reading; returns the adjustment applied to `state`, if any.
    pub fn observe(&mut self, load: f64, state: &mut PoolState) -> Option<Adjustment> {
        state.current_load = load;

        let wanted = if load < self.settings.band_low && state.max_size < state.ceiling {
            Some(Direction::Grow)
        } else if load > self.settings.band_high && state.max_size > 1 {
            Some(Direction::Shrink)
        } else {
            None
        };

        let Some(direction) = wanted else {
            self.pending = None;
            self.consecutive = 0;
            return None;
        };

        if self.pending == Some(direction) {
            self.consecutive = self.consecutive.saturating_add(1);
        } else {
            self.pending = Some(direction);
            self.consecutive = 1;
        }
        if self.consecutive < self.settings.consecutive_required {
            return None;
        }

        self.pending = None;
        self.consecutive = 0;

        let from = state.max_size;
        let to = match direction {
            Direction::Grow => from.saturating_add(self.settings.step).min(state.ceiling),
            Direction::Shrink => from.saturating_sub(self.settings.step).max(1),
        };
        state.max_size = to;
        self.adjustments += 1;
        Some(Adjustment { from, to, load })
    }
}
