//! Dropout risk classification with hysteresis
//!
//! The classifier's whole state (current level and three run counters) is
//! packed into one `u64` so the monitor can advance it with a single CAS.
//! Escalation needs a sustained run below a threshold; recovery steps down
//! one level per `recovery_samples` consecutive samples at or above target.

use serde::{Deserialize, Serialize};

use super::history::BufferMetricsSample;

/// Severity of the current dropout risk
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum DropoutLevel {
    /// Healthy
    #[default]
    None = 0,
    /// Sustained fill below the low-water mark
    Warning = 1,
    /// Sustained fill below the hard floor
    Critical = 2,
    /// The pipeline actually ran dry
    Occurred = 3,
}

impl DropoutLevel {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::None,
            1 => Self::Warning,
            2 => Self::Critical,
            _ => Self::Occurred,
        }
    }

    /// One step toward healthy
    pub fn step_down(self) -> Self {
        Self::from_u8((self as u8).saturating_sub(1))
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Self::None => "Healthy",
            Self::Warning => "Warning",
            Self::Critical => "Critical",
            Self::Occurred => "Dropout",
        }
    }
}

/// A level change handed to listeners
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DropoutEvent {
    pub level: DropoutLevel,
    pub previous: DropoutLevel,
    /// Microseconds since the monitor started
    pub timestamp_us: u64,
    /// The sample that caused the change
    pub sample: BufferMetricsSample,
}

/// Thresholds the classifier compares against
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    pub target: f32,
    pub warning: f32,
    pub critical: f32,
    pub warning_samples: u16,
    pub critical_samples: u16,
    pub recovery_samples: u16,
}

/// Unpacked classifier state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClassifierState {
    pub level: DropoutLevel,
    /// Consecutive samples below the warning level
    pub low_run: u16,
    /// Consecutive samples below the critical level
    pub floor_run: u16,
    /// Consecutive samples at or above target
    pub recover_run: u16,
}

impl ClassifierState {
    #[inline]
    pub fn pack(self) -> u64 {
        (self.level as u64)
            | (self.low_run as u64) << 8
            | (self.floor_run as u64) << 24
            | (self.recover_run as u64) << 40
    }

    #[inline]
    pub fn unpack(bits: u64) -> Self {
        Self {
            level: DropoutLevel::from_u8(bits as u8),
            low_run: (bits >> 8) as u16,
            floor_run: (bits >> 24) as u16,
            recover_run: (bits >> 40) as u16,
        }
    }

    /// Advance by one sample
    pub fn step(self, fill: f32, underrun: bool, t: &Thresholds) -> Self {
        if underrun {
            return Self {
                level: DropoutLevel::Occurred,
                ..Self::default()
            };
        }

        let low_run = if fill < t.warning {
            self.low_run.saturating_add(1)
        } else {
            0
        };
        let floor_run = if fill < t.critical {
            self.floor_run.saturating_add(1)
        } else {
            0
        };

        let escalation = if floor_run >= t.critical_samples {
            DropoutLevel::Critical
        } else if low_run >= t.warning_samples {
            DropoutLevel::Warning
        } else {
            DropoutLevel::None
        };

        let mut level = self.level;
        let mut recover_run = 0;
        if escalation > level {
            level = escalation;
        } else if fill >= t.target && level > DropoutLevel::None {
            recover_run = self.recover_run.saturating_add(1);
            if recover_run >= t.recovery_samples {
                level = level.step_down();
                recover_run = 0;
            }
        }

        Self {
            level,
            low_run,
            floor_run,
            recover_run,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thresholds() -> Thresholds {
        Thresholds {
            target: 0.5,
            warning: 0.25,
            critical: 0.1,
            warning_samples: 3,
            critical_samples: 3,
            recovery_samples: 4,
        }
    }

    fn run(fills: &[f32]) -> Vec<DropoutLevel> {
        let t = thresholds();
        let mut state = ClassifierState::default();
        fills
            .iter()
            .map(|&fill| {
                state = state.step(fill, false, &t);
                state.level
            })
            .collect()
    }

    #[test]
    fn test_pack_roundtrip() {
        let state = ClassifierState {
            level: DropoutLevel::Critical,
            low_run: u16::MAX,
            floor_run: 7,
            recover_run: 300,
        };
        assert_eq!(ClassifierState::unpack(state.pack()), state);
    }

    #[test]
    fn test_single_dip_does_not_escalate() {
        let levels = run(&[0.6, 0.05, 0.6, 0.6]);
        assert!(levels.iter().all(|&l| l == DropoutLevel::None));
    }

    #[test]
    fn test_sustained_floor_reaches_critical_within_run() {
        // Below the floor counts toward both runs; critical wins on sample 3
        let levels = run(&[0.05, 0.05, 0.05]);
        assert_eq!(
            levels,
            vec![DropoutLevel::None, DropoutLevel::None, DropoutLevel::Critical]
        );
    }

    #[test]
    fn test_sustained_low_reaches_warning_only() {
        let levels = run(&[0.2; 6]);
        assert_eq!(levels[1], DropoutLevel::None);
        assert_eq!(levels[2], DropoutLevel::Warning);
        assert_eq!(levels[5], DropoutLevel::Warning);
    }

    #[test]
    fn test_between_warning_and_target_holds_level() {
        let mut fills = vec![0.2; 3];
        fills.extend([0.4; 10]);
        let levels = run(&fills);
        assert_eq!(*levels.last().unwrap(), DropoutLevel::Warning);
    }

    #[test]
    fn test_recovery_steps_one_level_per_window() {
        let mut fills = vec![0.05; 3];
        fills.extend([0.8; 8]);
        let levels = run(&fills);
        assert_eq!(levels[2], DropoutLevel::Critical);
        assert_eq!(levels[5], DropoutLevel::Critical);
        assert_eq!(levels[6], DropoutLevel::Warning);
        assert_eq!(levels[9], DropoutLevel::Warning);
        assert_eq!(levels[10], DropoutLevel::None);
    }

    #[test]
    fn test_noisy_recovery_restarts_window() {
        let mut fills = vec![0.2; 3];
        fills.extend([0.8, 0.8, 0.8, 0.4, 0.8, 0.8, 0.8]);
        let levels = run(&fills);
        assert_eq!(*levels.last().unwrap(), DropoutLevel::Warning);
    }

    #[test]
    fn test_underrun_is_occurred() {
        let t = thresholds();
        let state = ClassifierState::default().step(0.9, true, &t);
        assert_eq!(state.level, DropoutLevel::Occurred);

        // A healthy stream walks all the way back down
        let mut state = state;
        for _ in 0..12 {
            state = state.step(0.9, false, &t);
        }
        assert_eq!(state.level, DropoutLevel::None);
    }

    #[test]
    fn test_step_down_saturates() {
        assert_eq!(DropoutLevel::None.step_down(), DropoutLevel::None);
        assert_eq!(DropoutLevel::Occurred.step_down(), DropoutLevel::Critical);
    }
}
