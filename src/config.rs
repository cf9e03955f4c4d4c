//! Tuning constants for the sweep core.
//!
//! The planner epsilon and the reconciliation tolerance encode assumptions
//! about a specific instrument's noise floor. They are deliberately *not*
//! hard-coded: [`Tuning`] carries them with the empirically validated values
//! as defaults, and they can be overridden from a TOML file or from
//! environment variables prefixed with `SMU_SWEEP_`.
//!
//! # Example
//! ```no_run
//! use smu_sweep::config::Tuning;
//!
//! # fn main() -> Result<(), smu_sweep::error::SweepError> {
//! let tuning = Tuning::load_from("config/sweep.toml")?;
//! # Ok(())
//! # }
//! ```

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{SweepError, SweepResult};

/// Tunable constants for planning, reconciliation and channel pacing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tuning {
    /// Step-proportional term of the planner's level epsilon.
    #[serde(default = "default_level_epsilon_factor")]
    pub level_epsilon_factor: f64,

    /// Absolute floor of the planner's level epsilon.
    #[serde(default = "default_level_epsilon_floor")]
    pub level_epsilon_floor: f64,

    /// Fraction of the sweep's base step allowed between commanded and
    /// measured levels before a point counts as clipped.
    #[serde(default = "default_clip_tolerance_factor")]
    pub clip_tolerance_factor: f64,

    /// Absolute floor of the clip tolerance.
    #[serde(default = "default_clip_tolerance_floor")]
    pub clip_tolerance_floor: f64,

    /// Read timeout used inside drain loops. Sized to bound cancellation
    /// latency, independently of total segment duration.
    #[serde(default = "default_poll_timeout", with = "humantime_serde")]
    pub poll_timeout: Duration,

    /// Read timeout for single command/response exchanges (buffer count,
    /// buffer fetch, health probe).
    #[serde(default = "default_command_timeout", with = "humantime_serde")]
    pub command_timeout: Duration,

    /// Capacity of the bounded progress queue between the sweep worker and
    /// the presentation consumer.
    #[serde(default = "default_progress_queue_capacity")]
    pub progress_queue_capacity: usize,
}

// Default value functions
fn default_level_epsilon_factor() -> f64 {
    1e-9
}

fn default_level_epsilon_floor() -> f64 {
    1e-12
}

fn default_clip_tolerance_factor() -> f64 {
    0.02
}

fn default_clip_tolerance_floor() -> f64 {
    1e-6
}

fn default_poll_timeout() -> Duration {
    Duration::from_millis(250)
}

fn default_command_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_progress_queue_capacity() -> usize {
    256
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            level_epsilon_factor: default_level_epsilon_factor(),
            level_epsilon_floor: default_level_epsilon_floor(),
            clip_tolerance_factor: default_clip_tolerance_factor(),
            clip_tolerance_floor: default_clip_tolerance_floor(),
            poll_timeout: default_poll_timeout(),
            command_timeout: default_command_timeout(),
            progress_queue_capacity: default_progress_queue_capacity(),
        }
    }
}

impl Tuning {
    /// Load tuning from a TOML file merged with `SMU_SWEEP_` environment
    /// variables. Missing file entries fall back to the defaults.
    pub fn load_from<P: AsRef<Path>>(path: P) -> SweepResult<Self> {
        let tuning: Tuning = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("SMU_SWEEP_"))
            .extract()?;
        tuning.validate()?;
        Ok(tuning)
    }

    /// Check that the loaded values are usable.
    pub fn validate(&self) -> SweepResult<()> {
        if self.level_epsilon_factor <= 0.0 || self.level_epsilon_floor <= 0.0 {
            return Err(SweepError::ConfigValidation(
                "level epsilon factor and floor must be positive".into(),
            ));
        }
        if self.clip_tolerance_factor <= 0.0 || self.clip_tolerance_floor <= 0.0 {
            return Err(SweepError::ConfigValidation(
                "clip tolerance factor and floor must be positive".into(),
            ));
        }
        if self.poll_timeout.is_zero() {
            return Err(SweepError::ConfigValidation(
                "poll timeout must be non-zero".into(),
            ));
        }
        if self.poll_timeout > self.command_timeout {
            return Err(SweepError::ConfigValidation(format!(
                "poll timeout {:?} exceeds command timeout {:?}",
                self.poll_timeout, self.command_timeout
            )));
        }
        if self.progress_queue_capacity == 0 {
            return Err(SweepError::ConfigValidation(
                "progress queue capacity must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Planner epsilon for a given step magnitude. Guards the ladder loop
    /// against floating-point drift.
    pub fn level_epsilon(&self, step_magnitude: f64) -> f64 {
        step_magnitude.abs() * self.level_epsilon_factor + self.level_epsilon_floor
    }

    /// Reconciliation tolerance for a given base step.
    pub fn clip_tolerance(&self, base_step: f64) -> f64 {
        (base_step * self.clip_tolerance_factor).max(self.clip_tolerance_floor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_validate() {
        let tuning = Tuning::default();
        assert!(tuning.validate().is_ok());
        assert_eq!(tuning.clip_tolerance_factor, 0.02);
        assert_eq!(tuning.poll_timeout, Duration::from_millis(250));
    }

    #[test]
    fn epsilon_and_tolerance_formulas() {
        let tuning = Tuning::default();
        let eps = tuning.level_epsilon(0.1);
        assert!((eps - (0.1 * 1e-9 + 1e-12)).abs() < 1e-18);

        // Factor term dominates for ordinary steps.
        assert!((tuning.clip_tolerance(1.0) - 0.02).abs() < 1e-12);
        // Floor kicks in for tiny steps.
        assert_eq!(tuning.clip_tolerance(1e-9), 1e-6);
    }

    #[test]
    fn rejects_zero_poll_timeout() {
        let tuning = Tuning {
            poll_timeout: Duration::ZERO,
            ..Tuning::default()
        };
        assert!(matches!(
            tuning.validate(),
            Err(SweepError::ConfigValidation(_))
        ));
    }

    #[test]
    fn loads_overrides_from_toml() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(
            file,
            "clip_tolerance_factor = 0.05\npoll_timeout = \"100ms\""
        )
        .expect("write toml");

        let tuning = Tuning::load_from(file.path()).expect("load");
        assert_eq!(tuning.clip_tolerance_factor, 0.05);
        assert_eq!(tuning.poll_timeout, Duration::from_millis(100));
        // Untouched fields keep their defaults.
        assert_eq!(tuning.clip_tolerance_floor, 1e-6);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let tuning = Tuning::load_from("does/not/exist.toml").expect("load");
        assert_eq!(tuning.level_epsilon_factor, 1e-9);
    }
}
