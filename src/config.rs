//! Simulator configuration using Figment.
//!
//! Configuration is loaded from:
//! 1. An optional TOML file (base configuration)
//! 2. Environment variables (prefixed with `RGASIM_`)
//!
//! # Environment Variable Overrides
//!
//! Environment variables with the `RGASIM_` prefix can override configuration
//! values:
//!
//! ```text
//! RGASIM_POINTS_PER_POLL=20
//! RGASIM_PRESSURE_TRIP_THRESHOLD=5e-5
//! RGASIM_DEFAULT_DWELL_MS=50
//! ```
//!
//! Every field has a power-on default matching the emulated instrument, so a
//! missing file is not an error; `Settings::load(None)` yields a fully usable
//! configuration.

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{AppResult, RgaError};

/// Simulator settings.
///
/// These are the knobs that are fixed for the lifetime of a device instance.
/// Everything the remote protocol can change at runtime (dwell, cycles, report
/// mask, ...) lives on the device itself and only takes its *initial* value
/// from here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Identity string the device reports to `pget name`-style queries.
    #[serde(default = "default_instrument_name")]
    pub instrument_name: String,

    /// Total-pressure level above which the simulated pressure trip engages.
    #[serde(default = "default_pressure_trip_threshold")]
    pub pressure_trip_threshold: f64,

    /// Default per-sample acquisition time in milliseconds. Percent dwell
    /// settings are expressed relative to this value.
    #[serde(default = "default_dwell_ms")]
    pub default_dwell_ms: u64,

    /// Default pre-sample settling time in milliseconds.
    #[serde(default = "default_settle_ms")]
    pub default_settle_ms: u64,

    /// Maximum number of records returned by a single (non-"all") data poll.
    #[serde(default = "default_points_per_poll")]
    pub points_per_poll: usize,

    /// Base noise amplitude added to detector readings.
    #[serde(default = "default_noise")]
    pub noise: f64,

    /// Initial electron energy in eV.
    #[serde(default = "default_electron_energy")]
    pub electron_energy: f64,

    /// Initial mass filter setting in AMU.
    #[serde(default = "default_mass")]
    pub mass: f64,
}

fn default_instrument_name() -> String {
    "HAL RC RGA 201 #13656".to_string()
}

fn default_pressure_trip_threshold() -> f64 {
    1.0e-4
}

fn default_dwell_ms() -> u64 {
    100
}

fn default_settle_ms() -> u64 {
    100
}

fn default_points_per_poll() -> usize {
    70
}

fn default_noise() -> f64 {
    1.0e-9
}

fn default_electron_energy() -> f64 {
    70.0
}

fn default_mass() -> f64 {
    2.0
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            instrument_name: default_instrument_name(),
            pressure_trip_threshold: default_pressure_trip_threshold(),
            default_dwell_ms: default_dwell_ms(),
            default_settle_ms: default_settle_ms(),
            points_per_poll: default_points_per_poll(),
            noise: default_noise(),
            electron_energy: default_electron_energy(),
            mass: default_mass(),
        }
    }
}

impl Settings {
    /// Load settings from an optional TOML file plus `RGASIM_` environment
    /// overrides, then validate.
    pub fn load(path: Option<&Path>) -> AppResult<Self> {
        let mut figment = Figment::from(Serialized::defaults(Settings::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        let settings: Settings = figment.merge(Env::prefixed("RGASIM_")).extract()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Semantic validation beyond what serde can express.
    pub fn validate(&self) -> AppResult<()> {
        if self.pressure_trip_threshold <= 0.0 {
            return Err(RgaError::Configuration(
                "pressure_trip_threshold must be positive".to_string(),
            ));
        }
        if self.default_dwell_ms == 0 {
            return Err(RgaError::Configuration(
                "default_dwell_ms must be non-zero".to_string(),
            ));
        }
        if self.points_per_poll == 0 {
            return Err(RgaError::Configuration(
                "points_per_poll must be non-zero".to_string(),
            ));
        }
        if self.noise < 0.0 {
            return Err(RgaError::Configuration(
                "noise must be non-negative".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.points_per_poll, 70);
        assert_eq!(settings.default_dwell_ms, 100);
        assert!((settings.pressure_trip_threshold - 1.0e-4).abs() < f64::EPSILON);
    }

    #[test]
    fn load_without_file_uses_defaults() {
        let settings = Settings::load(None).unwrap();
        assert_eq!(settings.instrument_name, "HAL RC RGA 201 #13656");
        assert!((settings.electron_energy - 70.0).abs() < f64::EPSILON);
    }

    #[test]
    fn toml_file_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "points_per_poll = 12\npressure_trip_threshold = 5e-5\n"
        )
        .unwrap();

        let settings = Settings::load(Some(file.path())).unwrap();
        assert_eq!(settings.points_per_poll, 12);
        assert!((settings.pressure_trip_threshold - 5e-5).abs() < 1e-12);
        // Untouched fields keep their defaults.
        assert_eq!(settings.default_settle_ms, 100);
    }

    #[test]
    fn env_overrides_file() {
        figment::Jail::expect_with(|jail| {
            jail.create_file("rga.toml", "points_per_poll = 12")?;
            jail.set_env("RGASIM_POINTS_PER_POLL", "33");

            let settings = Settings::load(Some(Path::new("rga.toml"))).unwrap();
            assert_eq!(settings.points_per_poll, 33);
            Ok(())
        });
    }

    #[test]
    fn invalid_threshold_rejected() {
        let settings = Settings {
            pressure_trip_threshold: 0.0,
            ..Settings::default()
        };
        assert!(matches!(
            settings.validate(),
            Err(RgaError::Configuration(_))
        ));
    }
}
