//! Centralized configuration management

use crate::ble::{Platform, ScanStrategy, ScanningMode};
use crate::scales::traits::ScaleError;
use crate::types::{Sex, WeightUnit};
use chrono::{Datelike, NaiveDate};
use embassy_time::Duration;
use serde::{Deserialize, Serialize};

/// Knobs for the advertisement-only stability gate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StabilizerTuning {
    /// Identical quantized samples needed before a reading counts as stable
    pub stable_repeats: u32,
    /// Minimum change vs. the last emission before another transient is emitted
    pub min_delta_kg: f64,
    /// Quantization step used for repeat detection
    pub weight_epsilon_kg: f64,
    pub emit_transients: bool,
    pub min_emit_interval_s: f64,
    /// Also require the FFD0 service in the advertisement
    pub require_service: bool,
}

impl Default for StabilizerTuning {
    fn default() -> Self {
        Self {
            stable_repeats: 10,
            min_delta_kg: 0.02,
            weight_epsilon_kg: 0.02,
            emit_transients: false,
            min_emit_interval_s: 1.0,
            require_service: false,
        }
    }
}

impl StabilizerTuning {
    pub fn min_emit_interval(&self) -> Duration {
        Duration::from_micros((self.min_emit_interval_s * 1_000_000.0) as u64)
    }

    pub fn validate(&self) -> Result<(), ScaleError> {
        if self.stable_repeats == 0 {
            return Err(ScaleError::InvalidConfig("stable_repeats must be at least 1".to_string()));
        }
        if !(self.weight_epsilon_kg.is_finite() && self.weight_epsilon_kg > 0.0) {
            return Err(ScaleError::InvalidConfig(format!(
                "weight_epsilon_kg must be positive, got {}",
                self.weight_epsilon_kg
            )));
        }
        if !(self.min_delta_kg.is_finite() && self.min_delta_kg >= 0.0) {
            return Err(ScaleError::InvalidConfig(format!(
                "min_delta_kg must not be negative, got {}",
                self.min_delta_kg
            )));
        }
        if !(self.min_emit_interval_s.is_finite() && self.min_emit_interval_s >= 0.0) {
            return Err(ScaleError::InvalidConfig(format!(
                "min_emit_interval_s must not be negative, got {}",
                self.min_emit_interval_s
            )));
        }
        Ok(())
    }
}

/// The person standing on the scale
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BodyProfile {
    pub sex: Sex,
    pub birthdate: NaiveDate,
    pub height_m: f64,
}

impl BodyProfile {
    /// Age in completed years on `today`
    pub fn age_on(&self, today: NaiveDate) -> i32 {
        let mut years = today.year() - self.birthdate.year();
        if (today.month(), today.day()) < (self.birthdate.month(), self.birthdate.day()) {
            years -= 1;
        }
        years
    }

    pub fn age_today(&self) -> i32 {
        self.age_on(chrono::Local::now().date_naive())
    }

    pub fn validate(&self) -> Result<(), ScaleError> {
        if !(self.height_m.is_finite() && self.height_m > 0.0) {
            return Err(ScaleError::InvalidConfig(format!(
                "height_m must be positive, got {}",
                self.height_m
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScaleConfig {
    /// Scale address; required unless `use_advertisements` is set
    pub address: Option<String>,
    /// Unit the scale should display; `None` adopts whatever the scale reports
    pub display_unit: Option<WeightUnit>,
    pub scanning_mode: ScanningMode,
    /// Bluetooth adapter, e.g. `hci1` (Linux only)
    pub adapter: Option<String>,
    /// Read weights from broadcasts instead of connecting
    pub use_advertisements: bool,
    pub tuning: StabilizerTuning,
}

impl Default for ScaleConfig {
    fn default() -> Self {
        Self {
            address: None,
            display_unit: None,
            scanning_mode: ScanningMode::Active,
            adapter: None,
            use_advertisements: false,
            tuning: StabilizerTuning::default(),
        }
    }
}

impl ScaleConfig {
    pub fn validate(&self) -> Result<(), ScaleError> {
        let has_address = self.address.as_deref().is_some_and(|a| !a.trim().is_empty());
        if !self.use_advertisements && !has_address {
            return Err(ScaleError::MissingAddress);
        }
        self.tuning.validate()
    }

    pub fn scan_strategy(&self) -> ScanStrategy {
        ScanStrategy::resolve(self.scanning_mode, self.adapter.as_deref(), Platform::current())
    }
}

/// Everything the driver needs, as stored on disk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverConfig {
    #[serde(default)]
    pub scale: ScaleConfig,
    pub profile: BodyProfile,
}

impl DriverConfig {
    pub fn from_json(json: &str) -> Result<Self, ScaleError> {
        let config: DriverConfig = serde_json::from_str(json)
            .map_err(|e| ScaleError::InvalidConfig(format!("Failed to parse config: {}", e)))?;
        config.scale.validate()?;
        config.profile.validate()?;
        Ok(config)
    }
}
