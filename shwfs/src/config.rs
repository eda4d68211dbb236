//! Runtime configuration.
//!
//! One JSON document with `detector`, `centroid`, `bias` and `autogain`
//! sections. Missing sections and fields take their defaults.

use crate::autogain::AutogainBands;
use crate::bias::{DynamicBiasMode, RawLayout};
use crate::centroid::CentroidAlgorithm;
use crate::error::{Result, ShwfsError};
use crate::smoothing::Averaging;
use serde::{Deserialize, Serialize};
use shared::image_size::ImageSize;
use std::path::Path;

/// Corrected-frame geometry and the operating point used at startup
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Corrected frame width in pixels
    pub frame_width: usize,
    /// Corrected frame height in pixels
    pub frame_height: usize,
    /// Gain applied when the camera is opened
    pub initial_gain: i64,
    /// Exposure time applied when the camera is opened (ms)
    pub initial_exposure_ms: f32,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            frame_width: 64,
            frame_height: 64,
            initial_gain: 1,
            initial_exposure_ms: 1.0,
        }
    }
}

impl DetectorConfig {
    pub fn frame_size(&self) -> ImageSize {
        ImageSize::from_width_height(self.frame_width, self.frame_height)
    }
}

/// Per-subaperture centroiding and statistics smoothing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CentroidConfig {
    pub algorithm: CentroidAlgorithm,
    /// Subapertures with less flux than this are inactive
    pub flux_threshold: f32,
    /// Smoothing applied to the frame statistics
    pub averaging: Averaging,
}

impl Default for CentroidConfig {
    fn default() -> Self {
        Self {
            algorithm: CentroidAlgorithm::CenterOfMass,
            flux_threshold: 100.0,
            // c = 2 / (n + 1) = 0.1
            averaging: Averaging::Exponential { length: 19.0 },
        }
    }
}

/// Static calibration templates and dynamic bias estimation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BiasConfig {
    /// Keep dynamic bias on even when a static bias map loads
    pub force_dynamic: bool,
    pub dynamic_mode: DynamicBiasMode,
    /// Edge length of each corner sampling region (px)
    pub region_size: usize,
    /// Bias map name template, relative to the calibration root
    pub bias_template: String,
    /// Flat map name template, relative to the calibration root
    pub flat_template: String,
    /// Detector temperature setpoint (C)
    pub temperature: i64,
    pub readout_mode: i64,
    pub binning: i64,
    /// Mapping from the raw readout buffer into the corrected frame
    pub layout: RawLayout,
}

impl Default for BiasConfig {
    fn default() -> Self {
        Self {
            force_dynamic: false,
            dynamic_mode: DynamicBiasMode::Average,
            region_size: 8,
            bias_template:
                "bias/bias_{temperature:02}C_{readout_mode:02}rom_{binning:01}b_{gain:04}g.fits"
                    .to_string(),
            flat_template:
                "flat/flat_{temperature:02}C_{readout_mode:02}rom_{binning:01}b_{gain:04}g.fits"
                    .to_string(),
            temperature: -60,
            readout_mode: 1,
            binning: 2,
            layout: RawLayout::default(),
        }
    }
}

/// Gain/exposure controller settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutogainConfig {
    /// Autogain state at startup
    pub enabled: bool,
    /// Settle time after a change before flux is evaluated again (ms)
    pub wait_time_ms: f32,
    /// Sensor readout time, the shortest possible frame period (ms)
    pub readout_time_ms: f32,
    pub bands: AutogainBands,
}

impl Default for AutogainConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            wait_time_ms: 500.0,
            readout_time_ms: 1.0,
            bands: AutogainBands::default(),
        }
    }
}

/// Top-level configuration for the wavefront-sensor loops
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ShwfsConfig {
    pub detector: DetectorConfig,
    pub centroid: CentroidConfig,
    pub bias: BiasConfig,
    pub autogain: AutogainConfig,
}

impl ShwfsConfig {
    /// Parse a JSON configuration; missing fields take their defaults
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON configuration file
    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Reject settings no loop can run with
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(ShwfsError::InvalidConfig(msg));

        let det = &self.detector;
        if det.frame_width == 0 || det.frame_height == 0 {
            return invalid(format!("frame size {} is empty", det.frame_size()));
        }
        if det.initial_exposure_ms.is_nan() || det.initial_exposure_ms <= 0.0 {
            return invalid(format!(
                "initial exposure {} ms must be positive",
                det.initial_exposure_ms
            ));
        }

        if !self.centroid.flux_threshold.is_finite() {
            return invalid("flux threshold must be finite".to_string());
        }
        self.centroid.averaging.validate()?;

        let bias = &self.bias;
        if bias.region_size == 0 {
            return invalid("bias region size must be at least 1 px".to_string());
        }
        if det.frame_width < 2 * bias.region_size || det.frame_height < 2 * bias.region_size {
            return invalid(format!(
                "frame {} too small for two {} px bias regions per axis",
                det.frame_size(),
                bias.region_size
            ));
        }
        bias.layout.validate()?;

        let ag = &self.autogain;
        if ag.readout_time_ms.is_nan() || ag.readout_time_ms <= 0.0 {
            return invalid(format!(
                "readout time {} ms must be positive",
                ag.readout_time_ms
            ));
        }
        if ag.wait_time_ms.is_nan() || ag.wait_time_ms < 0.0 {
            return invalid(format!(
                "autogain wait time {} ms must not be negative",
                ag.wait_time_ms
            ));
        }
        ag.bands.validate()?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ShwfsConfig::default();
        config.validate().unwrap();
        assert_eq!(config.bias.region_size, 8);
        assert_eq!(config.autogain.bands.low_gain.lower, 60000.0);
        assert_eq!(config.autogain.bands.low_gain.upper, 75000.0);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = ShwfsConfig::from_json_str(
            r#"{
                "centroid": { "algorithm": "quad_cell", "flux_threshold": 50.0,
                              "averaging": { "method": "rolling", "length": 4.0 } },
                "autogain": { "enabled": true }
            }"#,
        )
        .unwrap();

        assert_eq!(config.centroid.algorithm, CentroidAlgorithm::QuadCell);
        assert_eq!(config.centroid.averaging, Averaging::Rolling { length: 4.0 });
        assert!(config.autogain.enabled);
        assert_eq!(config.autogain.wait_time_ms, 500.0);
        assert_eq!(config.detector.frame_width, 64);
    }

    #[test]
    fn test_zero_readout_time_rejected() {
        let mut config = ShwfsConfig::default();
        config.autogain.readout_time_ms = 0.0;
        assert!(matches!(
            config.validate(),
            Err(ShwfsError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_frame_too_small_for_bias_regions() {
        let mut config = ShwfsConfig::default();
        config.detector.frame_width = 12;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_malformed_json_is_parse_error() {
        let err = ShwfsConfig::from_json_str("{ not json").unwrap_err();
        assert!(matches!(err, ShwfsError::ConfigParse(_)));
    }
}
