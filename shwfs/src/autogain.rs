//! Closed-loop gain/exposure controller.
//!
//! The controller walks the [`ExposureTable`] one step at a time to keep the
//! published brightest-subaperture flux inside a regime-dependent band:
//!
//! - `Idle`: autogain is off.
//! - `Armed`: waiting for the flux statistic to advance by the debounce count
//!   since the last change.
//! - `Evaluating`: settled; every new flux value is checked against the band.
//!
//! A rising edge of the enable parameter (detected by its version moving)
//! restarts from index 0. The version baseline starts one behind the observed
//! version so an enable whose value lands before its version increment is
//! still seen as an edge.

use crate::config::AutogainConfig;
use crate::detector::DetectorParams;
use crate::error::{Result, ShwfsError};
use crate::exposure_table::{ExposureSetting, ExposureTable, Regime};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use shared::param_channel::{versions_elapsed, Parameter};

/// Acceptable flux range for one regime
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FluxBand {
    pub lower: f32,
    pub upper: f32,
}

/// Direction of a table move
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FluxDecision {
    /// Flux above the band: step toward index 0
    LessSensitive,
    /// Flux below the band: step toward the last index
    MoreSensitive,
    Hold,
}

impl FluxBand {
    pub fn new(lower: f32, upper: f32) -> Self {
        Self { lower, upper }
    }

    pub fn decide(&self, flux: f32) -> FluxDecision {
        if flux > self.upper {
            FluxDecision::LessSensitive
        } else if flux < self.lower {
            FluxDecision::MoreSensitive
        } else {
            FluxDecision::Hold
        }
    }
}

/// Flux bands per regime
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutogainBands {
    pub low_gain: FluxBand,
    /// Narrow band at the table's max gain / min exposure point
    pub intermediate: FluxBand,
    pub high_gain: FluxBand,
}

impl Default for AutogainBands {
    fn default() -> Self {
        Self {
            low_gain: FluxBand::new(60000.0, 75000.0),
            intermediate: FluxBand::new(66000.0, 69000.0),
            high_gain: FluxBand::new(50000.0, 75000.0),
        }
    }
}

impl AutogainBands {
    pub fn band(&self, regime: Regime) -> FluxBand {
        match regime {
            Regime::LowGain => self.low_gain,
            Regime::Intermediate => self.intermediate,
            Regime::HighGain => self.high_gain,
        }
    }

    pub fn validate(&self) -> Result<()> {
        for (name, band) in [
            ("low_gain", self.low_gain),
            ("intermediate", self.intermediate),
            ("high_gain", self.high_gain),
        ] {
            if !band.lower.is_finite() || !band.upper.is_finite() || band.lower > band.upper {
                return Err(ShwfsError::InvalidConfig(format!(
                    "{name} flux band [{}, {}] is not a valid range",
                    band.lower, band.upper
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Idle,
    Armed,
    Evaluating,
}

/// Controller state visible to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AutogainState {
    /// Current index into the exposure table
    pub index: usize,
    pub regime: Regime,
    /// Flux versions to wait after a change
    pub debounce_frames: u64,
    pub state: ControllerState,
}

/// Frames to wait so that `wait_time_ms` of wall-clock time has passed.
///
/// Never less than one: a decision always needs a flux value published after
/// the last change.
pub fn debounce_frames(wait_time_ms: f32, exposure_ms: f32, readout_time_ms: f32) -> u64 {
    let period = exposure_ms.max(readout_time_ms);
    if period <= 0.0 || wait_time_ms <= 0.0 {
        return 1;
    }
    ((wait_time_ms / period).ceil() as u64).max(1)
}

pub struct GainController {
    table: ExposureTable,
    bands: AutogainBands,
    wait_time_ms: f32,
    readout_time_ms: f32,
    state: AutogainState,
    flux_baseline: u64,
    enable_baseline: u64,
    debounce_exposure_ms: f32,
}

impl GainController {
    pub fn new(table: ExposureTable, config: &AutogainConfig, params: &DetectorParams) -> Self {
        let exposure_ms = params.exposure_ms.value();
        let current = params.current();
        let regime = table.classify(current.gain, current.exposure_ms);

        Self {
            state: AutogainState {
                index: 0,
                regime,
                debounce_frames: debounce_frames(
                    config.wait_time_ms,
                    exposure_ms,
                    config.readout_time_ms,
                ),
                state: ControllerState::Idle,
            },
            table,
            bands: config.bands,
            wait_time_ms: config.wait_time_ms,
            readout_time_ms: config.readout_time_ms,
            flux_baseline: 0,
            enable_baseline: params.autogain_on.version().wrapping_sub(1),
            debounce_exposure_ms: exposure_ms,
        }
    }

    pub fn state(&self) -> AutogainState {
        self.state
    }

    pub fn table(&self) -> &ExposureTable {
        &self.table
    }

    /// Run one decision against the latest published flux.
    ///
    /// Returns the operating point requested on `params`, if any.
    pub fn step(
        &mut self,
        params: &DetectorParams,
        flux: &dyn Parameter<f32>,
    ) -> Option<ExposureSetting> {
        let (enabled, enable_version) = params.autogain_on.read();
        let (flux_value, flux_version) = flux.read();

        if !enabled {
            if self.state.state != ControllerState::Idle {
                info!("Autogain disabled at index {}", self.state.index);
                self.state.state = ControllerState::Idle;
            }
            return None;
        }

        if enable_version != self.enable_baseline {
            self.enable_baseline = enable_version;
            info!("Autogain enabled, restarting from the least sensitive setting");
            return Some(self.move_to(params, 0, flux_version));
        }

        if params.change_in_flight() {
            // Settings are about to change; the window starts once they land
            self.flux_baseline = flux_version;
            self.state.state = ControllerState::Armed;
            return None;
        }

        let current = params.current();
        self.refresh_debounce(current.exposure_ms);
        self.state.regime = self.table.classify(current.gain, current.exposure_ms);

        if self.state.state != ControllerState::Evaluating {
            if versions_elapsed(flux_version, self.flux_baseline) < self.state.debounce_frames {
                return None;
            }
            self.state.state = ControllerState::Evaluating;
        }

        let band = self.bands.band(self.state.regime);
        let target = match band.decide(flux_value) {
            FluxDecision::Hold => return None,
            FluxDecision::LessSensitive => self.state.index.saturating_sub(1),
            FluxDecision::MoreSensitive => (self.state.index + 1).min(self.table.last_index()),
        };

        if target == self.state.index {
            debug!(
                "Flux {flux_value} outside {:?} band at table edge {}",
                self.state.regime, target
            );
            self.flux_baseline = flux_version;
            self.state.state = ControllerState::Armed;
            return None;
        }

        info!(
            "Flux {flux_value} outside {:?} band [{}, {}], index {} -> {}",
            self.state.regime, band.lower, band.upper, self.state.index, target
        );
        Some(self.move_to(params, target, flux_version))
    }

    fn move_to(
        &mut self,
        params: &DetectorParams,
        index: usize,
        flux_version: u64,
    ) -> ExposureSetting {
        let setting = self.table.get(index);
        params.request(setting);

        self.state.index = index;
        self.state.state = ControllerState::Armed;
        self.flux_baseline = flux_version;
        self.refresh_debounce(setting.exposure_ms);
        setting
    }

    fn refresh_debounce(&mut self, exposure_ms: f32) {
        if exposure_ms != self.debounce_exposure_ms {
            self.debounce_exposure_ms = exposure_ms;
            self.state.debounce_frames =
                debounce_frames(self.wait_time_ms, exposure_ms, self.readout_time_ms);
            debug!("Autogain debounce now {} frames", self.state.debounce_frames);
        }
    }
}
