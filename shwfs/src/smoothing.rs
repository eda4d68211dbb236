//! Frame-to-frame smoothing of the published wavefront statistics.

use crate::error::{Result, ShwfsError};
use serde::{Deserialize, Serialize};
use shared::param_channel::{ParamCell, SharedParam};

/// How a statistic is combined with its previous smoothed value.
///
/// `length` is the equivalent averaging length `n`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum Averaging {
    /// `(value + avg * (n - 1)) / n`
    Rolling { length: f32 },
    /// `c * value + (1 - c) * avg` with `c = 2 / (n + 1)`
    Exponential { length: f32 },
}

impl Averaging {
    /// Fold one new sample into the running average
    pub fn update(&self, average: f32, value: f32) -> f32 {
        match *self {
            Averaging::Rolling { length } => (value + average * (length - 1.0)) / length,
            Averaging::Exponential { length } => {
                let c = 2.0 / (length + 1.0);
                c * value + (1.0 - c) * average
            }
        }
    }

    pub fn length(&self) -> f32 {
        match *self {
            Averaging::Rolling { length } | Averaging::Exponential { length } => length,
        }
    }

    pub fn validate(&self) -> Result<()> {
        let n = self.length();
        if n.is_finite() && n >= 1.0 {
            Ok(())
        } else {
            Err(ShwfsError::InvalidConfig(format!(
                "averaging length {n} must be at least 1"
            )))
        }
    }
}

/// A smoothed value and the parameter it is published on
pub struct SmoothedStatistic {
    value: f32,
    param: SharedParam<f32>,
}

impl SmoothedStatistic {
    /// Starts from 0, like a freshly allocated parameter
    pub fn new(param: SharedParam<f32>) -> Self {
        Self { value: 0.0, param }
    }

    pub fn value(&self) -> f32 {
        self.value
    }

    pub fn param(&self) -> &SharedParam<f32> {
        &self.param
    }

    fn fold(&mut self, averaging: &Averaging, sample: f32) {
        self.value = averaging.update(self.value, sample);
    }

    fn publish(&self) -> u64 {
        self.param.publish(self.value)
    }
}

/// Aggregates of one frame, before smoothing
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FrameAggregates {
    /// Flux of the brightest subaperture
    pub max_flux: f32,
    /// Mean flux over active subapertures
    pub mean_flux: f32,
    /// RMS residual slope against the reference map
    pub rms_residual: f32,
    pub mean_slope_x: f32,
    pub mean_slope_y: f32,
}

/// The five smoothed statistics published after every frame
pub struct FrameStatistics {
    averaging: Averaging,
    pub max_flux: SmoothedStatistic,
    pub mean_flux: SmoothedStatistic,
    pub rms_residual: SmoothedStatistic,
    pub mean_slope_x: SmoothedStatistic,
    pub mean_slope_y: SmoothedStatistic,
}

impl FrameStatistics {
    /// Statistics publishing on fresh in-process parameters
    pub fn new(averaging: Averaging) -> Self {
        Self {
            averaging,
            max_flux: SmoothedStatistic::new(ParamCell::shared("flux_subaperture", 0.0)),
            mean_flux: SmoothedStatistic::new(ParamCell::shared("flux_mean", 0.0)),
            rms_residual: SmoothedStatistic::new(ParamCell::shared("residual", 0.0)),
            mean_slope_x: SmoothedStatistic::new(ParamCell::shared("slope_x", 0.0)),
            mean_slope_y: SmoothedStatistic::new(ParamCell::shared("slope_y", 0.0)),
        }
    }

    /// Statistics publishing on caller-provided parameters, in field order
    pub fn with_params(averaging: Averaging, params: [SharedParam<f32>; 5]) -> Self {
        let [max_flux, mean_flux, rms_residual, mean_slope_x, mean_slope_y] = params;
        Self {
            averaging,
            max_flux: SmoothedStatistic::new(max_flux),
            mean_flux: SmoothedStatistic::new(mean_flux),
            rms_residual: SmoothedStatistic::new(rms_residual),
            mean_slope_x: SmoothedStatistic::new(mean_slope_x),
            mean_slope_y: SmoothedStatistic::new(mean_slope_y),
        }
    }

    pub fn averaging(&self) -> Averaging {
        self.averaging
    }

    /// Fold one frame into every statistic and publish all five.
    ///
    /// Every parameter's version advances, even when its value did not move.
    pub fn update(&mut self, frame: &FrameAggregates) {
        let avg = self.averaging;
        self.max_flux.fold(&avg, frame.max_flux);
        self.mean_flux.fold(&avg, frame.mean_flux);
        self.rms_residual.fold(&avg, frame.rms_residual);
        self.mean_slope_x.fold(&avg, frame.mean_slope_x);
        self.mean_slope_y.fold(&avg, frame.mean_slope_y);

        for stat in self.iter() {
            stat.publish();
        }
    }

    /// Current smoothed values, unsmoothed-struct shaped
    pub fn snapshot(&self) -> FrameAggregates {
        FrameAggregates {
            max_flux: self.max_flux.value(),
            mean_flux: self.mean_flux.value(),
            rms_residual: self.rms_residual.value(),
            mean_slope_x: self.mean_slope_x.value(),
            mean_slope_y: self.mean_slope_y.value(),
        }
    }

    fn iter(&self) -> impl Iterator<Item = &SmoothedStatistic> {
        [
            &self.max_flux,
            &self.mean_flux,
            &self.rms_residual,
            &self.mean_slope_x,
            &self.mean_slope_y,
        ]
        .into_iter()
    }
}
