//! Per-subaperture slope and flux extraction.
//!
//! Every subaperture is measured on the 4x4 window anchored at its raw
//! coordinate. Windows whose flux is below the configured threshold (or not
//! positive) are inactive: their slopes are written as zero and they do not
//! contribute to the mean flux, RMS residual or mean slopes. The brightest
//! flux statistic considers every subaperture.

use crate::config::CentroidConfig;
use crate::error::{Result, ShwfsError};
use crate::smoothing::{FrameAggregates, FrameStatistics};
use crate::spot_table::{SpotTable, WINDOW};
use log::error;
use ndarray::{s, Array2, ArrayView2};
use serde::{Deserialize, Serialize};
use shared::image_size::ImageSize;
use shared::image_stream::ImageStream;
use std::sync::Arc;

/// Centroid estimator selected at configuration time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CentroidAlgorithm {
    QuadCell,
    CenterOfMass,
}

impl CentroidAlgorithm {
    pub fn estimator(self) -> Box<dyn SubapertureEstimator> {
        match self {
            CentroidAlgorithm::QuadCell => Box::new(QuadCell),
            CentroidAlgorithm::CenterOfMass => Box::new(CenterOfMass),
        }
    }
}

/// Window sums before normalization
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RawMeasurement {
    pub flux: f32,
    pub dx: f32,
    pub dy: f32,
}

/// Strategy interface for one centroid algorithm
pub trait SubapertureEstimator: Send + Sync {
    /// Unnormalized flux and slopes of a 4x4 window indexed [row, col]
    fn measure(&self, window: ArrayView2<f32>) -> RawMeasurement;

    /// Largest slope magnitude reported after normalization
    fn clamp_limit(&self) -> f32;
}

/// Quadrant sums: `f00` rows 0-1 cols 0-1, `f01` rows 0-1 cols 2-3,
/// `f10` rows 2-3 cols 0-1, `f11` rows 2-3 cols 2-3
#[derive(Debug, Clone, Copy)]
pub struct QuadCell;

impl SubapertureEstimator for QuadCell {
    fn measure(&self, window: ArrayView2<f32>) -> RawMeasurement {
        let quad = |r: usize, c: usize| window.slice(s![r..r + 2, c..c + 2]).sum();
        let f00 = quad(0, 0);
        let f01 = quad(0, 2);
        let f10 = quad(2, 0);
        let f11 = quad(2, 2);

        RawMeasurement {
            flux: f00 + f01 + f10 + f11,
            dx: (f01 + f11) - (f00 + f10),
            dy: (f10 + f11) - (f00 + f01),
        }
    }

    fn clamp_limit(&self) -> f32 {
        1.0
    }
}

/// First moment about the window center
#[derive(Debug, Clone, Copy)]
pub struct CenterOfMass;

const MOMENT_WEIGHTS: [f32; WINDOW] = [-1.5, -0.5, 0.5, 1.5];

impl SubapertureEstimator for CenterOfMass {
    fn measure(&self, window: ArrayView2<f32>) -> RawMeasurement {
        let mut m = RawMeasurement::default();
        for ((r, c), &v) in window.indexed_iter() {
            m.flux += v;
            m.dx += MOMENT_WEIGHTS[c] * v;
            m.dy += MOMENT_WEIGHTS[r] * v;
        }
        m
    }

    fn clamp_limit(&self) -> f32 {
        2.0
    }
}

/// Normalized result for one subaperture
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SpotMeasurement {
    pub flux: f32,
    pub dx: f32,
    pub dy: f32,
    pub active: bool,
}

/// Normalize and clamp a window measurement
pub fn measure_window(
    estimator: &dyn SubapertureEstimator,
    window: ArrayView2<f32>,
    flux_threshold: f32,
) -> SpotMeasurement {
    let raw = estimator.measure(window);

    if raw.flux.is_nan() || raw.flux < flux_threshold || raw.flux <= 0.0 {
        return SpotMeasurement {
            flux: raw.flux,
            ..Default::default()
        };
    }

    let limit = estimator.clamp_limit();
    SpotMeasurement {
        flux: raw.flux,
        dx: (raw.dx / raw.flux).clamp(-limit, limit),
        dy: (raw.dy / raw.flux).clamp(-limit, limit),
        active: true,
    }
}

/// Outcome of one processed frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameSummary {
    /// Unsmoothed aggregates of this frame
    pub frame: FrameAggregates,
    /// Smoothed values after this frame was folded in
    pub smoothed: FrameAggregates,
    pub active_spots: usize,
    /// Slope stream counter written by this frame
    pub slope_counter: u64,
}

/// Turns corrected frames into slope/flux maps and frame statistics
pub struct CentroidExtractor {
    spots: SpotTable,
    frame_size: ImageSize,
    estimator: Box<dyn SubapertureEstimator>,
    flux_threshold: f32,
    /// Reference slopes, row-major in slope-map layout
    reference: Vec<f32>,
    statistics: FrameStatistics,
    slopes: Arc<ImageStream<f32>>,
    flux: Arc<ImageStream<f32>>,
    measurements: Vec<SpotMeasurement>,
}

impl CentroidExtractor {
    /// Build an extractor for corrected frames of `frame_size`.
    ///
    /// Fails if any subaperture window does not fit inside the frame.
    pub fn new(spots: SpotTable, frame_size: ImageSize, config: &CentroidConfig) -> Result<Self> {
        spots.validate_against(frame_size)?;
        config.averaging.validate()?;

        let (rows, cols) = spots.slope_shape();
        let out = spots.output_size();

        Ok(Self {
            frame_size,
            estimator: config.algorithm.estimator(),
            flux_threshold: config.flux_threshold,
            reference: vec![0.0; rows * cols],
            statistics: FrameStatistics::new(config.averaging),
            slopes: Arc::new(ImageStream::new("shwfs_slopes", rows, cols)),
            flux: Arc::new(ImageStream::new("shwfs_slopes_flux", out.height, out.width)),
            measurements: vec![SpotMeasurement::default(); spots.len()],
            spots,
        })
    }

    /// Publish statistics on caller-provided parameters instead of private ones
    pub fn with_statistics(mut self, statistics: FrameStatistics) -> Self {
        self.statistics = statistics;
        self
    }

    /// Replace the reference slope map (same shape as the slope stream)
    pub fn set_reference(&mut self, reference: &Array2<f32>) -> Result<()> {
        let (rows, cols) = self.spots.slope_shape();
        if reference.dim() != (rows, cols) {
            return Err(ShwfsError::FrameSizeMismatch {
                expected: ImageSize::from_width_height(cols, rows).to_string(),
                actual: ImageSize::of(reference).to_string(),
            });
        }
        self.reference = reference.iter().copied().collect();
        Ok(())
    }

    pub fn spots(&self) -> &SpotTable {
        &self.spots
    }

    pub fn slope_stream(&self) -> &Arc<ImageStream<f32>> {
        &self.slopes
    }

    pub fn flux_stream(&self) -> &Arc<ImageStream<f32>> {
        &self.flux
    }

    pub fn statistics(&self) -> &FrameStatistics {
        &self.statistics
    }

    /// Measurements of the last processed frame, in spot order
    pub fn measurements(&self) -> &[SpotMeasurement] {
        &self.measurements
    }

    /// Process one corrected frame: measure every subaperture, write the slope
    /// and flux streams, then fold and publish the frame statistics.
    pub fn process(&mut self, frame: &Array2<f32>) -> Result<FrameSummary> {
        if ImageSize::of(frame) != self.frame_size {
            return Err(ShwfsError::FrameSizeMismatch {
                expected: self.frame_size.to_string(),
                actual: ImageSize::of(frame).to_string(),
            });
        }

        let reference = &self.reference;

        let mut max_flux = 0.0f32;
        let mut flux_sum = 0.0f32;
        let mut residual_sq = 0.0f32;
        let mut slope_x_sum = 0.0f32;
        let mut slope_y_sum = 0.0f32;
        let mut active = 0usize;

        for (spot, m) in self.spots.spots().iter().zip(self.measurements.iter_mut()) {
            let window = frame.slice(s![
                spot.raw_y..spot.raw_y + WINDOW,
                spot.raw_x..spot.raw_x + WINDOW
            ]);
            *m = measure_window(self.estimator.as_ref(), window, self.flux_threshold);

            if m.flux > max_flux {
                max_flux = m.flux;
            }
            if !m.active {
                continue;
            }

            active += 1;
            flux_sum += m.flux;
            slope_x_sum += m.dx;
            slope_y_sum += m.dy;
            let rx = m.dx - reference[spot.slope_x_offset];
            let ry = m.dy - reference[spot.slope_y_offset];
            residual_sq += rx * rx + ry * ry;
        }

        let spots = self.spots.spots();
        let measurements = &self.measurements;
        let ((), slope_counter) = self.slopes.write(|mut buf| match buf.as_slice_mut() {
            Some(out) => {
                for (spot, m) in spots.iter().zip(measurements) {
                    out[spot.slope_x_offset] = m.dx;
                    out[spot.slope_y_offset] = m.dy;
                }
            }
            None => error!("Slope stream buffer is not contiguous"),
        });
        self.flux.write(|mut buf| match buf.as_slice_mut() {
            Some(out) => {
                for (spot, m) in spots.iter().zip(measurements) {
                    out[spot.flux_offset] = m.flux;
                }
            }
            None => error!("Flux stream buffer is not contiguous"),
        });

        let aggregates = if active > 0 {
            let n = active as f32;
            FrameAggregates {
                max_flux,
                mean_flux: flux_sum / n,
                rms_residual: (residual_sq / n).sqrt(),
                mean_slope_x: slope_x_sum / n,
                mean_slope_y: slope_y_sum / n,
            }
        } else {
            FrameAggregates {
                max_flux,
                ..Default::default()
            }
        };
        self.statistics.update(&aggregates);

        Ok(FrameSummary {
            frame: aggregates,
            smoothed: self.statistics.snapshot(),
            active_spots: active,
            slope_counter,
        })
    }
}
