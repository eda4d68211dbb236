//! Shack-Hartmann wavefront-sensor core.
//!
//! Raw detector frames are bias/flat corrected ([`bias`]), published on an
//! image stream, and reduced per subaperture to slopes and flux
//! ([`centroid`]). Frame statistics are smoothed and published as versioned
//! parameters ([`smoothing`]); the brightest-subaperture flux feeds the
//! gain/exposure controller ([`autogain`]). [`pipeline`] wires these into
//! the acquisition and wavefront-sensor loops.

pub mod autogain;
pub mod bias;
pub mod centroid;
pub mod config;
pub mod detector;
pub mod error;
pub mod exposure_table;
pub mod pipeline;
pub mod smoothing;
pub mod spot_table;

pub use autogain::{AutogainBands, ControllerState, FluxBand, GainController};
pub use bias::{BiasModel, DynamicBiasMode, RawLayout};
pub use centroid::{CentroidAlgorithm, CentroidExtractor, FrameSummary};
pub use config::ShwfsConfig;
pub use detector::{ChangeObserver, DetectorParams};
pub use error::{Result, ShwfsError};
pub use exposure_table::{ExposureSetting, ExposureTable, Regime};
pub use pipeline::{AcquisitionLoop, StopSignal, WfsLoop};
pub use smoothing::{Averaging, FrameAggregates, FrameStatistics};
pub use spot_table::{SpotDescriptor, SpotTable};
