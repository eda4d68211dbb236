use shared::calibration_store::CalibrationError;
use shared::camera_interface::CameraError;
use std::path::PathBuf;
use thiserror::Error;

/// Errors produced by the wavefront-sensor core.
#[derive(Error, Debug)]
pub enum ShwfsError {
    /// A required table file could not be opened or read.
    #[error("cannot read {kind} table {path}: {source}")]
    TableRead {
        /// Which table ("spot" or "exposure").
        kind: &'static str,
        /// File that failed to open.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The exposure table contains no `EXP` record.
    #[error("exposure table has no EXP records")]
    EmptyExposureTable,

    /// The spot table contains no `SPOT` record.
    #[error("spot table has no SPOT records")]
    EmptySpotTable,

    /// A subaperture window does not fit in the corrected frame.
    #[error("spot {index} window at ({x}, {y}) exceeds frame {frame}")]
    SpotOutOfFrame {
        /// Spot index in file order.
        index: usize,
        /// Window column origin.
        x: usize,
        /// Window row origin.
        y: usize,
        /// Corrected frame size.
        frame: String,
    },

    /// A subaperture's output cell lies beyond the largest supported grid.
    #[error("spot {index} output cell ({out_x}, {out_y}) outside the {limit}x{limit} grid")]
    SpotOutOfGrid {
        /// Spot index in file order.
        index: usize,
        /// Output grid column.
        out_x: usize,
        /// Output grid row.
        out_y: usize,
        /// Largest allowed grid edge.
        limit: usize,
    },

    /// Frame handed to a stage does not have the configured size.
    #[error("frame size {actual} does not match expected {expected}")]
    FrameSizeMismatch {
        /// Configured size.
        expected: String,
        /// Size received.
        actual: String,
    },

    /// Raw detector frame is smaller than the configured readout layout needs.
    #[error("raw frame {actual} too small, layout needs {required}")]
    RawFrameTooSmall {
        /// Raw frame size.
        actual: String,
        /// Minimum raw size for the layout.
        required: String,
    },

    /// Configuration validation failure.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Configuration file could not be parsed.
    #[error("cannot parse configuration: {0}")]
    ConfigParse(#[from] serde_json::Error),

    /// Calibration store failure that could not be recovered locally.
    #[error("calibration error: {0}")]
    Calibration(#[from] CalibrationError),

    /// Camera failure during startup.
    #[error("camera error: {0}")]
    Camera(#[from] CameraError),

    /// I/O failure outside table loading.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias for the wavefront-sensor core.
pub type Result<T> = std::result::Result<T, ShwfsError>;
