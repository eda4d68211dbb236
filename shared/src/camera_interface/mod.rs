//! Camera abstraction for the wavefront-sensor acquisition loop
//!
//! The acquisition loop only needs a narrow command set: open, set gain, set
//! exposure time, read a frame and close. Vendor drivers implement
//! [`CameraInterface`]; [`mock::MockCamera`] backs the simulator and the tests.

pub mod mock;

use ndarray::Array2;
use std::error::Error;
use std::fmt;

/// Error type for camera operations
#[derive(Debug, Clone, PartialEq)]
pub enum CameraError {
    /// Hardware communication error
    HardwareError(String),
    /// Frame capture error
    CaptureError(String),
    /// Requested setting is out of range or unsupported
    ConfigError(String),
    /// Command issued before `open()` or after `close()`
    NotOpen,
}

impl fmt::Display for CameraError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CameraError::HardwareError(msg) => write!(f, "Hardware error: {msg}"),
            CameraError::CaptureError(msg) => write!(f, "Capture error: {msg}"),
            CameraError::ConfigError(msg) => write!(f, "Configuration error: {msg}"),
            CameraError::NotOpen => write!(f, "Camera is not open"),
        }
    }
}

impl Error for CameraError {}

/// Result type for camera operations
pub type CameraResult<T> = Result<T, CameraError>;

/// Trait for the detector driving the wavefront sensor
///
/// Every call may fail. The acquisition loop logs failures during steady-state
/// operation and keeps running with the previous setting.
pub trait CameraInterface: Send {
    /// Open the detector and start acquisition
    fn open(&mut self) -> CameraResult<()>;

    /// Set the (EM) gain
    ///
    /// # Arguments
    /// * `gain` - Gain value in camera-specific integer units
    fn set_gain(&mut self, gain: i64) -> CameraResult<()>;

    /// Set exposure time
    ///
    /// # Arguments
    /// * `exposure_ms` - Exposure time in milliseconds
    fn set_exposure_time(&mut self, exposure_ms: f32) -> CameraResult<()>;

    /// Block until the next raw frame is read out
    fn read_frame(&mut self) -> CameraResult<Array2<u16>>;

    /// Stop acquisition and release the detector
    fn close(&mut self) -> CameraResult<()>;

    /// Get camera name/identifier
    fn name(&self) -> &str;
}
