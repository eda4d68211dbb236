//! Shared plumbing for the wavefront-sensor loops: camera abstraction,
//! versioned parameters, published image streams and calibration storage.

pub mod calibration_store;
pub mod camera_interface;
pub mod image_size;
pub mod image_stream;
pub mod param_channel;
pub mod test_util;
