use super::{CameraError, CameraInterface, CameraResult};
use ndarray::Array2;

/// Produces a raw frame from (gain, exposure_ms, frame_number)
pub type FrameGenerator = Box<dyn FnMut(i64, f32, u64) -> Array2<u16> + Send>;

/// Command received by a [`MockCamera`], in call order
#[derive(Debug, Clone, PartialEq)]
pub enum CameraCommand {
    Open,
    SetGain(i64),
    SetExposureTime(f32),
    Close,
}

/// Camera operation that can be made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockFailure {
    SetGain,
    SetExposureTime,
    ReadFrame,
}

pub struct MockCamera {
    name: String,
    generator: FrameGenerator,
    gain: i64,
    exposure_ms: f32,
    frame_count: u64,
    is_open: bool,
    commands: Vec<CameraCommand>,
    gain_failures: usize,
    exposure_failures: usize,
    read_failures: usize,
}

impl MockCamera {
    pub fn new(name: impl Into<String>, generator: FrameGenerator) -> Self {
        Self {
            name: name.into(),
            generator,
            gain: 1,
            exposure_ms: 1.0,
            frame_count: 0,
            is_open: false,
            commands: Vec::new(),
            gain_failures: 0,
            exposure_failures: 0,
            read_failures: 0,
        }
    }

    /// Camera that returns the same frame regardless of settings
    pub fn new_repeating(name: impl Into<String>, frame: Array2<u16>) -> Self {
        Self::new(name, Box::new(move |_, _, _| frame.clone()))
    }

    /// Make the next `count` calls of `op` fail
    pub fn inject_failures(&mut self, op: MockFailure, count: usize) {
        match op {
            MockFailure::SetGain => self.gain_failures = count,
            MockFailure::SetExposureTime => self.exposure_failures = count,
            MockFailure::ReadFrame => self.read_failures = count,
        }
    }

    /// Gain currently applied to the detector
    pub fn gain(&self) -> i64 {
        self.gain
    }

    /// Exposure time currently applied to the detector
    pub fn exposure_ms(&self) -> f32 {
        self.exposure_ms
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    pub fn is_open(&self) -> bool {
        self.is_open
    }

    /// Every successful command, in call order
    pub fn commands(&self) -> &[CameraCommand] {
        &self.commands
    }

    fn ensure_open(&self) -> CameraResult<()> {
        if self.is_open {
            Ok(())
        } else {
            Err(CameraError::NotOpen)
        }
    }

    fn take_failure(counter: &mut usize) -> bool {
        if *counter > 0 {
            *counter -= 1;
            true
        } else {
            false
        }
    }
}

impl CameraInterface for MockCamera {
    fn open(&mut self) -> CameraResult<()> {
        self.is_open = true;
        self.commands.push(CameraCommand::Open);
        Ok(())
    }

    fn set_gain(&mut self, gain: i64) -> CameraResult<()> {
        self.ensure_open()?;
        if Self::take_failure(&mut self.gain_failures) {
            return Err(CameraError::HardwareError(format!(
                "Injected failure setting gain {gain}"
            )));
        }
        if gain < 1 {
            return Err(CameraError::ConfigError(format!("Gain {gain} out of range")));
        }
        self.gain = gain;
        self.commands.push(CameraCommand::SetGain(gain));
        Ok(())
    }

    fn set_exposure_time(&mut self, exposure_ms: f32) -> CameraResult<()> {
        self.ensure_open()?;
        if Self::take_failure(&mut self.exposure_failures) {
            return Err(CameraError::HardwareError(format!(
                "Injected failure setting exposure {exposure_ms} ms"
            )));
        }
        if exposure_ms <= 0.0 {
            return Err(CameraError::ConfigError(format!(
                "Exposure {exposure_ms} ms out of range"
            )));
        }
        self.exposure_ms = exposure_ms;
        self.commands.push(CameraCommand::SetExposureTime(exposure_ms));
        Ok(())
    }

    fn read_frame(&mut self) -> CameraResult<Array2<u16>> {
        self.ensure_open()?;
        if Self::take_failure(&mut self.read_failures) {
            return Err(CameraError::CaptureError(
                "Injected readout failure".to_string(),
            ));
        }
        let frame = (self.generator)(self.gain, self.exposure_ms, self.frame_count);
        self.frame_count += 1;
        Ok(frame)
    }

    fn close(&mut self) -> CameraResult<()> {
        self.is_open = false;
        self.commands.push(CameraCommand::Close);
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}
