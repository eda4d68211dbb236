//! Real-time loops.
//!
//! [`AcquisitionLoop`] owns the camera: it applies pending detector settings,
//! reads and corrects frames, publishes them on the corrected stream and runs
//! the autogain controller. [`WfsLoop`] consumes the corrected stream and
//! turns every new frame into slopes and statistics. The two only share the
//! stream and the published parameters, so each can run on its own thread.

use crate::autogain::GainController;
use crate::bias::BiasModel;
use crate::centroid::{CentroidExtractor, FrameSummary};
use crate::detector::{ChangeObserver, DetectorParams, ObservedChanges};
use crate::error::Result;
use crate::exposure_table::ExposureSetting;
use log::{debug, info, warn};
use ndarray::Array2;
use shared::calibration_store::CalibrationSource;
use shared::camera_interface::CameraInterface;
use shared::image_stream::{ImageStream, StreamReadError};
use shared::param_channel::{versions_elapsed, SharedParam};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Default wait for a new corrected frame before re-checking the stop flag
pub const DEFAULT_FRAME_TIMEOUT: Duration = Duration::from_millis(100);

/// Shared stop request, checked once per loop iteration
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// What one acquisition iteration did
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AcquisitionStep {
    pub changes: ObservedChanges,
    /// Corrected stream counter, if a frame was published
    pub frame_counter: Option<u64>,
    /// Operating point requested by autogain
    pub autogain_request: Option<ExposureSetting>,
}

pub struct AcquisitionLoop<C: CameraInterface> {
    camera: C,
    bias: BiasModel,
    calibration: Arc<dyn CalibrationSource>,
    params: DetectorParams,
    observer: ChangeObserver,
    autogain: Option<GainController>,
    flux: SharedParam<f32>,
    corrected: Arc<ImageStream<f32>>,
    scratch: Array2<f32>,
}

impl<C: CameraInterface> AcquisitionLoop<C> {
    /// Build the loop.
    ///
    /// # Arguments
    /// * `camera` - Detector, opened by [`start`](Self::start)
    /// * `bias` - Correction model; its size sets the corrected stream shape
    /// * `calibration` - Source of static bias and flat maps
    /// * `params` - Published gain, exposure and autogain enable
    /// * `flux` - Brightest-subaperture statistic read by autogain
    pub fn new(
        camera: C,
        bias: BiasModel,
        calibration: Arc<dyn CalibrationSource>,
        params: DetectorParams,
        flux: SharedParam<f32>,
    ) -> Self {
        let size = bias.size();
        Self {
            camera,
            observer: ChangeObserver::new(&params),
            corrected: Arc::new(ImageStream::new("shwfs_corrected", size.height, size.width)),
            scratch: size.zeros_f32(),
            bias,
            calibration,
            params,
            autogain: None,
            flux,
        }
    }

    pub fn with_autogain(mut self, controller: GainController) -> Self {
        self.autogain = Some(controller);
        self
    }

    pub fn corrected_stream(&self) -> &Arc<ImageStream<f32>> {
        &self.corrected
    }

    pub fn params(&self) -> &DetectorParams {
        &self.params
    }

    pub fn camera(&self) -> &C {
        &self.camera
    }

    pub fn camera_mut(&mut self) -> &mut C {
        &mut self.camera
    }

    pub fn bias(&self) -> &BiasModel {
        &self.bias
    }

    pub fn autogain(&self) -> Option<&GainController> {
        self.autogain.as_ref()
    }

    /// Open the camera, apply the published settings and load calibration.
    ///
    /// Only a failure to open the camera is fatal.
    pub fn start(&mut self) -> Result<()> {
        self.camera.open()?;

        let initial = self.params.current();
        if let Err(e) = self.camera.set_exposure_time(initial.exposure_ms) {
            warn!("Cannot set initial exposure on {}: {e}", self.camera.name());
        }
        if let Err(e) = self.camera.set_gain(initial.gain) {
            warn!("Cannot set initial gain on {}: {e}", self.camera.name());
        }
        self.bias.reload(self.calibration.as_ref(), initial.gain);

        info!(
            "Acquisition started on {} at {initial}, frame {}",
            self.camera.name(),
            self.bias.size()
        );
        Ok(())
    }

    /// One iteration: settings, frame, correction, publish, autogain
    pub fn step(&mut self) -> AcquisitionStep {
        let changes = self.observer.observe(&self.params);
        self.apply_pending();

        let frame_counter = match self.camera.read_frame() {
            Ok(raw) => match self.bias.correct_into(&raw, &mut self.scratch) {
                Ok(_) => match self.corrected.exchange(&mut self.scratch) {
                    Ok(counter) => Some(counter),
                    Err(e) => {
                        warn!("Cannot publish corrected frame: {e}");
                        None
                    }
                },
                Err(e) => {
                    warn!("Dropping frame from {}: {e}", self.camera.name());
                    None
                }
            },
            Err(e) => {
                warn!("Frame read failed on {}: {e}", self.camera.name());
                None
            }
        };

        let autogain_request = self
            .autogain
            .as_mut()
            .and_then(|controller| controller.step(&self.params, self.flux.as_ref()));

        AcquisitionStep {
            changes,
            frame_counter,
            autogain_request,
        }
    }

    fn apply_pending(&mut self) {
        if let Some(exposure_ms) = self.params.take_pending_exposure() {
            match self.camera.set_exposure_time(exposure_ms) {
                Ok(()) => debug!("Exposure set to {exposure_ms} ms"),
                Err(e) => warn!("Cannot set exposure {exposure_ms} ms: {e}"),
            }
        }

        if let Some(gain) = self.params.take_pending_gain() {
            match self.camera.set_gain(gain) {
                Ok(()) => {
                    debug!("Gain set to {gain}");
                    self.bias.reload(self.calibration.as_ref(), gain);
                }
                Err(e) => warn!("Cannot set gain {gain}: {e}"),
            }
        }
    }

    /// Start, iterate until `stop` is raised, then close the camera.
    ///
    /// # Returns
    /// Number of frames published
    pub fn run(&mut self, stop: &StopSignal) -> Result<u64> {
        self.start()?;

        let mut published = 0u64;
        while !stop.is_stopped() {
            if self.step().frame_counter.is_some() {
                published += 1;
            }
        }

        if let Err(e) = self.camera.close() {
            warn!("Cannot close {}: {e}", self.camera.name());
        }
        info!("Acquisition stopped after {published} frames");
        Ok(published)
    }
}

/// Wavefront-sensor loop driven by the corrected stream
pub struct WfsLoop {
    extractor: CentroidExtractor,
    corrected: Arc<ImageStream<f32>>,
    last_seen: u64,
    timeout: Duration,
    skipped: u64,
}

impl WfsLoop {
    /// Consume frames published on `corrected` after this call
    pub fn new(extractor: CentroidExtractor, corrected: Arc<ImageStream<f32>>) -> Self {
        Self {
            extractor,
            last_seen: corrected.counter(),
            corrected,
            timeout: DEFAULT_FRAME_TIMEOUT,
            skipped: 0,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn extractor(&self) -> &CentroidExtractor {
        &self.extractor
    }

    pub fn extractor_mut(&mut self) -> &mut CentroidExtractor {
        &mut self.extractor
    }

    /// Frames published but never processed because a newer one was ready
    pub fn skipped_frames(&self) -> u64 {
        self.skipped
    }

    /// Process the next corrected frame.
    ///
    /// Returns `Ok(None)` when nothing new arrived before the timeout.
    pub fn step(&mut self) -> Result<Option<FrameSummary>> {
        match self.corrected.wait_for_update(self.last_seen, self.timeout) {
            Ok(_) => {}
            Err(StreamReadError::Timeout) => return Ok(None),
        }

        let (frame, counter) = self.corrected.snapshot();
        let missed = versions_elapsed(counter, self.last_seen).saturating_sub(1);
        if missed > 0 {
            debug!("WFS loop skipped {missed} frames");
            self.skipped += missed;
        }
        self.last_seen = counter;

        self.extractor.process(&frame).map(Some)
    }

    /// Process frames until `stop` is raised, handing each summary to `on_frame`.
    ///
    /// # Returns
    /// Number of frames processed
    pub fn run(
        &mut self,
        stop: &StopSignal,
        mut on_frame: impl FnMut(&FrameSummary),
    ) -> Result<u64> {
        let mut processed = 0u64;
        while !stop.is_stopped() {
            if let Some(summary) = self.step()? {
                processed += 1;
                on_frame(&summary);
            }
        }
        info!(
            "WFS loop stopped after {processed} frames ({} skipped)",
            self.skipped
        );
        Ok(processed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BiasConfig, CentroidConfig};
    use crate::spot_table::SpotTable;
    use shared::calibration_store::InMemoryCalibration;
    use shared::camera_interface::mock::{CameraCommand, MockCamera, MockFailure};
    use shared::image_size::ImageSize;
    use shared::param_channel::ParamCell;
    use shared::test_util::uniform_frame;

    fn acquisition(frame_level: u16) -> AcquisitionLoop<MockCamera> {
        let size = ImageSize::from_width_height(32, 32);
        let camera = MockCamera::new_repeating("mock", uniform_frame(32, 32, frame_level));
        let bias = BiasModel::new(size, &BiasConfig::default()).unwrap();
        let params = DetectorParams::new(ExposureSetting::new(3, 2.0), false);
        AcquisitionLoop::new(
            camera,
            bias,
            Arc::new(InMemoryCalibration::new()),
            params,
            ParamCell::shared("flux_subaperture", 0.0),
        )
    }

    #[test]
    fn test_start_applies_initial_settings() {
        let mut acq = acquisition(100);
        acq.start().unwrap();

        assert!(acq.camera().is_open());
        assert_eq!(acq.camera().gain(), 3);
        assert_eq!(acq.camera().exposure_ms(), 2.0);
        // No calibration available: dynamic bias takes over
        assert!(acq.bias().dynamic_enabled());
    }

    #[test]
    fn test_step_publishes_corrected_frame() {
        let mut acq = acquisition(100);
        acq.start().unwrap();

        let step = acq.step();
        assert_eq!(step.frame_counter, Some(1));
        // Uniform frame minus its own corner estimate
        let (frame, counter) = acq.corrected_stream().snapshot();
        assert_eq!(counter, 1);
        assert!(frame.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_pending_changes_reach_camera() {
        let mut acq = acquisition(100);
        acq.start().unwrap();

        acq.params().gain.publish(7);
        let step = acq.step();
        assert!(step.changes.gain_changed);
        assert_eq!(acq.camera().gain(), 7);
        assert_eq!(
            acq.camera().commands().last(),
            Some(&CameraCommand::SetGain(7))
        );
    }

    #[test]
    fn test_camera_failures_do_not_stop_the_loop() {
        let mut acq = acquisition(100);
        acq.start().unwrap();

        acq.camera_mut().inject_failures(MockFailure::ReadFrame, 2);
        acq.camera_mut().inject_failures(MockFailure::SetExposureTime, 1);
        acq.params().exposure_ms.publish(4.0);

        assert_eq!(acq.step().frame_counter, None);
        assert_eq!(acq.camera().exposure_ms(), 2.0);
        assert_eq!(acq.step().frame_counter, None);
        assert_eq!(acq.step().frame_counter, Some(1));
    }

    #[test]
    fn test_wfs_loop_times_out_without_frames() {
        let spots = SpotTable::from_coords(&[(10, 10, 0, 0)]).unwrap();
        let size = ImageSize::from_width_height(32, 32);
        let extractor = CentroidExtractor::new(spots, size, &CentroidConfig::default()).unwrap();
        let stream = Arc::new(ImageStream::new("corrected", 32, 32));
        let mut wfs = WfsLoop::new(extractor, stream).with_timeout(Duration::from_millis(5));

        assert_eq!(wfs.step().unwrap(), None);
    }

    #[test]
    fn test_wfs_loop_counts_skipped_frames() {
        let spots = SpotTable::from_coords(&[(10, 10, 0, 0)]).unwrap();
        let size = ImageSize::from_width_height(32, 32);
        let extractor = CentroidExtractor::new(spots, size, &CentroidConfig::default()).unwrap();
        let stream = Arc::new(ImageStream::new("corrected", 32, 32));
        let mut wfs = WfsLoop::new(extractor, stream.clone());

        for _ in 0..3 {
            stream.write(|mut buf| buf.fill(1.0));
        }
        let summary = wfs.step().unwrap().unwrap();
        assert_eq!(summary.active_spots, 0);
        assert_eq!(wfs.skipped_frames(), 2);
    }

    #[test]
    fn test_stop_signal_is_shared() {
        let stop = StopSignal::new();
        let other = stop.clone();
        assert!(!stop.is_stopped());
        other.stop();
        assert!(stop.is_stopped());
    }
}
