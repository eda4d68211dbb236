//! Helpers shared by the integration tests

#![allow(dead_code)]

use ndarray::Array2;
use shared::calibration_store::InMemoryCalibration;
use shared::camera_interface::mock::MockCamera;
use shared::image_size::ImageSize;
use shared::test_util::{add_spot, uniform_frame, CENTERED_SPOT};
use shwfs::centroid::FrameSummary;
use shwfs::config::{AutogainConfig, BiasConfig, CentroidConfig};
use shwfs::pipeline::AcquisitionStep;
use shwfs::smoothing::{Averaging, FrameStatistics};
use shwfs::{
    AcquisitionLoop, BiasModel, CentroidAlgorithm, CentroidExtractor, DetectorParams,
    ExposureSetting, ExposureTable, GainController, SpotTable, WfsLoop,
};
use std::sync::Arc;
use std::time::Duration;

pub const FRAME: usize = 32;
pub const PEDESTAL: u16 = 500;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn frame_size() -> ImageSize {
    ImageSize::from_width_height(FRAME, FRAME)
}

/// 2x2 subapertures clear of the bias corner regions
pub fn quad_spots() -> SpotTable {
    SpotTable::from_coords(&[(10, 10, 0, 0), (18, 10, 1, 0), (10, 18, 0, 1), (18, 18, 1, 1)])
        .unwrap()
}

/// Pedestal frame with `weights` rendered at every subaperture window
pub fn spot_frame(spots: &SpotTable, peak: f32, weights: &[[f32; 4]; 4]) -> Array2<u16> {
    let mut frame = uniform_frame(FRAME, FRAME, PEDESTAL);
    for spot in spots.spots() {
        add_spot(&mut frame, spot.raw_x, spot.raw_y, peak, weights);
    }
    frame
}

/// Camera whose spot peak is `rate * gain * exposure_ms`
pub fn scaling_camera(spots: &SpotTable, rate: f32) -> MockCamera {
    let spots = spots.clone();
    MockCamera::new(
        "scaling",
        Box::new(move |gain, exposure_ms, _| {
            spot_frame(&spots, rate * gain as f32 * exposure_ms, &CENTERED_SPOT)
        }),
    )
}

/// Centroid settings without smoothing lag
pub fn unsmoothed(algorithm: CentroidAlgorithm) -> CentroidConfig {
    CentroidConfig {
        algorithm,
        flux_threshold: 100.0,
        averaging: Averaging::Rolling { length: 1.0 },
    }
}

/// Acquisition and WFS loops sharing one stream, driven from the test thread
pub struct Rig {
    pub acquisition: AcquisitionLoop<MockCamera>,
    pub wfs: WfsLoop,
    pub params: DetectorParams,
}

impl Rig {
    pub fn new(
        camera: MockCamera,
        initial: ExposureSetting,
        autogain_on: bool,
        centroid: &CentroidConfig,
    ) -> Self {
        let params = DetectorParams::new(initial, autogain_on);
        let statistics = FrameStatistics::new(centroid.averaging);
        let flux = statistics.max_flux.param().clone();
        let extractor = CentroidExtractor::new(quad_spots(), frame_size(), centroid)
            .unwrap()
            .with_statistics(statistics);
        let bias = BiasModel::new(frame_size(), &BiasConfig::default()).unwrap();

        let acquisition = AcquisitionLoop::new(
            camera,
            bias,
            Arc::new(InMemoryCalibration::new()),
            params.clone(),
            flux,
        );
        let wfs = WfsLoop::new(extractor, acquisition.corrected_stream().clone())
            .with_timeout(Duration::from_millis(5));

        Self {
            acquisition,
            wfs,
            params,
        }
    }

    pub fn with_autogain(mut self, table: ExposureTable, config: &AutogainConfig) -> Self {
        let controller = GainController::new(table, config, &self.params);
        self.acquisition = self.acquisition.with_autogain(controller);
        self
    }

    /// One acquisition iteration followed by one WFS iteration
    pub fn frame(&mut self) -> (AcquisitionStep, Option<FrameSummary>) {
        let step = self.acquisition.step();
        let summary = self.wfs.step().unwrap();
        (step, summary)
    }
}
