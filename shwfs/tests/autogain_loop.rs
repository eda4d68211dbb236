//! Autogain driving a mock detector through both loops

mod common;

use common::*;
use shared::camera_interface::mock::{MockCamera, MockFailure};
use shared::test_util::CENTERED_SPOT;
use shwfs::config::AutogainConfig;
use shwfs::{
    AutogainBands, CentroidAlgorithm, ControllerState, ExposureSetting, ExposureTable, FluxBand,
};

/// Centered spot flux is 4.8 * peak
const RATE: f32 = 100.0;

fn table() -> ExposureTable {
    ExposureTable::new(vec![
        ExposureSetting::new(1, 5.0),
        ExposureSetting::new(2, 5.0),
        ExposureSetting::new(4, 5.0),
    ])
    .unwrap()
}

fn autogain_config() -> AutogainConfig {
    AutogainConfig {
        enabled: true,
        // 4 frames at 5 ms
        wait_time_ms: 20.0,
        readout_time_ms: 1.0,
        bands: AutogainBands {
            low_gain: FluxBand::new(4000.0, 8000.0),
            intermediate: FluxBand::new(9000.0, 10000.0),
            high_gain: FluxBand::new(4000.0, 8000.0),
        },
    }
}

fn rig(autogain_on: bool) -> Rig {
    init_logging();
    let camera = scaling_camera(&quad_spots(), RATE);
    let mut rig = Rig::new(
        camera,
        ExposureSetting::new(1, 5.0),
        autogain_on,
        &unsmoothed(CentroidAlgorithm::CenterOfMass),
    )
    .with_autogain(table(), &autogain_config());
    rig.acquisition.start().unwrap();
    rig
}

/// Run `frames` iterations, returning (iteration, request) for every request
fn run(rig: &mut Rig, frames: usize) -> Vec<(usize, ExposureSetting)> {
    (1..=frames)
        .filter_map(|i| rig.frame().0.autogain_request.map(|r| (i, r)))
        .collect()
}

#[test]
fn low_flux_steps_once_and_settles() {
    let mut rig = rig(true);

    // Index 0 flux 2400 is below the band, index 1 flux 4800 is inside it
    let requests = run(&mut rig, 40);
    assert_eq!(
        requests,
        vec![
            (1, ExposureSetting::new(1, 5.0)),
            (5, ExposureSetting::new(2, 5.0)),
        ]
    );

    assert_eq!(rig.acquisition.camera().gain(), 2);
    let state = rig.acquisition.autogain().unwrap().state();
    assert_eq!(state.index, 1);
    assert_eq!(state.state, ControllerState::Evaluating);
    assert!(rig.params.autogain_on.value());
}

#[test]
fn stale_low_flux_inside_window_is_ignored() {
    let mut rig = rig(true);
    run(&mut rig, 5);

    // Next three flux values fall inside the debounce window, the first
    // still measured at the old gain
    let requests = run(&mut rig, 3);
    assert!(requests.is_empty());
    assert_eq!(
        rig.acquisition.autogain().unwrap().state().state,
        ControllerState::Armed
    );
}

#[test]
fn brightening_scene_steps_back_once() {
    init_logging();
    let spots = quad_spots();
    // Scene gets three times brighter from the 21st frame on
    let camera = MockCamera::new(
        "brightening",
        Box::new(move |gain, exposure_ms, frame_number| {
            let rate = if frame_number >= 20 { 3.0 * RATE } else { RATE };
            spot_frame(&spots, rate * gain as f32 * exposure_ms, &CENTERED_SPOT)
        }),
    );
    let mut rig = Rig::new(
        camera,
        ExposureSetting::new(1, 5.0),
        true,
        &unsmoothed(CentroidAlgorithm::CenterOfMass),
    )
    .with_autogain(table(), &autogain_config());
    rig.acquisition.start().unwrap();

    // Flux 14400 at index 1 is above the band; 7200 at index 0 is inside it.
    // Frame 22 was still taken at index 1; its flux lands inside the window.
    let requests = run(&mut rig, 40);
    assert_eq!(
        requests,
        vec![
            (1, ExposureSetting::new(1, 5.0)),
            (5, ExposureSetting::new(2, 5.0)),
            (22, ExposureSetting::new(1, 5.0)),
        ]
    );
    assert_eq!(rig.acquisition.camera().gain(), 1);
}

#[test]
fn disabled_autogain_never_requests() {
    let mut rig = rig(false);
    assert!(run(&mut rig, 30).is_empty());
    assert_eq!(rig.acquisition.camera().gain(), 1);
}

#[test]
fn operator_change_disables_autogain() {
    let mut rig = rig(true);
    run(&mut rig, 3);

    rig.params.gain.publish(3);
    let (step, _) = rig.frame();
    assert!(step.changes.autogain_released);
    assert!(!rig.params.autogain_on.value());
    assert_eq!(rig.acquisition.camera().gain(), 3);

    assert!(run(&mut rig, 30).is_empty());
    assert_eq!(rig.acquisition.camera().gain(), 3);
    assert_eq!(
        rig.acquisition.autogain().unwrap().state().state,
        ControllerState::Idle
    );

    // Re-enabling restarts from the least sensitive setting
    rig.params.set_autogain(true);
    let requests = run(&mut rig, 1);
    assert_eq!(requests, vec![(1, ExposureSetting::new(1, 5.0))]);
}

#[test]
fn camera_failures_are_survived() {
    let mut rig = rig(true);
    rig.acquisition
        .camera_mut()
        .inject_failures(MockFailure::ReadFrame, 3);

    for _ in 0..3 {
        let (step, summary) = rig.frame();
        assert_eq!(step.frame_counter, None);
        assert!(summary.is_none());
    }

    let (step, summary) = rig.frame();
    assert_eq!(step.frame_counter, Some(1));
    assert_eq!(summary.unwrap().active_spots, 4);
}
