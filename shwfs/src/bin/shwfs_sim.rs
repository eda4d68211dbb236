use anyhow::{Context, Result};
use clap::Parser;
use crossbeam_channel::{bounded, RecvTimeoutError};
use log::{debug, info, warn};
use shared::calibration_store::{CalibrationSource, CalibrationStore, InMemoryCalibration};
use shared::camera_interface::mock::MockCamera;
use shared::test_util::{add_spot, noisy_frame, CENTERED_SPOT};
use shwfs::centroid::FrameSummary;
use shwfs::smoothing::FrameStatistics;
use shwfs::{
    AcquisitionLoop, BiasModel, CentroidExtractor, DetectorParams, ExposureSetting, ExposureTable,
    GainController, RawLayout, ShwfsConfig, SpotTable, StopSignal, WfsLoop,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Command line arguments for the wavefront-sensor simulation
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Closed-loop Shack-Hartmann simulation on a mock detector",
    long_about = "Runs the acquisition and wavefront-sensor loops against a mock camera \
        that renders one spot per subaperture. Spot brightness scales with gain times \
        exposure, so the autogain controller can be watched walking the exposure table."
)]
struct Args {
    #[arg(long, help = "Spot table file (SPOT records)")]
    spots: PathBuf,

    #[arg(long, help = "Exposure table file (EXP records)")]
    exposures: PathBuf,

    #[arg(
        short,
        long,
        help = "JSON configuration file",
        long_help = "JSON configuration file. Missing sections and fields take their \
            defaults, so an empty object is a valid configuration."
    )]
    config: Option<PathBuf>,

    #[arg(
        long,
        help = "Calibration root directory",
        long_help = "Directory holding bias and flat maps named by the configured \
            templates. Without it every reload falls back to dynamic bias."
    )]
    calibration_dir: Option<PathBuf>,

    #[arg(short = 'n', long, default_value_t = 500, help = "Frames to process")]
    frames: usize,

    #[arg(long, help = "Start with autogain enabled regardless of the configuration")]
    autogain: bool,

    #[arg(
        long,
        default_value_t = 20.0,
        help = "Spot peak counts per ms at unit gain"
    )]
    spot_rate: f32,

    #[arg(long, default_value_t = 500.0, help = "Detector pedestal (counts)")]
    pedestal: f64,

    #[arg(long, default_value_t = 4.0, help = "Read noise sigma (counts)")]
    read_noise: f64,

    #[arg(long, default_value_t = 1, help = "Noise seed")]
    seed: u64,
}

/// Camera rendering a centered spot in every subaperture window
fn spot_camera(spots: &SpotTable, config: &ShwfsConfig, args: &Args) -> MockCamera {
    let size = config.detector.frame_size();
    let windows: Vec<(usize, usize)> = spots.spots().iter().map(|s| (s.raw_x, s.raw_y)).collect();
    let (rate, pedestal, read_noise, seed) =
        (args.spot_rate, args.pedestal, args.read_noise, args.seed);

    MockCamera::new(
        "shwfs-sim",
        Box::new(move |gain, exposure_ms, frame_number| {
            thread::sleep(Duration::from_secs_f32(exposure_ms.max(0.0) / 1000.0));
            let mut frame = noisy_frame(
                size.height,
                size.width,
                pedestal,
                read_noise,
                seed.wrapping_add(frame_number),
            );
            let peak = rate * gain as f32 * exposure_ms;
            for &(x, y) in &windows {
                add_spot(&mut frame, x, y, peak, &CENTERED_SPOT);
            }
            frame
        }),
    )
}

fn load_config(args: &Args) -> Result<ShwfsConfig> {
    let mut config = match &args.config {
        Some(path) => ShwfsConfig::load(path)
            .with_context(|| format!("Failed to load configuration {}", path.display()))?,
        None => ShwfsConfig::default(),
    };
    if args.autogain {
        config.autogain.enabled = true;
    }
    if config.bias.layout != RawLayout::default() {
        anyhow::bail!("The simulated camera renders corrected geometry; use the identity layout");
    }
    Ok(config)
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();
    let config = load_config(&args)?;

    let spots = SpotTable::load(&args.spots)?;
    let exposures = ExposureTable::load(&args.exposures)?;
    let frame_size = config.detector.frame_size();

    let calibration: Arc<dyn CalibrationSource> = match &args.calibration_dir {
        Some(dir) => Arc::new(CalibrationStore::with_path(dir)),
        None => Arc::new(InMemoryCalibration::new()),
    };

    let statistics = FrameStatistics::new(config.centroid.averaging);
    let flux = statistics.max_flux.param().clone();
    let camera = spot_camera(&spots, &config, &args);
    let extractor =
        CentroidExtractor::new(spots, frame_size, &config.centroid)?.with_statistics(statistics);

    let params = DetectorParams::new(
        ExposureSetting::new(
            config.detector.initial_gain,
            config.detector.initial_exposure_ms,
        ),
        config.autogain.enabled,
    );
    let controller = GainController::new(exposures, &config.autogain, &params);
    let bias = BiasModel::new(frame_size, &config.bias)?;

    let mut acquisition = AcquisitionLoop::new(camera, bias, calibration, params.clone(), flux)
        .with_autogain(controller);
    let mut wfs = WfsLoop::new(extractor, acquisition.corrected_stream().clone());

    let stop = StopSignal::new();
    let (summary_tx, summary_rx) = bounded::<FrameSummary>(16);

    let acq_stop = stop.clone();
    let acq_handle = thread::spawn(move || acquisition.run(&acq_stop));

    let wfs_stop = stop.clone();
    let wfs_handle = thread::spawn(move || {
        wfs.run(&wfs_stop, |summary| {
            if summary_tx.try_send(*summary).is_err() {
                debug!("Reporter behind, dropping summary");
            }
        })
    });

    let mut received = 0usize;
    let mut last = None;
    while received < args.frames {
        match summary_rx.recv_timeout(Duration::from_secs(2)) {
            Ok(summary) => {
                received += 1;
                if received % 100 == 0 {
                    info!(
                        "Frame {received}: {} active, max flux {:.0}, residual {:.4}, at {}",
                        summary.active_spots,
                        summary.smoothed.max_flux,
                        summary.smoothed.rms_residual,
                        params.current()
                    );
                }
                last = Some(summary);
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!("No frames for 2 s, stopping");
                break;
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    stop.stop();

    let published = acq_handle
        .join()
        .map_err(|_| anyhow::anyhow!("Acquisition thread panicked"))??;
    let processed = wfs_handle
        .join()
        .map_err(|_| anyhow::anyhow!("WFS thread panicked"))??;

    info!("Published {published} frames, processed {processed}");
    match last {
        Some(summary) => info!(
            "Final: {} active spots, smoothed {:?}, operating point {}",
            summary.active_spots,
            summary.smoothed,
            params.current()
        ),
        None => warn!("No frames were processed"),
    }
    Ok(())
}
