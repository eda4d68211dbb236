//! Bias subtraction and flat-fielding of raw detector frames.
//!
//! The corrected pixel is `(raw - bias) * flat`. The bias is either the static
//! calibration map loaded for the current operating point, or a per-frame
//! estimate from four square regions at the frame corners (a single mean, or
//! a bilinear surface through the region centers).

use crate::config::BiasConfig;
use crate::error::{Result, ShwfsError};
use log::{debug, info, warn};
use ndarray::{s, Array2};
use serde::{Deserialize, Serialize};
use shared::calibration_store::{format_template, CalibrationSource};
use shared::image_size::ImageSize;

/// Per-frame bias estimator used when dynamic bias is on
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DynamicBiasMode {
    /// Mean of the four corner regions, applied uniformly
    #[default]
    Average,
    /// Bilinear surface through the four corner-region centers
    Bilinear,
}

/// Where corrected-frame pixel (x, y) sits in the raw readout buffer.
///
/// Raw row is `y + row_offset`; raw column is `col_offset + col_stride * x`,
/// or `col_offset + col_stride * (width - x)` when mirrored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawLayout {
    pub row_offset: usize,
    pub col_offset: usize,
    pub col_stride: usize,
    pub mirror_x: bool,
}

impl Default for RawLayout {
    fn default() -> Self {
        Self {
            row_offset: 0,
            col_offset: 0,
            col_stride: 1,
            mirror_x: false,
        }
    }
}

impl RawLayout {
    /// Layout of the frame-grabber readout: 4 overscan rows, every eighth
    /// column, mirrored horizontally
    pub fn frame_grabber() -> Self {
        Self {
            row_offset: 4,
            col_offset: 0,
            col_stride: 8,
            mirror_x: true,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.col_stride == 0 {
            return Err(ShwfsError::InvalidConfig(
                "raw layout column stride must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    fn raw_col(&self, x: usize, width: usize) -> usize {
        let x = if self.mirror_x { width - x } else { x };
        self.col_offset + self.col_stride * x
    }

    /// Smallest raw buffer that covers a corrected frame of `frame`
    pub fn required_raw_size(&self, frame: ImageSize) -> ImageSize {
        let last_col = if self.mirror_x {
            self.raw_col(0, frame.width)
        } else {
            self.raw_col(frame.width.saturating_sub(1), frame.width)
        };
        ImageSize::from_width_height(last_col + 1, frame.height + self.row_offset)
    }

    fn is_identity(&self) -> bool {
        *self == Self::default()
    }
}

/// Fields interpolated into the calibration file-name templates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CalibrationKey {
    pub temperature: i64,
    pub readout_mode: i64,
    pub binning: i64,
    pub gain: i64,
}

impl CalibrationKey {
    fn fields(&self) -> [(&'static str, i64); 4] {
        [
            ("temperature", self.temperature),
            ("readout_mode", self.readout_mode),
            ("binning", self.binning),
            ("gain", self.gain),
        ]
    }
}

/// `a00 + a10*y + a01*x + a11*x*y`, x = column, y = row
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BilinearSurface {
    pub a00: f32,
    pub a10: f32,
    pub a01: f32,
    pub a11: f32,
}

impl BilinearSurface {
    /// Closed-form fit through `[b00, b01, b10, b11]` sampled at columns
    /// x0/x1 and rows y0/y1 (first index = row, second = column)
    pub fn fit(corners: [f32; 4], x0: f32, x1: f32, y0: f32, y1: f32) -> Self {
        let [b00, b01, b10, b11] = corners;
        let dx = x1 - x0;
        let dy = y1 - y0;

        let a11 = (b00 - b01 - b10 + b11) / (dx * dy);
        let a01 = (b01 - b00) / dx - a11 * y0;
        let a10 = (b10 - b00) / dy - a11 * x0;
        let a00 = b00 - a01 * x0 - a10 * y0 - a11 * x0 * y0;

        Self { a00, a10, a01, a11 }
    }

    pub fn at(&self, x: f32, y: f32) -> f32 {
        self.a00 + self.a10 * y + self.a01 * x + self.a11 * x * y
    }
}

/// Bias estimated from one frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BiasEstimate {
    Uniform(f32),
    Surface(BilinearSurface),
}

/// Result of reloading the static calibration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReloadOutcome {
    pub bias_loaded: bool,
    pub flat_loaded: bool,
    /// Dynamic bias state after the reload
    pub dynamic_enabled: bool,
}

pub struct BiasModel {
    size: ImageSize,
    layout: RawLayout,
    bias: Array2<f32>,
    flat: Array2<f32>,
    dynamic_enabled: bool,
    force_dynamic: bool,
    mode: DynamicBiasMode,
    region: usize,
    bias_template: String,
    flat_template: String,
    temperature: i64,
    readout_mode: i64,
    binning: i64,
}

impl BiasModel {
    /// Neutral model (zero bias, unit flat) for corrected frames of `size`
    pub fn new(size: ImageSize, config: &BiasConfig) -> Result<Self> {
        config.layout.validate()?;
        let region = config.region_size;
        if region == 0 || size.width < 2 * region || size.height < 2 * region {
            return Err(ShwfsError::InvalidConfig(format!(
                "frame {size} cannot hold four {region} px bias regions"
            )));
        }

        Ok(Self {
            size,
            layout: config.layout,
            bias: size.zeros_f32(),
            flat: size.filled_f32(1.0),
            dynamic_enabled: config.force_dynamic,
            force_dynamic: config.force_dynamic,
            mode: config.dynamic_mode,
            region,
            bias_template: config.bias_template.clone(),
            flat_template: config.flat_template.clone(),
            temperature: config.temperature,
            readout_mode: config.readout_mode,
            binning: config.binning,
        })
    }

    pub fn size(&self) -> ImageSize {
        self.size
    }

    pub fn bias_map(&self) -> &Array2<f32> {
        &self.bias
    }

    pub fn flat_map(&self) -> &Array2<f32> {
        &self.flat
    }

    pub fn dynamic_enabled(&self) -> bool {
        self.dynamic_enabled
    }

    pub fn mode(&self) -> DynamicBiasMode {
        self.mode
    }

    pub fn calibration_key(&self, gain: i64) -> CalibrationKey {
        CalibrationKey {
            temperature: self.temperature,
            readout_mode: self.readout_mode,
            binning: self.binning,
            gain,
        }
    }

    /// Replace the static bias and flat maps for a new gain.
    ///
    /// Never fails: a map that cannot be loaded is reset to its neutral value
    /// with a warning. A failed bias load switches dynamic bias on; a
    /// successful one switches it off unless the configuration forces it.
    pub fn reload(&mut self, source: &dyn CalibrationSource, gain: i64) -> ReloadOutcome {
        let key = self.calibration_key(gain);

        let bias = self.load_map(source, &self.bias_template, &key, "bias");
        let bias_loaded = bias.is_some();
        self.bias = bias.unwrap_or_else(|| self.size.zeros_f32());

        let flat = self.load_map(source, &self.flat_template, &key, "flat");
        let flat_loaded = flat.is_some();
        self.flat = flat.unwrap_or_else(|| self.size.filled_f32(1.0));

        let was_dynamic = self.dynamic_enabled;
        self.dynamic_enabled = !bias_loaded || self.force_dynamic;
        if self.dynamic_enabled != was_dynamic {
            info!(
                "Dynamic bias {}",
                if self.dynamic_enabled { "enabled" } else { "disabled" }
            );
        }

        ReloadOutcome {
            bias_loaded,
            flat_loaded,
            dynamic_enabled: self.dynamic_enabled,
        }
    }

    fn load_map(
        &self,
        source: &dyn CalibrationSource,
        template: &str,
        key: &CalibrationKey,
        what: &str,
    ) -> Option<Array2<f32>> {
        let name = match format_template(template, &key.fields()) {
            Ok(name) => name,
            Err(e) => {
                warn!("Bad {what} template '{template}': {e}");
                return None;
            }
        };

        match source.load_frame(&name) {
            Ok(map) if map.dim() == self.size.shape() => {
                info!("Loaded {what} {name}");
                Some(map)
            }
            Ok(map) => {
                warn!(
                    "Wrong size for {what} {name}: {} instead of {}, using neutral {what}",
                    ImageSize::of(&map),
                    self.size
                );
                None
            }
            Err(e) => {
                warn!("Cannot load {what} {name}: {e}, using neutral {what}");
                None
            }
        }
    }

    /// Mean raw value of the four corner regions `[b00, b01, b10, b11]`
    pub fn corner_means(&self, frame: &Array2<f32>) -> [f32; 4] {
        let r = self.region;
        let (h, w) = frame.dim();
        let n = (r * r) as f32;
        let mean = |y: usize, x: usize| frame.slice(s![y..y + r, x..x + r]).sum() / n;
        [mean(0, 0), mean(0, w - r), mean(h - r, 0), mean(h - r, w - r)]
    }

    /// Estimate the bias of a frame (in corrected-frame geometry) from its corners
    pub fn estimate(&self, frame: &Array2<f32>) -> BiasEstimate {
        let corners = self.corner_means(frame);
        match self.mode {
            DynamicBiasMode::Average => BiasEstimate::Uniform(corners.iter().sum::<f32>() / 4.0),
            DynamicBiasMode::Bilinear => {
                let (h, w) = frame.dim();
                let half = (self.region as f32 - 1.0) / 2.0;
                let x0 = half;
                let y0 = half;
                let x1 = (w - self.region) as f32 + half;
                let y1 = (h - self.region) as f32 + half;
                BiasEstimate::Surface(BilinearSurface::fit(corners, x0, x1, y0, y1))
            }
        }
    }

    /// Copy raw pixels into `out` following the readout layout
    pub fn remap(&self, raw: &Array2<u16>, out: &mut Array2<f32>) -> Result<()> {
        if out.dim() != self.size.shape() {
            return Err(ShwfsError::FrameSizeMismatch {
                expected: self.size.to_string(),
                actual: ImageSize::of(out).to_string(),
            });
        }

        let required = self.layout.required_raw_size(self.size);
        let actual = ImageSize::of(raw);
        if actual.width < required.width || actual.height < required.height {
            return Err(ShwfsError::RawFrameTooSmall {
                actual: actual.to_string(),
                required: required.to_string(),
            });
        }

        if self.layout.is_identity() {
            let view = raw.slice(s![..self.size.height, ..self.size.width]);
            out.zip_mut_with(&view, |o, &r| *o = r as f32);
            return Ok(());
        }

        let width = self.size.width;
        for ((y, x), o) in out.indexed_iter_mut() {
            *o = raw[[y + self.layout.row_offset, self.layout.raw_col(x, width)]] as f32;
        }
        Ok(())
    }

    /// Produce the corrected frame in `out`.
    ///
    /// Returns the dynamic estimate used, or `None` when the static map was.
    pub fn correct_into(
        &self,
        raw: &Array2<u16>,
        out: &mut Array2<f32>,
    ) -> Result<Option<BiasEstimate>> {
        self.remap(raw, out)?;

        if !self.dynamic_enabled {
            ndarray::Zip::from(&mut *out)
                .and(&self.bias)
                .and(&self.flat)
                .for_each(|o, &b, &f| *o = (*o - b) * f);
            return Ok(None);
        }

        let estimate = self.estimate(out);
        match estimate {
            BiasEstimate::Uniform(b) => {
                ndarray::Zip::from(&mut *out)
                    .and(&self.flat)
                    .for_each(|o, &f| *o = (*o - b) * f);
            }
            BiasEstimate::Surface(surface) => {
                ndarray::Zip::indexed(&mut *out)
                    .and(&self.flat)
                    .for_each(|(y, x), o, &f| *o = (*o - surface.at(x as f32, y as f32)) * f);
            }
        }
        debug!("Dynamic bias estimate {estimate:?}");
        Ok(Some(estimate))
    }

    /// Allocate and return the corrected frame
    pub fn correct(&self, raw: &Array2<u16>) -> Result<Array2<f32>> {
        let mut out = self.size.zeros_f32();
        self.correct_into(raw, &mut out)?;
        Ok(out)
    }
}
