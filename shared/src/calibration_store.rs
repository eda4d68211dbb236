//! Calibration frame storage for detector bias and flat-field maps.
//!
//! Frames are addressed by a relative name produced from a filename template
//! (see [`format_template`]) and resolved against a root directory. Plain
//! text matrices are always supported; FITS images are read when the `fits`
//! feature is enabled.

use ndarray::Array2;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors that can occur while loading a calibration frame
#[derive(Error, Debug)]
pub enum CalibrationError {
    #[error("Calibration file not found: {0}")]
    NotFound(PathBuf),
    #[error("Unsupported calibration format: {0}")]
    Unsupported(PathBuf),
    #[error("Failed to parse {path}: {reason}")]
    Parse { path: PathBuf, reason: String },
    #[error("Calibration I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Unknown template field '{0}'")]
    UnknownField(String),
}

/// Anything that can hand out a calibration frame by name
pub trait CalibrationSource: Send + Sync {
    /// Load the frame stored under `name`
    fn load_frame(&self, name: &str) -> Result<Array2<f32>, CalibrationError>;
}

/// Directory-backed calibration store.
#[derive(Debug, Clone)]
pub struct CalibrationStore {
    /// Root directory all calibration names are relative to
    root_path: PathBuf,
}

impl CalibrationStore {
    /// Create a store rooted at `root_path`
    pub fn with_path(root_path: impl Into<PathBuf>) -> Self {
        Self {
            root_path: root_path.into(),
        }
    }

    /// Get the root calibration path
    pub fn root_path(&self) -> &Path {
        &self.root_path
    }

    /// Full path for a calibration name
    pub fn resolve(&self, name: &str) -> PathBuf {
        self.root_path.join(name)
    }

    /// Write a frame as a text matrix under `name`, creating directories.
    ///
    /// Returns the path where the frame was saved.
    pub fn save_text_frame(&self, name: &str, frame: &Array2<f32>) -> std::io::Result<PathBuf> {
        let path = self.resolve(name);
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }

        let mut content = String::new();
        for row in frame.rows() {
            let line: Vec<String> = row.iter().map(|v| v.to_string()).collect();
            content.push_str(&line.join(" "));
            content.push('\n');
        }
        std::fs::write(&path, content)?;
        Ok(path)
    }

    fn read_text_frame(path: &Path) -> Result<Array2<f32>, CalibrationError> {
        let content = std::fs::read_to_string(path)?;
        let parse_err = |reason: String| CalibrationError::Parse {
            path: path.to_path_buf(),
            reason,
        };

        let mut values = Vec::new();
        let mut width = None;
        let mut height = 0;

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let row: Vec<f32> = line
                .split_whitespace()
                .map(|tok| tok.parse::<f32>())
                .collect::<Result<_, _>>()
                .map_err(|e| parse_err(format!("row {height}: {e}")))?;

            match width {
                None => width = Some(row.len()),
                Some(w) if w != row.len() => {
                    return Err(parse_err(format!(
                        "row {height} has {} values, expected {w}",
                        row.len()
                    )));
                }
                Some(_) => {}
            }
            values.extend(row);
            height += 1;
        }

        let width = width.ok_or_else(|| parse_err("no pixel rows".to_string()))?;
        Array2::from_shape_vec((height, width), values).map_err(|e| parse_err(e.to_string()))
    }

    #[cfg(feature = "fits")]
    fn read_fits_frame(path: &Path) -> Result<Array2<f32>, CalibrationError> {
        use fitsio::compat::fitsfile::FitsFile;
        use fitsio::compat::images::ReadImage;

        let parse_err = |reason: String| CalibrationError::Parse {
            path: path.to_path_buf(),
            reason,
        };

        let fptr = FitsFile::open(path).map_err(|e| parse_err(e.to_string()))?;
        let hdu = fptr.hdu(0).map_err(|e| parse_err(e.to_string()))?;
        let data = f32::read_image(&fptr, &hdu).map_err(|e| parse_err(e.to_string()))?;
        let naxis1 = hdu
            .read_key::<i64>(&fptr, "NAXIS1")
            .map_err(|e| parse_err(e.to_string()))? as usize;
        let naxis2 = hdu
            .read_key::<i64>(&fptr, "NAXIS2")
            .map_err(|e| parse_err(e.to_string()))? as usize;

        Array2::from_shape_vec((naxis2, naxis1), data).map_err(|e| parse_err(e.to_string()))
    }
}

impl CalibrationSource for CalibrationStore {
    fn load_frame(&self, name: &str) -> Result<Array2<f32>, CalibrationError> {
        let path = self.resolve(name);
        if !path.exists() {
            return Err(CalibrationError::NotFound(path));
        }
        log::debug!("Loading calibration frame {}", path.display());

        match path.extension().and_then(|s| s.to_str()) {
            #[cfg(feature = "fits")]
            Some("fits") | Some("fit") => Self::read_fits_frame(&path),
            #[cfg(not(feature = "fits"))]
            Some("fits") | Some("fit") => Err(CalibrationError::Unsupported(path)),
            _ => Self::read_text_frame(&path),
        }
    }
}

/// Calibration frames held in memory, keyed by name
#[derive(Debug, Clone, Default)]
pub struct InMemoryCalibration {
    frames: HashMap<String, Array2<f32>>,
}

impl InMemoryCalibration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, frame: Array2<f32>) {
        self.frames.insert(name.into(), frame);
    }

    pub fn with_frame(mut self, name: impl Into<String>, frame: Array2<f32>) -> Self {
        self.insert(name, frame);
        self
    }
}

impl CalibrationSource for InMemoryCalibration {
    fn load_frame(&self, name: &str) -> Result<Array2<f32>, CalibrationError> {
        self.frames
            .get(name)
            .cloned()
            .ok_or_else(|| CalibrationError::NotFound(PathBuf::from(name)))
    }
}

/// Interpolate named integer fields into a filename template.
///
/// Placeholders look like `{gain}` or `{gain:04}` (zero padded to a width of
/// four). Negative values keep their sign in front of the padding, so
/// `{temperature:02}` with -60 yields `-60`.
///
/// # Example
/// ```
/// use shared::calibration_store::format_template;
///
/// let name = format_template(
///     "bias/bias_{temperature:02}C_{gain:04}g.fits",
///     &[("temperature", -60), ("gain", 12)],
/// )
/// .unwrap();
/// assert_eq!(name, "bias/bias_-60C_0012g.fits");
/// ```
pub fn format_template(template: &str, fields: &[(&str, i64)]) -> Result<String, CalibrationError> {
    let mut out = String::with_capacity(template.len() + 16);
    let mut rest = template;

    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        let end = after
            .find('}')
            .ok_or_else(|| CalibrationError::UnknownField(after.to_string()))?;
        let placeholder = &after[..end];

        let (field, width) = match placeholder.split_once(':') {
            Some((field, width)) => {
                let width = width
                    .parse::<usize>()
                    .map_err(|_| CalibrationError::UnknownField(placeholder.to_string()))?;
                (field, width)
            }
            None => (placeholder, 0),
        };

        let value = fields
            .iter()
            .find(|(name, _)| *name == field)
            .map(|(_, v)| *v)
            .ok_or_else(|| CalibrationError::UnknownField(field.to_string()))?;

        out.push_str(&format!("{value:0width$}"));
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}
