//! Detector operating points for the autogain controller.
//!
//! Records are `EXP <gain> <exposure_ms>`, listed from the least sensitive
//! operating point (index 0) to the most sensitive.

use crate::error::{Result, ShwfsError};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// Maximum number of operating points read from an exposure file
pub const MAX_EXPOSURE_SETTINGS: usize = 100;

/// One detector operating point
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExposureSetting {
    pub gain: i64,
    pub exposure_ms: f32,
}

impl ExposureSetting {
    pub fn new(gain: i64, exposure_ms: f32) -> Self {
        Self { gain, exposure_ms }
    }
}

impl fmt::Display for ExposureSetting {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "gain {} / {} ms", self.gain, self.exposure_ms)
    }
}

/// Flux band the controller applies at a given operating point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Regime {
    /// Gain below the table maximum
    LowGain,
    /// Table maximum gain at the table minimum exposure
    Intermediate,
    /// Table maximum gain at a longer exposure
    HighGain,
}

/// Ordered operating points, never empty
#[derive(Debug, Clone)]
pub struct ExposureTable {
    settings: Vec<ExposureSetting>,
    max_gain: i64,
    min_exposure_ms: f32,
}

impl ExposureTable {
    /// Read and parse an exposure file; unreadable or empty files are fatal
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| ShwfsError::TableRead {
            kind: "exposure",
            path: path.to_path_buf(),
            source,
        })?;
        let table = Self::parse(&text)?;
        info!(
            "Loaded {} exposure settings from {}",
            table.len(),
            path.display()
        );
        Ok(table)
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut settings = Vec::new();
        let mut truncated = 0usize;

        for line in text.lines() {
            let Some(setting) = parse_record(line) else {
                continue;
            };
            if settings.len() == MAX_EXPOSURE_SETTINGS {
                truncated += 1;
                continue;
            }
            settings.push(setting);
        }

        if truncated > 0 {
            warn!("Exposure table exceeds {MAX_EXPOSURE_SETTINGS} records, ignored {truncated}");
        }
        Self::new(settings)
    }

    pub fn new(settings: Vec<ExposureSetting>) -> Result<Self> {
        let max_gain = settings
            .iter()
            .map(|s| s.gain)
            .max()
            .ok_or(ShwfsError::EmptyExposureTable)?;
        let min_exposure_ms = settings
            .iter()
            .map(|s| s.exposure_ms)
            .fold(f32::INFINITY, f32::min);

        Ok(Self {
            settings,
            max_gain,
            min_exposure_ms,
        })
    }

    pub fn len(&self) -> usize {
        self.settings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.settings.is_empty()
    }

    pub fn last_index(&self) -> usize {
        self.settings.len() - 1
    }

    /// Operating point at `index`, clamped to the table
    pub fn get(&self, index: usize) -> ExposureSetting {
        self.settings[index.min(self.last_index())]
    }

    pub fn settings(&self) -> &[ExposureSetting] {
        &self.settings
    }

    pub fn max_gain(&self) -> i64 {
        self.max_gain
    }

    pub fn min_exposure_ms(&self) -> f32 {
        self.min_exposure_ms
    }

    /// Regime of an applied (gain, exposure) pair
    pub fn classify(&self, gain: i64, exposure_ms: f32) -> Regime {
        if gain == self.max_gain && exposure_ms == self.min_exposure_ms {
            Regime::Intermediate
        } else if gain < self.max_gain {
            Regime::LowGain
        } else {
            Regime::HighGain
        }
    }
}

fn parse_record(line: &str) -> Option<ExposureSetting> {
    let mut tokens = line.split_whitespace();
    if tokens.next()? != "EXP" {
        return None;
    }
    let gain = tokens.next()?.parse::<i64>().ok()?;
    let exposure_ms = tokens.next()?.parse::<f32>().ok()?;
    if tokens.next().is_some() || !exposure_ms.is_finite() {
        return None;
    }
    Some(ExposureSetting::new(gain, exposure_ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three_point_table() -> ExposureTable {
        ExposureTable::new(vec![
            ExposureSetting::new(1, 10.0),
            ExposureSetting::new(5, 5.0),
            ExposureSetting::new(100, 1.0),
        ])
        .unwrap()
    }

    #[test]
    fn test_extremes() {
        let table = three_point_table();
        assert_eq!(table.max_gain(), 100);
        assert_eq!(table.min_exposure_ms(), 1.0);
        assert_eq!(table.last_index(), 2);
    }

    #[test]
    fn test_intermediate_regime_at_extremes() {
        let table = three_point_table();
        assert_eq!(table.classify(100, 1.0), Regime::Intermediate);
    }

    #[test]
    fn test_low_and_high_gain_regimes() {
        let table = three_point_table();
        assert_eq!(table.classify(5, 5.0), Regime::LowGain);
        assert_eq!(table.classify(1, 1.0), Regime::LowGain);
        assert_eq!(table.classify(100, 20.0), Regime::HighGain);
    }

    #[test]
    fn test_parse_skips_malformed() {
        let table = ExposureTable::parse(
            "# gain exposure\nEXP 1 10.0\nEXP x 2.0\nEXP 2\nSPOT 1 2 3 4\nEXP 4 2.5\n",
        )
        .unwrap();
        assert_eq!(
            table.settings(),
            &[ExposureSetting::new(1, 10.0), ExposureSetting::new(4, 2.5)]
        );
    }

    #[test]
    fn test_empty_table_is_error() {
        assert!(matches!(
            ExposureTable::parse("no records"),
            Err(ShwfsError::EmptyExposureTable)
        ));
    }

    #[test]
    fn test_get_clamps_index() {
        let table = three_point_table();
        assert_eq!(table.get(99), ExposureSetting::new(100, 1.0));
    }

    #[test]
    fn test_unreadable_file_is_fatal() {
        let err = ExposureTable::load(Path::new("/nonexistent/exposures.txt")).unwrap_err();
        assert!(matches!(err, ShwfsError::TableRead { kind: "exposure", .. }));
    }
}
