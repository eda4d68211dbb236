//! Subaperture geometry loaded from a `SPOT` record file.
//!
//! Each record is `SPOT <raw_x> <raw_y> <out_x> <out_y>`: the lower-left pixel
//! of the subaperture's 4x4 window in the corrected frame, and the cell it
//! occupies in the output slope/flux grids. Lines that are not a well-formed
//! record are skipped. Output cells must lie within a `MAX_SPOTS` square grid.

use crate::error::{Result, ShwfsError};
use log::{info, warn};
use shared::image_size::ImageSize;
use std::path::Path;

/// Maximum number of subapertures read from a spot file
pub const MAX_SPOTS: usize = 1000;

/// Edge length of the pixel window read for every subaperture
pub const WINDOW: usize = 4;

/// One subaperture
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpotDescriptor {
    /// Window origin column in the corrected frame
    pub raw_x: usize,
    /// Window origin row in the corrected frame
    pub raw_y: usize,
    /// Output grid column
    pub out_x: usize,
    /// Output grid row
    pub out_y: usize,
    /// Flat index of the x-slope in the (H, 2W) slope map
    pub slope_x_offset: usize,
    /// Flat index of the y-slope in the (H, 2W) slope map
    pub slope_y_offset: usize,
    /// Flat index in the (H, W) flux map
    pub flux_offset: usize,
}

/// Ordered subaperture list plus the output grid it spans
#[derive(Debug, Clone)]
pub struct SpotTable {
    spots: Vec<SpotDescriptor>,
    output_size: ImageSize,
}

impl SpotTable {
    /// Read and parse a spot file.
    ///
    /// A file that cannot be opened is fatal; there is no usable default.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| ShwfsError::TableRead {
            kind: "spot",
            path: path.to_path_buf(),
            source,
        })?;
        let table = Self::parse(&text)?;
        info!(
            "Loaded {} spots from {}, output grid {}",
            table.len(),
            path.display(),
            table.output_size
        );
        Ok(table)
    }

    /// Parse spot records from text, in file order
    pub fn parse(text: &str) -> Result<Self> {
        let mut coords = Vec::new();
        let mut truncated = 0usize;

        for line in text.lines() {
            let Some(record) = parse_record(line) else {
                continue;
            };
            if coords.len() == MAX_SPOTS {
                truncated += 1;
                continue;
            }
            coords.push(record);
        }

        if truncated > 0 {
            warn!("Spot table exceeds {MAX_SPOTS} records, ignored {truncated}");
        }
        if coords.is_empty() {
            return Err(ShwfsError::EmptySpotTable);
        }

        Self::from_coords(&coords)
    }

    /// Build a table from (raw_x, raw_y, out_x, out_y) tuples
    pub fn from_coords(coords: &[(usize, usize, usize, usize)]) -> Result<Self> {
        let outside = coords
            .iter()
            .position(|&(_, _, out_x, out_y)| out_x >= MAX_SPOTS || out_y >= MAX_SPOTS);
        if let Some(index) = outside {
            let (_, _, out_x, out_y) = coords[index];
            return Err(ShwfsError::SpotOutOfGrid {
                index,
                out_x,
                out_y,
                limit: MAX_SPOTS,
            });
        }

        let width = coords.iter().map(|c| c.2 + 1).max().unwrap_or(0);
        let height = coords.iter().map(|c| c.3 + 1).max().unwrap_or(0);

        let spots = coords
            .iter()
            .map(|&(raw_x, raw_y, out_x, out_y)| SpotDescriptor {
                raw_x,
                raw_y,
                out_x,
                out_y,
                slope_x_offset: out_y * (2 * width) + out_x,
                slope_y_offset: out_y * (2 * width) + out_x + width,
                flux_offset: out_y * width + out_x,
            })
            .collect();

        Ok(Self {
            spots,
            output_size: ImageSize::from_width_height(width, height),
        })
    }

    pub fn spots(&self) -> &[SpotDescriptor] {
        &self.spots
    }

    pub fn len(&self) -> usize {
        self.spots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spots.is_empty()
    }

    /// Output grid: tight bounding box of all output coordinates, plus one
    pub fn output_size(&self) -> ImageSize {
        self.output_size
    }

    /// Slope map shape (rows, cols): x-slopes then y-slopes on each row
    pub fn slope_shape(&self) -> (usize, usize) {
        (self.output_size.height, 2 * self.output_size.width)
    }

    /// Check every subaperture window lies inside a corrected frame
    pub fn validate_against(&self, frame: ImageSize) -> Result<()> {
        for (index, spot) in self.spots.iter().enumerate() {
            if !frame.contains_window(spot.raw_x, spot.raw_y, WINDOW, WINDOW) {
                return Err(ShwfsError::SpotOutOfFrame {
                    index,
                    x: spot.raw_x,
                    y: spot.raw_y,
                    frame: frame.to_string(),
                });
            }
        }
        Ok(())
    }
}

fn parse_record(line: &str) -> Option<(usize, usize, usize, usize)> {
    let mut tokens = line.split_whitespace();
    if tokens.next()? != "SPOT" {
        return None;
    }
    let mut next = || tokens.next()?.parse::<usize>().ok();
    let record = (next()?, next()?, next()?, next()?);
    match tokens.next() {
        Some(_) => None,
        None => Some(record),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_and_offsets() {
        let table = SpotTable::parse("SPOT 0 0 0 0\nSPOT 4 0 1 0\nSPOT 0 4 0 2\n").unwrap();
        assert_eq!(table.len(), 3);
        assert_eq!(table.output_size(), ImageSize::from_width_height(2, 3));
        assert_eq!(table.slope_shape(), (3, 4));

        let s = table.spots()[2];
        assert_eq!((s.raw_x, s.raw_y, s.out_x, s.out_y), (0, 4, 0, 2));
        assert_eq!(s.slope_x_offset, 2 * 4);
        assert_eq!(s.slope_y_offset, 2 * 4 + 2);
        assert_eq!(s.flux_offset, 2 * 2);
    }

    #[test]
    fn test_malformed_lines_skipped() {
        let text = "# spot file\n\
                    SPOT 1 2 3 4\n\
                    SPOT 1 2 3\n\
                    SPOT -1 2 3 4\n\
                    SPOT a b c d\n\
                    EXP 1 2.0\n\
                    SPOT 1 2 3 4 5\n\
                    \n\
                    SPOT 5 6 0 0\n";
        let table = SpotTable::parse(text).unwrap();
        assert_eq!(table.len(), 2);
        // Insertion order follows the file
        assert_eq!(table.spots()[0].raw_x, 1);
        assert_eq!(table.spots()[1].raw_x, 5);
    }

    #[test]
    fn test_capped_at_max_spots() {
        let text: String = (0..MAX_SPOTS + 5)
            .map(|i| format!("SPOT 0 0 {} 0\n", i))
            .collect();
        let table = SpotTable::parse(&text).unwrap();
        assert_eq!(table.len(), MAX_SPOTS);
        assert_eq!(table.output_size().width, MAX_SPOTS);
    }

    #[test]
    fn test_empty_table_rejected() {
        assert!(matches!(
            SpotTable::parse("nothing here\n"),
            Err(ShwfsError::EmptySpotTable)
        ));
    }

    #[test]
    fn test_output_cell_beyond_grid_rejected() {
        let err = SpotTable::parse("SPOT 0 0 0 0\nSPOT 0 0 18446744073709551615 0\n").unwrap_err();
        assert!(matches!(
            err,
            ShwfsError::SpotOutOfGrid {
                index: 1,
                out_x: usize::MAX,
                out_y: 0,
                limit: MAX_SPOTS,
            }
        ));

        let err = SpotTable::from_coords(&[(0, 0, 3, MAX_SPOTS)]).unwrap_err();
        assert!(matches!(err, ShwfsError::SpotOutOfGrid { index: 0, .. }));

        let edge = SpotTable::from_coords(&[(0, 0, MAX_SPOTS - 1, MAX_SPOTS - 1)]).unwrap();
        assert_eq!(edge.slope_shape(), (MAX_SPOTS, 2 * MAX_SPOTS));
    }

    #[test]
    fn test_missing_file_is_fatal() {
        let err = SpotTable::load(Path::new("/nonexistent/spots.txt")).unwrap_err();
        assert!(matches!(err, ShwfsError::TableRead { kind: "spot", .. }));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "SPOT 10 12 0 0").unwrap();
        writeln!(file, "SPOT 14 12 1 0").unwrap();
        let table = SpotTable::load(file.path()).unwrap();
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_window_validation() {
        let table = SpotTable::from_coords(&[(0, 0, 0, 0), (60, 60, 1, 1)]).unwrap();
        table
            .validate_against(ImageSize::from_width_height(64, 64))
            .unwrap();

        let err = table
            .validate_against(ImageSize::from_width_height(63, 64))
            .unwrap_err();
        assert!(matches!(err, ShwfsError::SpotOutOfFrame { index: 1, .. }));
    }
}
