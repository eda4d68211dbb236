//! Synthetic detector frames for tests and the simulator

use ndarray::Array2;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};

/// Frame with every pixel set to `level`
pub fn uniform_frame(height: usize, width: usize, level: u16) -> Array2<u16> {
    Array2::from_elem((height, width), level)
}

/// Add a 4x4 spot whose lower-left pixel is at (`x`, `y`).
///
/// `weights` is indexed [row][col] relative to the window origin and scaled by
/// `peak`; values saturate at `u16::MAX`.
pub fn add_spot(frame: &mut Array2<u16>, x: usize, y: usize, peak: f32, weights: &[[f32; 4]; 4]) {
    for (r, row) in weights.iter().enumerate() {
        for (c, w) in row.iter().enumerate() {
            let px = &mut frame[[y + r, x + c]];
            let value = *px as f32 + peak * w;
            *px = value.clamp(0.0, u16::MAX as f32) as u16;
        }
    }
}

/// Centered spot: four central pixels lit, symmetric wings
pub const CENTERED_SPOT: [[f32; 4]; 4] = [
    [0.0, 0.1, 0.1, 0.0],
    [0.1, 1.0, 1.0, 0.1],
    [0.1, 1.0, 1.0, 0.1],
    [0.0, 0.1, 0.1, 0.0],
];

/// Pedestal with seeded Gaussian read noise, clipped to the u16 range
pub fn noisy_frame(
    height: usize,
    width: usize,
    pedestal: f64,
    read_noise: f64,
    seed: u64,
) -> Array2<u16> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    match Normal::new(pedestal, read_noise) {
        Ok(dist) => Array2::from_shape_fn((height, width), |_| {
            dist.sample(&mut rng).clamp(0.0, u16::MAX as f64) as u16
        }),
        // Degenerate noise parameters: plain pedestal
        Err(_) => uniform_frame(height, width, pedestal.clamp(0.0, u16::MAX as f64) as u16),
    }
}

/// Frame whose pixel value follows `a00 + a10*y + a01*x + a11*x*y`
pub fn bilinear_frame(
    height: usize,
    width: usize,
    a00: f32,
    a10: f32,
    a01: f32,
    a11: f32,
) -> Array2<u16> {
    Array2::from_shape_fn((height, width), |(y, x)| {
        let (x, y) = (x as f32, y as f32);
        let value = a00 + a10 * y + a01 * x + a11 * x * y;
        value.round().clamp(0.0, u16::MAX as f32) as u16
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_noisy_frame_is_reproducible() {
        let a = noisy_frame(16, 16, 500.0, 5.0, 7);
        let b = noisy_frame(16, 16, 500.0, 5.0, 7);
        assert_eq!(a, b);

        let mean = a.iter().map(|&v| v as f64).sum::<f64>() / a.len() as f64;
        assert!((mean - 500.0).abs() < 3.0);
    }

    #[test]
    fn test_add_spot_saturates() {
        let mut frame = uniform_frame(8, 8, 65000);
        add_spot(&mut frame, 2, 2, 10_000.0, &CENTERED_SPOT);
        assert_eq!(frame[[3, 3]], u16::MAX);
        assert_eq!(frame[[2, 2]], 65000);
    }

    #[test]
    fn test_bilinear_frame_corners() {
        let frame = bilinear_frame(10, 20, 100.0, 2.0, 1.0, 0.5);
        assert_eq!(frame[[0, 0]], 100);
        assert_eq!(frame[[9, 0]], 118);
        assert_eq!(frame[[0, 19]], 119);
        assert_eq!(frame[[9, 19]], 100 + 18 + 19 + 86);
    }
}
