//! 64-bit perceptual hash (pHash) and Hamming distance.
//!
//! The image is reduced to 32×32 grayscale, transformed with a 2-D DCT-II,
//! and the 8×8 low-frequency block is thresholded against its median. Bits
//! are packed row-major, most significant bit first, so visually similar
//! images land within a small Hamming distance of each other.

use image::DynamicImage;
use image::imageops::FilterType;

const INPUT_SIZE: usize = 32;
const BLOCK_SIZE: usize = 8;

/// Bit width of the hash; a constant of the algorithm.
pub const HASH_BITS: u32 = 64;

/// Compute the 64-bit perceptual hash of an image.
pub fn phash64(image: &DynamicImage) -> u64 {
    let gray = image
        .resize_exact(INPUT_SIZE as u32, INPUT_SIZE as u32, FilterType::Lanczos3)
        .to_luma8();

    let mut pixels = [[0f64; INPUT_SIZE]; INPUT_SIZE];
    for (x, y, pixel) in gray.enumerate_pixels() {
        pixels[y as usize][x as usize] = f64::from(pixel.0[0]);
    }

    let transformed = dct2d(&pixels);

    let mut block = [0f64; BLOCK_SIZE * BLOCK_SIZE];
    for row in 0..BLOCK_SIZE {
        for col in 0..BLOCK_SIZE {
            block[row * BLOCK_SIZE + col] = transformed[row][col];
        }
    }

    let median = median_of(&block);
    let mut bits = 0u64;
    for value in block {
        bits = (bits << 1) | u64::from(value > median);
    }
    bits
}

/// Number of differing bits between two hashes.
pub fn hamming_distance(a: u64, b: u64) -> u32 {
    (a ^ b).count_ones()
}

/// Separable 2-D DCT-II with orthonormal scaling.
fn dct2d(input: &[[f64; INPUT_SIZE]; INPUT_SIZE]) -> [[f64; INPUT_SIZE]; INPUT_SIZE] {
    let mut rows = [[0f64; INPUT_SIZE]; INPUT_SIZE];
    for (i, row) in input.iter().enumerate() {
        rows[i] = dct1d(row);
    }

    let mut output = [[0f64; INPUT_SIZE]; INPUT_SIZE];
    for col in 0..INPUT_SIZE {
        let mut column = [0f64; INPUT_SIZE];
        for row in 0..INPUT_SIZE {
            column[row] = rows[row][col];
        }
        let transformed = dct1d(&column);
        for row in 0..INPUT_SIZE {
            output[row][col] = transformed[row];
        }
    }
    output
}

fn dct1d(input: &[f64; INPUT_SIZE]) -> [f64; INPUT_SIZE] {
    let n = INPUT_SIZE as f64;
    let mut output = [0f64; INPUT_SIZE];
    for (k, out) in output.iter_mut().enumerate() {
        let mut sum = 0f64;
        for (i, value) in input.iter().enumerate() {
            let angle = std::f64::consts::PI / n * (i as f64 + 0.5) * k as f64;
            sum += value * angle.cos();
        }
        let scale = if k == 0 {
            (1.0 / n).sqrt()
        } else {
            (2.0 / n).sqrt()
        };
        *out = sum * scale;
    }
    output
}

fn median_of(values: &[f64]) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn solid(width: u32, height: u32, color: [u8; 3]) -> DynamicImage {
        let mut img = RgbImage::new(width, height);
        for pixel in img.pixels_mut() {
            *pixel = Rgb(color);
        }
        DynamicImage::ImageRgb8(img)
    }

    /// Horizontal gradient in normalised coordinates, so the content is the
    /// same at any resolution.
    fn horizontal_gradient(width: u32, height: u32) -> DynamicImage {
        let mut img = RgbImage::new(width, height);
        for (x, _y, pixel) in img.enumerate_pixels_mut() {
            let v = (x * 255 / (width - 1).max(1)) as u8;
            *pixel = Rgb([v, v, v]);
        }
        DynamicImage::ImageRgb8(img)
    }

    fn vertical_gradient(width: u32, height: u32) -> DynamicImage {
        let mut img = RgbImage::new(width, height);
        for (_x, y, pixel) in img.enumerate_pixels_mut() {
            let v = (y * 255 / (height - 1).max(1)) as u8;
            *pixel = Rgb([v, v, v]);
        }
        DynamicImage::ImageRgb8(img)
    }

    #[test]
    fn identical_images_have_zero_distance() {
        let a = phash64(&solid(64, 64, [255, 0, 0]));
        let b = phash64(&solid(64, 64, [255, 0, 0]));
        assert_eq!(hamming_distance(a, b), 0);
    }

    #[test]
    fn same_image_at_different_sizes_stays_close() {
        let a = phash64(&horizontal_gradient(64, 64));
        let b = phash64(&horizontal_gradient(128, 128));
        assert!(hamming_distance(a, b) <= 5, "distance {}", hamming_distance(a, b));
    }

    #[test]
    fn different_images_are_far_apart() {
        let a = phash64(&horizontal_gradient(64, 64));
        let b = phash64(&vertical_gradient(64, 64));
        assert!(hamming_distance(a, b) > 5, "distance {}", hamming_distance(a, b));
    }

    #[test]
    fn hamming_counts_differing_bits() {
        assert_eq!(hamming_distance(0, 0), 0);
        assert_eq!(hamming_distance(0, u64::MAX), 64);
        assert_eq!(hamming_distance(0b1010, 0b0110), 2);
    }
}
