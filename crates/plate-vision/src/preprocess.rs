//! Plate crop preprocessing for OCR.
//!
//! grayscale → 3×3 median → CLAHE → (Otsu | adaptive Gaussian) → 3×3 closing.
//! Every step is deterministic and operates on 8-bit luma. The filters come
//! from `imageproc`; CLAHE has no counterpart there and lives here.

use image::{imageops, GrayImage, Luma, RgbImage};
use imageproc::distance_transform::Norm;
use imageproc::{contrast, filter, morphology};
use serde::{Deserialize, Serialize};

/// Preprocessing parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PreprocessConfig {
    pub median_denoise: bool,
    pub clahe_clip_limit: f32,
    /// Tiles per axis.
    pub clahe_tiles: u32,
    /// Odd neighbourhood size for the adaptive threshold.
    pub adaptive_block: u32,
    pub adaptive_c: f32,
    /// Side of the square closing kernel; 0 disables closing.
    pub close_kernel: u32,
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            median_denoise: true,
            clahe_clip_limit: 3.0,
            clahe_tiles: 8,
            adaptive_block: 11,
            adaptive_c: 2.0,
            close_kernel: 3,
        }
    }
}

/// Full preprocessing chain for one plate crop.
pub fn preprocess(crop: &RgbImage, config: &PreprocessConfig) -> GrayImage {
    let mut gray = to_gray(crop);
    if gray.width() == 0 || gray.height() == 0 {
        return gray;
    }
    if config.median_denoise {
        gray = filter::median_filter(&gray, 1, 1);
    }
    let enhanced = clahe(&gray, config.clahe_clip_limit, config.clahe_tiles);
    let global = threshold(&enhanced, contrast::otsu_level(&enhanced));
    let local = adaptive_gaussian(&enhanced, config.adaptive_block, config.adaptive_c);
    let combined = GrayImage::from_fn(global.width(), global.height(), |x, y| {
        Luma([global.get_pixel(x, y)[0] | local.get_pixel(x, y)[0]])
    });
    if config.close_kernel > 1 {
        let radius = (config.close_kernel / 2).min(u32::from(u8::MAX)) as u8;
        morphology::close(&combined, Norm::LInf, radius)
    } else {
        combined
    }
}

pub fn to_gray(crop: &RgbImage) -> GrayImage {
    imageops::grayscale(crop)
}

/// Binary threshold: values above `level` become 255.
pub fn threshold(img: &GrayImage, level: u8) -> GrayImage {
    GrayImage::from_fn(img.width(), img.height(), |x, y| {
        Luma([if img.get_pixel(x, y)[0] > level { 255 } else { 0 }])
    })
}

/// Gaussian-weighted local mean threshold: a pixel is set when it exceeds
/// its neighbourhood mean minus `c`.
pub fn adaptive_gaussian(img: &GrayImage, block: u32, c: f32) -> GrayImage {
    let block = block.max(3) | 1;
    // Kernel-size to sigma rule for an unspecified sigma; always > 0.
    let sigma = 0.3 * ((block as f32 - 1.0) * 0.5 - 1.0) + 0.8;
    let mean = filter::gaussian_blur_f32(img, sigma);
    GrayImage::from_fn(img.width(), img.height(), |x, y| {
        let v = f32::from(img.get_pixel(x, y)[0]);
        let m = f32::from(mean.get_pixel(x, y)[0]);
        Luma([if v > m - c { 255 } else { 0 }])
    })
}

/// Tile `index` of `count` along an axis of `len` pixels, as `[start, end)`.
///
/// With `count <= len` every tile is non-empty and the tiles cover the axis
/// exactly, whatever the remainder.
fn tile_span(index: u32, count: u32, len: u32) -> (u32, u32) {
    let edge = |i: u32| (u64::from(i) * u64::from(len) / u64::from(count)) as u32;
    (edge(index), edge(index + 1))
}

/// Contrast-limited adaptive histogram equalization.
///
/// Per-tile clipped-histogram lookup tables, bilinearly interpolated between
/// tile centres. The grid shrinks for crops with fewer pixels than tiles.
pub fn clahe(img: &GrayImage, clip_limit: f32, tiles: u32) -> GrayImage {
    let (width, height) = img.dimensions();
    if width == 0 || height == 0 {
        return img.clone();
    }
    let tiles_x = tiles.clamp(1, width);
    let tiles_y = tiles.clamp(1, height);

    let mut luts = Vec::with_capacity((tiles_x * tiles_y) as usize);
    for ty in 0..tiles_y {
        let (y0, y1) = tile_span(ty, tiles_y, height);
        for tx in 0..tiles_x {
            let (x0, x1) = tile_span(tx, tiles_x, width);
            luts.push(tile_lut(img, (x0, y0, x1, y1), clip_limit));
        }
    }

    let tile_w = width as f32 / tiles_x as f32;
    let tile_h = height as f32 / tiles_y as f32;

    // Position of a pixel relative to tile centres: (low tile, high tile, weight of high).
    let axis = |p: u32, tile: f32, count: u32| -> (u32, u32, f32) {
        let f = (p as f32 + 0.5) / tile - 0.5;
        if f <= 0.0 {
            return (0, 0, 0.0);
        }
        let lo = (f.floor() as u32).min(count - 1);
        let hi = (lo + 1).min(count - 1);
        (lo, hi, (f - lo as f32).clamp(0.0, 1.0))
    };

    GrayImage::from_fn(width, height, |x, y| {
        let v = img.get_pixel(x, y)[0] as usize;
        let (tx0, tx1, wx) = axis(x, tile_w, tiles_x);
        let (ty0, ty1, wy) = axis(y, tile_h, tiles_y);
        let at = |tx: u32, ty: u32| luts[(ty * tiles_x + tx) as usize][v] as f32;
        let top = at(tx0, ty0) * (1.0 - wx) + at(tx1, ty0) * wx;
        let bottom = at(tx0, ty1) * (1.0 - wx) + at(tx1, ty1) * wx;
        Luma([(top * (1.0 - wy) + bottom * wy).round().clamp(0.0, 255.0) as u8])
    })
}

fn tile_lut(img: &GrayImage, (x0, y0, x1, y1): (u32, u32, u32, u32), clip_limit: f32) -> [u8; 256] {
    let mut hist = [0u32; 256];
    for y in y0..y1 {
        for x in x0..x1 {
            hist[img.get_pixel(x, y)[0] as usize] += 1;
        }
    }
    let area = (x1.saturating_sub(x0) * y1.saturating_sub(y0)).max(1);

    if clip_limit > 0.0 {
        let limit = ((clip_limit * area as f32 / 256.0) as u32).max(1);
        let mut excess = 0u32;
        for bin in hist.iter_mut() {
            if *bin > limit {
                excess += *bin - limit;
                *bin = limit;
            }
        }
        let share = excess / 256;
        let residual = (excess % 256) as usize;
        for (i, bin) in hist.iter_mut().enumerate() {
            *bin += share + u32::from(i < residual);
        }
    }

    let scale = 255.0 / area as f32;
    let mut lut = [0u8; 256];
    let mut cdf = 0u32;
    for (i, bin) in hist.iter().enumerate() {
        cdf += bin;
        lut[i] = (cdf as f32 * scale).round().clamp(0.0, 255.0) as u8;
    }
    lut
}
