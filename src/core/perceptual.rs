use image::imageops::{self, FilterType};
use image::{DynamicImage, GrayImage, ImageBuffer, Luma};
use std::sync::LazyLock;

use crate::core::canny::{CropRect, EdgeConfig, EdgeDetector};
use crate::core::hash::HashService;
use crate::core::models::ImageFingerprint;

const DCT_SIZE: usize = 32;
const MEAN_FILTER_SIZE: usize = 7;
const HASH_BLOCK: usize = 8;

/// Orthonormal DCT-II basis; row `k` holds frequency `k` sampled at every position
static DCT_MATRIX: LazyLock<[[f32; DCT_SIZE]; DCT_SIZE]> = LazyLock::new(|| {
    let n = DCT_SIZE as f64;
    let mut matrix = [[0.0f32; DCT_SIZE]; DCT_SIZE];
    for (k, row) in matrix.iter_mut().enumerate() {
        for (x, value) in row.iter_mut().enumerate() {
            *value = if k == 0 {
                (1.0 / n.sqrt()) as f32
            } else {
                ((2.0 / n).sqrt()
                    * (std::f64::consts::PI / 2.0 / n * k as f64 * (2.0 * x as f64 + 1.0)).cos())
                    as f32
            };
        }
    }
    matrix
});

/// Computes 64-bit DCT perceptual hashes.
///
/// A hash of zero means "not computable" (undecodable or tiny image); it
/// never matches any other hash, including another zero.
pub struct PerceptualHasher {
    edges: EdgeDetector,
    min_dimension: u32,
    hash_service: HashService,
}

impl PerceptualHasher {
    pub fn new(edge_config: EdgeConfig, min_dimension: u32) -> Self {
        Self {
            edges: EdgeDetector::new(edge_config),
            min_dimension,
            hash_service: HashService::new(),
        }
    }

    /// Decode and hash raw image bytes
    pub fn compute_perceptual_hash(&self, body: &[u8]) -> u64 {
        match image::load_from_memory(body) {
            Ok(img) => self.hash_image(&img),
            Err(e) => {
                log::debug!("Cannot decode image ({} bytes): {}", body.len(), e);
                0
            }
        }
    }

    pub fn hash_image(&self, img: &DynamicImage) -> u64 {
        if img.width() < self.min_dimension || img.height() < self.min_dimension {
            return 0;
        }

        let mut gray = to_luma(img);

        let crop = self
            .edges
            .process(&gray)
            .and_then(|rect| crop_rect_if_dominant(rect, gray.width(), gray.height()));
        if let Some(rect) = crop {
            gray = imageops::crop_imm(&gray, rect.left, rect.top, rect.width(), rect.height()).to_image();
        }

        let blurred = mean_filter(&gray);
        let resized = imageops::resize(&blurred, DCT_SIZE as u32, DCT_SIZE as u32, FilterType::Nearest);
        let coefficients = dct_block(&resized);
        binarize(&coefficients)
    }

    /// Fill in the crypto and perceptual hashes and release the image bytes
    pub fn fingerprint(&self, image: &mut ImageFingerprint) {
        if image.body.is_empty() {
            return;
        }
        image.crypto_hash = self.hash_service.compute_content_hash(&image.body);
        image.perceptual_hash = self.compute_perceptual_hash(&image.body);
        image.clear_body();
    }

    /// Crypto hash only; the perceptual hash is left for a later pass
    pub fn fingerprint_exact(&self, image: &mut ImageFingerprint) {
        if image.body.is_empty() {
            return;
        }
        image.crypto_hash = self.hash_service.compute_content_hash(&image.body);
    }
}

impl Default for PerceptualHasher {
    fn default() -> Self {
        Self::new(EdgeConfig::default(), 8)
    }
}

/// The edge box, if it spans more than half of both sides. Smaller boxes come
/// from noise on blank or low-contrast images.
fn crop_rect_if_dominant(rect: CropRect, width: u32, height: u32) -> Option<CropRect> {
    (rect.width() > width / 2 && rect.height() > height / 2).then_some(rect)
}

/// Luma with alpha blended against white
fn to_luma(img: &DynamicImage) -> GrayImage {
    let luma = |r: u8, g: u8, b: u8| 0.299 * r as f64 + 0.587 * g as f64 + 0.114 * b as f64;

    if img.color().has_alpha() {
        let rgba = img.to_rgba8();
        ImageBuffer::from_fn(rgba.width(), rgba.height(), |x, y| {
            let [r, g, b, a] = rgba.get_pixel(x, y).0;
            let alpha = a as f64;
            let value = luma(r, g, b) * alpha / 255.0 + (255.0 - alpha);
            Luma([value.round().clamp(0.0, 255.0) as u8])
        })
    } else {
        let rgb = img.to_rgb8();
        ImageBuffer::from_fn(rgb.width(), rgb.height(), |x, y| {
            let [r, g, b] = rgb.get_pixel(x, y).0;
            Luma([luma(r, g, b).round().clamp(0.0, 255.0) as u8])
        })
    }
}

/// 7x7 box blur with clamped borders
fn mean_filter(gray: &GrayImage) -> ImageBuffer<Luma<f32>, Vec<f32>> {
    let (width, height) = gray.dimensions();
    let half = (MEAN_FILTER_SIZE / 2) as i64;
    let area = (MEAN_FILTER_SIZE * MEAN_FILTER_SIZE) as f32;

    ImageBuffer::from_fn(width, height, |x, y| {
        let mut sum = 0.0f32;
        for dy in -half..=half {
            let sy = (y as i64 + dy).clamp(0, height as i64 - 1) as u32;
            for dx in -half..=half {
                let sx = (x as i64 + dx).clamp(0, width as i64 - 1) as u32;
                sum += gray.get_pixel(sx, sy).0[0] as f32;
            }
        }
        Luma([sum / area])
    })
}

/// The 8x8 block of 2-D DCT coefficients starting at (1, 1), row-major
fn dct_block(img: &ImageBuffer<Luma<f32>, Vec<f32>>) -> [f32; HASH_BLOCK * HASH_BLOCK] {
    let dct = &*DCT_MATRIX;

    // Vertical pass restricted to the rows we keep
    let mut partial = [[0.0f32; DCT_SIZE]; HASH_BLOCK];
    for (row, u) in (1..=HASH_BLOCK).enumerate() {
        for x in 0..DCT_SIZE {
            partial[row][x] = (0..DCT_SIZE)
                .map(|y| dct[u][y] * img.get_pixel(x as u32, y as u32).0[0])
                .sum();
        }
    }

    let mut block = [0.0f32; HASH_BLOCK * HASH_BLOCK];
    for row in 0..HASH_BLOCK {
        for (col, v) in (1..=HASH_BLOCK).enumerate() {
            block[row * HASH_BLOCK + col] = (0..DCT_SIZE).map(|x| partial[row][x] * dct[v][x]).sum();
        }
    }
    block
}

fn median(values: &[f32]) -> f32 {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

/// One bit per coefficient, set when above the median, most significant first
fn binarize(coefficients: &[f32]) -> u64 {
    let median = median(coefficients);
    coefficients
        .iter()
        .fold(0u64, |acc, &value| (acc << 1) | u64::from(value > median))
}
