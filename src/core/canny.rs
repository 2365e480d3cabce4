//! Canny edge detection, used only to find the bounding box of the
//! meaningful content of an image before it is perceptually hashed.

use image::GrayImage;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::sync::LazyLock;

const EDGE: u8 = 255;
const HYSTERESIS_RADIUS: usize = 2;

/// Tunables of the edge detector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EdgeConfig {
    /// Side of the Gaussian kernel, must be odd
    pub gaussian_size: usize,
    pub gaussian_sigma: f64,
    pub threshold_low: u8,
    pub threshold_high: u8,
    /// Images with a smaller side are not cropped at all
    pub min_dimension: u32,
}

impl Default for EdgeConfig {
    fn default() -> Self {
        Self {
            gaussian_size: 3,
            gaussian_sigma: 1.0,
            threshold_low: 20,
            threshold_high: 40,
            min_dimension: 20,
        }
    }
}

/// Half-open pixel rectangle `[left, right) x [top, bottom)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropRect {
    pub left: u32,
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
}

impl CropRect {
    pub fn width(&self) -> u32 {
        self.right - self.left
    }

    pub fn height(&self) -> u32 {
        self.bottom - self.top
    }
}

/// Kernel for the default configuration, shared by every hasher
static DEFAULT_KERNEL: LazyLock<Vec<f64>> = LazyLock::new(|| {
    let config = EdgeConfig::default();
    gaussian_kernel(config.gaussian_size, config.gaussian_sigma)
});

fn gaussian_kernel(size: usize, sigma: f64) -> Vec<f64> {
    let size = if size % 2 == 0 { size + 1 } else { size };
    let half = (size / 2) as i64;
    let constant = 2.0 * sigma * sigma;

    let mut kernel = Vec::with_capacity(size * size);
    for x in -half..=half {
        for y in -half..=half {
            kernel.push((-((x * x + y * y) as f64) / constant).exp() / (PI * constant));
        }
    }

    let sum: f64 = kernel.iter().sum();
    kernel.iter_mut().for_each(|v| *v /= sum);
    kernel
}

/// Single-channel working plane
struct Plane<T> {
    width: usize,
    height: usize,
    data: Vec<T>,
}

impl<T: Copy + Default> Plane<T> {
    fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            data: vec![T::default(); width * height],
        }
    }

    fn get(&self, x: usize, y: usize) -> T {
        self.data[y * self.width + x]
    }

    fn set(&mut self, x: usize, y: usize, value: T) {
        self.data[y * self.width + x] = value;
    }
}

fn round_u8(value: f64) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}

pub struct EdgeDetector {
    config: EdgeConfig,
    kernel: Vec<f64>,
    kernel_size: usize,
}

impl EdgeDetector {
    pub fn new(config: EdgeConfig) -> Self {
        let default = EdgeConfig::default();
        let kernel = if config.gaussian_size == default.gaussian_size
            && config.gaussian_sigma == default.gaussian_sigma
        {
            DEFAULT_KERNEL.clone()
        } else {
            gaussian_kernel(config.gaussian_size, config.gaussian_sigma)
        };
        let kernel_size = (kernel.len() as f64).sqrt().round() as usize;

        Self {
            config,
            kernel,
            kernel_size,
        }
    }

    /// Bounding box of detected edges, in source image coordinates.
    /// `None` for images that are too small or have no edges at all.
    pub fn process(&self, img: &GrayImage) -> Option<CropRect> {
        let (width, height) = img.dimensions();
        if width.min(height) < self.config.min_dimension {
            return None;
        }

        // Each stage trims a border: the Gaussian by half its size, Sobel and
        // non-maximum suppression by one pixel each.
        let margin = self.kernel_size / 2 + 2;
        if (width as usize) <= 2 * margin || (height as usize) <= 2 * margin {
            return None;
        }

        let source = Plane {
            width: width as usize,
            height: height as usize,
            data: img.as_raw().clone(),
        };

        let blurred = self.gaussian(&source);
        let (magnitude, angles) = sobel(&blurred);
        let thin = non_max_suppression(&magnitude, &angles);
        let edges = hysteresis(&thin, self.config.threshold_low, self.config.threshold_high);

        bounding_box(&edges).map(|rect| CropRect {
            left: rect.left + margin as u32,
            top: rect.top + margin as u32,
            right: rect.right + margin as u32,
            bottom: rect.bottom + margin as u32,
        })
    }

    fn gaussian(&self, src: &Plane<u8>) -> Plane<u8> {
        let half = self.kernel_size / 2;
        let mut result = Plane::new(src.width - 2 * half, src.height - 2 * half);
        for y in 0..result.height {
            for x in 0..result.width {
                let mut sum = 0.0;
                for ky in 0..self.kernel_size {
                    for kx in 0..self.kernel_size {
                        sum += self.kernel[ky * self.kernel_size + kx] * src.get(x + kx, y + ky) as f64;
                    }
                }
                result.set(x, y, round_u8(sum));
            }
        }
        result
    }
}

impl Default for EdgeDetector {
    fn default() -> Self {
        Self::new(EdgeConfig::default())
    }
}

/// Gradient magnitude and direction (degrees in `(-90, 90]`)
fn sobel(src: &Plane<u8>) -> (Plane<u8>, Plane<f32>) {
    const SOBEL_X: [[f64; 3]; 3] = [[-1.0, 0.0, 1.0], [-2.0, 0.0, 2.0], [-1.0, 0.0, 1.0]];
    const SOBEL_Y: [[f64; 3]; 3] = [[1.0, 2.0, 1.0], [0.0, 0.0, 0.0], [-1.0, -2.0, -1.0]];

    let mut magnitude = Plane::new(src.width - 2, src.height - 2);
    let mut angles = Plane::new(src.width - 2, src.height - 2);

    for y in 0..magnitude.height {
        for x in 0..magnitude.width {
            let (mut sum_x, mut sum_y) = (0.0, 0.0);
            for row in 0..3 {
                for col in 0..3 {
                    let pixel = src.get(x + col, y + row) as f64;
                    sum_x += SOBEL_X[row][col] * pixel;
                    sum_y += SOBEL_Y[row][col] * pixel;
                }
            }

            magnitude.set(x, y, round_u8((sum_x * sum_x + sum_y * sum_y).sqrt()));
            let angle = if sum_x.abs() <= f64::EPSILON {
                90.0
            } else {
                (sum_y / sum_x).atan().to_degrees()
            };
            angles.set(x, y, angle as f32);
        }
    }

    (magnitude, angles)
}

fn non_max_suppression(magnitude: &Plane<u8>, angles: &Plane<f32>) -> Plane<u8> {
    let mut result = Plane::new(magnitude.width - 2, magnitude.height - 2);

    for y in 1..magnitude.height - 1 {
        for x in 1..magnitude.width - 1 {
            let value = magnitude.get(x, y);
            let angle = angles.get(x, y);

            // Neighbours along the gradient direction
            let (a, b) = if (-22.5..=22.5).contains(&angle) {
                (magnitude.get(x + 1, y), magnitude.get(x - 1, y))
            } else if angle > 67.5 || angle <= -67.5 {
                (magnitude.get(x, y + 1), magnitude.get(x, y - 1))
            } else if angle > -67.5 && angle <= -22.5 {
                (magnitude.get(x + 1, y + 1), magnitude.get(x - 1, y - 1))
            } else {
                (magnitude.get(x - 1, y + 1), magnitude.get(x + 1, y - 1))
            };

            let kept = if value < a || value < b { 0 } else { value };
            result.set(x - 1, y - 1, kept);
        }
    }

    result
}

/// Double threshold. Weak pixels survive when a strong pixel lies in the
/// surrounding 5x5 block.
fn hysteresis(src: &Plane<u8>, low: u8, high: u8) -> Plane<u8> {
    let high = high.max(low);
    let mut result = Plane::new(src.width, src.height);

    let strong_nearby = |x: usize, y: usize| {
        let x0 = x.saturating_sub(HYSTERESIS_RADIUS);
        let y0 = y.saturating_sub(HYSTERESIS_RADIUS);
        let x1 = (x + HYSTERESIS_RADIUS).min(src.width - 1);
        let y1 = (y + HYSTERESIS_RADIUS).min(src.height - 1);
        (y0..=y1).any(|ny| (x0..=x1).any(|nx| src.get(nx, ny) > high))
    };

    for y in 0..src.height {
        for x in 0..src.width {
            let value = src.get(x, y);
            let edge = if value > high {
                true
            } else if value < low {
                false
            } else {
                strong_nearby(x, y)
            };
            if edge {
                result.set(x, y, EDGE);
            }
        }
    }

    result
}

fn bounding_box(edges: &Plane<u8>) -> Option<CropRect> {
    let mut rect: Option<CropRect> = None;
    for y in 0..edges.height {
        for x in 0..edges.width {
            if edges.get(x, y) != EDGE {
                continue;
            }
            let (x, y) = (x as u32, y as u32);
            rect = Some(match rect {
                None => CropRect {
                    left: x,
                    top: y,
                    right: x + 1,
                    bottom: y + 1,
                },
                Some(r) => CropRect {
                    left: r.left.min(x),
                    top: r.top.min(y),
                    right: r.right.max(x + 1),
                    bottom: r.bottom.max(y + 1),
                },
            });
        }
    }
    rect
}
