//! Frame quality assessment — blur, brightness, and contrast gating.
//!
//! Pure functions over a grayscale face crop. Metrics are checked in a
//! fixed order (blur, then brightness, then contrast) so repeated calls
//! on identical input always report the same rejection reason.

use image::GrayImage;
use serde::{Deserialize, Serialize};

/// Acceptable ranges for the three quality metrics.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct QualityConfig {
    /// Minimum Laplacian variance. Lower means blurrier.
    pub min_blur: f32,
    /// Acceptable mean-luminance range (0–255).
    pub brightness_min: f32,
    pub brightness_max: f32,
    /// Minimum luminance standard deviation.
    pub min_contrast: f32,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            min_blur: 100.0,
            brightness_min: 40.0,
            brightness_max: 220.0,
            min_contrast: 20.0,
        }
    }
}

/// Measured quality metrics for one crop.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualityMetrics {
    pub blur: f32,
    pub brightness: f32,
    pub contrast: f32,
}

/// First metric that failed its configured range.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "metric", rename_all = "snake_case")]
pub enum QualityReason {
    Blur { score: f32, min: f32 },
    Brightness { value: f32, min: f32, max: f32 },
    Contrast { value: f32, min: f32 },
}

/// Compute blur (Laplacian variance), brightness (mean luminance), and
/// contrast (luminance spread) for a grayscale crop.
pub fn measure(gray: &GrayImage) -> QualityMetrics {
    QualityMetrics {
        blur: laplacian_variance(gray),
        brightness: mean_luminance(gray),
        contrast: luminance_stddev(gray),
    }
}

/// Check measured metrics against the configured ranges.
///
/// Returns `Ok(())` only if all three are within range; otherwise the
/// first failing metric in the fixed blur → brightness → contrast order.
pub fn assess(metrics: &QualityMetrics, config: &QualityConfig) -> Result<(), QualityReason> {
    if metrics.blur < config.min_blur {
        return Err(QualityReason::Blur {
            score: metrics.blur,
            min: config.min_blur,
        });
    }
    if metrics.brightness < config.brightness_min || metrics.brightness > config.brightness_max {
        return Err(QualityReason::Brightness {
            value: metrics.brightness,
            min: config.brightness_min,
            max: config.brightness_max,
        });
    }
    if metrics.contrast < config.min_contrast {
        return Err(QualityReason::Contrast {
            value: metrics.contrast,
            min: config.min_contrast,
        });
    }
    Ok(())
}

/// Variance of the 3×3 Laplacian response over interior pixels.
///
/// Sharp edges produce a wide response distribution; a blurred crop
/// collapses toward zero. Crops smaller than 3×3 score 0.0.
fn laplacian_variance(gray: &GrayImage) -> f32 {
    let w = gray.width() as usize;
    let h = gray.height() as usize;
    if w < 3 || h < 3 {
        return 0.0;
    }
    let data = gray.as_raw();

    let mut sum = 0.0f64;
    let mut sum_sq = 0.0f64;
    let n = ((w - 2) * (h - 2)) as f64;

    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let center = data[y * w + x] as f64;
            let up = data[(y - 1) * w + x] as f64;
            let down = data[(y + 1) * w + x] as f64;
            let left = data[y * w + x - 1] as f64;
            let right = data[y * w + x + 1] as f64;

            let response = up + down + left + right - 4.0 * center;
            sum += response;
            sum_sq += response * response;
        }
    }

    let mean = sum / n;
    ((sum_sq / n) - mean * mean).max(0.0) as f32
}

/// Average pixel luminance (0.0–255.0).
fn mean_luminance(gray: &GrayImage) -> f32 {
    let data = gray.as_raw();
    if data.is_empty() {
        return 0.0;
    }
    data.iter().map(|&b| b as f32).sum::<f32>() / data.len() as f32
}

/// Standard deviation of pixel luminance.
fn luminance_stddev(gray: &GrayImage) -> f32 {
    let data = gray.as_raw();
    if data.is_empty() {
        return 0.0;
    }
    let n = data.len() as f32;
    let mean = data.iter().map(|&b| b as f32).sum::<f32>() / n;
    let variance = data.iter().map(|&b| (b as f32 - mean).powi(2)).sum::<f32>() / n;
    variance.sqrt()
}
