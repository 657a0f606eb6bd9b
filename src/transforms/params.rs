//! Per-sample photometric, occlusion and crop parameters.

use rand::Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

use super::affine::Point3;
use crate::error::{Error, Result};

/// Slab of output slices along axis 2 to blank out, inclusive on both ends.
///
/// `end < start` means no occlusion; [`Occlusion::NONE`] is the canonical
/// empty value `(0, -1)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Occlusion {
    /// First occluded index (may be negative).
    pub start: i64,
    /// Last occluded index (may lie past the volume).
    pub end: i64,
}

impl Default for Occlusion {
    fn default() -> Self {
        Self::NONE
    }
}

impl Occlusion {
    /// The "no occlusion" sentinel.
    pub const NONE: Self = Self { start: 0, end: -1 };

    /// True when the range covers nothing.
    pub const fn is_empty(&self) -> bool {
        self.end < self.start
    }

    /// True when index `z` falls inside the range.
    pub const fn contains(&self, z: i64) -> bool {
        self.start <= z && z <= self.end
    }
}

/// Intensity clipping window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Window {
    /// Lower threshold.
    pub min: f64,
    /// Upper threshold.
    pub max: f64,
}

impl Default for Window {
    fn default() -> Self {
        Self::UNBOUNDED
    }
}

impl Window {
    /// No clipping.
    pub const UNBOUNDED: Self = Self {
        min: f64::NEG_INFINITY,
        max: f64::INFINITY,
    };

    /// Clip a value into the window. Never panics, even for inverted windows.
    pub fn clip(&self, v: f64) -> f64 {
        v.max(self.min).min(self.max)
    }
}

/// Non-geometric ranges a batch draws from.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SampleRanges {
    /// Standard deviation of the Gaussian whose magnitude sets the noise level.
    pub noise_level: f64,
    /// Range for the lower window threshold.
    pub window_min: Option<(f64, f64)>,
    /// Range for the upper window threshold.
    pub window_max: Option<(f64, f64)>,
    /// Probability that a sample is occluded.
    pub occlude_prob: f64,
    /// Draw the crop uniformly instead of centering it.
    pub random_crop: bool,
    /// Explicit crop start, exclusive with `random_crop`.
    pub crop_offset: Option<Point3>,
}

impl SampleRanges {
    /// Check every range. Performed before any randomness is consumed.
    pub fn validate(&self) -> Result<()> {
        if !(self.noise_level >= 0.0) || !self.noise_level.is_finite() {
            return Err(Error::Configuration(format!(
                "noise_level must be non-negative (got {})",
                self.noise_level
            )));
        }
        if !(0.0..=1.0).contains(&self.occlude_prob) {
            return Err(Error::Configuration(format!(
                "occlude_prob must be between 0.0 and 1.0 (got {})",
                self.occlude_prob
            )));
        }
        for (name, range) in [("window_min", self.window_min), ("window_max", self.window_max)] {
            if let Some((lo, hi)) = range {
                if !lo.is_finite() || !hi.is_finite() || lo > hi {
                    return Err(Error::Configuration(format!(
                        "{} must be a finite (low, high) pair with low <= high (got ({}, {}))",
                        name, lo, hi
                    )));
                }
            }
        }
        if let Some(offset) = self.crop_offset {
            if self.random_crop {
                return Err(Error::Configuration(
                    "cannot use both random_crop and crop_offset".into(),
                ));
            }
            if offset.iter().any(|v| !v.is_finite()) {
                return Err(Error::Configuration(format!(
                    "crop_offset must be finite (got {:?})",
                    offset
                )));
            }
        }
        Ok(())
    }
}

/// Scalars drawn once per sample and handed to every job of that sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampleParameters {
    /// Additive noise standard deviation (non-negative).
    pub noise_std: f64,
    /// Intensity window.
    pub window: Window,
    /// Occluded slab along axis 2.
    pub occlusion: Occlusion,
    /// Crop window start in input coordinates.
    pub crop_start: Point3,
}

impl SampleParameters {
    /// Draw all non-geometric parameters for one sample.
    ///
    /// `input_shape` and `output_shape` are channel-padded (rank 4).
    pub fn draw<R: Rng + ?Sized>(
        ranges: &SampleRanges,
        input_shape: &[usize],
        output_shape: &[usize],
        rng: &mut R,
    ) -> Result<Self> {
        ranges.validate()?;

        let depth = input_shape.get(2).copied().ok_or_else(|| {
            Error::InvalidDimensions(format!(
                "input shape {:?} has no axis 2",
                input_shape
            ))
        })?;

        let noise_std = draw_noise_std(rng, ranges.noise_level)?;
        let occlusion_width = draw_occlusion_width(rng, ranges.occlude_prob, depth);
        let crop_start = crop_start(
            rng,
            input_shape,
            output_shape,
            ranges.random_crop,
            ranges.crop_offset,
        )?;
        let window = draw_window(rng, ranges.window_min, ranges.window_max);
        let occlusion = draw_occlusion(rng, occlusion_width, depth);

        Ok(Self {
            noise_std,
            window,
            occlusion,
            crop_start,
        })
    }
}

/// Magnitude of a zero-mean Gaussian draw.
pub fn draw_noise_std<R: Rng + ?Sized>(rng: &mut R, level: f64) -> Result<f64> {
    let normal = Normal::new(0.0, level)
        .map_err(|e| Error::Configuration(format!("noise_level: {}", e)))?;
    Ok(normal.sample(rng).abs())
}

/// With probability `prob`, an occlusion width in `[0, depth / 2]`.
pub fn draw_occlusion_width<R: Rng + ?Sized>(rng: &mut R, prob: f64, depth: usize) -> Option<i64> {
    if rng.gen::<f64>() >= prob {
        return None;
    }
    let half = depth as f64 / 2.0;
    Some(rng.gen_range(0.0..=half).floor() as i64)
}

/// Place an occlusion of the given width with start in `[-width, depth]`.
///
/// Regions may extend past either edge, or miss the volume entirely.
pub fn draw_occlusion<R: Rng + ?Sized>(rng: &mut R, width: Option<i64>, depth: usize) -> Occlusion {
    match width {
        Some(width) => {
            let start = rng.gen_range(-(width as f64)..=depth as f64).floor() as i64;
            Occlusion {
                start,
                end: start + width - 1,
            }
        }
        None => Occlusion::NONE,
    }
}

/// Window thresholds; a missing range leaves that side unbounded.
pub fn draw_window<R: Rng + ?Sized>(
    rng: &mut R,
    min_range: Option<(f64, f64)>,
    max_range: Option<(f64, f64)>,
) -> Window {
    let min = min_range.map_or(f64::NEG_INFINITY, |(lo, hi)| uniform(rng, lo, hi));
    let max = max_range.map_or(f64::INFINITY, |(lo, hi)| uniform(rng, lo, hi));
    Window { min, max }
}

/// Start of the crop window in input coordinates.
///
/// Equal shapes always give the zero vector. Otherwise the start is drawn
/// uniformly in `[0, available]` or centered at `available / 2`, with
/// `available = max(input - output, 0)` per spatial axis.
pub fn crop_start<R: Rng + ?Sized>(
    rng: &mut R,
    input_shape: &[usize],
    output_shape: &[usize],
    random: bool,
    offset: Option<Point3>,
) -> Result<Point3> {
    if let Some(offset) = offset {
        if random {
            return Err(Error::Configuration(
                "cannot use both random_crop and crop_offset".into(),
            ));
        }
        return Ok(offset);
    }

    if input_shape.len() < 3 || output_shape.len() < 3 {
        return Err(Error::InvalidDimensions(format!(
            "crop needs 3 spatial dimensions (input {:?}, output {:?})",
            input_shape, output_shape
        )));
    }

    if input_shape == output_shape {
        return Ok([0.0; 3]);
    }

    let mut start = [0.0; 3];
    for (axis, s) in start.iter_mut().enumerate() {
        let available = input_shape[axis].saturating_sub(output_shape[axis]) as f64;
        *s = if random {
            uniform(rng, 0.0, available)
        } else {
            available / 2.0
        };
    }
    Ok(start)
}

/// Center of the output crop window: the anchor every primitive fixes.
pub fn crop_center(crop_start: Point3, output_spatial: [usize; 3]) -> Point3 {
    let mut center = crop_start;
    for (c, &n) in center.iter_mut().zip(output_spatial.iter()) {
        *c += n as f64 / 2.0;
    }
    center
}

fn uniform<R: Rng + ?Sized>(rng: &mut R, lo: f64, hi: f64) -> f64 {
    if lo == hi {
        return lo;
    }
    rng.gen_range(lo..=hi)
}
