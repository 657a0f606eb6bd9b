//! Batch affine augmentation of image/segmentation pairs.
//!
//! Each sample gets one randomly drawn affine transform, applied identically
//! to every image channel (trilinear) and to its segmentation (nearest). All
//! jobs of a batch are staged on the executor before any is resolved.
//!
//! When an out-of-bounds label or image fill value is requested, labels are
//! shifted so the smallest becomes 1 before warping; the executor's zero then
//! marks out-of-bounds voxels, and the shift is undone afterwards.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use ndarray::{s, Array3, Array4, ArrayD, ArrayView4, ArrayViewD, Axis, Ix4};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::affine::{AffineParams, AffineRanges, Point3};
use super::params::{crop_center, SampleParameters, SampleRanges};
use super::{get_rng, Interpolation};
use crate::error::{Error, Result};
use crate::warp::{Backend, JobHandle, WarpExecutor, WarpJob};

/// Callback receiving human-readable per-sample parameter lines.
pub type PrintHook = Arc<dyn Fn(&str) + Send + Sync>;

/// Mixed into the batch seed to seed executor noise independently of the
/// geometric draws.
const NOISE_STREAM: u64 = 0x9E37_79B9_7F4A_7C15;

/// Every option of an augmentation batch.
///
/// The default configuration produces the identity map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AugmentConfig {
    /// Seed for the batch-wide generator; all samples share its stream.
    pub seed: Option<u64>,
    /// Uniform rotation in `[-max, max]` degrees about each axis.
    pub rotation_max: Point3,
    /// Per-axis reflection probability.
    pub reflect_prob: Point3,
    /// Per-axis shear bound; `None` disables shearing.
    pub shear_max: Option<Point3>,
    /// Uniform translation in `[-max, max]` voxels per axis.
    pub translation_max: Point3,
    /// Standard deviation of the Gaussian affine perturbation.
    pub other_scale: f64,
    /// Crop uniformly at random rather than centered.
    pub random_crop: bool,
    /// Explicit crop start; cannot be combined with `random_crop`.
    pub crop_offset: Option<Point3>,
    /// Standard deviation from which the per-sample noise level is drawn.
    pub noise_level: f64,
    /// Range for the lower intensity window.
    pub window_min: Option<(f64, f64)>,
    /// Range for the upper intensity window.
    pub window_max: Option<(f64, f64)>,
    /// Probability of occluding a slab along axis 2.
    pub occlude_prob: f64,
    /// Label assigned to out-of-bounds segmentation voxels.
    pub oob_label: i32,
    /// Value assigned to out-of-bounds image voxels.
    pub oob_image_value: Option<f32>,
    /// Built-in executor used by [`AffineAugmentBuilder::augment`].
    pub backend: Backend,
}

impl Default for AugmentConfig {
    fn default() -> Self {
        Self {
            seed: None,
            rotation_max: [0.0; 3],
            reflect_prob: [0.0; 3],
            shear_max: None,
            translation_max: [0.0; 3],
            other_scale: 0.0,
            random_crop: false,
            crop_offset: None,
            noise_level: 0.0,
            window_min: None,
            window_max: None,
            occlude_prob: 0.0,
            oob_label: 0,
            oob_image_value: None,
            backend: Backend::Sequential,
        }
    }
}

impl AugmentConfig {
    /// Parse a JSON configuration; missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read a JSON configuration file.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Geometric ranges.
    pub fn affine_ranges(&self) -> AffineRanges {
        AffineRanges {
            rotation_max: self.rotation_max,
            reflect_prob: self.reflect_prob,
            shear_max: self.shear_max,
            translation_max: self.translation_max,
            other_scale: self.other_scale,
        }
    }

    /// Photometric, occlusion and crop ranges.
    pub fn sample_ranges(&self) -> SampleRanges {
        SampleRanges {
            noise_level: self.noise_level,
            window_min: self.window_min,
            window_max: self.window_max,
            occlude_prob: self.occlude_prob,
            random_crop: self.random_crop,
            crop_offset: self.crop_offset,
        }
    }

    /// Check every option that does not depend on the inputs.
    pub fn validate(&self) -> Result<()> {
        self.affine_ranges().validate()?;
        self.sample_ranges().validate()
    }

    /// Whether out-of-bounds voxels are relabeled or filled.
    pub fn remaps_oob(&self) -> bool {
        self.oob_label != 0 || self.oob_image_value.is_some()
    }
}

/// Result of one batch.
#[derive(Debug, Clone)]
pub struct AugmentOutput {
    /// Augmented images, 3D or 4D following each requested output shape.
    pub images: Vec<ArrayD<f32>>,
    /// Augmented segmentations, `None` when none were supplied.
    pub segmentations: Option<Vec<Array3<i32>>>,
    /// Crop start per sample, in input voxel coordinates.
    pub crops: Vec<Point3>,
}

/// Builder for randomized affine augmentation batches.
#[derive(Clone, Default)]
pub struct AffineAugmentBuilder {
    config: AugmentConfig,
    print_hook: Option<PrintHook>,
}

impl fmt::Debug for AffineAugmentBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AffineAugmentBuilder")
            .field("config", &self.config)
            .field("print_hook", &self.print_hook.is_some())
            .finish()
    }
}

struct Prepared<'a> {
    image: ArrayView4<'a, f32>,
    output_shape: [usize; 4],
    squeeze: bool,
    labels: Option<Array3<f32>>,
    shift: i64,
}

struct Staged {
    channels: Vec<JobHandle>,
    labels: Option<JobHandle>,
    shift: i64,
    output_shape: [usize; 4],
    squeeze: bool,
}

impl AffineAugmentBuilder {
    /// Create a builder producing the identity map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing configuration.
    pub fn from_config(config: AugmentConfig) -> Self {
        Self {
            config,
            print_hook: None,
        }
    }

    /// Current configuration.
    pub fn config(&self) -> &AugmentConfig {
        &self.config
    }

    /// Set the random seed for reproducibility.
    pub fn seed(mut self, seed: u64) -> Self {
        self.config.seed = Some(seed);
        self
    }

    /// Set an optional seed.
    pub fn seed_opt(mut self, seed: Option<u64>) -> Self {
        self.config.seed = seed;
        self
    }

    /// Maximum rotation in degrees about (x, y, z).
    pub fn rotation_max(mut self, degrees: Point3) -> Self {
        self.config.rotation_max = degrees;
        self
    }

    /// Reflection probability per axis.
    pub fn reflect_prob(mut self, prob: Point3) -> Self {
        self.config.reflect_prob = prob;
        self
    }

    /// Shear bound per axis; must be positive.
    pub fn shear_max(mut self, bounds: Point3) -> Self {
        self.config.shear_max = Some(bounds);
        self
    }

    /// Maximum translation in voxels per axis.
    pub fn translation_max(mut self, voxels: Point3) -> Self {
        self.config.translation_max = voxels;
        self
    }

    /// Scale of the Gaussian affine perturbation.
    pub fn other_scale(mut self, scale: f64) -> Self {
        self.config.other_scale = scale;
        self
    }

    /// Crop at random instead of in the center.
    pub fn random_crop(mut self, enabled: bool) -> Self {
        self.config.random_crop = enabled;
        self
    }

    /// Begin the crop at a fixed offset.
    pub fn crop_offset(mut self, offset: Point3) -> Self {
        self.config.crop_offset = Some(offset);
        self
    }

    /// Standard deviation of the noise-level draw.
    pub fn noise_level(mut self, std: f64) -> Self {
        self.config.noise_level = std;
        self
    }

    /// Range for the lower window threshold.
    pub fn window_min(mut self, low: f64, high: f64) -> Self {
        self.config.window_min = Some((low, high));
        self
    }

    /// Range for the upper window threshold.
    pub fn window_max(mut self, low: f64, high: f64) -> Self {
        self.config.window_max = Some((low, high));
        self
    }

    /// Probability of occluding a slab.
    pub fn occlude_prob(mut self, prob: f64) -> Self {
        self.config.occlude_prob = prob;
        self
    }

    /// Label for out-of-bounds segmentation voxels.
    pub fn oob_label(mut self, label: i32) -> Self {
        self.config.oob_label = label;
        self
    }

    /// Fill value for out-of-bounds image voxels.
    pub fn oob_image_value(mut self, value: f32) -> Self {
        self.config.oob_image_value = Some(value);
        self
    }

    /// Built-in executor backend.
    pub fn backend(mut self, backend: Backend) -> Self {
        self.config.backend = backend;
        self
    }

    /// Receive four diagnostic lines per sample.
    pub fn print_with<F>(mut self, hook: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.print_hook = Some(Arc::new(hook));
        self
    }

    /// Augment a batch with the configured built-in backend.
    ///
    /// `shapes` defaults to each image's own shape. A 3-element shape yields
    /// a 3D output; a 4-element shape keeps the channel axis.
    pub fn augment(
        &self,
        images: &[ArrayD<f32>],
        segmentations: Option<&[Array3<i32>]>,
        shapes: Option<&[Vec<usize>]>,
    ) -> Result<AugmentOutput> {
        let prepared = self.prepare(images, segmentations, shapes)?;
        let mut rng = get_rng(self.config.seed);
        let noise_seed = self.config.seed.map(|s| s ^ NOISE_STREAM);
        let mut executor = self.config.backend.executor(noise_seed);
        self.run(&mut executor, prepared, &mut rng, segmentations.is_some())
    }

    /// Augment a batch with a caller-supplied executor.
    pub fn augment_with<E: WarpExecutor + ?Sized>(
        &self,
        executor: &mut E,
        images: &[ArrayD<f32>],
        segmentations: Option<&[Array3<i32>]>,
        shapes: Option<&[Vec<usize>]>,
    ) -> Result<AugmentOutput> {
        let prepared = self.prepare(images, segmentations, shapes)?;
        let mut rng = get_rng(self.config.seed);
        self.run(executor, prepared, &mut rng, segmentations.is_some())
    }

    fn prepare<'a>(
        &self,
        images: &'a [ArrayD<f32>],
        segmentations: Option<&[Array3<i32>]>,
        shapes: Option<&[Vec<usize>]>,
    ) -> Result<Vec<Prepared<'a>>> {
        self.config.validate()?;

        if segmentations.is_none() && self.config.oob_label != 0 {
            return Err(Error::Configuration(
                "cannot set oob_label when no segmentations are given".into(),
            ));
        }
        if let Some(segs) = segmentations {
            if segs.len() != images.len() {
                return Err(Error::Configuration(format!(
                    "images and segmentations must have the same number of elements ({} vs {})",
                    images.len(),
                    segs.len()
                )));
            }
        }
        if let Some(shapes) = shapes {
            if shapes.len() != images.len() {
                return Err(Error::Configuration(format!(
                    "images and shapes must have the same number of elements ({} vs {})",
                    images.len(),
                    shapes.len()
                )));
            }
        }

        images
            .iter()
            .enumerate()
            .map(|(index, image)| {
                let requested = shapes.map_or(image.shape(), |s| s[index].as_slice());
                let segmentation = segmentations.map(|s| &s[index]);
                self.prepare_sample(index, image.view(), segmentation, requested)
            })
            .collect()
    }

    fn prepare_sample<'a>(
        &self,
        index: usize,
        image: ArrayViewD<'a, f32>,
        segmentation: Option<&Array3<i32>>,
        requested: &[usize],
    ) -> Result<Prepared<'a>> {
        let image = pad_channel(image, index)?;
        let (nx, ny, nz, nc) = image.dim();

        let output_shape = match *requested {
            [x, y, z] => [x, y, z, 1],
            [x, y, z, c] => [x, y, z, c],
            _ => {
                return Err(Error::ShapeMismatch(format!(
                    "sample {}: input and output shapes have mismatched number of dimensions \
                     (input {:?}, output {:?})",
                    index,
                    image.shape(),
                    requested
                )))
            }
        };
        if output_shape[3] != nc {
            return Err(Error::ShapeMismatch(format!(
                "sample {}: output shape has {} channels, while input has {}",
                index, output_shape[3], nc
            )));
        }
        if let Some(axis) = output_shape.iter().position(|&d| d == 0) {
            return Err(Error::InvalidDimensions(format!(
                "sample {}: output dimension {} must be positive (got 0)",
                index, axis
            )));
        }

        let spatial = [nx, ny, nz];
        if let Some(seg) = segmentation {
            if seg.shape() != &spatial[..] {
                return Err(Error::ShapeMismatch(format!(
                    "sample {}: segmentation shape {:?} differs from image spatial shape {:?}",
                    index,
                    seg.shape(),
                    spatial
                )));
            }
        }

        let (labels, shift) = if self.config.remaps_oob() {
            let dummy;
            let seg = match segmentation {
                Some(seg) => seg,
                None => {
                    dummy = Array3::<i32>::zeros((nx, ny, nz));
                    &dummy
                }
            };
            let min = seg.iter().copied().min().map_or(0, i64::from);
            let shift = min - 1;
            (Some(seg.mapv(|l| (i64::from(l) - shift) as f32)), shift)
        } else {
            (segmentation.map(|seg| seg.mapv(|l| l as f32)), 0)
        };

        Ok(Prepared {
            image,
            output_shape,
            squeeze: requested.len() == 3,
            labels,
            shift,
        })
    }

    fn run<E, R>(
        &self,
        executor: &mut E,
        prepared: Vec<Prepared<'_>>,
        rng: &mut R,
        have_seg: bool,
    ) -> Result<AugmentOutput>
    where
        E: WarpExecutor + ?Sized,
        R: Rng + ?Sized,
    {
        let affine_ranges = self.config.affine_ranges();
        let sample_ranges = self.config.sample_ranges();
        debug!(samples = prepared.len(), have_seg, "augmenting batch");

        let mut crops = Vec::with_capacity(prepared.len());
        let mut staged = Vec::with_capacity(prepared.len());
        for (index, sample) in prepared.into_iter().enumerate() {
            let (nx, ny, nz, nc) = sample.image.dim();
            let [ox, oy, oz, _] = sample.output_shape;
            let spatial = [ox, oy, oz];

            let params = SampleParameters::draw(
                &sample_ranges,
                &[nx, ny, nz, nc],
                &sample.output_shape,
                rng,
            )?;
            let anchor = crop_center(params.crop_start, spatial);
            let (affine, geometry) = affine_ranges.compose(anchor, params.crop_start, rng)?;
            debug!(
                sample = index,
                rotation = ?geometry.rotation_deg,
                translation = ?geometry.translation,
                crop_start = ?params.crop_start,
                noise_std = params.noise_std,
                window_min = params.window.min,
                window_max = params.window.max,
                occlusion_start = params.occlusion.start,
                occlusion_end = params.occlusion.end,
                "drew sample parameters"
            );

            let channels = sample
                .image
                .axis_iter(Axis(3))
                .map(|channel| {
                    executor.stage(
                        WarpJob::new(channel.to_owned(), affine, Interpolation::Trilinear, spatial)
                            .with_noise(params.noise_std)
                            .with_window(params.window)
                            .with_occlusion(params.occlusion),
                    )
                })
                .collect::<Result<Vec<_>>>()?;

            if let Some(hook) = &self.print_hook {
                for line in describe(&params, &geometry) {
                    hook(&line);
                }
            }

            let labels = sample
                .labels
                .map(|labels| {
                    executor.stage(
                        WarpJob::new(labels, affine, Interpolation::Nearest, spatial)
                            .with_occlusion(params.occlusion),
                    )
                })
                .transpose()?;

            crops.push(params.crop_start);
            staged.push(Staged {
                channels,
                labels,
                shift: sample.shift,
                output_shape: sample.output_shape,
                squeeze: sample.squeeze,
            });
        }

        let mut images = Vec::with_capacity(staged.len());
        let mut segmentations = Vec::with_capacity(if have_seg { staged.len() } else { 0 });
        for (index, sample) in staged.into_iter().enumerate() {
            let [ox, oy, oz, oc] = sample.output_shape;
            let spatial = [ox, oy, oz];
            let mut image = Array4::<f32>::zeros((ox, oy, oz, oc));
            for (mut dst, handle) in image.axis_iter_mut(Axis(3)).zip(sample.channels) {
                let out = executor.resolve(handle)?;
                check_resolved(&out, spatial, index)?;
                dst.assign(&out);
            }

            if let Some(handle) = sample.labels {
                let raw = executor.resolve(handle)?;
                check_resolved(&raw, spatial, index)?;
                let labels = self.restore_labels(&raw, sample.shift, &mut image);
                if have_seg {
                    segmentations.push(labels);
                }
            }

            images.push(if sample.squeeze {
                image.index_axis_move(Axis(3), 0).into_dyn()
            } else {
                image.into_dyn()
            });
        }

        debug!(samples = images.len(), "batch complete");
        Ok(AugmentOutput {
            images,
            segmentations: have_seg.then_some(segmentations),
            crops,
        })
    }

    /// Round warped labels, substitute out-of-bounds voxels and undo the shift.
    fn restore_labels(
        &self,
        raw: &Array3<f32>,
        shift: i64,
        image: &mut Array4<f32>,
    ) -> Array3<i32> {
        let remap = self.config.remaps_oob();
        let oob_label = self.config.oob_label;
        let fill = self.config.oob_image_value;
        Array3::from_shape_fn(raw.raw_dim(), |(x, y, z)| {
            let label = raw[[x, y, z]].round() as i64;
            if !remap {
                return label as i32;
            }
            if label == 0 {
                if let Some(value) = fill {
                    image.slice_mut(s![x, y, z, ..]).fill(value);
                }
                oob_label
            } else {
                (label + shift) as i32
            }
        })
    }
}

fn pad_channel(image: ArrayViewD<'_, f32>, index: usize) -> Result<ArrayView4<'_, f32>> {
    let padded = match image.ndim() {
        3 => image.insert_axis(Axis(3)),
        4 => image,
        n => {
            return Err(Error::InvalidDimensions(format!(
                "image {}: expected 3 or 4 dimensions (D,H,W[,C]), got {}",
                index, n
            )))
        }
    };
    if let Some(axis) = padded.shape().iter().position(|&d| d == 0) {
        return Err(Error::InvalidDimensions(format!(
            "image {}: dimension {} cannot be 0",
            index, axis
        )));
    }
    padded
        .into_dimensionality::<Ix4>()
        .map_err(|e| Error::InvalidDimensions(format!("image {}: {}", index, e)))
}

fn check_resolved(out: &Array3<f32>, expected: [usize; 3], index: usize) -> Result<()> {
    if out.shape() != &expected[..] {
        return Err(Error::executor(
            "resolve",
            format!(
                "sample {}: executor returned shape {:?}, expected {:?}",
                index,
                out.shape(),
                expected
            ),
        ));
    }
    Ok(())
}

fn describe(params: &SampleParameters, geometry: &AffineParams) -> [String; 4] {
    let r = geometry.rotation_deg;
    let t = geometry.translation;
    [
        format!(
            "occZmin: {} occZmax: {}",
            params.occlusion.start, params.occlusion.end
        ),
        format!("winMin: {} winMax: {}", params.window.min, params.window.max),
        format!("rotation: [{:.2}, {:.2}, {:.2}]", r[0], r[1], r[2]),
        format!("translation: [{:.2}, {:.2}, {:.2}]", t[0], t[1], t[2]),
    ]
}
