//! Affine augmentation functions for Python bindings.
//!
//! Arrays cross the boundary as numpy arrays; all work runs with the GIL
//! released.

use ndarray::{Array3, ArrayD};
use numpy::{IntoPyArray, PyArray3, PyArrayDyn, PyReadonlyArray3, PyReadonlyArrayDyn};
use pyo3::prelude::*;
use tracing::warn;

use super::validation::{to_py_err, validate_probability, validate_range};
use crate::transforms::{self, get_rng, AffineAugmentBuilder, JitterOptions};
use crate::warp::Backend;

type Triple = (f64, f64, f64);

type Augmented<'py> = (
    Vec<Bound<'py, PyArrayDyn<f32>>>,
    Option<Vec<Bound<'py, PyArray3<i32>>>>,
    Vec<Triple>,
);

const fn arr(t: Triple) -> [f64; 3] {
    [t.0, t.1, t.2]
}

/// Randomly warp images and, optionally, their segmentations.
///
/// Args:
///     images: List of float32 arrays, (D,H,W) or (D,H,W,C)
///     segmentations: Optional list of int32 label arrays, (D,H,W)
///     shapes: Optional list of output shapes (default: input shapes)
///     seed: Optional random seed for the whole batch
///     rot_max: Rotation bound in degrees about each axis
///     p_reflect: Reflection probability per axis
///     shear_max: Optional positive shear bound per axis
///     trans_max: Translation bound in voxels per axis
///     other_scale: Scale of the Gaussian affine perturbation
///     random_crop: Crop at random instead of centered
///     crop_offset: Optional explicit crop start
///     noise_level: Standard deviation of the noise-level draw
///     window_min: Optional (low, high) range for the lower window
///     window_max: Optional (low, high) range for the upper window
///     occlude_prob: Probability of occluding a slab
///     oob_label: Label for out-of-bounds voxels (requires segmentations)
///     oob_image_val: Optional fill value for out-of-bounds image voxels
///     print_fun: Optional callable receiving diagnostic lines
///     backend: 'sequential' or 'parallel'
///
/// Returns:
///     Tuple of (images, segmentations or None, crop starts)
#[pyfunction]
#[pyo3(signature = (
    images,
    segmentations=None,
    shapes=None,
    seed=None,
    rot_max=(0.0, 0.0, 0.0),
    p_reflect=(0.0, 0.0, 0.0),
    shear_max=None,
    trans_max=(0.0, 0.0, 0.0),
    other_scale=0.0,
    random_crop=false,
    crop_offset=None,
    noise_level=0.0,
    window_min=None,
    window_max=None,
    occlude_prob=0.0,
    oob_label=0,
    oob_image_val=None,
    print_fun=None,
    backend="sequential"
))]
#[allow(clippy::too_many_arguments)]
pub fn affine_augment3d<'py>(
    py: Python<'py>,
    images: Vec<PyReadonlyArrayDyn<'py, f32>>,
    segmentations: Option<Vec<PyReadonlyArray3<'py, i32>>>,
    shapes: Option<Vec<Vec<usize>>>,
    seed: Option<u64>,
    rot_max: Triple,
    p_reflect: Triple,
    shear_max: Option<Triple>,
    trans_max: Triple,
    other_scale: f64,
    random_crop: bool,
    crop_offset: Option<Triple>,
    noise_level: f64,
    window_min: Option<(f64, f64)>,
    window_max: Option<(f64, f64)>,
    occlude_prob: f64,
    oob_label: i32,
    oob_image_val: Option<f32>,
    print_fun: Option<PyObject>,
    backend: &str,
) -> PyResult<Augmented<'py>> {
    for p in arr(p_reflect) {
        validate_probability(p, "affine_augment3d: p_reflect")?;
    }
    validate_probability(occlude_prob, "affine_augment3d: occlude_prob")?;
    validate_range(window_min, "affine_augment3d: window_min")?;
    validate_range(window_max, "affine_augment3d: window_max")?;
    let backend: Backend = backend
        .parse()
        .map_err(|e| to_py_err(e, "affine_augment3d"))?;

    let mut builder = AffineAugmentBuilder::new()
        .seed_opt(seed)
        .rotation_max(arr(rot_max))
        .reflect_prob(arr(p_reflect))
        .translation_max(arr(trans_max))
        .other_scale(other_scale)
        .random_crop(random_crop)
        .noise_level(noise_level)
        .occlude_prob(occlude_prob)
        .oob_label(oob_label)
        .backend(backend);
    if let Some(bounds) = shear_max {
        builder = builder.shear_max(arr(bounds));
    }
    if let Some(offset) = crop_offset {
        builder = builder.crop_offset(arr(offset));
    }
    if let Some((low, high)) = window_min {
        builder = builder.window_min(low, high);
    }
    if let Some((low, high)) = window_max {
        builder = builder.window_max(low, high);
    }
    if let Some(value) = oob_image_val {
        builder = builder.oob_image_value(value);
    }
    if let Some(fun) = print_fun {
        builder = builder.print_with(move |line| {
            Python::with_gil(|py| {
                if let Err(err) = fun.call1(py, (line,)) {
                    warn!(error = %err, line, "print_fun raised an exception");
                }
            });
        });
    }

    let images: Vec<ArrayD<f32>> = images.iter().map(|a| a.as_array().to_owned()).collect();
    let segmentations: Option<Vec<Array3<i32>>> = segmentations
        .map(|segs| segs.iter().map(|a| a.as_array().to_owned()).collect());

    let out = py
        .allow_threads(|| builder.augment(&images, segmentations.as_deref(), shapes.as_deref()))
        .map_err(|e| to_py_err(e, "affine_augment3d"))?;

    let images = out.images.into_iter().map(|a| a.into_pyarray(py)).collect();
    let segmentations = out
        .segmentations
        .map(|segs| segs.into_iter().map(|a| a.into_pyarray(py)).collect());
    let crops = out.crops.iter().map(|c| (c[0], c[1], c[2])).collect();
    Ok((images, segmentations, crops))
}

/// Randomly perturb the boundary of the -1 (invalid) region of a label map.
///
/// Args:
///     labels: int32 label array (D,H,W)
///     p_quit: Probability of returning the labels unchanged (default: 0.5)
///     max_iter: Maximum erosion/dilation iterations (default: 1)
///     p_keep: Per-voxel acceptance probability in jagged mode (default: 0.5)
///     p_jagged: Probability of jagged perturbation (default: 0.5)
///     seed: Optional random seed for reproducibility
///
/// Returns:
///     Perturbed label array
#[pyfunction]
#[pyo3(signature = (labels, p_quit=0.5, max_iter=1, p_keep=0.5, p_jagged=0.5, seed=None))]
pub fn jitter_mask<'py>(
    py: Python<'py>,
    labels: PyReadonlyArray3<'py, i32>,
    p_quit: f64,
    max_iter: u32,
    p_keep: f64,
    p_jagged: f64,
    seed: Option<u64>,
) -> PyResult<Bound<'py, PyArray3<i32>>> {
    let options = JitterOptions {
        p_quit,
        max_iter,
        p_keep,
        p_jagged,
    };
    let labels = labels.as_array().to_owned();
    let mut rng = get_rng(seed);
    let out = transforms::jitter_mask(&labels, &options, &mut rng)
        .map_err(|e| to_py_err(e, "jitter_mask"))?;
    Ok(out.into_pyarray(py))
}
