//! # warpaug
//!
//! Randomized 3D affine augmentation for volumetric image/segmentation pairs.
//!
//! Each sample in a batch gets one affine transform built from declarative
//! ranges (rotation, shear, reflection, Gaussian perturbation, translation,
//! crop) together with photometric parameters (noise, intensity window,
//! occlusion). The transform is applied identically to every image channel
//! and to the paired segmentation through a [`warp::WarpExecutor`], which may
//! be the bundled CPU resampler or an external (e.g. GPU) implementation.
//!
//! ```ignore
//! use warpaug::AffineAugmentBuilder;
//!
//! let out = AffineAugmentBuilder::new()
//!     .seed(42)
//!     .rotation_max([10.0, 10.0, 10.0])
//!     .shear_max([1.1, 1.1, 1.1])
//!     .translation_max([5.0, 5.0, 5.0])
//!     .oob_label(255)
//!     .augment(&images, Some(&segmentations), None)?;
//! ```

pub mod error;
pub mod transforms;
pub mod warp;

#[cfg(feature = "python")]
mod python;

pub use error::{Error, Result};
pub use transforms::{
    jitter_mask, AffineAugmentBuilder, AugmentConfig, AugmentOutput, Interpolation,
    JitterOptions,
};
pub use warp::{Backend, CpuExecutor, JobHandle, WarpExecutor, WarpJob};
