//! Randomized affine augmentation.
//!
//! - [`affine`]: matrix primitives and their composition around a fixed anchor
//! - [`params`]: per-sample noise, window, occlusion and crop draws
//! - [`augment`]: batch orchestration over an executor
//! - [`jitter`]: perturbation of invalid-region masks

pub mod affine;
pub mod augment;
pub mod jitter;
pub mod params;

use std::fmt;

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

pub use affine::{Affine, AffineParams, AffineRanges, Point3};
pub use augment::{AffineAugmentBuilder, AugmentConfig, AugmentOutput, PrintHook};
pub use jitter::{binary_dilation, binary_erosion, jitter_mask, JitterOptions};
pub use params::{Occlusion, SampleParameters, SampleRanges, Window};

/// Sampling mode used by a warp executor.
///
/// Displays as the executor mode name (`linear` or `nearest`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Interpolation {
    /// Trilinear interpolation, used for image channels.
    Trilinear,
    /// Nearest neighbour, used for label maps.
    Nearest,
}

impl fmt::Display for Interpolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Trilinear => write!(f, "linear"),
            Self::Nearest => write!(f, "nearest"),
        }
    }
}

/// Random number generator with optional seeding for reproducibility.
#[allow(clippy::option_if_let_else)] // match is clearer than map_or_else here
pub(crate) fn get_rng(seed: Option<u64>) -> ChaCha8Rng {
    match seed {
        Some(s) => ChaCha8Rng::seed_from_u64(s),
        None => ChaCha8Rng::from_entropy(),
    }
}
