//! Random perturbation of invalid-region masks.
//!
//! Voxels labeled `-1` mark an unknown region. [`jitter_mask`] moves the
//! perimeter of that region by eroding or dilating it, either smoothly or
//! one voxel shell at a time with per-voxel acceptance.

use ndarray::{Array3, Zip};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Label marking invalid voxels.
pub const INVALID_LABEL: i32 = -1;

/// Options for [`jitter_mask`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JitterOptions {
    /// Probability of returning the labels untouched.
    pub p_quit: f64,
    /// Upper bound on the number of erosion/dilation iterations.
    pub max_iter: u32,
    /// Probability of accepting each voxel change in jagged mode.
    pub p_keep: f64,
    /// Probability of jagged rather than smooth perturbation.
    pub p_jagged: f64,
}

impl Default for JitterOptions {
    fn default() -> Self {
        Self {
            p_quit: 0.5,
            max_iter: 1,
            p_keep: 0.5,
            p_jagged: 0.5,
        }
    }
}

impl JitterOptions {
    /// Check probabilities and the iteration bound.
    pub fn validate(&self) -> Result<()> {
        for (name, p) in [
            ("p_quit", self.p_quit),
            ("p_keep", self.p_keep),
            ("p_jagged", self.p_jagged),
        ] {
            if !(0.0..=1.0).contains(&p) {
                return Err(Error::Configuration(format!(
                    "{} must be between 0.0 and 1.0 (got {})",
                    name, p
                )));
            }
        }
        if self.max_iter == 0 {
            return Err(Error::Configuration("max_iter must be at least 1".into()));
        }
        Ok(())
    }
}

/// Randomly move the boundary of the `-1` region.
///
/// Voxels that join the region become `-1`; voxels that leave it become `0`;
/// all other labels are kept.
pub fn jitter_mask<R: Rng + ?Sized>(
    labels: &Array3<i32>,
    options: &JitterOptions,
    rng: &mut R,
) -> Result<Array3<i32>> {
    options.validate()?;

    if rng.gen::<f64>() <= options.p_quit {
        return Ok(labels.clone());
    }

    let mut invalid = labels.mapv(|l| l == INVALID_LABEL);
    if !invalid.iter().any(|&v| v) {
        return Ok(labels.clone());
    }

    let iters = if options.max_iter > 1 {
        rng.gen_range(1.0..=f64::from(options.max_iter)).round() as usize
    } else {
        1
    };

    if rng.gen::<f64>() > options.p_jagged {
        invalid = if rng.gen::<f64>() > 0.5 {
            binary_erosion(&invalid, iters)
        } else {
            binary_dilation(&invalid, iters)
        };
    } else {
        for _ in 0..iters {
            let changed = if rng.gen::<f64>() > 0.5 {
                binary_erosion(&invalid, 1)
            } else {
                binary_dilation(&invalid, 1)
            };
            Zip::from(&mut invalid).and(&changed).for_each(|current, &next| {
                if *current != next && rng.gen::<f64>() <= options.p_keep {
                    *current = next;
                }
            });
        }
    }

    let mut result = labels.clone();
    Zip::from(&mut result).and(&invalid).for_each(|label, &bad| {
        if bad {
            *label = INVALID_LABEL;
        } else if *label == INVALID_LABEL {
            *label = 0;
        }
    });
    Ok(result)
}

/// Binary erosion with the 6-connected cross. Outside the volume counts as
/// `false`, so the border always erodes.
pub fn binary_erosion(mask: &Array3<bool>, iterations: usize) -> Array3<bool> {
    morph(mask, iterations, true)
}

/// Binary dilation with the 6-connected cross.
pub fn binary_dilation(mask: &Array3<bool>, iterations: usize) -> Array3<bool> {
    morph(mask, iterations, false)
}

const NEIGHBOURS: [[isize; 3]; 6] = [
    [-1, 0, 0],
    [1, 0, 0],
    [0, -1, 0],
    [0, 1, 0],
    [0, 0, -1],
    [0, 0, 1],
];

fn morph(mask: &Array3<bool>, iterations: usize, erode: bool) -> Array3<bool> {
    let (nx, ny, nz) = mask.dim();
    let dims = [nx, ny, nz];
    let mut current = mask.clone();
    for _ in 0..iterations {
        let prev = current;
        current = Array3::from_shape_fn(prev.raw_dim(), |(x, y, z)| {
            let centre = prev[[x, y, z]];
            let mut neighbours = NEIGHBOURS.iter().map(|offset| {
                let p = [x, y, z];
                let mut idx = [0usize; 3];
                for axis in 0..3 {
                    let v = p[axis] as isize + offset[axis];
                    if v < 0 || v >= dims[axis] as isize {
                        return false;
                    }
                    idx[axis] = v as usize;
                }
                prev[idx]
            });
            if erode {
                centre && neighbours.all(|n| n)
            } else {
                centre || neighbours.any(|n| n)
            }
        });
    }
    current
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn cube(n: usize, lo: usize, hi: usize) -> Array3<bool> {
        Array3::from_shape_fn((n, n, n), |(x, y, z)| {
            [x, y, z].iter().all(|&v| (lo..=hi).contains(&v))
        })
    }

    fn count(mask: &Array3<bool>) -> usize {
        mask.iter().filter(|&&v| v).count()
    }

    #[test]
    fn test_erosion_and_dilation() {
        let mask = cube(7, 2, 4);
        assert_eq!(count(&mask), 27);

        let eroded = binary_erosion(&mask, 1);
        assert_eq!(count(&eroded), 1);
        assert!(eroded[[3, 3, 3]]);

        let dilated = binary_dilation(&mask, 1);
        // 27 + 6 faces of 9 voxels.
        assert_eq!(count(&dilated), 27 + 54);
    }

    #[test]
    fn test_erosion_clears_border() {
        let full = Array3::from_elem((3, 3, 3), true);
        let eroded = binary_erosion(&full, 1);
        assert_eq!(count(&eroded), 1);
    }

    #[test]
    fn test_no_invalid_labels_unchanged() {
        let labels = Array3::from_shape_fn((4, 4, 4), |(x, _, _)| x as i32);
        let options = JitterOptions {
            p_quit: 0.0,
            ..JitterOptions::default()
        };
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        assert_eq!(jitter_mask(&labels, &options, &mut rng).unwrap(), labels);
    }

    #[test]
    fn test_quit_always() {
        let labels = Array3::from_elem((3, 3, 3), -1);
        let options = JitterOptions {
            p_quit: 1.0,
            ..JitterOptions::default()
        };
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        assert_eq!(jitter_mask(&labels, &options, &mut rng).unwrap(), labels);
    }

    #[test]
    fn test_jitter_only_touches_mask_boundary() {
        let mask = cube(9, 3, 5);
        let labels = Array3::from_shape_fn((9, 9, 9), |(x, y, z)| {
            if mask[[x, y, z]] {
                -1
            } else {
                2
            }
        });
        let options = JitterOptions {
            p_quit: 0.0,
            max_iter: 1,
            ..JitterOptions::default()
        };
        let dilated = binary_dilation(&mask, 1);
        let eroded = binary_erosion(&mask, 1);
        for seed in 0..20 {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            let out = jitter_mask(&labels, &options, &mut rng).unwrap();
            for ((idx, &label), &orig) in out.indexed_iter().zip(labels.iter()) {
                let (x, y, z) = idx;
                assert!(label == -1 || label == 0 || label == orig);
                if label == -1 {
                    assert!(dilated[[x, y, z]]);
                }
                if eroded[[x, y, z]] {
                    assert_eq!(label, -1);
                }
                if label == 0 {
                    assert!(mask[[x, y, z]]);
                }
            }
        }
    }

    #[test]
    fn test_invalid_options_rejected() {
        let labels = Array3::from_elem((2, 2, 2), 0);
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let options = JitterOptions {
            max_iter: 0,
            ..JitterOptions::default()
        };
        assert!(jitter_mask(&labels, &options, &mut rng).is_err());
    }
}
