//! CPU resampling shared by both built-in backends.

use ndarray::{Array3, ArrayView3};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use rayon::prelude::*;

use super::WarpJob;
use crate::error::{Error, Result};
use crate::transforms::affine::Point3;
use crate::transforms::Interpolation;

/// Warp one job. Output is C-ordered with shape `job.shape`.
///
/// Each x-slab draws noise from its own stream seeded with
/// `noise_seed + x`, which keeps sequential and parallel output identical.
pub(super) fn warp(job: &WarpJob, noise_seed: u64, parallel: bool) -> Result<Array3<f32>> {
    let [nx, ny, nz] = job.shape;
    let slab = ny * nz;
    let normal = if job.noise_std > 0.0 {
        Some(
            Normal::new(0.0, job.noise_std)
                .map_err(|e| Error::executor("resolve", format!("noise: {}", e)))?,
        )
    } else {
        None
    };

    let volume = job.volume.view();
    let fill = |(x, out): (usize, &mut [f32])| {
        let mut rng = ChaCha8Rng::seed_from_u64(noise_seed.wrapping_add(x as u64));
        fill_slab(job, &volume, normal.as_ref(), &mut rng, x, out);
    };

    let mut output = vec![0.0f32; nx * slab];
    if parallel {
        output.par_chunks_mut(slab).enumerate().for_each(fill);
    } else {
        output.chunks_mut(slab).enumerate().for_each(fill);
    }

    Array3::from_shape_vec((nx, ny, nz), output).map_err(|e| {
        Error::executor("resolve", format!("failed to create output array: {}", e))
    })
}

fn fill_slab(
    job: &WarpJob,
    volume: &ArrayView3<'_, f32>,
    normal: Option<&Normal<f64>>,
    rng: &mut ChaCha8Rng,
    x: usize,
    out: &mut [f32],
) {
    let nz = job.shape[2];
    for (idx, voxel) in out.iter_mut().enumerate() {
        let (y, z) = (idx / nz, idx % nz);
        if job.occlusion.contains(z as i64) {
            *voxel = 0.0;
            continue;
        }
        let src = job.affine.apply([x as f64, y as f64, z as f64]);
        let sampled = match job.interpolation {
            Interpolation::Trilinear => sample_trilinear(volume, src),
            Interpolation::Nearest => sample_nearest(volume, src),
        };
        *voxel = match sampled {
            Some(v) => {
                let noisy = match normal {
                    Some(n) => v + n.sample(rng),
                    None => v,
                };
                job.window.clip(noisy) as f32
            }
            None => 0.0,
        };
    }
}

/// Trilinear sample; `None` when `p` lies outside `[0, n - 1]` on any axis.
fn sample_trilinear(volume: &ArrayView3<'_, f32>, p: Point3) -> Option<f64> {
    let (dx, dy, dz) = volume.dim();
    let dims = [dx, dy, dz];
    let mut lo = [0usize; 3];
    let mut hi = [0usize; 3];
    let mut frac = [0.0f64; 3];
    for axis in 0..3 {
        let c = p[axis];
        let last = (dims[axis] - 1) as f64;
        if !(c >= 0.0 && c <= last) {
            return None;
        }
        let base = c.floor();
        lo[axis] = base as usize;
        hi[axis] = (lo[axis] + 1).min(dims[axis] - 1);
        frac[axis] = c - base;
    }

    let mut acc = 0.0f64;
    for corner in 0..8 {
        let mut weight = 1.0f64;
        let mut idx = [0usize; 3];
        for axis in 0..3 {
            if corner & (1 << axis) != 0 {
                idx[axis] = hi[axis];
                weight *= frac[axis];
            } else {
                idx[axis] = lo[axis];
                weight *= 1.0 - frac[axis];
            }
        }
        if weight != 0.0 {
            acc += weight * f64::from(volume[idx]);
        }
    }
    Some(acc)
}

/// Nearest-neighbour sample, rounding half up.
///
/// Shares the `[0, n - 1]` domain of [`sample_trilinear`], so an image voxel
/// and its label are always out of bounds together.
fn sample_nearest(volume: &ArrayView3<'_, f32>, p: Point3) -> Option<f64> {
    let (dx, dy, dz) = volume.dim();
    let dims = [dx, dy, dz];
    let mut idx = [0usize; 3];
    for axis in 0..3 {
        let c = p[axis];
        if !(c >= 0.0 && c <= (dims[axis] - 1) as f64) {
            return None;
        }
        idx[axis] = (c + 0.5).floor() as usize;
    }
    Some(f64::from(volume[idx]))
}
