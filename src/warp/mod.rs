//! Warp executors.
//!
//! An executor accepts per-channel warp jobs and later hands back the
//! resampled volumes. The protocol is explicitly two-phase: [`WarpExecutor::stage`]
//! enqueues a job and returns a [`JobHandle`], [`WarpExecutor::resolve`] turns
//! a handle into its output. A GPU binding implements the same trait; the
//! crate ships a CPU executor with a sequential and a rayon backend.

mod resample;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use ndarray::Array3;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::{Error, Result};
use crate::transforms::affine::Affine;
use crate::transforms::params::{Occlusion, Window};
use crate::transforms::{get_rng, Interpolation};

/// One channel's warp request.
#[derive(Debug, Clone)]
pub struct WarpJob {
    /// Input volume for a single channel.
    pub volume: Array3<f32>,
    /// Output-to-input affine.
    pub affine: Affine,
    /// Sampling mode.
    pub interpolation: Interpolation,
    /// Output spatial shape.
    pub shape: [usize; 3],
    /// Standard deviation of additive Gaussian noise.
    pub noise_std: f64,
    /// Intensity window applied after noise.
    pub window: Window,
    /// Output slab along axis 2 set to zero.
    pub occlusion: Occlusion,
}

impl WarpJob {
    /// A job with no noise, no windowing and no occlusion.
    pub fn new(
        volume: Array3<f32>,
        affine: Affine,
        interpolation: Interpolation,
        shape: [usize; 3],
    ) -> Self {
        Self {
            volume,
            affine,
            interpolation,
            shape,
            noise_std: 0.0,
            window: Window::UNBOUNDED,
            occlusion: Occlusion::NONE,
        }
    }

    /// Set the noise standard deviation.
    pub fn with_noise(mut self, std: f64) -> Self {
        self.noise_std = std;
        self
    }

    /// Set the intensity window.
    pub fn with_window(mut self, window: Window) -> Self {
        self.window = window;
        self
    }

    /// Set the occluded slab.
    pub fn with_occlusion(mut self, occlusion: Occlusion) -> Self {
        self.occlusion = occlusion;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.volume.is_empty() {
            return Err(Error::executor(
                "stage",
                format!("input volume {:?} is empty", self.volume.dim()),
            ));
        }
        if self.shape.contains(&0) {
            return Err(Error::executor(
                "stage",
                format!("output shape {:?} has a zero dimension", self.shape),
            ));
        }
        if !self.affine.is_finite() {
            return Err(Error::InvalidAffine(format!(
                "non-finite matrix {:?}",
                self.affine.to_3x4()
            )));
        }
        if !(self.noise_std >= 0.0) || !self.noise_std.is_finite() {
            return Err(Error::executor(
                "stage",
                format!("noise std must be non-negative (got {})", self.noise_std),
            ));
        }
        Ok(())
    }
}

/// Ticket for a staged job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobHandle(u64);

impl JobHandle {
    /// Wrap an executor-assigned identifier.
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Identifier assigned at staging time.
    pub const fn id(self) -> u64 {
        self.0
    }
}

/// Two-phase warp executor.
pub trait WarpExecutor {
    /// Enqueue a job.
    fn stage(&mut self, job: WarpJob) -> Result<JobHandle>;

    /// Produce the output of a staged job, consuming its handle.
    fn resolve(&mut self, handle: JobHandle) -> Result<Array3<f32>>;
}

impl<E: WarpExecutor + ?Sized> WarpExecutor for &mut E {
    fn stage(&mut self, job: WarpJob) -> Result<JobHandle> {
        (**self).stage(job)
    }

    fn resolve(&mut self, handle: JobHandle) -> Result<Array3<f32>> {
        (**self).resolve(handle)
    }
}

/// Built-in executor backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Resolve on the calling thread.
    #[default]
    Sequential,
    /// Resolve with rayon, one x-slab per task.
    Parallel,
}

impl Backend {
    /// Create an executor for this backend.
    pub fn executor(self, seed: Option<u64>) -> CpuExecutor {
        CpuExecutor::new(self, seed)
    }
}

impl FromStr for Backend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "cpu" | "sequential" => Ok(Self::Sequential),
            "rayon" | "parallel" => Ok(Self::Parallel),
            other => Err(Error::Configuration(format!(
                "Unrecognized backend: {} (expected 'sequential' or 'parallel')",
                other
            ))),
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sequential => write!(f, "sequential"),
            Self::Parallel => write!(f, "parallel"),
        }
    }
}

/// Reference CPU executor.
///
/// Each staged job receives a noise seed from the executor's generator, so
/// both backends produce identical output for the same seed.
#[derive(Debug)]
pub struct CpuExecutor {
    backend: Backend,
    rng: ChaCha8Rng,
    next_id: u64,
    pending: BTreeMap<u64, (WarpJob, u64)>,
}

impl CpuExecutor {
    /// Create an executor; `seed` makes noise reproducible.
    pub fn new(backend: Backend, seed: Option<u64>) -> Self {
        Self {
            backend,
            rng: get_rng(seed),
            next_id: 0,
            pending: BTreeMap::new(),
        }
    }

    /// Backend in use.
    pub const fn backend(&self) -> Backend {
        self.backend
    }

    /// Number of staged, unresolved jobs.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

impl WarpExecutor for CpuExecutor {
    fn stage(&mut self, job: WarpJob) -> Result<JobHandle> {
        job.validate()?;
        let id = self.next_id;
        self.next_id += 1;
        let noise_seed: u64 = self.rng.gen();
        trace!(
            job = id,
            interpolation = %job.interpolation,
            shape = ?job.shape,
            "staged warp job"
        );
        self.pending.insert(id, (job, noise_seed));
        Ok(JobHandle(id))
    }

    fn resolve(&mut self, handle: JobHandle) -> Result<Array3<f32>> {
        let (job, noise_seed) = self.pending.remove(&handle.0).ok_or_else(|| {
            Error::executor(
                "resolve",
                format!("unknown or already resolved job handle {}", handle.0),
            )
        })?;
        let parallel = self.backend == Backend::Parallel;
        let out = resample::warp(&job, noise_seed, parallel)?;
        trace!(job = handle.0, backend = %self.backend, "resolved warp job");
        Ok(out)
    }
}
