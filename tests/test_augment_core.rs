//! End-to-end tests for batch augmentation.
//!
//! These go through the public API only: builder, config, built-in
//! executors and a custom executor.

use std::io::Write;

use ndarray::{Array3, Array4, ArrayD, Ix3};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tempfile::NamedTempFile;
use warpaug::error::Error;
use warpaug::warp::Backend;
use warpaug::{
    jitter_mask, AffineAugmentBuilder, AugmentConfig, JitterOptions, JobHandle, WarpExecutor,
    WarpJob,
};

/// Volume whose values encode their own index.
fn ramp(shape: (usize, usize, usize)) -> Array3<f32> {
    Array3::from_shape_fn(shape, |(i, j, k)| (i * 100 + j * 10 + k) as f32)
}

fn labels_235(shape: (usize, usize, usize)) -> Array3<i32> {
    let labels = [2, 3, 5];
    Array3::from_shape_fn(shape, |(i, j, k)| labels[(i + 2 * j + k) % 3])
}

#[test]
fn test_default_config_is_identity() {
    let image = ramp((6, 5, 4));
    let seg = labels_235((6, 5, 4));
    let out = AffineAugmentBuilder::new()
        .seed(3)
        .augment(
            &[image.clone().into_dyn()],
            Some(std::slice::from_ref(&seg)),
            None,
        )
        .unwrap();
    assert_eq!(out.images[0], image.into_dyn());
    assert_eq!(out.segmentations.unwrap()[0], seg);
    assert_eq!(out.crops, vec![[0.0, 0.0, 0.0]]);
}

#[test]
fn test_label_shift_keeps_labels_and_marks_out_of_bounds() {
    let image = ramp((8, 8, 8)).into_dyn();
    let seg = labels_235((8, 8, 8));
    let out = AffineAugmentBuilder::new()
        .seed(42)
        .rotation_max([20.0, 20.0, 20.0])
        .translation_max([3.0, 3.0, 3.0])
        .oob_label(9)
        .augment(
            std::slice::from_ref(&image),
            Some(std::slice::from_ref(&seg)),
            None,
        )
        .unwrap();
    let aug = &out.segmentations.unwrap()[0];
    assert!(aug.iter().all(|l| [2, 3, 5, 9].contains(l)));
}

#[test]
fn test_multichannel_identity() {
    let image = Array4::from_shape_fn((4, 4, 4, 2), |(i, j, k, c)| {
        (i * 1000 + j * 100 + k * 10 + c) as f32
    })
    .into_dyn();
    let out = AffineAugmentBuilder::new()
        .backend(Backend::Parallel)
        .augment(std::slice::from_ref(&image), None, None)
        .unwrap();
    assert_eq!(out.images[0].shape(), &[4, 4, 4, 2]);
    assert_eq!(out.images[0], image);
}

#[test]
fn test_default_window_does_not_clip() {
    let mut vol = Array3::<f32>::zeros((3, 3, 3));
    vol[[0, 0, 0]] = 1.0e30;
    vol[[1, 1, 1]] = -1.0e30;
    let image = vol.into_dyn();
    let out = AffineAugmentBuilder::new()
        .augment(std::slice::from_ref(&image), None, None)
        .unwrap();
    assert_eq!(out.images[0], image);
}

#[test]
fn test_random_crop_with_equal_shapes_starts_at_origin() {
    let image = ramp((5, 5, 5)).into_dyn();
    let out = AffineAugmentBuilder::new()
        .seed(7)
        .random_crop(true)
        .augment(&[image.clone(), image], None, None)
        .unwrap();
    assert_eq!(out.crops, vec![[0.0; 3], [0.0; 3]]);
}

#[test]
fn test_crop_to_smaller_shape() {
    let image = ramp((10, 8, 6)).into_dyn();
    let out = AffineAugmentBuilder::new()
        .crop_offset([2.0, 1.0, 3.0])
        .augment(std::slice::from_ref(&image), None, Some(&[vec![4, 4, 3]]))
        .unwrap();
    let img = out.images[0].view().into_dimensionality::<Ix3>().unwrap();
    assert_eq!(img.dim(), (4, 4, 3));
    assert_eq!(img[[0, 0, 0]], 213.0);
    assert_eq!(img[[3, 3, 2]], 545.0);
    assert_eq!(out.crops, vec![[2.0, 1.0, 3.0]]);
}

#[test]
fn test_same_seed_reproduces_batch() {
    let image = ramp((8, 8, 8)).into_dyn();
    let seg = labels_235((8, 8, 8));
    let builder = AffineAugmentBuilder::new()
        .seed(1234)
        .rotation_max([15.0, 15.0, 15.0])
        .reflect_prob([0.5, 0.5, 0.5])
        .shear_max([0.1, 0.1, 0.1])
        .translation_max([2.0, 2.0, 2.0])
        .noise_level(5.0)
        .occlude_prob(0.5)
        .window_min(0.0, 50.0)
        .window_max(400.0, 800.0);
    let segs = std::slice::from_ref(&seg);
    let a = builder
        .augment(std::slice::from_ref(&image), Some(segs), None)
        .unwrap();
    let b = builder
        .augment(std::slice::from_ref(&image), Some(segs), None)
        .unwrap();
    assert_eq!(a.images, b.images);
    assert_eq!(a.segmentations, b.segmentations);
    assert_eq!(a.crops, b.crops);
}

#[test]
fn test_backends_produce_identical_batches() {
    let image = ramp((9, 7, 5)).into_dyn();
    let builder = AffineAugmentBuilder::new()
        .seed(5)
        .rotation_max([30.0, 10.0, 10.0])
        .noise_level(2.0);
    let seq = builder
        .clone()
        .backend(Backend::Sequential)
        .augment(std::slice::from_ref(&image), None, None)
        .unwrap();
    let par = builder
        .backend(Backend::Parallel)
        .augment(std::slice::from_ref(&image), None, None)
        .unwrap();
    assert_eq!(seq.images, par.images);
}

#[test]
fn test_crop_offset_with_random_crop_fails_fast() {
    let image = ramp((4, 4, 4)).into_dyn();
    let err = AffineAugmentBuilder::new()
        .random_crop(true)
        .crop_offset([1.0, 1.0, 1.0])
        .augment(std::slice::from_ref(&image), None, None)
        .unwrap_err();
    assert!(matches!(err, Error::Configuration(_)));
}

#[test]
fn test_non_positive_shear_fails_fast() {
    let image = ramp((4, 4, 4)).into_dyn();
    let err = AffineAugmentBuilder::new()
        .shear_max([0.1, 0.0, 0.1])
        .augment(std::slice::from_ref(&image), None, None)
        .unwrap_err();
    assert!(err.to_string().contains("shear_max[1] must be positive"));
}

#[test]
fn test_mismatched_list_lengths_fail_fast() {
    let image = ramp((4, 4, 4)).into_dyn();
    let segs = vec![Array3::<i32>::zeros((4, 4, 4)); 2];
    let err = AffineAugmentBuilder::new()
        .augment(std::slice::from_ref(&image), Some(&segs), None)
        .unwrap_err();
    assert!(err.to_string().contains("same number of elements"));
}

#[test]
fn test_unknown_backend_string() {
    let err = "cuda".parse::<Backend>().unwrap_err();
    assert!(err.to_string().contains("Unrecognized backend"));
    assert!(AugmentConfig::from_json_str(r#"{"backend": "cuda"}"#).is_err());
}

#[test]
fn test_config_from_file() {
    let mut file = NamedTempFile::new().unwrap();
    write!(
        file,
        r#"{{"seed": 17, "translation_max": [1.0, 2.0, 3.0], "oob_image_value": -1.5}}"#
    )
    .unwrap();
    let config = AugmentConfig::from_json_file(file.path()).unwrap();
    assert_eq!(config.seed, Some(17));
    assert_eq!(config.translation_max, [1.0, 2.0, 3.0]);
    assert_eq!(config.oob_image_value, Some(-1.5));
    assert!(config.remaps_oob());

    let builder = AffineAugmentBuilder::from_config(config.clone());
    assert_eq!(builder.config(), &config);
}

#[test]
fn test_invalid_config_file_rejected() {
    let mut file = NamedTempFile::new().unwrap();
    write!(file, r#"{{"random_crop": true, "crop_offset": [0.0, 0.0, 0.0]}}"#).unwrap();
    assert!(AugmentConfig::from_json_file(file.path()).is_err());
    assert!(matches!(
        AugmentConfig::from_json_file("/nonexistent/warpaug.json"),
        Err(Error::Io(_))
    ));
}

#[test]
fn test_crops_returned_per_sample() {
    let big = ramp((10, 10, 10)).into_dyn();
    let out = AffineAugmentBuilder::new()
        .seed(9)
        .random_crop(true)
        .augment(
            &[big.clone(), big.clone(), big],
            None,
            Some(&[vec![4, 4, 4], vec![6, 6, 6], vec![10, 10, 10]]),
        )
        .unwrap();
    assert_eq!(out.crops.len(), 3);
    for (crop, limit) in out.crops.iter().zip([6.0, 4.0, 0.0]) {
        assert!(crop.iter().all(|&c| (0.0..=limit).contains(&c)));
    }
    assert_eq!(out.crops[2], [0.0; 3]);
}

#[test]
fn test_jitter_mask_public_api() {
    let labels = Array3::from_shape_fn((7, 7, 7), |(i, j, k)| {
        if (2..=4).contains(&i) && (2..=4).contains(&j) && (2..=4).contains(&k) {
            -1
        } else {
            1
        }
    });
    let options = JitterOptions {
        p_quit: 0.0,
        p_jagged: 0.0,
        ..JitterOptions::default()
    };
    let mut rng = ChaCha8Rng::seed_from_u64(0);
    let out = jitter_mask(&labels, &options, &mut rng).unwrap();
    let invalid = out.iter().filter(|&&l| l == -1).count();
    // Smooth mode either erodes the cube to its centre or dilates it by one shell.
    assert!(invalid == 1 || invalid == 27 + 54);
    assert!(out.iter().all(|&l| l == -1 || l == 0 || l == 1));
}

/// Executor that negates every volume.
#[derive(Default)]
struct NegatingExecutor {
    staged: Vec<Option<WarpJob>>,
    resolved: Vec<u64>,
}

impl WarpExecutor for NegatingExecutor {
    fn stage(&mut self, job: WarpJob) -> warpaug::Result<JobHandle> {
        self.staged.push(Some(job));
        Ok(JobHandle::new(self.staged.len() as u64 - 1))
    }

    fn resolve(&mut self, handle: JobHandle) -> warpaug::Result<Array3<f32>> {
        let job = self
            .staged
            .get_mut(handle.id() as usize)
            .and_then(Option::take)
            .ok_or_else(|| Error::Executor {
                operation: "resolve".into(),
                reason: format!("unknown handle {}", handle.id()),
            })?;
        self.resolved.push(handle.id());
        Ok(job.volume.mapv(|v| -v))
    }
}

#[test]
fn test_custom_executor() {
    let image: ArrayD<f32> = ramp((3, 3, 3)).into_dyn();
    let mut exec = NegatingExecutor::default();
    let out = AffineAugmentBuilder::new()
        .augment_with(&mut exec, &[image.clone(), image.clone()], None, None)
        .unwrap();
    assert_eq!(exec.staged.len(), 2);
    assert!(exec.staged.iter().all(Option::is_none));
    assert_eq!(exec.resolved, vec![0, 1]);
    assert_eq!(out.images[1], image.mapv(|v| -v));
}
