//! Randomized 3D affine composition.
//!
//! Every primitive here is expressed as a 4x4 homogeneous matrix mapping
//! output-space voxel coordinates to input-space coordinates. Rotation,
//! shear, reflection and the Gaussian "other" affine are re-centered with
//! [`Affine::fix_point`] so they leave the anchor (the center of the output
//! crop window) unmoved; translation and crop are the only primitives that
//! move it.

use std::ops::Mul;

use rand::Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A point or per-axis vector in voxel coordinates (x, y, z).
pub type Point3 = [f64; 3];

/// Homogeneous 4x4 affine matrix. The bottom row is always `[0, 0, 0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Affine {
    m: [[f64; 4]; 4],
}

impl Default for Affine {
    fn default() -> Self {
        Self::identity()
    }
}

impl Affine {
    /// The identity transform.
    pub const fn identity() -> Self {
        Self {
            m: [
                [1.0, 0.0, 0.0, 0.0],
                [0.0, 1.0, 0.0, 0.0],
                [0.0, 0.0, 1.0, 0.0],
                [0.0, 0.0, 0.0, 1.0],
            ],
        }
    }

    /// Build from the top 3x4 block; the homogeneous row is implied.
    pub const fn from_rows(rows: [[f64; 4]; 3]) -> Self {
        Self {
            m: [rows[0], rows[1], rows[2], [0.0, 0.0, 0.0, 1.0]],
        }
    }

    /// Embed a 3x3 linear map with zero translation.
    pub fn from_linear(lin: [[f64; 3]; 3]) -> Self {
        let mut out = Self::identity();
        for (row, lin_row) in out.m.iter_mut().zip(lin.iter()) {
            row[..3].copy_from_slice(lin_row);
        }
        out
    }

    /// Pure translation by `t`.
    pub fn translation(t: Point3) -> Self {
        let mut out = Self::identity();
        for (row, &v) in out.m.iter_mut().zip(t.iter()) {
            row[3] = v;
        }
        out
    }

    /// Axis-aligned scaling with the given diagonal.
    pub fn diagonal(d: Point3) -> Self {
        let mut out = Self::identity();
        for (i, &v) in d.iter().enumerate() {
            out.m[i][i] = v;
        }
        out
    }

    /// The full homogeneous matrix.
    pub const fn as_4x4(&self) -> &[[f64; 4]; 4] {
        &self.m
    }

    /// The top three rows, as handed to a warp executor.
    pub const fn to_3x4(&self) -> [[f64; 4]; 3] {
        [self.m[0], self.m[1], self.m[2]]
    }

    /// The 3x3 linear part.
    pub fn linear(&self) -> [[f64; 3]; 3] {
        let mut lin = [[0.0; 3]; 3];
        for (dst, src) in lin.iter_mut().zip(self.m.iter()) {
            dst.copy_from_slice(&src[..3]);
        }
        lin
    }

    /// The translation column.
    pub const fn offset(&self) -> Point3 {
        [self.m[0][3], self.m[1][3], self.m[2][3]]
    }

    /// Matrix product `self · inner`: `inner` is applied first.
    pub fn compose(&self, inner: &Self) -> Self {
        let mut out = [[0.0; 4]; 4];
        for (i, out_row) in out.iter_mut().enumerate() {
            for (j, cell) in out_row.iter_mut().enumerate() {
                *cell = (0..4).map(|k| self.m[i][k] * inner.m[k][j]).sum();
            }
        }
        Self { m: out }
    }

    /// Map a point through the transform.
    pub fn apply(&self, p: Point3) -> Point3 {
        let mut out = [0.0; 3];
        for (o, row) in out.iter_mut().zip(self.m.iter()) {
            *o = row[0] * p[0] + row[1] * p[1] + row[2] * p[2] + row[3];
        }
        out
    }

    /// Replace the translation so the transform maps `anchor` to itself.
    ///
    /// The linear part is preserved: `t = anchor - L·anchor`.
    pub fn fix_point(&self, anchor: Point3) -> Self {
        let mut out = *self;
        for (i, row) in out.m.iter_mut().take(3).enumerate() {
            let moved: f64 = (0..3).map(|k| self.m[i][k] * anchor[k]).sum();
            row[3] = anchor[i] - moved;
        }
        out
    }

    /// True when every entry is finite.
    pub fn is_finite(&self) -> bool {
        self.m.iter().flatten().all(|v| v.is_finite())
    }
}

impl Mul for Affine {
    type Output = Self;

    fn mul(self, rhs: Self) -> Self {
        self.compose(&rhs)
    }
}

/// Elementary rotations about x, then y, then z, combined by successive
/// right-multiplication. Angles are in degrees.
pub fn rotation(degrees: Point3) -> Affine {
    let mut lin = [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]];
    for (axis, &deg) in degrees.iter().enumerate() {
        let rad = deg.to_radians();
        let (a, b) = match axis {
            0 => (1, 2),
            1 => (0, 2),
            _ => (0, 1),
        };
        let mut rot = [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]];
        rot[a][a] = rad.cos();
        rot[a][b] = -rad.sin();
        rot[b][a] = rad.sin();
        rot[b][b] = rad.cos();
        lin = mul3(&lin, &rot);
    }
    Affine::from_linear(lin)
}

/// Per-axis scaling by the (already inverted, where drawn) shear factors.
pub fn shear(factors: Point3) -> Affine {
    Affine::diagonal(factors)
}

/// Diagonal of `-1` on reflected axes, `+1` elsewhere.
pub fn reflection(reflect: [bool; 3]) -> Affine {
    Affine::diagonal(reflect.map(|r| if r { -1.0 } else { 1.0 }))
}

/// Identity plus additive perturbation of the top 3x4 block.
pub fn perturbation(noise: [[f64; 4]; 3]) -> Affine {
    let id = Affine::identity().to_3x4();
    let mut rows = [[0.0; 4]; 3];
    for i in 0..3 {
        for j in 0..4 {
            rows[i][j] = id[i][j] + noise[i][j];
        }
    }
    Affine::from_rows(rows)
}

fn mul3(a: &[[f64; 3]; 3], b: &[[f64; 3]; 3]) -> [[f64; 3]; 3] {
    let mut out = [[0.0; 3]; 3];
    for (i, row) in out.iter_mut().enumerate() {
        for (j, cell) in row.iter_mut().enumerate() {
            *cell = (0..3).map(|k| a[i][k] * b[k][j]).sum();
        }
    }
    out
}

/// One concrete draw of every geometric parameter.
///
/// Constructing this directly gives a deterministic transform; [`AffineRanges::draw`]
/// produces it from random ranges.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AffineParams {
    /// Rotation angle about each axis, in degrees.
    pub rotation_deg: Point3,
    /// Applied per-axis shear factors (always positive).
    pub shear: Point3,
    /// Axes to reflect.
    pub reflect: [bool; 3],
    /// Additive noise on the identity 3x4 block.
    pub other: [[f64; 4]; 3],
    /// Translation in voxels.
    pub translation: Point3,
}

impl Default for AffineParams {
    fn default() -> Self {
        Self::identity()
    }
}

impl AffineParams {
    /// Parameters producing the identity map.
    pub const fn identity() -> Self {
        Self {
            rotation_deg: [0.0; 3],
            shear: [1.0; 3],
            reflect: [false; 3],
            other: [[0.0; 4]; 3],
            translation: [0.0; 3],
        }
    }

    /// Compose the full output-to-input transform.
    ///
    /// Order is `crop · translate · rotate · shear · reflect · other`, with
    /// every non-translation primitive fixing `anchor`.
    pub fn compose(&self, anchor: Point3, crop_start: Point3) -> Affine {
        let crop = Affine::translation(crop_start);
        let translate = Affine::translation(self.translation);
        let rotate = rotation(self.rotation_deg).fix_point(anchor);
        let scale = shear(self.shear).fix_point(anchor);
        let reflect = reflection(self.reflect).fix_point(anchor);
        let other = perturbation(self.other).fix_point(anchor);

        crop * (translate * (rotate * (scale * (reflect * other))))
    }
}

/// Declarative ranges from which [`AffineParams`] are drawn.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AffineRanges {
    /// Uniform rotation in `[-max, max]` degrees per axis.
    pub rotation_max: Point3,
    /// Per-axis reflection probability.
    pub reflect_prob: Point3,
    /// Shear bounds; factors are drawn from `N(1, bound / 4)`. `None` disables shear.
    pub shear_max: Option<Point3>,
    /// Uniform translation in `[-max, max]` voxels per axis.
    pub translation_max: Point3,
    /// Standard deviation of the Gaussian affine perturbation.
    pub other_scale: f64,
}

impl Default for AffineRanges {
    fn default() -> Self {
        Self {
            rotation_max: [0.0; 3],
            reflect_prob: [0.0; 3],
            shear_max: None,
            translation_max: [0.0; 3],
            other_scale: 0.0,
        }
    }
}

impl AffineRanges {
    /// Check every range. Performed before any randomness is consumed.
    pub fn validate(&self) -> Result<()> {
        check_bounds(&self.rotation_max, "rotation_max")?;
        check_bounds(&self.translation_max, "translation_max")?;
        for (axis, &p) in self.reflect_prob.iter().enumerate() {
            if !(0.0..=1.0).contains(&p) {
                return Err(Error::Configuration(format!(
                    "reflect_prob[{}] must be between 0.0 and 1.0 (got {})",
                    axis, p
                )));
            }
        }
        if let Some(shear_max) = self.shear_max {
            for (axis, &s) in shear_max.iter().enumerate() {
                // Written as a negated comparison so NaN is rejected too.
                if !(s > 0.0) || !s.is_finite() {
                    return Err(Error::Configuration(format!(
                        "shear_max[{}] must be positive (got {})",
                        axis, s
                    )));
                }
            }
        }
        if !(self.other_scale >= 0.0) || !self.other_scale.is_finite() {
            return Err(Error::Configuration(format!(
                "other_scale must be non-negative (got {})",
                self.other_scale
            )));
        }
        Ok(())
    }

    /// Draw one set of geometric parameters.
    pub fn draw<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<AffineParams> {
        self.validate()?;

        let rotation_deg = self.rotation_max.map(|max| symmetric_uniform(rng, max));

        let shear = match self.shear_max {
            Some(bounds) => {
                let mut factors = [1.0; 3];
                for (f, &bound) in factors.iter_mut().zip(bounds.iter()) {
                    *f = positive_normal(rng, 1.0, bound / 4.0)?;
                }
                for f in &mut factors {
                    if rng.gen::<f64>() < 0.5 {
                        *f = 1.0 / *f;
                    }
                }
                factors
            }
            None => [1.0; 3],
        };

        let reflect = self.reflect_prob.map(|p| rng.gen::<f64>() < p);

        let normal = Normal::new(0.0, self.other_scale)
            .map_err(|e| Error::Configuration(format!("other_scale: {}", e)))?;
        let mut other = [[0.0; 4]; 3];
        for cell in other.iter_mut().flatten() {
            *cell = normal.sample(rng);
        }

        let translation = self.translation_max.map(|max| symmetric_uniform(rng, max));

        Ok(AffineParams {
            rotation_deg,
            shear,
            reflect,
            other,
            translation,
        })
    }

    /// Draw parameters and compose them around `anchor`, offset by `crop_start`.
    pub fn compose<R: Rng + ?Sized>(
        &self,
        anchor: Point3,
        crop_start: Point3,
        rng: &mut R,
    ) -> Result<(Affine, AffineParams)> {
        let params = self.draw(rng)?;
        Ok((params.compose(anchor, crop_start), params))
    }
}

fn check_bounds(bounds: &Point3, name: &str) -> Result<()> {
    for (axis, &b) in bounds.iter().enumerate() {
        if !(b >= 0.0) || !b.is_finite() {
            return Err(Error::Configuration(format!(
                "{}[{}] must be a finite non-negative bound (got {})",
                name, axis, b
            )));
        }
    }
    Ok(())
}

fn symmetric_uniform<R: Rng + ?Sized>(rng: &mut R, max: f64) -> f64 {
    if max == 0.0 {
        return 0.0;
    }
    rng.gen_range(-max..=max)
}

/// Gaussian draw restricted to positive values by rejection.
fn positive_normal<R: Rng + ?Sized>(rng: &mut R, mean: f64, std: f64) -> Result<f64> {
    let normal = Normal::new(mean, std)
        .map_err(|e| Error::Configuration(format!("shear_max: {}", e)))?;
    loop {
        let v = normal.sample(rng);
        if v > 0.0 {
            return Ok(v);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    const ANCHOR: Point3 = [7.5, 3.0, 11.25];

    fn assert_point_eq(a: Point3, b: Point3) {
        for i in 0..3 {
            assert!((a[i] - b[i]).abs() < 1e-9, "{:?} != {:?}", a, b);
        }
    }

    fn wide_ranges() -> AffineRanges {
        AffineRanges {
            rotation_max: [30.0, 45.0, 90.0],
            reflect_prob: [0.5, 0.5, 0.5],
            shear_max: Some([1.5, 1.0, 2.0]),
            translation_max: [5.0, 5.0, 5.0],
            other_scale: 0.1,
        }
    }

    #[test]
    fn test_fix_point_preserves_linear_part() {
        let m = rotation([10.0, 20.0, 30.0]);
        let fixed = m.fix_point(ANCHOR);
        assert_eq!(fixed.linear(), m.linear());
        assert_point_eq(fixed.apply(ANCHOR), ANCHOR);
        assert_eq!(fixed.as_4x4()[3], [0.0, 0.0, 0.0, 1.0]);
    }

    #[test]
    fn test_primitives_fix_anchor_for_all_draws() {
        let ranges = wide_ranges();
        for seed in 0..200 {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            let p = ranges.draw(&mut rng).unwrap();
            for m in [
                rotation(p.rotation_deg),
                shear(p.shear),
                reflection(p.reflect),
                perturbation(p.other),
            ] {
                assert_point_eq(m.fix_point(ANCHOR).apply(ANCHOR), ANCHOR);
            }
        }
    }

    #[test]
    fn test_composed_anchor_moves_by_translation_plus_crop() {
        let ranges = wide_ranges();
        let crop = [2.0, 4.0, 6.0];
        for seed in 0..50 {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            let (m, p) = ranges.compose(ANCHOR, crop, &mut rng).unwrap();
            let expected = [
                ANCHOR[0] + p.translation[0] + crop[0],
                ANCHOR[1] + p.translation[1] + crop[1],
                ANCHOR[2] + p.translation[2] + crop[2],
            ];
            assert_point_eq(m.apply(ANCHOR), expected);
        }
    }

    #[test]
    fn test_composition_order_is_exact() {
        let p = AffineParams {
            rotation_deg: [12.0, -7.0, 33.0],
            shear: [1.2, 0.8, 1.1],
            reflect: [true, false, true],
            other: [
                [0.01, -0.02, 0.03, 0.5],
                [0.0, 0.02, -0.01, -0.25],
                [0.04, 0.0, 0.01, 0.1],
            ],
            translation: [1.0, -2.0, 3.0],
        };
        let crop = [4.0, 0.0, 2.5];
        let expected = Affine::translation(crop)
            .compose(&Affine::translation(p.translation))
            .compose(&rotation(p.rotation_deg).fix_point(ANCHOR))
            .compose(&shear(p.shear).fix_point(ANCHOR))
            .compose(&reflection(p.reflect).fix_point(ANCHOR))
            .compose(&perturbation(p.other).fix_point(ANCHOR));
        let composed = p.compose(ANCHOR, crop);
        for (a, b) in composed.as_4x4().iter().flatten().zip(expected.as_4x4().iter().flatten()) {
            assert!((a - b).abs() < 1e-12);
        }

        // Swapping rotation and shear must change the result.
        let swapped = Affine::translation(crop)
            .compose(&Affine::translation(p.translation))
            .compose(&shear(p.shear).fix_point(ANCHOR))
            .compose(&rotation(p.rotation_deg).fix_point(ANCHOR))
            .compose(&reflection(p.reflect).fix_point(ANCHOR))
            .compose(&perturbation(p.other).fix_point(ANCHOR));
        let diff: f64 = composed
            .as_4x4()
            .iter()
            .flatten()
            .zip(swapped.as_4x4().iter().flatten())
            .map(|(a, b)| (a - b).abs())
            .sum();
        assert!(diff > 1e-6);
    }

    #[test]
    fn test_shear_factors_positive() {
        let ranges = AffineRanges {
            shear_max: Some([4.0, 4.0, 4.0]),
            ..AffineRanges::default()
        };
        for seed in 0..500 {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            let p = ranges.draw(&mut rng).unwrap();
            for &f in &p.shear {
                assert!(f > 0.0 && f.is_finite());
            }
            let m = shear(p.shear);
            for i in 0..3 {
                assert!(m.as_4x4()[i][i] > 0.0);
            }
        }
    }

    #[test]
    fn test_non_positive_shear_rejected() {
        for bad in [0.0, -1.0, f64::NAN] {
            let ranges = AffineRanges {
                shear_max: Some([1.0, bad, 1.0]),
                ..AffineRanges::default()
            };
            let err = ranges.validate().unwrap_err();
            assert!(err.to_string().contains("shear_max[1] must be positive"));
        }
    }

    #[test]
    fn test_default_ranges_draw_identity() {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let (m, p) = AffineRanges::default()
            .compose(ANCHOR, [0.0; 3], &mut rng)
            .unwrap();
        assert_eq!(p, AffineParams::identity());
        assert_eq!(m.to_3x4(), Affine::identity().to_3x4());
    }

    #[test]
    fn test_rotation_about_z() {
        // 90 degrees about axis 2 rotates within the (0, 1) plane.
        let m = rotation([0.0, 0.0, 90.0]);
        assert_point_eq(m.apply([1.0, 0.0, 0.0]), [0.0, 1.0, 0.0]);
        assert_point_eq(m.apply([0.0, 0.0, 1.0]), [0.0, 0.0, 1.0]);
    }

    #[test]
    fn test_reflection_diagonal() {
        let m = reflection([true, false, true]);
        assert_point_eq(m.apply([1.0, 2.0, 3.0]), [-1.0, 2.0, -3.0]);
    }
}
