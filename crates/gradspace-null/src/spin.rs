// ─────────────────────────────────────────────────────────────────────
// Gradspace — Spin Permutations
// ─────────────────────────────────────────────────────────────────────
//! Spin-test null model on spherical hemisphere representations.
//!
//! `fit` draws `n_rep` random rotations and, for every repetition, maps each
//! vertex to the original vertex nearest to its rotated position. The
//! right hemisphere receives the mirror image F·R·F of the left rotation so
//! both hemispheres spin symmetrically (or an independent mirrored rotation
//! with `unpaired_rotation`).
//!
//! `randomize` is then a gather through the stored index maps. NaN input
//! vertices stay NaN; when NaNs are present, finite vertices take the value
//! of the nearest finite vertex to their rotated position instead.

use kdtree::distance::squared_euclidean;
use kdtree::KdTree;
use ndarray::Array2;
use rayon::prelude::*;

use gradspace_types::{streams, GradientError, GradientResult, Point3, SeedStream, SpinConfig};

use crate::rotation::{random_rotation, reflect_x, rotate, Rotation};

type PointTree = KdTree<f64, usize, Point3>;

fn build_tree<'a, I>(points: I) -> GradientResult<PointTree>
where
    I: IntoIterator<Item = (usize, &'a Point3)>,
{
    let mut tree = KdTree::new(3);
    for (i, p) in points {
        tree.add(*p, i).map_err(|e| {
            GradientError::InvalidInput(format!("cannot index vertex {i} {p:?}: {e:?}"))
        })?;
    }
    Ok(tree)
}

fn nearest(tree: &PointTree, p: &Point3) -> GradientResult<usize> {
    let found = tree
        .nearest(p, 1, &squared_euclidean)
        .map_err(|e| GradientError::InvalidInput(format!("nearest-neighbour query failed: {e:?}")))?;
    found
        .first()
        .map(|&(_, &idx)| idx)
        .ok_or_else(|| GradientError::InvalidInput("empty vertex tree".to_string()))
}

/// Rotations and index maps of one hemisphere.
#[derive(Debug, Clone)]
pub struct HemisphereSpins {
    points: Vec<Point3>,
    rotations: Vec<Rotation>,
    /// `indices[rep][i]`: original vertex nearest to rotated vertex `i`.
    indices: Vec<Vec<usize>>,
}

impl HemisphereSpins {
    fn new(points: &[Point3], rotations: Vec<Rotation>, what: &str) -> GradientResult<Self> {
        if points.is_empty() {
            return Err(GradientError::InvalidInput(format!("{what} has no vertices")));
        }
        if let Some(i) = points.iter().position(|p| p.iter().any(|c| !c.is_finite())) {
            return Err(GradientError::InvalidInput(format!(
                "{what} vertex {i} has non-finite coordinates"
            )));
        }
        let tree = build_tree(points.iter().enumerate())?;
        let indices = rotations
            .par_iter()
            .map(|r| {
                points
                    .iter()
                    .map(|p| nearest(&tree, &rotate(p, r)))
                    .collect::<GradientResult<Vec<_>>>()
            })
            .collect::<GradientResult<Vec<_>>>()?;
        Ok(Self {
            points: points.to_vec(),
            rotations,
            indices,
        })
    }

    pub fn n_points(&self) -> usize {
        self.points.len()
    }

    pub fn rotations(&self) -> &[Rotation] {
        &self.rotations
    }

    /// Index map of repetition `rep`.
    pub fn indices(&self, rep: usize) -> Option<&[usize]> {
        self.indices.get(rep).map(Vec::as_slice)
    }

    fn randomize(&self, data: &[f64], what: &str) -> GradientResult<Array2<f64>> {
        let n = self.n_points();
        if data.len() != n {
            return Err(GradientError::shape(what, n, data.len()));
        }

        let rows: Vec<Vec<f64>> = if data.iter().any(|v| v.is_nan()) {
            self.randomize_with_nan(data)?
        } else {
            self.indices
                .par_iter()
                .map(|idx| idx.iter().map(|&j| data[j]).collect())
                .collect()
        };

        let mut out = Array2::zeros((rows.len(), n));
        for (mut dst, row) in out.rows_mut().into_iter().zip(rows) {
            dst.assign(&ndarray::Array1::from(row));
        }
        Ok(out)
    }

    fn randomize_with_nan(&self, data: &[f64]) -> GradientResult<Vec<Vec<f64>>> {
        let n = self.n_points();
        let finite = data.iter().filter(|v| !v.is_nan()).count();
        if finite == 0 {
            log::warn!("spin input is entirely NaN");
            return Ok(vec![vec![f64::NAN; n]; self.rotations.len()]);
        }
        log::debug!("spin input has {} NaN vertices; re-indexing finite subset", n - finite);
        let tree = build_tree(
            self.points
                .iter()
                .enumerate()
                .filter(|(i, _)| !data[*i].is_nan()),
        )?;
        self.rotations
            .par_iter()
            .map(|r| {
                self.points
                    .iter()
                    .zip(data)
                    .map(|(p, &v)| {
                        if v.is_nan() {
                            Ok(f64::NAN)
                        } else {
                            nearest(&tree, &rotate(p, r)).map(|j| data[j])
                        }
                    })
                    .collect::<GradientResult<Vec<f64>>>()
            })
            .collect()
    }
}

/// Immutable result of `SpinPermutations::fit`.
#[derive(Debug, Clone)]
pub struct FittedSpins {
    pub lh: HemisphereSpins,
    pub rh: Option<HemisphereSpins>,
    pub seed: u64,
}

/// Randomized data, one row per repetition.
#[derive(Debug, Clone, PartialEq)]
pub struct SpinSurrogates {
    pub lh: Array2<f64>,
    pub rh: Option<Array2<f64>>,
}

impl FittedSpins {
    pub fn n_rep(&self) -> usize {
        self.lh.rotations.len()
    }

    /// Spin hemisphere data through the fitted rotations.
    ///
    /// Right data requires right points at fit time. Omitting right data
    /// when right points were fitted randomizes the left hemisphere only.
    pub fn randomize(&self, lh: &[f64], rh: Option<&[f64]>) -> GradientResult<SpinSurrogates> {
        let lh_out = self.lh.randomize(lh, "left hemisphere data")?;
        let rh_out = match (rh, &self.rh) {
            (Some(data), Some(spins)) => Some(spins.randomize(data, "right hemisphere data")?),
            (Some(data), None) => {
                return Err(GradientError::shape(
                    "right hemisphere data (no right points fitted)",
                    0,
                    data.len(),
                ));
            }
            (None, _) => None,
        };
        Ok(SpinSurrogates {
            lh: lh_out,
            rh: rh_out,
        })
    }
}

/// Spin-permutation estimator.
#[derive(Debug, Clone)]
pub struct SpinPermutations {
    config: SpinConfig,
    fitted: Option<FittedSpins>,
}

impl SpinPermutations {
    pub fn new(config: SpinConfig) -> GradientResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            fitted: None,
        })
    }

    pub fn config(&self) -> &SpinConfig {
        &self.config
    }

    pub fn fitted(&self) -> Option<&FittedSpins> {
        self.fitted.as_ref()
    }

    /// Draw the rotations and precompute the index maps.
    pub fn fit(
        &mut self,
        points_lh: &[Point3],
        points_rh: Option<&[Point3]>,
    ) -> GradientResult<&FittedSpins> {
        let seeds = SeedStream::from_option(self.config.random_seed);
        let n_rep = self.config.n_rep as u64;
        let unpaired = self.config.unpaired_rotation;

        let pairs: Vec<(Rotation, Rotation)> = (0..n_rep)
            .into_par_iter()
            .map(|rep| {
                let left = random_rotation(&mut seeds.fork(rep));
                let right = if unpaired {
                    reflect_x(&random_rotation(
                        &mut seeds.fork(streams::RIGHT_HEMISPHERE + rep),
                    ))
                } else {
                    reflect_x(&left)
                };
                (left, right)
            })
            .collect();
        let (left, right): (Vec<_>, Vec<_>) = pairs.into_iter().unzip();

        let lh = HemisphereSpins::new(points_lh, left, "left hemisphere")?;
        let rh = points_rh
            .map(|points| HemisphereSpins::new(points, right, "right hemisphere"))
            .transpose()?;

        log::info!(
            "spin permutations fitted: n_rep={}, lh={}, rh={}",
            n_rep,
            lh.n_points(),
            rh.as_ref().map_or(0, HemisphereSpins::n_points)
        );
        Ok(self.fitted.insert(FittedSpins {
            lh,
            rh,
            seed: seeds.seed(),
        }))
    }

    pub fn randomize(&self, lh: &[f64], rh: Option<&[f64]>) -> GradientResult<SpinSurrogates> {
        self.fitted
            .as_ref()
            .ok_or_else(|| GradientError::InvalidInput("randomize called before fit".to_string()))?
            .randomize(lh, rh)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    /// Near-uniform points on the unit sphere.
    fn fibonacci_sphere(n: usize) -> Vec<Point3> {
        let golden = std::f64::consts::PI * (3.0 - 5.0_f64.sqrt());
        (0..n)
            .map(|i| {
                let y = 1.0 - 2.0 * (i as f64 + 0.5) / n as f64;
                let r = (1.0 - y * y).sqrt();
                let theta = golden * i as f64;
                [r * theta.cos(), y, r * theta.sin()]
            })
            .collect()
    }

    fn spins(n_rep: usize, seed: u64) -> SpinPermutations {
        SpinPermutations::new(SpinConfig {
            n_rep,
            random_seed: Some(seed),
            unpaired_rotation: false,
        })
        .unwrap()
    }

    fn variance(v: &[f64]) -> f64 {
        let mean = v.iter().sum::<f64>() / v.len() as f64;
        v.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / v.len() as f64
    }

    #[test]
    fn test_constant_field_is_unchanged() {
        let sphere = fibonacci_sphere(10);
        let mut sp = spins(5, 0);
        sp.fit(&sphere, Some(&sphere)).unwrap();
        let ones = vec![1.0; 10];
        let out = sp.randomize(&ones, Some(&ones)).unwrap();
        assert_eq!(out.lh.dim(), (5, 10));
        assert!(out.lh.iter().all(|&v| v == 1.0));
        assert!(out.rh.unwrap().iter().all(|&v| v == 1.0));
    }

    #[test]
    fn test_same_seed_same_assignments() {
        let sphere = fibonacci_sphere(60);
        let mut a = spins(8, 11);
        let mut b = spins(8, 11);
        let fa = a.fit(&sphere, Some(&sphere)).unwrap().clone();
        let fb = b.fit(&sphere, Some(&sphere)).unwrap().clone();
        for rep in 0..8 {
            assert_eq!(fa.lh.indices(rep), fb.lh.indices(rep));
            assert_eq!(
                fa.rh.as_ref().unwrap().indices(rep),
                fb.rh.as_ref().unwrap().indices(rep)
            );
        }
    }

    #[test]
    fn test_repetition_streams_independent_of_n_rep() {
        let sphere = fibonacci_sphere(40);
        let mut short = spins(3, 5);
        let mut long = spins(10, 5);
        let fs = short.fit(&sphere, None).unwrap().clone();
        let fl = long.fit(&sphere, None).unwrap().clone();
        for rep in 0..3 {
            assert_eq!(fs.lh.rotations()[rep], fl.lh.rotations()[rep]);
        }
    }

    #[test]
    fn test_variance_is_preserved() {
        let sphere = fibonacci_sphere(800);
        let data: Vec<f64> = sphere.iter().map(|p| p[1] + 0.5 * p[0]).collect();
        let mut sp = spins(20, 3);
        sp.fit(&sphere, Some(&sphere)).unwrap();
        let out = sp.randomize(&data, Some(&data)).unwrap();
        let original = variance(&data);
        let mean_var = out
            .lh
            .rows()
            .into_iter()
            .map(|row| variance(&row.to_vec()))
            .sum::<f64>()
            / 20.0;
        assert!(
            (mean_var - original).abs() < 0.1 * original,
            "surrogate variance {mean_var} vs original {original}"
        );
    }

    #[test]
    fn test_surrogates_are_permutations_of_input() {
        let sphere = fibonacci_sphere(50);
        let data: Vec<f64> = (0..50).map(|i| i as f64).collect();
        let mut sp = spins(4, 1);
        sp.fit(&sphere, None).unwrap();
        let out = sp.randomize(&data, None).unwrap();
        for row in out.lh.rows() {
            assert!(row.iter().all(|v| data.contains(v)));
        }
    }

    #[test]
    fn test_nan_positions_preserved() {
        let sphere = fibonacci_sphere(100);
        let mut data: Vec<f64> = sphere.iter().map(|p| p[2]).collect();
        for i in [3, 17, 58] {
            data[i] = f64::NAN;
        }
        let mut sp = spins(6, 2);
        sp.fit(&sphere, Some(&sphere)).unwrap();
        let out = sp.randomize(&data, Some(&data)).unwrap();
        for surrogates in [&out.lh, out.rh.as_ref().unwrap()] {
            for row in surrogates.rows() {
                for (i, v) in row.iter().enumerate() {
                    assert_eq!(v.is_nan(), data[i].is_nan(), "vertex {i}");
                }
            }
        }
    }

    #[test]
    fn test_rotated_field_matches_nearest_vertex() {
        let sphere = fibonacci_sphere(30);
        let data: Vec<f64> = sphere.iter().map(|p| p[0]).collect();
        let mut sp = spins(2, 4);
        let fitted = sp.fit(&sphere, None).unwrap().clone();
        let out = fitted.randomize(&data, None).unwrap();
        let idx = fitted.lh.indices(1).unwrap();
        for i in 0..30 {
            assert_abs_diff_eq!(out.lh[[1, i]], data[idx[i]]);
        }
    }

    #[test]
    fn test_unpaired_rotation_differs() {
        let sphere = fibonacci_sphere(20);
        let mut sp = SpinPermutations::new(SpinConfig {
            n_rep: 3,
            random_seed: Some(0),
            unpaired_rotation: true,
        })
        .unwrap();
        let fitted = sp.fit(&sphere, Some(&sphere)).unwrap();
        let rh = fitted.rh.as_ref().unwrap();
        assert_ne!(reflect_x(&fitted.lh.rotations()[0]), rh.rotations()[0]);
    }

    #[test]
    fn test_shape_mismatch() {
        let sphere = fibonacci_sphere(12);
        let mut sp = spins(2, 0);
        sp.fit(&sphere, Some(&sphere)).unwrap();
        let short = vec![0.0; 11];
        let ok = vec![0.0; 12];
        assert!(matches!(
            sp.randomize(&short, None),
            Err(GradientError::ShapeMismatch { expected: 12, actual: 11, .. })
        ));
        assert!(matches!(
            sp.randomize(&ok, Some(&short)),
            Err(GradientError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_right_data_without_right_points() {
        let sphere = fibonacci_sphere(12);
        let mut sp = spins(2, 0);
        sp.fit(&sphere, None).unwrap();
        let data = vec![0.0; 12];
        assert!(matches!(
            sp.randomize(&data, Some(&data)),
            Err(GradientError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_randomize_before_fit() {
        let sp = spins(2, 0);
        assert!(sp.randomize(&[1.0], None).is_err());
    }

    #[test]
    fn test_non_finite_points_rejected() {
        let mut sphere = fibonacci_sphere(5);
        sphere[2][1] = f64::NAN;
        let mut sp = spins(2, 0);
        assert!(sp.fit(&sphere, None).is_err());
        assert!(sp.fitted().is_none());
    }
}
