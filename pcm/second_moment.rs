//! # Crossvalidated Second-Moment Estimation
//!
//! For one subject, estimates the `K x K` second-moment matrix `G` of the
//! condition-evoked patterns without the positive bias that noise introduces
//! into a plain `U * U'` estimate. Each partition in turn is held in; the
//! condition means estimated from the held-in rows are multiplied with those
//! estimated from all remaining rows, so independent noise cancels in
//! expectation. Fold estimates are averaged.
//!
//! The normalisation is by channel count `P` throughout, not by degrees of
//! freedom. Downstream noise and scale starting values assume this
//! convention.
//!
//! Optionally the per-partition condition estimates (held-in side) are also
//! used to estimate their across-partition covariance `Sig`, with
//! `numPartitions - 1` degrees of freedom.

use crate::indicator::{self, IndicatorError};
use crate::linalg::{self, LinalgError};
use ndarray::{Array2, ArrayView2, Axis};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SecondMomentError {
    #[error("No usable partition: every observation has partition label 0.")]
    NoUsablePartition,

    #[error(
        "Partition covariance requires at least 2 partitions, found {found}."
    )]
    TooFewPartitionsForCovariance { found: usize },

    #[error(
        "First-level design has {found} columns, but the activity matrix has {expected} rows. When a first-level design is supplied, every regressor (including nuisance regressors) must be present in the activity matrix."
    )]
    FirstLevelDesignMismatch { found: usize, expected: usize },

    #[error("{what} has {found} entries, which exceeds the {expected} rows of the activity matrix.")]
    VectorTooLong {
        what: &'static str,
        found: usize,
        expected: usize,
    },

    #[error("Condition design matrix has {found} rows, but the activity matrix has {expected}.")]
    ConditionMatrixMismatch { found: usize, expected: usize },

    #[error("Activity matrix is empty ({rows}x{cols}).")]
    EmptyActivity { rows: usize, cols: usize },

    #[error(transparent)]
    Indicator(#[from] IndicatorError),

    #[error(transparent)]
    Linalg(#[from] LinalgError),
}

/// How observations map onto conditions.
#[derive(Debug, Clone)]
pub enum ConditionDesign {
    /// One label per observation; `0` marks a nuisance regressor.
    Labels(Vec<usize>),
    /// An explicit `N x K` second-level design.
    Matrix(Array2<f64>),
}

/// The crossvalidated estimate together with the optional partition covariance.
#[derive(Debug, Clone)]
pub struct CrossvalSecondMoment {
    pub g: Array2<f64>,
    pub sig: Option<Array2<f64>>,
    pub num_partitions: usize,
}

/// Crossvalidated estimate of `G` alone.
pub fn estimate_g_crossval(
    b: ArrayView2<f64>,
    partition: &[usize],
    conditions: &ConditionDesign,
    first_level: Option<ArrayView2<f64>>,
) -> Result<CrossvalSecondMoment, SecondMomentError> {
    let folds = internal::fold_estimates(b, partition, conditions, first_level)?;
    Ok(CrossvalSecondMoment {
        g: folds.mean_g(),
        sig: None,
        num_partitions: folds.held_in.len(),
    })
}

/// Crossvalidated estimate of `G` plus the covariance `Sig` of the
/// per-partition condition estimates.
pub fn estimate_g_crossval_with_covariance(
    b: ArrayView2<f64>,
    partition: &[usize],
    conditions: &ConditionDesign,
    first_level: Option<ArrayView2<f64>>,
) -> Result<CrossvalSecondMoment, SecondMomentError> {
    let folds = internal::fold_estimates(b, partition, conditions, first_level)?;
    let num_partitions = folds.held_in.len();
    if num_partitions < 2 {
        return Err(SecondMomentError::TooFewPartitionsForCovariance {
            found: num_partitions,
        });
    }
    let sig = folds.partition_covariance();
    Ok(CrossvalSecondMoment {
        g: folds.mean_g(),
        sig: Some(sig),
        num_partitions,
    })
}

/// Pads `partition` and `conditions` to `n` rows. Missing trailing
/// partition entries are run intercepts, assigned cyclically to the
/// distinct partitions; missing condition entries are nuisance (0).
pub fn pad_design(
    n: usize,
    partition: &[usize],
    conditions: &ConditionDesign,
) -> Result<(Vec<usize>, ConditionDesign), SecondMomentError> {
    if partition.len() > n {
        return Err(SecondMomentError::VectorTooLong {
            what: "Partition vector",
            found: partition.len(),
            expected: n,
        });
    }
    let parts = indicator::distinct_nonzero(partition);
    if parts.is_empty() {
        return Err(SecondMomentError::NoUsablePartition);
    }
    let mut padded_partition = partition.to_vec();
    let missing = n - partition.len();
    padded_partition.extend((0..missing).map(|j| parts[j % parts.len()]));

    let padded_conditions = match conditions {
        ConditionDesign::Labels(labels) => {
            if labels.len() > n {
                return Err(SecondMomentError::VectorTooLong {
                    what: "Condition vector",
                    found: labels.len(),
                    expected: n,
                });
            }
            let mut labels = labels.clone();
            labels.resize(n, 0);
            ConditionDesign::Labels(labels)
        }
        ConditionDesign::Matrix(z) => {
            if z.nrows() != n {
                return Err(SecondMomentError::ConditionMatrixMismatch {
                    found: z.nrows(),
                    expected: n,
                });
            }
            ConditionDesign::Matrix(z.clone())
        }
    };
    Ok((padded_partition, padded_conditions))
}

mod internal {
    use super::*;

    /// Per-fold products and held-in condition estimates, indexed by fold.
    pub(super) struct FoldEstimates {
        pub g_folds: Vec<Array2<f64>>,
        pub held_in: Vec<Array2<f64>>,
    }

    impl FoldEstimates {
        pub fn mean_g(&self) -> Array2<f64> {
            let refs: Vec<&Array2<f64>> = self.g_folds.iter().collect();
            // fold_estimates guarantees at least one fold.
            let mean = linalg::mean_matrix(&refs).unwrap_or_default();
            linalg::symmetrize(mean.view())
        }

        pub fn partition_covariance(&self) -> Array2<f64> {
            let refs: Vec<&Array2<f64>> = self.held_in.iter().collect();
            let (k, p) = self.held_in[0].dim();
            let mean_a = linalg::mean_matrix(&refs).unwrap_or_else(|| Array2::zeros((k, p)));
            let mut sig = Array2::<f64>::zeros((k, k));
            for a in &self.held_in {
                let residual = a - &mean_a;
                sig += &(residual.dot(&residual.t()) / p as f64);
            }
            sig / (self.held_in.len() - 1) as f64
        }
    }

    pub(super) fn fold_estimates(
        b: ArrayView2<f64>,
        partition: &[usize],
        conditions: &ConditionDesign,
        first_level: Option<ArrayView2<f64>>,
    ) -> Result<FoldEstimates, SecondMomentError> {
        let (n, num_vox) = b.dim();
        if n == 0 || num_vox == 0 {
            return Err(SecondMomentError::EmptyActivity {
                rows: n,
                cols: num_vox,
            });
        }
        if let Some(x) = first_level {
            if x.ncols() != n {
                return Err(SecondMomentError::FirstLevelDesignMismatch {
                    found: x.ncols(),
                    expected: n,
                });
            }
        }

        let (partition, conditions) = pad_design(n, partition, conditions)?;
        let (z, num_cond) = match &conditions {
            ConditionDesign::Labels(labels) => {
                let interest = indicator::indicator_matrix(labels)?;
                let k = interest.levels.len();
                (indicator::append_nuisance_columns(&interest.matrix, labels), k)
            }
            ConditionDesign::Matrix(z) => (z.clone(), z.ncols()),
        };

        let parts = indicator::distinct_nonzero(&partition);
        let mut g_folds = Vec::with_capacity(parts.len());
        let mut held_in = Vec::with_capacity(parts.len());

        for &part in &parts {
            let in_rows: Vec<usize> = (0..n).filter(|&i| partition[i] == part).collect();
            let out_rows: Vec<usize> = (0..n)
                .filter(|&i| partition[i] != part && partition[i] != 0)
                .collect();

            let a_in = split_estimate(b, &z, &in_rows, first_level, num_cond)?;
            let a_out = split_estimate(b, &z, &out_rows, first_level, num_cond)?;

            g_folds.push(a_in.dot(&a_out.t()) / num_vox as f64);
            held_in.push(a_in);
        }

        log::debug!(
            "Crossvalidated G from {} partitions, {} conditions, {} channels.",
            parts.len(),
            num_cond,
            num_vox
        );

        Ok(FoldEstimates { g_folds, held_in })
    }

    /// Condition-mean estimates (`num_cond x P`) from the rows of one split.
    /// Design columns unused within the split are dropped for this split only;
    /// interest conditions absent from the split are left as zero rows.
    fn split_estimate(
        b: ArrayView2<f64>,
        z: &Array2<f64>,
        rows: &[usize],
        first_level: Option<ArrayView2<f64>>,
        num_cond: usize,
    ) -> Result<Array2<f64>, SecondMomentError> {
        let num_vox = b.ncols();
        let mut estimate = Array2::zeros((num_cond, num_vox));
        if rows.is_empty() {
            return Ok(estimate);
        }

        let z_rows = z.select(Axis(0), rows);
        let active_cols: Vec<usize> = (0..z_rows.ncols())
            .filter(|&c| z_rows.column(c).iter().any(|&v| v != 0.0))
            .collect();
        let z_split = z_rows.select(Axis(1), &active_cols);
        let b_split = b.select(Axis(0), rows);

        let (design, data) = match first_level {
            None => (z_split, b_split),
            Some(x) => {
                let x_cols = x.select(Axis(1), rows);
                let active_time: Vec<usize> = (0..x_cols.nrows())
                    .filter(|&t| x_cols.row(t).iter().any(|&v| v != 0.0))
                    .collect();
                let x_split = x_cols.select(Axis(0), &active_time);
                (x_split.dot(&z_split), x_split.dot(&b_split))
            }
        };

        let coef = linalg::pinv(&design)?.dot(&data);
        for (slot, &col) in active_cols.iter().enumerate() {
            if col < num_cond {
                estimate.row_mut(col).assign(&coef.row(slot));
            }
        }
        Ok(estimate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array1, array};
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use rand_distr::{Distribution, Normal};

    /// `num_part` partitions, each containing every condition once, in order.
    fn balanced_design(num_cond: usize, num_part: usize) -> (Vec<usize>, Vec<usize>) {
        let mut partition = Vec::new();
        let mut condition = Vec::new();
        for p in 1..=num_part {
            for c in 1..=num_cond {
                partition.push(p);
                condition.push(c);
            }
        }
        (partition, condition)
    }

    fn simulate(
        patterns: &Array2<f64>,
        condition: &[usize],
        noise_sd: f64,
        rng: &mut StdRng,
    ) -> Array2<f64> {
        let normal = Normal::new(0.0, noise_sd).unwrap();
        let p = patterns.ncols();
        Array2::from_shape_fn((condition.len(), p), |(i, j)| {
            patterns[[condition[i] - 1, j]] + normal.sample(&mut *rng)
        })
    }

    #[test]
    fn recovers_pattern_second_moment_without_noise_bias() {
        let mut rng = StdRng::seed_from_u64(42);
        let (num_cond, num_part, num_vox) = (4, 4, 2000);
        let unit = Normal::new(0.0, 1.0).unwrap();
        let patterns = Array2::from_shape_fn((num_cond, num_vox), |_| unit.sample(&mut rng));
        let expected = patterns.dot(&patterns.t()) / num_vox as f64;

        let (partition, condition) = balanced_design(num_cond, num_part);
        let b = simulate(&patterns, &condition, 1.0, &mut rng);
        let est = estimate_g_crossval(
            b.view(),
            &partition,
            &ConditionDesign::Labels(condition),
            None,
        )
        .unwrap();

        assert!(est.sig.is_none());
        assert_eq!(est.num_partitions, num_part);
        // A naive estimate would add noise variance 1.0 to the diagonal.
        assert_abs_diff_eq!(est.g, expected, epsilon = 0.15);
    }

    #[test]
    fn g_is_symmetric() {
        let mut rng = StdRng::seed_from_u64(7);
        let unit = Normal::new(0.0, 1.0).unwrap();
        let patterns = Array2::from_shape_fn((3, 40), |_| unit.sample(&mut rng));
        let (partition, condition) = balanced_design(3, 3);
        let b = simulate(&patterns, &condition, 0.5, &mut rng);
        let est = estimate_g_crossval(
            b.view(),
            &partition,
            &ConditionDesign::Labels(condition),
            None,
        )
        .unwrap();
        assert_abs_diff_eq!(est.g, est.g.t(), epsilon = 1e-12);
    }

    #[test]
    fn covariance_with_two_partitions_is_single_residual_product() {
        // One observation per condition per partition: the held-in estimate
        // of each fold is just that partition's rows.
        let b = array![
            [1.0, 2.0, 0.0],
            [0.0, 1.0, 1.0],
            [3.0, 0.0, 1.0],
            [1.0, 1.0, 2.0]
        ];
        let partition = vec![1, 1, 2, 2];
        let condition = vec![1, 2, 1, 2];
        let est = estimate_g_crossval_with_covariance(
            b.view(),
            &partition,
            &ConditionDesign::Labels(condition),
            None,
        )
        .unwrap();

        let a1 = b.slice(ndarray::s![0..2, ..]).to_owned();
        let a2 = b.slice(ndarray::s![2..4, ..]).to_owned();
        let diff = &a1 - &a2;
        // Residuals are +-diff/2 and the divisor is 2 - 1.
        let expected = diff.dot(&diff.t()) / (2.0 * 3.0);
        assert_abs_diff_eq!(est.sig.unwrap(), expected, epsilon = 1e-12);

        let g_expected = linalg::symmetrize(
            ((a1.dot(&a2.t()) + a2.dot(&a1.t())) / (2.0 * 3.0)).view(),
        );
        assert_abs_diff_eq!(est.g, g_expected, epsilon = 1e-12);
    }

    #[test]
    fn covariance_requires_two_partitions() {
        let b = array![[1.0, 2.0], [0.5, 1.0]];
        let err = estimate_g_crossval_with_covariance(
            b.view(),
            &[1, 1],
            &ConditionDesign::Labels(vec![1, 2]),
            None,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            SecondMomentError::TooFewPartitionsForCovariance { found: 1 }
        ));
    }

    #[test]
    fn no_usable_partition_is_an_error() {
        let b = array![[1.0, 2.0], [0.5, 1.0]];
        let err = estimate_g_crossval(
            b.view(),
            &[0, 0],
            &ConditionDesign::Labels(vec![1, 2]),
            None,
        )
        .unwrap_err();
        assert!(matches!(err, SecondMomentError::NoUsablePartition));
    }

    #[test]
    fn nuisance_regressors_do_not_change_g() {
        let mut rng = StdRng::seed_from_u64(3);
        let unit = Normal::new(0.0, 1.0).unwrap();
        let (partition, condition) = balanced_design(3, 3);
        let patterns = Array2::from_shape_fn((3, 25), |_| unit.sample(&mut rng));
        let b = simulate(&patterns, &condition, 0.7, &mut rng);

        // Interleave one nuisance row per partition.
        let mut rows = Vec::new();
        let mut part_with = Vec::new();
        let mut cond_with = Vec::new();
        for (i, (&p, &c)) in partition.iter().zip(&condition).enumerate() {
            rows.push(b.row(i).to_owned());
            part_with.push(p);
            cond_with.push(c);
            if c == 3 {
                rows.push(Array1::from_shape_fn(25, |_| unit.sample(&mut rng)));
                part_with.push(p);
                cond_with.push(0);
            }
        }
        let views: Vec<_> = rows.iter().map(|r| r.view()).collect();
        let b_with = ndarray::stack(Axis(0), &views).unwrap();

        let without = estimate_g_crossval(
            b.view(),
            &partition,
            &ConditionDesign::Labels(condition),
            None,
        )
        .unwrap();
        let with = estimate_g_crossval(
            b_with.view(),
            &part_with,
            &ConditionDesign::Labels(cond_with),
            None,
        )
        .unwrap();
        assert_abs_diff_eq!(with.g, without.g, epsilon = 1e-10);
    }

    #[test]
    fn condition_missing_from_a_partition_contributes_zero() {
        // Condition 3 only appears in partition 1.
        let b = array![
            [1.0, 0.0],
            [0.0, 1.0],
            [2.0, 2.0],
            [1.5, 0.5],
            [0.5, 1.5]
        ];
        let partition = vec![1, 1, 1, 2, 2];
        let condition = vec![1, 2, 3, 1, 2];
        let est = estimate_g_crossval(
            b.view(),
            &partition,
            &ConditionDesign::Labels(condition),
            None,
        )
        .unwrap();
        // Fold 1: held-out side lacks condition 3. Fold 2: held-in side lacks it.
        // Either way one factor of the (3, 3) product is a zero row.
        assert_abs_diff_eq!(est.g[[2, 2]], 0.0, epsilon = 1e-12);
        assert!(est.g[[0, 0]].abs() > 0.0);
        assert!(est.g[[0, 2]].abs() > 0.0);
    }

    #[test]
    fn matrix_design_matches_label_design() {
        let mut rng = StdRng::seed_from_u64(11);
        let unit = Normal::new(0.0, 1.0).unwrap();
        let (partition, condition) = balanced_design(3, 3);
        let patterns = Array2::from_shape_fn((3, 20), |_| unit.sample(&mut rng));
        let b = simulate(&patterns, &condition, 0.5, &mut rng);
        let z = indicator::indicator_matrix(&condition).unwrap().matrix;

        let from_labels = estimate_g_crossval(
            b.view(),
            &partition,
            &ConditionDesign::Labels(condition),
            None,
        )
        .unwrap();
        let from_matrix =
            estimate_g_crossval(b.view(), &partition, &ConditionDesign::Matrix(z), None).unwrap();
        assert_abs_diff_eq!(from_labels.g, from_matrix.g, epsilon = 1e-10);
    }

    #[test]
    fn identity_first_level_design_matches_plain_estimate() {
        let mut rng = StdRng::seed_from_u64(5);
        let unit = Normal::new(0.0, 1.0).unwrap();
        let (partition, condition) = balanced_design(2, 3);
        let patterns = Array2::from_shape_fn((2, 15), |_| unit.sample(&mut rng));
        let b = simulate(&patterns, &condition, 0.5, &mut rng);
        let x = Array2::<f64>::eye(condition.len());

        let plain = estimate_g_crossval(
            b.view(),
            &partition,
            &ConditionDesign::Labels(condition.clone()),
            None,
        )
        .unwrap();
        let weighted = estimate_g_crossval(
            b.view(),
            &partition,
            &ConditionDesign::Labels(condition),
            Some(x.view()),
        )
        .unwrap();
        assert_abs_diff_eq!(plain.g, weighted.g, epsilon = 1e-10);
    }

    #[test]
    fn first_level_design_weights_observations() {
        let partition = vec![1, 1, 1, 1, 2, 2, 2, 2];
        let condition = vec![1, 2, 1, 2, 1, 2, 1, 2];
        let b = array![
            [1.0, 0.2, -0.5],
            [0.3, 1.1, 0.4],
            [2.0, -0.7, 0.9],
            [-0.4, 0.8, 1.5],
            [0.6, 0.1, -1.2],
            [1.4, -0.3, 0.2],
            [-0.9, 1.6, 0.7],
            [0.5, 0.5, -0.8]
        ];
        let n = b.nrows();
        // Regressor 2 is scaled, regressors 0 and 5 are sampled twice.
        let mut x = Array2::<f64>::eye(n);
        x[[2, 2]] = 3.0;
        let mut extra = Array2::<f64>::zeros((2, n));
        extra[[0, 0]] = 1.0;
        extra[[1, 5]] = 1.0;
        let x = ndarray::concatenate(Axis(0), &[x.view(), extra.view()]).unwrap();
        let z = indicator::indicator_matrix(&condition).unwrap().matrix;

        // pinv(X_s Z_s) X_s B_s over the columns of one split.
        let split = |rows: &[usize]| {
            let xs = x.select(Axis(1), rows);
            let zs = z.select(Axis(0), rows);
            let bs = b.select(Axis(0), rows);
            linalg::pinv(&xs.dot(&zs)).unwrap().dot(&xs.dot(&bs))
        };
        let first = split(&[0, 1, 2, 3]);
        let second = split(&[4, 5, 6, 7]);
        let p = b.ncols() as f64;
        let fold_mean = (first.dot(&second.t()) + second.dot(&first.t())) / (2.0 * p);
        let expected = (&fold_mean + &fold_mean.t()) / 2.0;

        let weighted = estimate_g_crossval(
            b.view(),
            &partition,
            &ConditionDesign::Labels(condition.clone()),
            Some(x.view()),
        )
        .unwrap();
        assert_abs_diff_eq!(weighted.g, expected, epsilon = 1e-10);

        let plain = estimate_g_crossval(
            b.view(),
            &partition,
            &ConditionDesign::Labels(condition),
            None,
        )
        .unwrap();
        assert!((&weighted.g - &plain.g).iter().any(|d| d.abs() > 1e-3));
    }

    #[test]
    fn first_level_design_column_mismatch_is_fatal() {
        let b = array![[1.0, 2.0], [0.5, 1.0], [0.0, 1.0], [1.0, 1.0]];
        let x = Array2::<f64>::zeros((10, 3));
        let err = estimate_g_crossval(
            b.view(),
            &[1, 1, 2, 2],
            &ConditionDesign::Labels(vec![1, 2, 1, 2]),
            Some(x.view()),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            SecondMomentError::FirstLevelDesignMismatch {
                found: 3,
                expected: 4
            }
        ));
    }

    #[test]
    fn short_vectors_are_padded_with_run_intercepts() {
        let (partition, condition) = pad_design(
            6,
            &[1, 1, 2, 2],
            &ConditionDesign::Labels(vec![1, 2, 1, 2]),
        )
        .unwrap();
        assert_eq!(partition, vec![1, 1, 2, 2, 1, 2]);
        match condition {
            ConditionDesign::Labels(labels) => assert_eq!(labels, vec![1, 2, 1, 2, 0, 0]),
            ConditionDesign::Matrix(_) => panic!("labels expected"),
        }
    }
}
