use crate::indicator::{self, IndicatorError};
use crate::linalg;
use crate::second_moment::{self, ConditionDesign, SecondMomentError};
use ndarray::{Array2, ArrayView2};
use thiserror::Error;

/// Floor on the magnitude of any quantity whose log becomes a starting value.
pub const LOG_ARGUMENT_FLOOR: f64 = 1e-5;

#[derive(Error, Debug)]
pub enum PreprocessError {
    #[error("Subject '{subject}': {source}")]
    SecondMoment {
        subject: String,
        source: SecondMomentError,
    },

    #[error("Subject '{subject}': {source}")]
    Indicator {
        subject: String,
        source: IndicatorError,
    },
}

/// Raw input for one subject.
#[derive(Debug, Clone)]
pub struct SubjectData {
    pub id: String,
    /// `N x P` noise-normalised activity estimates.
    pub activity: Array2<f64>,
    /// Partition label per observation (0 = ignore), padded to `N` if shorter.
    pub partition: Vec<usize>,
    pub conditions: ConditionDesign,
    /// Optional `T x N` first-level design used to weight the G estimate.
    pub first_level: Option<Array2<f64>>,
}

/// Sufficient statistics and starting values for one subject.
#[derive(Debug, Clone)]
pub struct SubjectStats {
    pub id: String,
    /// `N x K` second-level design.
    pub z: Array2<f64>,
    /// `Y * Y'`; the likelihood only ever sees the data through this.
    pub yy: Array2<f64>,
    pub num_channels: usize,
    /// `N x M` partition intercepts.
    pub run_design: Array2<f64>,
    pub g_hat: Array2<f64>,
    pub sig_hat: Array2<f64>,
    /// Log noise variance starting value.
    pub noise0: f64,
    /// Log run-effect variance starting value.
    pub run0: f64,
}

impl SubjectStats {
    pub fn num_conditions(&self) -> usize {
        self.z.ncols()
    }
}

pub fn preprocess_subject(data: &SubjectData) -> Result<SubjectStats, PreprocessError> {
    let second_moment_err = |source| PreprocessError::SecondMoment {
        subject: data.id.clone(),
        source,
    };
    let indicator_err = |source| PreprocessError::Indicator {
        subject: data.id.clone(),
        source,
    };

    let (n, num_channels) = data.activity.dim();
    let (partition, conditions) =
        second_moment::pad_design(n, &data.partition, &data.conditions)
            .map_err(second_moment_err)?;

    let z = match &conditions {
        ConditionDesign::Labels(labels) => {
            indicator::indicator_matrix(labels)
                .map_err(indicator_err)?
                .matrix
        }
        ConditionDesign::Matrix(z) => z.clone(),
    };
    let run_design = indicator::indicator_matrix(&partition)
        .map_err(indicator_err)?
        .matrix;
    let yy = data.activity.dot(&data.activity.t());

    let estimate = second_moment::estimate_g_crossval_with_covariance(
        data.activity.view(),
        &partition,
        &conditions,
        data.first_level.as_ref().map(|x| x.view()),
    )
    .map_err(second_moment_err)?;
    let g_hat = estimate.g;
    // The covariance variant always returns Sig.
    let sig_hat = estimate
        .sig
        .unwrap_or_else(|| Array2::zeros(g_hat.dim()));

    let (noise0, run0) = nuisance_starting_values(sig_hat.view());
    log::debug!(
        "Subject '{}': N={}, P={}, K={}, noise0={:.4}, run0={:.4}",
        data.id,
        n,
        num_channels,
        z.ncols(),
        noise0,
        run0
    );

    Ok(SubjectStats {
        id: data.id.clone(),
        z,
        yy,
        num_channels,
        run_design,
        g_hat,
        sig_hat,
        noise0,
        run0,
    })
}

/// Log-space noise and run-effect starting values from the partition
/// covariance: the mean off-diagonal covariance estimates the run-effect
/// variance, the mean diagonal variance minus that estimates the noise.
pub fn nuisance_starting_values(sig: ArrayView2<f64>) -> (f64, f64) {
    let k = sig.nrows();
    let trace = sig.diag().sum();
    let off_diagonal = if k > 1 {
        (sig.sum() - trace) / (k * (k - 1)) as f64
    } else {
        0.0
    };
    let run0 = floored_log(off_diagonal);
    let noise0 = floored_log(trace / k.max(1) as f64 - run0.exp());
    (noise0, run0)
}

/// `ln(|x|)`, with `|x|` floored so the result is always finite.
pub fn floored_log(x: f64) -> f64 {
    let magnitude = x.abs();
    if magnitude.is_finite() {
        magnitude.max(LOG_ARGUMENT_FLOOR).ln()
    } else {
        LOG_ARGUMENT_FLOOR.ln()
    }
}

/// Regression coefficient of one subject's `G_hat` on the group mean,
/// floored at [`LOG_ARGUMENT_FLOOR`] so its log is always defined.
pub fn scale_ratio(g_hat: ArrayView2<f64>, mean_g: ArrayView2<f64>) -> f64 {
    debug_assert_eq!(g_hat.dim(), mean_g.dim());
    let numerator: f64 = g_hat.iter().zip(mean_g.iter()).map(|(a, b)| a * b).sum();
    let denominator: f64 = mean_g.iter().map(|v| v * v).sum();
    let ratio = (numerator / denominator).max(LOG_ARGUMENT_FLOOR);
    if ratio.is_finite() {
        ratio
    } else {
        LOG_ARGUMENT_FLOOR
    }
}

/// Mean of the subjects' crossvalidated G estimates.
pub fn mean_g_hat(subjects: &[&SubjectStats]) -> Option<Array2<f64>> {
    let refs: Vec<&Array2<f64>> = subjects.iter().map(|s| &s.g_hat).collect();
    linalg::mean_matrix(&refs)
}

/// Log scale starting value for every subject, relative to the mean G of
/// all of them.
pub fn scale_starting_values(subjects: &[&SubjectStats]) -> Vec<f64> {
    let Some(mean_g) = mean_g_hat(subjects) else {
        return Vec::new();
    };
    subjects
        .iter()
        .map(|s| scale_ratio(s.g_hat.view(), mean_g.view()).ln())
        .collect()
}
