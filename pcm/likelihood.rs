//! # Marginal Likelihood of Pattern Component Models
//!
//! For a subject with `N x K` condition design `Z`, Gram matrix `YY = Y * Y'`
//! over `P` channels, and run design `B`, the data covariance across
//! observations is
//!
//! ```text
//! V = s * Z G Z' + exp(run) * B B' + exp(noise) * S
//! ```
//!
//! where `s = exp(scale)` when the scale is fitted (1 otherwise), the run term
//! exists only for a random run effect, and `S` is the noise structure
//! (identity unless supplied). For a fixed run effect `B` is instead a ReML
//! fixed-effect design and `V^-1` is replaced by the residual-forming
//! projection `iVr`.
//!
//! The functions here return the *negative* log-likelihood, its gradient,
//! and the expected Fisher information, which the Newton-Raphson optimizer
//! uses as its Hessian. Group evaluation sums subjects that share the
//! structural parameters; nuisance parameters are per subject and laid out
//! as `[structural | noise_1..S | scale_1..S | run_1..S]`.

use crate::config::RunEffect;
use crate::linalg::{self, LinalgError, SpdInverse};
use crate::model::{GPrediction, Model, ModelError};
use crate::preprocess::SubjectStats;
use ndarray::{Array1, Array2, ArrayView1, s};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LikelihoodError {
    #[error("Parameter vector has {found} entries, expected {expected}.")]
    WrongLength { expected: usize, found: usize },

    #[error(
        "Subject '{subject}': predicted G is {found}x{found} but the design has {expected} conditions."
    )]
    ConditionMismatch {
        subject: String,
        expected: usize,
        found: usize,
    },

    #[error(
        "Subject '{subject}': noise structure is {found:?}, expected a {expected}x{expected} matrix."
    )]
    NoiseStructureMismatch {
        subject: String,
        expected: usize,
        found: (usize, usize),
    },

    #[error("Likelihood requires at least one subject.")]
    NoSubjects,

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Linalg(#[from] LinalgError),
}

/// Switches that shape the covariance model, shared by every subject in an evaluation.
#[derive(Debug, Clone, Copy)]
pub struct LikelihoodOptions<'a> {
    pub run_effect: RunEffect,
    pub fit_scale: bool,
    pub noise_structure: Option<&'a Array2<f64>>,
}

/// Index bookkeeping for the flat parameter vector of a group evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParamLayout {
    pub num_structural: usize,
    pub num_subjects: usize,
    pub fit_scale: bool,
    pub random_run: bool,
}

impl ParamLayout {
    pub fn new(num_structural: usize, num_subjects: usize, options: &LikelihoodOptions) -> Self {
        Self {
            num_structural,
            num_subjects,
            fit_scale: options.fit_scale,
            random_run: options.run_effect == RunEffect::Random,
        }
    }

    /// Number of nuisance parameters carried by each subject.
    pub fn nuisance_per_subject(&self) -> usize {
        1 + usize::from(self.fit_scale) + usize::from(self.random_run)
    }

    pub fn len(&self) -> usize {
        self.num_structural + self.num_subjects * self.nuisance_per_subject()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn noise(&self, subject: usize) -> usize {
        self.num_structural + subject
    }

    pub fn scale(&self, subject: usize) -> Option<usize> {
        self.fit_scale
            .then(|| self.num_structural + self.num_subjects + subject)
    }

    pub fn run(&self, subject: usize) -> Option<usize> {
        let blocks = 1 + usize::from(self.fit_scale);
        self.random_run
            .then(|| self.num_structural + blocks * self.num_subjects + subject)
    }

    /// Global index of each of one subject's local parameters, in local order
    /// `[structural.., noise, scale?, run?]`.
    fn subject_indices(&self, subject: usize) -> Vec<usize> {
        let mut idx: Vec<usize> = (0..self.num_structural).collect();
        idx.push(self.noise(subject));
        idx.extend(self.scale(subject));
        idx.extend(self.run(subject));
        idx
    }
}

/// Negative log-likelihood with first and expected second derivatives.
#[derive(Debug, Clone)]
pub struct LikelihoodEval {
    pub neg_log_lik: f64,
    pub gradient: Array1<f64>,
    pub fisher: Array2<f64>,
}

/// Evaluates the group negative log-likelihood for `model` at `theta`.
pub fn group_likelihood(
    theta: ArrayView1<f64>,
    model: &Model,
    subjects: &[&SubjectStats],
    options: &LikelihoodOptions,
) -> Result<LikelihoodEval, LikelihoodError> {
    if subjects.is_empty() {
        return Err(LikelihoodError::NoSubjects);
    }
    let layout = ParamLayout::new(model.num_params(), subjects.len(), options);
    if theta.len() != layout.len() {
        return Err(LikelihoodError::WrongLength {
            expected: layout.len(),
            found: theta.len(),
        });
    }

    let prediction = model.predict_g(theta.slice(s![..layout.num_structural]))?;

    let mut neg_log_lik = 0.0;
    let mut gradient = Array1::zeros(layout.len());
    let mut fisher = Array2::zeros((layout.len(), layout.len()));

    for (s, subject) in subjects.iter().enumerate() {
        let nuisance = Nuisance {
            noise: theta[layout.noise(s)],
            scale: layout.scale(s).map(|i| theta[i]),
            run: layout.run(s).map(|i| theta[i]),
        };
        let eval = individual(&prediction, nuisance, subject, options)?;
        let idx = layout.subject_indices(s);

        neg_log_lik += eval.neg_log_lik;
        for (a, &ia) in idx.iter().enumerate() {
            gradient[ia] += eval.gradient[a];
            for (b, &ib) in idx.iter().enumerate() {
                fisher[[ia, ib]] += eval.fisher[[a, b]];
            }
        }
    }

    Ok(LikelihoodEval {
        neg_log_lik,
        gradient,
        fisher,
    })
}

#[derive(Debug, Clone, Copy)]
struct Nuisance {
    noise: f64,
    scale: Option<f64>,
    run: Option<f64>,
}

fn individual(
    prediction: &GPrediction,
    nuisance: Nuisance,
    subject: &SubjectStats,
    options: &LikelihoodOptions,
) -> Result<LikelihoodEval, LikelihoodError> {
    let z = &subject.z;
    let (n, k) = z.dim();
    if prediction.g.dim() != (k, k) {
        return Err(LikelihoodError::ConditionMismatch {
            subject: subject.id.clone(),
            expected: k,
            found: prediction.g.nrows(),
        });
    }
    let p = subject.num_channels as f64;

    let noise_structure = match options.noise_structure {
        Some(sn) if sn.dim() != (n, n) => {
            return Err(LikelihoodError::NoiseStructureMismatch {
                subject: subject.id.clone(),
                expected: n,
                found: sn.dim(),
            });
        }
        Some(sn) => sn.clone(),
        None => Array2::eye(n),
    };

    let scale = nuisance.scale.map_or(1.0, f64::exp);
    let noise = nuisance.noise.exp();

    // --- Build V and its derivative matrices, in local parameter order ---
    let zgz = z.dot(&prediction.g).dot(&z.t());
    let mut v = &zgz * scale;
    v.scaled_add(noise, &noise_structure);

    let mut dv: Vec<Array2<f64>> = prediction
        .dg
        .iter()
        .map(|dg| z.dot(dg).dot(&z.t()) * scale)
        .collect();
    dv.push(&noise_structure * noise);
    if nuisance.scale.is_some() {
        dv.push(&zgz * scale);
    }
    if let Some(run) = nuisance.run {
        let bb = subject.run_design.dot(&subject.run_design.t());
        let run_var = run.exp();
        v.scaled_add(run_var, &bb);
        dv.push(bb * run_var);
    }

    // --- Inverse, with ReML projection for a fixed run effect ---
    let SpdInverse {
        inverse: iv,
        log_det,
    } = linalg::spd_inverse(&v)?;
    let (ivr, reml_log_det) = match options.run_effect {
        RunEffect::Fixed => {
            let x = &subject.run_design;
            let ivx = iv.dot(x);
            let xivx = x.t().dot(&ivx);
            let SpdInverse {
                inverse: xivx_inv,
                log_det: xivx_log_det,
            } = linalg::spd_inverse(&xivx)?;
            let ivr = &iv - &ivx.dot(&xivx_inv).dot(&ivx.t());
            (ivr, xivx_log_det)
        }
        RunEffect::Random => (iv, 0.0),
    };

    let c = ivr.dot(&subject.yy);
    let log_lik = -0.5 * p * log_det - 0.5 * c.diag().sum() - 0.5 * p * reml_log_det;

    // --- Derivatives ---
    let m: Vec<Array2<f64>> = dv.iter().map(|d| ivr.dot(d)).collect();
    let num_local = m.len();
    let mut gradient = Array1::zeros(num_local);
    let mut fisher = Array2::zeros((num_local, num_local));
    for i in 0..num_local {
        let dl = -0.5 * p * m[i].diag().sum() + 0.5 * linalg::trace_of_product(m[i].view(), c.view());
        gradient[i] = -dl;
        for j in 0..=i {
            let f = 0.5 * p * linalg::trace_of_product(m[i].view(), m[j].view());
            fisher[[i, j]] = f;
            fisher[[j, i]] = f;
        }
    }

    Ok(LikelihoodEval {
        neg_log_lik: -log_lik,
        gradient,
        fisher,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preprocess::{SubjectData, preprocess_subject};
    use crate::second_moment::ConditionDesign;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use rand_distr::{Distribution, Normal};

    fn simulated_subject(seed: u64, id: &str) -> SubjectStats {
        let mut rng = StdRng::seed_from_u64(seed);
        let normal = Normal::new(0.0, 1.0).unwrap();
        let (num_cond, num_part, num_vox) = (3, 3, 12);
        let mut partition = Vec::new();
        let mut condition = Vec::new();
        for p in 1..=num_part {
            for c in 1..=num_cond {
                partition.push(p);
                condition.push(c);
            }
        }
        let patterns = Array2::from_shape_fn((num_cond, num_vox), |_| normal.sample(&mut rng));
        let y = Array2::from_shape_fn((partition.len(), num_vox), |(i, j)| {
            patterns[[condition[i] - 1, j]] + 0.8 * normal.sample(&mut rng)
        });
        let data = SubjectData {
            id: id.to_string(),
            activity: y,
            partition,
            conditions: ConditionDesign::Labels(condition),
            first_level: None,
        };
        preprocess_subject(&data).unwrap()
    }

    fn check_gradient(model: &Model, options: &LikelihoodOptions, theta: Array1<f64>) {
        let a = simulated_subject(1, "a");
        let b = simulated_subject(2, "b");
        let subjects = [&a, &b];
        let eval = group_likelihood(theta.view(), model, &subjects, options).unwrap();
        let h = 1e-5;
        for i in 0..theta.len() {
            let mut up = theta.clone();
            up[i] += h;
            let mut down = theta.clone();
            down[i] -= h;
            let f_up = group_likelihood(up.view(), model, &subjects, options)
                .unwrap()
                .neg_log_lik;
            let f_down = group_likelihood(down.view(), model, &subjects, options)
                .unwrap()
                .neg_log_lik;
            let numeric = (f_up - f_down) / (2.0 * h);
            assert_abs_diff_eq!(eval.gradient[i], numeric, epsilon = 1e-4 * (1.0 + numeric.abs()));
        }
        assert_abs_diff_eq!(eval.fisher, eval.fisher.t(), epsilon = 1e-10);
        for i in 0..theta.len() {
            assert!(eval.fisher[[i, i]] >= 0.0);
        }
    }

    #[test]
    fn gradient_matches_finite_differences_random_run_with_scale() {
        let model = Model::component("c", vec![Array2::eye(3), Array2::ones((3, 3))]).unwrap();
        let options = LikelihoodOptions {
            run_effect: RunEffect::Random,
            fit_scale: true,
            noise_structure: None,
        };
        // [2 structural | 2 noise | 2 scale | 2 run]
        let theta = array![0.1, -0.5, -0.2, 0.3, 0.0, 0.2, -1.0, -0.7];
        check_gradient(&model, &options, theta);
    }

    #[test]
    fn gradient_matches_finite_differences_fixed_run_reml() {
        let model = Model::feature("f", vec![array![[1.0], [0.0], [0.5]], array![[0.0], [1.0], [1.0]]])
            .unwrap();
        let options = LikelihoodOptions {
            run_effect: RunEffect::Fixed,
            fit_scale: false,
            noise_structure: None,
        };
        // [2 structural | 2 noise]
        let theta = array![0.8, 0.4, -0.3, 0.1];
        check_gradient(&model, &options, theta);
    }

    #[test]
    fn layout_orders_noise_scale_run_blocks() {
        let options = LikelihoodOptions {
            run_effect: RunEffect::Random,
            fit_scale: true,
            noise_structure: None,
        };
        let layout = ParamLayout::new(2, 3, &options);
        assert_eq!(layout.len(), 2 + 3 * 3);
        assert_eq!(layout.noise(1), 3);
        assert_eq!(layout.scale(1), Some(6));
        assert_eq!(layout.run(1), Some(9));
        assert_eq!(layout.subject_indices(2), vec![0, 1, 4, 7, 10]);
    }

    #[test]
    fn wrong_parameter_length_is_rejected() {
        let a = simulated_subject(3, "a");
        let model = Model::free_direct("free");
        let options = LikelihoodOptions {
            run_effect: RunEffect::Fixed,
            fit_scale: false,
            noise_structure: None,
        };
        let fixed = Model::fixed("id", vec![Array2::eye(3)]).unwrap();
        let err = group_likelihood(array![0.0, 1.0].view(), &fixed, &[&a], &options).unwrap_err();
        assert!(matches!(err, LikelihoodError::WrongLength { expected: 1, found: 2 }));
        assert!(group_likelihood(array![0.0].view(), &model, &[&a], &options).is_err());
    }

    #[test]
    fn noise_structure_must_match_observation_count() {
        let a = simulated_subject(4, "a");
        let fixed = Model::fixed("id", vec![Array2::eye(3)]).unwrap();
        let bad = Array2::<f64>::eye(2);
        let options = LikelihoodOptions {
            run_effect: RunEffect::Random,
            fit_scale: false,
            noise_structure: Some(&bad),
        };
        let err = group_likelihood(array![0.0, 0.0].view(), &fixed, &[&a], &options).unwrap_err();
        assert!(matches!(err, LikelihoodError::NoiseStructureMismatch { .. }));
    }
}
