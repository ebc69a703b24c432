//! The two optimizers used to maximise PCM likelihoods, and the policy that
//! retries a failed fit with the other one.
//!
//! Both work on the *negative* log-likelihood. The objective is any closure
//! returning a [`LikelihoodEval`]; the BFGS minimizer reads the cost and
//! gradient, Newton-Raphson additionally uses the expected Fisher information
//! as its Hessian.

use crate::config::{FitAlgorithm, FitConfig};
use crate::likelihood::{LikelihoodError, LikelihoodEval};
use crate::linalg;
use ndarray::{Array1, Array2, ArrayView1};
use thiserror::Error;
use wolfe_bfgs::{Bfgs, BfgsSolution};

/// Cost handed to the line search when an evaluation fails or is not finite.
const FAILED_COST: f64 = 1e10;
const INITIAL_REGULARISATION: f64 = 1e-3;
const MAX_REGULARISATION: f64 = 1e12;

#[derive(Error, Debug)]
pub enum OptimizerError {
    #[error("Initial cost is not finite: {0}. Cannot start optimization.")]
    NonFiniteStart(f64),

    #[error("BFGS failed: {0}")]
    Bfgs(String),

    #[error("Newton-Raphson could not find a descent step after {iterations} iterations (regularisation {regularisation:e}).")]
    Singular { iterations: usize, regularisation: f64 },

    #[error("Newton-Raphson did not converge within {iterations} iterations.")]
    IterationLimit { iterations: usize },

    #[error("Optimum has a non-finite cost: {0}.")]
    NonFiniteOptimum(f64),

    #[error("Likelihood evaluation failed: {0}")]
    Likelihood(#[from] LikelihoodError),

    #[error("{primary:?} failed ({primary_error}); fallback {fallback:?} failed ({fallback_error})")]
    BothFailed {
        primary: FitAlgorithm,
        primary_error: Box<OptimizerError>,
        fallback: FitAlgorithm,
        fallback_error: Box<OptimizerError>,
    },
}

#[derive(Debug, Clone, Copy)]
pub struct OptimizerSettings {
    pub max_iterations: usize,
    pub tolerance: f64,
}

impl From<&FitConfig> for OptimizerSettings {
    fn from(config: &FitConfig) -> Self {
        Self {
            max_iterations: config.max_iterations,
            tolerance: config.convergence_tolerance,
        }
    }
}

/// A converged fit.
#[derive(Debug, Clone)]
pub struct OptimizerOutcome {
    pub theta: Array1<f64>,
    pub neg_log_lik: f64,
    pub iterations: usize,
    pub algorithm: FitAlgorithm,
}

/// Runs `primary`; if it faults, logs a warning and runs its fallback from the
/// same starting point. Only the failure of both is an error.
pub fn fit_with_fallback<F>(
    x0: Array1<f64>,
    objective: F,
    settings: OptimizerSettings,
    primary: FitAlgorithm,
) -> Result<OptimizerOutcome, OptimizerError>
where
    F: Fn(ArrayView1<f64>) -> Result<LikelihoodEval, LikelihoodError>,
{
    let primary_error = match run(primary, x0.clone(), &objective, settings) {
        Ok(outcome) => return Ok(outcome),
        Err(e) => e,
    };
    let fallback = primary.fallback();
    log::warn!("{primary:?} failed ({primary_error}); retrying with {fallback:?}.");
    run(fallback, x0, &objective, settings).map_err(|fallback_error| OptimizerError::BothFailed {
        primary,
        primary_error: Box::new(primary_error),
        fallback,
        fallback_error: Box::new(fallback_error),
    })
}

pub fn run<F>(
    algorithm: FitAlgorithm,
    x0: Array1<f64>,
    objective: F,
    settings: OptimizerSettings,
) -> Result<OptimizerOutcome, OptimizerError>
where
    F: Fn(ArrayView1<f64>) -> Result<LikelihoodEval, LikelihoodError>,
{
    match algorithm {
        FitAlgorithm::Minimize => minimize(x0, objective, settings),
        FitAlgorithm::NewtonRaphson => newton_raphson(x0, objective, settings),
    }
}

/// Quasi-Newton minimisation with a Wolfe line search.
pub fn minimize<F>(
    x0: Array1<f64>,
    objective: F,
    settings: OptimizerSettings,
) -> Result<OptimizerOutcome, OptimizerError>
where
    F: Fn(ArrayView1<f64>) -> Result<LikelihoodEval, LikelihoodError>,
{
    let initial_cost = objective(x0.view())?.neg_log_lik;
    if !initial_cost.is_finite() {
        return Err(OptimizerError::NonFiniteStart(initial_cost));
    }

    let cost_and_grad = |x: &Array1<f64>| -> (f64, Array1<f64>) {
        match objective(x.view()) {
            Ok(eval) if eval.neg_log_lik.is_finite() => (eval.neg_log_lik, eval.gradient),
            Ok(eval) => {
                log::warn!(
                    "Non-finite cost encountered: {}, returning large finite value",
                    eval.neg_log_lik
                );
                (FAILED_COST, Array1::zeros(x.len()))
            }
            Err(e) => {
                log::warn!("Cost computation failed: {:?}, returning large finite value", e);
                (FAILED_COST, Array1::zeros(x.len()))
            }
        }
    };

    let BfgsSolution {
        final_point,
        iterations,
        ..
    } = Bfgs::new(x0, cost_and_grad)
        .with_tolerance(settings.tolerance)
        .with_max_iterations(settings.max_iterations)
        .run()
        .map_err(|e| OptimizerError::Bfgs(format!("{:?}", e)))?;

    // The line search may have settled on a penalised point; re-check it.
    let neg_log_lik = objective(final_point.view())?.neg_log_lik;
    if !neg_log_lik.is_finite() {
        return Err(OptimizerError::NonFiniteOptimum(neg_log_lik));
    }
    log::debug!("BFGS converged in {iterations} iterations, cost {neg_log_lik:.6}");

    Ok(OptimizerOutcome {
        theta: final_point,
        neg_log_lik,
        iterations,
        algorithm: FitAlgorithm::Minimize,
    })
}

/// Fisher scoring with Levenberg regularisation: each step solves
/// `(F + lambda * I) d = grad`. Accepted steps shrink `lambda`, rejected
/// steps grow it.
pub fn newton_raphson<F>(
    x0: Array1<f64>,
    objective: F,
    settings: OptimizerSettings,
) -> Result<OptimizerOutcome, OptimizerError>
where
    F: Fn(ArrayView1<f64>) -> Result<LikelihoodEval, LikelihoodError>,
{
    let mut theta = x0;
    let mut current = objective(theta.view())?;
    if !current.neg_log_lik.is_finite() {
        return Err(OptimizerError::NonFiniteStart(current.neg_log_lik));
    }
    let mut regularisation = INITIAL_REGULARISATION;
    let n = theta.len();

    for iteration in 1..=settings.max_iterations {
        let step = match regularised_step(&current, regularisation, n) {
            Some(step) => step,
            None => {
                regularisation *= 10.0;
                if regularisation > MAX_REGULARISATION {
                    return Err(OptimizerError::Singular {
                        iterations: iteration,
                        regularisation,
                    });
                }
                continue;
            }
        };
        let candidate = &theta - &step;
        let trial = objective(candidate.view())
            .ok()
            .filter(|eval| eval.neg_log_lik.is_finite());

        match trial {
            Some(eval) if eval.neg_log_lik <= current.neg_log_lik => {
                let improvement = current.neg_log_lik - eval.neg_log_lik;
                theta = candidate;
                current = eval;
                regularisation = (regularisation / 10.0).max(f64::EPSILON);
                if improvement < settings.tolerance {
                    log::debug!(
                        "Newton-Raphson converged in {iteration} iterations, cost {:.6}",
                        current.neg_log_lik
                    );
                    return Ok(OptimizerOutcome {
                        theta,
                        neg_log_lik: current.neg_log_lik,
                        iterations: iteration,
                        algorithm: FitAlgorithm::NewtonRaphson,
                    });
                }
            }
            // Round-off at the optimum.
            Some(eval)
                if eval.neg_log_lik - current.neg_log_lik < settings.tolerance
                    && step.dot(&step).sqrt() < settings.tolerance =>
            {
                return Ok(OptimizerOutcome {
                    theta,
                    neg_log_lik: current.neg_log_lik,
                    iterations: iteration,
                    algorithm: FitAlgorithm::NewtonRaphson,
                });
            }
            _ => {
                regularisation *= 10.0;
                if regularisation > MAX_REGULARISATION {
                    return Err(OptimizerError::Singular {
                        iterations: iteration,
                        regularisation,
                    });
                }
            }
        }
    }

    Err(OptimizerError::IterationLimit {
        iterations: settings.max_iterations,
    })
}

fn regularised_step(eval: &LikelihoodEval, regularisation: f64, n: usize) -> Option<Array1<f64>> {
    if eval.fisher.iter().any(|v| !v.is_finite()) || eval.gradient.iter().any(|v| !v.is_finite()) {
        return None;
    }
    let mut h: Array2<f64> = eval.fisher.clone();
    h += &(Array2::<f64>::eye(n) * regularisation);
    let inverse = linalg::spd_inverse(&h).ok()?.inverse;
    Some(inverse.dot(&eval.gradient))
}
