//! # Leave-One-Subject-Out Fitting
//!
//! For every (held-out subject, model) cell the driver runs two phases:
//!
//! 1. **Training.** The model's structural parameters and the training
//!    subjects' nuisance parameters are fitted to all other subjects. Fixed
//!    models skip this and use their G directly; free-direct models use the
//!    nearest PSD matrix to the training subjects' mean crossvalidated G.
//! 2. **Held-out.** With the predicted G frozen, only the held-out subject's
//!    nuisance parameters are fitted. The resulting likelihood is the
//!    crossvalidated score of the model for that subject.
//!
//! Cells are independent and are evaluated in parallel on the rayon pool.
//! [`fit_group`] is the non-crossvalidated counterpart, fitting each model
//! to all subjects at once.

use crate::config::{FitAlgorithm, FitConfig};
use crate::likelihood::{self, LikelihoodOptions, ParamLayout};
use crate::linalg::{self, LinalgError};
use crate::model::{Model, ModelError, ModelKind};
use crate::optimize::{self, OptimizerError, OptimizerSettings};
use crate::preprocess::{self, SubjectStats};
use crate::report::{CellResult, CrossvalReport, GroupFitResult};
use crate::starting::{self, ModelStart, StartingValueError};
use ndarray::{Array1, Array2, s};
use rayon::prelude::*;
use std::fmt;
use std::time::Instant;
use thiserror::Error;

/// Which optimisation of a fit failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FitPhase {
    Training,
    HeldOut,
    Group,
}

impl fmt::Display for FitPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Training => "training",
            Self::HeldOut => "held-out",
            Self::Group => "group",
        })
    }
}

#[derive(Error, Debug)]
pub enum FitError {
    #[error("Leave-one-subject-out fitting needs at least 2 subjects, found {0}.")]
    TooFewSubjects(usize),

    #[error("No models to fit.")]
    NoModels,

    #[error("Subject '{subject}', model '{model}': {phase} fit failed: {source}")]
    Optimization {
        subject: String,
        model: String,
        phase: FitPhase,
        source: OptimizerError,
    },

    #[error("Model '{model}': {source}")]
    Model { model: String, source: ModelError },

    #[error("Free-direct projection failed: {0}")]
    Linalg(#[from] LinalgError),

    #[error(transparent)]
    StartingValues(#[from] StartingValueError),
}

/// Observer for the (subject, model) grid. Methods may be called from any
/// rayon worker.
pub trait CrossvalProgress: Sync {
    fn on_start(&self, total_cells: usize) {
        let _ = total_cells;
    }
    fn on_cell_finished(&self, subject: &str, model: &str) {
        let _ = (subject, model);
    }
    fn on_finish(&self) {}
}

#[derive(Default)]
pub struct NoopProgress;

impl CrossvalProgress for NoopProgress {}

/// Everything a cell needs, shared read-only across workers.
struct FitContext<'a> {
    subjects: &'a [SubjectStats],
    models: &'a [Model],
    starts: Vec<ModelStart>,
    options: LikelihoodOptions<'a>,
    settings: OptimizerSettings,
    algorithm: FitAlgorithm,
}

impl<'a> FitContext<'a> {
    fn new(
        subjects: &'a [SubjectStats],
        models: &'a [Model],
        config: &'a FitConfig,
    ) -> Result<Self, FitError> {
        if models.is_empty() {
            return Err(FitError::NoModels);
        }
        Ok(Self {
            subjects,
            models,
            starts: starting::resolve_starting_values(subjects, models, config)?,
            options: LikelihoodOptions {
                run_effect: config.run_effect,
                fit_scale: config.fit_scale,
                noise_structure: config.noise_structure.as_ref(),
            },
            settings: OptimizerSettings::from(config),
            algorithm: config.fit_algorithm,
        })
    }
}

/// Crossvalidated likelihood of every model for every subject.
pub fn fit_crossval(
    subjects: &[SubjectStats],
    models: &[Model],
    config: &FitConfig,
    progress: &dyn CrossvalProgress,
) -> Result<CrossvalReport, FitError> {
    if subjects.len() < 2 {
        return Err(FitError::TooFewSubjects(subjects.len()));
    }
    let ctx = FitContext::new(subjects, models, config)?;
    let num_models = models.len();
    let total = subjects.len() * num_models;
    log::info!(
        "Crossvalidating {} models over {} subjects ({} fits).",
        num_models,
        subjects.len(),
        total
    );
    progress.on_start(total);

    let cells = (0..total)
        .into_par_iter()
        .map(|cell| {
            let (subject, model) = (cell / num_models, cell % num_models);
            let result = fit_cell(&ctx, subject, model);
            progress.on_cell_finished(&subjects[subject].id, &models[model].name);
            result
        })
        .collect::<Result<Vec<_>, _>>()?;
    progress.on_finish();

    Ok(CrossvalReport {
        subjects: subjects.iter().map(|s| s.id.clone()).collect(),
        models: models.iter().map(|m| m.name.clone()).collect(),
        cells,
    })
}

/// Predicted G and training-phase statistics of one cell.
struct TrainingFit {
    g: Array2<f64>,
    likelihood: Option<f64>,
    iterations: usize,
    optimizer: Option<FitAlgorithm>,
}

fn fit_cell(ctx: &FitContext, held_out: usize, m: usize) -> Result<CellResult, FitError> {
    let started = Instant::now();
    let model = &ctx.models[m];
    let subject = &ctx.subjects[held_out];
    let training: Vec<usize> = (0..ctx.subjects.len()).filter(|&i| i != held_out).collect();

    let train = fit_training(ctx, model, &ctx.starts[m], &training).map_err(|e| {
        with_context(e, &subject.id, &model.name, FitPhase::Training)
    })?;

    // Held-out phase: G frozen, nuisance parameters only.
    let frozen = Model::fixed(model.name.clone(), vec![train.g.clone()]).map_err(|source| {
        FitError::Model {
            model: model.name.clone(),
            source,
        }
    })?;
    let layout = ParamLayout::new(0, 1, &ctx.options);
    let no_structural = Array1::<f64>::zeros(0);
    let x0 = ctx.starts[m].parameter_vector(no_structural.view(), &[held_out], &layout);
    let stats = [subject];
    let outcome = optimize::fit_with_fallback(
        x0,
        |theta| likelihood::group_likelihood(theta, &frozen, &stats, &ctx.options),
        ctx.settings,
        ctx.algorithm,
    )
    .map_err(|source| FitError::Optimization {
        subject: subject.id.clone(),
        model: model.name.clone(),
        phase: FitPhase::HeldOut,
        source,
    })?;

    let theta = outcome.theta;
    log::debug!(
        "Subject '{}', model '{}': crossvalidated log-likelihood {:.4}",
        subject.id,
        model.name,
        -outcome.neg_log_lik
    );
    Ok(CellResult {
        subject: subject.id.clone(),
        model: model.name.clone(),
        likelihood: -outcome.neg_log_lik,
        train_likelihood: train.likelihood,
        noise: theta[layout.noise(0)].exp(),
        scale: layout.scale(0).map(|i| theta[i].exp()),
        run: layout.run(0).map(|i| theta[i].exp()),
        iterations_train: train.iterations,
        iterations_test: outcome.iterations,
        elapsed: started.elapsed(),
        optimizer_train: train.optimizer,
        optimizer_test: outcome.algorithm,
        predicted_g: train.g,
        theta,
    })
}

fn fit_training(
    ctx: &FitContext,
    model: &Model,
    start: &ModelStart,
    training: &[usize],
) -> Result<TrainingFit, FitError> {
    let refs: Vec<&SubjectStats> = training.iter().map(|&i| &ctx.subjects[i]).collect();
    match &model.kind {
        ModelKind::Fixed { .. } => Ok(TrainingFit {
            g: predict(model, &Array1::zeros(0))?,
            likelihood: None,
            iterations: 0,
            optimizer: None,
        }),
        ModelKind::FreeDirect => {
            let mean = preprocess::mean_g_hat(&refs).ok_or(FitError::TooFewSubjects(0))?;
            Ok(TrainingFit {
                g: linalg::nearest_psd(mean.view())?,
                likelihood: None,
                iterations: 0,
                optimizer: None,
            })
        }
        ModelKind::Component { .. } | ModelKind::Feature { .. } | ModelKind::Nonlinear { .. } => {
            let layout = ParamLayout::new(model.num_params(), refs.len(), &ctx.options);
            let x0 = start.parameter_vector(start.theta0.view(), training, &layout);
            let outcome = optimize::fit_with_fallback(
                x0,
                |theta| likelihood::group_likelihood(theta, model, &refs, &ctx.options),
                ctx.settings,
                ctx.algorithm,
            )
            .map_err(|source| FitError::Optimization {
                subject: String::new(),
                model: model.name.clone(),
                phase: FitPhase::Training,
                source,
            })?;
            let structural = outcome.theta.slice(s![..layout.num_structural]).to_owned();
            Ok(TrainingFit {
                g: predict(model, &structural)?,
                likelihood: Some(-outcome.neg_log_lik),
                iterations: outcome.iterations,
                optimizer: Some(outcome.algorithm),
            })
        }
    }
}

fn predict(model: &Model, theta: &Array1<f64>) -> Result<Array2<f64>, FitError> {
    model
        .predict_g(theta.view())
        .map(|p| p.g)
        .map_err(|source| FitError::Model {
            model: model.name.clone(),
            source,
        })
}

/// Attaches the held-out subject to an optimisation failure raised while
/// fitting the training set.
fn with_context(error: FitError, subject: &str, model: &str, phase: FitPhase) -> FitError {
    match error {
        FitError::Optimization { source, .. } => FitError::Optimization {
            subject: subject.to_string(),
            model: model.to_string(),
            phase,
            source,
        },
        other => other,
    }
}

/// Fits every model to all subjects at once. The returned `theta` of each
/// model uses the layout `[structural | noise | scale? | run?]` over all
/// subjects, which is what the starting-value resolver accepts as group
/// parameters.
pub fn fit_group(
    subjects: &[SubjectStats],
    models: &[Model],
    config: &FitConfig,
) -> Result<Vec<GroupFitResult>, FitError> {
    let ctx = FitContext::new(subjects, models, config)?;
    let all: Vec<usize> = (0..subjects.len()).collect();
    let refs: Vec<&SubjectStats> = subjects.iter().collect();
    log::info!(
        "Group fit of {} models over {} subjects.",
        models.len(),
        subjects.len()
    );

    models
        .par_iter()
        .zip(ctx.starts.par_iter())
        .map(|(model, start)| -> Result<GroupFitResult, FitError> {
            // Models without a generator are fitted through their G.
            let fitted = match &model.kind {
                ModelKind::FreeDirect => {
                    let mean =
                        preprocess::mean_g_hat(&refs).ok_or(FitError::TooFewSubjects(0))?;
                    Model::fixed(model.name.clone(), vec![linalg::nearest_psd(mean.view())?])
                        .map_err(|source| FitError::Model {
                            model: model.name.clone(),
                            source,
                        })?
                }
                _ => model.clone(),
            };
            let layout = ParamLayout::new(fitted.num_params(), refs.len(), &ctx.options);
            let x0 = start.parameter_vector(start.theta0.view(), &all, &layout);
            let outcome = optimize::fit_with_fallback(
                x0,
                |theta| likelihood::group_likelihood(theta, &fitted, &refs, &ctx.options),
                ctx.settings,
                ctx.algorithm,
            )
            .map_err(|source| FitError::Optimization {
                subject: "all".to_string(),
                model: model.name.clone(),
                phase: FitPhase::Group,
                source,
            })?;
            log::info!(
                "Model '{}': group log-likelihood {:.4} after {} iterations.",
                model.name,
                -outcome.neg_log_lik,
                outcome.iterations
            );
            Ok(GroupFitResult {
                model: model.name.clone(),
                theta: outcome.theta,
                likelihood: -outcome.neg_log_lik,
                iterations: outcome.iterations,
                optimizer: outcome.algorithm,
            })
        })
        .collect()
}
