//! Starting values for every model fit.
//!
//! Each model gets its own [`ModelStart`]: structural `theta0` and per-subject
//! log noise, scale and run-effect values. Defaults come from preprocessing
//! and the model definition. When group-fit parameters are supplied they
//! replace the defaults for that model, read in the flat layout
//! `[structural | noise_1..S | scale_1..S | run_1..S]`.

use crate::config::{FitConfig, RunEffect};
use crate::likelihood::ParamLayout;
use crate::model::{Model, ModelError, ModelKind};
use crate::preprocess::{self, SubjectStats};
use ndarray::{Array1, Array2, ArrayView1, s};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StartingValueError {
    #[error("Group parameters for model '{model}' must be a single column, got shape {found:?}.")]
    NotAColumnVector {
        model: String,
        found: (usize, usize),
    },

    #[error("Group parameters for model '{model}' have {found} entries, expected {expected}.")]
    WrongLength {
        model: String,
        expected: usize,
        found: usize,
    },

    #[error("{found} group parameter vectors supplied for {expected} models.")]
    WrongModelCount { expected: usize, found: usize },

    #[error("Subject '{subject}' has {found} conditions, but subject '{reference}' has {expected}.")]
    ConditionCountMismatch {
        subject: String,
        reference: String,
        expected: usize,
        found: usize,
    },

    #[error("Model '{model}' predicts a {found}x{found} G, but the subjects have {expected} conditions.")]
    ModelDimension {
        model: String,
        expected: usize,
        found: usize,
    },

    #[error("Cannot derive starting values without subjects.")]
    NoSubjects,

    #[error(transparent)]
    Model(#[from] ModelError),
}

/// Starting point of one model, indexed by subject position.
#[derive(Debug, Clone)]
pub struct ModelStart {
    pub theta0: Array1<f64>,
    pub noise0: Vec<f64>,
    pub scale0: Vec<f64>,
    pub run0: Vec<f64>,
}

impl ModelStart {
    /// Assembles a flat parameter vector for `subset` (positions into the
    /// subject list) using `structural` as the shared block.
    pub fn parameter_vector(
        &self,
        structural: ArrayView1<f64>,
        subset: &[usize],
        layout: &ParamLayout,
    ) -> Array1<f64> {
        let mut x = Array1::zeros(layout.len());
        x.slice_mut(s![..layout.num_structural]).assign(&structural);
        for (local, &subject) in subset.iter().enumerate() {
            x[layout.noise(local)] = self.noise0[subject];
            if let Some(i) = layout.scale(local) {
                x[i] = self.scale0[subject];
            }
            if let Some(i) = layout.run(local) {
                x[i] = self.run0[subject];
            }
        }
        x
    }
}

/// Resolves starting values for all models over all subjects.
pub fn resolve_starting_values(
    subjects: &[SubjectStats],
    models: &[Model],
    config: &FitConfig,
) -> Result<Vec<ModelStart>, StartingValueError> {
    let num_conditions = common_condition_count(subjects)?;
    let refs: Vec<&SubjectStats> = subjects.iter().collect();
    let mean_g = preprocess::mean_g_hat(&refs).ok_or(StartingValueError::NoSubjects)?;
    let defaults = ModelStart {
        theta0: Array1::zeros(0),
        noise0: subjects.iter().map(|s| s.noise0).collect(),
        scale0: preprocess::scale_starting_values(&refs),
        run0: subjects.iter().map(|s| s.run0).collect(),
    };

    if let Some(group) = &config.group_theta {
        if group.len() != models.len() {
            return Err(StartingValueError::WrongModelCount {
                expected: models.len(),
                found: group.len(),
            });
        }
    }

    models
        .iter()
        .enumerate()
        .map(|(m, model)| {
            if let Some(k) = model.num_conditions() {
                check_model_dimension(model, (k, k), num_conditions)?;
            }
            let start = match &config.group_theta {
                Some(group) => from_group_fit(model, &group[m], &defaults, config)?,
                None => ModelStart {
                    theta0: model.starting_theta(mean_g.view())?,
                    ..defaults.clone()
                },
            };
            // A nonlinear generator's size is only known once it is evaluated.
            if let ModelKind::Nonlinear { .. } = model.kind {
                let g = model.predict_g(start.theta0.view())?.g;
                check_model_dimension(model, g.dim(), num_conditions)?;
            }
            log::debug!(
                "Model '{}' ({}): {} structural parameters over {} conditions.",
                model.name,
                model.kind.describe(),
                model.num_params(),
                num_conditions
            );
            Ok(start)
        })
        .collect()
}

/// Every subject must estimate G over the same `K` conditions.
fn common_condition_count(subjects: &[SubjectStats]) -> Result<usize, StartingValueError> {
    let (first, rest) = subjects
        .split_first()
        .ok_or(StartingValueError::NoSubjects)?;
    let expected = first.num_conditions();
    for subject in rest {
        if subject.num_conditions() != expected {
            return Err(StartingValueError::ConditionCountMismatch {
                subject: subject.id.clone(),
                reference: first.id.clone(),
                expected,
                found: subject.num_conditions(),
            });
        }
    }
    Ok(expected)
}

fn check_model_dimension(
    model: &Model,
    g_dim: (usize, usize),
    num_conditions: usize,
) -> Result<(), StartingValueError> {
    if g_dim != (num_conditions, num_conditions) {
        return Err(StartingValueError::ModelDimension {
            model: model.name.clone(),
            expected: num_conditions,
            found: g_dim.0,
        });
    }
    Ok(())
}

fn from_group_fit(
    model: &Model,
    theta: &Array2<f64>,
    defaults: &ModelStart,
    config: &FitConfig,
) -> Result<ModelStart, StartingValueError> {
    if theta.ncols() != 1 {
        return Err(StartingValueError::NotAColumnVector {
            model: model.name.clone(),
            found: theta.dim(),
        });
    }
    let layout = ParamLayout {
        num_structural: model.num_params(),
        num_subjects: defaults.noise0.len(),
        fit_scale: config.fit_scale,
        random_run: config.run_effect == RunEffect::Random,
    };
    if theta.nrows() != layout.len() {
        return Err(StartingValueError::WrongLength {
            model: model.name.clone(),
            expected: layout.len(),
            found: theta.nrows(),
        });
    }

    let flat = theta.column(0);
    let mut start = ModelStart {
        theta0: flat.slice(s![..layout.num_structural]).to_owned(),
        ..defaults.clone()
    };
    for subject in 0..layout.num_subjects {
        start.noise0[subject] = flat[layout.noise(subject)];
        if let Some(i) = layout.scale(subject) {
            start.scale0[subject] = flat[i];
        }
        if let Some(i) = layout.run(subject) {
            start.run0[subject] = flat[i];
        }
    }
    log::debug!("Model '{}' starts from supplied group parameters.", model.name);
    Ok(start)
}
