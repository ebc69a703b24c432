//! # Fit Configuration and Study Files
//!
//! [`FitConfig`] is the explicit configuration consumed by the fitting
//! driver. Study files are TOML documents that bundle a `[fit]` table, the
//! subject list and the candidate models:
//!
//! ```toml
//! [fit]
//! run_effect = "random"
//! fit_scale = true
//!
//! [[subjects]]
//! id = "s01"
//! data = "s01.tsv"
//!
//! [[models]]
//! kind = "fixed"
//! name = "null"
//! instances = [[[1.0, 0.0], [0.0, 1.0]]]
//!
//! [[models]]
//! kind = "freedirect"
//! name = "ceiling"
//! ```
//!
//! Relative data paths are resolved against the directory of the study file.
//! Nonlinear models carry a closure and can only be built through the library.

use crate::model::{Model, ModelError};
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read or write '{path}': {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse TOML file: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize TOML: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error("{what}: row {row} has {found} entries, expected {expected}.")]
    RaggedMatrix {
        what: String,
        row: usize,
        found: usize,
        expected: usize,
    },
    #[error("Study file lists no {0}.")]
    EmptyStudy(&'static str),
    #[error("Group parameter file has no entry for model '{0}'.")]
    MissingGroupTheta(String),
    #[error(transparent)]
    Model(#[from] ModelError),
}

/// How partition-level baseline shifts are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RunEffect {
    /// Removed as fixed effects (ReML).
    Fixed,
    /// Modelled as a variance component with its own per-subject parameter.
    #[default]
    Random,
}

/// Which optimizer runs first. The other one is the fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FitAlgorithm {
    /// Quasi-Newton (BFGS) with a Wolfe line search.
    #[default]
    Minimize,
    /// Regularised Newton-Raphson on the expected Fisher information.
    NewtonRaphson,
}

impl FitAlgorithm {
    pub fn fallback(self) -> Self {
        match self {
            Self::Minimize => Self::NewtonRaphson,
            Self::NewtonRaphson => Self::Minimize,
        }
    }
}

/// Configuration of a crossvalidated or group fit.
#[derive(Debug, Clone)]
pub struct FitConfig {
    pub run_effect: RunEffect,
    pub fit_scale: bool,
    /// Iteration limit handed to either optimizer.
    pub max_iterations: usize,
    pub fit_algorithm: FitAlgorithm,
    /// Convergence threshold on the gradient norm (BFGS) or the change in
    /// negative log-likelihood (Newton-Raphson).
    pub convergence_tolerance: f64,
    /// Optional `N x N` noise covariance structure, shared by all subjects.
    pub noise_structure: Option<Array2<f64>>,
    /// Optional externally fitted group parameters, one column vector per model.
    pub group_theta: Option<Vec<Array2<f64>>>,
}

impl Default for FitConfig {
    fn default() -> Self {
        Self {
            run_effect: RunEffect::Random,
            fit_scale: false,
            max_iterations: 1000,
            fit_algorithm: FitAlgorithm::Minimize,
            convergence_tolerance: 1e-6,
            noise_structure: None,
            group_theta: None,
        }
    }
}

type RowMatrix = Vec<Vec<f64>>;

/// The `[fit]` table of a study file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FitSection {
    pub run_effect: RunEffect,
    pub fit_scale: bool,
    pub max_iterations: usize,
    pub fit_algorithm: FitAlgorithm,
    pub convergence_tolerance: f64,
    pub noise_structure: Option<RowMatrix>,
}

impl Default for FitSection {
    fn default() -> Self {
        let defaults = FitConfig::default();
        Self {
            run_effect: defaults.run_effect,
            fit_scale: defaults.fit_scale,
            max_iterations: defaults.max_iterations,
            fit_algorithm: defaults.fit_algorithm,
            convergence_tolerance: defaults.convergence_tolerance,
            noise_structure: None,
        }
    }
}

impl FitSection {
    pub fn into_config(self) -> Result<FitConfig, ConfigError> {
        let noise_structure = self
            .noise_structure
            .as_ref()
            .map(|rows| matrix_from_rows(rows, "noise_structure"))
            .transpose()?;
        Ok(FitConfig {
            run_effect: self.run_effect,
            fit_scale: self.fit_scale,
            max_iterations: self.max_iterations,
            fit_algorithm: self.fit_algorithm,
            convergence_tolerance: self.convergence_tolerance,
            noise_structure,
            group_theta: None,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubjectEntry {
    pub id: String,
    /// TSV with `partition`, `condition` and one column per channel.
    pub data: PathBuf,
}

/// A model as written in a study file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ModelSpec {
    Fixed {
        name: String,
        instances: Vec<RowMatrix>,
    },
    Component {
        name: String,
        components: Vec<RowMatrix>,
        #[serde(default)]
        theta0: Option<Vec<f64>>,
    },
    Feature {
        name: String,
        features: Vec<RowMatrix>,
        #[serde(default)]
        theta0: Option<Vec<f64>>,
    },
    FreeDirect {
        name: String,
    },
}

impl ModelSpec {
    pub fn build(&self) -> Result<Model, ConfigError> {
        let model = match self {
            ModelSpec::Fixed { name, instances } => {
                Model::fixed(name.clone(), matrices(name, instances)?)?
            }
            ModelSpec::Component {
                name,
                components,
                theta0,
            } => with_theta0(
                Model::component(name.clone(), matrices(name, components)?)?,
                theta0,
            ),
            ModelSpec::Feature {
                name,
                features,
                theta0,
            } => with_theta0(
                Model::feature(name.clone(), matrices(name, features)?)?,
                theta0,
            ),
            ModelSpec::FreeDirect { name } => Model::free_direct(name.clone()),
        };
        Ok(model)
    }
}

fn matrices(name: &str, list: &[RowMatrix]) -> Result<Vec<Array2<f64>>, ConfigError> {
    list.iter()
        .enumerate()
        .map(|(i, rows)| matrix_from_rows(rows, &format!("model '{name}' matrix {i}")))
        .collect()
}

fn with_theta0(model: Model, theta0: &Option<Vec<f64>>) -> Model {
    match theta0 {
        Some(values) => model.with_theta0(Array1::from_vec(values.clone())),
        None => model,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StudyFile {
    #[serde(default)]
    pub fit: FitSection,
    pub subjects: Vec<SubjectEntry>,
    pub models: Vec<ModelSpec>,
}

/// A study file with paths resolved and models built.
#[derive(Debug, Clone)]
pub struct Study {
    pub config: FitConfig,
    pub subjects: Vec<SubjectEntry>,
    pub models: Vec<Model>,
}

pub fn load_study(path: &Path) -> Result<Study, ConfigError> {
    let text = read_to_string(path)?;
    let file: StudyFile = toml::from_str(&text)?;
    if file.subjects.is_empty() {
        return Err(ConfigError::EmptyStudy("subjects"));
    }
    if file.models.is_empty() {
        return Err(ConfigError::EmptyStudy("models"));
    }

    let base = path.parent().unwrap_or_else(|| Path::new("."));
    let subjects = file
        .subjects
        .into_iter()
        .map(|entry| SubjectEntry {
            data: if entry.data.is_absolute() {
                entry.data
            } else {
                base.join(entry.data)
            },
            id: entry.id,
        })
        .collect();
    let models = file
        .models
        .iter()
        .map(ModelSpec::build)
        .collect::<Result<Vec<_>, _>>()?;

    log::info!("Loaded study '{}'.", path.display());
    Ok(Study {
        config: file.fit.into_config()?,
        subjects,
        models,
    })
}

/// Converts a list of rows into a matrix, rejecting ragged input.
pub fn matrix_from_rows(rows: &[Vec<f64>], what: &str) -> Result<Array2<f64>, ConfigError> {
    let ncols = rows.first().map_or(0, Vec::len);
    let mut flat = Vec::with_capacity(rows.len() * ncols);
    for (row, values) in rows.iter().enumerate() {
        if values.len() != ncols {
            return Err(ConfigError::RaggedMatrix {
                what: what.to_string(),
                row,
                found: values.len(),
                expected: ncols,
            });
        }
        flat.extend_from_slice(values);
    }
    Array2::from_shape_vec((rows.len(), ncols), flat).map_err(|_| ConfigError::RaggedMatrix {
        what: what.to_string(),
        row: 0,
        found: 0,
        expected: ncols,
    })
}

fn matrix_to_rows(m: &Array2<f64>) -> RowMatrix {
    m.rows().into_iter().map(|r| r.to_vec()).collect()
}

/// Group-fit parameters as stored on disk: one `theta` per model, written as
/// a list of rows (a column vector is a list of one-element rows).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupThetaFile {
    pub models: Vec<GroupThetaEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupThetaEntry {
    pub name: String,
    pub theta: RowMatrix,
}

/// Reads group parameters and orders them like `models`.
pub fn load_group_theta(path: &Path, models: &[Model]) -> Result<Vec<Array2<f64>>, ConfigError> {
    let text = read_to_string(path)?;
    let file: GroupThetaFile = toml::from_str(&text)?;
    models
        .iter()
        .map(|model| {
            let entry = file
                .models
                .iter()
                .find(|e| e.name == model.name)
                .ok_or_else(|| ConfigError::MissingGroupTheta(model.name.clone()))?;
            matrix_from_rows(&entry.theta, &format!("group theta for '{}'", model.name))
        })
        .collect()
}

pub fn save_group_theta(
    path: &Path,
    names: &[String],
    thetas: &[Array1<f64>],
) -> Result<(), ConfigError> {
    let file = GroupThetaFile {
        models: names
            .iter()
            .zip(thetas)
            .map(|(name, theta)| GroupThetaEntry {
                name: name.clone(),
                theta: matrix_to_rows(&theta.clone().insert_axis(ndarray::Axis(1))),
            })
            .collect(),
    };
    let text = toml::to_string_pretty(&file)?;
    fs::write(path, text).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn read_to_string(path: &Path) -> Result<String, ConfigError> {
    fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}
