use crate::linalg::{self, LinalgError};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Floor applied to component weights before taking their log as starting values.
const COMPONENT_WEIGHT_FLOOR: f64 = 1e-5;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Model '{model}' has no {what}; at least one is required.")]
    Empty { model: String, what: &'static str },

    #[error(
        "Model '{model}': matrix {index} has shape {found:?}, expected {expected:?}."
    )]
    ShapeMismatch {
        model: String,
        index: usize,
        found: (usize, usize),
        expected: (usize, usize),
    },

    #[error("Model '{model}' expects {expected} parameters, got {found}.")]
    WrongParameterCount {
        model: String,
        expected: usize,
        found: usize,
    },

    #[error(
        "Model '{model}' is nonlinear and needs explicit starting values (theta0)."
    )]
    MissingStartingValues { model: String },

    #[error("Model '{model}' has no parametric G generator.")]
    NoGenerator { model: String },

    #[error(
        "Nonlinear model '{model}' generator returned {found} derivative matrices for {expected} parameters."
    )]
    BadGeneratorOutput {
        model: String,
        expected: usize,
        found: usize,
    },

    #[error(transparent)]
    Linalg(#[from] LinalgError),
}

/// Maps structural parameters to `(G, dG/dtheta)` for nonlinear models.
pub type GeneratorFn = dyn Fn(ArrayView1<f64>) -> (Array2<f64>, Vec<Array2<f64>>) + Send + Sync;

/// The model variants. Each carries only the fields its G-generator needs.
#[derive(Clone)]
pub enum ModelKind {
    /// G is fixed; with several instances their mean is used.
    Fixed { instances: Vec<Array2<f64>> },
    /// `G = sum_i exp(theta_i) * Gc_i`
    Component { components: Vec<Array2<f64>> },
    /// `A = sum_i theta_i * Ac_i`, `G = A * A'`
    Feature { features: Vec<Array2<f64>> },
    /// Arbitrary differentiable map supplied by the caller.
    Nonlinear {
        num_params: usize,
        generator: Arc<GeneratorFn>,
    },
    /// Predicted G is the nearest PSD matrix to the mean of the training estimates.
    FreeDirect,
}

impl fmt::Debug for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed { instances } => f
                .debug_struct("Fixed")
                .field("instances", &instances.len())
                .finish(),
            Self::Component { components } => f
                .debug_struct("Component")
                .field("components", &components.len())
                .finish(),
            Self::Feature { features } => f
                .debug_struct("Feature")
                .field("features", &features.len())
                .finish(),
            Self::Nonlinear { num_params, .. } => f
                .debug_struct("Nonlinear")
                .field("num_params", num_params)
                .finish_non_exhaustive(),
            Self::FreeDirect => f.write_str("FreeDirect"),
        }
    }
}

impl ModelKind {
    pub fn describe(&self) -> &'static str {
        match self {
            Self::Fixed { .. } => "fixed",
            Self::Component { .. } => "component",
            Self::Feature { .. } => "feature",
            Self::Nonlinear { .. } => "nonlinear",
            Self::FreeDirect => "freedirect",
        }
    }
}

/// Predicted second moment and its derivatives with respect to each
/// structural parameter.
#[derive(Debug, Clone)]
pub struct GPrediction {
    pub g: Array2<f64>,
    pub dg: Vec<Array2<f64>>,
}

#[derive(Debug, Clone)]
pub struct Model {
    pub name: String,
    pub kind: ModelKind,
    /// Overrides the default structural starting values.
    pub theta0: Option<Array1<f64>>,
}

impl Model {
    pub fn fixed(name: impl Into<String>, instances: Vec<Array2<f64>>) -> Result<Self, ModelError> {
        let name = name.into();
        check_square_stack(&name, &instances, "fixed G instance")?;
        Ok(Self {
            name,
            kind: ModelKind::Fixed { instances },
            theta0: None,
        })
    }

    pub fn component(
        name: impl Into<String>,
        components: Vec<Array2<f64>>,
    ) -> Result<Self, ModelError> {
        let name = name.into();
        check_square_stack(&name, &components, "component")?;
        Ok(Self {
            name,
            kind: ModelKind::Component { components },
            theta0: None,
        })
    }

    pub fn feature(name: impl Into<String>, features: Vec<Array2<f64>>) -> Result<Self, ModelError> {
        let name = name.into();
        let Some(first) = features.first() else {
            return Err(ModelError::Empty {
                model: name,
                what: "feature",
            });
        };
        let expected = first.dim();
        for (index, f) in features.iter().enumerate() {
            if f.dim() != expected {
                return Err(ModelError::ShapeMismatch {
                    model: name,
                    index,
                    found: f.dim(),
                    expected,
                });
            }
        }
        Ok(Self {
            name,
            kind: ModelKind::Feature { features },
            theta0: None,
        })
    }

    pub fn nonlinear(
        name: impl Into<String>,
        num_params: usize,
        generator: Arc<GeneratorFn>,
        theta0: Array1<f64>,
    ) -> Result<Self, ModelError> {
        let name = name.into();
        if theta0.len() != num_params {
            return Err(ModelError::WrongParameterCount {
                model: name,
                expected: num_params,
                found: theta0.len(),
            });
        }
        Ok(Self {
            name,
            kind: ModelKind::Nonlinear {
                num_params,
                generator,
            },
            theta0: Some(theta0),
        })
    }

    pub fn free_direct(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ModelKind::FreeDirect,
            theta0: None,
        }
    }

    pub fn with_theta0(mut self, theta0: Array1<f64>) -> Self {
        self.theta0 = Some(theta0);
        self
    }

    /// Number of structural parameters shared across subjects.
    pub fn num_params(&self) -> usize {
        match &self.kind {
            ModelKind::Fixed { .. } | ModelKind::FreeDirect => 0,
            ModelKind::Component { components } => components.len(),
            ModelKind::Feature { features } => features.len(),
            ModelKind::Nonlinear { num_params, .. } => *num_params,
        }
    }

    /// Side length `K` of the predicted G, when it is fixed by the model
    /// definition. Nonlinear and free-direct models return `None`.
    pub fn num_conditions(&self) -> Option<usize> {
        match &self.kind {
            ModelKind::Fixed { instances: matrices }
            | ModelKind::Component {
                components: matrices,
            }
            | ModelKind::Feature { features: matrices } => matrices.first().map(|m| m.nrows()),
            ModelKind::Nonlinear { .. } | ModelKind::FreeDirect => None,
        }
    }

    /// The fixed G, if this is a fixed model.
    pub fn fixed_g(&self) -> Option<Array2<f64>> {
        match &self.kind {
            ModelKind::Fixed { instances } => {
                let refs: Vec<&Array2<f64>> = instances.iter().collect();
                linalg::mean_matrix(&refs)
            }
            _ => None,
        }
    }

    /// Evaluates the G-generator at `theta`.
    pub fn predict_g(&self, theta: ArrayView1<f64>) -> Result<GPrediction, ModelError> {
        let expected = self.num_params();
        if theta.len() != expected {
            return Err(ModelError::WrongParameterCount {
                model: self.name.clone(),
                expected,
                found: theta.len(),
            });
        }

        match &self.kind {
            ModelKind::Fixed { .. } => {
                let g = self.fixed_g().ok_or_else(|| ModelError::Empty {
                    model: self.name.clone(),
                    what: "fixed G instance",
                })?;
                Ok(GPrediction { g, dg: Vec::new() })
            }
            ModelKind::Component { components } => {
                let k = components[0].nrows();
                let mut g = Array2::zeros((k, k));
                let mut dg = Vec::with_capacity(components.len());
                for (gc, &t) in components.iter().zip(theta.iter()) {
                    let weighted = gc * t.exp();
                    g += &weighted;
                    dg.push(weighted);
                }
                Ok(GPrediction { g, dg })
            }
            ModelKind::Feature { features } => {
                let (k, d) = features[0].dim();
                let mut a = Array2::zeros((k, d));
                for (ac, &t) in features.iter().zip(theta.iter()) {
                    a.scaled_add(t, ac);
                }
                let g = a.dot(&a.t());
                let dg = features
                    .iter()
                    .map(|ac| {
                        let cross = ac.dot(&a.t());
                        &cross + &cross.t()
                    })
                    .collect();
                Ok(GPrediction { g, dg })
            }
            ModelKind::Nonlinear {
                num_params,
                generator,
            } => {
                let (g, dg) = generator(theta);
                if dg.len() != *num_params {
                    return Err(ModelError::BadGeneratorOutput {
                        model: self.name.clone(),
                        expected: *num_params,
                        found: dg.len(),
                    });
                }
                Ok(GPrediction { g, dg })
            }
            ModelKind::FreeDirect => Err(ModelError::NoGenerator {
                model: self.name.clone(),
            }),
        }
    }

    /// Structural starting values: the model's own `theta0` when set,
    /// otherwise derived from the mean crossvalidated G across subjects.
    pub fn starting_theta(&self, mean_g_hat: ArrayView2<f64>) -> Result<Array1<f64>, ModelError> {
        if let Some(theta0) = &self.theta0 {
            if theta0.len() != self.num_params() {
                return Err(ModelError::WrongParameterCount {
                    model: self.name.clone(),
                    expected: self.num_params(),
                    found: theta0.len(),
                });
            }
            return Ok(theta0.clone());
        }

        match &self.kind {
            ModelKind::Fixed { .. } | ModelKind::FreeDirect => Ok(Array1::zeros(0)),
            ModelKind::Component { components } => {
                // Regress vec(G_hat) on the vectorised components.
                let k2 = mean_g_hat.len();
                let mut x = Array2::zeros((k2, components.len()));
                for (col, gc) in components.iter().enumerate() {
                    for (row, &v) in gc.iter().enumerate() {
                        x[[row, col]] = v;
                    }
                }
                let y = Array1::from_iter(mean_g_hat.iter().copied());
                let weights = linalg::pinv(&x)?.dot(&y);
                Ok(weights.mapv(|w| {
                    if w.is_finite() {
                        w.max(COMPONENT_WEIGHT_FLOOR).ln()
                    } else {
                        COMPONENT_WEIGHT_FLOOR.ln()
                    }
                }))
            }
            ModelKind::Feature { features } => Ok(Array1::ones(features.len())),
            ModelKind::Nonlinear { .. } => Err(ModelError::MissingStartingValues {
                model: self.name.clone(),
            }),
        }
    }
}

fn check_square_stack(
    model: &str,
    matrices: &[Array2<f64>],
    what: &'static str,
) -> Result<(), ModelError> {
    let Some(first) = matrices.first() else {
        return Err(ModelError::Empty {
            model: model.to_string(),
            what,
        });
    };
    let k = first.nrows();
    for (index, m) in matrices.iter().enumerate() {
        if m.dim() != (k, k) {
            return Err(ModelError::ShapeMismatch {
                model: model.to_string(),
                index,
                found: m.dim(),
                expected: (k, k),
            });
        }
    }
    Ok(())
}
