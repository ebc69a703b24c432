use crate::config::FitAlgorithm;
use csv::WriterBuilder;
use ndarray::{Array1, Array2};
use std::io::Write;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("Failed to write report: {0}")]
    Csv(#[from] csv::Error),

    #[error("Failed to write report: {0}")]
    Io(#[from] std::io::Error),
}

/// Outcome of fitting one model to one held-out subject.
#[derive(Debug, Clone)]
pub struct CellResult {
    pub subject: String,
    pub model: String,
    /// Crossvalidated log-likelihood of the held-out subject.
    pub likelihood: f64,
    /// Log-likelihood of the training subjects at the Phase-A optimum; absent
    /// for models that are not optimised.
    pub train_likelihood: Option<f64>,
    pub noise: f64,
    pub scale: Option<f64>,
    pub run: Option<f64>,
    pub iterations_train: usize,
    pub iterations_test: usize,
    pub elapsed: Duration,
    pub optimizer_train: Option<FitAlgorithm>,
    pub optimizer_test: FitAlgorithm,
    /// G predicted from the training subjects.
    pub predicted_g: Array2<f64>,
    /// Fitted log nuisance parameters of the held-out subject,
    /// `[noise, scale?, run?]`.
    pub theta: Array1<f64>,
}

/// Crossvalidation results, one cell per (subject, model), row-major.
#[derive(Debug, Clone)]
pub struct CrossvalReport {
    pub subjects: Vec<String>,
    pub models: Vec<String>,
    pub cells: Vec<CellResult>,
}

impl CrossvalReport {
    pub fn cell(&self, subject: usize, model: usize) -> &CellResult {
        &self.cells[subject * self.models.len() + model]
    }

    /// Crossvalidated log-likelihoods, subjects x models.
    pub fn likelihood_matrix(&self) -> Array2<f64> {
        Array2::from_shape_fn((self.subjects.len(), self.models.len()), |(s, m)| {
            self.cell(s, m).likelihood
        })
    }

    pub fn write_tsv(&self, path: &Path) -> Result<(), ReportError> {
        let file = std::fs::File::create(path)?;
        self.write_tsv_to(file)
    }

    pub fn write_tsv_to<W: Write>(&self, writer: W) -> Result<(), ReportError> {
        let mut wtr = WriterBuilder::new()
            .delimiter(b'\t')
            .has_headers(true)
            .from_writer(writer);
        wtr.write_record([
            "subject",
            "model",
            "likelihood",
            "train_likelihood",
            "noise",
            "scale",
            "run",
            "iterations_train",
            "iterations_test",
            "elapsed_seconds",
            "optimizer_train",
            "optimizer_test",
        ])?;
        for cell in &self.cells {
            wtr.write_record([
                cell.subject.clone(),
                cell.model.clone(),
                format!("{:.12}", cell.likelihood),
                optional(cell.train_likelihood),
                format!("{:.12}", cell.noise),
                optional(cell.scale),
                optional(cell.run),
                cell.iterations_train.to_string(),
                cell.iterations_test.to_string(),
                format!("{:.6}", cell.elapsed.as_secs_f64()),
                cell.optimizer_train
                    .map_or_else(|| "none".to_string(), algorithm_name),
                algorithm_name(cell.optimizer_test),
            ])?;
        }
        wtr.flush()?;
        Ok(())
    }
}

/// Non-crossvalidated fit of one model to all subjects.
#[derive(Debug, Clone)]
pub struct GroupFitResult {
    pub model: String,
    /// Flat parameters `[structural | noise | scale? | run?]`.
    pub theta: Array1<f64>,
    /// Group log-likelihood at `theta`.
    pub likelihood: f64,
    pub iterations: usize,
    pub optimizer: FitAlgorithm,
}

fn optional(value: Option<f64>) -> String {
    value.map_or_else(|| "NA".to_string(), |v| format!("{v:.12}"))
}

fn algorithm_name(algorithm: FitAlgorithm) -> String {
    match algorithm {
        FitAlgorithm::Minimize => "minimize",
        FitAlgorithm::NewtonRaphson => "newton_raphson",
    }
    .to_string()
}
