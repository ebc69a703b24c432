use ndarray::Array2;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IndicatorError {
    #[error("Cannot build an indicator matrix from an empty label vector.")]
    EmptyLabels,
}

/// Binary design built from a label vector.
#[derive(Debug, Clone)]
pub struct Indicator {
    /// Shape `[n_labels, n_distinct_nonzero]`. Zero-labelled rows are all zero.
    pub matrix: Array2<f64>,
    /// The distinct non-zero labels, in ascending order; column `j` encodes `levels[j]`.
    pub levels: Vec<usize>,
}

/// Builds the identity indicator: one column per distinct non-zero label.
pub fn indicator_matrix(labels: &[usize]) -> Result<Indicator, IndicatorError> {
    if labels.is_empty() {
        return Err(IndicatorError::EmptyLabels);
    }
    let levels = distinct_nonzero(labels);
    let mut matrix = Array2::zeros((labels.len(), levels.len()));
    for (row, &label) in labels.iter().enumerate() {
        if label == 0 {
            continue;
        }
        // levels is sorted, so the search always succeeds for a non-zero label.
        if let Ok(col) = levels.binary_search(&label) {
            matrix[[row, col]] = 1.0;
        }
    }
    Ok(Indicator { matrix, levels })
}

/// Appends one identity column per zero-labelled row, so that every nuisance
/// regressor is absorbed by its own coefficient.
pub fn append_nuisance_columns(interest: &Array2<f64>, labels: &[usize]) -> Array2<f64> {
    let nuisance_rows: Vec<usize> = labels
        .iter()
        .enumerate()
        .filter(|&(_, &label)| label == 0)
        .map(|(row, _)| row)
        .collect();

    let (n, k) = interest.dim();
    let mut z = Array2::zeros((n, k + nuisance_rows.len()));
    z.slice_mut(ndarray::s![.., ..k]).assign(interest);
    for (offset, &row) in nuisance_rows.iter().enumerate() {
        z[[row, k + offset]] = 1.0;
    }
    z
}

/// Sorted distinct non-zero values.
pub fn distinct_nonzero(labels: &[usize]) -> Vec<usize> {
    let mut levels: Vec<usize> = labels.iter().copied().filter(|&l| l != 0).collect();
    levels.sort_unstable();
    levels.dedup();
    levels
}
