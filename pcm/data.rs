//! # Subject Data Loading
//!
//! Reads one subject's activity estimates from a tab-separated file with a
//! header. Two columns are required: `partition` and `condition`, holding
//! non-negative integer labels (0 marks rows excluded from the second-moment
//! estimate). Every other column is a measurement channel, kept in file
//! order. Each row is one observation.

use crate::preprocess::SubjectData;
use crate::second_moment::ConditionDesign;
use ndarray::{Array2, ShapeBuilder};
use polars::prelude::*;
use std::fs::File;
use std::path::Path;
use thiserror::Error;

pub const PARTITION_COLUMN: &str = "partition";
pub const CONDITION_COLUMN: &str = "condition";

#[derive(Error, Debug)]
pub enum DataError {
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    PolarsError(#[from] PolarsError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("The required column '{0}' was not found in the input file.")]
    ColumnNotFound(String),

    #[error(
        "The column '{column_name}' could not be converted to f64. (Found type: {found_type})"
    )]
    ColumnWrongType {
        column_name: String,
        found_type: String,
    },

    #[error("Missing or null values were found in column '{0}'.")]
    MissingValuesFound(String),

    #[error("Non-finite values (NaN or Infinity) were found in column '{0}'.")]
    NonFiniteValuesFound(String),

    #[error("Column '{column}' row {row}: {value} is not a non-negative integer label.")]
    InvalidLabel {
        column: &'static str,
        row: usize,
        value: f64,
    },

    #[error("The input file has no channel columns besides 'partition' and 'condition'.")]
    NoChannels,

    #[error("The input file has no data rows.")]
    Empty,
}

/// Loads a subject's activity TSV.
pub fn load_subject(id: &str, path: &Path) -> Result<SubjectData, DataError> {
    log::info!("Loading subject '{}' from '{}'", id, path.display());
    let df = CsvReader::new(File::open(path)?)
        .with_options(
            CsvReadOptions::default()
                .with_has_header(true)
                .with_parse_options(CsvParseOptions::default().with_separator(b'\t')),
        )
        .finish()?;

    if df.height() == 0 {
        return Err(DataError::Empty);
    }
    let columns: Vec<String> = df
        .get_column_names()
        .into_iter()
        .map(|c| c.to_string())
        .collect();
    for required in [PARTITION_COLUMN, CONDITION_COLUMN] {
        if !columns.iter().any(|c| c == required) {
            return Err(DataError::ColumnNotFound(required.to_string()));
        }
    }
    let channels: Vec<&String> = columns
        .iter()
        .filter(|c| *c != PARTITION_COLUMN && *c != CONDITION_COLUMN)
        .collect();
    if channels.is_empty() {
        return Err(DataError::NoChannels);
    }

    let partition = extract_labels(&df, PARTITION_COLUMN)?;
    let condition = extract_labels(&df, CONDITION_COLUMN)?;

    let n = df.height();
    let mut buffer = Vec::with_capacity(n * channels.len());
    for name in &channels {
        buffer.append(&mut extract_numeric_column(&df, name)?);
    }
    // Columns were appended one after another: column-major.
    let activity = Array2::from_shape_vec((n, channels.len()).f(), buffer)
        .map_err(|_| DataError::Empty)?;

    log::debug!(
        "Subject '{}': {} observations, {} channels",
        id,
        n,
        channels.len()
    );
    Ok(SubjectData {
        id: id.to_string(),
        activity,
        partition,
        conditions: ConditionDesign::Labels(condition),
        first_level: None,
    })
}

fn extract_numeric_column(df: &DataFrame, column_name: &str) -> Result<Vec<f64>, DataError> {
    let series = df.column(column_name)?;
    if series.null_count() > 0 {
        return Err(DataError::MissingValuesFound(column_name.to_string()));
    }
    let casted = series
        .cast(&DataType::Float64)
        .map_err(|_| DataError::ColumnWrongType {
            column_name: column_name.to_string(),
            found_type: format!("{:?}", series.dtype()),
        })?;
    if casted.null_count() > 0 {
        return Err(DataError::ColumnWrongType {
            column_name: column_name.to_string(),
            found_type: format!("{:?}", series.dtype()),
        });
    }
    let values: Vec<f64> = casted.f64()?.rechunk().into_no_null_iter().collect();
    if values.iter().any(|v| !v.is_finite()) {
        return Err(DataError::NonFiniteValuesFound(column_name.to_string()));
    }
    Ok(values)
}

fn extract_labels(df: &DataFrame, column: &'static str) -> Result<Vec<usize>, DataError> {
    extract_numeric_column(df, column)?
        .into_iter()
        .enumerate()
        .map(|(row, value)| {
            if value >= 0.0 && value.fract() == 0.0 {
                Ok(value as usize)
            } else {
                Err(DataError::InvalidLabel { column, row, value })
            }
        })
        .collect()
}
