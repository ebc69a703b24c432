//! # pcmfit
//!
//! Crossvalidated estimation of second-moment matrices from partitioned
//! activity-pattern data, and leave-one-subject-out fitting of pattern
//! component models to group data.
//!
//! The pipeline runs in three stages:
//!
//! 1.  **Estimation:** [`second_moment`] computes the unbiased crossvalidated
//!     estimate of `G` (and optionally its across-partition covariance) for a
//!     single subject.
//! 2.  **Preprocessing:** [`preprocess`] reduces each subject to the sufficient
//!     statistics consumed by the likelihood, plus log-space starting values
//!     for the nuisance parameters.
//! 3.  **Fitting:** [`crossval`] fits every model on all-but-one subject, then
//!     scores the held-out subject with the structure held fixed.
#![deny(unused_imports)]

pub mod config;
pub mod crossval;
pub mod data;
pub mod indicator;
pub mod likelihood;
pub mod linalg;
pub mod model;
pub mod optimize;
pub mod preprocess;
pub mod report;
pub mod second_moment;
pub mod starting;
