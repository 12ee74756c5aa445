//! Basic structural time-series models (level, slope, cycle, seasonal,
//! noise) estimated by maximum likelihood through a diffuse Kalman filter.
//!
//! The pieces compose bottom-up:
//!
//! - [`spec::ModelSpec`] declares which components exist and which variances
//!   are estimated; [`params::BsmParams`] is one numeric instantiation.
//! - [`model::BsmModel`] turns parameters into a concrete state-space model
//!   behind the [`model::StateSpace`] contract.
//! - [`kalman`] evaluates the diffuse log-likelihood of a model on a series,
//!   with three cross-checking algorithms.
//! - [`estimator::estimate`] searches the variances for the maximum
//!   likelihood fit, with scale anchoring and likelihood-ratio reduction.
//! - [`batch`] offers opt-in rayon parallelism over independent series.

pub mod batch;
pub mod error;
pub mod estimator;
pub mod kalman;
pub mod layout;
pub mod likelihood;
pub mod model;
pub mod params;
pub mod spec;
pub mod types;

pub use error::{BsmError, Result};
pub use estimator::estimate;
pub use kalman::{
    augmented_loglikelihood, collapsing_loglikelihood, filtered_states, loglikelihood,
    steady_state_loglikelihood, FilterMethod, FilterOutput,
};
pub use layout::ComponentLayout;
pub use likelihood::DiffuseLikelihood;
pub use model::{BsmModel, Measurement, Representation, StateSpace};
pub use params::{BsmParams, CycleParams, SeasonalParams, VarianceMapping};
pub use spec::ModelSpec;
pub use types::{Component, EstimateOptions, FittedModel, Optimizer, SeasonalModel, Variance};
