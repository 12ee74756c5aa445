//! Opt-in parallel evaluation over independent series.
//!
//! Every likelihood evaluation is a pure function of model and data, so a
//! batch of them can run on rayon's pool without synchronization. The core
//! filter and a single `estimate` call stay single-threaded; callers choose
//! parallelism explicitly by going through this module.

use rayon::prelude::*;

use crate::error::Result;
use crate::estimator::estimate;
use crate::kalman::{loglikelihood, FilterMethod};
use crate::model::{BsmModel, Representation};
use crate::params::BsmParams;
use crate::spec::ModelSpec;
use crate::types::{EstimateOptions, FittedModel};

/// Log-likelihood of the same parameter set on many series, in parallel.
pub fn batch_loglikelihood(
    series: &[Vec<f64>],
    params: &BsmParams,
    method: FilterMethod,
) -> Vec<Result<f64>> {
    series
        .par_iter()
        .map(|y| {
            let model = BsmModel::new(params, Representation::FoldedNoise)?;
            let ll = loglikelihood(&model, y, None, method)?;
            Ok(ll.log_likelihood)
        })
        .collect()
}

/// Fit the same specification to many series, each independently.
pub fn batch_estimate(
    series: &[Vec<f64>],
    period: usize,
    spec: &ModelSpec,
    options: &EstimateOptions,
) -> Vec<Result<FittedModel>> {
    series
        .par_iter()
        .map(|y| estimate(y, None, period, spec, options))
        .collect()
}
