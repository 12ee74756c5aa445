//! Maximum likelihood estimation of the structural variances.
//!
//! The kernel wraps the diffuse likelihood as an objective over the reduced
//! parameter vector (one scalar per free variance, squared to stay
//! non-negative) and drives an argmin solver around it:
//!
//! 1. Rescale the series by its absolute mean; everything reported is
//!    rescaled back at the end.
//! 2. Pick the scale anchor: amplify each free variance in turn from a
//!    neutral point, keep the best, pin its variance at one.
//! 3. Re-anchor: after each solver run, renormalize so the largest free
//!    variance becomes the anchor, stopping early when the anchor is stable.
//! 4. Reduction: a free variance that stays small is refitted at exactly
//!    zero; when the likelihood-ratio statistic cannot justify keeping it,
//!    the component is permanently fixed to zero and the fit restarts.
//!
//! Solver failures never escape as errors: a degenerate likelihood
//! evaluation costs `f64::MAX / 2`, and non-convergence is reported through
//! the `converged` flag on the result.

use argmin::core::{CostFunction, Executor, Gradient, State, TerminationReason};
use argmin::solver::linesearch::MoreThuenteLineSearch;
use argmin::solver::neldermead::NelderMead;
use argmin::solver::quasinewton::{BFGS, LBFGS};
use nalgebra::DMatrix;
use rayon::prelude::*;

use crate::error::{BsmError, Result};
use crate::kalman::{loglikelihood, FilterMethod};
use crate::likelihood::DiffuseLikelihood;
use crate::model::{BsmModel, Representation};
use crate::params::{BsmParams, VarianceMapping};
use crate::spec::ModelSpec;
use crate::types::{Component, EstimateOptions, FittedModel, Optimizer, Variance};

/// Fit a structural model by maximum likelihood.
///
/// `y` is the observed series with NaN marking missing values; `regression`
/// is an optional matrix of deterministic regressors concentrated out of the
/// likelihood; `period` is the number of observations per year.
pub fn estimate(
    y: &[f64],
    regression: Option<&DMatrix<f64>>,
    period: usize,
    spec: &ModelSpec,
    options: &EstimateOptions,
) -> Result<FittedModel> {
    spec.validate(period)?;
    let r = regression.map_or(0, |x| x.ncols());
    if let Some(x) = regression {
        if x.nrows() != y.len() {
            return Err(BsmError::DataError(format!(
                "regression matrix has {} rows but the series has {} observations",
                x.nrows(),
                y.len()
            )));
        }
    }
    let observed = y.iter().filter(|v| v.is_finite()).count();
    let min_obs = spec.state_dim(period) + r + spec.free_components().len() + 1;
    if observed <= min_obs {
        return Err(BsmError::DataError(format!(
            "not enough observations: {} observed, need more than {}",
            observed, min_obs
        )));
    }

    // Condition the series on its absolute mean.
    let scale =
        y.iter().filter(|v| v.is_finite()).map(|v| v.abs()).sum::<f64>() / observed as f64;
    if scale <= 0.0 {
        return Err(BsmError::DataError(
            "series has zero absolute mean".into(),
        ));
    }
    let ys: Vec<f64> = y
        .iter()
        .map(|v| if v.is_finite() { v / scale } else { f64::NAN })
        .collect();

    let mut spec_now = spec.clone();
    let mut pass = 0;
    loop {
        let fit = fit_once(&ys, regression, period, &spec_now, options)?;
        let candidate = reduction_candidate(&ys, regression, period, &spec_now, &fit, options);
        pass += 1;
        if let Some(component) = candidate {
            if pass < options.outer_passes {
                spec_now = spec_now.with_variance(component, Variance::Fixed(0.0));
                if component == Component::Level {
                    spec_now = spec_now.with_variance(Component::Slope, Variance::Fixed(0.0));
                }
                continue;
            }
        }
        let converged = fit.optimizer_converged && candidate.is_none();
        return Ok(finish(fit, spec_now, scale, r, converged));
    }
}

struct FitOutcome {
    /// Scale-relative variances, anchor pinned at one.
    params: BsmParams,
    likelihood: DiffuseLikelihood,
    anchor: Component,
    optimizer_converged: bool,
}

/// One likelihood evaluation: build the model, pick the cheapest exact
/// filter, run it.
fn evaluate(
    params: &BsmParams,
    y: &[f64],
    regression: Option<&DMatrix<f64>>,
) -> Result<DiffuseLikelihood> {
    let model = BsmModel::new(params, Representation::FoldedNoise)?;
    let method = FilterMethod::preferred(&model, regression.is_some());
    loglikelihood(&model, y, regression, method)
}

fn fit_once(
    y: &[f64],
    regression: Option<&DMatrix<f64>>,
    period: usize,
    spec: &ModelSpec,
    options: &EstimateOptions,
) -> Result<FitOutcome> {
    // Anchor selection: amplify each free variance in turn.
    let probe = VarianceMapping::new(spec, period, None)?;
    let neutral = probe.default_point();
    let candidates: Vec<(Component, Vec<f64>)> = probe
        .free_components()
        .iter()
        .enumerate()
        .map(|(i, c)| {
            let mut x = neutral.clone();
            x[i] = 1.0;
            (*c, x)
        })
        .collect();
    let score = |(c, x): &(Component, Vec<f64>)| -> (Component, f64) {
        let ll = probe
            .map(x)
            .ok()
            .and_then(|p| evaluate(&p, y, regression).ok())
            .map_or(f64::NEG_INFINITY, |l| l.log_likelihood);
        (*c, ll)
    };
    let scored: Vec<(Component, f64)> = if options.parallel_init {
        candidates.par_iter().map(score).collect()
    } else {
        candidates.iter().map(score).collect()
    };
    let (first_anchor, best_ll) = scored
        .into_iter()
        .max_by(|a, b| a.1.total_cmp(&b.1))
        .ok_or_else(|| BsmError::OptimizationFailed("no free variance to fit".into()))?;
    if best_ll == f64::NEG_INFINITY {
        return Err(BsmError::OptimizationFailed(
            "no admissible starting point".into(),
        ));
    }

    let mut anchor = first_anchor;
    let mut mapping = VarianceMapping::new(spec, period, Some(anchor))?;
    let mut x0 = mapping.default_point();
    let mut params = mapping.map(&x0)?;
    let mut optimizer_converged = true;

    for round in 0..options.anchor_rounds.max(1) {
        if mapping.dim() == 0 {
            // a single free variance is the anchor; nothing left to optimize
            params = mapping.map(&[])?;
            optimizer_converged = true;
            break;
        }
        let objective = VarianceObjective {
            y: y.to_vec(),
            regression: regression.cloned(),
            mapping: mapping.clone(),
        };
        let (xbest, _cost, _iters, conv) =
            run_optimizer(&objective, options.optimizer, x0.clone(), options.max_iter)?;
        params = mapping.map(&xbest)?;
        optimizer_converged = conv;

        let (largest, vmax) = largest_free_variance(&params, spec);
        if largest == anchor || vmax <= 0.0 || round + 1 == options.anchor_rounds {
            break;
        }
        // Renormalize onto the new anchor and run again.
        params = normalized_free(&params, spec, vmax);
        anchor = largest;
        mapping = VarianceMapping::new(spec, period, Some(anchor))?;
        x0 = mapping.inverse(&params);
    }

    let likelihood = evaluate(&params, y, regression)?;
    Ok(FitOutcome {
        params,
        likelihood,
        anchor,
        optimizer_converged,
    })
}

/// Smallest likelihood-ratio statistic among the free variances that sit
/// below the reduction threshold, if it fails the test.
fn reduction_candidate(
    y: &[f64],
    regression: Option<&DMatrix<f64>>,
    period: usize,
    spec: &ModelSpec,
    fit: &FitOutcome,
    options: &EstimateOptions,
) -> Option<Component> {
    let mut best: Option<(Component, f64)> = None;
    for component in spec.free_components() {
        if component == fit.anchor {
            continue;
        }
        let v = fit.params.variance(component).unwrap_or(0.0);
        if v >= options.small_variance {
            continue;
        }
        // Skip reductions that would leave nothing estimable.
        let mut reduced_spec = spec.with_variance(component, Variance::Fixed(0.0));
        if component == Component::Level {
            reduced_spec = reduced_spec.with_variance(Component::Slope, Variance::Fixed(0.0));
        }
        if reduced_spec.validate(period).is_err() {
            continue;
        }
        let reduced = fit.params.without(component);
        let Ok(ll) = evaluate(&reduced, y, regression) else {
            continue;
        };
        let stat = 2.0 * (fit.likelihood.log_likelihood - ll.log_likelihood);
        if best.map_or(true, |(_, s)| stat < s) {
            best = Some((component, stat));
        }
    }
    match best {
        Some((component, stat)) if stat < options.lr_threshold => Some(component),
        _ => None,
    }
}

fn largest_free_variance(params: &BsmParams, spec: &ModelSpec) -> (Component, f64) {
    let mut best = (Component::Noise, f64::NEG_INFINITY);
    for c in spec.free_components() {
        let v = params.variance(c).unwrap_or(0.0);
        if v > best.1 {
            best = (c, v);
        }
    }
    best
}

/// Divide the free variances by `factor`, leaving fixed variances alone.
fn normalized_free(params: &BsmParams, spec: &ModelSpec, factor: f64) -> BsmParams {
    let mut out = params.clone();
    for c in spec.free_components() {
        if let Some(v) = out.variance(c) {
            out = out.with_variance(c, v / factor);
        }
    }
    out
}

fn finish(
    fit: FitOutcome,
    spec: ModelSpec,
    scale: f64,
    n_regression: usize,
    converged: bool,
) -> FittedModel {
    let mut likelihood = fit.likelihood.rescaled(scale);
    likelihood.n_params = spec.free_components().len() + n_regression;
    // Relative variances times the concentrated scale gives original units.
    let params = fit.params.scaled(likelihood.scale);
    FittedModel {
        params,
        likelihood,
        spec,
        anchor: fit.anchor,
        converged,
        aic: 0.0,
        bic: 0.0,
    }
    .with_information_criteria()
}

// ---------------------------------------------------------------------------
// Objective function for argmin
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct VarianceObjective {
    y: Vec<f64>,
    regression: Option<DMatrix<f64>>,
    mapping: VarianceMapping,
}

impl VarianceObjective {
    fn negative_loglikelihood(&self, x: &[f64]) -> Result<f64> {
        let params = self.mapping.map(x)?;
        let ll = evaluate(&params, &self.y, self.regression.as_ref())?;
        Ok(-ll.log_likelihood)
    }
}

impl CostFunction for VarianceObjective {
    type Param = Vec<f64>;
    type Output = f64;

    fn cost(&self, param: &Vec<f64>) -> std::result::Result<f64, argmin::core::Error> {
        match self.negative_loglikelihood(param) {
            Ok(cost) if cost.is_finite() => Ok(cost),
            // degenerate evaluations are very poor candidates, not crashes
            _ => Ok(f64::MAX / 2.0),
        }
    }
}

impl Gradient for VarianceObjective {
    type Param = Vec<f64>;
    type Gradient = Vec<f64>;

    fn gradient(&self, param: &Vec<f64>) -> std::result::Result<Vec<f64>, argmin::core::Error> {
        // Forward differences, with a central fallback per coordinate.
        let n = param.len();
        let mut grad = vec![0.0; n];
        let eps = f64::EPSILON.sqrt();

        let f0 = self.cost(param)?;
        let mut work = param.clone();

        for i in 0..n {
            let orig = work[i];
            work[i] = orig + eps;
            let f_plus = self.cost(&work)?;
            work[i] = orig;

            grad[i] = (f_plus - f0) / eps;

            if !grad[i].is_finite() {
                work[i] = orig + eps;
                let fp = self.cost(&work)?;
                work[i] = orig - eps;
                let fm = self.cost(&work)?;
                work[i] = orig;
                grad[i] = (fp - fm) / (2.0 * eps);
                if !grad[i].is_finite() {
                    grad[i] = 0.0;
                }
            }
        }

        Ok(grad)
    }
}

// ---------------------------------------------------------------------------
// Solver runners
// ---------------------------------------------------------------------------

type RunOutcome = (Vec<f64>, f64, u64, bool);

fn run_optimizer(
    objective: &VarianceObjective,
    optimizer: Optimizer,
    init: Vec<f64>,
    max_iter: u64,
) -> Result<RunOutcome> {
    let attempt = match optimizer {
        Optimizer::Bfgs => run_bfgs(objective.clone(), init.clone(), max_iter),
        Optimizer::LBfgs => run_lbfgs(objective.clone(), init.clone(), max_iter),
        Optimizer::NelderMead => run_nelder_mead(objective.clone(), init.clone(), max_iter),
    };
    match attempt {
        Ok(out) => Ok(out),
        Err(_) if optimizer != Optimizer::NelderMead => {
            // gradient-based solver failed outright, fall back to the simplex
            run_nelder_mead(objective.clone(), init, max_iter)
                .map_err(BsmError::OptimizationFailed)
        }
        Err(e) => Err(BsmError::OptimizationFailed(e)),
    }
}

fn run_bfgs(
    objective: VarianceObjective,
    init: Vec<f64>,
    max_iter: u64,
) -> std::result::Result<RunOutcome, String> {
    let n = init.len();
    let linesearch = MoreThuenteLineSearch::new();
    let solver = BFGS::new(linesearch)
        .with_tolerance_grad(1e-6)
        .map_err(|e| e.to_string())?
        .with_tolerance_cost(1e-10)
        .map_err(|e| e.to_string())?;
    let identity: Vec<Vec<f64>> = (0..n)
        .map(|i| (0..n).map(|j| if i == j { 1.0 } else { 0.0 }).collect())
        .collect();

    let result = Executor::new(objective, solver)
        .configure(
            |state: argmin::core::IterState<Vec<f64>, Vec<f64>, (), Vec<Vec<f64>>, (), f64>| {
                state.param(init).inv_hessian(identity).max_iters(max_iter)
            },
        )
        .run()
        .map_err(|e| format!("BFGS failed: {}", e))?;

    let state = result.state();
    let best_param = state
        .get_best_param()
        .ok_or("BFGS: no best parameter found")?
        .clone();
    let best_cost = state.get_best_cost();
    let n_iter = state.get_iter();
    let term_reason = state.get_termination_reason();
    let converged = term_reason == Some(&TerminationReason::SolverConverged)
        || term_reason == Some(&TerminationReason::TargetCostReached);

    Ok((best_param, best_cost, n_iter, converged))
}

fn run_lbfgs(
    objective: VarianceObjective,
    init: Vec<f64>,
    max_iter: u64,
) -> std::result::Result<RunOutcome, String> {
    let linesearch = MoreThuenteLineSearch::new();
    let solver = LBFGS::new(linesearch, 7)
        .with_tolerance_grad(1e-6)
        .map_err(|e| e.to_string())?
        .with_tolerance_cost(1e-10)
        .map_err(|e| e.to_string())?;

    let result = Executor::new(objective, solver)
        .configure(
            |state: argmin::core::IterState<Vec<f64>, Vec<f64>, (), (), (), f64>| {
                state.param(init).max_iters(max_iter)
            },
        )
        .run()
        .map_err(|e| format!("L-BFGS failed: {}", e))?;

    let state = result.state();
    let best_param = state
        .get_best_param()
        .ok_or("L-BFGS: no best parameter found")?
        .clone();
    let best_cost = state.get_best_cost();
    let n_iter = state.get_iter();
    let term_reason = state.get_termination_reason();
    let converged = term_reason == Some(&TerminationReason::SolverConverged)
        || term_reason == Some(&TerminationReason::TargetCostReached);

    Ok((best_param, best_cost, n_iter, converged))
}

fn run_nelder_mead(
    objective: VarianceObjective,
    init: Vec<f64>,
    max_iter: u64,
) -> std::result::Result<RunOutcome, String> {
    let n = init.len();

    // n+1 vertices around the starting point
    let mut simplex = vec![init.clone()];
    for i in 0..n {
        let mut vertex = init.clone();
        let delta = if vertex[i].abs() > 1e-8 {
            vertex[i] * 0.05
        } else {
            0.00025
        };
        vertex[i] += delta;
        simplex.push(vertex);
    }

    let solver = NelderMead::new(simplex)
        .with_sd_tolerance(1e-8)
        .map_err(|e| e.to_string())?;

    let result = Executor::new(objective, solver)
        .configure(
            |state: argmin::core::IterState<Vec<f64>, (), (), (), (), f64>| {
                state.max_iters(max_iter)
            },
        )
        .run()
        .map_err(|e| format!("Nelder-Mead failed: {}", e))?;

    let state = result.state();
    let best_param = state
        .get_best_param()
        .ok_or("Nelder-Mead: no best parameter found")?
        .clone();
    let best_cost = state.get_best_cost();
    let n_iter = state.get_iter();
    let term_reason = state.get_termination_reason();
    let converged = term_reason == Some(&TerminationReason::SolverConverged)
        || term_reason == Some(&TerminationReason::TargetCostReached);

    Ok((best_param, best_cost, n_iter, converged))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
