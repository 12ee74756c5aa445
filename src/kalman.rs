//! Diffuse Kalman filtering of a state-space model into a log-likelihood.
//!
//! Three algorithms share the `(model, data) -> DiffuseLikelihood` shape and
//! must agree to numerical tolerance; the redundancy cross-checks a delicate
//! recursion:
//!
//! - [`collapsing_loglikelihood`]: augmented filter that absorbs the diffuse
//!   directions into the state once their information matrix is invertible,
//!   then runs as an ordinary Kalman filter. The general-purpose default.
//! - [`steady_state_loglikelihood`]: the collapsing filter plus a fixed-point
//!   check; once the prediction covariance stops moving, the gain and
//!   innovation variance are frozen and reused. Time-invariant models only.
//! - [`augmented_loglikelihood`]: carries every augmented column across the
//!   whole sample and solves one generalized least-squares problem at the
//!   end. Slower, used as the correctness oracle.
//!
//! Missing observations are encoded as NaN; they propagate the state and
//! contribute no information. Regression columns are concentrated out as
//! additional diffuse effects and are never collapsed.

use nalgebra::{Cholesky, DMatrix, DVector, Dyn};

use crate::error::{BsmError, Result};
use crate::likelihood::DiffuseLikelihood;
use crate::model::{disturbance_covariance, StateSpace};

/// Innovation variances at or below this are treated as degenerate.
const F_MIN: f64 = 1e-12;

/// Relative covariance change below which the prediction recursion is
/// considered to have reached its fixed point.
const STEADY_TOL: f64 = 1e-9;

/// Algorithm selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterMethod {
    Collapsing,
    SteadyState,
    Augmented,
}

impl FilterMethod {
    /// Cheapest method that is exact for this model and data shape.
    pub fn preferred<M: StateSpace + ?Sized>(model: &M, has_regression: bool) -> Self {
        if model.is_time_invariant() && !has_regression {
            FilterMethod::SteadyState
        } else {
            FilterMethod::Collapsing
        }
    }
}

/// Evaluate the diffuse log-likelihood with the requested algorithm,
/// falling back to the collapsing filter when the product-form assumptions
/// do not hold.
pub fn loglikelihood<M: StateSpace + ?Sized>(
    model: &M,
    y: &[f64],
    regression: Option<&DMatrix<f64>>,
    method: FilterMethod,
) -> Result<DiffuseLikelihood> {
    match method {
        FilterMethod::Collapsing => collapsing_loglikelihood(model, y, regression),
        FilterMethod::Augmented => augmented_loglikelihood(model, y, regression),
        FilterMethod::SteadyState => {
            if regression.is_some() || !model.is_time_invariant() {
                collapsing_loglikelihood(model, y, regression)
            } else {
                steady_state_loglikelihood(model, y)
            }
        }
    }
}

/// Filtered state trajectories, produced only on request.
#[derive(Debug, Clone)]
pub struct FilterOutput {
    /// One filtered state per observation.
    pub states: Vec<DVector<f64>>,
    /// Filtered state variances (diagonal), per observation.
    pub variances: Vec<DVector<f64>>,
    pub likelihood: DiffuseLikelihood,
}

struct FilterTrace {
    states: Vec<DVector<f64>>,
    variances: Vec<DVector<f64>>,
}

/// Augmented filter with collapse. See the module docs.
pub fn collapsing_loglikelihood<M: StateSpace + ?Sized>(
    model: &M,
    y: &[f64],
    regression: Option<&DMatrix<f64>>,
) -> Result<DiffuseLikelihood> {
    collapsing_core(model, y, regression, None)
}

/// Collapsing filter that also records the filtered state and its variance
/// at every step. Before the collapse the recorded states are conditional on
/// zero diffuse effects; from the collapse on they are fully corrected.
pub fn filtered_states<M: StateSpace + ?Sized>(model: &M, y: &[f64]) -> Result<FilterOutput> {
    let mut trace = FilterTrace {
        states: Vec::with_capacity(y.len()),
        variances: Vec::with_capacity(y.len()),
    };
    let likelihood = collapsing_core(model, y, None, Some(&mut trace))?;
    Ok(FilterOutput {
        states: trace.states,
        variances: trace.variances,
        likelihood,
    })
}

fn collapsing_core<M: StateSpace + ?Sized>(
    model: &M,
    y: &[f64],
    regression: Option<&DMatrix<f64>>,
    mut trace: Option<&mut FilterTrace>,
) -> Result<DiffuseLikelihood> {
    let k = model.state_dim();
    let d = model.diffuse_dim();
    let r = check_regression(y, regression)?;
    let cols = d + r;
    let time_invariant = model.is_time_invariant();
    let meas0 = model.measurement(0);
    let q0 = disturbance_covariance(model, 0);

    let mut a = DVector::<f64>::zeros(k);
    let mut p = DMatrix::<f64>::zeros(k, k);
    let mut c = DMatrix::<f64>::zeros(k, cols);
    init_augmented(model, &mut a, &mut p, &mut c);

    let mut s_mat = DMatrix::<f64>::zeros(cols, cols);
    let mut s_vec = DVector::<f64>::zeros(cols);
    let mut g = vec![0.0; cols];
    let mut pz = DVector::<f64>::zeros(k);
    let mut kg = DVector::<f64>::zeros(k);

    let mut q_acc = 0.0;
    let mut partial_ssq = 0.0;
    let mut ssq = 0.0;
    let mut sum_log_f = 0.0;
    let mut correction = 0.0;
    let mut observed = 0usize;
    let mut collapsed = cols == 0;
    // Regression effects stay augmented across the whole sample: their
    // influence on future observations does not flow through the state, so
    // absorbing them early would be incorrect.
    let collapse_allowed = r == 0;

    for t in 0..y.len() {
        let meas_owned;
        let meas = if time_invariant {
            &meas0
        } else {
            meas_owned = model.measurement(t);
            &meas_owned
        };
        let q_owned;
        let q = if time_invariant {
            &q0
        } else {
            q_owned = disturbance_covariance(model, t);
            &q_owned
        };

        let yt = y[t];
        if yt.is_finite() {
            weighted_columns(&p, &meas.positions, &mut pz);
            let f = sum_at(pz.as_slice(), &meas.positions) + meas.variance;
            if f <= F_MIN {
                return Err(BsmError::NumericalDegeneracy(format!(
                    "non-positive innovation variance {} at t={}",
                    f, t
                )));
            }
            let e = yt - sum_at(a.as_slice(), &meas.positions);
            if collapsed {
                ssq += e * e / f;
            } else {
                let c_data = c.as_slice();
                for (j, gj) in g.iter_mut().enumerate() {
                    let col = &c_data[j * k..(j + 1) * k];
                    let o = if j < d {
                        0.0
                    } else {
                        regression.map_or(0.0, |x| x[(t, j - d)])
                    };
                    *gj = o - sum_at(col, &meas.positions);
                }
                for j in 0..cols {
                    s_vec[j] += g[j] * e / f;
                    for i in 0..cols {
                        s_mat[(i, j)] += g[i] * g[j] / f;
                    }
                }
                q_acc += e * e / f;
            }
            sum_log_f += f.ln();
            observed += 1;

            if let Some(tr) = trace.as_deref_mut() {
                let mut upd = a.clone();
                upd.axpy(e / f, &pz, 1.0);
                tr.states.push(upd);
                let mut var = DVector::zeros(k);
                for i in 0..k {
                    var[i] = p[(i, i)] - pz[i] * pz[i] / f;
                }
                tr.variances.push(var);
            }

            // gain K = T P z / f
            kg.copy_from(&pz);
            model.apply_transition(t, kg.as_mut_slice());
            kg /= f;

            model.apply_transition(t, a.as_mut_slice());
            a.axpy(e, &kg, 1.0);

            if !collapsed {
                let c_data = c.as_mut_slice();
                for (j, &gj) in g.iter().enumerate() {
                    let col = &mut c_data[j * k..(j + 1) * k];
                    model.apply_transition(t, col);
                    for (ci, ki) in col.iter_mut().zip(kg.iter()) {
                        *ci += ki * gj;
                    }
                }
            }

            p.ger(-1.0 / f, &pz, &pz, 1.0);
            predict_covariance(model, t, &mut p, q);
        } else {
            if let Some(tr) = trace.as_deref_mut() {
                tr.states.push(a.clone());
                tr.variances.push(p.diagonal());
            }
            model.apply_transition(t, a.as_mut_slice());
            if !collapsed {
                let c_data = c.as_mut_slice();
                for j in 0..cols {
                    model.apply_transition(t, &mut c_data[j * k..(j + 1) * k]);
                }
            }
            predict_covariance(model, t, &mut p, q);
        }

        if !collapsed && collapse_allowed && observed >= cols {
            if let Some(chol) = Cholesky::new(s_mat.clone()) {
                let theta = chol.solve(&s_vec);
                correction = log_det(&chol);
                partial_ssq = (q_acc - s_vec.dot(&theta)).max(0.0);
                a -= &c * &theta;
                let s_inv = chol.inverse();
                p += &c * &s_inv * c.transpose();
                collapsed = true;
            }
        }
    }

    if !collapsed {
        let chol = Cholesky::new(s_mat).ok_or_else(|| {
            BsmError::NumericalDegeneracy("singular diffuse information matrix".into())
        })?;
        let theta = chol.solve(&s_vec);
        correction = log_det(&chol);
        partial_ssq = (q_acc - s_vec.dot(&theta)).max(0.0);
    }
    if observed <= cols {
        return Err(BsmError::DataError(format!(
            "not enough observations: {} observed for diffuse order {}",
            observed, cols
        )));
    }

    Ok(DiffuseLikelihood::assemble(
        observed - cols,
        cols,
        partial_ssq + ssq,
        sum_log_f,
        correction,
    ))
}

/// Augmented-information filter: the full-sample oracle. See module docs.
pub fn augmented_loglikelihood<M: StateSpace + ?Sized>(
    model: &M,
    y: &[f64],
    regression: Option<&DMatrix<f64>>,
) -> Result<DiffuseLikelihood> {
    let k = model.state_dim();
    let d = model.diffuse_dim();
    let r = check_regression(y, regression)?;
    let cols = d + r;
    let time_invariant = model.is_time_invariant();
    let meas0 = model.measurement(0);
    let q0 = disturbance_covariance(model, 0);

    let mut a = DVector::<f64>::zeros(k);
    let mut p = DMatrix::<f64>::zeros(k, k);
    let mut c = DMatrix::<f64>::zeros(k, cols);
    init_augmented(model, &mut a, &mut p, &mut c);

    let mut s_mat = DMatrix::<f64>::zeros(cols, cols);
    let mut s_vec = DVector::<f64>::zeros(cols);
    let mut g = vec![0.0; cols];
    let mut pz = DVector::<f64>::zeros(k);
    let mut kg = DVector::<f64>::zeros(k);

    let mut q_acc = 0.0;
    let mut sum_log_f = 0.0;
    let mut observed = 0usize;

    for t in 0..y.len() {
        let meas_owned;
        let meas = if time_invariant {
            &meas0
        } else {
            meas_owned = model.measurement(t);
            &meas_owned
        };
        let q_owned;
        let q = if time_invariant {
            &q0
        } else {
            q_owned = disturbance_covariance(model, t);
            &q_owned
        };

        let yt = y[t];
        if yt.is_finite() {
            weighted_columns(&p, &meas.positions, &mut pz);
            let f = sum_at(pz.as_slice(), &meas.positions) + meas.variance;
            if f <= F_MIN {
                return Err(BsmError::NumericalDegeneracy(format!(
                    "non-positive innovation variance {} at t={}",
                    f, t
                )));
            }
            let e = yt - sum_at(a.as_slice(), &meas.positions);
            let c_data = c.as_slice();
            for (j, gj) in g.iter_mut().enumerate() {
                let col = &c_data[j * k..(j + 1) * k];
                let o = if j < d {
                    0.0
                } else {
                    regression.map_or(0.0, |x| x[(t, j - d)])
                };
                *gj = o - sum_at(col, &meas.positions);
            }
            for j in 0..cols {
                s_vec[j] += g[j] * e / f;
                for i in 0..cols {
                    s_mat[(i, j)] += g[i] * g[j] / f;
                }
            }
            q_acc += e * e / f;
            sum_log_f += f.ln();
            observed += 1;

            kg.copy_from(&pz);
            model.apply_transition(t, kg.as_mut_slice());
            kg /= f;

            model.apply_transition(t, a.as_mut_slice());
            a.axpy(e, &kg, 1.0);

            let c_data = c.as_mut_slice();
            for (j, &gj) in g.iter().enumerate() {
                let col = &mut c_data[j * k..(j + 1) * k];
                model.apply_transition(t, col);
                for (ci, ki) in col.iter_mut().zip(kg.iter()) {
                    *ci += ki * gj;
                }
            }

            p.ger(-1.0 / f, &pz, &pz, 1.0);
            predict_covariance(model, t, &mut p, q);
        } else {
            model.apply_transition(t, a.as_mut_slice());
            let c_data = c.as_mut_slice();
            for j in 0..cols {
                model.apply_transition(t, &mut c_data[j * k..(j + 1) * k]);
            }
            predict_covariance(model, t, &mut p, q);
        }
    }

    if observed <= cols {
        return Err(BsmError::DataError(format!(
            "not enough observations: {} observed for diffuse order {}",
            observed, cols
        )));
    }

    let (ssq, correction) = if cols == 0 {
        (q_acc, 0.0)
    } else {
        let chol = Cholesky::new(s_mat).ok_or_else(|| {
            BsmError::NumericalDegeneracy("singular diffuse information matrix".into())
        })?;
        let theta = chol.solve(&s_vec);
        ((q_acc - s_vec.dot(&theta)).max(0.0), log_det(&chol))
    };

    Ok(DiffuseLikelihood::assemble(
        observed - cols,
        cols,
        ssq,
        sum_log_f,
        correction,
    ))
}

/// Product-form filter for time-invariant models: once the prediction
/// covariance reaches its fixed point, the gain and innovation variance are
/// computed once and reused, skipping the covariance recursion entirely.
/// A missing observation perturbs the covariance, so it drops the filter
/// back into the tracking phase until the fixed point is reached again.
pub fn steady_state_loglikelihood<M: StateSpace + ?Sized>(
    model: &M,
    y: &[f64],
) -> Result<DiffuseLikelihood> {
    if !model.is_time_invariant() {
        return Err(BsmError::InvalidSpecification(
            "product-form filtering requires a time-invariant model".into(),
        ));
    }
    let k = model.state_dim();
    let d = model.diffuse_dim();
    let cols = d;
    let meas = model.measurement(0);
    let q = disturbance_covariance(model, 0);

    let mut a = DVector::<f64>::zeros(k);
    let mut p = DMatrix::<f64>::zeros(k, k);
    let mut c = DMatrix::<f64>::zeros(k, cols);
    init_augmented(model, &mut a, &mut p, &mut c);

    let mut s_mat = DMatrix::<f64>::zeros(cols, cols);
    let mut s_vec = DVector::<f64>::zeros(cols);
    let mut g = vec![0.0; cols];
    let mut pz = DVector::<f64>::zeros(k);
    let mut kg = DVector::<f64>::zeros(k);
    let mut p_last = DMatrix::<f64>::zeros(k, k);

    let mut q_acc = 0.0;
    let mut partial_ssq = 0.0;
    let mut ssq = 0.0;
    let mut sum_log_f = 0.0;
    let mut correction = 0.0;
    let mut observed = 0usize;
    let mut collapsed = cols == 0;

    let mut steady = false;
    let mut f_frozen = 0.0;
    let mut kg_frozen = DVector::<f64>::zeros(k);

    for t in 0..y.len() {
        let yt = y[t];
        if yt.is_finite() && collapsed && steady {
            // fixed-point fast path: constant gain, no covariance work
            let e = yt - sum_at(a.as_slice(), &meas.positions);
            ssq += e * e / f_frozen;
            sum_log_f += f_frozen.ln();
            observed += 1;
            model.apply_transition(t, a.as_mut_slice());
            a.axpy(e, &kg_frozen, 1.0);
            continue;
        }

        if yt.is_finite() {
            weighted_columns(&p, &meas.positions, &mut pz);
            let f = sum_at(pz.as_slice(), &meas.positions) + meas.variance;
            if f <= F_MIN {
                return Err(BsmError::NumericalDegeneracy(format!(
                    "non-positive innovation variance {} at t={}",
                    f, t
                )));
            }
            let e = yt - sum_at(a.as_slice(), &meas.positions);
            if collapsed {
                ssq += e * e / f;
            } else {
                let c_data = c.as_slice();
                for (j, gj) in g.iter_mut().enumerate() {
                    *gj = -sum_at(&c_data[j * k..(j + 1) * k], &meas.positions);
                }
                for j in 0..cols {
                    s_vec[j] += g[j] * e / f;
                    for i in 0..cols {
                        s_mat[(i, j)] += g[i] * g[j] / f;
                    }
                }
                q_acc += e * e / f;
            }
            sum_log_f += f.ln();
            observed += 1;

            kg.copy_from(&pz);
            model.apply_transition(t, kg.as_mut_slice());
            kg /= f;

            model.apply_transition(t, a.as_mut_slice());
            a.axpy(e, &kg, 1.0);

            if !collapsed {
                let c_data = c.as_mut_slice();
                for (j, &gj) in g.iter().enumerate() {
                    let col = &mut c_data[j * k..(j + 1) * k];
                    model.apply_transition(t, col);
                    for (ci, ki) in col.iter_mut().zip(kg.iter()) {
                        *ci += ki * gj;
                    }
                }
            }

            p.ger(-1.0 / f, &pz, &pz, 1.0);
            predict_covariance(model, t, &mut p, &q);
        } else {
            steady = false;
            model.apply_transition(t, a.as_mut_slice());
            if !collapsed {
                let c_data = c.as_mut_slice();
                for j in 0..cols {
                    model.apply_transition(t, &mut c_data[j * k..(j + 1) * k]);
                }
            }
            predict_covariance(model, t, &mut p, &q);
        }

        if !collapsed && observed >= cols {
            if let Some(chol) = Cholesky::new(s_mat.clone()) {
                let theta = chol.solve(&s_vec);
                correction = log_det(&chol);
                partial_ssq = (q_acc - s_vec.dot(&theta)).max(0.0);
                a -= &c * &theta;
                let s_inv = chol.inverse();
                p += &c * &s_inv * c.transpose();
                collapsed = true;
                p_last.copy_from(&p);
                continue;
            }
        }

        if collapsed && !steady {
            let mut delta = 0.0f64;
            for (x, y_) in p.iter().zip(p_last.iter()) {
                delta = delta.max((x - y_).abs());
            }
            p_last.copy_from(&p);
            if delta < STEADY_TOL * (1.0 + p.amax()) {
                weighted_columns(&p, &meas.positions, &mut pz);
                f_frozen = sum_at(pz.as_slice(), &meas.positions) + meas.variance;
                if f_frozen <= F_MIN {
                    return Err(BsmError::NumericalDegeneracy(
                        "non-positive steady-state innovation variance".into(),
                    ));
                }
                kg_frozen.copy_from(&pz);
                model.apply_transition(t, kg_frozen.as_mut_slice());
                kg_frozen /= f_frozen;
                steady = true;
            }
        }
    }

    if !collapsed {
        let chol = Cholesky::new(s_mat).ok_or_else(|| {
            BsmError::NumericalDegeneracy("singular diffuse information matrix".into())
        })?;
        let theta = chol.solve(&s_vec);
        correction = log_det(&chol);
        partial_ssq = (q_acc - s_vec.dot(&theta)).max(0.0);
    }
    if observed <= cols {
        return Err(BsmError::DataError(format!(
            "not enough observations: {} observed for diffuse order {}",
            observed, cols
        )));
    }

    Ok(DiffuseLikelihood::assemble(
        observed - cols,
        cols,
        partial_ssq + ssq,
        sum_log_f,
        correction,
    ))
}

fn check_regression(y: &[f64], regression: Option<&DMatrix<f64>>) -> Result<usize> {
    match regression {
        Some(x) => {
            if x.nrows() != y.len() {
                return Err(BsmError::DataError(format!(
                    "regression matrix has {} rows but the series has {} observations",
                    x.nrows(),
                    y.len()
                )));
            }
            Ok(x.ncols())
        }
        None => Ok(0),
    }
}

/// Initial mean, proper covariance and augmented columns. The diffuse
/// columns start at minus the constraint matrix so that every augmented
/// innovation carries the same sign convention as a regression column.
fn init_augmented<M: StateSpace + ?Sized>(
    model: &M,
    a: &mut DVector<f64>,
    p: &mut DMatrix<f64>,
    c: &mut DMatrix<f64>,
) {
    let k = model.state_dim();
    let d = model.diffuse_dim();
    let mut constraints = DMatrix::<f64>::zeros(k, d);
    model.initial_state(a, p, &mut constraints);
    for j in 0..d {
        for i in 0..k {
            c[(i, j)] = -constraints[(i, j)];
        }
    }
}

fn sum_at(x: &[f64], positions: &[usize]) -> f64 {
    positions.iter().map(|&i| x[i]).sum()
}

/// `out = P z` for a 0/1 selection vector z: the sum of the selected
/// columns.
fn weighted_columns(p: &DMatrix<f64>, positions: &[usize], out: &mut DVector<f64>) {
    out.fill(0.0);
    let k = p.nrows();
    let data = p.as_slice();
    for &pos in positions {
        let col = &data[pos * k..(pos + 1) * k];
        for (o, v) in out.iter_mut().zip(col.iter()) {
            *o += v;
        }
    }
}

/// `P <- T P T' + Q` through the matrix-free transition, then re-symmetrize
/// against roundoff drift.
fn predict_covariance<M: StateSpace + ?Sized>(
    model: &M,
    t: usize,
    p: &mut DMatrix<f64>,
    q: &DMatrix<f64>,
) {
    let k = p.nrows();
    {
        let data = p.as_mut_slice();
        for j in 0..k {
            model.apply_transition(t, &mut data[j * k..(j + 1) * k]);
        }
    }
    p.transpose_mut();
    {
        let data = p.as_mut_slice();
        for j in 0..k {
            model.apply_transition(t, &mut data[j * k..(j + 1) * k]);
        }
    }
    *p += q;
    for j in 0..k {
        for i in (j + 1)..k {
            let v = 0.5 * (p[(i, j)] + p[(j, i)]);
            p[(i, j)] = v;
            p[(j, i)] = v;
        }
    }
}

fn log_det(chol: &Cholesky<f64, Dyn>) -> f64 {
    let l = chol.l();
    2.0 * (0..l.nrows()).map(|i| l[(i, i)].ln()).sum::<f64>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BsmModel, Representation};
    use crate::params::{BsmParams, SeasonalParams};
    use crate::types::SeasonalModel;

    fn local_level_params(noise: f64, level: f64) -> BsmParams {
        BsmParams {
            period: 12,
            noise,
            cycle: None,
            level: Some(level),
            slope: None,
            seasonal: None,
        }
    }

    fn seasonal_params() -> BsmParams {
        BsmParams {
            period: 4,
            noise: 1.0,
            cycle: None,
            level: Some(0.5),
            slope: Some(0.05),
            seasonal: Some(SeasonalParams {
                model: SeasonalModel::Dummy,
                variance: 0.3,
            }),
        }
    }

    fn wavy_series(n: usize) -> Vec<f64> {
        (0..n)
            .map(|t| {
                let t = t as f64;
                0.05 * t + (t * 0.7).sin() + 0.4 * (t * 2.3).cos()
            })
            .collect()
    }

    /// Scalar reference recursion for the local level model: the diffuse
    /// first observation fixes the level, every later step is textbook
    /// univariate Kalman filtering.
    fn local_level_reference(y: &[f64], noise: f64, level_var: f64) -> DiffuseLikelihood {
        let mut a = y[0];
        let mut p = noise + level_var;
        let mut ssq = 0.0;
        let mut sum_log_f = noise.ln();
        let correction = (1.0 / noise).ln();
        for &yt in &y[1..] {
            let f = p + noise;
            let e = yt - a;
            ssq += e * e / f;
            sum_log_f += f.ln();
            a += p / f * e;
            p = p - p * p / f + level_var;
        }
        DiffuseLikelihood::assemble(y.len() - 1, 1, ssq, sum_log_f, correction)
    }

    #[test]
    fn test_local_level_matches_reference() {
        let y = vec![1.0, 2.0, 1.5, 1.8, 2.4, 2.1, 2.6];
        let noise = 0.8;
        let level_var = 0.5;
        let model =
            BsmModel::new(&local_level_params(noise, level_var), Representation::FoldedNoise)
                .unwrap();
        let reference = local_level_reference(&y, noise, level_var);
        for method in [
            FilterMethod::Collapsing,
            FilterMethod::SteadyState,
            FilterMethod::Augmented,
        ] {
            let ll = loglikelihood(&model, &y, None, method).unwrap();
            assert_eq!(ll.n, y.len() - 1);
            assert_eq!(ll.diffuse_order, 1);
            assert!(
                (ll.log_likelihood - reference.log_likelihood).abs() < 1e-9,
                "{:?}: {} vs {}",
                method,
                ll.log_likelihood,
                reference.log_likelihood
            );
            assert!((ll.ssq - reference.ssq).abs() < 1e-9);
        }
    }

    #[test]
    fn test_three_algorithms_agree_seasonal() {
        let y = wavy_series(90);
        let model = BsmModel::new(&seasonal_params(), Representation::FoldedNoise).unwrap();
        let a = collapsing_loglikelihood(&model, &y, None).unwrap();
        let b = steady_state_loglikelihood(&model, &y).unwrap();
        let c = augmented_loglikelihood(&model, &y, None).unwrap();
        let tol = 1e-6 * a.log_likelihood.abs();
        assert!((a.log_likelihood - b.log_likelihood).abs() < tol);
        assert!((a.log_likelihood - c.log_likelihood).abs() < tol);
        assert!((a.scale - b.scale).abs() < 1e-6 * a.scale);
        assert!((a.scale - c.scale).abs() < 1e-6 * a.scale);
    }

    #[test]
    fn test_representations_agree() {
        let y = wavy_series(60);
        let params = seasonal_params();
        let explicit = BsmModel::new(&params, Representation::ExplicitNoise).unwrap();
        let folded = BsmModel::new(&params, Representation::FoldedNoise).unwrap();
        let a = collapsing_loglikelihood(&explicit, &y, None).unwrap();
        let b = collapsing_loglikelihood(&folded, &y, None).unwrap();
        assert!(
            (a.log_likelihood - b.log_likelihood).abs() < 1e-8 * a.log_likelihood.abs().max(1.0)
        );
        assert_eq!(a.n, b.n);
    }

    #[test]
    fn test_missing_observations_counted_out() {
        let mut y = wavy_series(50);
        y[3] = f64::NAN;
        y[17] = f64::NAN;
        y[18] = f64::NAN;
        let model = BsmModel::new(&seasonal_params(), Representation::FoldedNoise).unwrap();
        let ll = collapsing_loglikelihood(&model, &y, None).unwrap();
        assert!(ll.log_likelihood.is_finite());
        // 47 observed minus 5 diffuse directions (level, slope, 3 seasonal)
        assert_eq!(ll.n, 42);

        let b = augmented_loglikelihood(&model, &y, None).unwrap();
        assert!((ll.log_likelihood - b.log_likelihood).abs() < 1e-7);
        let c = steady_state_loglikelihood(&model, &y).unwrap();
        assert!((ll.log_likelihood - c.log_likelihood).abs() < 1e-7);
    }

    #[test]
    fn test_all_missing_tail_equals_truncation() {
        let y = wavy_series(40);
        let mut padded = y.clone();
        padded.extend(std::iter::repeat(f64::NAN).take(10));
        let model = BsmModel::new(&seasonal_params(), Representation::FoldedNoise).unwrap();
        let full = collapsing_loglikelihood(&model, &y, None).unwrap();
        let pad = collapsing_loglikelihood(&model, &padded, None).unwrap();
        assert!((full.log_likelihood - pad.log_likelihood).abs() < 1e-9);
        assert_eq!(full.n, pad.n);
    }

    #[test]
    fn test_regression_effect_concentrated_exactly() {
        let base = wavy_series(70);
        let x: Vec<f64> = (0..70).map(|t| ((t % 7) as f64) - 3.0).collect();
        let shifted: Vec<f64> = base.iter().zip(x.iter()).map(|(b, xi)| b + 2.5 * xi).collect();
        let xmat = DMatrix::from_column_slice(70, 1, &x);

        let model = BsmModel::new(&seasonal_params(), Representation::FoldedNoise).unwrap();
        let plain = collapsing_loglikelihood(&model, &base, Some(&xmat)).unwrap();
        let moved = collapsing_loglikelihood(&model, &shifted, Some(&xmat)).unwrap();
        // the concentrated column absorbs the shift without a trace
        assert!((plain.log_likelihood - moved.log_likelihood).abs() < 1e-7);

        let oracle = augmented_loglikelihood(&model, &shifted, Some(&xmat)).unwrap();
        assert!((moved.log_likelihood - oracle.log_likelihood).abs() < 1e-8);
        assert_eq!(moved.diffuse_order, model.diffuse_dim() + 1);
        assert_eq!(moved.n, 70 - model.diffuse_dim() - 1);
    }

    #[test]
    fn test_regression_row_mismatch_rejected() {
        let y = wavy_series(30);
        let xmat = DMatrix::from_element(20, 1, 1.0);
        let model = BsmModel::new(&seasonal_params(), Representation::FoldedNoise).unwrap();
        assert!(matches!(
            collapsing_loglikelihood(&model, &y, Some(&xmat)),
            Err(BsmError::DataError(_))
        ));
    }

    #[test]
    fn test_too_short_series_rejected() {
        let y = vec![1.0, 2.0, 3.0];
        let model = BsmModel::new(&seasonal_params(), Representation::FoldedNoise).unwrap();
        assert!(collapsing_loglikelihood(&model, &y, None).is_err());
    }

    #[test]
    fn test_preferred_method() {
        let model = BsmModel::new(&seasonal_params(), Representation::FoldedNoise).unwrap();
        assert_eq!(
            FilterMethod::preferred(&model, false),
            FilterMethod::SteadyState
        );
        assert_eq!(
            FilterMethod::preferred(&model, true),
            FilterMethod::Collapsing
        );
    }

    #[test]
    fn test_filtered_states_shape() {
        let y = wavy_series(40);
        let model = BsmModel::new(&seasonal_params(), Representation::FoldedNoise).unwrap();
        let out = filtered_states(&model, &y).unwrap();
        assert_eq!(out.states.len(), y.len());
        assert_eq!(out.variances.len(), y.len());
        assert_eq!(out.states[0].len(), model.state_dim());
        let scalar = collapsing_loglikelihood(&model, &y, None).unwrap();
        assert!((out.likelihood.log_likelihood - scalar.log_likelihood).abs() < 1e-12);
        // late filtered variances are finite and non-negative
        for v in out.variances.last().unwrap().iter() {
            assert!(*v >= -1e-9 && v.is_finite());
        }
    }
}
