use nalgebra::{Cholesky, DMatrix, DVector};

use crate::error::{BsmError, Result};
use crate::layout::ComponentLayout;
use crate::params::BsmParams;
use crate::types::SeasonalModel;

/// How the noise component is realized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Representation {
    /// Noise occupies state slot 0. Simplifies component extraction.
    ExplicitNoise,
    /// Noise variance is folded into the measurement equation; one state
    /// less, preferred for raw likelihood evaluation.
    FoldedNoise,
}

/// Measurement equation: the observation is the sum of the states at
/// `positions`, plus a Gaussian error with variance `variance`.
#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    pub positions: Vec<usize>,
    pub variance: f64,
}

/// Contract every concrete state-space model satisfies.
///
/// The `apply_*` and `*_disturbance` methods are matrix-free fast paths; each
/// must agree with the corresponding dense operator to floating-point
/// rounding. The dense forms exist for initialization and diagnostics only.
pub trait StateSpace {
    fn state_dim(&self) -> usize;

    /// Number of formally infinite-variance initial directions.
    fn diffuse_dim(&self) -> usize;

    fn is_diffuse(&self) -> bool {
        self.diffuse_dim() > 0
    }

    /// True when the transition, disturbance and measurement do not depend
    /// on time. Checked once at construction by filters that exploit it.
    fn is_time_invariant(&self) -> bool;

    /// Fill the initial mean (conventionally zero), the proper-part
    /// covariance and the constraint matrix whose columns span the diffuse
    /// subspace.
    fn initial_state(
        &self,
        mean: &mut DVector<f64>,
        proper: &mut DMatrix<f64>,
        diffuse: &mut DMatrix<f64>,
    );

    /// Dense transition matrix.
    fn transition(&self, t: usize, out: &mut DMatrix<f64>);

    /// In-place `x <- T x`.
    fn apply_transition(&self, t: usize, x: &mut [f64]);

    /// In-place `x <- T' x`.
    fn apply_transition_transpose(&self, t: usize, x: &mut [f64]);

    /// Number of disturbance channels.
    fn disturbance_dim(&self, t: usize) -> usize;

    /// Fill `out` (state_dim x disturbance_dim) with a factor S such that
    /// the disturbance covariance is S S'.
    fn disturbance_factor(&self, t: usize, out: &mut DMatrix<f64>);

    /// `x += S u`.
    fn inject_disturbance(&self, t: usize, u: &[f64], x: &mut [f64]);

    /// `out = S' x`.
    fn project_disturbance(&self, t: usize, x: &[f64], out: &mut [f64]);

    fn measurement(&self, t: usize) -> Measurement;
}

/// Dense disturbance covariance S S', assembled through the contract.
pub fn disturbance_covariance<M: StateSpace + ?Sized>(model: &M, t: usize) -> DMatrix<f64> {
    let k = model.state_dim();
    let e = model.disturbance_dim(t);
    let mut s = DMatrix::zeros(k, e);
    model.disturbance_factor(t, &mut s);
    &s * s.transpose()
}

struct CycleBlock {
    /// damping * cos(2 pi / (period * length))
    cos: f64,
    /// damping * sin(2 pi / (period * length))
    sin: f64,
    variance: f64,
    /// Stationary marginal variance, variance / (1 - damping^2).
    initial_variance: f64,
}

struct SeasonalBlock {
    dim: usize,
    /// Local factor F with block covariance F F'; dim x channel count.
    /// Computed once per model and reused.
    factor: DMatrix<f64>,
}

/// Basic structural model in state-space form: noise, cycle, level, slope
/// and seasonal blocks, each present according to the parameter set.
///
/// Value object: built per parameter instantiation, never mutated.
pub struct BsmModel {
    layout: ComponentLayout,
    representation: Representation,
    /// Noise variance carried on the measurement (folded representation).
    measurement_variance: f64,
    /// Noise variance carried by the explicit noise state.
    noise_variance: f64,
    cycle: Option<CycleBlock>,
    level_variance: Option<f64>,
    slope_variance: Option<f64>,
    seasonal: Option<SeasonalBlock>,
}

impl BsmModel {
    pub fn new(params: &BsmParams, representation: Representation) -> Result<Self> {
        if params.seasonal.is_some() && params.period < 2 {
            return Err(BsmError::InvalidSpecification(format!(
                "seasonal component requires period >= 2, got {}",
                params.period
            )));
        }
        if params.slope.is_some() && params.level.is_none() {
            return Err(BsmError::InvalidSpecification(
                "slope requires an active level".into(),
            ));
        }
        for c in [
            Some(params.noise),
            params.cycle.map(|c| c.variance),
            params.level,
            params.slope,
            params.seasonal.map(|s| s.variance),
        ]
        .into_iter()
        .flatten()
        {
            if c < 0.0 || !c.is_finite() {
                return Err(BsmError::InvalidSpecification(format!(
                    "variances must be finite and non-negative, got {}",
                    c
                )));
            }
        }

        let cycle = match params.cycle {
            Some(c) => {
                if !(0.0..1.0).contains(&c.damping) {
                    return Err(BsmError::InvalidSpecification(format!(
                        "cycle damping must lie in [0, 1), got {}",
                        c.damping
                    )));
                }
                let span = params.period as f64 * c.length;
                if span <= 0.0 {
                    return Err(BsmError::InvalidSpecification(format!(
                        "cycle frequency is undefined: period {} * cycle length {} <= 0",
                        params.period, c.length
                    )));
                }
                let lambda = 2.0 * std::f64::consts::PI / span;
                Some(CycleBlock {
                    cos: c.damping * lambda.cos(),
                    sin: c.damping * lambda.sin(),
                    variance: c.variance,
                    initial_variance: c.variance / (1.0 - c.damping * c.damping),
                })
            }
            None => None,
        };

        let seasonal = match params.seasonal {
            Some(s) => {
                let dim = params.period - 1;
                Some(SeasonalBlock {
                    dim,
                    factor: seasonal_factor(s.model, s.variance, params.period)?,
                })
            }
            None => None,
        };

        let explicit = representation == Representation::ExplicitNoise;
        let layout = ComponentLayout::new(params, explicit);
        if layout.state_dim == 0 {
            return Err(BsmError::InvalidSpecification(
                "model has an empty state vector".into(),
            ));
        }

        Ok(Self {
            layout,
            representation,
            measurement_variance: if explicit { 0.0 } else { params.noise },
            noise_variance: if explicit { params.noise } else { 0.0 },
            cycle,
            level_variance: params.level,
            slope_variance: params.slope,
            seasonal,
        })
    }

    pub fn layout(&self) -> &ComponentLayout {
        &self.layout
    }

    pub fn representation(&self) -> Representation {
        self.representation
    }
}

/// Local seasonal disturbance factor: dim x 1 for the dummy form, a scaled
/// identity for the crude form, and the Cholesky factor of the exchangeable
/// kernel sigma^2 (I - 11'/period) for the Harrison-Stevens form.
fn seasonal_factor(model: SeasonalModel, variance: f64, period: usize) -> Result<DMatrix<f64>> {
    let dim = period - 1;
    if variance <= 0.0 {
        return Ok(DMatrix::zeros(dim, 0));
    }
    let sd = variance.sqrt();
    match model {
        SeasonalModel::Dummy => {
            let mut f = DMatrix::zeros(dim, 1);
            f[(0, 0)] = sd;
            Ok(f)
        }
        SeasonalModel::Crude => Ok(DMatrix::identity(dim, dim) * sd),
        SeasonalModel::HarrisonStevens => {
            let share = 1.0 / period as f64;
            let mut q = DMatrix::from_element(dim, dim, -variance * share);
            for i in 0..dim {
                q[(i, i)] = variance * (1.0 - share);
            }
            let chol = Cholesky::new(q).ok_or_else(|| {
                BsmError::NumericalDegeneracy(
                    "seasonal covariance kernel is not positive definite".into(),
                )
            })?;
            Ok(chol.l())
        }
    }
}

impl StateSpace for BsmModel {
    fn state_dim(&self) -> usize {
        self.layout.state_dim
    }

    fn diffuse_dim(&self) -> usize {
        self.layout.diffuse_dim
    }

    fn is_time_invariant(&self) -> bool {
        true
    }

    fn initial_state(
        &self,
        mean: &mut DVector<f64>,
        proper: &mut DMatrix<f64>,
        diffuse: &mut DMatrix<f64>,
    ) {
        mean.fill(0.0);
        proper.fill(0.0);
        diffuse.fill(0.0);
        if let Some(o) = self.layout.noise {
            proper[(o, o)] = self.noise_variance;
        }
        if let (Some(o), Some(c)) = (self.layout.cycle, self.cycle.as_ref()) {
            proper[(o, o)] = c.initial_variance;
            proper[(o + 1, o + 1)] = c.initial_variance;
        }
        for (column, state) in (self.layout.diffuse_start()..self.layout.state_dim).enumerate() {
            diffuse[(state, column)] = 1.0;
        }
    }

    fn transition(&self, _t: usize, out: &mut DMatrix<f64>) {
        out.fill(0.0);
        // Noise row stays zero: the state is redrawn each step.
        if let (Some(o), Some(c)) = (self.layout.cycle, self.cycle.as_ref()) {
            out[(o, o)] = c.cos;
            out[(o, o + 1)] = c.sin;
            out[(o + 1, o)] = -c.sin;
            out[(o + 1, o + 1)] = c.cos;
        }
        if let Some(l) = self.layout.level {
            out[(l, l)] = 1.0;
            if let Some(s) = self.layout.slope {
                out[(l, s)] = 1.0;
                out[(s, s)] = 1.0;
            }
        }
        if let Some(o) = self.layout.seasonal {
            let dim = self.layout.seasonal_dim;
            for j in 0..dim {
                out[(o, o + j)] = -1.0;
            }
            for i in 1..dim {
                out[(o + i, o + i - 1)] = 1.0;
            }
        }
    }

    fn apply_transition(&self, _t: usize, x: &mut [f64]) {
        if let Some(o) = self.layout.noise {
            x[o] = 0.0;
        }
        if let (Some(o), Some(c)) = (self.layout.cycle, self.cycle.as_ref()) {
            let (a, b) = (x[o], x[o + 1]);
            x[o] = c.cos * a + c.sin * b;
            x[o + 1] = -c.sin * a + c.cos * b;
        }
        if let (Some(l), Some(s)) = (self.layout.level, self.layout.slope) {
            x[l] += x[s];
        }
        if let Some(o) = self.layout.seasonal {
            let dim = self.layout.seasonal_dim;
            let total: f64 = x[o..o + dim].iter().sum();
            for i in (1..dim).rev() {
                x[o + i] = x[o + i - 1];
            }
            x[o] = -total;
        }
    }

    fn apply_transition_transpose(&self, _t: usize, x: &mut [f64]) {
        if let Some(o) = self.layout.noise {
            x[o] = 0.0;
        }
        if let (Some(o), Some(c)) = (self.layout.cycle, self.cycle.as_ref()) {
            let (a, b) = (x[o], x[o + 1]);
            x[o] = c.cos * a - c.sin * b;
            x[o + 1] = c.sin * a + c.cos * b;
        }
        if let (Some(l), Some(s)) = (self.layout.level, self.layout.slope) {
            x[s] += x[l];
        }
        if let Some(o) = self.layout.seasonal {
            let dim = self.layout.seasonal_dim;
            let head = x[o];
            for j in 0..dim - 1 {
                x[o + j] = x[o + j + 1] - head;
            }
            x[o + dim - 1] = -head;
        }
    }

    fn disturbance_dim(&self, _t: usize) -> usize {
        let mut e = 0;
        if self.layout.noise.is_some() {
            e += 1;
        }
        if let Some(c) = self.cycle.as_ref() {
            if c.variance > 0.0 {
                e += 2;
            }
        }
        if self.level_variance.unwrap_or(0.0) > 0.0 {
            e += 1;
        }
        if self.slope_variance.unwrap_or(0.0) > 0.0 {
            e += 1;
        }
        if let Some(s) = self.seasonal.as_ref() {
            e += s.factor.ncols();
        }
        e
    }

    fn disturbance_factor(&self, _t: usize, out: &mut DMatrix<f64>) {
        out.fill(0.0);
        let mut channel = 0;
        if let Some(o) = self.layout.noise {
            out[(o, channel)] = self.noise_variance.sqrt();
            channel += 1;
        }
        if let (Some(o), Some(c)) = (self.layout.cycle, self.cycle.as_ref()) {
            if c.variance > 0.0 {
                let sd = c.variance.sqrt();
                out[(o, channel)] = sd;
                out[(o + 1, channel + 1)] = sd;
                channel += 2;
            }
        }
        if let Some(o) = self.layout.level {
            let v = self.level_variance.unwrap_or(0.0);
            if v > 0.0 {
                out[(o, channel)] = v.sqrt();
                channel += 1;
            }
        }
        if let Some(o) = self.layout.slope {
            let v = self.slope_variance.unwrap_or(0.0);
            if v > 0.0 {
                out[(o, channel)] = v.sqrt();
                channel += 1;
            }
        }
        if let (Some(o), Some(s)) = (self.layout.seasonal, self.seasonal.as_ref()) {
            for c in 0..s.factor.ncols() {
                for r in 0..s.dim {
                    out[(o + r, channel + c)] = s.factor[(r, c)];
                }
            }
        }
    }

    fn inject_disturbance(&self, _t: usize, u: &[f64], x: &mut [f64]) {
        let mut channel = 0;
        if let Some(o) = self.layout.noise {
            x[o] += self.noise_variance.sqrt() * u[channel];
            channel += 1;
        }
        if let (Some(o), Some(c)) = (self.layout.cycle, self.cycle.as_ref()) {
            if c.variance > 0.0 {
                let sd = c.variance.sqrt();
                x[o] += sd * u[channel];
                x[o + 1] += sd * u[channel + 1];
                channel += 2;
            }
        }
        if let Some(o) = self.layout.level {
            let v = self.level_variance.unwrap_or(0.0);
            if v > 0.0 {
                x[o] += v.sqrt() * u[channel];
                channel += 1;
            }
        }
        if let Some(o) = self.layout.slope {
            let v = self.slope_variance.unwrap_or(0.0);
            if v > 0.0 {
                x[o] += v.sqrt() * u[channel];
                channel += 1;
            }
        }
        if let (Some(o), Some(s)) = (self.layout.seasonal, self.seasonal.as_ref()) {
            for c in 0..s.factor.ncols() {
                let uc = u[channel + c];
                for r in 0..s.dim {
                    x[o + r] += s.factor[(r, c)] * uc;
                }
            }
        }
    }

    fn project_disturbance(&self, _t: usize, x: &[f64], out: &mut [f64]) {
        let mut channel = 0;
        if let Some(o) = self.layout.noise {
            out[channel] = self.noise_variance.sqrt() * x[o];
            channel += 1;
        }
        if let (Some(o), Some(c)) = (self.layout.cycle, self.cycle.as_ref()) {
            if c.variance > 0.0 {
                let sd = c.variance.sqrt();
                out[channel] = sd * x[o];
                out[channel + 1] = sd * x[o + 1];
                channel += 2;
            }
        }
        if let Some(o) = self.layout.level {
            let v = self.level_variance.unwrap_or(0.0);
            if v > 0.0 {
                out[channel] = v.sqrt() * x[o];
                channel += 1;
            }
        }
        if let Some(o) = self.layout.slope {
            let v = self.slope_variance.unwrap_or(0.0);
            if v > 0.0 {
                out[channel] = v.sqrt() * x[o];
                channel += 1;
            }
        }
        if let (Some(o), Some(s)) = (self.layout.seasonal, self.seasonal.as_ref()) {
            for c in 0..s.factor.ncols() {
                let mut acc = 0.0;
                for r in 0..s.dim {
                    acc += s.factor[(r, c)] * x[o + r];
                }
                out[channel + c] = acc;
            }
        }
    }

    fn measurement(&self, _t: usize) -> Measurement {
        let mut positions = Vec::with_capacity(4);
        if let Some(o) = self.layout.noise {
            positions.push(o);
        }
        if let Some(o) = self.layout.cycle {
            positions.push(o);
        }
        if let Some(o) = self.layout.level {
            positions.push(o);
        }
        if let Some(o) = self.layout.seasonal {
            positions.push(o);
        }
        Measurement {
            positions,
            variance: self.measurement_variance,
        }
    }
}
