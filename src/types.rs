use statrs::distribution::{ChiSquared, ContinuousCDF};

use crate::likelihood::DiffuseLikelihood;
use crate::params::BsmParams;
use crate::spec::ModelSpec;

/// Structural components, in the canonical state-layout order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Component {
    Noise,
    Cycle,
    Level,
    Slope,
    Seasonal,
}

impl Component {
    /// All components, in canonical order.
    pub const ALL: [Component; 5] = [
        Component::Noise,
        Component::Cycle,
        Component::Level,
        Component::Slope,
        Component::Seasonal,
    ];

    /// State sub-block dimension for a given observation frequency.
    pub fn dim(&self, period: usize) -> usize {
        match self {
            Component::Noise | Component::Level | Component::Slope => 1,
            Component::Cycle => 2,
            Component::Seasonal => period.saturating_sub(1),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Component::Noise => "noise",
            Component::Cycle => "cycle",
            Component::Level => "level",
            Component::Slope => "slope",
            Component::Seasonal => "seasonal",
        }
    }
}

/// Seasonal disturbance sub-model.
///
/// All three share the negative-sum-and-shift transition; they differ only in
/// how the seasonal disturbance enters the state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeasonalModel {
    /// Scalar disturbance injected into the current seasonal coordinate.
    Dummy,
    /// Independent equal-variance disturbances on every coordinate.
    Crude,
    /// Exchangeable disturbances on the full set of seasonal factors,
    /// projected onto the reduced state (dense covariance).
    HarrisonStevens,
}

/// A variance in a model specification: estimated freely, or held at a fixed
/// value. `Fixed(0.0)` means the component is absent from the state vector.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Variance {
    Free,
    Fixed(f64),
}

impl Variance {
    /// Component contributes a state block.
    pub fn is_active(&self) -> bool {
        match self {
            Variance::Free => true,
            Variance::Fixed(v) => *v > 0.0,
        }
    }

    pub fn is_free(&self) -> bool {
        matches!(self, Variance::Free)
    }
}

/// Optimizer driving the likelihood maximization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Optimizer {
    /// Full quasi-Newton (BFGS) with More-Thuente line search. Default.
    Bfgs,
    /// Limited-memory BFGS.
    LBfgs,
    /// Derivative-free simplex search.
    NelderMead,
}

/// Tuning knobs for [`crate::estimator::estimate`].
#[derive(Debug, Clone)]
pub struct EstimateOptions {
    pub optimizer: Optimizer,
    /// Iteration cap for a single optimizer run.
    pub max_iter: u64,
    /// Free variances below this value (in scale-relative units) become
    /// candidates for the likelihood-ratio reduction pass.
    pub small_variance: f64,
    /// A candidate whose likelihood-ratio statistic falls below this
    /// threshold is permanently fixed to zero.
    pub lr_threshold: f64,
    /// Cap on fit/reduce passes.
    pub outer_passes: usize,
    /// Cap on scale-anchor reassignment rounds inside one fit.
    pub anchor_rounds: usize,
    /// Evaluate the starting-point candidates on a rayon pool.
    pub parallel_init: bool,
}

impl Default for EstimateOptions {
    fn default() -> Self {
        let chi2 = ChiSquared::new(1.0).expect("one degree of freedom");
        Self {
            optimizer: Optimizer::Bfgs,
            max_iter: 300,
            small_variance: 0.2,
            lr_threshold: chi2.inverse_cdf(0.90),
            outer_passes: 4,
            anchor_rounds: 3,
            parallel_init: false,
        }
    }
}

/// Result of one estimation run.
///
/// Immutable once returned. `spec` may differ from the input specification
/// when the reduction pass fixed a component to zero.
#[derive(Debug, Clone)]
pub struct FittedModel {
    /// Fitted variances in original data units.
    pub params: BsmParams,
    /// Likelihood statistics in original data units.
    pub likelihood: DiffuseLikelihood,
    /// Specification after any reduction.
    pub spec: ModelSpec,
    /// Component whose variance anchored the scale during the final fit.
    pub anchor: Component,
    /// True only if the optimizer converged and no component was fixed
    /// during the final pass.
    pub converged: bool,
    pub aic: f64,
    pub bic: f64,
}

impl FittedModel {
    /// Fill in AIC/BIC from the likelihood statistics.
    pub fn with_information_criteria(mut self) -> Self {
        let k = self.likelihood.n_params as f64;
        let n = self.likelihood.n as f64;
        self.aic = -2.0 * self.likelihood.log_likelihood + 2.0 * k;
        self.bic = -2.0 * self.likelihood.log_likelihood + k * n.ln();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_component_dims() {
        assert_eq!(Component::Noise.dim(12), 1);
        assert_eq!(Component::Cycle.dim(12), 2);
        assert_eq!(Component::Level.dim(12), 1);
        assert_eq!(Component::Slope.dim(12), 1);
        assert_eq!(Component::Seasonal.dim(12), 11);
        assert_eq!(Component::Seasonal.dim(4), 3);
    }

    #[test]
    fn test_variance_activity() {
        assert!(Variance::Free.is_active());
        assert!(Variance::Fixed(0.5).is_active());
        assert!(!Variance::Fixed(0.0).is_active());
        assert!(Variance::Free.is_free());
        assert!(!Variance::Fixed(1.0).is_free());
    }

    #[test]
    fn test_default_options() {
        let opts = EstimateOptions::default();
        assert_eq!(opts.optimizer, Optimizer::Bfgs);
        assert!((opts.small_variance - 0.2).abs() < 1e-12);
        // chi-squared(1) 90% quantile
        assert!((opts.lr_threshold - 2.7055).abs() < 1e-3);
        assert_eq!(opts.outer_passes, 4);
        assert!(!opts.parallel_init);
    }
}
