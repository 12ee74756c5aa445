use crate::error::{BsmError, Result};
use crate::types::{Component, SeasonalModel, Variance};

/// Specification of a basic structural model: which components are present,
/// whether their variances are estimated or fixed, and the shape parameters
/// of the cycle and seasonal blocks.
///
/// Immutable value. The estimation kernel rebuilds it when the reduction
/// pass fixes a component to zero.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelSpec {
    pub noise: Variance,
    pub cycle: Variance,
    pub level: Variance,
    pub slope: Variance,
    pub seasonal: Variance,
    pub seasonal_model: SeasonalModel,
    /// Cycle damping factor, in [0, 1).
    pub cycle_damping: f64,
    /// Cycle length in years.
    pub cycle_length: f64,
}

impl Default for ModelSpec {
    /// Local linear trend plus dummy seasonal plus noise, everything free.
    fn default() -> Self {
        Self {
            noise: Variance::Free,
            cycle: Variance::Fixed(0.0),
            level: Variance::Free,
            slope: Variance::Free,
            seasonal: Variance::Free,
            seasonal_model: SeasonalModel::Dummy,
            cycle_damping: 0.9,
            cycle_length: 8.0,
        }
    }
}

impl ModelSpec {
    pub fn variance(&self, component: Component) -> Variance {
        match component {
            Component::Noise => self.noise,
            Component::Cycle => self.cycle,
            Component::Level => self.level,
            Component::Slope => self.slope,
            Component::Seasonal => self.seasonal,
        }
    }

    /// Copy of the specification with one component's variance replaced.
    pub fn with_variance(&self, component: Component, variance: Variance) -> Self {
        let mut out = self.clone();
        match component {
            Component::Noise => out.noise = variance,
            Component::Cycle => out.cycle = variance,
            Component::Level => out.level = variance,
            Component::Slope => out.slope = variance,
            Component::Seasonal => out.seasonal = variance,
        }
        out
    }

    /// (component, variance) pairs in canonical state order.
    pub fn components(&self) -> [(Component, Variance); 5] {
        [
            (Component::Noise, self.noise),
            (Component::Cycle, self.cycle),
            (Component::Level, self.level),
            (Component::Slope, self.slope),
            (Component::Seasonal, self.seasonal),
        ]
    }

    /// Components with a state block, in canonical order.
    pub fn active_components(&self) -> Vec<Component> {
        self.components()
            .iter()
            .filter(|(_, v)| v.is_active())
            .map(|(c, _)| *c)
            .collect()
    }

    /// Components whose variance is estimated, in canonical order.
    pub fn free_components(&self) -> Vec<Component> {
        self.components()
            .iter()
            .filter(|(_, v)| v.is_free())
            .map(|(c, _)| *c)
            .collect()
    }

    /// Total state dimension for a given observation frequency, counting the
    /// explicit noise state.
    pub fn state_dim(&self, period: usize) -> usize {
        self.active_components()
            .iter()
            .map(|c| c.dim(period))
            .sum()
    }

    /// Reject ill-formed specifications before any model is built.
    pub fn validate(&self, period: usize) -> Result<()> {
        if period == 0 {
            return Err(BsmError::InvalidSpecification(
                "observation frequency must be positive".into(),
            ));
        }
        if self.seasonal.is_active() && period < 2 {
            return Err(BsmError::InvalidSpecification(format!(
                "seasonal component requires period >= 2, got {}",
                period
            )));
        }
        if self.cycle.is_active() {
            if !(0.0..1.0).contains(&self.cycle_damping) {
                return Err(BsmError::InvalidSpecification(format!(
                    "cycle damping must lie in [0, 1), got {}",
                    self.cycle_damping
                )));
            }
            if period as f64 * self.cycle_length <= 0.0 {
                return Err(BsmError::InvalidSpecification(format!(
                    "cycle frequency is undefined: period {} * cycle length {} <= 0",
                    period, self.cycle_length
                )));
            }
        }
        if self.slope.is_active() && !self.level.is_active() {
            return Err(BsmError::InvalidSpecification(
                "slope requires an active level".into(),
            ));
        }
        if self.free_components().is_empty() {
            return Err(BsmError::InvalidSpecification(
                "at least one variance must be free".into(),
            ));
        }
        if !self.cycle.is_active() && !self.level.is_active() && !self.seasonal.is_active() {
            return Err(BsmError::InvalidSpecification(
                "model needs at least one of cycle, level or seasonal".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_spec_valid() {
        let spec = ModelSpec::default();
        assert!(spec.validate(12).is_ok());
        assert_eq!(
            spec.free_components(),
            vec![
                Component::Noise,
                Component::Level,
                Component::Slope,
                Component::Seasonal
            ]
        );
    }

    #[test]
    fn test_default_state_dim() {
        // noise(1) + level(1) + slope(1) + seasonal(11)
        let spec = ModelSpec::default();
        assert_eq!(spec.state_dim(12), 14);
        assert_eq!(spec.state_dim(4), 6);
    }

    #[test]
    fn test_seasonal_needs_period() {
        let spec = ModelSpec::default();
        assert!(spec.validate(1).is_err());
    }

    #[test]
    fn test_slope_needs_level() {
        let spec = ModelSpec::default().with_variance(Component::Level, Variance::Fixed(0.0));
        assert!(spec.validate(12).is_err());
    }

    #[test]
    fn test_cycle_damping_range() {
        let mut spec = ModelSpec {
            cycle: Variance::Free,
            ..ModelSpec::default()
        };
        spec.cycle_damping = 1.0;
        assert!(spec.validate(12).is_err());
        spec.cycle_damping = 0.95;
        assert!(spec.validate(12).is_ok());
    }

    #[test]
    fn test_cycle_length_positive() {
        let spec = ModelSpec {
            cycle: Variance::Free,
            cycle_length: 0.0,
            ..ModelSpec::default()
        };
        assert!(spec.validate(12).is_err());
    }

    #[test]
    fn test_all_fixed_rejected() {
        let spec = ModelSpec {
            noise: Variance::Fixed(1.0),
            cycle: Variance::Fixed(0.0),
            level: Variance::Fixed(1.0),
            slope: Variance::Fixed(0.0),
            seasonal: Variance::Fixed(0.0),
            ..ModelSpec::default()
        };
        assert!(spec.validate(12).is_err());
    }

    #[test]
    fn test_noise_only_rejected() {
        let spec = ModelSpec {
            noise: Variance::Free,
            cycle: Variance::Fixed(0.0),
            level: Variance::Fixed(0.0),
            slope: Variance::Fixed(0.0),
            seasonal: Variance::Fixed(0.0),
            ..ModelSpec::default()
        };
        assert!(spec.validate(12).is_err());
    }

    #[test]
    fn test_with_variance_fixes_component() {
        let spec = ModelSpec::default().with_variance(Component::Slope, Variance::Fixed(0.0));
        assert!(!spec.variance(Component::Slope).is_active());
        assert_eq!(spec.state_dim(12), 13);
    }
}
