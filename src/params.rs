use crate::error::{BsmError, Result};
use crate::spec::ModelSpec;
use crate::types::{Component, SeasonalModel, Variance};

/// Cycle parameters: disturbance variance, damping in [0, 1) and cycle
/// length in years.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CycleParams {
    pub variance: f64,
    pub damping: f64,
    pub length: f64,
}

/// Seasonal parameters: sub-model and disturbance variance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SeasonalParams {
    pub model: SeasonalModel,
    pub variance: f64,
}

/// One concrete numeric instantiation of a [`ModelSpec`].
///
/// Absent components are `None`; present components carry a non-negative
/// variance. Rebuilt from scratch at every optimizer evaluation, so two
/// evaluations never share mutable state.
#[derive(Debug, Clone, PartialEq)]
pub struct BsmParams {
    /// Observations per year.
    pub period: usize,
    /// Measurement-noise variance; zero means no noise component.
    pub noise: f64,
    pub cycle: Option<CycleParams>,
    pub level: Option<f64>,
    pub slope: Option<f64>,
    pub seasonal: Option<SeasonalParams>,
}

impl BsmParams {
    /// Variance of a component, `None` when absent.
    pub fn variance(&self, component: Component) -> Option<f64> {
        match component {
            Component::Noise => (self.noise > 0.0).then_some(self.noise),
            Component::Cycle => self.cycle.map(|c| c.variance),
            Component::Level => self.level,
            Component::Slope => self.slope,
            Component::Seasonal => self.seasonal.map(|s| s.variance),
        }
    }

    /// Active component with the largest variance.
    pub fn max_variance_component(&self) -> (Component, f64) {
        let mut best = (Component::Noise, self.noise);
        for c in Component::ALL {
            if let Some(v) = self.variance(c) {
                if v > best.1 {
                    best = (c, v);
                }
            }
        }
        best
    }

    /// All variances multiplied by `factor`.
    pub fn scaled(&self, factor: f64) -> Self {
        let mut out = self.clone();
        out.noise *= factor;
        if let Some(c) = out.cycle.as_mut() {
            c.variance *= factor;
        }
        if let Some(v) = out.level.as_mut() {
            *v *= factor;
        }
        if let Some(v) = out.slope.as_mut() {
            *v *= factor;
        }
        if let Some(s) = out.seasonal.as_mut() {
            s.variance *= factor;
        }
        out
    }

    /// Copy with one present component's variance replaced. Absent
    /// components stay absent.
    pub fn with_variance(&self, component: Component, value: f64) -> Self {
        let mut out = self.clone();
        match component {
            Component::Noise => out.noise = value,
            Component::Cycle => {
                if let Some(c) = out.cycle.as_mut() {
                    c.variance = value;
                }
            }
            Component::Level => {
                if out.level.is_some() {
                    out.level = Some(value);
                }
            }
            Component::Slope => {
                if out.slope.is_some() {
                    out.slope = Some(value);
                }
            }
            Component::Seasonal => {
                if let Some(s) = out.seasonal.as_mut() {
                    s.variance = value;
                }
            }
        }
        out
    }

    /// Copy with one component removed (its variance forced to zero).
    pub fn without(&self, component: Component) -> Self {
        let mut out = self.clone();
        match component {
            Component::Noise => out.noise = 0.0,
            Component::Cycle => out.cycle = None,
            Component::Level => {
                out.level = None;
                out.slope = None;
            }
            Component::Slope => out.slope = None,
            Component::Seasonal => out.seasonal = None,
        }
        out
    }
}

/// Mapping between the reduced parameter vector seen by the optimizer and a
/// full [`BsmParams`].
///
/// One scalar per free variance, squared on the way in so any real vector
/// maps to a valid non-negative instantiation. When an anchor component is
/// set, its variance is pinned at 1 and excluded from the vector; this
/// resolves the scale invariance of the concentrated likelihood.
#[derive(Debug, Clone)]
pub struct VarianceMapping {
    free: Vec<Component>,
    anchor: Option<Component>,
    template: BsmParams,
}

impl VarianceMapping {
    pub fn new(spec: &ModelSpec, period: usize, anchor: Option<Component>) -> Result<Self> {
        spec.validate(period)?;
        if let Some(a) = anchor {
            if !spec.variance(a).is_free() {
                return Err(BsmError::InvalidSpecification(format!(
                    "anchor component {} is not free",
                    a.name()
                )));
            }
        }
        let free = spec
            .free_components()
            .into_iter()
            .filter(|c| Some(*c) != anchor)
            .collect();

        // Template holds the structure and the fixed variances; free slots
        // are filled by map().
        let var = |v: Variance| match v {
            Variance::Free => 0.0,
            Variance::Fixed(x) => x,
        };
        let template = BsmParams {
            period,
            noise: var(spec.noise),
            cycle: spec.cycle.is_active().then(|| CycleParams {
                variance: var(spec.cycle),
                damping: spec.cycle_damping,
                length: spec.cycle_length,
            }),
            level: spec.level.is_active().then(|| var(spec.level)),
            slope: spec.slope.is_active().then(|| var(spec.slope)),
            seasonal: spec.seasonal.is_active().then(|| SeasonalParams {
                model: spec.seasonal_model,
                variance: var(spec.seasonal),
            }),
        };
        Ok(Self {
            free,
            anchor,
            template,
        })
    }

    /// Number of free scalars.
    pub fn dim(&self) -> usize {
        self.free.len()
    }

    pub fn free_components(&self) -> &[Component] {
        &self.free
    }

    pub fn anchor(&self) -> Option<Component> {
        self.anchor
    }

    /// Reduced vector to full parameters. Variances come out as `x*x`, so
    /// the invariants (all variances >= 0, damping in [0, 1)) hold for any
    /// input.
    pub fn map(&self, x: &[f64]) -> Result<BsmParams> {
        if x.len() != self.free.len() {
            return Err(BsmError::ParamLengthMismatch {
                expected: self.free.len(),
                got: x.len(),
            });
        }
        let mut out = self.template.clone();
        if let Some(a) = self.anchor {
            Self::set_variance(&mut out, a, 1.0);
        }
        for (c, &xi) in self.free.iter().zip(x.iter()) {
            Self::set_variance(&mut out, *c, xi * xi);
        }
        Ok(out)
    }

    /// Inverse of [`map`](Self::map) for admissible parameters.
    pub fn inverse(&self, params: &BsmParams) -> Vec<f64> {
        self.free
            .iter()
            .map(|c| params.variance(*c).unwrap_or(0.0).max(0.0).sqrt())
            .collect()
    }

    /// Neutral starting point: every free variance at 0.1.
    pub fn default_point(&self) -> Vec<f64> {
        vec![0.1f64.sqrt(); self.free.len()]
    }

    fn set_variance(params: &mut BsmParams, component: Component, value: f64) {
        match component {
            Component::Noise => params.noise = value,
            Component::Cycle => {
                if let Some(c) = params.cycle.as_mut() {
                    c.variance = value;
                }
            }
            Component::Level => params.level = Some(value),
            Component::Slope => params.slope = Some(value),
            Component::Seasonal => {
                if let Some(s) = params.seasonal.as_mut() {
                    s.variance = value;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_roundtrip() {
        let spec = ModelSpec::default();
        let mapping = VarianceMapping::new(&spec, 12, None).unwrap();
        assert_eq!(mapping.dim(), 4);

        let x = vec![0.5, 0.8, 0.1, 1.2];
        let params = mapping.map(&x).unwrap();
        assert!((params.noise - 0.25).abs() < 1e-12);
        assert!((params.level.unwrap() - 0.64).abs() < 1e-12);
        assert!((params.slope.unwrap() - 0.01).abs() < 1e-12);
        assert!((params.seasonal.unwrap().variance - 1.44).abs() < 1e-12);

        let back = mapping.inverse(&params);
        for (a, b) in x.iter().zip(back.iter()) {
            assert!((a - b).abs() < 1e-12);
        }
    }

    #[test]
    fn test_anchor_pins_variance() {
        let spec = ModelSpec::default();
        let mapping = VarianceMapping::new(&spec, 12, Some(Component::Level)).unwrap();
        assert_eq!(mapping.dim(), 3);
        assert_eq!(mapping.anchor(), Some(Component::Level));
        assert!(!mapping.free_components().contains(&Component::Level));
        let params = mapping.map(&mapping.default_point()).unwrap();
        assert!((params.level.unwrap() - 1.0).abs() < 1e-12);
        assert!((params.noise - 0.1).abs() < 1e-12);
    }

    #[test]
    fn test_anchor_must_be_free() {
        let spec = ModelSpec::default().with_variance(Component::Level, Variance::Fixed(0.5));
        assert!(VarianceMapping::new(&spec, 12, Some(Component::Level)).is_err());
    }

    #[test]
    fn test_fixed_variance_passes_through() {
        let spec = ModelSpec::default().with_variance(Component::Slope, Variance::Fixed(0.3));
        let mapping = VarianceMapping::new(&spec, 12, None).unwrap();
        assert_eq!(mapping.dim(), 3);
        let params = mapping.map(&vec![0.1; 3]).unwrap();
        assert!((params.slope.unwrap() - 0.3).abs() < 1e-12);
    }

    #[test]
    fn test_length_mismatch() {
        let spec = ModelSpec::default();
        let mapping = VarianceMapping::new(&spec, 12, None).unwrap();
        assert!(mapping.map(&[0.1, 0.2]).is_err());
    }

    #[test]
    fn test_max_variance_component() {
        let spec = ModelSpec::default();
        let mapping = VarianceMapping::new(&spec, 12, None).unwrap();
        let params = mapping.map(&[0.5, 2.0, 0.1, 0.3]).unwrap();
        let (c, v) = params.max_variance_component();
        assert_eq!(c, Component::Level);
        assert!((v - 4.0).abs() < 1e-12);
    }

    #[test]
    fn test_without_level_drops_slope() {
        let spec = ModelSpec::default();
        let mapping = VarianceMapping::new(&spec, 12, None).unwrap();
        let params = mapping.map(&mapping.default_point()).unwrap();
        let reduced = params.without(Component::Level);
        assert!(reduced.level.is_none());
        assert!(reduced.slope.is_none());
        assert!(reduced.seasonal.is_some());
    }

    #[test]
    fn test_scaled() {
        let spec = ModelSpec::default();
        let mapping = VarianceMapping::new(&spec, 12, None).unwrap();
        let params = mapping.map(&[1.0, 1.0, 1.0, 1.0]).unwrap().scaled(2.0);
        assert!((params.noise - 2.0).abs() < 1e-12);
        assert!((params.level.unwrap() - 2.0).abs() < 1e-12);
    }
}
