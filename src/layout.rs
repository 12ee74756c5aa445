use crate::params::BsmParams;
use crate::types::Component;

/// Offsets of each component's state block.
///
/// Computed once per parameter instantiation and passed around by value, so
/// no other module needs to know how the state vector is ordered. The order
/// is canonical: noise, cycle, level, slope, seasonal. The diffuse blocks
/// (level, slope, seasonal) always form the contiguous tail of the state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentLayout {
    pub noise: Option<usize>,
    pub cycle: Option<usize>,
    pub level: Option<usize>,
    pub slope: Option<usize>,
    pub seasonal: Option<usize>,
    pub seasonal_dim: usize,
    pub state_dim: usize,
    pub diffuse_dim: usize,
}

impl ComponentLayout {
    /// Lay out the state for a parameter set. `explicit_noise` gives the
    /// noise component its own state; otherwise it is folded into the
    /// measurement and takes no state slot.
    pub fn new(params: &BsmParams, explicit_noise: bool) -> Self {
        let mut next = 0usize;
        let mut take = |present: bool, dim: usize| {
            if present {
                let offset = next;
                next += dim;
                Some(offset)
            } else {
                None
            }
        };

        let noise = take(explicit_noise && params.noise > 0.0, 1);
        let cycle = take(params.cycle.is_some(), 2);
        let level = take(params.level.is_some(), 1);
        let slope = take(params.slope.is_some(), 1);
        let seasonal_dim = if params.seasonal.is_some() {
            params.period - 1
        } else {
            0
        };
        let seasonal = take(params.seasonal.is_some(), seasonal_dim);

        let diffuse_dim = level.map_or(0, |_| 1) + slope.map_or(0, |_| 1) + seasonal_dim;

        Self {
            noise,
            cycle,
            level,
            slope,
            seasonal,
            seasonal_dim,
            state_dim: next,
            diffuse_dim,
        }
    }

    pub fn offset(&self, component: Component) -> Option<usize> {
        match component {
            Component::Noise => self.noise,
            Component::Cycle => self.cycle,
            Component::Level => self.level,
            Component::Slope => self.slope,
            Component::Seasonal => self.seasonal,
        }
    }

    /// First diffuse state index; the diffuse block runs to `state_dim`.
    pub fn diffuse_start(&self) -> usize {
        self.state_dim - self.diffuse_dim
    }
}
