use bsm_rs::{BsmModel, BsmParams, Representation, StateSpace};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

/// Draw a series from the model itself, driving the simulation through the
/// same fast-path operations the filter uses.
pub fn simulate(params: &BsmParams, n: usize, seed: u64) -> Vec<f64> {
    let model = BsmModel::new(params, Representation::FoldedNoise).expect("simulation model");
    let k = model.state_dim();
    let e = model.disturbance_dim(0);
    let meas = model.measurement(0);

    let mut rng = StdRng::seed_from_u64(seed);
    let normal = Normal::new(0.0, 1.0).expect("unit normal");

    let mut state = vec![0.0; k];
    for s in state.iter_mut() {
        *s = normal.sample(&mut rng);
    }

    let mut disturbance = vec![0.0; e];
    let mut y = Vec::with_capacity(n);
    for _ in 0..n {
        let signal: f64 = meas.positions.iter().map(|&p| state[p]).sum();
        let obs_noise = normal.sample(&mut rng) * meas.variance.sqrt();
        y.push(signal + obs_noise);

        model.apply_transition(0, &mut state);
        for u in disturbance.iter_mut() {
            *u = normal.sample(&mut rng);
        }
        model.inject_disturbance(0, &disturbance, &mut state);
    }
    y
}
