//! The three likelihood algorithms are numerically distinct but must agree
//! on every valid model and series.

mod common;

use bsm_rs::{
    augmented_loglikelihood, collapsing_loglikelihood, steady_state_loglikelihood, BsmModel,
    BsmParams, CycleParams, Representation, SeasonalModel, SeasonalParams, StateSpace,
};

fn monthly_default() -> BsmParams {
    BsmParams {
        period: 12,
        noise: 1.0,
        cycle: None,
        level: Some(1.0),
        slope: Some(1.0),
        seasonal: Some(SeasonalParams {
            model: SeasonalModel::Dummy,
            variance: 1.0,
        }),
    }
}

fn assert_agreement(params: &BsmParams, y: &[f64]) {
    let model = BsmModel::new(params, Representation::FoldedNoise).unwrap();
    let a = collapsing_loglikelihood(&model, y, None).unwrap();
    let b = steady_state_loglikelihood(&model, y).unwrap();
    let c = augmented_loglikelihood(&model, y, None).unwrap();

    let tol = 1e-6 * a.log_likelihood.abs().max(1.0);
    assert!(
        (a.log_likelihood - b.log_likelihood).abs() < tol,
        "collapsing {} vs steady {}",
        a.log_likelihood,
        b.log_likelihood
    );
    assert!(
        (a.log_likelihood - c.log_likelihood).abs() < tol,
        "collapsing {} vs augmented {}",
        a.log_likelihood,
        c.log_likelihood
    );
    assert!((a.scale - b.scale).abs() < 1e-6 * a.scale.max(1e-12));
    assert!((a.scale - c.scale).abs() < 1e-6 * a.scale.max(1e-12));
    assert_eq!(a.n, b.n);
    assert_eq!(a.n, c.n);
}

#[test]
fn agreement_monthly_default_model() {
    let params = monthly_default();
    let y = common::simulate(&params, 144, 42);
    assert!(y.len() >= 100);
    assert_agreement(&params, &y);
}

#[test]
fn agreement_all_seasonal_variants() {
    for variant in [
        SeasonalModel::Dummy,
        SeasonalModel::Crude,
        SeasonalModel::HarrisonStevens,
    ] {
        let mut params = monthly_default();
        params.seasonal = Some(SeasonalParams {
            model: variant,
            variance: 0.4,
        });
        let y = common::simulate(&params, 120, 7);
        assert_agreement(&params, &y);
    }
}

#[test]
fn agreement_with_cycle() {
    let mut params = monthly_default();
    params.cycle = Some(CycleParams {
        variance: 0.6,
        damping: 0.85,
        length: 6.0,
    });
    let y = common::simulate(&params, 160, 11);
    assert_agreement(&params, &y);
}

#[test]
fn agreement_under_misspecification() {
    // evaluating one model on data drawn from another still has to agree
    let truth = monthly_default();
    let y = common::simulate(&truth, 132, 23);
    let mut other = monthly_default();
    other.noise = 0.3;
    other.level = Some(2.0);
    other.seasonal = Some(SeasonalParams {
        model: SeasonalModel::HarrisonStevens,
        variance: 0.1,
    });
    assert_agreement(&other, &y);
}

#[test]
fn agreement_with_missing_stretch() {
    let params = monthly_default();
    let mut y = common::simulate(&params, 140, 3);
    for v in y.iter_mut().skip(40).take(8) {
        *v = f64::NAN;
    }
    y[0] = f64::NAN;
    assert_agreement(&params, &y);
}

#[test]
fn representations_agree_on_simulated_data() {
    let params = monthly_default();
    let y = common::simulate(&params, 120, 5);
    let explicit = BsmModel::new(&params, Representation::ExplicitNoise).unwrap();
    let folded = BsmModel::new(&params, Representation::FoldedNoise).unwrap();
    let a = collapsing_loglikelihood(&explicit, &y, None).unwrap();
    let b = collapsing_loglikelihood(&folded, &y, None).unwrap();
    assert!(
        (a.log_likelihood - b.log_likelihood).abs() < 1e-7 * a.log_likelihood.abs().max(1.0),
        "explicit {} vs folded {}",
        a.log_likelihood,
        b.log_likelihood
    );
    assert_eq!(a.n, b.n);
    assert_eq!(explicit.state_dim(), folded.state_dim() + 1);
}
