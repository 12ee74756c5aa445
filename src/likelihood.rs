/// Diffuse log-likelihood with the concentrated scale profiled out, plus the
/// pieces it was assembled from.
///
/// The individual terms (`sum_log_f`, `diffuse_correction`) depend on which
/// filter produced them; the total `log_likelihood`, `ssq` and `scale` do
/// not, and are what the algorithms are cross-checked on.
#[derive(Debug, Clone, PartialEq)]
pub struct DiffuseLikelihood {
    pub log_likelihood: f64,
    /// Effective sample size: observed points minus the diffuse order.
    pub n: usize,
    /// Diffuse directions plus concentrated regression columns.
    pub diffuse_order: usize,
    /// Weighted residual sum of squares after concentrating the diffuse
    /// effects.
    pub ssq: f64,
    /// Concentrated scale, ssq / n.
    pub scale: f64,
    pub sum_log_f: f64,
    pub diffuse_correction: f64,
    /// Count of estimated hyperparameters; filled in by the estimation
    /// kernel, zero for a bare filter run.
    pub n_params: usize,
}

const LN_2PI: f64 = 1.837877066409345483560659472811;

impl DiffuseLikelihood {
    /// Assemble the concentrated diffuse log-likelihood:
    ///
    /// `-0.5 (n ln 2pi + n ln(ssq/n) + n + sum_log_f + diffuse_correction)`
    pub fn assemble(
        n: usize,
        diffuse_order: usize,
        ssq: f64,
        sum_log_f: f64,
        diffuse_correction: f64,
    ) -> Self {
        let nf = n as f64;
        let scale = (ssq / nf).max(1e-300);
        let log_likelihood =
            -0.5 * (nf * LN_2PI + nf * scale.ln() + nf + sum_log_f + diffuse_correction);
        Self {
            log_likelihood,
            n,
            diffuse_order,
            ssq,
            scale,
            sum_log_f,
            diffuse_correction,
            n_params: 0,
        }
    }

    /// Statistics for the same model on data multiplied by `factor`.
    /// Residuals scale linearly, so the sum of squares picks up `factor^2`
    /// and the log-likelihood shifts by `-n ln factor`.
    pub fn rescaled(&self, factor: f64) -> Self {
        let mut out = Self::assemble(
            self.n,
            self.diffuse_order,
            self.ssq * factor * factor,
            self.sum_log_f,
            self.diffuse_correction,
        );
        out.n_params = self.n_params;
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assemble_concentrated_identity() {
        let ll = DiffuseLikelihood::assemble(100, 3, 50.0, 12.0, 4.0);
        assert_eq!(ll.n, 100);
        assert_eq!(ll.diffuse_order, 3);
        assert!((ll.scale - 0.5).abs() < 1e-12);
        let expected =
            -0.5 * (100.0 * LN_2PI + 100.0 * 0.5f64.ln() + 100.0 + 12.0 + 4.0);
        assert!((ll.log_likelihood - expected).abs() < 1e-10);
    }

    #[test]
    fn test_rescale_shifts_by_n_log_factor() {
        let base = DiffuseLikelihood::assemble(80, 2, 40.0, 5.0, 1.0);
        let scaled = base.rescaled(3.0);
        assert!((scaled.scale - base.scale * 9.0).abs() < 1e-12);
        let shift = base.log_likelihood - scaled.log_likelihood;
        assert!((shift - 80.0 * 3.0f64.ln()).abs() < 1e-9);
    }

    #[test]
    fn test_degenerate_ssq_stays_finite() {
        let ll = DiffuseLikelihood::assemble(10, 1, 0.0, 0.0, 0.0);
        assert!(ll.log_likelihood.is_finite());
    }
}
