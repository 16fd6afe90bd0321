//! Gaussian likelihood with trainable observation noise.

use candle_core::{Result, Tensor};
use candle_nn::VarBuilder;

use crate::mfvi::traits::NegativeLogLikelihood;

/// Full Gaussian negative log-likelihood: y ~ N(pred, exp(ln_var)).
///
/// ```text
/// nll = 0.5 * sum [ ln(2π) + ln_var + (y - pred)² / exp(ln_var) ]
/// ```
///
/// The log noise variance is a trainable scalar, learned jointly with
/// the variational parameters in the same backward pass.
pub struct GaussianNll {
    ln_noise_var: Tensor,
}

impl GaussianNll {
    /// # Arguments
    /// * `vb` - VarBuilder for the trainable parameter
    /// * `init_ln_var` - initial log noise variance (e.g. -3.0)
    pub fn new(vb: VarBuilder, init_ln_var: f64) -> Result<Self> {
        let ln_noise_var =
            vb.get_with_hints((), "ln_noise_var", candle_nn::Init::Const(init_ln_var))?;
        Ok(Self { ln_noise_var })
    }

    /// Learned noise variance exp(clamp(ln_var)), for reporting.
    pub fn noise_var(&self) -> Result<f32> {
        self.clamped_ln_var()?.exp()?.to_scalar()
    }

    fn clamped_ln_var(&self) -> Result<Tensor> {
        // Range [-10, 10] gives variance in [4.5e-5, 22026]
        self.ln_noise_var.clamp(-10.0, 10.0)
    }
}

impl NegativeLogLikelihood for GaussianNll {
    fn nll(&self, pred: &Tensor, target: &Tensor) -> Result<Tensor> {
        let ln_2pi: f64 = (2.0 * std::f64::consts::PI).ln();
        let ln_var = self.clamped_ln_var()?.to_dtype(pred.dtype())?;
        let var = ln_var.exp()?;

        let diff_sq = pred.sub(target)?.sqr()?;
        let log_prob = ((diff_sq.broadcast_div(&var)?.broadcast_add(&ln_var)? + ln_2pi)? * 0.5)?;
        log_prob.sum_all()
    }
}
