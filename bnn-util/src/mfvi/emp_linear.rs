use candle_core::{Result, Tensor};
use candle_nn::{Module, VarBuilder};

use super::linear::{
    linear_forward, reparameterized, scalar_stat, variational_parameters, BayesLinearConfig,
};
use super::traits::{BayesModuleT, GaussianStats, LayerVariational};

/// Maximum value for ln(τ) to prevent numerical overflow.
/// ln(100) ≈ 4.6, so τ is capped at ~100.
const MAX_LN_TAU: f64 = 4.6;

/// Empirical-Bayes linear layer.
///
/// Same mean-field posterior as `BayesLinear`, but the zero-mean prior
/// scale τ is a trainable scalar stored as ln(τ), learned jointly with
/// the posterior by maximizing the ELBO.
pub struct EmpBayesLinear {
    weight_mean: Tensor,
    weight_ln_std: Tensor,
    bias_mean: Option<Tensor>,
    bias_ln_std: Option<Tensor>,
    prior_ln_tau: Tensor,
}

impl EmpBayesLinear {
    pub fn new(
        vb: VarBuilder,
        in_dim: usize,
        out_dim: usize,
        config: &BayesLinearConfig,
    ) -> Result<Self> {
        let prior_ln_tau = vb.get_with_hints(
            (),
            "prior.ln_tau",
            candle_nn::Init::Const(config.prior_weight_std.ln()),
        )?;
        let (weight_mean, weight_ln_std, bias_mean, bias_ln_std) =
            variational_parameters(vb, in_dim, out_dim, config)?;
        Ok(Self {
            weight_mean,
            weight_ln_std,
            bias_mean,
            bias_ln_std,
            prior_ln_tau,
        })
    }

    /// Prior scale τ = exp(clamp(ln_tau)), for reporting.
    pub fn tau(&self) -> Result<f32> {
        self.prior_tau()?.to_scalar()
    }

    fn prior_tau(&self) -> Result<Tensor> {
        self.prior_ln_tau.clamp(-MAX_LN_TAU, MAX_LN_TAU)?.exp()
    }
}

impl Module for EmpBayesLinear {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let weight = reparameterized(&self.weight_mean, &self.weight_ln_std)?;
        let bias = match (&self.bias_mean, &self.bias_ln_std) {
            (Some(mean), Some(ln_std)) => Some(reparameterized(mean, ln_std)?),
            _ => None,
        };
        linear_forward(x, &weight, bias.as_ref())
    }
}

impl BayesModuleT for EmpBayesLinear {
    fn variational(&self) -> Option<&dyn LayerVariational> {
        Some(self)
    }

    fn forward_mean(&self, x: &Tensor) -> Result<Tensor> {
        linear_forward(x, &self.weight_mean, self.bias_mean.as_ref())
    }
}

impl LayerVariational for EmpBayesLinear {
    fn weight_posterior(&self) -> Result<GaussianStats> {
        Ok(GaussianStats {
            mean: self.weight_mean.clone(),
            std: self.weight_ln_std.exp()?,
        })
    }

    fn weight_prior(&self) -> Result<GaussianStats> {
        Ok(GaussianStats {
            mean: scalar_stat(0.0, &self.weight_mean)?,
            std: self.prior_tau()?.to_dtype(self.weight_mean.dtype())?,
        })
    }

    fn bias_posterior(&self) -> Result<Option<GaussianStats>> {
        match (&self.bias_mean, &self.bias_ln_std) {
            (Some(mean), Some(ln_std)) => Ok(Some(GaussianStats {
                mean: mean.clone(),
                std: ln_std.exp()?,
            })),
            _ => Ok(None),
        }
    }

    fn bias_prior(&self) -> Result<Option<GaussianStats>> {
        match &self.bias_mean {
            Some(mean) => Ok(Some(GaussianStats {
                mean: scalar_stat(0.0, mean)?,
                std: self.prior_tau()?.to_dtype(mean.dtype())?,
            })),
            None => Ok(None),
        }
    }

    fn has_bias(&self) -> bool {
        self.bias_mean.is_some()
    }
}

/// Extended empirical-Bayes linear layer.
///
/// The weight prior carries trainable per-output-unit mean and ln(std),
/// broadcast across fan-in; the bias prior scale is a trainable scalar.
pub struct ExtEmpBayesLinear {
    weight_mean: Tensor,
    weight_ln_std: Tensor,
    bias_mean: Option<Tensor>,
    bias_ln_std: Option<Tensor>,
    prior_weight_mean: Tensor,
    prior_weight_ln_std: Tensor,
    prior_bias_ln_tau: Tensor,
}

impl ExtEmpBayesLinear {
    pub fn new(
        vb: VarBuilder,
        in_dim: usize,
        out_dim: usize,
        config: &BayesLinearConfig,
    ) -> Result<Self> {
        let prior_weight_mean =
            vb.get_with_hints((out_dim, 1), "prior.weight.mean", candle_nn::init::ZERO)?;
        let prior_weight_ln_std = vb.get_with_hints(
            (out_dim, 1),
            "prior.weight.ln_std",
            candle_nn::Init::Const(config.prior_weight_std.ln()),
        )?;
        let prior_bias_ln_tau = vb.get_with_hints(
            (),
            "prior.bias.ln_tau",
            candle_nn::Init::Const(config.prior_bias_std.ln()),
        )?;
        let (weight_mean, weight_ln_std, bias_mean, bias_ln_std) =
            variational_parameters(vb, in_dim, out_dim, config)?;
        Ok(Self {
            weight_mean,
            weight_ln_std,
            bias_mean,
            bias_ln_std,
            prior_weight_mean,
            prior_weight_ln_std,
            prior_bias_ln_tau,
        })
    }
}

impl Module for ExtEmpBayesLinear {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let weight = reparameterized(&self.weight_mean, &self.weight_ln_std)?;
        let bias = match (&self.bias_mean, &self.bias_ln_std) {
            (Some(mean), Some(ln_std)) => Some(reparameterized(mean, ln_std)?),
            _ => None,
        };
        linear_forward(x, &weight, bias.as_ref())
    }
}

impl BayesModuleT for ExtEmpBayesLinear {
    fn variational(&self) -> Option<&dyn LayerVariational> {
        Some(self)
    }

    fn forward_mean(&self, x: &Tensor) -> Result<Tensor> {
        linear_forward(x, &self.weight_mean, self.bias_mean.as_ref())
    }
}

impl LayerVariational for ExtEmpBayesLinear {
    fn weight_posterior(&self) -> Result<GaussianStats> {
        Ok(GaussianStats {
            mean: self.weight_mean.clone(),
            std: self.weight_ln_std.exp()?,
        })
    }

    fn weight_prior(&self) -> Result<GaussianStats> {
        Ok(GaussianStats {
            mean: self.prior_weight_mean.clone(),
            std: self
                .prior_weight_ln_std
                .clamp(-MAX_LN_TAU, MAX_LN_TAU)?
                .exp()?,
        })
    }

    fn bias_posterior(&self) -> Result<Option<GaussianStats>> {
        match (&self.bias_mean, &self.bias_ln_std) {
            (Some(mean), Some(ln_std)) => Ok(Some(GaussianStats {
                mean: mean.clone(),
                std: ln_std.exp()?,
            })),
            _ => Ok(None),
        }
    }

    fn bias_prior(&self) -> Result<Option<GaussianStats>> {
        match &self.bias_mean {
            Some(mean) => Ok(Some(GaussianStats {
                mean: scalar_stat(0.0, mean)?,
                std: self
                    .prior_bias_ln_tau
                    .clamp(-MAX_LN_TAU, MAX_LN_TAU)?
                    .exp()?
                    .to_dtype(mean.dtype())?,
            })),
            None => Ok(None),
        }
    }

    fn has_bias(&self) -> bool {
        self.bias_mean.is_some()
    }
}
