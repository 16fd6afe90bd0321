use candle_core::{Result, Tensor};
use candle_nn::{Module, VarBuilder};

use super::linear::{
    linear_forward, reparameterized, scalar_stat, variational_parameters, BayesLinearConfig,
};
use super::traits::{BayesModuleT, GaussianStats, LayerVariational};

/// Linear layer of the marginal-likelihood-gradient (MLG) approximate
/// scheme.
///
/// The trainable statistics parameterize the posterior over an
/// auxiliary noise variable rather than the weights themselves, so the
/// capability interface reports a standard normal prior regardless of
/// any configured prior scale. The forward pass is the usual
/// reparameterized draw.
pub struct MlgBayesLinear {
    weight_mean: Tensor,
    weight_ln_std: Tensor,
    bias_mean: Option<Tensor>,
    bias_ln_std: Option<Tensor>,
}

impl MlgBayesLinear {
    pub fn new(
        vb: VarBuilder,
        in_dim: usize,
        out_dim: usize,
        config: &BayesLinearConfig,
    ) -> Result<Self> {
        let (weight_mean, weight_ln_std, bias_mean, bias_ln_std) =
            variational_parameters(vb, in_dim, out_dim, config)?;
        Ok(Self {
            weight_mean,
            weight_ln_std,
            bias_mean,
            bias_ln_std,
        })
    }
}

impl Module for MlgBayesLinear {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let weight = reparameterized(&self.weight_mean, &self.weight_ln_std)?;
        let bias = match (&self.bias_mean, &self.bias_ln_std) {
            (Some(mean), Some(ln_std)) => Some(reparameterized(mean, ln_std)?),
            _ => None,
        };
        linear_forward(x, &weight, bias.as_ref())
    }
}

impl BayesModuleT for MlgBayesLinear {
    fn variational(&self) -> Option<&dyn LayerVariational> {
        Some(self)
    }

    fn forward_mean(&self, x: &Tensor) -> Result<Tensor> {
        linear_forward(x, &self.weight_mean, self.bias_mean.as_ref())
    }
}

impl LayerVariational for MlgBayesLinear {
    fn weight_posterior(&self) -> Result<GaussianStats> {
        Ok(GaussianStats {
            mean: self.weight_mean.clone(),
            std: self.weight_ln_std.exp()?,
        })
    }

    fn weight_prior(&self) -> Result<GaussianStats> {
        Ok(GaussianStats {
            mean: scalar_stat(0.0, &self.weight_mean)?,
            std: scalar_stat(1.0, &self.weight_mean)?,
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
                std: scalar_stat(1.0, mean)?,
            })),
            None => Ok(None),
        }
    }

    fn has_bias(&self) -> bool {
        self.bias_mean.is_some()
    }
}
