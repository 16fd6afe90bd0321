use candle_core::{Result, Tensor};
use candle_nn::{Module, VarBuilder};

use super::traits::{BayesModuleT, GaussianStats, LayerVariational};

/// Construction parameters shared by the Bayesian linear layer variants.
#[derive(Debug, Clone)]
pub struct BayesLinearConfig {
    /// Prior std of the weights (before width scaling).
    pub prior_weight_std: f64,
    /// Prior std of the bias.
    pub prior_bias_std: f64,
    /// Initial posterior std (stored as its log).
    pub init_std: f64,
    /// Divide the weight prior std by sqrt(fan_in).
    pub sqrt_width_scaling: bool,
    /// Whether the layer carries a bias.
    pub bias: bool,
}

impl Default for BayesLinearConfig {
    fn default() -> Self {
        Self {
            prior_weight_std: 1.0,
            prior_bias_std: 1.0,
            init_std: 0.05,
            sqrt_width_scaling: false,
            bias: true,
        }
    }
}

/// Draw `mean + exp(ln_std) * eps` with `eps ~ N(0, I)`.
pub(crate) fn reparameterized(mean: &Tensor, ln_std: &Tensor) -> Result<Tensor> {
    let eps = Tensor::randn(0f32, 1f32, mean.dims(), mean.device())?.to_dtype(mean.dtype())?;
    mean.add(&eps.mul(&ln_std.exp()?)?)
}

/// `y = x @ w' + b`
pub(crate) fn linear_forward(x: &Tensor, weight: &Tensor, bias: Option<&Tensor>) -> Result<Tensor> {
    let y = x.matmul(&weight.t()?)?;
    match bias {
        Some(b) => y.broadcast_add(b),
        None => Ok(y),
    }
}

pub(crate) fn scalar_stat(value: f64, like: &Tensor) -> Result<Tensor> {
    Tensor::new(value as f32, like.device())?.to_dtype(like.dtype())
}

/// Mean-field Bayesian linear layer (Bayes by Backprop).
///
/// The posterior over weights (and optionally bias) is a diagonal
/// Gaussian with trainable `mean` and `ln_std`; std stays positive
/// through the exponential. The prior is a fixed zero-mean Gaussian.
/// Each forward pass draws fresh weights by reparameterization.
pub struct BayesLinear {
    weight_mean: Tensor,
    weight_ln_std: Tensor,
    bias_mean: Option<Tensor>,
    bias_ln_std: Option<Tensor>,
    prior_weight_std: f64,
    prior_bias_std: f64,
}

impl BayesLinear {
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
            prior_weight_std: scaled_prior_std(config, in_dim),
            prior_bias_std: config.prior_bias_std,
        })
    }

    fn sample_bias(&self) -> Result<Option<Tensor>> {
        match (&self.bias_mean, &self.bias_ln_std) {
            (Some(mean), Some(ln_std)) => Ok(Some(reparameterized(mean, ln_std)?)),
            _ => Ok(None),
        }
    }
}

pub(crate) fn scaled_prior_std(config: &BayesLinearConfig, in_dim: usize) -> f64 {
    if config.sqrt_width_scaling {
        config.prior_weight_std / (in_dim as f64).sqrt()
    } else {
        config.prior_weight_std
    }
}

/// Allocate the trainable posterior statistics of one linear layer:
/// weight mean with small random init, ln_std at ln(init_std), bias
/// mean at zero.
pub(crate) fn variational_parameters(
    vb: VarBuilder,
    in_dim: usize,
    out_dim: usize,
    config: &BayesLinearConfig,
) -> Result<(Tensor, Tensor, Option<Tensor>, Option<Tensor>)> {
    let init_mean = candle_nn::Init::Randn {
        mean: 0.0,
        stdev: config.init_std,
    };
    let init_ln_std = candle_nn::Init::Const(config.init_std.ln());

    let weight_mean = vb.get_with_hints((out_dim, in_dim), "weight.mean", init_mean)?;
    let weight_ln_std = vb.get_with_hints((out_dim, in_dim), "weight.ln_std", init_ln_std)?;

    let (bias_mean, bias_ln_std) = if config.bias {
        (
            Some(vb.get_with_hints(out_dim, "bias.mean", candle_nn::init::ZERO)?),
            Some(vb.get_with_hints(out_dim, "bias.ln_std", init_ln_std)?),
        )
    } else {
        (None, None)
    };

    Ok((weight_mean, weight_ln_std, bias_mean, bias_ln_std))
}

impl Module for BayesLinear {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let weight = reparameterized(&self.weight_mean, &self.weight_ln_std)?;
        linear_forward(x, &weight, self.sample_bias()?.as_ref())
    }
}

impl BayesModuleT for BayesLinear {
    fn variational(&self) -> Option<&dyn LayerVariational> {
        Some(self)
    }

    fn forward_mean(&self, x: &Tensor) -> Result<Tensor> {
        linear_forward(x, &self.weight_mean, self.bias_mean.as_ref())
    }
}

impl LayerVariational for BayesLinear {
    fn weight_posterior(&self) -> Result<GaussianStats> {
        Ok(GaussianStats {
            mean: self.weight_mean.clone(),
            std: self.weight_ln_std.exp()?,
        })
    }

    fn weight_prior(&self) -> Result<GaussianStats> {
        Ok(GaussianStats {
            mean: scalar_stat(0.0, &self.weight_mean)?,
            std: scalar_stat(self.prior_weight_std, &self.weight_mean)?,
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
                std: scalar_stat(self.prior_bias_std, mean)?,
            })),
            None => Ok(None),
        }
    }

    fn has_bias(&self) -> bool {
        self.bias_mean.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mfvi::functional::gaussian_kl_model;
    use crate::mfvi::traits::VariationalModel;
    use candle_core::{DType, Device};
    use candle_nn::{VarBuilder, VarMap};

    struct OneLayer(BayesLinear);
    impl VariationalModel for OneLayer {
        fn variational_layers(&self) -> Vec<&dyn LayerVariational> {
            vec![&self.0]
        }
    }

    #[test]
    fn test_forward_shapes() -> Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);

        let layer = BayesLinear::new(vb, 4, 3, &BayesLinearConfig::default())?;
        let x = Tensor::randn(0f32, 1f32, (7, 4), &Device::Cpu)?;

        assert_eq!(layer.forward(&x)?.dims(), &[7, 3]);
        assert_eq!(layer.forward_mean(&x)?.dims(), &[7, 3]);
        Ok(())
    }

    #[test]
    fn test_no_bias_layer() -> Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);

        let config = BayesLinearConfig {
            bias: false,
            ..Default::default()
        };
        let layer = BayesLinear::new(vb, 4, 3, &config)?;
        assert!(!layer.has_bias());
        assert!(layer.bias_posterior()?.is_none());

        let x = Tensor::randn(0f32, 1f32, (2, 4), &Device::Cpu)?;
        assert_eq!(layer.forward(&x)?.dims(), &[2, 3]);
        Ok(())
    }

    #[test]
    fn test_sqrt_width_scaling_shrinks_prior() -> Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);

        let config = BayesLinearConfig {
            sqrt_width_scaling: true,
            ..Default::default()
        };
        let layer = BayesLinear::new(vb, 16, 3, &config)?;
        let prior = layer.weight_prior()?;
        let std: f32 = prior.std.to_scalar()?;
        assert!((std - 0.25).abs() < 1e-6, "1/sqrt(16) scaling, got {}", std);
        Ok(())
    }

    #[test]
    fn test_kl_finite_at_init() -> Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);

        let layer = BayesLinear::new(vb, 8, 5, &BayesLinearConfig::default())?;
        let model = OneLayer(layer);
        let kl: f32 = gaussian_kl_model(&model, &Device::Cpu)?.to_scalar()?;
        assert!(kl.is_finite());
        assert!(kl >= 0.0);
        Ok(())
    }
}
