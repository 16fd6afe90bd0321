use candle_core::{DType, Device, Result, Tensor};

use super::traits::{GaussianStats, LayerVariational, VariationalModel};

/// KL divergence between two diagonal Gaussian distributions.
///
/// Per element:
///
/// ```text
/// kl = -0.5 + ln(σ_p) - ln(σ_q) + (σ_q² + (μ_q - μ_p)²) / (2σ_p²)
/// ```
///
/// summed over all elements into a 0-dim tensor. Since both
/// distributions factorize per coordinate, the multivariate KL is the
/// sum of univariate KLs.
///
/// Precondition: both std tensors are strictly positive; a non-positive
/// entry yields NaN/Inf rather than an error. Layers in this crate keep
/// std positive structurally via `exp(ln_std)`.
///
/// # Arguments
/// * `mean_q`, `std_q` - posterior statistics
/// * `mean_p`, `std_p` - prior statistics, broadcastable to the posterior shape
pub fn gaussian_kl(
    mean_q: &Tensor,
    std_q: &Tensor,
    mean_p: &Tensor,
    std_p: &Tensor,
) -> Result<Tensor> {
    let diff_sq = mean_q.broadcast_sub(mean_p)?.sqr()?;
    let quad = std_q
        .sqr()?
        .broadcast_add(&diff_sq)?
        .broadcast_div(&(std_p.sqr()? * 2.0)?)?;
    let kl = quad
        .broadcast_add(&std_p.log()?)?
        .broadcast_sub(&std_q.log()?)?;
    (kl - 0.5)?.sum_all()
}

/// KL of one layer: weights, plus bias when the layer reports one.
fn layer_kl(layer: &dyn LayerVariational) -> Result<Tensor> {
    let w_q = layer.weight_posterior()?;
    let w_p = layer.weight_prior()?;
    let mut kl = gaussian_kl(&w_q.mean, &w_q.std, &w_p.mean, &w_p.std)?;

    if layer.has_bias() {
        if let (Some(b_q), Some(b_p)) = (layer.bias_posterior()?, layer.bias_prior()?) {
            kl = (kl + gaussian_kl(&b_q.mean, &b_q.std, &b_p.mean, &b_p.std)?)?;
        }
    }
    Ok(kl)
}

/// KL of one layer against a standard normal prior, ignoring whatever
/// prior statistics the layer is configured with.
fn layer_standard_normal_kl(layer: &dyn LayerVariational) -> Result<Tensor> {
    let std_normal = |like: &Tensor| -> Result<GaussianStats> {
        let dtype = like.dtype();
        let device = like.device();
        Ok(GaussianStats {
            mean: Tensor::zeros((), dtype, device)?,
            std: Tensor::ones((), dtype, device)?,
        })
    };

    let w_q = layer.weight_posterior()?;
    let w_p = std_normal(&w_q.mean)?;
    let mut kl = gaussian_kl(&w_q.mean, &w_q.std, &w_p.mean, &w_p.std)?;

    if layer.has_bias() {
        if let Some(b_q) = layer.bias_posterior()? {
            let b_p = std_normal(&b_q.mean)?;
            kl = (kl + gaussian_kl(&b_q.mean, &b_q.std, &b_p.mean, &b_p.std)?)?;
        }
    }
    Ok(kl)
}

fn accumulate_kl<M, F>(model: &M, device: &Device, per_layer: F) -> Result<Tensor>
where
    M: VariationalModel + ?Sized,
    F: Fn(&dyn LayerVariational) -> Result<Tensor>,
{
    let mut total: Option<Tensor> = None;
    for layer in model.variational_layers() {
        let kl = per_layer(layer)?;
        total = Some(match total {
            Some(t) => (t + kl)?,
            None => kl,
        });
    }
    match total {
        Some(kl) => Ok(kl),
        None => Tensor::zeros((), DType::F32, device),
    }
}

/// Model-wide KL divergence between approximate posterior and prior,
/// both diagonal Gaussian. This is the closed-form complexity cost of
/// Bayes by Backprop.
///
/// Only layers exposing `LayerVariational` contribute; deterministic
/// layers are skipped. The device is threaded explicitly and only used
/// for the zero result of a model with no variational layers.
pub fn gaussian_kl_model<M>(model: &M, device: &Device) -> Result<Tensor>
where
    M: VariationalModel + ?Sized,
{
    accumulate_kl(model, device, layer_kl)
}

/// Model-wide KL divergence against a standard normal prior.
///
/// Used by the marginal-likelihood-gradient scheme, where the posterior
/// is over an auxiliary noise variable and the prior is pinned to
/// N(0, 1) regardless of per-layer configuration.
pub fn standard_normal_kl_model<M>(model: &M, device: &Device) -> Result<Tensor>
where
    M: VariationalModel + ?Sized,
{
    accumulate_kl(model, device, layer_standard_normal_kl)
}

/// Decomposed training objective: `total = nll + kl`, with `kl` already
/// scaled by its weight so the caller can log the decomposition.
pub struct LossTerms {
    pub total: Tensor,
    pub nll: Tensor,
    pub kl: Tensor,
}

/// One parametrized objective body shared by every scheme:
/// `total = nll + weight * penalty(model)`.
///
/// The complexity term is pluggable so the negative-ELBO, MLG and MAP
/// objectives differ only in configuration, not in structure.
pub fn penalized_nll<M, F>(model: &M, nll: Tensor, weight: f64, penalty: F) -> Result<LossTerms>
where
    M: VariationalModel + ?Sized,
    F: FnOnce(&M) -> Result<Tensor>,
{
    let kl = (penalty(model)? * weight)?;
    let total = (&nll + &kl)?;
    Ok(LossTerms { total, nll, kl })
}

/// Negative evidence lower bound with minibatch-scaled KL.
///
/// The ratio is chosen so that, summed over all minibatches of an
/// epoch, the KL contribution matches the full-dataset KL exactly once
/// (typically `1 / num_minibatch`).
pub fn nelbo<M>(model: &M, nll: Tensor, minibatch_ratio: f64, device: &Device) -> Result<LossTerms>
where
    M: VariationalModel + ?Sized,
{
    penalized_nll(model, nll, minibatch_ratio, |m| gaussian_kl_model(m, device))
}

/// Negative ELBO of the marginal-likelihood-gradient scheme: the KL is
/// between the auxiliary-noise posterior and a standard normal.
pub fn mlg_nelbo<M>(
    model: &M,
    nll: Tensor,
    minibatch_ratio: f64,
    device: &Device,
) -> Result<LossTerms>
where
    M: VariationalModel + ?Sized,
{
    penalized_nll(model, nll, minibatch_ratio, |m| {
        standard_normal_kl_model(m, device)
    })
}

/// Maximum-a-posteriori objective: the per-parameter divergence
/// reinterpreted as a distance-to-prior penalty, without minibatch
/// scaling.
pub fn maximum_a_posteriori<M>(model: &M, nll: Tensor, device: &Device) -> Result<LossTerms>
where
    M: VariationalModel + ?Sized,
{
    penalized_nll(model, nll, 1.0, |m| gaussian_kl_model(m, device))
}

/// Objective selection for the shared `penalized_nll` body.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObjectiveKind {
    /// Negative ELBO with the mean-field KL.
    Nelbo,
    /// Negative ELBO with a standard normal prior (MLG scheme).
    MlgNelbo,
    /// MAP with an unscaled prior penalty.
    Map,
}

/// Evaluate the objective selected by `kind`.
pub fn objective<M>(
    kind: ObjectiveKind,
    model: &M,
    nll: Tensor,
    minibatch_ratio: f64,
    device: &Device,
) -> Result<LossTerms>
where
    M: VariationalModel + ?Sized,
{
    match kind {
        ObjectiveKind::Nelbo => nelbo(model, nll, minibatch_ratio, device),
        ObjectiveKind::MlgNelbo => mlg_nelbo(model, nll, minibatch_ratio, device),
        ObjectiveKind::Map => maximum_a_posteriori(model, nll, device),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use candle_core::{DType, Device};

    fn scalar(v: f64) -> Result<Tensor> {
        Tensor::new(v, &Device::Cpu)
    }

    #[test]
    fn test_kl_zero_when_posterior_equals_prior() -> Result<()> {
        let kl = gaussian_kl(&scalar(0.0)?, &scalar(1.0)?, &scalar(0.0)?, &scalar(1.0)?)?;
        let val: f64 = kl.to_scalar()?;
        assert_abs_diff_eq!(val, 0.0, epsilon = 1e-12);

        // also elementwise zero for matching tensor statistics
        let mean = Tensor::randn(0f32, 1f32, (4, 3), &Device::Cpu)?;
        let std = Tensor::randn(0f32, 1f32, (4, 3), &Device::Cpu)?.exp()?;
        let kl = gaussian_kl(&mean, &std, &mean, &std)?;
        let val: f32 = kl.to_scalar()?;
        assert_abs_diff_eq!(val, 0.0, epsilon = 1e-5);
        Ok(())
    }

    #[test]
    fn test_kl_mean_shift_scalar() -> Result<()> {
        // mu_q=1, sigma_q=1, mu_p=0, sigma_p=1:
        // kl = -0.5 + 0 - 0 + (1 + 1) / 2 = 0.5
        let kl = gaussian_kl(&scalar(1.0)?, &scalar(1.0)?, &scalar(0.0)?, &scalar(1.0)?)?;
        let val: f64 = kl.to_scalar()?;
        assert_abs_diff_eq!(val, 0.5, epsilon = 1e-12);
        Ok(())
    }

    #[test]
    fn test_kl_nonnegative_on_random_stats() -> Result<()> {
        let device = Device::Cpu;
        for _ in 0..10 {
            let mean_q = Tensor::randn(0f32, 1f32, (5, 4), &device)?;
            let std_q = Tensor::randn(0f32, 0.5f32, (5, 4), &device)?.exp()?;
            let mean_p = Tensor::randn(0f32, 1f32, (5, 4), &device)?;
            let std_p = Tensor::randn(0f32, 0.5f32, (5, 4), &device)?.exp()?;
            let val: f32 = gaussian_kl(&mean_q, &std_q, &mean_p, &std_p)?.to_scalar()?;
            assert!(val >= -1e-5, "KL should be non-negative, got {}", val);
        }
        Ok(())
    }

    #[test]
    fn test_kl_penalizes_mean_mismatch() -> Result<()> {
        let device = Device::Cpu;
        let std = Tensor::randn(0f32, 0.5f32, (3, 3), &device)?.exp()?;
        let mean_q = Tensor::randn(0f32, 1f32, (3, 3), &device)?;
        let mean_p = (&mean_q + 0.7)?;
        let val: f32 = gaussian_kl(&mean_q, &std, &mean_p, &std)?.to_scalar()?;
        assert!(val > 0.0, "mean mismatch must be penalized, got {}", val);
        Ok(())
    }

    #[test]
    fn test_penalized_nll_scaling() -> Result<()> {
        struct Empty;
        impl VariationalModel for Empty {
            fn variational_layers(&self) -> Vec<&dyn LayerVariational> {
                vec![]
            }
        }

        // nll = 10, kl = 4, ratio = 0.5 -> total = 12
        let nll = Tensor::new(10f64, &Device::Cpu)?;
        let terms = penalized_nll(&Empty, nll, 0.5, |_| Tensor::new(4f64, &Device::Cpu))?;
        let total: f64 = terms.total.to_scalar()?;
        let kl: f64 = terms.kl.to_scalar()?;
        assert_abs_diff_eq!(total, 12.0, epsilon = 1e-12);
        assert_abs_diff_eq!(kl, 2.0, epsilon = 1e-12);

        // doubling the ratio doubles the kl contribution
        let nll = Tensor::new(10f64, &Device::Cpu)?;
        let doubled = penalized_nll(&Empty, nll, 1.0, |_| Tensor::new(4f64, &Device::Cpu))?;
        let kl2: f64 = doubled.kl.to_scalar()?;
        assert_abs_diff_eq!(kl2, 2.0 * kl, epsilon = 1e-12);
        Ok(())
    }

    #[test]
    fn test_empty_model_kl_is_zero() -> Result<()> {
        struct Empty;
        impl VariationalModel for Empty {
            fn variational_layers(&self) -> Vec<&dyn LayerVariational> {
                vec![]
            }
        }
        let kl = gaussian_kl_model(&Empty, &Device::Cpu)?;
        assert_eq!(kl.dtype(), DType::F32);
        let val: f32 = kl.to_scalar()?;
        assert_abs_diff_eq!(val, 0.0);
        Ok(())
    }

    /// A hand-rolled capability layer with bias statistics present but
    /// the bias flag off.
    struct MockLayer {
        weight: (Tensor, Tensor),
        bias: (Tensor, Tensor),
        has_bias: bool,
    }

    impl MockLayer {
        fn new(device: &Device, has_bias: bool) -> Result<Self> {
            let weight = (
                Tensor::randn(0f32, 1f32, (3, 2), device)?,
                Tensor::randn(0f32, 0.3f32, (3, 2), device)?.exp()?,
            );
            let bias = (
                Tensor::randn(0f32, 1f32, 3, device)?,
                Tensor::randn(0f32, 0.3f32, 3, device)?.exp()?,
            );
            Ok(Self {
                weight,
                bias,
                has_bias,
            })
        }
    }

    impl LayerVariational for MockLayer {
        fn weight_posterior(&self) -> Result<GaussianStats> {
            Ok(GaussianStats {
                mean: self.weight.0.clone(),
                std: self.weight.1.clone(),
            })
        }
        fn weight_prior(&self) -> Result<GaussianStats> {
            Ok(GaussianStats {
                mean: Tensor::zeros((), DType::F32, self.weight.0.device())?,
                std: Tensor::ones((), DType::F32, self.weight.0.device())?,
            })
        }
        fn bias_posterior(&self) -> Result<Option<GaussianStats>> {
            Ok(Some(GaussianStats {
                mean: self.bias.0.clone(),
                std: self.bias.1.clone(),
            }))
        }
        fn bias_prior(&self) -> Result<Option<GaussianStats>> {
            Ok(Some(GaussianStats {
                mean: Tensor::zeros((), DType::F32, self.bias.0.device())?,
                std: Tensor::ones((), DType::F32, self.bias.0.device())?,
            }))
        }
        fn has_bias(&self) -> bool {
            self.has_bias
        }
    }

    struct MockModel(Vec<MockLayer>);
    impl VariationalModel for MockModel {
        fn variational_layers(&self) -> Vec<&dyn LayerVariational> {
            self.0.iter().map(|l| l as &dyn LayerVariational).collect()
        }
    }

    #[test]
    fn test_bias_flag_excludes_bias_statistics() -> Result<()> {
        let device = Device::Cpu;
        let layer = MockLayer::new(&device, false)?;

        let w_q = layer.weight_posterior()?;
        let w_p = layer.weight_prior()?;
        let weights_only: f32 = gaussian_kl(&w_q.mean, &w_q.std, &w_p.mean, &w_p.std)?.to_scalar()?;

        let model = MockModel(vec![layer]);
        let total: f32 = gaussian_kl_model(&model, &device)?.to_scalar()?;
        assert_abs_diff_eq!(total, weights_only, epsilon = 1e-6);
        Ok(())
    }

    #[test]
    fn test_model_kl_additive_over_layers() -> Result<()> {
        let device = Device::Cpu;
        let layers = vec![
            MockLayer::new(&device, true)?,
            MockLayer::new(&device, true)?,
        ];

        let mut expected = 0f32;
        for layer in &layers {
            let w_q = layer.weight_posterior()?;
            let w_p = layer.weight_prior()?;
            expected += gaussian_kl(&w_q.mean, &w_q.std, &w_p.mean, &w_p.std)?
                .to_scalar::<f32>()?;
            let b_q = layer.bias_posterior()?.unwrap();
            let b_p = layer.bias_prior()?.unwrap();
            expected += gaussian_kl(&b_q.mean, &b_q.std, &b_p.mean, &b_p.std)?
                .to_scalar::<f32>()?;
        }

        let model = MockModel(layers);
        let total: f32 = gaussian_kl_model(&model, &device)?.to_scalar()?;
        assert_abs_diff_eq!(total, expected, epsilon = 1e-4);
        Ok(())
    }

    #[test]
    fn test_standard_normal_kl_ignores_configured_prior() -> Result<()> {
        let device = Device::Cpu;
        // the mock already reports a standard normal prior, so both
        // aggregations must agree on it
        let model = MockModel(vec![MockLayer::new(&device, true)?]);
        let a: f32 = gaussian_kl_model(&model, &device)?.to_scalar()?;
        let b: f32 = standard_normal_kl_model(&model, &device)?.to_scalar()?;
        assert_abs_diff_eq!(a, b, epsilon = 1e-5);
        Ok(())
    }
}
