use candle_core::{Result, Tensor};
use candle_nn::{Activation, Module, VarBuilder};

use super::emp_linear::{EmpBayesLinear, ExtEmpBayesLinear};
use super::linear::{BayesLinear, BayesLinearConfig};
use super::mlg_linear::MlgBayesLinear;
use super::traits::{BayesModuleT, LayerVariational, VariationalModel};

/// build a stack of alternating module and activation layers
pub struct BnnStack {
    module_layers: Vec<Box<dyn BayesModuleT>>,
    activation_layers: Vec<Option<Activation>>,
}

impl Module for BnnStack {
    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let mut x = input.clone();
        for (module, activation) in self.module_layers.iter().zip(self.activation_layers.iter()) {
            x = module.forward(&x)?;
            if let Some(activation) = activation {
                x = activation.forward(&x)?;
            }
        }
        Ok(x)
    }
}

impl BnnStack {
    pub fn new() -> Self {
        Self {
            module_layers: Vec::new(),
            activation_layers: Vec::new(),
        }
    }

    /// Appends a layer followed by an activation.
    pub fn push_with_act<M: BayesModuleT + 'static>(&mut self, layer: M, activation: Activation) {
        self.module_layers.push(Box::new(layer));
        self.activation_layers.push(Some(activation));
    }

    pub fn push<M: BayesModuleT + 'static>(&mut self, layer: M) {
        self.module_layers.push(Box::new(layer));
        self.activation_layers.push(None);
    }

    pub fn num_layers(&self) -> usize {
        self.module_layers.len()
    }

    /// Forward pass through posterior means, without parameter sampling.
    pub fn forward_mean(&self, input: &Tensor) -> Result<Tensor> {
        let mut x = input.clone();
        for (module, activation) in self.module_layers.iter().zip(self.activation_layers.iter()) {
            x = module.forward_mean(&x)?;
            if let Some(activation) = activation {
                x = activation.forward(&x)?;
            }
        }
        Ok(x)
    }
}

impl Default for BnnStack {
    fn default() -> Self {
        Self::new()
    }
}

impl VariationalModel for BnnStack {
    fn variational_layers(&self) -> Vec<&dyn LayerVariational> {
        self.module_layers
            .iter()
            .filter_map(|m| m.variational())
            .collect()
    }
}

fn build_stack<L, F>(layer_sizes: &[usize], activation: Activation, mut make: F) -> Result<BnnStack>
where
    L: BayesModuleT + 'static,
    F: FnMut(usize, usize, usize) -> Result<L>,
{
    assert!(
        layer_sizes.len() >= 2,
        "a stack needs at least input and output sizes"
    );
    let mut stack = BnnStack::new();
    let last = layer_sizes.len() - 2;
    for (index, pair) in layer_sizes.windows(2).enumerate() {
        let layer = make(index, pair[0], pair[1])?;
        if index < last {
            stack.push_with_act(layer, activation);
        } else {
            stack.push(layer);
        }
    }
    Ok(stack)
}

/// Feed-forward BNN of `BayesLinear` layers: `[d_in, h.., d_out]` with
/// the activation between consecutive layers and none after the last.
pub fn linear_bnn(
    vb: VarBuilder,
    layer_sizes: &[usize],
    activation: Activation,
    config: &BayesLinearConfig,
) -> Result<BnnStack> {
    build_stack(layer_sizes, activation, |index, in_dim, out_dim| {
        BayesLinear::new(vb.pp(format!("layer.{}", index)), in_dim, out_dim, config)
    })
}

/// Feed-forward BNN of `EmpBayesLinear` layers (learnable prior scale).
pub fn linear_emp_bnn(
    vb: VarBuilder,
    layer_sizes: &[usize],
    activation: Activation,
    config: &BayesLinearConfig,
) -> Result<BnnStack> {
    build_stack(layer_sizes, activation, |index, in_dim, out_dim| {
        EmpBayesLinear::new(vb.pp(format!("layer.{}", index)), in_dim, out_dim, config)
    })
}

/// Feed-forward BNN of `ExtEmpBayesLinear` layers (per-unit prior).
pub fn linear_ext_emp_bnn(
    vb: VarBuilder,
    layer_sizes: &[usize],
    activation: Activation,
    config: &BayesLinearConfig,
) -> Result<BnnStack> {
    build_stack(layer_sizes, activation, |index, in_dim, out_dim| {
        ExtEmpBayesLinear::new(vb.pp(format!("layer.{}", index)), in_dim, out_dim, config)
    })
}

/// Feed-forward BNN of `MlgBayesLinear` layers (standard normal prior).
pub fn linear_mlg_bnn(
    vb: VarBuilder,
    layer_sizes: &[usize],
    activation: Activation,
    config: &BayesLinearConfig,
) -> Result<BnnStack> {
    build_stack(layer_sizes, activation, |index, in_dim, out_dim| {
        MlgBayesLinear::new(vb.pp(format!("layer.{}", index)), in_dim, out_dim, config)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mfvi::functional::{gaussian_kl, gaussian_kl_model};
    use approx::assert_abs_diff_eq;
    use candle_core::{DType, Device};
    use candle_nn::{VarBuilder, VarMap};

    #[test]
    fn test_linear_bnn_shapes() -> Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);

        let model = linear_bnn(
            vb,
            &[2, 8, 8, 3],
            Activation::Relu,
            &BayesLinearConfig::default(),
        )?;
        assert_eq!(model.num_layers(), 3);
        assert_eq!(model.variational_layers().len(), 3);

        let x = Tensor::randn(0f32, 1f32, (5, 2), &Device::Cpu)?;
        assert_eq!(model.forward(&x)?.dims(), &[5, 3]);
        assert_eq!(model.forward_mean(&x)?.dims(), &[5, 3]);
        Ok(())
    }

    #[test]
    fn test_deterministic_layer_contributes_nothing() -> Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let device = Device::Cpu;
        let config = BayesLinearConfig::default();

        let bayes_1 = BayesLinear::new(vb.pp("b1"), 2, 4, &config)?;
        let bayes_2 = BayesLinear::new(vb.pp("b2"), 4, 1, &config)?;

        // expected: sum of the two layers' weight and bias KLs
        let mut expected = 0f32;
        for layer in [&bayes_1, &bayes_2] {
            let w_q = layer.weight_posterior()?;
            let w_p = layer.weight_prior()?;
            expected +=
                gaussian_kl(&w_q.mean, &w_q.std, &w_p.mean, &w_p.std)?.to_scalar::<f32>()?;
            let b_q = layer.bias_posterior()?.unwrap();
            let b_p = layer.bias_prior()?.unwrap();
            expected +=
                gaussian_kl(&b_q.mean, &b_q.std, &b_p.mean, &b_p.std)?.to_scalar::<f32>()?;
        }

        let deterministic = candle_nn::linear(4, 4, vb.pp("det"))?;

        let mut stack = BnnStack::new();
        stack.push_with_act(bayes_1, Activation::Relu);
        stack.push_with_act(deterministic, Activation::Relu);
        stack.push(bayes_2);

        assert_eq!(stack.num_layers(), 3);
        assert_eq!(stack.variational_layers().len(), 2);

        let total: f32 = gaussian_kl_model(&stack, &device)?.to_scalar()?;
        assert_abs_diff_eq!(total, expected, epsilon = 1e-4);

        let x = Tensor::randn(0f32, 1f32, (6, 2), &Device::Cpu)?;
        assert_eq!(stack.forward(&x)?.dims(), &[6, 1]);
        Ok(())
    }

    #[test]
    fn test_builder_variants() -> Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let config = BayesLinearConfig::default();
        let sizes = [3, 5, 2];

        let x = Tensor::randn(0f32, 1f32, (4, 3), &Device::Cpu)?;
        for model in [
            linear_emp_bnn(vb.pp("emp"), &sizes, Activation::Gelu, &config)?,
            linear_ext_emp_bnn(vb.pp("ext"), &sizes, Activation::Gelu, &config)?,
            linear_mlg_bnn(vb.pp("mlg"), &sizes, Activation::Gelu, &config)?,
        ] {
            assert_eq!(model.forward(&x)?.dims(), &[4, 2]);
            assert_eq!(model.variational_layers().len(), 2);
        }
        Ok(())
    }
}
