use crate::bnn_data_loader::DataLoader;
use crate::mfvi::{objective, NegativeLogLikelihood, ObjectiveKind, VariationalModel};

use candle_core::{Device, Result, Tensor};
use candle_nn::{AdamW, Module, Optimizer};
use indicatif::{ProgressBar, ProgressDrawTarget};
use log::info;

pub struct TrainConfig {
    pub learning_rate: f32,
    pub batch_size: usize,
    pub num_epochs: usize,
    pub device: Device,
    pub verbose: bool,
    pub show_progress: bool,
}

/// Per-epoch traces of the objective decomposition.
#[derive(Default)]
pub struct TrainLog {
    pub nelbo: Vec<f32>,
    pub nll: Vec<f32>,
    pub kl: Vec<f32>,
}

/// Train a BNN by stochastic gradient descent on the selected objective.
///
/// Minibatches are shuffled once and preloaded; the KL term is scaled
/// by `1 / num_minibatch` so that one epoch accumulates the
/// full-dataset KL exactly once. All trainable parameters registered in
/// `variable_map` (variational statistics, empirical-Bayes priors,
/// likelihood parameters) are updated jointly by one backward pass per
/// minibatch.
///
/// * `data` - data loader with input and target minibatches
/// * `likelihood` - negative log-likelihood term
/// * `train_config` - training configuration
pub fn train_bnn<M, L, D>(
    model: &M,
    likelihood: &L,
    variable_map: &candle_nn::VarMap,
    data: &mut D,
    objective_kind: ObjectiveKind,
    train_config: &TrainConfig,
) -> anyhow::Result<TrainLog>
where
    M: Module + VariationalModel,
    L: NegativeLogLikelihood,
    D: DataLoader,
{
    let device = &train_config.device;
    let mut adam = AdamW::new_lr(
        variable_map.all_vars(),
        train_config.learning_rate.into(),
    )?;

    let pb = ProgressBar::new(train_config.num_epochs as u64);

    if !train_config.show_progress || train_config.verbose {
        pb.set_draw_target(ProgressDrawTarget::hidden());
    }

    data.shuffle_minibatch(train_config.batch_size)?;

    let num_minibatch = data.num_minibatch();

    let minibatches = (0..num_minibatch)
        .map(|b| data.minibatch_shuffled(b, device))
        .collect::<anyhow::Result<Vec<_>>>()?;

    let minibatch_ratio = 1.0 / num_minibatch as f64;

    let mut train_log = TrainLog::default();

    for epoch in 0..train_config.num_epochs {
        let mut nelbo_tot = 0f32;
        let mut nll_tot = 0f32;
        let mut kl_tot = 0f32;

        for minibatch in minibatches.iter() {
            let y = minibatch
                .output
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("training requires target data"))?;

            let pred = model.forward(&minibatch.input)?;
            let nll = likelihood.nll(&pred, y)?;
            let terms = objective(objective_kind, model, nll, minibatch_ratio, device)?;
            adam.backward_step(&terms.total)?;

            nelbo_tot += terms.total.to_scalar::<f32>()?;
            nll_tot += terms.nll.to_scalar::<f32>()?;
            kl_tot += terms.kl.to_scalar::<f32>()?;
        }

        train_log.nelbo.push(nelbo_tot);
        train_log.nll.push(nll_tot);
        train_log.kl.push(kl_tot);
        pb.inc(1);

        if train_config.verbose {
            info!(
                "[{}] nelbo: {:.4} (nll: {:.4}, kl: {:.4})",
                epoch + 1,
                nelbo_tot,
                nll_tot,
                kl_tot
            );
        }
    } // each epoch

    pb.finish_and_clear();
    Ok(train_log)
}

/// Stack `num_samples` stochastic forward passes: (S, n, k).
pub fn predict_samples<M: Module>(model: &M, x: &Tensor, num_samples: usize) -> Result<Tensor> {
    let samples = (0..num_samples)
        .map(|_| model.forward(x))
        .collect::<Result<Vec<_>>>()?;
    Tensor::stack(&samples, 0)
}

/// Monte-Carlo predictive mean and std over the sample dimension.
pub fn predictive_mean_std(samples_snk: &Tensor) -> Result<(Tensor, Tensor)> {
    let mean = samples_snk.mean(0)?;
    let std = samples_snk.var(0)?.sqrt()?;
    Ok((mean, std))
}
