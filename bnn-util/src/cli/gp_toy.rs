use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use candle_nn::{Activation, VarBuilder, VarMap};
use clap::Args;
use log::info;
use nalgebra::DMatrix;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use crate::bnn_data_loader::InMemoryData;
use crate::bnn_simulate::{gp_toy_regression, GpToyConfig};
use crate::bnn_trainer::{predict_samples, predictive_mean_std, train_bnn, TrainConfig};
use crate::mfvi::{linear_bnn, linear_mlg_bnn, BayesLinearConfig, GaussianNll, ObjectiveKind};

use super::{select_device, ObjectiveType};

#[derive(Args, Debug)]
pub struct GpToyArgs {
    #[arg(long, default_value = "200")]
    pub n_train: usize,

    #[arg(long, default_value = "100")]
    pub n_test: usize,

    #[arg(long, default_value = "0.1")]
    pub noise_std: f64,

    #[arg(long, default_value = "0.3", help = "GP kernel length scale")]
    pub lengthscale: f64,

    #[arg(long, default_value = "50")]
    pub hidden_dim: usize,

    #[arg(long, default_value = "1.0")]
    pub prior_std: f64,

    #[arg(long, default_value = "0.05")]
    pub init_std: f64,

    #[arg(long, help = "Scale the weight prior std by 1/sqrt(fan_in)")]
    pub sqrt_width_scaling: bool,

    #[arg(long, default_value = "nelbo")]
    pub objective: ObjectiveType,

    #[arg(long, default_value = "2000")]
    pub epochs: usize,

    #[arg(long, default_value = "1e-3")]
    pub lr: f64,

    #[arg(long, default_value = "32")]
    pub batch_size: usize,

    #[arg(long, default_value = "100", help = "Posterior samples for prediction")]
    pub samples: usize,

    #[arg(long, default_value = "1")]
    pub seed: u64,

    #[arg(short, long, help = "Write test predictions to a TSV file")]
    pub output: Option<PathBuf>,

    #[arg(long)]
    pub gpu: bool,

    #[arg(short, long)]
    pub verbose: bool,
}

pub fn run(args: &GpToyArgs) -> Result<()> {
    let device = select_device(args.gpu);
    info!("Using device: {:?}", device);

    let sim_config = GpToyConfig {
        n_train: args.n_train,
        n_test: args.n_test,
        noise_std: args.noise_std,
        lengthscale: args.lengthscale,
        ..Default::default()
    };
    let sim = gp_toy_regression(&sim_config, args.seed)?;
    info!(
        "Simulated {} training and {} test points (noise std {})",
        args.n_train, args.n_test, args.noise_std
    );

    let mut data = InMemoryData::new_with_output(&sim.x_train, &sim.y_train)?;

    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

    let layer_config = BayesLinearConfig {
        prior_weight_std: args.prior_std,
        prior_bias_std: args.prior_std,
        init_std: args.init_std,
        sqrt_width_scaling: args.sqrt_width_scaling,
        bias: true,
    };
    let layer_sizes = [1, args.hidden_dim, args.hidden_dim, 1];

    let objective_kind = args.objective.kind();
    let model = match objective_kind {
        ObjectiveKind::MlgNelbo => {
            linear_mlg_bnn(vb.pp("bnn"), &layer_sizes, Activation::Relu, &layer_config)?
        }
        _ => linear_bnn(vb.pp("bnn"), &layer_sizes, Activation::Relu, &layer_config)?,
    };
    info!("BNN architecture: {:?}", layer_sizes);

    let likelihood = GaussianNll::new(vb.pp("likelihood"), -3.0)?;

    let train_config = TrainConfig {
        learning_rate: args.lr as f32,
        batch_size: args.batch_size,
        num_epochs: args.epochs,
        device: device.clone(),
        verbose: args.verbose,
        show_progress: true,
    };

    let train_log = train_bnn(
        &model,
        &likelihood,
        &varmap,
        &mut data,
        objective_kind,
        &train_config,
    )?;

    if let Some(last) = train_log.nelbo.last() {
        info!("final objective: {:.4}", last);
    }
    info!("learned noise variance: {:.6}", likelihood.noise_var()?);

    // posterior predictive on the test grid
    let x_test = dmatrix_to_tensor(&sim.x_test, &device)?;
    let y_test = dmatrix_to_tensor(&sim.y_test, &device)?;

    let samples = predict_samples(&model, &x_test, args.samples)?;
    let (pred_mean, pred_std) = predictive_mean_std(&samples)?;

    let rmse: f32 = pred_mean
        .sub(&y_test)?
        .sqr()?
        .mean_all()?
        .sqrt()?
        .to_scalar()?;
    info!("test RMSE (predictive mean): {:.4}", rmse);

    if let Some(ref path) = args.output {
        write_predictions(path, &sim.x_test, &y_test, &pred_mean, &pred_std)?;
        info!("Saved predictions to {:?}", path);
    }

    Ok(())
}

pub(crate) fn dmatrix_to_tensor(mat: &DMatrix<f32>, device: &Device) -> Result<Tensor> {
    let (nrows, ncols) = mat.shape();
    let data: Vec<f32> = mat.transpose().iter().copied().collect(); // row-major
    Ok(Tensor::from_vec(data, (nrows, ncols), device)?)
}

fn write_predictions(
    path: &PathBuf,
    x: &DMatrix<f32>,
    y: &Tensor,
    mean: &Tensor,
    std: &Tensor,
) -> Result<()> {
    let mut out = BufWriter::new(File::create(path)?);
    writeln!(out, "x\ty\tpred_mean\tpred_std")?;

    let y = y.flatten_all()?.to_vec1::<f32>()?;
    let mean = mean.flatten_all()?.to_vec1::<f32>()?;
    let std = std.flatten_all()?.to_vec1::<f32>()?;

    for i in 0..x.nrows() {
        writeln!(out, "{}\t{}\t{}\t{}", x[(i, 0)], y[i], mean[i], std[i])?;
    }
    Ok(())
}
