use anyhow::{anyhow, Result};
use candle_core::{DType, Tensor};
use candle_nn::{Activation, VarBuilder, VarMap};
use clap::Args;
use log::info;
use ndarray::Array2;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use crate::bnn_data_loader::InMemoryData;
use crate::bnn_trainer::{predict_samples, train_bnn, TrainConfig};
use crate::mfvi::{
    accuracy, linear_bnn, linear_emp_bnn, linear_ext_emp_bnn, linear_mlg_bnn, BayesLinearConfig,
    BnnStack, CategoricalNll,
};

use super::{select_device, LayerType, ObjectiveType};

#[derive(Args, Debug)]
pub struct ClassifyArgs {
    #[arg(short, long, help = "Feature matrix (TSV/CSV, one sample per row)")]
    pub x: PathBuf,

    #[arg(short, long, help = "Labels (one integer class per row)")]
    pub y: PathBuf,

    #[arg(long, default_value = "128")]
    pub h1_dim: usize,

    #[arg(long, default_value = "64")]
    pub h2_dim: usize,

    #[arg(short, long, default_value = "bayes")]
    pub layer: LayerType,

    #[arg(short, long, default_value = "nelbo")]
    pub objective: ObjectiveType,

    #[arg(long, default_value = "1.0")]
    pub prior_std: f64,

    #[arg(long, default_value = "0.05")]
    pub init_std: f64,

    #[arg(long, default_value = "200")]
    pub epochs: usize,

    #[arg(long, default_value = "1e-3")]
    pub lr: f64,

    #[arg(long, default_value = "64")]
    pub batch_size: usize,

    #[arg(long, default_value = "50", help = "Posterior samples for prediction")]
    pub samples: usize,

    #[arg(long)]
    pub gpu: bool,

    #[arg(short, long)]
    pub verbose: bool,
}

pub fn run(args: &ClassifyArgs) -> Result<()> {
    let device = select_device(args.gpu);
    info!("Using device: {:?}", device);

    info!("Loading X from {:?}", args.x);
    let x = load_matrix(&args.x)?;
    info!("  X shape: {:?}", x.dim());

    info!("Loading Y from {:?}", args.y);
    let y = load_matrix(&args.y)?;
    if y.nrows() != x.nrows() {
        return Err(anyhow!("X and Y must have same number of rows"));
    }

    let num_classes = y
        .iter()
        .map(|&v| v as usize)
        .max()
        .ok_or_else(|| anyhow!("empty label file"))?
        + 1;
    info!("{} classes", num_classes);

    let mut data = InMemoryData::new_with_output(&x, &y)?;

    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

    let layer_config = BayesLinearConfig {
        prior_weight_std: args.prior_std,
        prior_bias_std: args.prior_std,
        init_std: args.init_std,
        ..Default::default()
    };
    let layer_sizes = [x.ncols(), args.h1_dim, args.h2_dim, num_classes];

    let model = build_model(vb.pp("bnn"), &args.layer, &layer_sizes, &layer_config)?;
    info!("BNN architecture: {:?} ({:?} layers)", layer_sizes, args.layer);

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
        &CategoricalNll,
        &varmap,
        &mut data,
        args.objective.kind(),
        &train_config,
    )?;

    if let Some(last) = train_log.nelbo.last() {
        info!("final objective: {:.4}", last);
    }

    // Monte-Carlo predictive accuracy on the training data
    let x_all = array_to_tensor(&x, &device)?;
    let y_all = array_to_tensor(&y, &device)?;
    let logits = predict_samples(&model, &x_all, args.samples)?.mean(0)?;
    let acc = accuracy(&logits, &y_all)?;
    info!("predictive accuracy: {:.4}", acc);

    Ok(())
}

fn build_model(
    vb: VarBuilder,
    layer: &LayerType,
    layer_sizes: &[usize],
    config: &BayesLinearConfig,
) -> Result<BnnStack> {
    let activation = Activation::Gelu;
    let model = match layer {
        LayerType::Bayes => linear_bnn(vb, layer_sizes, activation, config)?,
        LayerType::Emp => linear_emp_bnn(vb, layer_sizes, activation, config)?,
        LayerType::ExtEmp => linear_ext_emp_bnn(vb, layer_sizes, activation, config)?,
        LayerType::Mlg => linear_mlg_bnn(vb, layer_sizes, activation, config)?,
    };
    Ok(model)
}

fn array_to_tensor(
    array: &Array2<f32>,
    device: &candle_core::Device,
) -> candle_core::Result<Tensor> {
    let (nrows, ncols) = array.dim();
    let data: Vec<f32> = array.iter().copied().collect();
    Tensor::from_vec(data, (nrows, ncols), device)
}

/// Read a numeric matrix from a TSV/CSV file; comment lines starting
/// with '#' are skipped.
fn load_matrix(path: &Path) -> Result<Array2<f32>> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);

    let mut rows: Vec<Vec<f32>> = vec![];
    for line in reader.lines() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let row = trimmed
            .split(|c: char| c == '\t' || c == ',' || c == ' ')
            .filter(|tok| !tok.is_empty())
            .map(|tok| tok.parse::<f32>())
            .collect::<std::result::Result<Vec<f32>, _>>()
            .map_err(|e| anyhow!("failed to parse {:?}: {}", path, e))?;
        rows.push(row);
    }

    let nrows = rows.len();
    let ncols = rows.first().map(|r| r.len()).unwrap_or(0);
    if nrows == 0 || ncols == 0 {
        return Err(anyhow!("no data in {:?}", path));
    }
    if rows.iter().any(|r| r.len() != ncols) {
        return Err(anyhow!("ragged rows in {:?}", path));
    }

    let flat: Vec<f32> = rows.into_iter().flatten().collect();
    Ok(Array2::from_shape_vec((nrows, ncols), flat)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_matrix_tsv() -> Result<()> {
        let dir = std::env::temp_dir();
        let path = dir.join("bnn_util_classify_test.tsv");
        {
            let mut f = File::create(&path)?;
            writeln!(f, "# header comment")?;
            writeln!(f, "1.0\t2.0\t3.0")?;
            writeln!(f, "4.0\t5.0\t6.0")?;
        }
        let mat = load_matrix(&path)?;
        assert_eq!(mat.dim(), (2, 3));
        assert_eq!(mat[(1, 2)], 6.0);
        std::fs::remove_file(&path)?;
        Ok(())
    }
}
