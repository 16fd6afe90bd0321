pub mod classify;
pub mod gp_toy;

use candle_core::Device;
use clap::{Parser, Subcommand, ValueEnum};

use crate::mfvi::ObjectiveKind;

pub use classify::ClassifyArgs;
pub use gp_toy::GpToyArgs;

#[derive(Parser)]
#[command(name = "bnn-util")]
#[command(about = "Bayesian neural network experiments with mean-field variational inference")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Toy GP regression with a Bayesian neural network
    GpToy(GpToyArgs),
    /// Classification on tabular feature/label files
    Classify(ClassifyArgs),
}

#[derive(Clone, Debug, ValueEnum)]
pub enum ObjectiveType {
    /// Negative ELBO with the mean-field KL
    Nelbo,
    /// MAP with an unscaled prior penalty
    Map,
    /// MLG approximate scheme (standard normal prior)
    Mlg,
}

impl ObjectiveType {
    pub fn kind(&self) -> ObjectiveKind {
        match self {
            ObjectiveType::Nelbo => ObjectiveKind::Nelbo,
            ObjectiveType::Map => ObjectiveKind::Map,
            ObjectiveType::Mlg => ObjectiveKind::MlgNelbo,
        }
    }
}

#[derive(Clone, Debug, ValueEnum)]
pub enum LayerType {
    /// Mean-field posterior, fixed Gaussian prior
    Bayes,
    /// Learnable scalar prior scale (empirical Bayes)
    Emp,
    /// Per-unit learnable prior (extended empirical Bayes)
    ExtEmp,
    /// Marginal-likelihood-gradient scheme
    Mlg,
}

pub(crate) fn select_device(gpu: bool) -> Device {
    if gpu {
        #[cfg(target_os = "macos")]
        {
            Device::new_metal(0).unwrap_or(Device::Cpu)
        }
        #[cfg(target_os = "linux")]
        {
            Device::new_cuda(0).unwrap_or(Device::Cpu)
        }
        #[cfg(not(any(target_os = "macos", target_os = "linux")))]
        {
            Device::Cpu
        }
    } else {
        Device::Cpu
    }
}
