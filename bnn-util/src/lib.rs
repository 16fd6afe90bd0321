pub mod bnn_data_loader;
pub mod bnn_simulate;
pub mod bnn_trainer;
pub mod cli;
pub mod mfvi;

pub use candle_core;
pub use candle_nn;
