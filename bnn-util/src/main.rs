use anyhow::Result;
use bnn_util::cli::{classify, gp_toy, Cli, Commands};
use clap::Parser;

fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::GpToy(args) => {
            gp_toy::run(args)?;
        }
        Commands::Classify(args) => {
            classify::run(args)?;
        }
    }

    Ok(())
}
