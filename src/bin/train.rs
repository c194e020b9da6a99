use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use ecg_train::{TrainConfig, TrainError, Trainer};

/// Train an ECG waveform classifier from a JSON run configuration.
#[derive(Debug, Parser)]
#[command(name = "train", version)]
struct Args {
    /// Path to the JSON configuration describing the run.
    #[arg(long)]
    config: PathBuf,
}

fn main() -> ExitCode {
    let args = Args::parse();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> Result<(), TrainError> {
    let config = TrainConfig::from_path(&args.config)?;
    let mut trainer = Trainer::new(config)?;
    trainer.run()
}
