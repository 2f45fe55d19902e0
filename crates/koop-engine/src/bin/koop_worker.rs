use clap::Parser;
use koop_engine::{run_worker, StudyKind, WorkerOptions};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Join a regularization study and run trials until done.
#[derive(Parser, Debug)]
#[command(name = "koop-worker", version)]
struct Args {
    /// Dataset bundle (JSON)
    experiment_path: PathBuf,

    /// Shared lifting functions (JSON)
    lifting_functions_path: PathBuf,

    /// Study storage, e.g. duckdb://build/studies/closed_loop.db
    storage_url: String,

    /// Trials to run in this process
    n_trials: usize,

    /// Seed of the grouped cross-validation splits
    split_seed: u64,

    #[arg(long, value_enum, default_value_t = StudyKind::ClosedLoop)]
    kind: StudyKind,

    /// Defaults to the only study in the storage
    #[arg(long)]
    study_name: Option<String>,

    #[arg(long, default_value_t = 3)]
    n_splits: usize,

    #[arg(long, default_value_t = 0.2)]
    test_size: f64,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let options = WorkerOptions {
        experiment_path: args.experiment_path,
        lifting_functions_path: args.lifting_functions_path,
        storage_url: args.storage_url,
        n_trials: args.n_trials,
        split_seed: args.split_seed,
        kind: args.kind,
        study_name: args.study_name,
        n_splits: args.n_splits,
        test_size: args.test_size,
    };
    run_worker(&options)?;
    Ok(())
}
