use anyhow::Context;
use clap::{Parser, Subcommand};
use koop_engine::{
    best_alphas, run_evaluation, run_search, worker_executable, write_lifting, BestAlphas, SearchConfig,
};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Regularization search and evaluation for closed-loop Koopman models.
#[derive(Parser, Debug)]
#[command(name = "koop-search", version)]
struct Cli {
    /// Search configuration (JSON); defaults apply when omitted
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write the shared lifting functions
    Lifting,
    /// Run the closed-loop and open-loop studies
    Search,
    /// Evaluate at the best alpha of each stored study
    Evaluate {
        /// Override the closed-loop alpha instead of reading the study
        #[arg(long, requires = "open_loop_alpha")]
        closed_loop_alpha: Option<f64>,
        /// Override the open-loop alpha instead of reading the study
        #[arg(long, requires = "closed_loop_alpha")]
        open_loop_alpha: Option<f64>,
    },
    /// Lifting, search and evaluation in order
    All,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => SearchConfig::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => SearchConfig::default(),
    };
    config.validate()?;

    match cli.command {
        Command::Lifting => write_lifting(&config)?,
        Command::Search => {
            let alphas = run_search(&config, &worker_executable()?)?;
            info!(closed_loop = alphas.closed_loop, open_loop = alphas.open_loop, "search finished");
        }
        Command::Evaluate {
            closed_loop_alpha,
            open_loop_alpha,
        } => {
            let alphas = match (closed_loop_alpha, open_loop_alpha) {
                (Some(closed_loop), Some(open_loop)) => BestAlphas {
                    closed_loop,
                    open_loop,
                },
                _ => best_alphas(&config)?,
            };
            run_evaluation(&config, alphas)?;
        }
        Command::All => {
            write_lifting(&config)?;
            let alphas = run_search(&config, &worker_executable()?)?;
            run_evaluation(&config, alphas)?;
        }
    }
    Ok(())
}
