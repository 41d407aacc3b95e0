//! Flotilla Runtime
//!
//! Boots a ship simulation from an optional JSON config file:
//!
//! ```text
//! flotilla [config.json]
//! ```
//!
//! Runs until Ctrl-C. Log verbosity follows `RUST_LOG` (default `info`).

use anyhow::{Context, Result};
use clap::Parser;
use flotilla_sim::{SimConfig, Simulation};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "flotilla", version, about = "Concurrent spaceship simulation")]
struct Args {
    /// JSON config file; defaults apply to every key it omits
    config: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    tracing::info!("Flotilla v{}", flotilla_core::VERSION);

    let config = match &args.config {
        Some(path) => {
            SimConfig::load(path).with_context(|| format!("loading {}", path.display()))?
        }
        None => SimConfig::default(),
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.parallelism())
        .thread_name("flotilla-worker")
        .enable_all()
        .build()
        .context("building the async runtime")?;

    runtime.block_on(async move {
        let simulation = Simulation::start(config)?;
        let samples = simulation
            .run_until(async {
                if let Err(err) = tokio::signal::ctrl_c().await {
                    tracing::warn!(%err, "cannot listen for Ctrl-C; stopping");
                }
            })
            .await?;
        tracing::info!(samples, "done");
        Ok::<_, anyhow::Error>(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_path_is_optional() {
        assert!(Args::try_parse_from(["flotilla"]).unwrap().config.is_none());

        let args = Args::try_parse_from(["flotilla", "flotilla.json"]).unwrap();
        assert_eq!(args.config, Some(PathBuf::from("flotilla.json")));

        assert!(Args::try_parse_from(["flotilla", "a.json", "b.json"]).is_err());
    }
}
