// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! pipeline-sim: replays instruction workloads through the Echo pipeline.
//!
//! ```text
//! pipeline-sim run workload.yaml
//! pipeline-sim --format json demo
//! pipeline-sim --config ./cfg config
//! ```

mod demo;
mod report;
mod workload;

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use echo_config_fs::FsConfigStore;
use echo_pipeline::config::{ConfigService, PipelineConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::report::{emit, Format};
use crate::workload::{replay, Workload};

#[derive(Parser, Debug)]
#[command(name = "pipeline-sim", version)]
#[command(about = "Replay instruction workloads through the Echo pipeline")]
struct Cli {
    /// Directory holding `pipeline.json` (defaults apply when omitted)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Concurrency cap override (wins over config file and workload)
    #[arg(long, global = true)]
    cap: Option<usize>,
    /// Output format
    #[arg(long, value_enum, default_value_t = Format::Table, global = true)]
    format: Format,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Replay a YAML workload file
    Run {
        /// Path to the workload
        workload: PathBuf,
    },
    /// Replay the built-in scenarios
    Demo,
    /// Print the effective pipeline configuration
    Config {
        /// Write the effective configuration back to `--config`
        #[arg(long)]
        save: bool,
    },
}

fn load_config(dir: Option<&Path>) -> Result<PipelineConfig> {
    let Some(dir) = dir else {
        return Ok(PipelineConfig::default());
    };
    let service = ConfigService::new(FsConfigStore::at(dir)?);
    let config = PipelineConfig::load_or_default(&service)
        .with_context(|| format!("failed to load config from {}", dir.display()))?;
    info!(dir = %dir.display(), cap = config.concurrency_cap, "config loaded");
    Ok(config)
}

async fn simulate(
    out: &mut impl Write,
    workload: &Workload,
    base: &PipelineConfig,
    cli: &Cli,
) -> Result<()> {
    let mut config = workload.config(base);
    if let Some(cap) = cli.cap {
        config.concurrency_cap = cap;
    }
    let report = replay(workload, config).await?;
    emit(out, &report, cli.format)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .with_writer(std::io::stderr)
        .init();

    let base = load_config(cli.config.as_deref())?;
    let stdout = std::io::stdout();
    let mut out = stdout.lock();

    match &cli.command {
        Commands::Run { workload } => {
            let text = std::fs::read_to_string(workload)
                .with_context(|| format!("failed to read {}", workload.display()))?;
            let parsed = Workload::parse(&text)?;
            simulate(&mut out, &parsed, &base, &cli).await?;
        }
        Commands::Demo => {
            for (name, text) in demo::SCENARIOS {
                let parsed = Workload::parse(text).with_context(|| format!("scenario {name}"))?;
                simulate(&mut out, &parsed, &base, &cli).await?;
            }
        }
        Commands::Config { save } => {
            let mut config = base;
            if let Some(cap) = cli.cap {
                config.concurrency_cap = cap;
            }
            if *save {
                let dir = cli
                    .config
                    .as_deref()
                    .context("--save needs --config <dir>")?;
                config.save(&ConfigService::new(FsConfigStore::at(dir)?))?;
            }
            serde_json::to_writer_pretty(&mut out, &config)?;
            writeln!(out)?;
        }
    }
    Ok(())
}
