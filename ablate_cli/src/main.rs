use ablate_core::config::HarnessConfig;
use ablate_core::driver::{PassOptions, PassReport, run_pass};
use ablate_core::matrix::TestMatrix;
use ablate_core::results::load_results;
use ablate_core::summary::{
    render_results_table, render_summary_table, summarize, write_summary_csv,
};
use ablate_core::STARTER_CONFIG;

use anyhow::{Context, bail};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[clap(author, version, about = "Benchmark harness for ItyFuzz ablation studies", long_about = None)]
struct Cli {
    /// Harness configuration file.
    #[clap(short, long, value_parser, default_value = "ablate.toml")]
    config: PathBuf,
    /// Log filter used when RUST_LOG is not set.
    #[clap(long, default_value = "info")]
    log_level: String,
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run every target against every configuration.
    RunAll(RunArgs),
    /// Run one target, with the first configuration unless one is named.
    RunSingle {
        target: String,
        configuration: Option<String>,
        #[clap(flatten)]
        run: RunArgs,
    },
    /// Recompute the summary of an existing results.csv.
    Summarize {
        results: PathBuf,
        /// Also write the summary as CSV to this path.
        #[clap(long, value_parser)]
        output: Option<PathBuf>,
    },
    /// Show the configured targets and configurations.
    List,
    /// Write a starter configuration.
    Init { path: Option<PathBuf> },
}

#[derive(Args, Debug, Default)]
struct RunArgs {
    #[clap(long, value_parser)]
    output_dir: Option<PathBuf>,
    /// Per-case timeout in seconds.
    #[clap(long)]
    timeout: Option<u64>,
    #[clap(long)]
    workers: Option<usize>,
    #[clap(long)]
    memory_limit_mb: Option<u64>,
    /// Sample corpus size and memory while the engine runs.
    #[clap(long)]
    overhead: bool,
    /// Name of the pass directory; defaults to a UTC timestamp.
    #[clap(long)]
    pass_name: Option<String>,
}

impl RunArgs {
    fn apply(&self, config: &mut HarnessConfig) -> anyhow::Result<()> {
        if let Some(dir) = &self.output_dir {
            config.harness.output_dir = dir.clone();
        }
        if let Some(timeout) = self.timeout {
            config.harness.timeout_seconds = timeout;
        }
        if let Some(workers) = self.workers {
            config.harness.workers = workers;
        }
        if let Some(limit) = self.memory_limit_mb {
            config.harness.memory_limit_mb = Some(limit);
        }
        config
            .validate()
            .context("Invalid command-line overrides")?;
        Ok(())
    }

    fn pass_options(&self) -> PassOptions {
        PassOptions {
            overhead: self.overhead,
            pass_name: self.pass_name.clone(),
        }
    }
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(path: &Path) -> anyhow::Result<HarnessConfig> {
    HarnessConfig::load_from_file(path).with_context(|| {
        format!("Could not load {path:?}; `ablate init` writes a starter configuration")
    })
}

fn print_report(report: &PassReport) {
    println!();
    print!("{}", render_results_table(&report.results));
    println!();
    print!("{}", render_summary_table(&report.summary));
    println!("\nResults written to {}", report.layout.root.display());
}

fn run_matrix(
    config_path: &Path,
    run: &RunArgs,
    select: impl FnOnce(&HarnessConfig) -> anyhow::Result<TestMatrix>,
) -> anyhow::Result<()> {
    let mut config = load_config(config_path)?;
    run.apply(&mut config)?;
    let matrix = select(&config)?;
    info!(
        cases = matrix.len(),
        timeout_seconds = config.harness.timeout_seconds,
        workers = config.harness.workers,
        "matrix ready"
    );
    let report = run_pass(&config, &matrix, &run.pass_options())?;
    print_report(&report);
    Ok(())
}

fn summarize_file(results: &Path, output: Option<&Path>) -> anyhow::Result<()> {
    let loaded = load_results(results)?;
    if loaded.is_empty() {
        bail!("{results:?} contains no results");
    }
    let rows = summarize(&loaded);
    print!("{}", render_results_table(&loaded));
    println!();
    print!("{}", render_summary_table(&rows));
    if let Some(path) = output {
        write_summary_csv(path, &rows)?;
        println!("\nSummary written to {}", path.display());
    }
    Ok(())
}

fn list(config_path: &Path) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    println!("Targets:");
    for target in &config.targets {
        println!("  {:<24} {}", target.id, target.contract.display());
    }
    println!("Configurations:");
    for configuration in &config.configurations {
        println!("  {:<24} {}", configuration.id, configuration.flags.join(" "));
    }
    Ok(())
}

fn init(path: &Path) -> anyhow::Result<()> {
    if path.exists() {
        bail!("{path:?} already exists; refusing to overwrite it");
    }
    std::fs::write(path, STARTER_CONFIG).with_context(|| format!("Failed to write {path:?}"))?;
    println!("Wrote starter configuration to {}", path.display());

    let config = load_config(path)?;
    for target in &config.targets {
        if target.contract.exists() {
            continue;
        }
        if let Some(parent) = target.contract.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {parent:?}"))?;
        }
        std::fs::write(&target.contract, placeholder_contract(&target.id))
            .with_context(|| format!("Failed to write {:?}", target.contract))?;
        println!("Wrote placeholder contract {}", target.contract.display());
    }
    Ok(())
}

/// Runs fail fast on missing contracts, so `init` leaves a stub to replace.
fn placeholder_contract(target: &str) -> String {
    format!(
        "// SPDX-License-Identifier: UNLICENSED\n\
         // Placeholder for target `{target}`: replace with the contract under test.\n\
         pragma solidity ^0.8.0;\n\ncontract Placeholder {{}}\n"
    )
}

fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    match &cli.command {
        Command::RunAll(run) => run_matrix(&cli.config, run, |config| {
            Ok(TestMatrix::full(config)?)
        }),
        Command::RunSingle {
            target,
            configuration,
            run,
        } => run_matrix(&cli.config, run, |config| {
            Ok(TestMatrix::single(config, target, configuration.as_deref())?)
        }),
        Command::Summarize { results, output } => summarize_file(results, output.as_deref()),
        Command::List => list(&cli.config),
        Command::Init { path } => init(path.as_deref().unwrap_or(&cli.config)),
    }
}
