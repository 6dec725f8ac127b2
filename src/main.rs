//! CLI Entry Point for fsrs_daq
//!
//! Provides command-line interface for:
//! - Listing the configured modules, their readiness and properties
//! - Running one experiment to completion (Ctrl+C stops it cleanly)
//!
//! # Usage
//!
//! ```bash
//! fsrs_daq list
//! fsrs_daq run "FSRS Scan" --set "# of Frames=200" --set "Type=TA"
//! fsrs_daq --config lab.toml run "DAQ Monitor" --set "Points=1000"
//! ```

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use fsrs_daq::config::{AppConfig, DEFAULT_CONFIG_PATH};
use fsrs_daq::experiment::events::ScanOutcome;
use fsrs_daq::experiment::{Controller, StartOutcome};
use fsrs_daq::logging;
use fsrs_daq::property::{label_matches, PropertyKind, PropertyValue};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser)]
#[command(name = "fsrs_daq")]
#[command(about = "Pump-probe spectroscopy scan orchestration", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List modules with their capability, readiness and properties
    List,

    /// Run one experiment until it finishes
    Run {
        /// Experiment label (partial, case-insensitive)
        experiment: String,

        /// Property assignment `Label=value`, applied before the start
        #[arg(long = "set", value_name = "LABEL=VALUE")]
        assignments: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    logging::init_from_config(&config).context("initializing logging")?;
    info!(config = %cli.config.display(), "fsrs_daq starting");

    let mut controller = Controller::from_config(config)
        .await
        .context("loading modules")?;

    let result = match cli.command {
        Commands::List => {
            list(&controller);
            Ok(())
        }
        Commands::Run {
            experiment,
            assignments,
        } => run(&mut controller, &experiment, &assignments).await,
    };

    controller.shutdown().await.context("shutting down")?;
    result
}

fn list(controller: &Controller) {
    for module in controller.registry().iter() {
        println!("{} [{}] {:?}", module.label(), module.kind(), module.status());
        for view in module.module().properties().describe() {
            if view.choices.is_empty() {
                println!("    {:<24} {}", view.label, view.value);
            } else {
                println!(
                    "    {:<24} {} [{}]",
                    view.label,
                    view.value,
                    view.choices.join(", ")
                );
            }
        }
    }
}

/// Turn `Label=value` into a property value; choice properties also accept
/// the choice text.
fn parse_assignment(
    controller: &Controller,
    experiment: &str,
    assignment: &str,
) -> Result<(String, PropertyValue)> {
    let (label, raw) = assignment
        .split_once('=')
        .ok_or_else(|| anyhow!("expected LABEL=VALUE, got '{assignment}'"))?;
    let label = label.trim();
    let raw = raw.trim();

    let module = controller.registry().find(experiment)?;
    let view = module
        .module()
        .properties()
        .describe()
        .into_iter()
        .find(|v| label_matches(&v.label, label))
        .ok_or_else(|| anyhow!("'{}' has no property '{label}'", module.label()))?;

    if view.kind == PropertyKind::Choice && raw.parse::<usize>().is_err() {
        let index = view
            .choices
            .iter()
            .position(|c| c.eq_ignore_ascii_case(raw))
            .ok_or_else(|| anyhow!("'{raw}' is not one of [{}]", view.choices.join(", ")))?;
        return Ok((label.to_string(), PropertyValue::from(index as i64)));
    }
    Ok((label.to_string(), PropertyValue::from(raw)))
}

async fn run(controller: &mut Controller, experiment: &str, assignments: &[String]) -> Result<()> {
    for assignment in assignments {
        let (label, value) = parse_assignment(controller, experiment, assignment)?;
        controller
            .set_property(experiment, &label, value)
            .with_context(|| format!("setting '{assignment}'"))?;
    }

    match controller.start(experiment)? {
        StartOutcome::Started(run_id) => println!("Started {experiment} (run {run_id})"),
        StartOutcome::AlreadyRunning => bail!("{experiment} is already running"),
    }

    let finished = tokio::select! {
        summary = controller.wait_finished(experiment) => Some(summary?),
        _ = tokio::signal::ctrl_c() => None,
    };
    let summary = match finished {
        Some(summary) => summary,
        None => {
            println!("Stopping {experiment}...");
            controller.stop(experiment)?;
            controller.wait_finished(experiment).await?
        }
    };

    println!("Run {}", summary.run_id);
    println!("  completed sets: {}", summary.completed_sets);
    match &summary.outcome {
        ScanOutcome::Completed => println!("  outcome: completed"),
        ScanOutcome::Cancelled => println!("  outcome: cancelled"),
        ScanOutcome::Failed(reason) => bail!("{experiment} failed: {reason}"),
    }
    Ok(())
}
