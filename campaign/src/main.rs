//! `campaign` command-line entry point.
//!
//! `run` drives one engine invocation and exits with its exit code; `report`
//! and `summary` print derived views of a campaign's run-state snapshot.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;

use campaign::core::report::{build_report, build_summary};
use campaign::core::selector::MissionWindow;
use campaign::engine::CampaignEngine;
use campaign::exit_codes;
use campaign::io::clock::SystemClock;
use campaign::io::config::load_spec;
use campaign::io::evaluator::AllFlowsValidEvaluator;
use campaign::io::executor::CommandMissionExecutor;
use campaign::io::hooks::ShellHookRunner;
use campaign::io::paths::CampaignPaths;
use campaign::io::run_state::load_run_state;
use campaign::logging;

#[derive(Parser)]
#[command(
    name = "campaign",
    version,
    about = "Resumable campaign orchestration for coding-agent missions"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run (or resume) the campaign described by a config file.
    Run {
        /// Campaign TOML file.
        #[arg(long)]
        config: PathBuf,
        /// Directory holding campaign directories (overrides `output_root`).
        #[arg(long)]
        output_root: Option<PathBuf>,
        /// Skip this many plan entries (sharded execution).
        #[arg(long, default_value_t = 0)]
        offset: u32,
        /// Consider at most this many plan entries after `--offset`.
        #[arg(long)]
        limit: Option<u32>,
    },
    /// Print per-flow counts and failure buckets as JSON.
    Report {
        #[arg(long)]
        campaign_dir: PathBuf,
    },
    /// Print the report plus claimed-vs-verified mission checks as JSON.
    Summary {
        #[arg(long)]
        campaign_dir: PathBuf,
    },
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::ABORTED);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run {
            config,
            output_root,
            offset,
            limit,
        } => cmd_run(&config, output_root, MissionWindow { offset, limit }),
        Command::Report { campaign_dir } => {
            let state = load_run_state(&CampaignPaths::for_dir(campaign_dir).run_state_path)?;
            print_json(&build_report(&state))?;
            Ok(exit_codes::OK)
        }
        Command::Summary { campaign_dir } => {
            let state = load_run_state(&CampaignPaths::for_dir(campaign_dir).run_state_path)?;
            print_json(&build_summary(&state))?;
            Ok(exit_codes::OK)
        }
    }
}

fn cmd_run(config: &Path, output_root: Option<PathBuf>, window: MissionWindow) -> Result<i32> {
    let spec = load_spec(config)?;
    spec.validate_commands()
        .with_context(|| format!("validate {}", config.display()))?;
    let output_root = output_root
        .or_else(|| spec.output_root.clone())
        .unwrap_or_else(|| PathBuf::from("."));
    let paths = CampaignPaths::new(&output_root, &spec.campaign_id);

    let executor = CommandMissionExecutor::new(&paths.campaign_dir, spec.attempt_timeout());
    let engine = CampaignEngine::new(
        &spec,
        paths,
        &executor,
        &AllFlowsValidEvaluator,
        &ShellHookRunner,
        &SystemClock,
    )
    .with_window(window);
    let outcome = engine.run()?;

    let reasons = if outcome.state.reason_codes.is_empty() {
        "-".to_string()
    } else {
        outcome.state.reason_codes.join(",")
    };
    println!(
        "run: {} status={} missions={}/{} reasons={}",
        outcome.state.run_id,
        outcome.state.status.as_str(),
        outcome.state.missions_completed,
        outcome.state.total_missions,
        reasons
    );
    if let Some(failure) = &outcome.failure {
        eprintln!("{failure}");
    }
    Ok(outcome.exit_code)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let payload = serde_json::to_string_pretty(value).context("serialize json")?;
    println!("{payload}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_run_with_window() {
        let cli = Cli::parse_from([
            "campaign", "run", "--config", "c.toml", "--offset", "2", "--limit", "3",
        ]);
        match cli.command {
            Command::Run {
                config,
                output_root,
                offset,
                limit,
            } => {
                assert_eq!(config, PathBuf::from("c.toml"));
                assert_eq!(output_root, None);
                assert_eq!(offset, 2);
                assert_eq!(limit, Some(3));
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn parse_report() {
        let cli = Cli::parse_from(["campaign", "report", "--campaign-dir", "out/nightly"]);
        assert!(matches!(cli.command, Command::Report { .. }));
    }
}
