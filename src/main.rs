// Simulator binary - runs one scenario against a switch and prints the measured flow statistics
//
// Scenarios come either from the built-in presets or from a JSON file. Artifacts (ingress and
// egress captures, the rank list and the report) are written when a capture directory is given.

use clap::{Parser, Subcommand};
use pifo_sim::metrics::RATE_AVG_INTERVAL_NS;
use pifo_sim::testbench::capture::write_artifacts;
use pifo_sim::testbench::presets::{preset, PRESET_NAMES};
use pifo_sim::{Scenario, Testbench};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "pifo-sim")]
#[command(version)]
#[command(about = "Cycle-accurate hierarchical PIFO scheduler simulator")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Write ingress/egress captures, ranks and the report into this directory.
    #[arg(long, global = true)]
    capture_dir: Option<PathBuf>,

    /// Rate averaging interval in nanoseconds.
    #[arg(long, global = true, default_value_t = RATE_AVG_INTERVAL_NS)]
    stats_interval: f64,

    /// Override the per-node queue bound of the scenario.
    #[arg(long, global = true)]
    max_node_size: Option<usize>,

    /// Print the report as JSON instead of a table.
    #[arg(long, global = true)]
    json: bool,

    /// More logging (-v debug, -vv trace). RUST_LOG takes precedence.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a built-in scenario.
    Preset {
        /// One of: invert, strict, rr, wrr, stfq, hstfq, min-rate.
        name: String,
    },
    /// Run a scenario described in a JSON file.
    Run { scenario: PathBuf },
    /// List the built-in scenarios.
    List,
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "pifo_sim=info",
        1 => "pifo_sim=debug",
        _ => "pifo_sim=trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut scenario: Scenario = match &cli.command {
        Command::Preset { name } => preset(name)?,
        Command::Run { scenario } => Scenario::from_path(scenario)?,
        Command::List => {
            for name in PRESET_NAMES {
                let scenario = preset(name)?;
                println!(
                    "{name:<10} {} on {}",
                    scenario.switch.algorithm.kind(),
                    scenario.switch.shape
                );
            }
            return Ok(());
        }
    };
    if cli.max_node_size.is_some() {
        scenario.switch.max_node_size = cli.max_node_size;
    }

    info!(scenario = %scenario.name, algorithm = %scenario.switch.algorithm.kind(), "starting");
    let outcome = Testbench::run_with_interval(&scenario, cli.stats_interval)?;

    if let Some(dir) = &cli.capture_dir {
        write_artifacts(
            dir,
            &outcome.arrivals,
            &outcome.ranks,
            &outcome.departures,
            &outcome.report,
        )?;
    }

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&outcome.report)?);
    } else {
        print!("{}", outcome.report);
    }

    if !outcome.report.mismatches.is_empty() || outcome.report.timed_out {
        error!(
            mismatches = outcome.report.mismatches.len(),
            timed_out = outcome.report.timed_out,
            "run did not meet expectations"
        );
        std::process::exit(1);
    }
    Ok(())
}
