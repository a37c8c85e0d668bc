// ekf_sim/src/main.rs

use std::process::ExitCode;

use clap::Parser;
use ekf_sim::cli::Cli;
use ekf_sim::prelude::*;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn run(cli: &Cli) -> SimResult<RunSummary> {
    info!(scenario = %cli.scenario.display(), "loading scenario");
    let config = ScenarioConfig::load(&cli.scenario)?;

    // An unseeded run still logs its seed so it can be replayed.
    let seed = cli
        .seed
        .or(config.simulation.seed)
        .unwrap_or_else(rand::random);
    let duration = cli.duration.unwrap_or(config.simulation.duration_seconds);
    info!(seed, duration_s = duration, trajectory = ?config.trajectory, "starting run");

    let mut sim = Simulation::new(&config, seed)?;
    sim.run(duration)
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cli.log_filter()));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();

    match run(&cli) {
        Ok(summary) => {
            summary.log();
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!(error = %err, "simulation failed");
            ExitCode::FAILURE
        }
    }
}
