// ekf_sim/src/cli.rs

use clap::{ArgAction, Parser};
use std::path::PathBuf;

/// Runs the navigation filter against a synthetic vehicle and reports how
/// well it tracked the truth.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// The path to the scenario TOML file to run.
    #[arg(short, long, default_value = "assets/scenarios/stationary_gps.toml")]
    pub scenario: PathBuf,

    /// Seed for the sensor noise. Overrides the scenario seed.
    #[arg(long)]
    pub seed: Option<u64>,

    /// Simulated duration in seconds. Overrides the scenario duration.
    #[arg(short, long)]
    pub duration: Option<f32>,

    /// Increase log verbosity (-v debug, -vv trace).
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,
}

impl Cli {
    /// Default log filter for the requested verbosity.
    pub fn log_filter(&self) -> &'static str {
        match self.verbose {
            0 => "info",
            1 => "info,ekf_core=debug,ekf_sim=debug",
            _ => "trace",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_are_optional() {
        let cli = Cli::parse_from(["ekf_sim"]);
        assert!(cli.seed.is_none());
        assert!(cli.duration.is_none());
        assert_eq!(cli.log_filter(), "info");
    }

    #[test]
    fn verbosity_counts_flags() {
        let cli = Cli::parse_from(["ekf_sim", "-vv", "--seed", "7", "-d", "12.5"]);
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.seed, Some(7));
        assert_eq!(cli.duration, Some(12.5));
    }
}
