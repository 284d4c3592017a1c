//! `lagrange`: derive, integrate and export a Lagrangian model.
//!
//! ```text
//! lagrange --config run.json --format csv --output trajectory.csv
//! ```
//!
//! Without `--config` the ball and beam scenario runs with default settings.
//! Log verbosity follows `RUST_LOG` (default `info`); logs go to stderr.

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use lagrange_cli::{find_equilibrium, run, RunConfig};
use std::fs;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Format {
    Json,
    Csv,
}

#[derive(Parser, Debug)]
#[command(name = "lagrange")]
#[command(about = "Simulate mechanical systems from their Lagrangian", long_about = None)]
#[command(version)]
struct Args {
    /// JSON run configuration
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Output format
    #[arg(short, long, value_enum, default_value_t = Format::Json)]
    format: Format,

    /// Write to this file instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Search for an equilibrium from the initial state instead of simulating (JSON only)
    #[arg(long, conflicts_with = "format")]
    equilibrium: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => RunConfig::load(path)?,
        None => RunConfig::default(),
    };

    let rendered = if args.equilibrium {
        let result = find_equilibrium(&config)?;
        serde_json::to_string_pretty(&result).context("Failed to serialize equilibrium.")?
    } else {
        let output = run(&config)?;
        match args.format {
            Format::Json => output.to_json()?,
            Format::Csv => output.to_csv(),
        }
    };

    match &args.output {
        Some(path) => {
            fs::write(path, rendered)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            info!(path = %path.display(), "Wrote output");
        }
        None => println!("{rendered}"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equilibrium_mode_rejects_an_explicit_format() {
        assert!(Args::try_parse_from(["lagrange", "--equilibrium", "--format", "csv"]).is_err());
        assert!(Args::try_parse_from(["lagrange", "--equilibrium", "-f", "json"]).is_err());

        let args = Args::try_parse_from(["lagrange", "--equilibrium"]).unwrap();
        assert!(args.equilibrium);
        assert_eq!(args.format, Format::Json);
    }

    #[test]
    fn simulation_flags_parse() {
        let args =
            Args::try_parse_from(["lagrange", "-c", "run.json", "--format", "csv", "-o", "out.csv"])
                .unwrap();
        assert_eq!(args.config, Some(PathBuf::from("run.json")));
        assert_eq!(args.format, Format::Csv);
        assert_eq!(args.output, Some(PathBuf::from("out.csv")));
        assert!(!args.equilibrium);
    }
}
