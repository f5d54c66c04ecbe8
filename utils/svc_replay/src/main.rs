use anyhow::{Context, Result};
use clap::Parser;
use colored::*;
use regex::Regex;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

mod logger;
mod replay;
mod report;
mod scenario;

use system::SystemConfig;

/// Replays a scripted guest scenario against a fresh system and checks
/// its expectations.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Scenario JSON file
    scenario: PathBuf,

    /// System configuration JSON; the scenario's own config wins
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Output format (text, json)
    #[arg(short, long, default_value = "text")]
    format: String,

    /// Only show trace rows whose tag matches this regex
    #[arg(short = 't', long)]
    filter: Option<String>,

    /// How long every process gets to exit, in milliseconds
    #[arg(long, default_value_t = 5000)]
    timeout_ms: u64,

    /// More log output (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() {
    match run() {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            eprintln!("{} {:#}", "Error:".red().bold(), e);
            std::process::exit(2);
        }
    }
}

fn run() -> Result<bool> {
    let args = Args::parse();
    logger::init(args.verbose).context("logger already installed")?;

    let filter = args
        .filter
        .as_deref()
        .map(Regex::new)
        .transpose()
        .context("invalid --filter")?;
    let scenario = scenario::load(&args.scenario)?;
    let config = match (&scenario.config, &args.config) {
        (Some(config), _) => config.clone(),
        (None, Some(path)) => SystemConfig::from_file(path)
            .with_context(|| format!("cannot load {}", path.display()))?,
        (None, None) => SystemConfig::default(),
    };

    let mut report = replay::replay(&scenario, config, Duration::from_millis(args.timeout_ms))?;
    if let Some(filter) = &filter {
        report.retain_tags(filter);
    }

    if args.format == "json" {
        let json = serde_json::to_string_pretty(&report)?;
        let output = args.scenario.with_extension("report.json");
        fs::write(&output, json).with_context(|| format!("cannot write {}", output.display()))?;
        println!("Report written to {}", output.display());
    } else {
        report.print();
    }

    let passed = report.passed();
    println!();
    if passed {
        println!("{}", "All expectations held".green().bold());
    } else {
        println!("{}", "Some expectations failed".red().bold());
    }
    Ok(passed)
}
