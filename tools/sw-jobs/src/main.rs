//! Scenario runner for the RustKit service worker jobs engine.
//!
//! Provides commands for:
//! - Running register / update / unregister scenarios against the engine
//! - Validating an engine configuration file
//!
//! ## Usage
//!
//! ```bash
//! # Run a scenario and print each step
//! sw-jobs run scenarios/basic.json
//!
//! # Same, as JSON, with engine debug logs on stderr
//! sw-jobs run scenarios/basic.json --format json --log-level debug
//!
//! # Validate a configuration
//! sw-jobs check-config jobs.json
//! ```

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use rustkit_common::logging::{try_init_logging, LogConfig};
use rustkit_sw::{JobsConfig, RegistrationSnapshot, WorkerSnapshot};

mod scenario;

use scenario::{Outcome, Scenario, ScenarioReport};

#[derive(Parser)]
#[command(name = "sw-jobs")]
#[command(about = "Scenario runner for the RustKit service worker jobs engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    Pretty,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a scenario file and report every step
    Run {
        /// Scenario JSON file
        scenario: PathBuf,
        /// Report format
        #[arg(short, long, value_enum, default_value = "pretty")]
        format: OutputFormat,
        /// Engine log level (trace, debug, info, warn, error)
        #[arg(long, default_value = "warn")]
        log_level: String,
        /// Engine log format (pretty, compact, json)
        #[arg(long, default_value = "compact")]
        log_format: String,
    },

    /// Validate a jobs engine configuration file
    CheckConfig {
        /// Configuration JSON file
        config: PathBuf,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            scenario,
            format,
            log_level,
            log_format,
        } => {
            try_init_logging(LogConfig::parse(&log_level, &log_format)?)?;

            let scenario = Scenario::from_file(&scenario)?;
            let report = scenario::run(&scenario)?;
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
                OutputFormat::Pretty => print_report(&report),
            }

            if !report.passed() {
                std::process::exit(1);
            }
        }

        Commands::CheckConfig { config } => {
            let text = std::fs::read_to_string(&config)?;
            let parsed = JobsConfig::from_json_str(&text)?;
            println!("{} is valid:", config.display());
            println!("{}", serde_json::to_string_pretty(&parsed)?);
        }
    }

    Ok(())
}

fn print_report(report: &ScenarioReport) {
    println!("Steps:");
    for step in &report.steps {
        let verdict = match step.matched {
            Some(true) => " [PASS]",
            Some(false) => " [FAIL]",
            None => "",
        };
        match &step.outcome {
            Outcome::Resolved { value } if value.is_null() => {
                println!("  {:>2}. {:<16} ok{}", step.index, step.action, verdict)
            }
            Outcome::Resolved { value } => {
                println!("  {:>2}. {:<16} resolved {}{}", step.index, step.action, value, verdict)
            }
            Outcome::Rejected { error, .. } => {
                println!("  {:>2}. {:<16} rejected {}{}", step.index, step.action, error, verdict)
            }
        }
        for event in &step.events {
            println!("        {} <- {}", event.client, event.event);
        }
    }

    println!("Registrations:");
    if report.registrations.is_empty() {
        println!("  (none)");
    }
    for registration in &report.registrations {
        print_registration(registration);
    }
}

fn print_registration(registration: &RegistrationSnapshot) {
    println!(
        "  {} {} (update via cache: {:?})",
        registration.id, registration.scope, registration.update_via_cache
    );
    let slots: [(&str, &Option<WorkerSnapshot>); 3] = [
        ("installing", &registration.installing),
        ("waiting", &registration.waiting),
        ("active", &registration.active),
    ];
    for (slot, worker) in slots {
        if let Some(worker) = worker {
            let running = if worker.running { "running" } else { "stopped" };
            println!(
                "    {:<10} {} {} {} ({})",
                slot, worker.id, worker.script_url, worker.state, running
            );
        }
    }
}
