//! Dump/Restore Validation Harness
//!
//! Starts database servers, drives the dump and restore tools through a
//! fixed validation pipeline and reports which phases passed.

// dumpcheck/src/main.rs
mod backup;
mod config;
mod errors;
mod instance;
mod orchestrator;
mod phase;
mod retry;
mod tools;
mod utils;

#[cfg(test)]
mod testkit;

use anyhow::{Context, Result};
use config::{HarnessConfig, Timing};
use dotenv::dotenv;
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match run_app().await {
        Ok(true) => {
            println!("✅ All phases passed.");
            ExitCode::SUCCESS
        }
        Ok(false) => {
            println!("❌ Validation run failed.");
            ExitCode::FAILURE
        }
        Err(e) => {
            eprintln!("❌ Error: {:?}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run_app() -> Result<bool> {
    let config_path = env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.json"));
    let multiplier = Timing::multiplier_from_env();
    let config = HarnessConfig::load_from_json(&config_path, multiplier).context(format!(
        "Failed to load harness configuration from {}",
        config_path.display()
    ))?;

    let report = orchestrator::run_validation_flow(config)
        .await
        .context("Validation run could not be set up")?;
    println!(
        "{}",
        serde_json::to_string_pretty(&report).context("Failed to render run report")?
    );
    if let Some(reason) = &report.first_failure {
        println!("First failure: {}", reason);
    }
    Ok(report.is_success())
}
