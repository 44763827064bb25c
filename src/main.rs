//! Main application entry point (CLI binary).
//!
//! This is a thin wrapper around the `rapid_backup` library that handles:
//! - Command-line argument parsing
//! - Environment variable loading (.env file)
//! - Logger initialization
//! - Opening the output file
//!
//! All core functionality is implemented in the library crate.

use std::process;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::AsyncWrite;

use rapid_backup::app::print_report;
use rapid_backup::initialization::init_logger_with;
use rapid_backup::{run_backup, BackupConfig, Opt};

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file (if it exists)
    // This allows keeping COUCH_URL and BEARER_APIKEY out of the shell history
    if dotenvy::dotenv().is_err() {
        if let Ok(exe_path) = std::env::current_exe() {
            if let Some(exe_dir) = exe_path.parent() {
                let env_path = exe_dir.join(".env");
                if env_path.exists() {
                    let _ = dotenvy::from_path(&env_path);
                }
            }
        }
    }

    let opt = Opt::parse();
    init_logger_with(opt.log_level.clone().into(), opt.log_format.clone())
        .context("Failed to initialize logger")?;

    let output: Box<dyn AsyncWrite + Unpin + Send> = if opt.output.as_os_str() == "-" {
        Box::new(tokio::io::stdout())
    } else {
        let file = tokio::fs::File::create(&opt.output)
            .await
            .with_context(|| format!("Failed to create {}", opt.output.display()))?;
        Box::new(file)
    };
    let output_name = opt.output.display().to_string();
    let config = BackupConfig::from(opt);

    match run_backup(config, output).await {
        Ok(report) => {
            print_report(&report);
            if report.is_clean() {
                eprintln!(
                    "Backed up {} docs to {} in {:.1}s",
                    report.finished_docs + report.tail_docs,
                    output_name,
                    report.elapsed_ms as f64 / 1000.0
                );
                Ok(())
            } else {
                eprintln!("rapid_backup: backup finished with errors");
                process::exit(1);
            }
        }
        Err(e) => {
            eprintln!("rapid_backup error: {:#}", e);
            process::exit(1);
        }
    }
}
