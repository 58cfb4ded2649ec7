//! h2-probe - check whether an HTTP/2 peer enforces SETTINGS_MAX_FRAME_SIZE.
//!
//! ```text
//! h2-probe client --authority example.com
//! h2-probe serve --cert cert.pem --key key.pem --once
//! h2-probe relay --upstream example.com:443 --direction to-upstream
//! ```
//!
//! Logging is controlled with `RUST_LOG` (default `info`).

use std::process::ExitCode;

use clap::Parser;
use h2_probe::Cli;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let report = match h2_probe::run(&cli).await {
        Ok(report) => report,
        Err(e) => {
            error!("{e}");
            return ExitCode::from(2);
        },
    };
    info!("verdict: {}", report.verdict);

    let written = match cli.mode.report_path() {
        Some(path) => report.write_to(path),
        None => report.to_json().map(|json| println!("{json}")),
    };
    if let Err(e) = written {
        error!("{e}");
        return ExitCode::from(2);
    }

    if report.enforced {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
