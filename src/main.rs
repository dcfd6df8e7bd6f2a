use std::{path::PathBuf, process::ExitCode, sync::Arc};

use clap::Parser;

mod api;
mod config;
mod liveness;
mod logging;
mod monitoring;
mod probe;

/// Power-cycles an OPNsense router through its BMC when it stops answering
/// from both sides.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Path to the YAML config file.
    #[arg(default_value = "config.yml")]
    config: PathBuf,

    /// Run a single check cycle and exit.
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let log_handle = logging::init(config::LogLevel::Info);

    let config = match config::load(&args.config) {
        Ok(config) => config,
        Err(why) => {
            tracing::error!("Cannot load config: {why}");
            return ExitCode::FAILURE;
        }
    };
    logging::apply_level(&log_handle, config.log_level);

    let api = match api::Api::from_config(&config) {
        Ok(api) => api,
        Err(why) => {
            tracing::error!("{why}");
            return ExitCode::FAILURE;
        }
    };

    tracing::info!(
        "Watching {} local and {} global addresses every {}s ({:?} policy), resetting via {}",
        config.check_ips.local.len(),
        config.check_ips.global.len(),
        config.check_interval_secs,
        config.policy,
        api.reset_url()
    );
    if config.no_restart {
        tracing::warn!("no_restart is set, the router will never actually be reset");
    }

    let evaluator = liveness::Evaluator::new(probe::from_config(&config.probe), &config);
    let mut watchdog = monitoring::Watchdog::new(&config, evaluator, Arc::new(api));

    if args.once {
        watchdog.tick().await;
        if let monitoring::WatchdogState::Cooldown(_) = watchdog.state() {
            tracing::warn!(
                "The reset time is not kept between runs; \
                 make sure the next --once run is at least {} minutes away",
                config.reset_delay_minutes
            );
        }
        return ExitCode::SUCCESS;
    }

    tokio::select! {
        _ = watchdog.run() => {}
        _ = shutdown_signal() => tracing::info!("Shutting down"),
    }

    ExitCode::SUCCESS
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(why) => {
            tracing::warn!("Cannot listen for SIGTERM: {why}");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
