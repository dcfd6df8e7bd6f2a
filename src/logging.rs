//! Tracing subscriber setup.
//!
//! Logging starts before the config file is read, so config errors are
//! visible. Once the config is loaded, its level is swapped in through a
//! reload handle, unless `RUST_LOG` is set.

use tracing_subscriber::{EnvFilter, Registry, prelude::*, reload};

use crate::config::LogLevel;

pub type ReloadHandle = reload::Handle<EnvFilter, Registry>;

/// Install the global subscriber at `initial` level.
pub fn init(initial: LogLevel) -> ReloadHandle {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(initial.as_filter()));
    let (filter_layer, handle) = reload::Layer::new(filter);

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    handle
}

/// Switch to the configured level. `RUST_LOG` wins if present.
pub fn apply_level(handle: &ReloadHandle, level: LogLevel) {
    if std::env::var_os(EnvFilter::DEFAULT_ENV).is_some() {
        tracing::debug!("RUST_LOG is set, ignoring loglevel={level} from config");
        return;
    }
    if let Err(why) = handle.reload(EnvFilter::new(level.as_filter())) {
        tracing::warn!("Failed to apply log level {level}: {why}");
    }
}
