//! Tracing setup
//!
//! Logs go to stderr and, when a log directory is configured, to a daily
//! rolling file. `RUST_LOG` overrides the configured filter.

use crate::config::LoggingConfig;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log file prefix inside the log directory
pub const LOG_FILE_PREFIX: &str = "telemcache.log";

/// Build the filter: `RUST_LOG` if set and valid, otherwise the configured one
pub fn env_filter(config: &LoggingConfig) -> EnvFilter {
    let from_env = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    build_filter(from_env.as_deref(), &config.filter)
}

fn build_filter(from_env: Option<&str>, configured: &str) -> EnvFilter {
    from_env
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .or_else(|| EnvFilter::try_new(configured).ok())
        .unwrap_or_else(|| EnvFilter::new(crate::config::DEFAULT_LOG_FILTER))
}

/// Install the global subscriber.
///
/// The returned guard flushes the file writer when dropped; keep it alive for
/// the life of the program. Fails if a global subscriber is already set.
pub fn init(config: &LoggingConfig) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = env_filter(config);
    match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .try_init()?;
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .try_init()?;
            Ok(None)
        }
    }
}
