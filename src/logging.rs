//! Logging setup
//!
//! One rolling log file (text or JSON lines) plus an optional human-readable
//! stderr layer. Stdout stays free for command output. `RUST_LOG` overrides
//! the configured level.

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

use crate::config::AppConfig;

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Install the global subscriber
///
/// Keep the returned guard alive until exit or buffered file lines are lost.
pub fn init_logging(config: &AppConfig) -> Result<WorkerGuard> {
    std::fs::create_dir_all(&config.log_dir)
        .with_context(|| format!("Failed to create log dir {}", config.log_dir))?;
    let appender = RollingFileAppender::builder()
        .rotation(rotation(&config.rotation))
        .filename_prefix(&config.log_file)
        .build(&config.log_dir)
        .with_context(|| format!("Failed to open log file in {}", config.log_dir))?;
    let (file_writer, guard) = tracing_appender::non_blocking(appender);

    let mut layers: Vec<BoxedLayer> = Vec::new();
    if config.use_json {
        layers.push(
            fmt::layer()
                .json()
                .with_current_span(false)
                .with_writer(file_writer)
                .boxed(),
        );
    } else {
        layers.push(
            fmt::layer()
                .with_ansi(false)
                .with_writer(file_writer)
                .boxed(),
        );
    }
    if config.log_console {
        layers.push(
            fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr)
                .boxed(),
        );
    }

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(filter_directives(&config.log_level)))
        .with_context(|| format!("Invalid log level '{}'", config.log_level))?;

    // the filter wraps every layer, so it gates callsites globally
    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .context("Global logger already installed")?;
    Ok(guard)
}

fn rotation(name: &str) -> Rotation {
    match name.to_ascii_lowercase().as_str() {
        "minutely" => Rotation::MINUTELY,
        "hourly" => Rotation::HOURLY,
        "daily" => Rotation::DAILY,
        _ => Rotation::NEVER,
    }
}

/// sqlx logs every statement at info
fn filter_directives(level: &str) -> String {
    format!("{},sqlx=warn", level.trim())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rotation_names() {
        assert_eq!(rotation("daily"), Rotation::DAILY);
        assert_eq!(rotation("Hourly"), Rotation::HOURLY);
        assert_eq!(rotation("never"), Rotation::NEVER);
        assert_eq!(rotation("weekly"), Rotation::NEVER);
    }

    #[test]
    fn test_sqlx_is_quieted() {
        assert_eq!(filter_directives(" debug "), "debug,sqlx=warn");
        assert!(EnvFilter::try_new(filter_directives("info")).is_ok());
    }
}
