//! Subscriber setup for structured logs.

use opentelemetry_sdk::trace::Tracer;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{LogFormat, ObservabilityConfig};

/// Build the env filter: `RUST_LOG` wins over the configured level.
pub fn env_filter(config: &ObservabilityConfig) -> anyhow::Result<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => Ok(EnvFilter::try_new(&config.log_level)?),
    }
}

/// Install the global subscriber, optionally bridging spans to an OpenTelemetry tracer.
///
/// # Errors
///
/// Returns an error if the level directive is invalid or a subscriber is already set.
pub fn init_logging(config: &ObservabilityConfig, tracer: Option<Tracer>) -> anyhow::Result<()> {
    let filter = env_filter(config)?;
    let otel_layer = tracer.map(|tracer| tracing_opentelemetry::layer().with_tracer(tracer));
    let registry = tracing_subscriber::registry().with(filter).with(otel_layer);

    match config.log_format {
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(false)
                    .with_target(true),
            )
            .try_init()?,
        LogFormat::Pretty => registry
            .with(fmt::layer().pretty().with_target(true))
            .try_init()?,
        LogFormat::Compact => registry
            .with(fmt::layer().compact().with_target(false))
            .try_init()?,
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_level_rejected() {
        std::env::remove_var("RUST_LOG");
        let config = ObservabilityConfig {
            log_level: "conveyor=[".to_string(),
            ..Default::default()
        };
        assert!(env_filter(&config).is_err());
    }

    #[test]
    fn test_directive_accepted() {
        std::env::remove_var("RUST_LOG");
        let config = ObservabilityConfig {
            log_level: "info,conveyor_core::jobs=debug".to_string(),
            ..Default::default()
        };
        assert!(env_filter(&config).is_ok());
    }
}
