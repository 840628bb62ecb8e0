//! Shared telemetry bootstrap for custodian binaries.

use crate::{Error, Result};

use std::sync::OnceLock;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

const DEFAULT_SERVICE: &str = "custodian";

static SERVICE: OnceLock<String> = OnceLock::new();

/// Output format of the log subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Text,
}

impl LogFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogFormat::Json => "json",
            LogFormat::Text => "text",
        }
    }
}

/// Parsed telemetry configuration from environment.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub service_name: String,
    pub format: LogFormat,
}

impl TelemetryConfig {
    pub fn from_env(default_service_name: &str) -> Result<Self> {
        let service_name = std::env::var("CUSTODIAN_SERVICE_NAME")
            .unwrap_or_else(|_| default_service_name.to_string());
        let service_name = service_name.trim();
        if service_name.is_empty() {
            return Err(Error::Config(
                "CUSTODIAN_SERVICE_NAME cannot be empty".to_string(),
            ));
        }

        let format = match std::env::var("CUSTODIAN_LOG_FORMAT") {
            Ok(raw) => parse_log_format(&raw)?,
            Err(_) => LogFormat::Json,
        };

        Ok(Self {
            service_name: service_name.to_string(),
            format,
        })
    }
}

/// Handle describing the initialized telemetry of a binary.
pub struct Telemetry {
    config: TelemetryConfig,
}

impl Telemetry {
    /// Initialize the tracing subscriber for a binary.
    pub fn init_for_component(default_service_name: &str, log_level: &str) -> Result<Self> {
        let config = TelemetryConfig::from_env(default_service_name)?;
        let level = parse_log_level(log_level)?;

        let builder = FmtSubscriber::builder()
            .with_max_level(level)
            .with_target(true)
            .with_thread_ids(true);
        let init = match config.format {
            LogFormat::Json => builder.json().try_init(),
            LogFormat::Text => builder.try_init(),
        };
        init.map_err(|e| {
            Error::Config(format!("failed to initialize telemetry subscriber: {e}"))
        })?;

        let _ = SERVICE.set(config.service_name.clone());

        info!(
            service_name = %config.service_name,
            log_format = config.format.as_str(),
            "Telemetry bootstrap initialized"
        );

        Ok(Self { config })
    }

    pub fn service_name(&self) -> &str {
        &self.config.service_name
    }

    pub fn format(&self) -> LogFormat {
        self.config.format
    }
}

/// Service label attached to every metric.
pub fn service() -> &'static str {
    SERVICE.get().map(String::as_str).unwrap_or(DEFAULT_SERVICE)
}

fn parse_log_level(raw: &str) -> Result<Level> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        other => Err(Error::Config(format!(
            "invalid log level '{other}', expected one of [trace, debug, info, warn, error]"
        ))),
    }
}

fn parse_log_format(raw: &str) -> Result<LogFormat> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "json" => Ok(LogFormat::Json),
        "text" | "plain" => Ok(LogFormat::Text),
        other => Err(Error::Config(format!(
            "CUSTODIAN_LOG_FORMAT must be one of [json, text], got '{other}'"
        ))),
    }
}
