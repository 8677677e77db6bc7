use crate::config::{LogFormat, LoggingConfig};
use chrono::{DateTime, Utc};
use log::{LevelFilter, Record};
use serde_json::json;
use std::io::Write;

fn json_line(record: &Record) -> String {
    let timestamp: DateTime<Utc> = Utc::now();
    let log_entry = json!({
        "timestamp": timestamp.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string(),
        "level": record.level().to_string().to_lowercase(),
        "target": record.target(),
        "message": record.args().to_string(),
    });
    log_entry.to_string()
}

/// Installs env_logger as the `log` backend. `RUST_LOG` overrides the configured level.
pub fn init(config: &LoggingConfig) -> Result<(), Box<dyn std::error::Error>> {
    let level = parse_log_level(&config.level)?;
    let mut builder = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(level.to_string().to_lowercase()),
    );

    if config.format == LogFormat::Json {
        builder.format(|buf, record| writeln!(buf, "{}", json_line(record)));
    }

    builder.try_init()?;
    Ok(())
}

pub fn parse_log_level(s: &str) -> Result<LevelFilter, Box<dyn std::error::Error>> {
    match s.to_lowercase().as_str() {
        "trace" => Ok(LevelFilter::Trace),
        "debug" => Ok(LevelFilter::Debug),
        "info" => Ok(LevelFilter::Info),
        "warn" => Ok(LevelFilter::Warn),
        "error" => Ok(LevelFilter::Error),
        "off" => Ok(LevelFilter::Off),
        _ => Err(format!("Invalid log level: {}. Must be one of: trace, debug, info, warn, error, off", s).into()),
    }
}

pub fn parse_log_format(s: &str) -> Result<LogFormat, Box<dyn std::error::Error>> {
    match s.to_lowercase().as_str() {
        "text" => Ok(LogFormat::Text),
        "json" => Ok(LogFormat::Json),
        _ => Err(format!("Invalid log format: {}. Must be one of: text, json", s).into()),
    }
}
