use std::io::Write;

use anyhow::Result;
use chrono::{SecondsFormat, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Console,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "console" | "text" => Ok(LogFormat::Console),
            "json" => Ok(LogFormat::Json),
            _ => anyhow::bail!("invalid log format: {}", s),
        }
    }
}

pub fn parse_level(level: &str) -> Result<log::LevelFilter> {
    match level.to_ascii_lowercase().as_str() {
        "trace" => Ok(log::LevelFilter::Trace),
        "debug" => Ok(log::LevelFilter::Debug),
        "info" => Ok(log::LevelFilter::Info),
        "warn" | "warning" => Ok(log::LevelFilter::Warn),
        "error" => Ok(log::LevelFilter::Error),
        _ => anyhow::bail!("invalid log level: {}", level),
    }
}

fn json_line(record: &log::Record) -> String {
    serde_json::json!({
        "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        "level": record.level().as_str().to_ascii_lowercase(),
        "target": record.target(),
        "message": record.args().to_string(),
    })
    .to_string()
}

pub fn builder(level: log::LevelFilter, format: LogFormat) -> env_logger::Builder {
    let mut builder = env_logger::Builder::new();
    builder
        .target(env_logger::Target::Stdout)
        .filter_level(level)
        .parse_default_env();
    match format {
        LogFormat::Console => {
            builder
                .format_line_number(true)
                .format_file(true)
                .format_timestamp(Some(env_logger::TimestampPrecision::Millis));
        }
        LogFormat::Json => {
            builder.format(|buf, record| writeln!(buf, "{}", json_line(record)));
        }
    }
    builder
}

/// Install the global logger. `RUST_LOG` refines `level`.
pub fn init(level: &str, format: &str) -> Result<()> {
    let level = parse_level(level)?;
    let format: LogFormat = format.parse()?;
    builder(level, format).try_init()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_and_formats() {
        assert_eq!(parse_level("DEBUG").unwrap(), log::LevelFilter::Debug);
        assert_eq!(parse_level("warn").unwrap(), log::LevelFilter::Warn);
        assert!(parse_level("loud").is_err());
        assert_eq!("json".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("Console".parse::<LogFormat>().unwrap(), LogFormat::Console);
        assert!("xml".parse::<LogFormat>().is_err());
        assert!(init("info", "xml").is_err());
    }

    #[test]
    fn json_record() {
        let line = json_line(
            &log::Record::builder()
                .args(format_args!("node {} added", 42))
                .level(log::Level::Warn)
                .target("matter_server::server")
                .build(),
        );
        let v: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(v["level"], "warn");
        assert_eq!(v["target"], "matter_server::server");
        assert_eq!(v["message"], "node 42 added");
        assert!(v["timestamp"].as_str().unwrap().ends_with('Z'));
    }
}
