//! Logging setup for the relayer daemon.

use crate::Error;
use std::{fmt, str::FromStr};
use tracing::Level;
use tracing_subscriber::{layer::SubscriberExt, EnvFilter, Registry};

/// Output format of log lines.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Json,
    Text,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogFormat::Json => f.write_str("json"),
            LogFormat::Text => f.write_str("text"),
        }
    }
}

impl FromStr for LogFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "json" => Ok(LogFormat::Json),
            "text" => Ok(LogFormat::Text),
            other => Err(Error::ConfigInvalid(format!(
                "log format must be json or text: {other}"
            ))),
        }
    }
}

/// Filter for `level`, unless `RUST_LOG` is set.
fn filter(level: Level) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.to_string()))
}

/// Install the global subscriber.
pub fn init(level: Level, format: LogFormat) -> Result<(), Error> {
    let result = match format {
        LogFormat::Json => {
            let fmt_layer = tracing_subscriber::fmt::layer()
                .json()
                .with_line_number(true)
                .with_file(true);
            let subscriber = Registry::default().with(filter(level)).with(fmt_layer);
            tracing::subscriber::set_global_default(subscriber)
        }
        LogFormat::Text => {
            let fmt_layer = tracing_subscriber::fmt::layer().with_target(true);
            let subscriber = Registry::default().with(filter(level)).with(fmt_layer);
            tracing::subscriber::set_global_default(subscriber)
        }
    };
    result.map_err(|e| Error::ConfigInvalid(format!("failed to set subscriber: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format() {
        assert_eq!("json".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("text".parse::<LogFormat>().unwrap(), LogFormat::Text);
        assert!("yaml".parse::<LogFormat>().is_err());
        assert_eq!(LogFormat::default().to_string(), "json");
    }
}
