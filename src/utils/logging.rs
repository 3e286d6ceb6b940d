//! Structured logging setup.
//!
//! The engine only emits `tracing` events. Applications that want them
//! printed call [`init_logging`] once at startup; the subscriber honours the
//! level, format and outputs in [`LoggingConfig`].

use std::fs::OpenOptions;
use std::sync::Mutex;

use tracing::info;
use tracing_subscriber::fmt::writer::{BoxMakeWriter, MakeWriterExt};

use crate::config::LoggingConfig;
use crate::error::{ProtocolError, Result};

/// Install a global `tracing` subscriber built from `config`.
///
/// Fails if the configuration is invalid, the log file cannot be opened, or
/// a global subscriber is already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let errors = config.validate();
    if !errors.is_empty() {
        return Err(ProtocolError::ConfigError(errors.join("; ")));
    }

    let writer = make_writer(config)?;
    let builder = tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_target(true)
        .with_ansi(config.log_to_console && !config.log_to_file)
        .with_writer(writer);

    let installed = if config.json_format {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| ProtocolError::ConfigError(format!("Failed to install logger: {e}")))?;

    info!(app = %config.app_name, level = %config.log_level, "Logging initialized");
    Ok(())
}

fn make_writer(config: &LoggingConfig) -> Result<BoxMakeWriter> {
    let file = match (&config.log_file_path, config.log_to_file) {
        (Some(path), true) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| {
                    ProtocolError::ConfigError(format!("Failed to open log file {path}: {e}"))
                })?;
            Some(Mutex::new(file))
        }
        _ => None,
    };

    Ok(match (config.log_to_console, file) {
        (true, Some(file)) => BoxMakeWriter::new(std::io::stderr.and(file)),
        (false, Some(file)) => BoxMakeWriter::new(file),
        _ => BoxMakeWriter::new(std::io::stderr),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_config_rejected() {
        let config = LoggingConfig {
            log_to_console: false,
            log_to_file: false,
            ..LoggingConfig::default()
        };
        assert!(matches!(
            init_logging(&config),
            Err(ProtocolError::ConfigError(_))
        ));
    }

    #[test]
    fn test_missing_log_directory_rejected() {
        let config = LoggingConfig {
            log_to_file: true,
            log_file_path: Some("/nonexistent-peerwire-dir/out.log".into()),
            ..LoggingConfig::default()
        };
        assert!(init_logging(&config).is_err());
    }
}
