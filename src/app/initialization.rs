//! Application initialization and configuration

use anyhow::{Context, Result};
use log::debug;
use crate::{cli, config, logging};
use crate::consumer::ConsumerConfig;

pub fn load_configuration(args: &cli::Args) -> Result<config::ConfigManager> {
    let mut manager = if let Some(config_file) = &args.config_file {
        debug!("Loading configuration from explicit file: {}", config_file.display());
        config::ConfigManager::load_from_file(config_file.clone())?
    } else {
        config::ConfigManager::load()?
    };

    if let Some(section_name) = &args.config_name {
        manager.select_section(section_name.clone());
    }

    Ok(manager)
}

/// Consumer settings from the config file, with command line overrides
pub fn consumer_config(args: &cli::Args, config: &config::ConfigManager) -> Result<ConsumerConfig> {
    let mut consumer = config.get_consumer_config()?;
    if let Some(interval) = args.polling_interval_ms {
        debug!("Polling interval overridden on command line: {}ms", interval);
        consumer.polling_interval_ms = interval;
    }
    consumer.validate().context("Invalid consumer configuration")?;
    Ok(consumer)
}

pub fn configure_logging(args: &cli::Args, config: &config::ConfigManager) -> Result<logging::LogConfig> {
    use log::LevelFilter;
    use std::str::FromStr;

    let console_level = if args.debug {
        LevelFilter::Trace
    } else if args.verbose {
        LevelFilter::Debug
    } else if args.quiet {
        LevelFilter::Error
    } else {
        match config.get_log_level("base", "console-level") {
            Ok(Some(level)) => level,
            Ok(None) => LevelFilter::Info,
            Err(e) => {
                debug!("Invalid console-level in config, using default: {}", e);
                LevelFilter::Info
            }
        }
    };

    let format = if args.log_format != "text" {
        logging::LogFormat::from_str(&args.log_format)
            .map_err(|e| anyhow::anyhow!(e))?
    } else {
        match config.get_value("base", "log-format") {
            Some(format_str) => logging::LogFormat::from_str(format_str)
                .unwrap_or(logging::LogFormat::Text),
            None => logging::LogFormat::Text,
        }
    };

    let log_file_path = args.log_file.clone()
        .or_else(|| config.get_path("base", "log-file"));

    let file_log_level = match &args.log_file_level {
        Some(level_str) => Some(logging::parse_log_level(level_str)?),
        None => config.get_log_level("base", "file-log-level").unwrap_or_else(|e| {
            debug!("Invalid file-log-level in config, ignoring: {}", e);
            None
        }),
    };

    let (destination, file_level) = match (log_file_path, file_log_level) {
        (Some(file_path), level) => {
            let level = level.unwrap_or(console_level);
            (logging::LogDestination::Both(file_path), Some(level))
        }
        (None, None) => (logging::LogDestination::Console, None),
        (None, Some(_)) => {
            return Err(anyhow::anyhow!("Log file level specified without log file"));
        }
    };

    Ok(logging::LogConfig {
        console_level,
        file_level,
        format,
        destination,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use std::collections::HashMap;
    use log::LevelFilter;

    fn args(argv: &[&str]) -> cli::Args {
        cli::Args::try_parse_from(std::iter::once("consumer-gate").chain(argv.iter().copied())).unwrap()
    }

    fn manager(entries: &[(&str, &str, &str)]) -> config::ConfigManager {
        let mut configuration = config::Configuration::new();
        for (section, key, value) in entries {
            configuration
                .entry(section.to_string())
                .or_insert_with(HashMap::new)
                .insert(key.to_string(), value.to_string());
        }
        config::ConfigManager::from_config(configuration)
    }

    #[test]
    fn test_flags_override_config_levels() {
        let config = manager(&[("base", "console-level", "warn")]);
        assert_eq!(configure_logging(&args(&[]), &config).unwrap().console_level, LevelFilter::Warn);
        assert_eq!(configure_logging(&args(&["--debug"]), &config).unwrap().console_level, LevelFilter::Trace);
        assert_eq!(configure_logging(&args(&["-q"]), &config).unwrap().console_level, LevelFilter::Error);
    }

    #[test]
    fn test_log_file_from_config() {
        let config = manager(&[("base", "log-file", "/tmp/consumer-gate.log"), ("base", "log-format", "json")]);
        let log_config = configure_logging(&args(&[]), &config).unwrap();
        assert_eq!(log_config.format, logging::LogFormat::Json);
        assert_eq!(
            log_config.destination,
            logging::LogDestination::Both("/tmp/consumer-gate.log".into())
        );
        assert_eq!(log_config.file_level, Some(LevelFilter::Info));
    }

    #[test]
    fn test_polling_interval_override() {
        let config = manager(&[("consumer", "polling-interval", "250")]);
        assert_eq!(consumer_config(&args(&[]), &config).unwrap().polling_interval_ms, 250);
        let overridden = consumer_config(&args(&["--polling-interval-ms", "10"]), &config).unwrap();
        assert_eq!(overridden.polling_interval_ms, 10);
    }
}
