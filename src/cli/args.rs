use clap::Parser;
use anyhow::Result;
use std::path::PathBuf;
use log::debug;
use crate::session::AckMode;

/// Drive message consumers against an in-memory broker
#[derive(Parser, Debug, Clone)]
#[command(name = "consumer-gate")]
#[command(about = "Publish messages to an in-memory queue and drain them with blocking receives or message listeners, exercising pause, resume and close")]
#[command(version)]
pub struct Args {
    /// Queue to publish to and consume from
    #[arg(long, value_name = "NAME", default_value = "work")]
    pub queue: String,

    /// Number of messages to publish
    #[arg(short = 'n', long, value_name = "COUNT", default_value_t = 100)]
    pub messages: usize,

    /// Number of consumers (each in its own session)
    #[arg(short = 'c', long, value_name = "COUNT", default_value_t = 2)]
    pub consumers: usize,

    /// Deliver through message listeners instead of blocking receives
    #[arg(long)]
    pub listener: bool,

    /// Stop the connection for this long mid-run, then start it again
    #[arg(long, value_name = "MS")]
    pub pause_ms: Option<u64>,

    /// Receive timeout; consumers give up after this long without a message (must be positive)
    #[arg(long, value_name = "MS", default_value_t = 500)]
    pub timeout_ms: u64,

    /// Polling interval while a receive waits (overrides configuration)
    #[arg(long, value_name = "MS")]
    pub polling_interval_ms: Option<u64>,

    /// Acknowledgement mode: auto, dups-ok, client or transacted
    #[arg(long, value_name = "MODE", default_value = "auto")]
    pub ack_mode: AckMode,

    /// Verbose output (debug level logging)
    #[arg(short, long)]
    pub verbose: bool,

    /// Quiet output (error level logging only)
    #[arg(short, long)]
    pub quiet: bool,

    /// Debug output (trace level logging)
    #[arg(long)]
    pub debug: bool,

    /// Log format: text or json
    #[arg(long, value_name = "FORMAT", default_value = "text")]
    pub log_format: String,

    /// Log file path for file output
    #[arg(long, value_name = "FILE")]
    pub log_file: Option<PathBuf>,

    /// Log level for file output (independent of console level)
    #[arg(long, value_name = "LEVEL")]
    pub log_file_level: Option<String>,

    /// Configuration file path
    #[arg(long, value_name = "FILE")]
    pub config_file: Option<PathBuf>,

    /// Configuration section name
    #[arg(long, value_name = "SECTION")]
    pub config_name: Option<String>,
}

pub fn parse_args() -> Args {
    let args = Args::parse();
    debug!("Parsed CLI arguments: {:?}", args);
    args
}

/// Validate CLI argument combinations
pub fn validate_args(args: &Args) -> Result<()> {
    debug!("Validating CLI argument combinations");

    let log_flags_count = [args.verbose, args.quiet, args.debug]
        .iter()
        .filter(|&&flag| flag)
        .count();

    if log_flags_count > 1 {
        return Err(anyhow::anyhow!(
            "Conflicting log level flags: only one of --verbose, --quiet, or --debug may be specified"
        ));
    }

    match args.log_format.to_lowercase().as_str() {
        "text" | "json" => {},
        _ => return Err(anyhow::anyhow!(
            "Invalid log format '{}'. Valid options: text, json", args.log_format
        )),
    }

    if let Some(ref level) = args.log_file_level {
        if args.log_file.is_none() {
            return Err(anyhow::anyhow!("--log-file-level requires --log-file"));
        }
        crate::logging::parse_log_level(level)?;
    }

    if args.consumers == 0 {
        return Err(anyhow::anyhow!("--consumers must be at least 1"));
    }

    // A zero receive timeout means "wait forever"; receivers would never finish
    if args.timeout_ms == 0 {
        return Err(anyhow::anyhow!("--timeout-ms must be at least 1"));
    }

    if args.queue.is_empty() {
        return Err(anyhow::anyhow!("--queue must not be empty"));
    }

    Ok(())
}
