use anyhow::Result;
use std::process;
use log::{error, info};
use consumer_gate::{app, cli, logging};

fn main() {
    if let Err(e) = run() {
        error!("Application error: {:#}", e);
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}

fn run() -> Result<()> {
    let args = cli::args::parse_args();

    cli::args::validate_args(&args)?;

    let config_manager = app::load_configuration(&args)?;

    let log_config = app::configure_logging(&args, &config_manager)?;
    logging::init_logger(log_config)?;

    let consumer_config = app::consumer_config(&args, &config_manager)?;
    info!(
        "running {} {} consumer(s) on '{}' ({} ack)",
        args.consumers,
        if args.listener { "listener" } else { "receive" },
        args.queue,
        args.ack_mode
    );

    let report = app::run_consumers(&args, consumer_config)?;
    println!("{}", report);

    Ok(())
}
