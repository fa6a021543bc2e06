//! Application orchestration module

pub mod initialization;
pub mod execution;

pub use initialization::{load_configuration, configure_logging, consumer_config};
pub use execution::{run_consumers, RunReport};
