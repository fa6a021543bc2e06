//! Consumer Gate
//!
//! Concurrency core of a message consumer: blocking receives with
//! deadlines over a non-blocking fetch primitive, listener-based push
//! delivery, and pause/resume/close that coordinate the two.

pub mod app;
pub mod broker;
pub mod cli;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod logging;
pub mod session;
