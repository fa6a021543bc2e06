//! Connections
//!
//! A connection is created stopped. Starting it resumes every session's
//! consumers; stopping pauses them, waiting for in-flight receives to drain.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use parking_lot::Mutex;
use log::{debug, info, warn};
use crate::broker::Channel;
use crate::consumer::config::ConsumerConfig;
use crate::consumer::error::{ConsumerError, ConsumerResult};
use crate::consumer::statistics::StatisticsSnapshot;
use crate::session::{AckMode, Session};

/// Started/stopped flag shared with sessions.
///
/// The flag is lock-guarded so that a consumer can act on it while holding
/// it steady: a connection cannot start or stop in the middle of that action.
#[derive(Debug)]
pub struct ConnectionState {
    stopped: Mutex<bool>,
}

impl ConnectionState {
    pub fn new(stopped: bool) -> Self {
        Self {
            stopped: Mutex::new(stopped),
        }
    }

    pub fn is_stopped(&self) -> bool {
        *self.stopped.lock()
    }

    /// Run `action` with the stopped flag; start and stop wait until it returns
    pub fn with_stopped<R>(&self, action: impl FnOnce(bool) -> R) -> R {
        let stopped = self.stopped.lock();
        action(*stopped)
    }

    fn set_stopped(&self, stopped: bool) {
        *self.stopped.lock() = stopped;
    }
}

pub struct Connection {
    state: Arc<ConnectionState>,
    channel: Arc<dyn Channel>,
    config: ConsumerConfig,
    sessions: Mutex<Vec<Arc<Session>>>,
    /// Serializes start, stop and close
    lifecycle: Mutex<()>,
    closed: AtomicBool,
}

impl Connection {
    /// Create a stopped connection after validating `config`
    pub fn new(channel: Arc<dyn Channel>, config: ConsumerConfig) -> ConsumerResult<Self> {
        config.validate()?;
        Ok(Self {
            state: Arc::new(ConnectionState::new(true)),
            channel,
            config,
            sessions: Mutex::new(Vec::new()),
            lifecycle: Mutex::new(()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn create_session(&self, ack_mode: AckMode) -> ConsumerResult<Arc<Session>> {
        self.ensure_open()?;
        let session = Session::new(ack_mode, Arc::clone(&self.channel), Arc::clone(&self.state), self.config.clone());
        let mut sessions = self.sessions.lock();
        sessions.retain(|s| !s.is_closed());
        sessions.push(Arc::clone(&session));
        debug!("created {} session ({} open)", ack_mode, sessions.len());
        Ok(session)
    }

    pub fn is_stopped(&self) -> bool {
        self.state.is_stopped()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> ConsumerResult<()> {
        if self.is_closed() {
            return Err(ConsumerError::illegal_state("Connection is closed"));
        }
        Ok(())
    }

    fn open_sessions(&self) -> Vec<Arc<Session>> {
        self.sessions.lock().iter().filter(|s| !s.is_closed()).cloned().collect()
    }

    /// Start (or restart) delivery on every session
    pub fn start(&self) -> ConsumerResult<()> {
        let _lifecycle = self.lifecycle.lock();
        self.ensure_open()?;
        if !self.is_stopped() {
            return Ok(());
        }
        info!("starting connection");
        self.state.set_stopped(false);
        Self::collect("connection start", self.open_sessions().iter().map(|s| s.resume()))
    }

    /// Pause delivery on every session
    pub fn stop(&self) -> ConsumerResult<()> {
        let _lifecycle = self.lifecycle.lock();
        self.ensure_open()?;
        if self.is_stopped() {
            return Ok(());
        }
        info!("stopping connection");
        self.state.set_stopped(true);
        Self::collect("connection stop", self.open_sessions().iter().map(|s| s.pause()))
    }

    /// Close every session; repeated calls are no-ops
    pub fn close(&self) -> ConsumerResult<()> {
        let _lifecycle = self.lifecycle.lock();
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("closing connection");
        self.state.set_stopped(true);
        let sessions = std::mem::take(&mut *self.sessions.lock());
        Self::collect("connection close", sessions.iter().map(|s| s.close()))
    }

    fn collect(operation: &str, results: impl Iterator<Item = ConsumerResult<()>>) -> ConsumerResult<()> {
        let failures: Vec<ConsumerError> = results.filter_map(Result::err).collect();
        if failures.is_empty() {
            Ok(())
        } else {
            Err(ConsumerError::ActivitiesFailed {
                operation: operation.to_string(),
                failures,
            })
        }
    }

    /// Combined statistics of every open session
    pub fn statistics(&self) -> StatisticsSnapshot {
        self.open_sessions()
            .iter()
            .fold(StatisticsSnapshot::default(), |acc, s| acc.merge(&s.statistics()))
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("error closing connection on drop: {}", e);
        }
    }
}
