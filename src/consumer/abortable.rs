//! Abortable Activity Registry
//!
//! Background activities (typically push-delivery subscriptions) expose a
//! common start/stop/abort capability so a consumer can pause, resume or tear
//! all of them down in one call.

use std::collections::HashMap;
use std::sync::Arc;
use parking_lot::Mutex;
use log::{debug, warn};
use crate::consumer::error::{ConsumerError, ConsumerResult};

/// Lifecycle capability of a background activity
pub trait Abortable: Send + Sync {
    /// Identifier used for registration and removal
    fn activity_id(&self) -> String;

    /// Begin or resume producing work
    fn start(&self) -> ConsumerResult<()>;

    /// Cease producing work, remaining resumable. Returns once stopped.
    fn stop(&self) -> ConsumerResult<()>;

    /// Tear down for good
    fn abort(&self) -> ConsumerResult<()>;
}

/// Set of abortable activities driven in bulk
#[derive(Default)]
pub struct AbortableRegistry {
    members: Mutex<HashMap<String, Arc<dyn Abortable>>>,
}

impl AbortableRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an activity; an activity with the same id is replaced
    pub fn add(&self, activity: Arc<dyn Abortable>) {
        let id = activity.activity_id();
        if self.members.lock().insert(id.clone(), activity).is_some() {
            warn!("Activity '{}' registered twice, replacing previous entry", id);
        }
    }

    /// Remove an activity by id, returning it if present
    pub fn remove(&self, activity_id: &str) -> Option<Arc<dyn Abortable>> {
        self.members.lock().remove(activity_id)
    }

    pub fn contains(&self, activity_id: &str) -> bool {
        self.members.lock().contains_key(activity_id)
    }

    pub fn len(&self) -> usize {
        self.members.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop every member
    pub fn stop(&self) -> ConsumerResult<()> {
        Self::apply("stop", self.snapshot(), |member| member.stop())
    }

    /// Start every member
    pub fn start(&self) -> ConsumerResult<()> {
        Self::apply("start", self.snapshot(), |member| member.start())
    }

    /// Abort every member and clear the registry
    pub fn abort(&self) -> ConsumerResult<()> {
        let members: Vec<_> = self.members.lock().drain().map(|(_, member)| member).collect();
        Self::apply("abort", members, |member| member.abort())
    }

    fn snapshot(&self) -> Vec<Arc<dyn Abortable>> {
        self.members.lock().values().cloned().collect()
    }

    /// Run `operation` on every member outside the membership lock, then
    /// report every failure together.
    fn apply<F>(operation: &str, members: Vec<Arc<dyn Abortable>>, mut operation_fn: F) -> ConsumerResult<()>
    where
        F: FnMut(&dyn Abortable) -> ConsumerResult<()>,
    {
        debug!("{} {} registered activit{}", operation, members.len(), if members.len() == 1 { "y" } else { "ies" });
        let failures: Vec<ConsumerError> = members
            .iter()
            .filter_map(|member| {
                operation_fn(member.as_ref()).err().inspect(|e| {
                    warn!("Activity '{}' failed to {}: {}", member.activity_id(), operation, e);
                })
            })
            .collect();

        if failures.is_empty() {
            Ok(())
        } else {
            Err(ConsumerError::ActivitiesFailed {
                operation: operation.to_string(),
                failures,
            })
        }
    }
}
