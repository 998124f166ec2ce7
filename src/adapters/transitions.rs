//! In-memory tracking of transient state transitions
//!
//! Intents that cross `promoting`, `demoting` or `syncing` are recorded here
//! and polled until the backend confirms the observed state, times out, or
//! exhausts its retries. Legality is re-checked at this layer as a second
//! defence behind the admission webhook.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use crate::crd::ReplicationState;
use crate::error::{Error, Result};

pub const STATE_TRANSITION_RETRY_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_STATE_TRANSITION_TIMEOUT: Duration = Duration::from_secs(300);
pub const MAX_STATE_TRANSITION_RETRIES: u32 = 10;

/// One tracked transition, keyed by `(namespace, name)` in the tracker.
#[derive(Clone, Debug)]
pub struct PendingTransition {
    pub from: ReplicationState,
    pub to: ReplicationState,
    pub allowed: bool,
    pub reason: String,
    pub started: Instant,
    pub retries: u32,
}

/// Result of one poll of a pending transition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransitionPoll {
    /// Backend confirmed the target state; the entry has been dropped.
    Completed,
    /// Still waiting; poll again after [`STATE_TRANSITION_RETRY_INTERVAL`].
    Pending,
    /// Timed out or exhausted retries; the entry has been dropped and the
    /// failure belongs in conditions.
    Failed(String),
}

/// Map of in-flight transitions. Entries never outlive the current
/// reconcile's view of the resource: they hold identities, not references.
#[derive(Default)]
pub struct TransitionTracker {
    inner: RwLock<HashMap<(String, String), PendingTransition>>,
}

impl TransitionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a transition after checking it against the graph. An illegal
    /// pair is rejected and not recorded.
    pub fn begin(
        &self,
        namespace: &str,
        name: &str,
        from: ReplicationState,
        to: ReplicationState,
    ) -> Result<()> {
        if !from.can_transition_to(to) {
            return Err(Error::ValidationError(format!(
                "invalid state transition from '{}' to '{}'",
                from, to
            )));
        }

        let mut inner = self.inner.write().expect("transition lock poisoned");
        let key = (namespace.to_string(), name.to_string());
        // Re-begin of the same transition keeps the original deadline.
        if let Some(existing) = inner.get(&key) {
            if existing.from == from && existing.to == to {
                return Ok(());
            }
        }
        inner.insert(
            key,
            PendingTransition {
                from,
                to,
                allowed: true,
                reason: format!("transition from '{}' to '{}' requested", from, to),
                started: Instant::now(),
                retries: 0,
            },
        );
        Ok(())
    }

    pub fn pending(&self, namespace: &str, name: &str) -> Option<PendingTransition> {
        self.inner
            .read()
            .expect("transition lock poisoned")
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Advance the transition with the latest observation. `confirmed` is
    /// whether the backend now reports the target state.
    pub fn poll(&self, namespace: &str, name: &str, confirmed: bool) -> TransitionPoll {
        let key = (namespace.to_string(), name.to_string());
        let mut inner = self.inner.write().expect("transition lock poisoned");
        let Some(entry) = inner.get_mut(&key) else {
            return TransitionPoll::Completed;
        };

        if confirmed {
            inner.remove(&key);
            return TransitionPoll::Completed;
        }

        entry.retries += 1;
        if entry.started.elapsed() > DEFAULT_STATE_TRANSITION_TIMEOUT {
            let reason = format!(
                "transition from '{}' to '{}' timed out after {:?}",
                entry.from, entry.to, DEFAULT_STATE_TRANSITION_TIMEOUT
            );
            inner.remove(&key);
            return TransitionPoll::Failed(reason);
        }
        if entry.retries >= MAX_STATE_TRANSITION_RETRIES {
            let reason = format!(
                "transition from '{}' to '{}' gave up after {} polls",
                entry.from, entry.to, entry.retries
            );
            inner.remove(&key);
            return TransitionPoll::Failed(reason);
        }

        TransitionPoll::Pending
    }

    /// Drop any tracked transition for this resource, e.g. on deletion.
    pub fn clear(&self, namespace: &str, name: &str) {
        self.inner
            .write()
            .expect("transition lock poisoned")
            .remove(&(namespace.to_string(), name.to_string()));
    }
}
