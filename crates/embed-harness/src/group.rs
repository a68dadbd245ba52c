//! Runs several harnesses against one shared completion gate.
//!
//! Execution is two-phased: every member runs its setup, then the group
//! waits until all of them signaled setup completion. Only then does every
//! member start its test, and the group waits again for all of them to
//! complete.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info};

use crate::error::{HarnessError, Result};
use crate::gate::CompletionGate;
use crate::harness::{Harness, TestBody};

struct Member {
    harness: Arc<Harness>,
    body: Box<dyn TestBody>,
}

/// An ordered set of harnesses sharing one gate.
pub struct InstanceGroup {
    gate: Arc<CompletionGate>,
    members: Vec<Member>,
}

impl InstanceGroup {
    #[must_use]
    pub fn new(gate: Arc<CompletionGate>) -> Self {
        Self {
            gate,
            members: Vec::new(),
        }
    }

    /// Creates a group together with a gate sized for `members` harnesses.
    #[must_use]
    pub fn with_capacity(members: usize) -> Self {
        Self::new(Arc::new(CompletionGate::new(members)))
    }

    #[must_use]
    pub fn gate(&self) -> &Arc<CompletionGate> {
        &self.gate
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.members.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Appends a member. Members keep insertion order in both phases.
    ///
    /// # Errors
    ///
    /// Returns `GateMismatch` if `harness` signals a different gate.
    pub fn add(&mut self, harness: Arc<Harness>, body: impl TestBody + 'static) -> Result<()> {
        if !Arc::ptr_eq(harness.gate(), &self.gate) {
            return Err(HarnessError::GateMismatch {
                harness: harness.id().to_string(),
            });
        }
        self.members.push(Member {
            harness,
            body: Box::new(body),
        });
        Ok(())
    }

    /// Runs both phases and blocks until every member completed.
    ///
    /// # Errors
    ///
    /// Returns `EmptyGroup` when there is nothing to run.
    pub fn execute(&self) -> Result<()> {
        if self.members.is_empty() {
            return Err(HarnessError::EmptyGroup);
        }
        let started = Instant::now();

        for member in &self.members {
            member.body.setup(&member.harness);
        }
        self.gate.wait();
        debug!(members = self.members.len(), "group setup complete");

        for member in &self.members {
            member.body.run(&member.harness);
        }
        self.gate.wait();

        info!(
            members = self.members.len(),
            elapsed_ms = started.elapsed().as_millis(),
            "group complete"
        );
        Ok(())
    }
}

impl fmt::Debug for InstanceGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceGroup")
            .field("gate", &self.gate)
            .field("members", &self.members.len())
            .finish()
    }
}
