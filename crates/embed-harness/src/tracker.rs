//! Per-instance lifecycle bookkeeping.
//!
//! Every instance is acknowledged on up to two independent channels: the
//! engine's core channel and, in windowing mode, the window channel of the
//! container hosting it. An instance counts as created (or closed) only
//! once every required channel has acknowledged:
//!
//! ```text
//!                 core ack ─┐                      core ack ─┐
//!  (untracked) ─►           ├─► created ─► ... ─►            ├─► closed ─► (retired)
//!               window ack ─┘   (counted)        window ack ─┘   (uncounted)
//! ```
//!
//! In single-channel mode the window column disappears and the core ack alone
//! completes each transition. Each acknowledgment flag may be set exactly
//! once; a repeat is recorded as a failure and leaves the state unchanged.
//!
//! The tracker never signals completion itself. Its entry points return an
//! outcome and the owning harness decides, after releasing its own state,
//! whether the test is done.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::engine::InstanceId;
use crate::harness::HarnessId;
use crate::results::{TestFailure, TestResults};

/// The notification path an acknowledgment arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    /// Instance-level notifications from the engine.
    Core,
    /// Notifications from the windowing container wrapping an instance.
    Window,
}

impl Channel {
    fn index(self) -> usize {
        match self {
            Channel::Core => 0,
            Channel::Window => 1,
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Channel::Core => "core",
            Channel::Window => "window",
        })
    }
}

/// Number of fully created instances across every harness of a run.
///
/// Shared by `Arc` instead of living in a global so tests can observe it in
/// isolation.
#[derive(Debug, Default)]
pub struct InstanceCounter {
    created: AtomicUsize,
}

impl InstanceCounter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self) -> usize {
        self.created.load(Ordering::Acquire)
    }

    fn increment(&self) {
        self.created.fetch_add(1, Ordering::AcqRel);
    }

    fn decrement(&self) {
        let _ = self
            .created
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct AckPair([bool; 2]);

impl AckPair {
    fn get(self, channel: Channel) -> bool {
        self.0[channel.index()]
    }

    /// Returns false if the flag was already set.
    fn set(&mut self, channel: Channel) -> bool {
        !std::mem::replace(&mut self.0[channel.index()], true)
    }

    fn complete(self, dual_channel: bool) -> bool {
        self.get(Channel::Core) && (!dual_channel || self.get(Channel::Window))
    }
}

/// Acknowledgment state of one instance.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct InstanceRecord {
    created: AckPair,
    closed: AckPair,
    // Whether the shared counter was incremented for this instance.
    counted: bool,
}

impl InstanceRecord {
    #[must_use]
    pub fn created(&self, channel: Channel) -> bool {
        self.created.get(channel)
    }

    #[must_use]
    pub fn closed(&self, channel: Channel) -> bool {
        self.closed.get(channel)
    }

    #[must_use]
    pub fn creation_complete(&self, dual_channel: bool) -> bool {
        self.created.complete(dual_channel)
    }

    #[must_use]
    pub fn close_complete(&self, dual_channel: bool) -> bool {
        self.closed.complete(dual_channel)
    }
}

/// Non-owning bookkeeping entry for a live instance.
///
/// The engine owns the instance; commands go back through the engine by id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstanceHandle {
    pub id: InstanceId,
    pub created_at: Instant,
}

/// Result of a creation acknowledgment.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CreateOutcome {
    /// Every required channel has now acknowledged creation.
    pub creation_complete: bool,
    /// The acknowledgment was a repeat (already recorded as a failure).
    pub duplicate: bool,
}

/// Result of a close acknowledgment.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CloseOutcome {
    /// Every required channel has now acknowledged closure.
    pub close_complete: bool,
    /// Nothing tracked by the harness remains open.
    pub test_complete: bool,
    /// The acknowledgment was a repeat (already recorded as a failure).
    pub duplicate: bool,
}

/// Lifecycle state machine for all instances of one harness.
#[derive(Debug)]
pub struct LifecycleTracker {
    owner: HarnessId,
    dual_channel: bool,
    verbose: bool,
    counter: Arc<InstanceCounter>,
    results: Arc<TestResults>,
    records: HashMap<InstanceId, InstanceRecord>,
    // Fully closed ids of the current test. Cleared by `begin_test`.
    retired: HashSet<InstanceId>,
    instances: BTreeMap<InstanceId, InstanceHandle>,
    first_instance: Option<InstanceId>,
    containers: usize,
}

impl LifecycleTracker {
    #[must_use]
    pub fn new(
        owner: HarnessId,
        dual_channel: bool,
        counter: Arc<InstanceCounter>,
        results: Arc<TestResults>,
    ) -> Self {
        Self {
            owner,
            dual_channel,
            verbose: false,
            counter,
            results,
            records: HashMap::new(),
            retired: HashSet::new(),
            instances: BTreeMap::new(),
            first_instance: None,
            containers: 0,
        }
    }

    /// Logs every acknowledgment at debug level.
    #[must_use]
    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    #[must_use]
    pub fn dual_channel(&self) -> bool {
        self.dual_channel
    }

    /// Forgets the ids closed by a previous test of this harness.
    ///
    /// Late acknowledgments for those ids are then reported as unknown
    /// instances instead of duplicates.
    pub fn begin_test(&mut self) {
        self.retired.clear();
    }

    /// Number of fully closed ids remembered for duplicate detection.
    #[must_use]
    pub fn retired_count(&self) -> usize {
        self.retired.len()
    }

    /// Core channel: the engine finished creating `id`.
    pub fn instance_created(&mut self, id: InstanceId) -> CreateOutcome {
        if self.instances.is_empty() {
            self.first_instance = Some(id);
        }
        self.instances.entry(id).or_insert(InstanceHandle {
            id,
            created_at: Instant::now(),
        });
        self.acknowledge_created(id, Channel::Core)
    }

    /// Core channel: the engine is about to destroy `id`.
    pub fn instance_closing(&mut self, id: InstanceId) -> CloseOutcome {
        if self.retired.contains(&id) {
            self.results.record(TestFailure::DuplicateClosed {
                id,
                channel: Channel::Core,
            });
            return CloseOutcome {
                duplicate: true,
                ..CloseOutcome::default()
            };
        }

        // A repeat core close while the window close is still pending is
        // reported once, as a duplicate, by `acknowledge_closed`.
        let closing = self
            .records
            .get(&id)
            .is_some_and(|record| record.closed(Channel::Core));
        if self.instances.remove(&id).is_none() && !closing {
            self.results.record(TestFailure::UnknownInstance(id));
        }
        if self.first_instance == Some(id) {
            self.first_instance = None;
        }
        self.acknowledge_closed(id, Channel::Core)
    }

    /// Window channel: the container hosting `id` was created.
    pub fn container_created(&mut self, id: InstanceId) -> CreateOutcome {
        if !self.dual_channel {
            self.results.record(TestFailure::WindowingDisabled(id));
            return CreateOutcome::default();
        }
        self.containers += 1;
        self.acknowledge_created(id, Channel::Window)
    }

    /// Window channel: the container hosting `id` was destroyed.
    pub fn container_destroyed(&mut self, id: InstanceId) -> CloseOutcome {
        if !self.dual_channel {
            self.results.record(TestFailure::WindowingDisabled(id));
            return CloseOutcome::default();
        }
        if self.retired.contains(&id) {
            self.results.record(TestFailure::DuplicateClosed {
                id,
                channel: Channel::Window,
            });
            return CloseOutcome {
                duplicate: true,
                ..CloseOutcome::default()
            };
        }
        match self.containers.checked_sub(1) {
            Some(containers) => self.containers = containers,
            None => self.results.record(TestFailure::ContainerUnderflow(id)),
        }
        self.acknowledge_closed(id, Channel::Window)
    }

    fn acknowledge_created(&mut self, id: InstanceId, channel: Channel) -> CreateOutcome {
        let dual_channel = self.dual_channel;
        let record = self.records.entry(id).or_default();

        let duplicate = !record.created.set(channel);
        if duplicate {
            self.results
                .record(TestFailure::DuplicateCreated { id, channel });
        }

        let creation_complete = record.creation_complete(dual_channel);
        if creation_complete && !record.counted {
            record.counted = true;
            self.counter.increment();
        }

        if self.verbose {
            debug!(harness = %self.owner, instance = %id, %channel, creation_complete, "created");
        }

        CreateOutcome {
            creation_complete,
            duplicate,
        }
    }

    fn acknowledge_closed(&mut self, id: InstanceId, channel: Channel) -> CloseOutcome {
        let dual_channel = self.dual_channel;
        let record = self.records.entry(id).or_default();

        let duplicate = !record.closed.set(channel);
        if duplicate {
            self.results
                .record(TestFailure::DuplicateClosed { id, channel });
        }

        let close_complete = record.close_complete(dual_channel);
        let test_complete = close_complete
            && if dual_channel {
                self.containers == 0
            } else {
                self.instances.is_empty()
            };

        if self.verbose {
            debug!(
                harness = %self.owner,
                instance = %id,
                %channel,
                close_complete,
                test_complete,
                "closed"
            );
        }

        if close_complete {
            // Erase first, then uncount: both happen exactly once because the
            // id is retired and later acknowledgments never reach this point.
            let counted = self.records.remove(&id).is_some_and(|record| record.counted);
            self.retired.insert(id);
            if counted {
                self.counter.decrement();
            }
        }

        CloseOutcome {
            close_complete,
            test_complete,
            duplicate,
        }
    }

    /// Acknowledgment state of `id`, if it is still being tracked.
    #[must_use]
    pub fn record(&self, id: InstanceId) -> Option<&InstanceRecord> {
        self.records.get(&id)
    }

    /// Number of instances whose creation or closure is still incomplete.
    #[must_use]
    pub fn open_records(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    #[must_use]
    pub fn container_count(&self) -> usize {
        self.containers
    }

    /// The instance that was created first while no other was live.
    #[must_use]
    pub fn first_instance(&self) -> Option<InstanceId> {
        self.first_instance
    }

    #[must_use]
    pub fn contains(&self, id: InstanceId) -> bool {
        self.instances.contains_key(&id)
    }

    /// Copy of the live instance set, safe to iterate while instances close.
    #[must_use]
    pub fn snapshot(&self) -> Vec<InstanceHandle> {
        self.instances.values().copied().collect()
    }
}
