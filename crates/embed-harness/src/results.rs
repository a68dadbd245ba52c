//! Test failure recording and the "did this test fail" query.
//!
//! Protocol violations are never turned into control flow. They are pushed
//! into a shared [`TestResults`], logged at error level, and execution
//! continues where it safely can. Teardown then still completes normally,
//! so a cascade of follow-on crashes cannot hide the original failure.

use std::fmt;
use std::time::Duration;

use embed_harness_config::HarnessConfig;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::error;

use crate::engine::InstanceId;
use crate::tracker::Channel;

/// Broad category of a recorded failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// The harness or engine broke a lifecycle contract.
    ProtocolViolation,
    /// A test did not finish within its budget and was configured to fail.
    Timeout,
}

/// A failure observed while a test was running.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TestFailure {
    #[error("duplicate creation acknowledgment for instance {id} on the {channel} channel")]
    DuplicateCreated { id: InstanceId, channel: Channel },

    #[error("duplicate close acknowledgment for instance {id} on the {channel} channel")]
    DuplicateClosed { id: InstanceId, channel: Channel },

    #[error("instance {0} is not tracked by this harness")]
    UnknownInstance(InstanceId),

    #[error("window channel notification for instance {0} while windowing is disabled")]
    WindowingDisabled(InstanceId),

    #[error("completion gate signaled again before the previous release was consumed (total {total})")]
    GateOverSignaled { total: usize },

    #[error("'{operation}' called off the {executor} executor")]
    WrongExecutor {
        operation: &'static str,
        executor: String,
    },

    #[error("destroy_test called on a harness that does not expect it")]
    DestroyNotExpected,

    #[error("destroy_test expected: {expected}, called: {called}")]
    DestroyExpectationMismatch { expected: bool, called: bool },

    #[error("{0} instance(s) still open")]
    InstancesRemaining(usize),

    #[error("{0} container(s) still open")]
    ContainersRemaining(usize),

    #[error("container for instance {0} destroyed while no container was open")]
    ContainerUnderflow(InstanceId),

    #[error("{0} lifecycle record(s) never completed")]
    RecordsRemaining(usize),

    #[error("deferred executor was not torn down before the harness dropped")]
    HelperNotTornDown,

    #[error("deferred executor requested after destroy_test")]
    HelperAfterDestroy,

    #[error("test timed out after {}ms", .0.as_millis())]
    TimedOut(Duration),
}

impl TestFailure {
    /// Returns the category this failure belongs to.
    #[must_use]
    pub fn kind(&self) -> FailureKind {
        match self {
            TestFailure::TimedOut(_) => FailureKind::Timeout,
            _ => FailureKind::ProtocolViolation,
        }
    }
}

/// Which failures the "did this test fail" query looks at.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ResultScope {
    /// Every failure recorded so far, across tests.
    #[default]
    Global,
    /// Only failures recorded since the last [`TestResults::begin_test`].
    CurrentTest,
}

impl ResultScope {
    /// In single-process mode tests share one process, so a previous test's
    /// failure must not taint the current one.
    #[must_use]
    pub fn from_config(config: &HarnessConfig) -> Self {
        if config.single_process {
            ResultScope::CurrentTest
        } else {
            ResultScope::Global
        }
    }
}

/// A failure together with the test that was running when it happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedFailure {
    pub test: Option<String>,
    pub failure: TestFailure,
}

impl fmt::Display for RecordedFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.test {
            Some(test) => write!(f, "[{test}] {}", self.failure),
            None => write!(f, "{}", self.failure),
        }
    }
}

#[derive(Debug, Default)]
struct ResultsInner {
    current_test: Option<String>,
    // Index into `failures` where the current test began.
    current_start: usize,
    failures: Vec<RecordedFailure>,
}

/// Thread-safe failure recorder shared by every harness of a run.
#[derive(Debug, Default)]
pub struct TestResults {
    scope: ResultScope,
    inner: Mutex<ResultsInner>,
}

impl TestResults {
    #[must_use]
    pub fn new(scope: ResultScope) -> Self {
        Self {
            scope,
            inner: Mutex::new(ResultsInner::default()),
        }
    }

    #[must_use]
    pub fn from_config(config: &HarnessConfig) -> Self {
        Self::new(ResultScope::from_config(config))
    }

    #[must_use]
    pub fn scope(&self) -> ResultScope {
        self.scope
    }

    /// Marks the start of a named test.
    pub fn begin_test(&self, name: impl Into<String>) {
        let mut inner = self.inner.lock();
        inner.current_test = Some(name.into());
        inner.current_start = inner.failures.len();
    }

    /// Marks the end of the current test.
    pub fn end_test(&self) {
        let mut inner = self.inner.lock();
        inner.current_test = None;
        inner.current_start = inner.failures.len();
    }

    /// Records a failure against the current test.
    pub fn record(&self, failure: TestFailure) {
        let mut inner = self.inner.lock();
        let test = inner.current_test.clone();
        error!(test = test.as_deref().unwrap_or("<none>"), kind = ?failure.kind(), "{failure}");
        inner.failures.push(RecordedFailure { test, failure });
    }

    /// Returns true if the scope configured for this run saw a failure.
    #[must_use]
    pub fn failed(&self) -> bool {
        let inner = self.inner.lock();
        match self.scope {
            ResultScope::Global => !inner.failures.is_empty(),
            ResultScope::CurrentTest => inner.failures.len() > inner.current_start,
        }
    }

    /// Snapshot of every failure recorded so far.
    #[must_use]
    pub fn failures(&self) -> Vec<RecordedFailure> {
        self.inner.lock().failures.clone()
    }

    /// Snapshot of the failures recorded since the current test began.
    #[must_use]
    pub fn current_failures(&self) -> Vec<TestFailure> {
        let inner = self.inner.lock();
        inner.failures[inner.current_start..]
            .iter()
            .map(|recorded| recorded.failure.clone())
            .collect()
    }

    /// Returns true if a failure matching `predicate` was recorded.
    pub fn any(&self, predicate: impl Fn(&TestFailure) -> bool) -> bool {
        self.inner
            .lock()
            .failures
            .iter()
            .any(|recorded| predicate(&recorded.failure))
    }

    #[must_use]
    pub fn failure_count(&self) -> usize {
        self.inner.lock().failures.len()
    }
}
