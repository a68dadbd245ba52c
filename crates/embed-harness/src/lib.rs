//! # embed-harness
//!
//! Test orchestration for an embedded, multi-threaded browser engine.
//!
//! The engine owns its browser instances and reports their lifecycle from
//! its own threads. This crate turns those notifications into something a
//! test can wait on: a test body asks for instances, the harness tracks
//! every creation and close acknowledgment, and the test thread blocks until
//! the harness declares the test complete.
//!
//! ## Architecture
//!
//! - **CompletionGate**: counting latch the test thread blocks on
//! - **DeferredExecutor**: posts (delayed) tasks that become no-ops after teardown
//! - **LifecycleTracker**: single- or dual-channel acknowledgment state machine
//! - **Harness**: per-test façade the engine reports to
//! - **InstanceGroup**: runs several harnesses against one shared gate
//! - **ResourceResolver**: in-memory URL table served on the I/O executor
//!
//! ## Threads
//!
//! Two named executors exist per run: `ui`, where all lifecycle state is
//! mutated, and `io`, where resource requests are answered. Anything the
//! engine or a test calls from another thread is re-posted to the right
//! executor. Only the test thread ever blocks.
//!
//! ## Failures
//!
//! Operational problems come back as [`HarnessError`]. Protocol violations
//! seen while a test runs are recorded in [`TestResults`] and the test
//! carries on, so one run reports every problem it hit.
//!
//! ## Example Usage
//!
//! ```ignore
//! use embed_harness::{Executors, Harness, HarnessConfig, HarnessContext, InstanceRequest};
//!
//! let executors = Executors::spawn()?;
//! let ctx = HarnessContext::with_executors(HarnessConfig::load(None)?, engine, &executors);
//! let harness = Harness::new(ctx);
//!
//! harness.add_resource("http://tests/page", "<html></html>", "text/html", Default::default());
//! harness.execute(&|h: &std::sync::Arc<Harness>| {
//!     h.set_test_timeout(std::time::Duration::from_secs(5), true);
//!     h.create_instance(InstanceRequest::new("http://tests/page")).unwrap();
//! })?;
//!
//! assert!(!harness.test_failed());
//! executors.shutdown();
//! ```

pub mod deferred;
pub mod engine;
pub mod error;
pub mod event;
pub mod executor;
pub mod gate;
pub mod group;
pub mod harness;
pub mod logging;
pub mod resources;
pub mod results;
pub mod tracker;
pub mod windowing;

pub use deferred::DeferredExecutor;
pub use engine::{ContainerId, Engine, InstanceClient, InstanceId, InstanceRequest, InstanceView};
pub use error::{EngineError, HarnessError, Result};
pub use event::ManualResetEvent;
pub use executor::{AffineExecutor, Executors, Task, ThreadExecutor, run_on};
pub use gate::CompletionGate;
pub use group::InstanceGroup;
pub use harness::{Harness, HarnessContext, HarnessId, TestBody};
pub use resources::{HeaderMap, ResourceContent, ResourceResolver, ResourceResponse, normalize_url};
pub use results::{FailureKind, RecordedFailure, ResultScope, TestFailure, TestResults};
pub use tracker::{Channel, CloseOutcome, CreateOutcome, InstanceCounter, InstanceHandle, InstanceRecord, LifecycleTracker};
pub use windowing::{ContainerDelegate, HarnessViewDelegate, WindowDelegate};

pub use embed_harness_config::{ConfigError, HarnessConfig, LogSettings};
