//! Pull-based job dispatcher for remote runners.
//!
//! This crate provides:
//! - Job storage with atomic conditional transitions
//! - Runner registration and authentication
//! - Claim/update/success/error dispatch with dependency cascades
//! - A watchdog that reclaims jobs from silent runners
//! - In-process dispatch events

pub mod dispatcher;
pub mod error;
pub mod events;
pub mod job;
pub mod metrics;
pub mod registry;
pub mod store;
pub mod watchdog;

pub use dispatcher::{Dispatcher, DispatcherConfig, DEFAULT_MAX_FAILURES, STALLED_MESSAGE};
pub use error::{DispatchError, DispatchResult};
pub use events::{DispatchEvent, EventChannel};
pub use job::EnqueueJob;
pub use registry::{RegistrationTokenSummary, RunnerRegistry};
pub use store::{JobFilter, JobStore, MemoryJobStore, Mutation, Precondition, Transition};
pub use watchdog::{ScanReport, Watchdog, WatchdogConfig};
