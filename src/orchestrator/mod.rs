//! Provisioning orchestration
//!
//! - `schedule`: dependency graph and creation order
//! - `resolve`: reference substitution against realized resources
//! - `executor`: one submission, awaited to a terminal state
//! - `run`: the whole run, with failure cascade and concurrency
//! - `report`: per-resource outcome table

pub mod cancel;
pub mod executor;
pub mod report;
pub mod resolve;
pub mod run;
pub mod schedule;

pub use cancel::CancelSignal;
pub use executor::{ExecutorConfig, OperationExecutor, RetryConfig};
pub use report::{ResourceReport, RunReport, RunStatus};
pub use resolve::{IdentifierTable, MaterializedRequest, ReferenceResolver};
pub use run::{Outcome, ProvisioningRun, RunOptions, SkipReason};
pub use schedule::{order, DependencyGraph};
