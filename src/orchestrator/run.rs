//! Provisioning Run
//!
//! Walks the creation order, resolves each descriptor against the
//! identifier table, and hands it to the executor. Resources whose
//! dependencies have all succeeded are started as independent tasks, up to
//! `max_concurrency` at a time; the driver alone records their results.
//!
//! ```text
//! Pending ──► Succeeded
//!    │   └──► Failed ──► (dependents) Skipped
//!    └──────────────────► Skipped (ancestor failed, or run cancelled)
//! ```

use super::cancel::CancelSignal;
use super::executor::{ExecutorConfig, OperationExecutor};
use super::report::{ResourceReport, RunReport};
use super::resolve::{IdentifierTable, ReferenceResolver};
use super::schedule::DependencyGraph;
use crate::error::{ProvisionError, RunError};
use crate::provider::ResourceApi;
use crate::resource::{RealizedResource, ResourceDescriptor, SchemaRegistry};
use chrono::Utc;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tracing::Instrument;
use uuid::Uuid;

/// Why a descriptor was never submitted
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// The named ancestor failed
    AncestorFailed(String),
    /// The run was cancelled before this descriptor started
    Cancelled,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AncestorFailed(id) => write!(f, "dependency {} failed", id),
            Self::Cancelled => f.write_str("run cancelled before start"),
        }
    }
}

/// Per-descriptor state within a run
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Pending,
    Succeeded(RealizedResource),
    Failed(ProvisionError),
    Skipped(SkipReason),
}

impl Outcome {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Succeeded(_) => "succeeded",
            Self::Failed(_) => "failed",
            Self::Skipped(_) => "skipped",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Upper bound on resources in flight at once; 1 means strictly sequential
    pub max_concurrency: usize,
    /// Cancel the whole run after this long
    pub run_timeout: Option<Duration>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            run_timeout: None,
        }
    }
}

type TaskResult = (usize, Result<RealizedResource, ProvisionError>);

pub struct ProvisioningRun {
    provider: String,
    registry: Arc<SchemaRegistry>,
    executor: OperationExecutor,
    options: RunOptions,
}

impl ProvisioningRun {
    pub fn new(
        api: Arc<dyn ResourceApi>,
        registry: Arc<SchemaRegistry>,
        executor_config: ExecutorConfig,
        options: RunOptions,
    ) -> Self {
        Self {
            provider: api.name().to_string(),
            executor: OperationExecutor::new(api, Arc::clone(&registry), executor_config),
            registry,
            options,
        }
    }

    /// Provision every descriptor.
    ///
    /// # Errors
    ///
    /// Returns an error, before anything is submitted, when the descriptors
    /// do not form a valid dependency graph. Per-resource failures are
    /// reported in the returned [`RunReport`].
    pub async fn execute(
        &self,
        descriptors: &[ResourceDescriptor],
        cancel: &CancelSignal,
    ) -> Result<RunReport, RunError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();

        let graph = DependencyGraph::build(descriptors)?;
        let order = graph.topological_order()?;
        let resolver = ReferenceResolver::new(&self.registry, descriptors);

        tracing::info!(
            "Run {}: provisioning {} resources via {}",
            run_id,
            descriptors.len(),
            self.provider
        );

        let mut outcomes = vec![Outcome::Pending; descriptors.len()];
        let mut launched_at: Vec<Option<Instant>> = vec![None; descriptors.len()];
        let mut elapsed: Vec<Option<Duration>> = vec![None; descriptors.len()];
        let mut table = IdentifierTable::new();
        let mut in_flight: JoinSet<TaskResult> = JoinSet::new();
        let max_concurrency = self.options.max_concurrency.max(1);
        let timer = self.options.run_timeout.map(|t| cancel.cancel_after(t));

        loop {
            if !cancel.is_cancelled() {
                for &node in &order {
                    if launched_at[node].is_some() || outcomes[node].is_terminal() {
                        continue;
                    }

                    let descriptor = &descriptors[node];
                    if let Some(reason) = blocked_by(&graph, &outcomes, node) {
                        tracing::warn!("Skipping {}: {}", descriptor.id, reason);
                        outcomes[node] = Outcome::Skipped(reason);
                        continue;
                    }

                    let ready = graph
                        .dependencies(node)
                        .iter()
                        .all(|&dep| matches!(outcomes[dep], Outcome::Succeeded(_)));
                    if !ready || in_flight.len() >= max_concurrency {
                        continue;
                    }

                    let request = match resolver.resolve(descriptor, &table) {
                        Ok(request) => request,
                        Err(e) => {
                            tracing::error!("Cannot submit {}: {}", descriptor.id, e);
                            outcomes[node] = Outcome::Failed(e.into());
                            continue;
                        }
                    };

                    let executor = self.executor.clone();
                    let task_cancel = cancel.clone();
                    let span = tracing::info_span!("provision", id = %descriptor.id, kind = %descriptor.kind);
                    launched_at[node] = Some(Instant::now());
                    in_flight.spawn(
                        async move {
                            let result = executor.submit_and_await(&request, &task_cancel).await;
                            (node, result)
                        }
                        .instrument(span),
                    );
                }
            }

            let joined = if cancel.is_cancelled() {
                in_flight.join_next().await
            } else {
                tokio::select! {
                    joined = in_flight.join_next() => joined,
                    _ = cancel.cancelled() => {
                        tracing::warn!("Run {} cancelled, no further submissions", run_id);
                        continue;
                    }
                }
            };

            let Some(joined) = joined else {
                break;
            };

            match joined {
                Ok((node, result)) => {
                    elapsed[node] = launched_at[node].map(|t| t.elapsed());
                    outcomes[node] = self.record(&descriptors[node], result, &mut table);
                }
                Err(e) => {
                    // The node is recovered from `launched_at` after the loop
                    tracing::error!("Provisioning task ended abnormally: {}", e);
                }
            }
        }

        if let Some(timer) = timer {
            timer.abort();
        }

        for &node in &order {
            if outcomes[node].is_terminal() {
                continue;
            }
            outcomes[node] = if launched_at[node].is_some() {
                Outcome::Failed(ProvisionError::Internal {
                    message: format!("provisioning task for {} ended without a result", descriptors[node].id),
                })
            } else {
                Outcome::Skipped(blocked_by(&graph, &outcomes, node).unwrap_or(SkipReason::Cancelled))
            };
        }

        let resources = order
            .iter()
            .map(|&node| ResourceReport {
                id: descriptors[node].id.clone(),
                kind: descriptors[node].kind.clone(),
                name: descriptors[node].name.clone(),
                outcome: outcomes[node].clone(),
                elapsed: elapsed[node],
            })
            .collect();

        let report = RunReport::new(
            run_id,
            self.provider.clone(),
            started_at,
            Utc::now(),
            cancel.is_cancelled(),
            resources,
        );

        tracing::info!(
            "Run {} finished: {} succeeded, {} failed, {} skipped",
            run_id,
            report.succeeded().count(),
            report.failed().count(),
            report.skipped().count()
        );

        Ok(report)
    }

    fn record(
        &self,
        descriptor: &ResourceDescriptor,
        result: Result<RealizedResource, ProvisionError>,
        table: &mut IdentifierTable,
    ) -> Outcome {
        match result {
            Ok(realized) => {
                tracing::info!("{} succeeded: {}", descriptor.id, realized.provider_id);
                if table.record(realized.clone()) {
                    Outcome::Succeeded(realized)
                } else {
                    Outcome::Failed(ProvisionError::Internal {
                        message: format!("{} was realized twice", descriptor.id),
                    })
                }
            }
            Err(e) => {
                tracing::error!("{} failed: {}", descriptor.id, e);
                Outcome::Failed(e)
            }
        }
    }
}

/// First reason `node` can no longer run, judged from its direct
/// dependencies. Skip reasons carry the root failure downstream.
fn blocked_by(graph: &DependencyGraph, outcomes: &[Outcome], node: usize) -> Option<SkipReason> {
    graph
        .dependencies(node)
        .iter()
        .find_map(|&dep| match &outcomes[dep] {
            Outcome::Failed(ProvisionError::Cancelled { .. }) => Some(SkipReason::Cancelled),
            Outcome::Failed(_) => Some(SkipReason::AncestorFailed(graph.id(dep).to_string())),
            Outcome::Skipped(reason) => Some(reason.clone()),
            Outcome::Pending | Outcome::Succeeded(_) => None,
        })
}
