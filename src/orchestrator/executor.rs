//! Operation Executor
//!
//! Submits one create-or-update request and waits, within a bound, for the
//! resulting operation to reach a terminal state. Synchronous completions
//! and long-running operations come out the same way: a
//! [`RealizedResource`] or a [`ProvisionError`].

use super::cancel::CancelSignal;
use super::resolve::MaterializedRequest;
use crate::error::{ApiError, FailedState, ProvisionError};
use crate::provider::{representation_id, OperationHandle, OperationStatus, ResourceApi, Submission};
use crate::resource::{RealizedResource, SchemaRegistry, WaitPolicy};
use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Stand-in deadline for timeouts too large to add to the clock
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// Backoff for transient errors while polling an operation
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Consecutive transient failures tolerated before giving up
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (0-based), capped at `max_delay`
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self.backoff_multiplier.powi(attempt as i32);
        let delay = self.initial_delay.as_secs_f64() * factor;
        Duration::from_secs_f64(delay.min(self.max_delay.as_secs_f64()))
    }
}

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub poll_interval: Duration,
    /// Used when a request carries no timeout of its own
    pub default_timeout: Duration,
    pub retry: RetryConfig,
    /// Overwrite existing resources whose configuration differs
    pub allow_update: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(2000),
            default_timeout: Duration::from_secs(30 * 60),
            retry: RetryConfig::default(),
            allow_update: false,
        }
    }
}

/// How an existing resource relates to the desired body
#[derive(Debug, PartialEq)]
enum Existing {
    /// Desired body is already in place
    Matches,
    /// Differs at the given path
    Differs(String),
    /// Exists but is not in a succeeded state; submit again
    Unsettled(String),
}

#[derive(Clone)]
pub struct OperationExecutor {
    api: Arc<dyn ResourceApi>,
    registry: Arc<SchemaRegistry>,
    config: ExecutorConfig,
}

impl OperationExecutor {
    pub fn new(api: Arc<dyn ResourceApi>, registry: Arc<SchemaRegistry>, config: ExecutorConfig) -> Self {
        Self { api, registry, config }
    }

    /// Create or update the resource described by `request` and wait for it
    /// according to its wait policy.
    pub async fn submit_and_await(
        &self,
        request: &MaterializedRequest,
        cancel: &CancelSignal,
    ) -> Result<RealizedResource, ProvisionError> {
        let name = request.target.name.clone();
        if cancel.is_cancelled() {
            return Err(ProvisionError::Cancelled { name });
        }

        let timeout = request.timeout.unwrap_or(self.config.default_timeout);
        let deadline = deadline_after(timeout);

        let existing = bounded(request, self.api.get(&request.target), deadline, timeout, cancel)
            .await?
            .map_err(|e| api_error(&name, e))?;
        if let Some(existing) = existing {
            match compare_existing(&request.body, &existing) {
                Existing::Matches => {
                    tracing::info!("{} already exists with matching configuration", request.target);
                    return self.realize(request, &existing);
                }
                Existing::Differs(diagnostics) if !self.config.allow_update => {
                    tracing::error!("{} exists with different configuration: {}", request.target, diagnostics);
                    return Err(ProvisionError::Conflict { name, diagnostics });
                }
                Existing::Differs(diagnostics) => {
                    tracing::info!("Updating {} in place ({})", request.target, diagnostics);
                }
                Existing::Unsettled(state) => {
                    tracing::info!("{} exists in state {}, submitting again", request.target, state);
                }
            }
        }

        tracing::info!("Submitting {}", request.target);
        let submitted = bounded(
            request,
            self.api.create_or_update(&request.target, &request.body),
            deadline,
            timeout,
            cancel,
        )
        .await?;
        let submission = match submitted {
            Ok(submission) => submission,
            Err(e) if e.is_conflict() => {
                return Err(ProvisionError::Conflict {
                    name,
                    diagnostics: e.body().unwrap_or_default().to_string(),
                })
            }
            Err(e) => return Err(api_error(&name, e)),
        };

        match submission {
            Submission::Completed(representation) => {
                if let Some(state) = failed_state(&representation) {
                    return Err(ProvisionError::Operation {
                        name,
                        state,
                        diagnostics: representation.to_string(),
                    });
                }
                self.realize(request, &representation)
            }
            Submission::Accepted(handle) if request.wait == WaitPolicy::Started => {
                tracing::info!("{} accepted, not waiting for completion", request.target);
                self.realize(request, &accepted_representation(request, &handle))
            }
            Submission::Accepted(handle) => {
                self.await_completion(request, &handle, deadline, timeout, cancel)
                    .await
            }
        }
    }

    async fn await_completion(
        &self,
        request: &MaterializedRequest,
        handle: &OperationHandle,
        deadline: Instant,
        timeout: Duration,
        cancel: &CancelSignal,
    ) -> Result<RealizedResource, ProvisionError> {
        let name = &request.target.name;
        let mut transient_failures = 0u32;
        let mut polls = 0u32;

        loop {
            let delay = match transient_failures {
                0 => self.config.poll_interval,
                n => self.config.retry.delay_for_attempt(n - 1),
            };
            let wake_at = deadline_after(delay).min(deadline);

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::warn!("Stopped waiting for {} after cancellation", request.target);
                    return Err(ProvisionError::Cancelled { name: name.clone() });
                }
                _ = tokio::time::sleep_until(wake_at) => {}
            }

            if Instant::now() >= deadline {
                tracing::error!("{} timed out after {} polls", request.target, polls);
                return Err(ProvisionError::Timeout {
                    name: name.clone(),
                    waited: timeout,
                });
            }

            polls += 1;
            let status = bounded(request, self.api.poll_status(handle), deadline, timeout, cancel).await?;
            match status {
                Ok(OperationStatus::Running) => {
                    transient_failures = 0;
                    tracing::debug!("{} still running (poll {})", request.target, polls);
                }
                Ok(OperationStatus::Succeeded) => {
                    let representation = bounded(request, self.api.get_result(handle), deadline, timeout, cancel)
                        .await?
                        .map_err(|e| api_error(name, e))?;
                    tracing::info!("{} provisioned after {} polls", request.target, polls);
                    return self.realize(request, &representation);
                }
                Ok(OperationStatus::Failed(diagnostics)) => {
                    tracing::error!("{} failed: {}", request.target, diagnostics);
                    return Err(ProvisionError::Operation {
                        name: name.clone(),
                        state: FailedState::Failed,
                        diagnostics,
                    });
                }
                Ok(OperationStatus::Canceled) => {
                    tracing::error!("{} was canceled by the provider", request.target);
                    return Err(ProvisionError::Operation {
                        name: name.clone(),
                        state: FailedState::Canceled,
                        diagnostics: "operation was canceled by the provider".to_string(),
                    });
                }
                Err(e) if e.is_transient() && transient_failures < self.config.retry.max_attempts => {
                    transient_failures += 1;
                    tracing::warn!(
                        "Transient error polling {} (attempt {}/{}): {}",
                        request.target,
                        transient_failures,
                        self.config.retry.max_attempts,
                        e
                    );
                }
                Err(e) => return Err(api_error(name, e)),
            }
        }
    }

    fn realize(&self, request: &MaterializedRequest, representation: &Value) -> Result<RealizedResource, ProvisionError> {
        let provider_id = representation_id(representation).ok_or_else(|| ProvisionError::Api {
            name: request.target.name.clone(),
            source: ApiError::Malformed {
                message: "resource representation has no id".to_string(),
            },
        })?;

        let attributes = match self.registry.get(&request.target.kind) {
            Some(schema) => schema.extract_outputs(provider_id, representation),
            None => {
                return Err(ProvisionError::Internal {
                    message: format!("no schema for kind {}", request.target.kind),
                })
            }
        };

        Ok(RealizedResource {
            id: request.id.clone(),
            kind: request.target.kind.clone(),
            provider_id: provider_id.to_string(),
            attributes,
        })
    }
}

fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout).unwrap_or_else(|| now + FAR_FUTURE)
}

/// Await one remote call, giving up on cancellation or at `deadline`.
///
/// The inner result is the call's own outcome.
async fn bounded<T>(
    request: &MaterializedRequest,
    call: impl Future<Output = Result<T, ApiError>>,
    deadline: Instant,
    timeout: Duration,
    cancel: &CancelSignal,
) -> Result<Result<T, ApiError>, ProvisionError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            tracing::warn!("Abandoned call for {} after cancellation", request.target);
            Err(ProvisionError::Cancelled { name: request.target.name.clone() })
        }
        _ = tokio::time::sleep_until(deadline) => {
            tracing::error!("Call for {} still pending at its deadline", request.target);
            Err(ProvisionError::Timeout { name: request.target.name.clone(), waited: timeout })
        }
        result = call => Ok(result),
    }
}

fn api_error(name: &str, source: ApiError) -> ProvisionError {
    ProvisionError::Api {
        name: name.to_string(),
        source,
    }
}

/// Representation known at acceptance time: the submitted body plus identity
fn accepted_representation(request: &MaterializedRequest, handle: &OperationHandle) -> Value {
    let mut representation = request.body.as_object().cloned().unwrap_or_default();
    representation.insert("id".to_string(), json!(handle.resource_id));
    representation.insert("name".to_string(), json!(request.target.name));
    Value::Object(representation)
}

fn provisioning_state(representation: &Value) -> Option<&str> {
    representation
        .pointer("/properties/provisioningState")
        .and_then(Value::as_str)
}

fn failed_state(representation: &Value) -> Option<FailedState> {
    match provisioning_state(representation) {
        Some(state) if state.eq_ignore_ascii_case("failed") => Some(FailedState::Failed),
        Some(state) if state.eq_ignore_ascii_case("canceled") => Some(FailedState::Canceled),
        _ => None,
    }
}

fn compare_existing(desired: &Value, existing: &Value) -> Existing {
    if let Some(state) = provisioning_state(existing) {
        if !state.eq_ignore_ascii_case("succeeded") {
            return Existing::Unsettled(state.to_string());
        }
    }

    match first_difference(desired, existing, "") {
        Some(difference) => Existing::Differs(difference),
        None => Existing::Matches,
    }
}

/// First place where `desired` is not contained in `actual`.
///
/// Objects match when every desired key matches; the provider is free to
/// return extra fields. Arrays must match element by element.
fn first_difference(desired: &Value, actual: &Value, path: &str) -> Option<String> {
    let at = |key: &str| {
        if path.is_empty() {
            key.to_string()
        } else {
            format!("{}.{}", path, key)
        }
    };

    match (desired, actual) {
        (Value::Object(want), Value::Object(have)) => want.iter().find_map(|(key, value)| match have.get(key) {
            Some(found) => first_difference(value, found, &at(key)),
            None => Some(format!("{}: desired {}, found nothing", at(key), value)),
        }),
        (Value::Array(want), Value::Array(have)) => {
            if want.len() != have.len() {
                return Some(format!(
                    "{}: desired {} item(s), found {}",
                    display_path(path),
                    want.len(),
                    have.len()
                ));
            }
            want.iter()
                .zip(have)
                .enumerate()
                .find_map(|(index, (w, h))| first_difference(w, h, &format!("{}[{}]", path, index)))
        }
        (want, have) if want == have => None,
        (want, have) => Some(format!("{}: desired {}, found {}", display_path(path), want, have)),
    }
}

fn display_path(path: &str) -> &str {
    if path.is_empty() {
        "<root>"
    } else {
        path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::memory::InMemoryProvider;
    use crate::provider::ResourceTarget;
    use crate::resource::ResourceKind;

    fn fast_config() -> ExecutorConfig {
        ExecutorConfig {
            poll_interval: Duration::from_millis(1),
            default_timeout: Duration::from_secs(5),
            retry: RetryConfig {
                max_attempts: 3,
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
                backoff_multiplier: 2.0,
            },
            allow_update: false,
        }
    }

    fn executor(provider: &InMemoryProvider, config: ExecutorConfig) -> OperationExecutor {
        OperationExecutor::new(
            Arc::new(provider.clone()),
            Arc::new(SchemaRegistry::builtin().clone()),
            config,
        )
    }

    fn target(kind: ResourceKind, group: Option<&str>, name: &str) -> ResourceTarget {
        let schema = SchemaRegistry::builtin().get(&kind).unwrap();
        ResourceTarget::new(kind, schema, group.map(str::to_string), name)
    }

    fn vnet_request(prefix: &str) -> MaterializedRequest {
        MaterializedRequest {
            id: "vnet1".into(),
            target: target(ResourceKind::VirtualNetwork, Some("rg"), "myVnet"),
            body: json!({
                "location": "westeurope",
                "properties": {
                    "addressSpace": {"addressPrefixes": [prefix]},
                    "subnets": [{"name": "mySubnet", "properties": {"addressPrefix": "10.0.1.0/24"}}]
                }
            }),
            wait: WaitPolicy::Completed,
            timeout: None,
        }
    }

    fn provider_with_group() -> InMemoryProvider {
        let provider = InMemoryProvider::new().with_polls(2);
        provider.seed(
            &target(ResourceKind::ResourceGroup, None, "rg"),
            &json!({"location": "westeurope"}),
        );
        provider
    }

    #[test]
    fn test_delay_calculation() {
        let retry = RetryConfig {
            max_attempts: 5,
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(10000),
            backoff_multiplier: 2.0,
        };

        assert_eq!(retry.delay_for_attempt(0), Duration::from_millis(1000));
        assert_eq!(retry.delay_for_attempt(1), Duration::from_millis(2000));
        assert_eq!(retry.delay_for_attempt(2), Duration::from_millis(4000));
        assert_eq!(retry.delay_for_attempt(3), Duration::from_millis(8000));
        assert_eq!(retry.delay_for_attempt(4), Duration::from_millis(10000)); // capped at max
    }

    #[test]
    fn test_first_difference_allows_extra_provider_fields() {
        let desired = json!({"location": "westeurope", "properties": {"subnets": [{"name": "a"}]}});
        let actual = json!({
            "id": "/x",
            "location": "westeurope",
            "properties": {"provisioningState": "Succeeded", "subnets": [{"name": "a", "id": "/x/subnets/a"}]}
        });
        assert_eq!(first_difference(&desired, &actual, ""), None);

        let changed = json!({"location": "northeurope"});
        assert_eq!(
            first_difference(&changed, &actual, ""),
            Some("location: desired \"northeurope\", found \"westeurope\"".to_string())
        );
    }

    #[tokio::test]
    async fn test_polls_until_succeeded_and_extracts_outputs() {
        let provider = provider_with_group();
        let realized = executor(&provider, fast_config())
            .submit_and_await(&vnet_request("10.0.0.0/16"), &CancelSignal::new())
            .await
            .unwrap();

        assert!(realized.provider_id.ends_with("/virtualNetworks/myVnet"));
        assert_eq!(
            realized.attribute("subnet[0]"),
            Some(&json!(format!("{}/subnets/mySubnet", realized.provider_id)))
        );
        assert_eq!(
            provider.calls().iter().filter(|c| c.starts_with("POLL")).count(),
            3
        );
    }

    #[tokio::test]
    async fn test_resubmitting_identical_config_is_a_no_op() {
        let provider = provider_with_group();
        let executor = executor(&provider, fast_config());
        let cancel = CancelSignal::new();

        let first = executor.submit_and_await(&vnet_request("10.0.0.0/16"), &cancel).await.unwrap();
        let second = executor.submit_and_await(&vnet_request("10.0.0.0/16"), &cancel).await.unwrap();

        assert_eq!(first.provider_id, second.provider_id);
        assert_eq!(provider.submissions(), vec!["myVnet"]);
    }

    #[tokio::test]
    async fn test_changed_config_on_existing_name_conflicts() {
        let provider = provider_with_group();
        let executor = executor(&provider, fast_config());
        let cancel = CancelSignal::new();

        executor.submit_and_await(&vnet_request("10.0.0.0/16"), &cancel).await.unwrap();
        let err = executor
            .submit_and_await(&vnet_request("10.9.0.0/16"), &cancel)
            .await
            .unwrap_err();

        let ProvisionError::Conflict { diagnostics, .. } = err else {
            panic!("expected a conflict, got {:?}", err);
        };
        assert!(diagnostics.contains("properties.addressSpace.addressPrefixes[0]"));
        assert_eq!(provider.submissions(), vec!["myVnet"]);
    }

    #[tokio::test]
    async fn test_allow_update_overwrites() {
        let provider = provider_with_group();
        let mut config = fast_config();
        config.allow_update = true;
        let executor = executor(&provider, config);
        let cancel = CancelSignal::new();

        executor.submit_and_await(&vnet_request("10.0.0.0/16"), &cancel).await.unwrap();
        executor.submit_and_await(&vnet_request("10.9.0.0/16"), &cancel).await.unwrap();
        assert_eq!(provider.submissions(), vec!["myVnet", "myVnet"]);
    }

    #[tokio::test]
    async fn test_terminal_failure_keeps_full_diagnostics() {
        let diagnostics = format!("{{\"code\":\"InternalError\",\"message\":\"{}\"}}", "y".repeat(2000));
        let provider = provider_with_group().fail("myVnet", &diagnostics);

        let err = executor(&provider, fast_config())
            .submit_and_await(&vnet_request("10.0.0.0/16"), &CancelSignal::new())
            .await
            .unwrap_err();

        assert_eq!(
            err,
            ProvisionError::Operation {
                name: "myVnet".into(),
                state: FailedState::Failed,
                diagnostics
            }
        );
    }

    #[tokio::test]
    async fn test_transient_poll_errors_are_retried() {
        let provider = provider_with_group().flaky_polls("myVnet", 2);
        let realized = executor(&provider, fast_config())
            .submit_and_await(&vnet_request("10.0.0.0/16"), &CancelSignal::new())
            .await;
        assert!(realized.is_ok());
    }

    #[tokio::test]
    async fn test_transient_errors_beyond_budget_fail() {
        let provider = provider_with_group().flaky_polls("myVnet", 10);
        let err = executor(&provider, fast_config())
            .submit_and_await(&vnet_request("10.0.0.0/16"), &CancelSignal::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::Api { source: ApiError::Status { status: 503, .. }, .. }));
    }

    #[tokio::test]
    async fn test_remote_cancellation_is_an_operation_error() {
        let provider = provider_with_group().cancel_remotely("myVnet");
        let err = executor(&provider, fast_config())
            .submit_and_await(&vnet_request("10.0.0.0/16"), &CancelSignal::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::Operation { state: FailedState::Canceled, .. }));
    }

    #[tokio::test]
    async fn test_times_out() {
        let provider = provider_with_group().hang("myVnet");
        let mut request = vnet_request("10.0.0.0/16");
        request.timeout = Some(Duration::from_millis(30));

        let err = executor(&provider, fast_config())
            .submit_and_await(&request, &CancelSignal::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_polling() {
        let provider = provider_with_group().hang("myVnet");
        let cancel = CancelSignal::new();
        let _timer = cancel.cancel_after(Duration::from_millis(20));

        let err = executor(&provider, fast_config())
            .submit_and_await(&vnet_request("10.0.0.0/16"), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err, ProvisionError::Cancelled { name: "myVnet".into() });
    }

    #[tokio::test]
    async fn test_started_policy_returns_on_acceptance() {
        let provider = provider_with_group().hang("myVnet");
        let mut request = vnet_request("10.0.0.0/16");
        request.wait = WaitPolicy::Started;

        let realized = executor(&provider, fast_config())
            .submit_and_await(&request, &CancelSignal::new())
            .await
            .unwrap();
        assert_eq!(realized.attribute("name"), Some(&json!("myVnet")));
        assert!(!provider.calls().iter().any(|c| c.starts_with("POLL")));
    }

    #[tokio::test]
    async fn test_http_conflict_maps_to_conflict_error() {
        let provider = provider_with_group().reject("myVnet", 409, "{\"error\":{\"code\":\"InUseSubnetCannotBeDeleted\"}}");
        let err = executor(&provider, fast_config())
            .submit_and_await(&vnet_request("10.0.0.0/16"), &CancelSignal::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::Conflict { ref diagnostics, .. } if diagnostics.contains("InUseSubnet")));
    }
}
