//! Azure Resource Manager client
//!
//! Implements [`ResourceApi`] over the ARM REST surface: `PUT` to create or
//! update, `GET` to read, and the `Azure-AsyncOperation` / `Location`
//! headers for long-running operations.

use super::auth::AzureCredentials;
use super::http::{ArmHttpClient, ArmResponse};
use crate::error::ApiError;
use crate::provider::{representation_id, OperationHandle, OperationStatus, ResourceApi, ResourceTarget, Submission};
use anyhow::Context;
use async_trait::async_trait;
use serde_json::Value;
use url::Url;

pub const DEFAULT_ENDPOINT: &str = "https://management.azure.com";

const ASYNC_OPERATION_HEADER: &str = "azure-asyncoperation";
const LOCATION_HEADER: &str = "location";

/// Main ARM client
#[derive(Clone)]
pub struct ArmClient {
    credentials: AzureCredentials,
    http: ArmHttpClient,
    endpoint: Url,
    subscription_id: String,
}

impl ArmClient {
    pub fn new(credentials: AzureCredentials, subscription_id: &str, endpoint: &str) -> anyhow::Result<Self> {
        let endpoint = Url::parse(endpoint).with_context(|| format!("Invalid ARM endpoint: {}", endpoint))?;
        let http = ArmHttpClient::new().context("Failed to create HTTP client")?;

        Ok(Self {
            credentials,
            http,
            endpoint,
            subscription_id: subscription_id.to_string(),
        })
    }

    async fn token(&self) -> Result<String, ApiError> {
        self.credentials
            .get_token()
            .await
            .map_err(|e| ApiError::Transport {
                message: format!("authentication failed: {:#}", e),
            })
    }

    /// ARM id of the resource `target` names
    pub fn resource_path(&self, target: &ResourceTarget) -> String {
        let group_path = |group: &str| {
            format!(
                "/subscriptions/{}/resourceGroups/{}",
                urlencoding::encode(&self.subscription_id),
                urlencoding::encode(group)
            )
        };

        match &target.resource_group {
            Some(group) => format!(
                "{}/providers/{}/{}",
                group_path(group),
                target.provider,
                urlencoding::encode(&target.name)
            ),
            None => group_path(&target.name),
        }
    }

    /// Full URL of `target`, including its `api-version`
    pub fn resource_url(&self, target: &ResourceTarget) -> Result<Url, ApiError> {
        let mut url = self
            .endpoint
            .join(&self.resource_path(target))
            .map_err(|e| ApiError::Malformed {
                message: format!("cannot build URL for {}: {}", target, e),
            })?;
        url.query_pairs_mut().append_pair("api-version", &target.api_version);
        Ok(url)
    }

    async fn read(&self, target: &ResourceTarget) -> Result<Option<Value>, ApiError> {
        let url = self.resource_url(target)?;
        let token = self.token().await?;
        let response = self.http.get(url.as_str(), &token).await?;

        if response.status == 404 {
            return Ok(None);
        }
        response.into_json().map(Some)
    }
}

/// Locator of the long-running operation a write response started, if any
fn operation_locator(response: &ArmResponse) -> Option<String> {
    response
        .header(ASYNC_OPERATION_HEADER)
        .or_else(|| response.header(LOCATION_HEADER))
        .map(str::to_string)
}

fn provisioning_state(representation: &Value) -> Option<&str> {
    representation
        .pointer("/properties/provisioningState")
        .and_then(Value::as_str)
}

fn is_terminal_state(state: &str) -> bool {
    ["succeeded", "failed", "canceled"].contains(&state.to_ascii_lowercase().as_str())
}

/// Interpret an operation status response.
///
/// `Azure-AsyncOperation` monitors answer `{"status": ..., "error": ...}`;
/// `Location` monitors answer 202 while running and 200/201/204 when done.
/// Resources polled directly report `properties.provisioningState`.
fn operation_status(response: ArmResponse) -> Result<OperationStatus, ApiError> {
    if response.status == 202 {
        return Ok(OperationStatus::Running);
    }

    let body = response.into_json()?;
    let Some(status) = body.get("status").and_then(Value::as_str) else {
        return Ok(match provisioning_state(&body) {
            None => OperationStatus::Succeeded,
            Some(state) => match state.to_ascii_lowercase().as_str() {
                "succeeded" => OperationStatus::Succeeded,
                "failed" => OperationStatus::Failed(body.to_string()),
                "canceled" | "cancelled" => OperationStatus::Canceled,
                _ => OperationStatus::Running,
            },
        });
    };

    Ok(match status.to_ascii_lowercase().as_str() {
        "succeeded" => OperationStatus::Succeeded,
        "failed" => OperationStatus::Failed(
            body.get("error")
                .map(Value::to_string)
                .unwrap_or_else(|| body.to_string()),
        ),
        "canceled" | "cancelled" => OperationStatus::Canceled,
        _ => OperationStatus::Running,
    })
}

#[async_trait]
impl ResourceApi for ArmClient {
    fn name(&self) -> &str {
        "azure"
    }

    async fn get(&self, target: &ResourceTarget) -> Result<Option<Value>, ApiError> {
        self.read(target).await
    }

    async fn create_or_update(&self, target: &ResourceTarget, body: &Value) -> Result<Submission, ApiError> {
        let url = self.resource_url(target)?;
        let token = self.token().await?;
        let response = self.http.put(url.as_str(), &token, body).await?;

        let status = response.status;
        let locator = operation_locator(&response);
        let representation = response.into_json()?;

        let settled = provisioning_state(&representation).map_or(true, is_terminal_state);
        let locator = match locator {
            Some(locator) if status == 202 || !settled => locator,
            None if status == 202 => {
                return Err(ApiError::Malformed {
                    message: format!("202 Accepted for {} without an operation header", target),
                })
            }
            // Still provisioning with nothing to monitor: watch the resource itself
            None if !settled => url.to_string(),
            _ => return Ok(Submission::Completed(representation)),
        };

        let resource_id = representation_id(&representation)
            .map(str::to_string)
            .unwrap_or_else(|| self.resource_path(target));
        tracing::info!("{} accepted, operation {}", target, locator);
        Ok(Submission::Accepted(OperationHandle {
            locator,
            resource_id,
            target: target.clone(),
        }))
    }

    async fn poll_status(&self, handle: &OperationHandle) -> Result<OperationStatus, ApiError> {
        let token = self.token().await?;
        let response = self.http.get(&handle.locator, &token).await?;
        operation_status(response)
    }

    async fn get_result(&self, handle: &OperationHandle) -> Result<Value, ApiError> {
        self.read(&handle.target).await?.ok_or_else(|| ApiError::Malformed {
            message: format!("{} not found after its operation succeeded", handle.target),
        })
    }
}
