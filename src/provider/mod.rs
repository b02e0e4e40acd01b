//! Provider API abstraction
//!
//! The orchestrator talks to the remote resource manager only through
//! [`ResourceApi`]. The same shape is used for every resource kind.
//!
//! # Module Structure
//!
//! - [`memory`] - In-process simulated resource manager (dry runs and tests)
//!
//! The Azure Resource Manager implementation lives in [`crate::azure`].

pub mod memory;

use crate::error::ApiError;
use crate::resource::{KindSchema, ResourceKind};
use async_trait::async_trait;
use serde_json::Value;
use std::fmt;

/// Where a resource lives in the remote system
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceTarget {
    pub kind: ResourceKind,
    /// Provider namespace and type (from the kind schema)
    pub provider: String,
    pub api_version: String,
    /// `None` for resources that are not scoped to a resource group
    pub resource_group: Option<String>,
    pub name: String,
}

impl ResourceTarget {
    pub fn new(kind: ResourceKind, schema: &KindSchema, resource_group: Option<String>, name: &str) -> Self {
        Self {
            kind,
            provider: schema.provider.clone(),
            api_version: schema.api_version.clone(),
            resource_group,
            name: name.to_string(),
        }
    }
}

impl fmt::Display for ResourceTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.resource_group {
            Some(group) => write!(f, "{}/{} in {}", self.provider, self.name, group),
            None => write!(f, "{}/{}", self.provider, self.name),
        }
    }
}

/// Opaque handle of a long-running operation
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OperationHandle {
    /// Provider-specific locator (a status URL for ARM)
    pub locator: String,
    /// Id the resource will have once the operation succeeds
    pub resource_id: String,
    /// Resource the operation was started for
    pub target: ResourceTarget,
}

/// What a create-or-update call returned
#[derive(Debug, Clone, PartialEq)]
pub enum Submission {
    /// The provider finished synchronously; carries the representation
    Completed(Value),
    /// The provider accepted the request and is working on it
    Accepted(OperationHandle),
}

/// Observed state of a long-running operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationStatus {
    Running,
    Succeeded,
    /// Raw diagnostic payload from the provider
    Failed(String),
    Canceled,
}

impl OperationStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// Authenticated resource-manager client
#[async_trait]
pub trait ResourceApi: Send + Sync {
    /// Provider name for logs and reports
    fn name(&self) -> &str;

    /// Read the current representation, `None` if the resource does not exist
    async fn get(&self, target: &ResourceTarget) -> Result<Option<Value>, ApiError>;

    /// Submit a create-or-update request
    async fn create_or_update(&self, target: &ResourceTarget, body: &Value) -> Result<Submission, ApiError>;

    /// Check on a long-running operation
    async fn poll_status(&self, handle: &OperationHandle) -> Result<OperationStatus, ApiError>;

    /// Representation of the resource produced by a succeeded operation
    async fn get_result(&self, handle: &OperationHandle) -> Result<Value, ApiError>;
}

/// Provider id of a representation (`id` field)
pub fn representation_id(representation: &Value) -> Option<&str> {
    representation.get("id").and_then(|v| v.as_str())
}
