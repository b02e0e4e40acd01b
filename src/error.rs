//! Error taxonomy
//!
//! Graph-level errors abort a run before anything is submitted. Everything
//! else is scoped to a single resource and ends up in the outcome table.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Problems with the descriptor set as a whole.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("duplicate logical id: {id}")]
    DuplicateId { id: String },
    #[error("resource {id} depends on itself")]
    SelfDependency { id: String },
    #[error("dependency graph has missing nodes:\n  - {details}")]
    MissingNodes { details: String },
    #[error("dependency cycle detected among: {}", .cycle.join(" -> "))]
    Cycle { cycle: Vec<String> },
}

/// Failure to turn a descriptor into a submittable request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("{resource}: unknown resource kind {kind}")]
    UnknownKind { resource: String, kind: String },
    #[error("{resource}: reference to {target} is not realized yet")]
    UnresolvedReference { resource: String, target: String },
    #[error("{resource}: {target} ({kind}) has no output attribute {attribute}")]
    MalformedAttributePath {
        resource: String,
        target: String,
        kind: String,
        attribute: String,
    },
    #[error("{resource}: malformed reference placeholder: {detail}")]
    MalformedReference { resource: String, detail: String },
    #[error("{resource}: attribute {attribute} of {target} is missing from the realized resource")]
    MissingAttribute {
        resource: String,
        target: String,
        attribute: String,
    },
    #[error("{resource}: missing required field(s): {}", .fields.join(", "))]
    MissingFields { resource: String, fields: Vec<String> },
    #[error("{resource}: unexpected field(s): {}", .fields.join(", "))]
    UnexpectedFields { resource: String, fields: Vec<String> },
    #[error("{resource}: {detail}")]
    InvalidScope { resource: String, detail: String },
}

/// Errors raised by a [`crate::provider::ResourceApi`] implementation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    #[error("request failed: {message}")]
    Transport { message: String },
    #[error("API request failed: {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed response: {message}")]
    Malformed { message: String },
    #[error("unknown operation handle: {handle}")]
    UnknownOperation { handle: String },
}

impl ApiError {
    /// Whether retrying the same call might succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport { .. } => true,
            Self::Status { status, .. } => matches!(status, 408 | 429 | 500..=599),
            Self::Malformed { .. } | Self::UnknownOperation { .. } => false,
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Status { status: 409, .. })
    }

    /// Response body of a status error
    pub fn body(&self) -> Option<&str> {
        match self {
            Self::Status { body, .. } => Some(body),
            _ => None,
        }
    }
}

/// Terminal states a remote operation can end in other than success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailedState {
    Failed,
    Canceled,
}

impl fmt::Display for FailedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed => f.write_str("Failed"),
            Self::Canceled => f.write_str("Canceled"),
        }
    }
}

/// Failure of one resource.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProvisionError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error("{name} already exists with a different configuration: {diagnostics}")]
    Conflict { name: String, diagnostics: String },
    #[error("operation for {name} ended {state}: {diagnostics}")]
    Operation {
        name: String,
        state: FailedState,
        diagnostics: String,
    },
    #[error("{name} did not reach a terminal state within {}s", .waited.as_secs())]
    Timeout { name: String, waited: Duration },
    #[error("{name}: cancelled before completion")]
    Cancelled { name: String },
    #[error("{name}: {source}")]
    Api {
        name: String,
        #[source]
        source: ApiError,
    },
    #[error("{message}")]
    Internal { message: String },
}

impl ProvisionError {
    /// Provider diagnostic payload, if the failure carried one.
    pub fn diagnostics(&self) -> Option<&str> {
        match self {
            Self::Conflict { diagnostics, .. } | Self::Operation { diagnostics, .. } => {
                Some(diagnostics)
            }
            Self::Api {
                source: ApiError::Status { body, .. },
                ..
            } => Some(body),
            _ => None,
        }
    }

    /// Short machine-friendly category used in reports.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Resolve(ResolveError::UnresolvedReference { .. }) => "unresolved-reference",
            Self::Resolve(ResolveError::MalformedAttributePath { .. }) => "malformed-attribute-path",
            Self::Resolve(_) => "invalid-descriptor",
            Self::Conflict { .. } => "conflict",
            Self::Operation { .. } => "operation",
            Self::Timeout { .. } => "timeout",
            Self::Cancelled { .. } => "cancelled",
            Self::Api { .. } => "api",
            Self::Internal { .. } => "internal",
        }
    }
}

/// Errors that abort a run before any resource is submitted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RunError {
    #[error(transparent)]
    Graph(#[from] GraphError),
}
