//! Dependency-ordered provisioning of Azure resources
//!
//! Descriptors declare the desired resources and reference each other's
//! provider-assigned identifiers through placeholders. A
//! [`ProvisioningRun`](orchestrator::ProvisioningRun) orders them, resolves
//! each one against what has already been created, submits it through a
//! [`ResourceApi`](provider::ResourceApi), and waits for the remote
//! operation to finish.
//!
//! # Module Structure
//!
//! - [`resource`] - Descriptors, references and the kind schema registry
//! - [`orchestrator`] - Scheduling, resolution, execution and reporting
//! - [`provider`] - The resource-manager capability and an in-memory implementation
//! - [`azure`] - Azure Resource Manager implementation
//! - [`config`] - Persisted user configuration
//! - [`error`] - Error types per layer

pub mod azure;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod provider;
pub mod resource;
