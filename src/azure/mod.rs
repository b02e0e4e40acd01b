//! Azure Resource Manager interaction module
//!
//! # Module Structure
//!
//! - [`auth`] - Bearer tokens from the environment, a service principal, or the Azure CLI
//! - [`client`] - [`ArmClient`](client::ArmClient), the [`ResourceApi`](crate::provider::ResourceApi) for ARM
//! - [`http`] - HTTP utilities for REST calls
//!
//! # Example
//!
//! ```ignore
//! use azprov::azure::{auth::AzureCredentials, client::ArmClient};
//!
//! let credentials = AzureCredentials::from_env();
//! let client = ArmClient::new(credentials, &subscription, client::DEFAULT_ENDPOINT)?;
//! ```

pub mod auth;
pub mod client;
pub mod http;
