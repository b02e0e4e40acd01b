//! In-memory resource manager
//!
//! Behaves like a small Azure Resource Manager: resources live in resource
//! groups, writes return long-running operations that finish after a number
//! of polls, and server-assigned fields (ids, addresses) appear on success.
//! Individual resources can be scripted to fail, hang, or flap.

use super::{OperationHandle, OperationStatus, ResourceApi, ResourceTarget, Submission};
use crate::error::ApiError;
use crate::resource::ResourceKind;
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

const DEFAULT_SUBSCRIPTION: &str = "00000000-0000-0000-0000-000000000000";

/// Scripted behavior for one resource name
#[derive(Debug, Clone, Default)]
struct Script {
    fail: Option<String>,
    cancel: bool,
    hang: bool,
    transient_errors: u32,
    reject: Option<(u16, String)>,
}

#[derive(Debug, Clone)]
struct PendingOp {
    target: ResourceTarget,
    resource_id: String,
    polls_left: u32,
    transient_left: u32,
}

#[derive(Debug, Default)]
struct State {
    resources: HashMap<String, Value>,
    operations: HashMap<String, PendingOp>,
    calls: Vec<String>,
}

/// Simulated provider; clones share state
#[derive(Clone)]
pub struct InMemoryProvider {
    subscription: String,
    polls_to_complete: u32,
    synchronous: HashSet<ResourceKind>,
    scripts: HashMap<String, Script>,
    state: Arc<Mutex<State>>,
}

impl Default for InMemoryProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryProvider {
    pub fn new() -> Self {
        let mut synchronous = HashSet::new();
        synchronous.insert(ResourceKind::ResourceGroup);

        Self {
            subscription: DEFAULT_SUBSCRIPTION.to_string(),
            polls_to_complete: 1,
            synchronous,
            scripts: HashMap::new(),
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    pub fn with_subscription(mut self, subscription: &str) -> Self {
        self.subscription = subscription.to_string();
        self
    }

    /// Number of `Running` polls before an operation reaches its terminal state
    pub fn with_polls(mut self, polls: u32) -> Self {
        self.polls_to_complete = polls;
        self
    }

    /// Resources of `kind` complete inside the create call
    pub fn synchronous(mut self, kind: ResourceKind) -> Self {
        self.synchronous.insert(kind);
        self
    }

    /// Resources of `kind` are always accepted as long-running operations
    pub fn asynchronous(mut self, kind: ResourceKind) -> Self {
        self.synchronous.remove(&kind);
        self
    }

    /// The operation for `name` ends `Failed` with `diagnostics`
    pub fn fail(mut self, name: &str, diagnostics: &str) -> Self {
        self.script(name).fail = Some(diagnostics.to_string());
        self
    }

    /// The operation for `name` is canceled on the remote side
    pub fn cancel_remotely(mut self, name: &str) -> Self {
        self.script(name).cancel = true;
        self
    }

    /// The operation for `name` never leaves `Running`
    pub fn hang(mut self, name: &str) -> Self {
        self.script(name).hang = true;
        self
    }

    /// The first `count` polls for `name` fail with a 503
    pub fn flaky_polls(mut self, name: &str, count: u32) -> Self {
        self.script(name).transient_errors = count;
        self
    }

    /// The create call for `name` is rejected with an HTTP error
    pub fn reject(mut self, name: &str, status: u16, body: &str) -> Self {
        self.script(name).reject = Some((status, body.to_string()));
        self
    }

    /// Put a resource in place as if created out of band
    pub fn seed(&self, target: &ResourceTarget, body: &Value) {
        let id = self.resource_id(target);
        let representation = self.represent(target, &id, body, "Succeeded");
        self.lock().resources.insert(id, representation);
    }

    /// Every call made so far, e.g. `PUT myVnet`
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    /// Names of resources create-or-update was called for, in call order
    pub fn submissions(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| c.strip_prefix("PUT ").map(str::to_string))
            .collect()
    }

    /// Stored representation of a resource
    pub fn resource(&self, target: &ResourceTarget) -> Option<Value> {
        let id = self.resource_id(target);
        self.lock().resources.get(&id).cloned()
    }

    fn script(&mut self, name: &str) -> &mut Script {
        self.scripts.entry(name.to_string()).or_default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // A poisoned lock only means a test panicked mid-call; the map is still usable
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn group_id(&self, group: &str) -> String {
        format!("/subscriptions/{}/resourceGroups/{}", self.subscription, group)
    }

    fn resource_id(&self, target: &ResourceTarget) -> String {
        match &target.resource_group {
            Some(group) => format!(
                "{}/providers/{}/{}",
                self.group_id(group),
                target.provider,
                target.name
            ),
            None => self.group_id(&target.name),
        }
    }

    /// Build what the provider would return for a successfully written resource
    fn represent(&self, target: &ResourceTarget, id: &str, body: &Value, state: &str) -> Value {
        let mut representation = body.as_object().cloned().unwrap_or_default();
        representation.insert("id".to_string(), json!(id));
        representation.insert("name".to_string(), json!(target.name));
        representation.insert("type".to_string(), json!(target.provider));

        let mut properties = representation
            .get("properties")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        properties.insert("provisioningState".to_string(), json!(state));

        // Named child collections (subnets, ipConfigurations, securityRules) get ids
        for (key, value) in properties.iter_mut() {
            let Some(items) = value.as_array_mut() else {
                continue;
            };
            for item in items.iter_mut() {
                let Some(child) = item.as_object_mut() else {
                    continue;
                };
                if let Some(name) = child.get("name").and_then(Value::as_str) {
                    let child_id = format!("{}/{}/{}", id, key, name);
                    child.insert("id".to_string(), json!(child_id));
                }
            }
        }

        assign_server_fields(&target.kind, &mut properties, body);
        representation.insert("properties".to_string(), Value::Object(properties));
        Value::Object(representation)
    }

    fn group_exists(&self, state: &State, target: &ResourceTarget) -> bool {
        match &target.resource_group {
            Some(group) => state.resources.contains_key(&self.group_id(group)),
            None => true,
        }
    }
}

fn assign_server_fields(kind: &ResourceKind, properties: &mut Map<String, Value>, body: &Value) {
    match kind {
        ResourceKind::PublicAddress => {
            let label = body
                .pointer("/properties/dnsSettings/domainNameLabel")
                .and_then(Value::as_str);
            let location = body.get("location").and_then(Value::as_str).unwrap_or("local");
            if let (Some(label), Some(Value::Object(dns))) = (label, properties.get_mut("dnsSettings")) {
                dns.insert(
                    "fqdn".to_string(),
                    json!(format!("{}.{}.cloudapp.azure.com", label, location)),
                );
            }
            properties.insert("ipAddress".to_string(), json!("20.61.0.157"));
        }
        ResourceKind::NetworkInterface => {
            properties.insert("macAddress".to_string(), json!("00-0D-3A-2B-4C-5D"));
            if let Some(Value::Array(configs)) = properties.get_mut("ipConfigurations") {
                for (index, config) in configs.iter_mut().enumerate() {
                    if let Some(Value::Object(props)) = config.get_mut("properties") {
                        props.insert(
                            "privateIPAddress".to_string(),
                            json!(format!("10.0.1.{}", index + 4)),
                        );
                    }
                }
            }
        }
        ResourceKind::VirtualMachine => {
            properties.insert("vmId".to_string(), json!(Uuid::new_v4().to_string()));
        }
        _ => {}
    }
}

fn not_found(code: &str, message: &str) -> ApiError {
    ApiError::Status {
        status: 404,
        body: json!({ "error": { "code": code, "message": message } }).to_string(),
    }
}

#[async_trait]
impl ResourceApi for InMemoryProvider {
    fn name(&self) -> &str {
        "in-memory"
    }

    async fn get(&self, target: &ResourceTarget) -> Result<Option<Value>, ApiError> {
        let id = self.resource_id(target);
        let mut state = self.lock();
        state.calls.push(format!("GET {}", target.name));
        Ok(state.resources.get(&id).cloned())
    }

    async fn create_or_update(&self, target: &ResourceTarget, body: &Value) -> Result<Submission, ApiError> {
        let script = self.scripts.get(&target.name).cloned().unwrap_or_default();
        let id = self.resource_id(target);
        let mut state = self.lock();
        state.calls.push(format!("PUT {}", target.name));

        if let Some((status, body)) = script.reject {
            return Err(ApiError::Status { status, body });
        }

        if !self.group_exists(&state, target) {
            let group = target.resource_group.as_deref().unwrap_or_default();
            return Err(not_found(
                "ResourceGroupNotFound",
                &format!("Resource group '{}' could not be found.", group),
            ));
        }

        if self.synchronous.contains(&target.kind) && script.fail.is_none() && !script.hang && !script.cancel {
            let representation = self.represent(target, &id, body, "Succeeded");
            state.resources.insert(id, representation.clone());
            return Ok(Submission::Completed(representation));
        }

        let representation = self.represent(target, &id, body, "Creating");
        state.resources.insert(id.clone(), representation);

        let locator = format!("operations/{}", Uuid::new_v4());
        state.operations.insert(
            locator.clone(),
            PendingOp {
                target: target.clone(),
                resource_id: id.clone(),
                polls_left: self.polls_to_complete,
                transient_left: script.transient_errors,
            },
        );

        Ok(Submission::Accepted(OperationHandle {
            locator,
            resource_id: id,
            target: target.clone(),
        }))
    }

    async fn poll_status(&self, handle: &OperationHandle) -> Result<OperationStatus, ApiError> {
        let mut state = self.lock();
        state.calls.push(format!("POLL {}", handle.target.name));

        let Some(op) = state.operations.get_mut(&handle.locator) else {
            return Err(ApiError::UnknownOperation {
                handle: handle.locator.clone(),
            });
        };

        if op.transient_left > 0 {
            op.transient_left -= 1;
            return Err(ApiError::Status {
                status: 503,
                body: "Service Unavailable".to_string(),
            });
        }

        let script = self.scripts.get(&op.target.name).cloned().unwrap_or_default();
        if script.hang {
            return Ok(OperationStatus::Running);
        }
        if op.polls_left > 0 {
            op.polls_left -= 1;
            return Ok(OperationStatus::Running);
        }

        let resource_id = op.resource_id.clone();
        let (status, provisioning_state) = if let Some(diagnostics) = script.fail {
            (OperationStatus::Failed(diagnostics), "Failed")
        } else if script.cancel {
            (OperationStatus::Canceled, "Canceled")
        } else {
            (OperationStatus::Succeeded, "Succeeded")
        };

        if let Some(Value::Object(props)) = state
            .resources
            .get_mut(&resource_id)
            .and_then(|r| r.get_mut("properties"))
        {
            props.insert("provisioningState".to_string(), json!(provisioning_state));
        }

        Ok(status)
    }

    async fn get_result(&self, handle: &OperationHandle) -> Result<Value, ApiError> {
        let mut state = self.lock();
        state.calls.push(format!("GET {}", handle.target.name));
        state
            .resources
            .get(&handle.resource_id)
            .cloned()
            .ok_or_else(|| not_found("ResourceNotFound", &handle.resource_id))
    }
}
