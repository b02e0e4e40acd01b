//! Resource model
//!
//! A run is described as data: a list of [`ResourceDescriptor`]s whose
//! configuration may embed reference placeholders pointing at other
//! descriptors. Once a resource exists remotely it becomes a
//! [`RealizedResource`], the only thing later descriptors may read from.
//!
//! # Module Structure
//!
//! - [`registry`] - Per-kind schema (required fields, outputs, API routing)
//!   loaded from embedded JSON
//! - [`template`] - The standard six-resource topology
//!
//! # Reference placeholders
//!
//! ```ignore
//! {"$ref": "nic1"}                              // provider id of nic1
//! {"$ref": "vnet1", "attribute": "subnet[0]"}   // named output of vnet1
//! ```

mod registry;
pub mod template;

pub use registry::*;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

/// Key marking a JSON object as a reference placeholder
pub const REF_KEY: &str = "$ref";
/// Optional key selecting a named output of the referenced resource
pub const ATTRIBUTE_KEY: &str = "attribute";

/// Kind of cloud resource a descriptor creates
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ResourceKind {
    ResourceGroup,
    PublicAddress,
    VirtualNetwork,
    SecurityGroup,
    NetworkInterface,
    VirtualMachine,
    /// Any kind declared in a custom schema registry
    Other(String),
}

impl ResourceKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::ResourceGroup => "resourceGroup",
            Self::PublicAddress => "publicAddress",
            Self::VirtualNetwork => "virtualNetwork",
            Self::SecurityGroup => "securityGroup",
            Self::NetworkInterface => "networkInterface",
            Self::VirtualMachine => "virtualMachine",
            Self::Other(kind) => kind,
        }
    }
}

impl From<&str> for ResourceKind {
    fn from(value: &str) -> Self {
        match value {
            "resourceGroup" => Self::ResourceGroup,
            "publicAddress" => Self::PublicAddress,
            "virtualNetwork" => Self::VirtualNetwork,
            "securityGroup" => Self::SecurityGroup,
            "networkInterface" => Self::NetworkInterface,
            "virtualMachine" => Self::VirtualMachine,
            other => Self::Other(other.to_string()),
        }
    }
}

impl From<String> for ResourceKind {
    fn from(value: String) -> Self {
        Self::from(value.as_str())
    }
}

impl From<ResourceKind> for String {
    fn from(value: ResourceKind) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How long the executor waits after submitting a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WaitPolicy {
    /// Return as soon as the provider accepted the request
    Started,
    /// Wait until the resource is fully provisioned
    #[default]
    Completed,
}

/// Named output of a resource, optionally indexed (`subnet[0]`)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AttributePath {
    pub name: String,
    pub index: Option<usize>,
}

impl AttributePath {
    /// Key under which the value is stored in [`RealizedResource::attributes`]
    pub fn key(&self) -> String {
        match self.index {
            Some(index) => format!("{}[{}]", self.name, index),
            None => self.name.clone(),
        }
    }
}

impl FromStr for AttributePath {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let valid_name = |name: &str| {
            !name.is_empty()
                && name
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        };

        let Some(open) = s.find('[') else {
            if valid_name(s) {
                return Ok(Self {
                    name: s.to_string(),
                    index: None,
                });
            }
            return Err(format!("invalid attribute name {:?}", s));
        };

        let name = &s[..open];
        let Some(inner) = s[open + 1..].strip_suffix(']') else {
            return Err(format!("unterminated index in {:?}", s));
        };
        if !valid_name(name) {
            return Err(format!("invalid attribute name {:?}", s));
        }
        let index = inner
            .parse::<usize>()
            .map_err(|_| format!("invalid index in {:?}", s))?;

        Ok(Self {
            name: name.to_string(),
            index: Some(index),
        })
    }
}

impl fmt::Display for AttributePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

/// A placeholder for "the identifier of X" or "attribute A of X"
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    pub target: String,
    pub attribute: Option<String>,
}

impl Reference {
    /// Reference to the provider id of `target`
    pub fn id(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            attribute: None,
        }
    }

    /// Reference to a named output of `target`
    pub fn attribute(target: impl Into<String>, attribute: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            attribute: Some(attribute.into()),
        }
    }

    /// Interpret a JSON value as a placeholder.
    ///
    /// Returns `None` for ordinary values and `Some(Err)` for objects that
    /// carry the `$ref` key but are otherwise malformed.
    pub fn parse(value: &Value) -> Option<Result<Self, String>> {
        let map = value.as_object()?;
        let target = map.get(REF_KEY)?;

        let Some(target) = target.as_str().filter(|t| !t.is_empty()) else {
            return Some(Err(format!("{} must be a non-empty string", REF_KEY)));
        };

        if let Some(extra) = map
            .keys()
            .find(|k| k.as_str() != REF_KEY && k.as_str() != ATTRIBUTE_KEY)
        {
            return Some(Err(format!("unexpected key {:?} in reference to {}", extra, target)));
        }

        let attribute = match map.get(ATTRIBUTE_KEY) {
            None => None,
            Some(Value::String(attr)) => Some(attr.clone()),
            Some(_) => {
                return Some(Err(format!(
                    "{} of reference to {} must be a string",
                    ATTRIBUTE_KEY, target
                )))
            }
        };

        Some(Ok(Self {
            target: target.to_string(),
            attribute,
        }))
    }

    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        map.insert(REF_KEY.to_string(), Value::String(self.target.clone()));
        if let Some(attr) = &self.attribute {
            map.insert(ATTRIBUTE_KEY.to_string(), Value::String(attr.clone()));
        }
        Value::Object(map)
    }
}

impl From<Reference> for Value {
    fn from(value: Reference) -> Self {
        value.to_value()
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.attribute {
            Some(attr) => write!(f, "{}.{}", self.target, attr),
            None => write!(f, "{}", self.target),
        }
    }
}

/// Walk `config` depth-first and collect every placeholder, in document order.
///
/// Malformed placeholders are reported as `Err` entries so callers can decide
/// whether they matter yet.
pub fn collect_references(config: &Value) -> Vec<Result<Reference, String>> {
    let mut found = Vec::new();
    walk_references(config, &mut found);
    found
}

fn walk_references(value: &Value, found: &mut Vec<Result<Reference, String>>) {
    if let Some(reference) = Reference::parse(value) {
        found.push(reference);
        return;
    }

    match value {
        Value::Array(items) => items.iter().for_each(|item| walk_references(item, found)),
        Value::Object(map) => map.values().for_each(|item| walk_references(item, found)),
        _ => {}
    }
}

/// Desired state of a single resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    /// Logical id, unique within a run
    pub id: String,
    pub kind: ResourceKind,
    /// Name of the resource in the remote system
    pub name: String,
    /// Logical id of the resource group this resource lives in
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    /// Request body; may contain reference placeholders
    #[serde(default)]
    pub config: Value,
    /// Ordering dependencies not visible in `config`
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub depends_on: BTreeSet<String>,
    /// Overrides the kind's default wait policy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait: Option<WaitPolicy>,
    /// Overrides the run's per-resource operation timeout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl ResourceDescriptor {
    pub fn new(id: impl Into<String>, kind: ResourceKind, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            name: name.into(),
            scope: None,
            config: Value::Object(Map::new()),
            depends_on: BTreeSet::new(),
            wait: None,
            timeout_secs: None,
        }
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }

    pub fn after(mut self, id: impl Into<String>) -> Self {
        self.depends_on.insert(id.into());
        self
    }

    pub fn with_wait(mut self, wait: WaitPolicy) -> Self {
        self.wait = Some(wait);
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    /// Well-formed placeholders found in `config`
    pub fn references(&self) -> Vec<Reference> {
        collect_references(&self.config)
            .into_iter()
            .filter_map(Result::ok)
            .collect()
    }

    /// Full dependency set: explicit ordering, scope, and every config reference
    pub fn dependencies(&self) -> BTreeSet<String> {
        let mut deps = self.depends_on.clone();
        if let Some(scope) = &self.scope {
            deps.insert(scope.clone());
        }
        deps.extend(self.references().into_iter().map(|r| r.target));
        deps
    }
}

/// A resource that exists remotely, as observed at the end of its operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RealizedResource {
    /// Logical id of the descriptor this came from
    pub id: String,
    pub kind: ResourceKind,
    /// Identifier assigned by the remote system
    pub provider_id: String,
    /// Named outputs other descriptors may reference
    pub attributes: BTreeMap<String, Value>,
}

impl RealizedResource {
    pub fn attribute(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }
}

/// Accepted layouts of a descriptor file
#[derive(Deserialize)]
#[serde(untagged)]
enum DescriptorFile {
    List(Vec<ResourceDescriptor>),
    Document { resources: Vec<ResourceDescriptor> },
}

/// Parse descriptors from YAML (or JSON): either a bare list or a
/// document with a `resources` list.
pub fn parse_descriptors(content: &str) -> Result<Vec<ResourceDescriptor>, serde_yaml::Error> {
    Ok(match serde_yaml::from_str(content)? {
        DescriptorFile::List(resources) | DescriptorFile::Document { resources } => resources,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_kind_round_trips_through_strings() {
        assert_eq!(ResourceKind::from("virtualNetwork"), ResourceKind::VirtualNetwork);
        assert_eq!(
            ResourceKind::from("storageAccount"),
            ResourceKind::Other("storageAccount".into())
        );
        assert_eq!(ResourceKind::NetworkInterface.to_string(), "networkInterface");
    }

    #[test]
    fn test_attribute_path_parsing() {
        let plain: AttributePath = "location".parse().unwrap();
        assert_eq!(plain.index, None);

        let indexed: AttributePath = "subnet[0]".parse().unwrap();
        assert_eq!(indexed.name, "subnet");
        assert_eq!(indexed.index, Some(0));
        assert_eq!(indexed.key(), "subnet[0]");

        assert!("subnet[".parse::<AttributePath>().is_err());
        assert!("subnet[x]".parse::<AttributePath>().is_err());
        assert!("[0]".parse::<AttributePath>().is_err());
        assert!("a.b".parse::<AttributePath>().is_err());
    }

    #[test]
    fn test_reference_parse() {
        assert_eq!(Reference::parse(&json!("plain")), None);
        assert_eq!(Reference::parse(&json!({"id": "x"})), None);
        assert_eq!(
            Reference::parse(&json!({"$ref": "vnet1", "attribute": "subnet[0]"})),
            Some(Ok(Reference::attribute("vnet1", "subnet[0]")))
        );
        assert!(matches!(Reference::parse(&json!({"$ref": 3})), Some(Err(_))));
        assert!(matches!(
            Reference::parse(&json!({"$ref": "a", "extra": true})),
            Some(Err(_))
        ));
    }

    #[test]
    fn test_dependencies_include_scope_refs_and_explicit() {
        let nic = ResourceDescriptor::new("nic1", ResourceKind::NetworkInterface, "nic")
            .with_scope("rg1")
            .after("nsg1")
            .with_config(json!({
                "properties": {
                    "ipConfigurations": [{
                        "properties": {
                            "subnet": {"id": Reference::attribute("vnet1", "subnet[0]").to_value()},
                            "publicIPAddress": {"id": Reference::id("pip1").to_value()}
                        }
                    }]
                }
            }));

        let deps: Vec<_> = nic.dependencies().into_iter().collect();
        assert_eq!(deps, vec!["nsg1", "pip1", "rg1", "vnet1"]);
    }

    #[test]
    fn test_descriptor_deserializes_from_yaml() {
        let yaml = r#"
id: pip1
kind: publicAddress
name: my-ip
scope: rg1
wait: started
config:
  location: {"$ref": rg1, attribute: location}
"#;
        let descriptor: ResourceDescriptor = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(descriptor.kind, ResourceKind::PublicAddress);
        assert_eq!(descriptor.wait, Some(WaitPolicy::Started));
        assert_eq!(descriptor.references(), vec![Reference::attribute("rg1", "location")]);
    }

    #[test]
    fn test_parse_descriptor_documents() {
        let yaml = r#"
resources:
  - id: rg1
    kind: resourceGroup
    name: rg
    config: {location: westeurope}
  - id: nsg1
    kind: securityGroup
    name: nsg
    scope: rg1
    depends_on: [rg1]
"#;
        let descriptors = parse_descriptors(yaml).unwrap();
        assert_eq!(descriptors.len(), 2);
        assert_eq!(descriptors[1].scope.as_deref(), Some("rg1"));

        let json = r#"[{"id": "rg1", "kind": "resourceGroup", "name": "rg"}]"#;
        assert_eq!(parse_descriptors(json).unwrap()[0].config, Value::Null);

        assert!(parse_descriptors("resources: 3").is_err());
    }
}
