//! Resource Registry - Load kind schemas from JSON
//!
//! Each resource kind declares how it is routed to the provider API, which
//! configuration fields it needs, and which named outputs a realized
//! instance exposes to other descriptors.

use super::{AttributePath, ResourceKind, WaitPolicy};
use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::OnceLock;

/// Embedded schema files (compiled into the binary)
const SCHEMA_FILES: &[&str] = &[include_str!("../resources/azure.json")];

/// Attribute name every realized resource exposes
pub const ID_ATTRIBUTE: &str = "id";

/// Output definition from JSON
#[derive(Debug, Clone, Deserialize)]
pub struct OutputDef {
    pub name: String,
    /// Dot path into the provider representation (numeric parts index arrays)
    pub path: String,
    /// The path points at an array; one value per element, addressed as `name[i]`
    #[serde(default)]
    pub indexed: bool,
    /// Field read from each element of an indexed output
    #[serde(default)]
    pub field: Option<String>,
}

/// Schema of one resource kind
#[derive(Debug, Clone, Deserialize)]
pub struct KindSchema {
    pub display_name: String,
    /// Provider namespace and type, e.g. `Microsoft.Network/virtualNetworks`
    pub provider: String,
    pub api_version: String,
    /// Lives inside a resource group
    #[serde(default)]
    pub scoped: bool,
    #[serde(default)]
    pub wait: WaitPolicy,
    #[serde(default)]
    pub required: Vec<String>,
    #[serde(default)]
    pub optional: Vec<String>,
    #[serde(default)]
    pub outputs: Vec<OutputDef>,
}

impl KindSchema {
    pub fn output(&self, name: &str) -> Option<&OutputDef> {
        self.outputs.iter().find(|o| o.name == name)
    }

    /// Check that `path` names a declared output of this kind, with an index
    /// exactly when the output is indexed.
    pub fn declares(&self, path: &AttributePath) -> bool {
        if path.name == ID_ATTRIBUTE {
            return path.index.is_none();
        }
        match self.output(&path.name) {
            Some(output) => output.indexed == path.index.is_some(),
            None => false,
        }
    }

    /// Required field paths absent from `config`
    pub fn missing_required(&self, config: &Value) -> Vec<String> {
        self.required
            .iter()
            .filter(|path| lookup(config, path).map_or(true, Value::is_null))
            .cloned()
            .collect()
    }

    /// Top-level keys of `config` neither required nor optional
    pub fn unexpected_fields(&self, config: &Value) -> Vec<String> {
        let Some(map) = config.as_object() else {
            return Vec::new();
        };

        let allowed: BTreeSet<&str> = self
            .required
            .iter()
            .chain(self.optional.iter())
            .filter_map(|path| path.split('.').next())
            .collect();

        map.keys()
            .filter(|key| !allowed.contains(key.as_str()))
            .cloned()
            .collect()
    }

    /// Read every declared output from a provider representation
    pub fn extract_outputs(&self, provider_id: &str, representation: &Value) -> BTreeMap<String, Value> {
        let mut attributes = BTreeMap::new();
        attributes.insert(ID_ATTRIBUTE.to_string(), Value::String(provider_id.to_string()));

        for output in &self.outputs {
            let Some(value) = lookup(representation, &output.path) else {
                continue;
            };

            if output.indexed {
                let Some(items) = value.as_array() else {
                    continue;
                };
                for (index, item) in items.iter().enumerate() {
                    let element = match &output.field {
                        Some(field) => lookup(item, field),
                        None => Some(item),
                    };
                    if let Some(element) = element.filter(|v| !v.is_null()) {
                        attributes.insert(format!("{}[{}]", output.name, index), element.clone());
                    }
                }
            } else if !value.is_null() {
                attributes.insert(output.name.clone(), value.clone());
            }
        }

        attributes
    }
}

/// Root structure of resources/*.json
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SchemaRegistry {
    #[serde(default)]
    kinds: HashMap<String, KindSchema>,
}

/// Global registry loaded from JSON
static REGISTRY: OnceLock<SchemaRegistry> = OnceLock::new();

impl SchemaRegistry {
    /// Parse a registry from a JSON document shaped like `resources/azure.json`
    pub fn from_json(content: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(content)
    }

    /// The built-in registry (loads from embedded JSON on first access)
    pub fn builtin() -> &'static SchemaRegistry {
        REGISTRY.get_or_init(|| {
            let mut registry = SchemaRegistry::default();
            for content in SCHEMA_FILES {
                let partial = SchemaRegistry::from_json(content)
                    .unwrap_or_else(|e| panic!("Failed to parse embedded schema JSON: {}", e));
                registry.kinds.extend(partial.kinds);
            }
            registry
        })
    }

    pub fn get(&self, kind: &ResourceKind) -> Option<&KindSchema> {
        self.kinds.get(kind.as_str())
    }

    pub fn kinds(&self) -> Vec<ResourceKind> {
        let mut kinds: Vec<_> = self.kinds.keys().map(|k| ResourceKind::from(k.as_str())).collect();
        kinds.sort();
        kinds
    }
}

/// Look up a value using a dot-notation path; numeric parts index arrays
pub fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;

    for part in path.split('.') {
        current = match part.parse::<usize>() {
            Ok(index) if current.is_array() => current.get(index)?,
            _ => current.get(part)?,
        };
    }

    Some(current)
}
