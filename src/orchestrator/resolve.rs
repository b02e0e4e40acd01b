//! Reference resolution
//!
//! Turns a descriptor into a concrete request by substituting values recorded
//! for already-realized resources. Everything that can be checked without
//! the network (kind, scope, placeholder syntax, attribute paths, required
//! fields) is checked before substitution, so a malformed descriptor fails
//! before any side effect.

use crate::error::ResolveError;
use crate::provider::ResourceTarget;
use crate::resource::{
    collect_references, AttributePath, KindSchema, RealizedResource, Reference, ResourceDescriptor,
    ResourceKind, SchemaRegistry, WaitPolicy,
};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::time::Duration;

/// Realized resources of the current run, by logical id.
///
/// Entries are written once, by the run driver, after an operation returned
/// success; readers only ever see complete entries.
#[derive(Debug, Clone, Default)]
pub struct IdentifierTable {
    entries: HashMap<String, RealizedResource>,
}

impl IdentifierTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Commit a realized resource. Returns `false` (and keeps the existing
    /// entry) if the logical id was already recorded.
    pub fn record(&mut self, realized: RealizedResource) -> bool {
        if self.entries.contains_key(&realized.id) {
            return false;
        }
        self.entries.insert(realized.id.clone(), realized);
        true
    }

    pub fn get(&self, id: &str) -> Option<&RealizedResource> {
        self.entries.get(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A descriptor with every placeholder substituted, ready to submit
#[derive(Debug, Clone, PartialEq)]
pub struct MaterializedRequest {
    pub id: String,
    pub target: ResourceTarget,
    pub body: Value,
    pub wait: WaitPolicy,
    pub timeout: Option<Duration>,
}

pub struct ReferenceResolver<'a> {
    registry: &'a SchemaRegistry,
    kinds: HashMap<&'a str, &'a ResourceKind>,
}

impl<'a> ReferenceResolver<'a> {
    /// `descriptors` is the full run; it tells the resolver which kind each
    /// referenced logical id produces.
    pub fn new(registry: &'a SchemaRegistry, descriptors: &'a [ResourceDescriptor]) -> Self {
        let kinds = descriptors
            .iter()
            .map(|d| (d.id.as_str(), &d.kind))
            .collect();
        Self { registry, kinds }
    }

    /// Static checks that need no realized resources.
    pub fn validate(&self, descriptor: &ResourceDescriptor) -> Result<(), ResolveError> {
        let schema = self.schema_for(descriptor, &descriptor.kind)?;
        self.validate_scope(descriptor, schema)?;

        for reference in collect_references(&descriptor.config) {
            let reference = reference.map_err(|detail| ResolveError::MalformedReference {
                resource: descriptor.id.clone(),
                detail,
            })?;
            self.validate_reference(descriptor, &reference)?;
        }

        let missing = schema.missing_required(&descriptor.config);
        if !missing.is_empty() {
            return Err(ResolveError::MissingFields {
                resource: descriptor.id.clone(),
                fields: missing,
            });
        }

        let unexpected = schema.unexpected_fields(&descriptor.config);
        if !unexpected.is_empty() {
            return Err(ResolveError::UnexpectedFields {
                resource: descriptor.id.clone(),
                fields: unexpected,
            });
        }

        Ok(())
    }

    /// Validate, then substitute every placeholder from `table`.
    pub fn resolve(
        &self,
        descriptor: &ResourceDescriptor,
        table: &IdentifierTable,
    ) -> Result<MaterializedRequest, ResolveError> {
        self.validate(descriptor)?;
        let schema = self.schema_for(descriptor, &descriptor.kind)?;

        let resource_group = match &descriptor.scope {
            Some(scope) => Some(self.scope_name(descriptor, scope, table)?),
            None => None,
        };

        let body = self.substitute(descriptor, &descriptor.config, table)?;

        Ok(MaterializedRequest {
            id: descriptor.id.clone(),
            target: ResourceTarget::new(descriptor.kind.clone(), schema, resource_group, &descriptor.name),
            body,
            wait: descriptor.wait.unwrap_or(schema.wait),
            timeout: descriptor.timeout_secs.map(Duration::from_secs),
        })
    }

    fn schema_for(
        &self,
        descriptor: &ResourceDescriptor,
        kind: &ResourceKind,
    ) -> Result<&'a KindSchema, ResolveError> {
        self.registry
            .get(kind)
            .ok_or_else(|| ResolveError::UnknownKind {
                resource: descriptor.id.clone(),
                kind: kind.to_string(),
            })
    }

    fn validate_scope(&self, descriptor: &ResourceDescriptor, schema: &KindSchema) -> Result<(), ResolveError> {
        let invalid = |detail: String| ResolveError::InvalidScope {
            resource: descriptor.id.clone(),
            detail,
        };

        match (&descriptor.scope, schema.scoped) {
            (None, true) => Err(invalid(format!("{} must be scoped to a resource group", descriptor.kind))),
            (Some(_), false) => Err(invalid(format!("{} cannot be scoped to a resource group", descriptor.kind))),
            (Some(scope), true) => match self.kinds.get(scope.as_str()) {
                Some(ResourceKind::ResourceGroup) => Ok(()),
                Some(kind) => Err(invalid(format!("scope {} is a {}, not a resource group", scope, kind))),
                None => Err(invalid(format!("scope {} is not part of this run", scope))),
            },
            (None, false) => Ok(()),
        }
    }

    fn validate_reference(&self, descriptor: &ResourceDescriptor, reference: &Reference) -> Result<(), ResolveError> {
        let Some(attribute) = &reference.attribute else {
            return Ok(());
        };

        let Some(kind) = self.kinds.get(reference.target.as_str()) else {
            return Err(ResolveError::UnresolvedReference {
                resource: descriptor.id.clone(),
                target: reference.target.clone(),
            });
        };

        let malformed = || ResolveError::MalformedAttributePath {
            resource: descriptor.id.clone(),
            target: reference.target.clone(),
            kind: kind.to_string(),
            attribute: attribute.clone(),
        };

        let path: AttributePath = attribute.parse().map_err(|_| malformed())?;
        let producer = self.schema_for(descriptor, kind)?;
        if producer.declares(&path) {
            Ok(())
        } else {
            Err(malformed())
        }
    }

    fn scope_name(
        &self,
        descriptor: &ResourceDescriptor,
        scope: &str,
        table: &IdentifierTable,
    ) -> Result<String, ResolveError> {
        let realized = table.get(scope).ok_or_else(|| ResolveError::UnresolvedReference {
            resource: descriptor.id.clone(),
            target: scope.to_string(),
        })?;

        realized
            .attribute("name")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ResolveError::MissingAttribute {
                resource: descriptor.id.clone(),
                target: scope.to_string(),
                attribute: "name".to_string(),
            })
    }

    fn substitute(
        &self,
        descriptor: &ResourceDescriptor,
        value: &Value,
        table: &IdentifierTable,
    ) -> Result<Value, ResolveError> {
        if let Some(reference) = Reference::parse(value) {
            let reference = reference.map_err(|detail| ResolveError::MalformedReference {
                resource: descriptor.id.clone(),
                detail,
            })?;
            return self.lookup(descriptor, &reference, table);
        }

        match value {
            Value::Array(items) => items
                .iter()
                .map(|item| self.substitute(descriptor, item, table))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Value::Object(map) => {
                let mut resolved = Map::with_capacity(map.len());
                for (key, item) in map {
                    resolved.insert(key.clone(), self.substitute(descriptor, item, table)?);
                }
                Ok(Value::Object(resolved))
            }
            other => Ok(other.clone()),
        }
    }

    fn lookup(
        &self,
        descriptor: &ResourceDescriptor,
        reference: &Reference,
        table: &IdentifierTable,
    ) -> Result<Value, ResolveError> {
        let realized = table
            .get(&reference.target)
            .ok_or_else(|| ResolveError::UnresolvedReference {
                resource: descriptor.id.clone(),
                target: reference.target.clone(),
            })?;

        let Some(attribute) = &reference.attribute else {
            return Ok(Value::String(realized.provider_id.clone()));
        };

        realized
            .attribute(attribute)
            .cloned()
            .ok_or_else(|| ResolveError::MissingAttribute {
                resource: descriptor.id.clone(),
                target: reference.target.clone(),
                attribute: attribute.clone(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::template::{standard_topology, TemplateParams};
    use serde_json::json;
    use std::collections::BTreeMap;

    fn realized(id: &str, kind: ResourceKind, provider_id: &str, attrs: &[(&str, Value)]) -> RealizedResource {
        let mut attributes: BTreeMap<String, Value> =
            attrs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect();
        attributes.insert("id".into(), json!(provider_id));
        RealizedResource {
            id: id.to_string(),
            kind,
            provider_id: provider_id.to_string(),
            attributes,
        }
    }

    fn find<'d>(descriptors: &'d [ResourceDescriptor], id: &str) -> &'d ResourceDescriptor {
        descriptors.iter().find(|d| d.id == id).unwrap()
    }

    fn network_table() -> IdentifierTable {
        let mut table = IdentifierTable::new();
        table.record(realized(
            "rg1",
            ResourceKind::ResourceGroup,
            "/rg/myRgName",
            &[("name", json!("myRgName")), ("location", json!("westeurope"))],
        ));
        table.record(realized("pip1", ResourceKind::PublicAddress, "/pip/myPublicIp", &[]));
        table.record(realized(
            "vnet1",
            ResourceKind::VirtualNetwork,
            "/vnet/myVnet",
            &[("subnet[0]", json!("/vnet/myVnet/subnets/mySubnet"))],
        ));
        table.record(realized("nsg1", ResourceKind::SecurityGroup, "/nsg/myNsg", &[]));
        table
    }

    #[test]
    fn test_resolves_nic_references_byte_for_byte() {
        let descriptors = standard_topology(&TemplateParams::default());
        let resolver = ReferenceResolver::new(SchemaRegistry::builtin(), &descriptors);

        let request = resolver
            .resolve(find(&descriptors, "nic1"), &network_table())
            .unwrap();

        let ip_config = &request.body["properties"]["ipConfigurations"][0]["properties"];
        assert_eq!(ip_config["subnet"]["id"], json!("/vnet/myVnet/subnets/mySubnet"));
        assert_eq!(ip_config["publicIPAddress"]["id"], json!("/pip/myPublicIp"));
        assert_eq!(request.body["properties"]["networkSecurityGroup"]["id"], json!("/nsg/myNsg"));
        assert_eq!(request.body["location"], json!("westeurope"));
        assert_eq!(request.target.resource_group.as_deref(), Some("myRgName"));
        assert_eq!(request.target.provider, "Microsoft.Network/networkInterfaces");
        assert_eq!(request.wait, WaitPolicy::Completed);
    }

    #[test]
    fn test_missing_dependency_is_an_error_not_a_default() {
        let descriptors = standard_topology(&TemplateParams::default());
        let resolver = ReferenceResolver::new(SchemaRegistry::builtin(), &descriptors);

        let mut table = network_table();
        table.entries.remove("nsg1");

        let err = resolver.resolve(find(&descriptors, "nic1"), &table).unwrap_err();
        assert_eq!(
            err,
            ResolveError::UnresolvedReference {
                resource: "nic1".into(),
                target: "nsg1".into()
            }
        );
    }

    #[test]
    fn test_undeclared_attribute_fails_validation() {
        let mut descriptors = standard_topology(&TemplateParams::default());
        let nic = descriptors.iter_mut().find(|d| d.id == "nic1").unwrap();
        nic.config["properties"]["ipConfigurations"][0]["properties"]["subnet"]["id"] =
            Reference::attribute("vnet1", "gateway[0]").to_value();

        let resolver = ReferenceResolver::new(SchemaRegistry::builtin(), &descriptors);
        let err = resolver.validate(find(&descriptors, "nic1")).unwrap_err();
        assert!(matches!(
            err,
            ResolveError::MalformedAttributePath { ref attribute, .. } if attribute == "gateway[0]"
        ));
    }

    #[test]
    fn test_declared_but_absent_index_is_reported() {
        let mut descriptors = standard_topology(&TemplateParams::default());
        let nic = descriptors.iter_mut().find(|d| d.id == "nic1").unwrap();
        nic.config["properties"]["ipConfigurations"][0]["properties"]["subnet"]["id"] =
            Reference::attribute("vnet1", "subnet[3]").to_value();

        let resolver = ReferenceResolver::new(SchemaRegistry::builtin(), &descriptors);
        let err = resolver
            .resolve(find(&descriptors, "nic1"), &network_table())
            .unwrap_err();
        assert!(matches!(err, ResolveError::MissingAttribute { ref attribute, .. } if attribute == "subnet[3]"));
    }

    #[test]
    fn test_scope_must_be_a_resource_group() {
        let descriptors = vec![
            ResourceDescriptor::new("nsg", ResourceKind::SecurityGroup, "nsg")
                .with_scope("vnet")
                .with_config(json!({"location": "westeurope"})),
            ResourceDescriptor::new("vnet", ResourceKind::VirtualNetwork, "vnet"),
        ];
        let resolver = ReferenceResolver::new(SchemaRegistry::builtin(), &descriptors);
        let err = resolver.validate(&descriptors[0]).unwrap_err();
        assert!(matches!(err, ResolveError::InvalidScope { .. }));

        let unscoped = ResourceDescriptor::new("nsg", ResourceKind::SecurityGroup, "nsg")
            .with_config(json!({"location": "westeurope"}));
        assert!(matches!(
            resolver.validate(&unscoped).unwrap_err(),
            ResolveError::InvalidScope { .. }
        ));
    }

    #[test]
    fn test_unknown_kind_and_missing_fields() {
        let descriptors = vec![
            ResourceDescriptor::new("x", ResourceKind::Other("storageAccount".into()), "x"),
            ResourceDescriptor::new("rg", ResourceKind::ResourceGroup, "rg"),
        ];
        let resolver = ReferenceResolver::new(SchemaRegistry::builtin(), &descriptors);

        assert!(matches!(
            resolver.validate(&descriptors[0]).unwrap_err(),
            ResolveError::UnknownKind { .. }
        ));
        assert_eq!(
            resolver.validate(&descriptors[1]).unwrap_err(),
            ResolveError::MissingFields {
                resource: "rg".into(),
                fields: vec!["location".into()]
            }
        );
    }

    #[test]
    fn test_table_records_each_id_once() {
        let mut table = IdentifierTable::new();
        assert!(table.record(realized("a", ResourceKind::SecurityGroup, "/a", &[])));
        assert!(!table.record(realized("a", ResourceKind::SecurityGroup, "/other", &[])));
        assert_eq!(table.get("a").unwrap().provider_id, "/a");
    }
}
