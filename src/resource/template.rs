//! Standard topology
//!
//! A resource group holding a Linux VM reachable over SSH: public address,
//! virtual network with one subnet, security group allowing port 22, and a
//! network interface tying them together.

use super::{Reference, ResourceDescriptor, ResourceKind};
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Values the standard topology is parameterized over
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TemplateParams {
    pub resource_group: String,
    pub location: String,
    pub public_ip_name: String,
    pub domain_name_label: String,
    pub vnet_name: String,
    pub address_prefix: String,
    pub dns_servers: Vec<String>,
    pub subnet_name: String,
    pub subnet_prefix: String,
    pub nsg_name: String,
    pub nic_name: String,
    pub vm_name: String,
    pub vm_size: String,
    pub admin_username: String,
    pub ssh_public_key: String,
    pub image_publisher: String,
    pub image_offer: String,
    pub image_sku: String,
}

impl Default for TemplateParams {
    fn default() -> Self {
        Self {
            resource_group: "myRgName".to_string(),
            location: "westeurope".to_string(),
            public_ip_name: "myPublicIp".to_string(),
            domain_name_label: "mydomain12319741999".to_string(),
            vnet_name: "myVnet".to_string(),
            address_prefix: "10.0.0.0/16".to_string(),
            dns_servers: vec!["10.1.1.1".to_string(), "10.1.2.4".to_string()],
            subnet_name: "mySubnet".to_string(),
            subnet_prefix: "10.0.1.0/24".to_string(),
            nsg_name: "myNetworkSecurityGroup".to_string(),
            nic_name: "myNetworkInterface".to_string(),
            vm_name: "myVM".to_string(),
            vm_size: "Standard_E2s_v3".to_string(),
            admin_username: "azureuser".to_string(),
            ssh_public_key: String::new(),
            image_publisher: "Canonical".to_string(),
            image_offer: "0001-com-ubuntu-server-jammy".to_string(),
            image_sku: "22_04-lts-gen2".to_string(),
        }
    }
}

/// Logical ids used by [`standard_topology`]
pub mod ids {
    pub const RESOURCE_GROUP: &str = "rg1";
    pub const PUBLIC_ADDRESS: &str = "pip1";
    pub const VIRTUAL_NETWORK: &str = "vnet1";
    pub const SECURITY_GROUP: &str = "nsg1";
    pub const NETWORK_INTERFACE: &str = "nic1";
    pub const VIRTUAL_MACHINE: &str = "vm1";
}

/// Build the six descriptors of the standard topology, in declaration order
pub fn standard_topology(params: &TemplateParams) -> Vec<ResourceDescriptor> {
    use ids::*;

    let location = Reference::attribute(RESOURCE_GROUP, "location").to_value();

    let resource_group = ResourceDescriptor::new(
        RESOURCE_GROUP,
        ResourceKind::ResourceGroup,
        &params.resource_group,
    )
    .with_config(json!({ "location": params.location }));

    let public_address = ResourceDescriptor::new(
        PUBLIC_ADDRESS,
        ResourceKind::PublicAddress,
        &params.public_ip_name,
    )
    .with_scope(RESOURCE_GROUP)
    .with_config(json!({
        "location": location,
        "properties": {
            "publicIPAllocationMethod": "Dynamic",
            "dnsSettings": { "domainNameLabel": params.domain_name_label }
        }
    }));

    let virtual_network = ResourceDescriptor::new(
        VIRTUAL_NETWORK,
        ResourceKind::VirtualNetwork,
        &params.vnet_name,
    )
    .with_scope(RESOURCE_GROUP)
    .with_config(json!({
        "location": location,
        "properties": {
            "addressSpace": { "addressPrefixes": [params.address_prefix] },
            "dhcpOptions": { "dnsServers": params.dns_servers },
            "subnets": [{
                "name": params.subnet_name,
                "properties": { "addressPrefix": params.subnet_prefix }
            }]
        }
    }));

    let security_group = ResourceDescriptor::new(
        SECURITY_GROUP,
        ResourceKind::SecurityGroup,
        &params.nsg_name,
    )
    .with_scope(RESOURCE_GROUP)
    .with_config(json!({
        "location": location,
        "properties": {
            "securityRules": [{
                "name": "AllowSSH",
                "properties": {
                    "priority": 100,
                    "access": "Allow",
                    "direction": "Inbound",
                    "protocol": "Tcp",
                    "sourceAddressPrefix": "*",
                    "sourcePortRange": "*",
                    "destinationAddressPrefix": "*",
                    "destinationPortRange": "22"
                }
            }]
        }
    }));

    let network_interface = ResourceDescriptor::new(
        NETWORK_INTERFACE,
        ResourceKind::NetworkInterface,
        &params.nic_name,
    )
    .with_scope(RESOURCE_GROUP)
    .with_config(json!({
        "location": location,
        "properties": {
            "ipConfigurations": [{
                "name": "ipConfig",
                "properties": {
                    "privateIPAllocationMethod": "Dynamic",
                    "publicIPAddress": { "id": Reference::id(PUBLIC_ADDRESS).to_value() },
                    "subnet": { "id": Reference::attribute(VIRTUAL_NETWORK, "subnet[0]").to_value() }
                }
            }],
            "networkSecurityGroup": { "id": Reference::id(SECURITY_GROUP).to_value() }
        }
    }));

    let virtual_machine = ResourceDescriptor::new(
        VIRTUAL_MACHINE,
        ResourceKind::VirtualMachine,
        &params.vm_name,
    )
    .with_scope(RESOURCE_GROUP)
    .with_config(json!({
        "location": location,
        "properties": {
            "hardwareProfile": { "vmSize": params.vm_size },
            "osProfile": {
                "adminUsername": params.admin_username,
                "computerName": params.vm_name,
                "linuxConfiguration": {
                    "disablePasswordAuthentication": true,
                    "ssh": {
                        "publicKeys": [{
                            "path": format!("/home/{}/.ssh/authorized_keys", params.admin_username),
                            "keyData": params.ssh_public_key
                        }]
                    }
                }
            },
            "networkProfile": {
                "networkInterfaces": [{
                    "id": Reference::id(NETWORK_INTERFACE).to_value(),
                    "properties": { "primary": true }
                }]
            },
            "storageProfile": {
                "osDisk": {
                    "createOption": "FromImage",
                    "osType": "Linux",
                    "caching": "ReadWrite",
                    "managedDisk": { "storageAccountType": "Standard_LRS" }
                },
                "imageReference": {
                    "publisher": params.image_publisher,
                    "offer": params.image_offer,
                    "sku": params.image_sku,
                    "version": "latest"
                }
            }
        }
    }));

    vec![
        resource_group,
        public_address,
        virtual_network,
        network_interface,
        security_group,
        virtual_machine,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::SchemaRegistry;

    #[test]
    fn test_topology_has_six_unique_ids() {
        let descriptors = standard_topology(&TemplateParams::default());
        let mut ids: Vec<_> = descriptors.iter().map(|d| d.id.as_str()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 6);
    }

    #[test]
    fn test_nic_depends_on_network_pieces() {
        let descriptors = standard_topology(&TemplateParams::default());
        let nic = descriptors
            .iter()
            .find(|d| d.id == ids::NETWORK_INTERFACE)
            .unwrap();
        let deps: Vec<_> = nic.dependencies().into_iter().collect();
        assert_eq!(deps, vec!["nsg1", "pip1", "rg1", "vnet1"]);
    }

    #[test]
    fn test_configs_satisfy_builtin_schemas() {
        let registry = SchemaRegistry::builtin();
        for descriptor in standard_topology(&TemplateParams::default()) {
            let schema = registry.get(&descriptor.kind).unwrap();
            assert!(
                schema.missing_required(&descriptor.config).is_empty(),
                "{} is missing required fields",
                descriptor.id
            );
            assert!(schema.unexpected_fields(&descriptor.config).is_empty());
            assert_eq!(schema.scoped, descriptor.scope.is_some());
        }
    }
}
