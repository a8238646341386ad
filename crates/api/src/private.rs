//! Internal schema. This is the authoritative shape of every entity; the
//! public schema in [`crate::public`] is derived from it by dropping the
//! fields that never leave the service.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::object::impl_object;
use crate::shared::{Condition, Metadata, ResourceState, TypedValue};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub spec: ClusterSpec,
    #[serde(default)]
    pub status: ClusterStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterSpec {
    #[serde(default)]
    pub template: String,
    #[serde(default)]
    pub node_sets: BTreeMap<String, ClusterNodeSet>,
    #[serde(default)]
    pub template_parameters: BTreeMap<String, TypedValue>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterNodeSet {
    #[serde(default)]
    pub host_class: String,
    #[serde(default)]
    pub size: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterStatus {
    #[serde(default)]
    pub state: ResourceState,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub api_url: String,
    #[serde(default)]
    pub console_url: String,
    /// Identifier of the hub the cluster was placed on. Never exposed
    /// through the public schema.
    #[serde(default)]
    pub hub: String,
}

impl_object!(Cluster, kind: "cluster", fields: ["spec", "status"]);

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterTemplate {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parameters: Vec<TemplateParameterDefinition>,
    #[serde(default)]
    pub node_sets: BTreeMap<String, ClusterNodeSet>,
}

impl_object!(ClusterTemplate, kind: "cluster_template",
    fields: ["title", "description", "parameters", "node_sets"]);

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TemplateParameterDefinition {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub required: bool,
    /// Type URL the supplied value must carry.
    #[serde(default)]
    pub r#type: String,
    #[serde(default)]
    pub default: Option<TypedValue>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VirtualMachine {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub spec: VirtualMachineSpec,
    #[serde(default)]
    pub status: VirtualMachineStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VirtualMachineSpec {
    #[serde(default)]
    pub template: String,
    #[serde(default)]
    pub template_parameters: BTreeMap<String, TypedValue>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VirtualMachineStatus {
    #[serde(default)]
    pub state: ResourceState,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub ip_address: String,
    #[serde(default)]
    pub hub: String,
}

impl_object!(VirtualMachine, kind: "virtual_machine", fields: ["spec", "status"]);

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VirtualMachineTemplate {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parameters: Vec<TemplateParameterDefinition>,
}

impl_object!(VirtualMachineTemplate, kind: "virtual_machine_template",
    fields: ["title", "description", "parameters"]);

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Hub {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub spec: HubSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HubSpec {
    #[serde(default)]
    pub api_url: String,
    #[serde(default)]
    pub namespace: String,
    /// Bearer token used to authenticate against the hub API server.
    #[serde(default)]
    pub token: String,
    /// PEM bundle for the hub API server certificate, empty to use the
    /// system roots.
    #[serde(default)]
    pub ca_bundle: String,
    #[serde(default)]
    pub insecure: bool,
}

impl_object!(Hub, kind: "hub", fields: ["spec"]);

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostClass {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
}

impl_object!(HostClass, kind: "host_class", fields: ["title", "description"]);

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterOrder {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub spec: ClusterOrderSpec,
    #[serde(default)]
    pub status: ClusterOrderStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterOrderSpec {
    #[serde(default)]
    pub template_id: String,
    #[serde(default)]
    pub name_prefix: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterOrderStatus {
    #[serde(default)]
    pub state: ResourceState,
    #[serde(default)]
    pub cluster_id: String,
}

impl_object!(ClusterOrder, kind: "cluster_order", fields: ["spec", "status"]);
