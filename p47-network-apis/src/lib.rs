use kube::{CustomResource, core::ObjectList};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub const API_GROUP: &'static str = "p47.woniuxiaoan.io";

pub const API_VERSION: &'static str = "v1";

/// Desired state of a cluster network.
///
/// The controller currently treats the spec as an opaque payload, it is carried
/// through the informer cache and logged on reconciliation.
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "p47.woniuxiaoan.io",
    version = "v1",
    kind = "Network",
    shortname = "net",
    derive = "PartialEq",
    namespaced,
    printcolumn = r#"{
        "name":"CIDR",
        "type": "string",
        "jsonPath": ".spec.cidr",
        "description": "The network's address range in CIDR notation."
    }"#,
    printcolumn = r#"{
        "name":"Gateway",
        "type": "string",
        "jsonPath": ".spec.gateway",
        "description": "The network's gateway IP address."
    }"#
)]
pub struct NetworkSpec {
    /// The address range in CIDR notation, e.g. `192.168.0.0/16`.
    pub cidr: String,
    /// The gateway IP address, e.g. `192.168.0.1`.
    pub gateway: String,
}

/// The collection variant of [`Network`] (`apiVersion`, `kind`, list `metadata` and `items`).
pub type NetworkList = ObjectList<Network>;

impl Network {
    /// The `{namespace}/{name}` identity of this network, used in log messages.
    pub fn id(&self) -> String {
        format!(
            "{}/{}",
            self.metadata.namespace.as_deref().unwrap_or(""),
            self.metadata.name.as_deref().unwrap_or(""),
        )
    }

    pub fn versioned_id(&self) -> String {
        format!(
            "{}@{}",
            self.id(),
            self.metadata.resource_version.as_deref().unwrap_or("")
        )
    }
}
