//! Work queue key derivation.
//!
//! Objects are identified by `{namespace}/{name}` (or just `{name}` for
//! cluster scoped objects). The same object always maps to the same key,
//! regardless of whether it was added, updated or deleted.

use kube::Resource;
use std::sync::Arc;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub(crate) enum KeyError {
    /// The object carries no `metadata.name`.
    #[error("object has no name, unable to derive key")]
    MissingName,
    /// The key is not of the form `{name}` or `{namespace}/{name}`.
    #[error("unexpected key format: {0:?}")]
    InvalidKey(String),
}

/// Parsed form of a work queue key.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) struct ObjectKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(namespace) => write!(f, "{}/{}", namespace, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

/// Last known state of an object whose deletion was missed while the watch was
/// disconnected, the informer noticed it on relist.
#[derive(Debug)]
pub(crate) struct DeletedFinalStateUnknown<K> {
    pub key: String,
    pub obj: Arc<K>,
}

/// Payload of a delete notification.
#[derive(Debug)]
pub(crate) enum DeletedObject<K> {
    Object(Arc<K>),
    Tombstone(DeletedFinalStateUnknown<K>),
}

pub(crate) fn meta_namespace_key<K: Resource>(obj: &K) -> Result<String, KeyError> {
    let meta = obj.meta();
    let name = meta
        .name
        .as_deref()
        .filter(|n| !n.is_empty())
        .ok_or(KeyError::MissingName)?;
    match meta.namespace.as_deref().filter(|ns| !ns.is_empty()) {
        Some(namespace) => Ok(format!("{}/{}", namespace, name)),
        None => Ok(name.to_string()),
    }
}

/// Like [`meta_namespace_key`] but also accepts tombstones, for which the key
/// recorded at the time of the relist is returned.
pub(crate) fn deletion_handling_key<K: Resource>(
    obj: &DeletedObject<K>,
) -> Result<String, KeyError> {
    match obj {
        DeletedObject::Tombstone(tombstone) => Ok(tombstone.key.clone()),
        DeletedObject::Object(obj) => meta_namespace_key(obj.as_ref()),
    }
}

pub(crate) fn split_meta_namespace_key(key: &str) -> Result<ObjectKey, KeyError> {
    let parts: Vec<&str> = key.split('/').collect();
    let (namespace, name) = match parts.as_slice() {
        [name] => (None, *name),
        [namespace, name] => (Some(namespace.to_string()).filter(|ns| !ns.is_empty()), *name),
        _ => return Err(KeyError::InvalidKey(key.to_string())),
    };
    if name.is_empty() {
        return Err(KeyError::InvalidKey(key.to_string()));
    }
    Ok(ObjectKey {
        namespace,
        name: name.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::Node;
    use kube::api::ObjectMeta;
    use p47_network_apis::{Network, NetworkSpec};

    fn network(namespace: Option<&str>, name: Option<&str>) -> Network {
        Network {
            metadata: ObjectMeta {
                name: name.map(String::from),
                namespace: namespace.map(String::from),
                ..Default::default()
            },
            spec: NetworkSpec {
                cidr: "10.0.0.0/24".to_string(),
                gateway: "10.0.0.1".to_string(),
            },
        }
    }

    #[test]
    fn namespaced_key() {
        let obj = network(Some("default"), Some("net-a"));
        assert_eq!(Ok("default/net-a".to_string()), meta_namespace_key(&obj));
    }

    #[test]
    fn cluster_scoped_key() {
        let node = Node {
            metadata: ObjectMeta {
                name: Some("worker-1".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        assert_eq!(Ok("worker-1".to_string()), meta_namespace_key(&node));
    }

    #[test]
    fn missing_name() {
        assert_eq!(
            Err(KeyError::MissingName),
            meta_namespace_key(&network(Some("default"), None))
        );
        assert_eq!(
            Err(KeyError::MissingName),
            meta_namespace_key(&network(Some("default"), Some("")))
        );
    }

    #[test]
    fn same_key_for_every_event_type() {
        let obj = Arc::new(network(Some("ns"), Some("x")));
        let added = meta_namespace_key(obj.as_ref()).unwrap();
        let deleted = deletion_handling_key(&DeletedObject::Object(obj.clone())).unwrap();
        assert_eq!(added, deleted);
    }

    #[test]
    fn tombstone_key() {
        // the tombstone key wins even if the cached object lost its identity
        let tombstone = DeletedObject::Tombstone(DeletedFinalStateUnknown {
            key: "ns/gone".to_string(),
            obj: Arc::new(network(None, None)),
        });
        assert_eq!(Ok("ns/gone".to_string()), deletion_handling_key(&tombstone));
    }

    #[test]
    fn split_keys() {
        assert_eq!(
            Ok(ObjectKey {
                namespace: Some("default".to_string()),
                name: "net-a".to_string()
            }),
            split_meta_namespace_key("default/net-a")
        );
        assert_eq!(
            Ok(ObjectKey {
                namespace: None,
                name: "worker-1".to_string()
            }),
            split_meta_namespace_key("worker-1")
        );
        assert!(split_meta_namespace_key("a/b/c").is_err());
        assert!(split_meta_namespace_key("ns/").is_err());
        assert!(split_meta_namespace_key("").is_err());
    }

    #[test]
    fn display_round_trips() {
        for key in ["default/net-a", "worker-1"] {
            assert_eq!(key, split_meta_namespace_key(key).unwrap().to_string());
        }
    }
}
