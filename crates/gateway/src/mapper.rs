//! Deep copy between the public and the private schema, driven by the JSON
//! form of both sides. Inbound copies are strict: a field the target schema
//! does not know is an error. Outbound copies are lenient: private-only
//! fields are silently dropped.

use serde::de::DeserializeOwned;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapperError {
    pub message: String,
}

impl MapperError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for MapperError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for MapperError {}

#[derive(Debug, Clone, Copy)]
pub struct GenericMapper {
    strict: bool,
}

impl GenericMapper {
    pub fn strict() -> Self {
        Self { strict: true }
    }

    pub fn lenient() -> Self {
        Self { strict: false }
    }

    /// Copies `from` onto `onto`, merging field by field, and returns the
    /// merged target. In strict mode any source field that does not survive
    /// into the target schema is an error.
    pub fn copy<F, T>(&self, from: &F, onto: &T) -> Result<T, MapperError>
    where
        F: Serialize,
        T: Serialize + DeserializeOwned,
    {
        let from_json = serde_json::to_value(from)
            .map_err(|err| MapperError::new(format!("failed to encode source object: {}", err)))?;
        let onto_json = serde_json::to_value(onto)
            .map_err(|err| MapperError::new(format!("failed to encode target object: {}", err)))?;

        let merged = deep_merge(onto_json, from_json.clone());
        let result: T = serde_json::from_value(merged)
            .map_err(|err| MapperError::new(format!("failed to map object: {}", err)))?;

        if self.strict {
            let result_json = serde_json::to_value(&result).map_err(|err| {
                MapperError::new(format!("failed to encode mapped object: {}", err))
            })?;
            let mut path = Vec::new();
            check_covered(&from_json, &result_json, &mut path)?;
        }
        Ok(result)
    }
}

/// Recursively merges `from` over `onto`: objects merge key by key,
/// everything else is replaced by `from`.
fn deep_merge(onto: serde_json::Value, from: serde_json::Value) -> serde_json::Value {
    match (onto, from) {
        (serde_json::Value::Object(mut onto_map), serde_json::Value::Object(from_map)) => {
            for (key, from_value) in from_map {
                let merged = match onto_map.remove(&key) {
                    Some(onto_value) => deep_merge(onto_value, from_value),
                    None => from_value,
                };
                onto_map.insert(key, merged);
            }
            serde_json::Value::Object(onto_map)
        }
        (_, from) => from,
    }
}

/// Verifies that every non-null field of `from` survived into `result`,
/// which is how a field unknown to the target schema is detected.
fn check_covered(
    from: &serde_json::Value,
    result: &serde_json::Value,
    path: &mut Vec<String>,
) -> Result<(), MapperError> {
    match from {
        serde_json::Value::Null => Ok(()),
        serde_json::Value::Object(map) => {
            for (key, from_value) in map {
                if from_value.is_null() {
                    continue;
                }
                path.push(key.clone());
                match result.get(key) {
                    Some(result_value) => check_covered(from_value, result_value, path)?,
                    None => {
                        return Err(MapperError::new(format!(
                            "field '{}' doesn't exist in the target schema",
                            path.join(".")
                        )))
                    }
                }
                path.pop();
            }
            Ok(())
        }
        serde_json::Value::Array(items) => {
            for (index, item) in items.iter().enumerate() {
                path.push(index.to_string());
                match result.get(index) {
                    Some(result_item) => check_covered(item, result_item, path)?,
                    None => {
                        return Err(MapperError::new(format!(
                            "field '{}' doesn't exist in the target schema",
                            path.join(".")
                        )))
                    }
                }
                path.pop();
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use foundry_api::{private, public};

    #[test]
    fn outbound_drops_private_fields_silently() {
        let mut vm = private::VirtualMachine::default();
        vm.id = "vm1".to_string();
        vm.spec.template = "t1".to_string();
        vm.status.hub = "hub1".to_string();
        vm.status.ip_address = "10.0.0.1".to_string();

        let mapped = GenericMapper::lenient()
            .copy(&vm, &public::VirtualMachine::default())
            .expect("outbound copy should succeed");
        assert_eq!(mapped.id, "vm1");
        assert_eq!(mapped.spec.template, "t1");
        assert_eq!(mapped.status.ip_address, "10.0.0.1");
    }

    #[test]
    fn inbound_rejects_unknown_fields() {
        // A public object with an extra field, as it would arrive off the
        // wire.
        let mut payload =
            serde_json::to_value(public::VirtualMachine::default()).expect("vm should encode");
        payload["status"]["hub_override"] = serde_json::json!("hub1");

        let err = GenericMapper::strict()
            .copy(&payload, &private::VirtualMachine::default())
            .unwrap_err();
        assert!(err.message.contains("status.hub_override"));
    }

    #[test]
    fn inbound_merge_preserves_private_fields() {
        let mut existing = private::VirtualMachine::default();
        existing.id = "vm1".to_string();
        existing.status.hub = "hub1".to_string();

        let mut incoming = public::VirtualMachine::default();
        incoming.id = "vm1".to_string();
        incoming.spec.template = "t2".to_string();

        let merged = GenericMapper::strict()
            .copy(&incoming, &existing)
            .expect("inbound copy should succeed");
        assert_eq!(merged.spec.template, "t2");
        assert_eq!(merged.status.hub, "hub1", "private data must survive");
    }

    #[test]
    fn round_trip_is_identity_for_public_objects() {
        let mut original = public::Cluster::default();
        original.id = "c1".to_string();
        original.spec.template = "small".to_string();
        original
            .spec
            .node_sets
            .insert("worker".to_string(), private::ClusterNodeSet {
                host_class: "standard".to_string(),
                size: 3,
            });

        let inbound = GenericMapper::strict()
            .copy(&original, &private::Cluster::default())
            .expect("inbound copy should succeed");
        let outbound = GenericMapper::lenient()
            .copy(&inbound, &public::Cluster::default())
            .expect("outbound copy should succeed");
        assert_eq!(outbound, original);
    }
}
