use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Columns that every stored object carries next to its payload. The store
/// owns the creation timestamp, creators and tenants; callers own finalizers
/// until archival.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(default)]
    pub creation_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub deletion_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finalizers: Vec<String>,
    #[serde(default)]
    pub creators: Vec<String>,
    #[serde(default)]
    pub tenants: Vec<String>,
}

impl Metadata {
    pub fn pending_deletion(&self) -> bool {
        self.deletion_timestamp.is_some()
    }
}

/// Typed parameter value: a type URL naming the wire type plus the JSON
/// encoding of the value, mirroring the `google.protobuf.Any` envelope.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TypedValue {
    #[serde(default)]
    pub type_url: String,
    #[serde(default)]
    pub value: serde_json::Value,
}

impl TypedValue {
    pub fn string(value: impl Into<String>) -> Self {
        Self {
            type_url: "type.googleapis.com/google.protobuf.StringValue".to_string(),
            value: serde_json::Value::String(value.into()),
        }
    }

    pub fn int32(value: i32) -> Self {
        Self {
            type_url: "type.googleapis.com/google.protobuf.Int32Value".to_string(),
            value: serde_json::Value::from(value),
        }
    }

    pub fn bool(value: bool) -> Self {
        Self {
            type_url: "type.googleapis.com/google.protobuf.BoolValue".to_string(),
            value: serde_json::Value::Bool(value),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConditionStatus {
    #[default]
    Unspecified,
    False,
    True,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConditionType {
    Progressing,
    Ready,
    Degraded,
}

impl ConditionType {
    pub const ALL: [ConditionType; 3] = [
        ConditionType::Progressing,
        ConditionType::Ready,
        ConditionType::Degraded,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ConditionType::Progressing => "PROGRESSING",
            ConditionType::Ready => "READY",
            ConditionType::Degraded => "DEGRADED",
        }
    }

    /// Stable small discriminant, used by the duplicate-condition bitmask.
    pub fn ordinal(self) -> u32 {
        match self {
            ConditionType::Progressing => 1,
            ConditionType::Ready => 2,
            ConditionType::Degraded => 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub r#type: ConditionType,
    #[serde(default)]
    pub status: ConditionStatus,
    #[serde(default)]
    pub last_transition_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub message: String,
}

impl Condition {
    pub fn unset(r#type: ConditionType) -> Self {
        Self {
            r#type,
            status: ConditionStatus::False,
            last_transition_time: None,
            message: String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResourceState {
    #[default]
    Unspecified,
    Progressing,
    Ready,
    Failed,
}

impl ResourceState {
    pub fn as_str(self) -> &'static str {
        match self {
            ResourceState::Unspecified => "UNSPECIFIED",
            ResourceState::Progressing => "PROGRESSING",
            ResourceState::Ready => "READY",
            ResourceState::Failed => "FAILED",
        }
    }
}

/// Kind of a change observed by the store, also the type of a watch event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    Created,
    Updated,
    Deleted,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Created => "CREATED",
            EventKind::Updated => "UPDATED",
            EventKind::Deleted => "DELETED",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enums_serialize_as_symbolic_names() {
        assert_eq!(
            serde_json::to_value(ResourceState::Progressing).unwrap(),
            "PROGRESSING"
        );
        assert_eq!(
            serde_json::to_value(ConditionType::Ready).unwrap(),
            "READY"
        );
        assert_eq!(serde_json::to_value(EventKind::Deleted).unwrap(), "DELETED");
    }

    #[test]
    fn typed_value_constructors_carry_well_known_urls() {
        let v = TypedValue::string("abc");
        assert_eq!(v.type_url, "type.googleapis.com/google.protobuf.StringValue");
        assert_eq!(v.value, serde_json::json!("abc"));

        let v = TypedValue::int32(7);
        assert_eq!(v.type_url, "type.googleapis.com/google.protobuf.Int32Value");
    }

    #[test]
    fn metadata_deletion_sentinel() {
        let mut md = Metadata::default();
        assert!(!md.pending_deletion());
        md.deletion_timestamp = Some(Utc::now());
        assert!(md.pending_deletion());
    }
}
