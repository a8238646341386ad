use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::shared::Metadata;

/// Capability contract required from every entity managed by the generic
/// store: identifier access, metadata access, a wire kind, and the list of
/// payload fields the filter translator may resolve.
pub trait Object:
    Clone + Default + PartialEq + std::fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Wire name of the entity, singular, snake case. Used for labels and
    /// generated names.
    const KIND: &'static str;

    /// Root payload fields that a filter expression may reference, besides
    /// `id` and `metadata`.
    const FILTER_FIELDS: &'static [&'static str];

    fn id(&self) -> &str;
    fn set_id(&mut self, id: String);
    fn metadata(&self) -> &Metadata;
    fn metadata_mut(&mut self) -> &mut Metadata;
    fn set_metadata(&mut self, metadata: Metadata);

    /// Field-wise equality that ignores the creation and deletion timestamps
    /// inside the metadata. The store uses this to prune no-op updates.
    fn equivalent(&self, other: &Self) -> bool {
        let mut x = self.clone();
        let mut y = other.clone();
        x.metadata_mut().creation_timestamp = None;
        x.metadata_mut().deletion_timestamp = None;
        y.metadata_mut().creation_timestamp = None;
        y.metadata_mut().deletion_timestamp = None;
        x == y
    }
}

macro_rules! impl_object {
    ($type:ty, kind: $kind:literal, fields: [$($field:literal),* $(,)?]) => {
        impl $crate::object::Object for $type {
            const KIND: &'static str = $kind;
            const FILTER_FIELDS: &'static [&'static str] = &[$($field),*];

            fn id(&self) -> &str {
                &self.id
            }

            fn set_id(&mut self, id: String) {
                self.id = id;
            }

            fn metadata(&self) -> &$crate::shared::Metadata {
                &self.metadata
            }

            fn metadata_mut(&mut self) -> &mut $crate::shared::Metadata {
                &mut self.metadata
            }

            fn set_metadata(&mut self, metadata: $crate::shared::Metadata) {
                self.metadata = metadata;
            }
        }
    };
}

pub(crate) use impl_object;

#[cfg(test)]
mod tests {
    use crate::private::Cluster;
    use crate::Object;
    use chrono::Utc;

    #[test]
    fn equivalence_ignores_metadata_timestamps() {
        let mut stored = Cluster::default();
        stored.set_id("c1".to_string());
        stored.metadata_mut().creation_timestamp = Some(Utc::now());

        let mut incoming = stored.clone();
        incoming.metadata_mut().creation_timestamp = None;
        incoming.metadata_mut().deletion_timestamp = Some(Utc::now());

        assert!(stored.equivalent(&incoming));
    }

    #[test]
    fn equivalence_sees_payload_and_finalizer_changes() {
        let mut stored = Cluster::default();
        stored.set_id("c1".to_string());

        let mut incoming = stored.clone();
        incoming.spec.template = "t1".to_string();
        assert!(!stored.equivalent(&incoming));

        let mut incoming = stored.clone();
        incoming.metadata_mut().finalizers.push("hold".to_string());
        assert!(!stored.equivalent(&incoming));
    }
}
