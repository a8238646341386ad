//! Forward reconciliation: desired-state objects in the store become native
//! objects in the selected hub cluster.

use std::marker::PhantomData;
use std::sync::Arc;

use foundry_api::private::{Cluster, Hub, VirtualMachine};
use foundry_api::{Condition, ConditionType, Object, ResourceState};
use foundry_store::dao::{GenericDao, ListRequest};
use foundry_store::{CallContext, StoreError, TxManager};
use rand::Rng;

use crate::hub_cache::{HubCache, HubEntry};
use crate::kube::{uuid_label, GroupVersionResource};
use crate::workqueue::ReconcileResult;
use crate::ControllerError;

/// Access to the parts of an entity the reconcilers manipulate: state,
/// conditions, hub binding and the native object spec.
pub trait EntityAdapter: Send + Sync + 'static {
    type Object: Object;

    const GVR: GroupVersionResource;
    const NAME_PREFIX: &'static str;
    /// Human-readable entity name used in messages.
    const NAME: &'static str;

    fn state(object: &Self::Object) -> ResourceState;
    fn set_state(object: &mut Self::Object, state: ResourceState);
    fn conditions_mut(object: &mut Self::Object) -> &mut Vec<Condition>;
    fn hub(object: &Self::Object) -> &str;
    fn set_hub(object: &mut Self::Object, hub: String);
    fn native_spec(object: &Self::Object) -> Result<serde_json::Value, ControllerError>;
}

pub struct VirtualMachineAdapter;

impl EntityAdapter for VirtualMachineAdapter {
    type Object = VirtualMachine;

    const GVR: GroupVersionResource = crate::kube::VIRTUAL_MACHINES;
    const NAME_PREFIX: &'static str = "vm-";
    const NAME: &'static str = "virtual machine";

    fn state(object: &VirtualMachine) -> ResourceState {
        object.status.state
    }

    fn set_state(object: &mut VirtualMachine, state: ResourceState) {
        object.status.state = state;
    }

    fn conditions_mut(object: &mut VirtualMachine) -> &mut Vec<Condition> {
        &mut object.status.conditions
    }

    fn hub(object: &VirtualMachine) -> &str {
        &object.status.hub
    }

    fn set_hub(object: &mut VirtualMachine, hub: String) {
        object.status.hub = hub;
    }

    fn native_spec(object: &VirtualMachine) -> Result<serde_json::Value, ControllerError> {
        Ok(serde_json::json!({
            "templateID": object.spec.template,
            "templateParameters": template_parameters_json(&object.spec.template_parameters),
        }))
    }
}

pub struct ClusterAdapter;

impl EntityAdapter for ClusterAdapter {
    type Object = Cluster;

    const GVR: GroupVersionResource = crate::kube::CLUSTERS;
    const NAME_PREFIX: &'static str = "cluster-";
    const NAME: &'static str = "cluster";

    fn state(object: &Cluster) -> ResourceState {
        object.status.state
    }

    fn set_state(object: &mut Cluster, state: ResourceState) {
        object.status.state = state;
    }

    fn conditions_mut(object: &mut Cluster) -> &mut Vec<Condition> {
        &mut object.status.conditions
    }

    fn hub(object: &Cluster) -> &str {
        &object.status.hub
    }

    fn set_hub(object: &mut Cluster, hub: String) {
        object.status.hub = hub;
    }

    fn native_spec(object: &Cluster) -> Result<serde_json::Value, ControllerError> {
        let node_sets = object
            .spec
            .node_sets
            .iter()
            .map(|(key, node_set)| {
                (
                    key.clone(),
                    serde_json::json!({
                        "hostClass": node_set.host_class,
                        "size": node_set.size,
                    }),
                )
            })
            .collect::<serde_json::Map<_, _>>();
        Ok(serde_json::json!({
            "templateID": object.spec.template,
            "templateParameters": template_parameters_json(&object.spec.template_parameters),
            "nodeSets": node_sets,
        }))
    }
}

fn template_parameters_json(
    parameters: &std::collections::BTreeMap<String, foundry_api::TypedValue>,
) -> serde_json::Value {
    let map = parameters
        .iter()
        .map(|(name, value)| (name.clone(), value.value.clone()))
        .collect::<serde_json::Map<_, _>>();
    serde_json::Value::Object(map)
}

/// Defaults applied before anything else looks at the object: the state
/// becomes progressing when unspecified, and every known condition type is
/// present with a false status. This runs even for objects that turn out to
/// be terminal.
pub fn set_defaults<A: EntityAdapter>(object: &mut A::Object) {
    if A::state(object) == ResourceState::Unspecified {
        A::set_state(object, ResourceState::Progressing);
    }
    let conditions = A::conditions_mut(object);
    for condition_type in ConditionType::ALL {
        if !conditions.iter().any(|c| c.r#type == condition_type) {
            conditions.push(Condition::unset(condition_type));
        }
    }
}

pub struct ForwardReconciler<A: EntityAdapter> {
    dao: Arc<GenericDao<A::Object>>,
    hubs_dao: Arc<GenericDao<Hub>>,
    manager: TxManager,
    hub_cache: HubCache,
    _marker: PhantomData<fn() -> A>,
}

impl<A: EntityAdapter> ForwardReconciler<A> {
    pub fn new(
        dao: Arc<GenericDao<A::Object>>,
        hubs_dao: Arc<GenericDao<Hub>>,
        manager: TxManager,
        hub_cache: HubCache,
    ) -> Self {
        Self {
            dao,
            hubs_dao,
            manager,
            hub_cache,
            _marker: PhantomData,
        }
    }

    pub async fn reconcile(&self, id: &str) -> ReconcileResult {
        let ctx = CallContext::background();
        let started = self.manager.begin(&ctx).await.map_err(ControllerError::from)?;
        let fetched = self.dao.get(&ctx, id).await;
        self.manager
            .end(&ctx, started, fetched.is_err())
            .await
            .map_err(ControllerError::from)?;
        let Some(mut object) = fetched.map_err(ControllerError::from)? else {
            return Ok(None);
        };

        if object.metadata().pending_deletion() {
            self.delete_native(&object).await?;
        } else {
            self.apply(&mut object).await?;
        }

        self.save(&object).await?;
        Ok(None)
    }

    async fn apply(&self, object: &mut A::Object) -> Result<(), ControllerError> {
        set_defaults::<A>(object);

        if A::state(object) != ResourceState::Progressing {
            return Ok(());
        }

        let hub_id = self.select_hub(object).await?;
        A::set_hub(object, hub_id.clone());
        let entry = self.hub_cache.get(&hub_id).await?;

        let spec = A::native_spec(object)?;
        match self.find_native(&entry, object.id()).await? {
            None => {
                let body = serde_json::json!({
                    "apiVersion": format!("{}/{}", A::GVR.group, A::GVR.version),
                    "kind": A::GVR.kind,
                    "metadata": {
                        "generateName": A::NAME_PREFIX,
                        "labels": { uuid_label(A::Object::KIND): object.id() },
                    },
                    "spec": spec,
                });
                let created = entry
                    .client
                    .create(&A::GVR, &entry.namespace, &body)
                    .await?;
                tracing::debug!(
                    namespace = %entry.namespace,
                    name = %native_name(&created),
                    kind = A::GVR.kind,
                    "created native object"
                );
            }
            Some(native) => {
                // Repeated reconciliations of an unchanged object issue no
                // native writes at all.
                if native.get("spec") == Some(&spec) {
                    return Ok(());
                }
                let name = native_name(&native);
                let patch = serde_json::json!({ "spec": spec });
                entry
                    .client
                    .merge_patch(&A::GVR, &entry.namespace, &name, &patch)
                    .await?;
                tracing::debug!(
                    namespace = %entry.namespace,
                    name = %name,
                    kind = A::GVR.kind,
                    "patched native object"
                );
            }
        }
        Ok(())
    }

    /// The hub pinned in the status wins; otherwise one is picked uniformly
    /// at random from the live hubs and pinned by the caller.
    async fn select_hub(&self, object: &A::Object) -> Result<String, ControllerError> {
        let pinned = A::hub(object);
        if !pinned.is_empty() {
            return Ok(pinned.to_string());
        }

        let ctx = CallContext::background();
        let started = self.manager.begin(&ctx).await.map_err(ControllerError::from)?;
        let listed = self.hubs_dao.list(&ctx, &ListRequest::default()).await;
        self.manager
            .end(&ctx, started, listed.is_err())
            .await
            .map_err(ControllerError::from)?;
        let hubs = listed.map_err(ControllerError::from)?.items;
        if hubs.is_empty() {
            return Err(ControllerError::Missing("there are no hubs".to_string()));
        }
        let index = rand::thread_rng().gen_range(0..hubs.len());
        let hub_id = hubs[index].id.clone();
        tracing::debug!(hub = %hub_id, "selected hub");
        Ok(hub_id)
    }

    async fn find_native(
        &self,
        entry: &HubEntry,
        id: &str,
    ) -> Result<Option<serde_json::Value>, ControllerError> {
        let selector = format!("{}={}", uuid_label(A::Object::KIND), id);
        let items = entry
            .client
            .list_by_selector(&A::GVR, &entry.namespace, &selector)
            .await?;
        if items.len() > 1 {
            return Err(ControllerError::Missing(format!(
                "expected at most one {} with identifier '{}' but found {}",
                A::NAME,
                id,
                items.len()
            )));
        }
        Ok(items.into_iter().next())
    }

    async fn delete_native(&self, object: &A::Object) -> Result<(), ControllerError> {
        // Nothing to clean up when no hub was ever bound.
        let hub_id = A::hub(object);
        if hub_id.is_empty() {
            return Ok(());
        }
        let entry = self.hub_cache.get(hub_id).await?;

        let Some(native) = self.find_native(&entry, object.id()).await? else {
            tracing::debug!(id = %object.id(), kind = A::GVR.kind, "native object doesn't exist");
            return Ok(());
        };
        let name = native_name(&native);
        if name.is_empty() {
            return Ok(());
        }
        entry.client.delete(&A::GVR, &entry.namespace, &name).await?;
        tracing::debug!(
            namespace = %entry.namespace,
            name = %name,
            kind = A::GVR.kind,
            "deleted native object"
        );
        Ok(())
    }

    async fn save(&self, object: &A::Object) -> Result<(), ControllerError> {
        let ctx = CallContext::background();
        let started = self.manager.begin(&ctx).await.map_err(ControllerError::from)?;
        let result = self.dao.update(&ctx, object).await;
        self.manager
            .end(&ctx, started, result.is_err())
            .await
            .map_err(ControllerError::from)?;
        match result {
            Ok(_) => Ok(()),
            // The object was archived while we were reconciling it.
            Err(StoreError::NoRows) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

pub fn native_name(native: &serde_json::Value) -> String {
    native
        .get("metadata")
        .and_then(|metadata| metadata.get("name"))
        .and_then(|name| name.as_str())
        .unwrap_or_default()
        .to_string()
}

/// Identifier carried by the native object's uuid label, when present.
pub fn native_entity_id(native: &serde_json::Value, label: &str) -> Option<String> {
    native
        .get("metadata")
        .and_then(|metadata| metadata.get("labels"))
        .and_then(|labels| labels.get(label))
        .and_then(|value| value.as_str())
        .map(|value| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use foundry_api::TypedValue;

    #[test]
    fn defaults_initialize_state_and_conditions() {
        let mut vm = VirtualMachine::default();
        set_defaults::<VirtualMachineAdapter>(&mut vm);
        assert_eq!(vm.status.state, ResourceState::Progressing);
        assert_eq!(vm.status.conditions.len(), ConditionType::ALL.len());
        assert!(vm
            .status
            .conditions
            .iter()
            .all(|c| c.status == foundry_api::ConditionStatus::False));
    }

    #[test]
    fn defaults_apply_even_for_terminal_objects() {
        let mut vm = VirtualMachine::default();
        vm.status.state = ResourceState::Failed;
        set_defaults::<VirtualMachineAdapter>(&mut vm);
        assert_eq!(vm.status.state, ResourceState::Failed);
        assert_eq!(vm.status.conditions.len(), ConditionType::ALL.len());
    }

    #[test]
    fn defaults_do_not_duplicate_existing_conditions() {
        let mut vm = VirtualMachine::default();
        vm.status.conditions.push(Condition::unset(ConditionType::Ready));
        set_defaults::<VirtualMachineAdapter>(&mut vm);
        let ready = vm
            .status
            .conditions
            .iter()
            .filter(|c| c.r#type == ConditionType::Ready)
            .count();
        assert_eq!(ready, 1);
    }

    #[test]
    fn vm_native_spec_carries_template_and_parameters() {
        let mut vm = VirtualMachine::default();
        vm.spec.template = "t1".to_string();
        vm.spec
            .template_parameters
            .insert("cpu".to_string(), TypedValue::int32(4));

        let spec = VirtualMachineAdapter::native_spec(&vm).expect("spec should build");
        assert_eq!(spec["templateID"], "t1");
        assert_eq!(spec["templateParameters"]["cpu"], 4);
    }

    #[test]
    fn cluster_native_spec_carries_node_sets() {
        let mut cluster = Cluster::default();
        cluster.spec.template = "t1".to_string();
        cluster.spec.node_sets.insert(
            "worker".to_string(),
            foundry_api::private::ClusterNodeSet {
                host_class: "standard".to_string(),
                size: 3,
            },
        );

        let spec = ClusterAdapter::native_spec(&cluster).expect("spec should build");
        assert_eq!(spec["nodeSets"]["worker"]["hostClass"], "standard");
        assert_eq!(spec["nodeSets"]["worker"]["size"], 3);
    }

    #[test]
    fn adapter_names_are_human_readable() {
        assert_eq!(VirtualMachineAdapter::NAME, "virtual machine");
        assert_eq!(ClusterAdapter::NAME, "cluster");
    }

    #[test]
    fn native_helpers_read_metadata() {
        let native = serde_json::json!({
            "metadata": {
                "name": "vm-abc12",
                "labels": { "foundry.dev/virtual-machine-uuid": "vm1" },
            }
        });
        assert_eq!(native_name(&native), "vm-abc12");
        assert_eq!(
            native_entity_id(&native, "foundry.dev/virtual-machine-uuid").as_deref(),
            Some("vm1")
        );
        assert!(native_entity_id(&native, "foundry.dev/cluster-uuid").is_none());
    }
}
