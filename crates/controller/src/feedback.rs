//! Feedback reconciliation: observed state of native objects in the hubs is
//! mirrored back onto the stored objects.

use std::marker::PhantomData;
use std::sync::Arc;

use chrono::Utc;
use foundry_api::private::Hub;
use foundry_api::{Condition, ConditionStatus, ConditionType, Object, ResourceState};
use foundry_store::dao::{GenericDao, ListRequest};
use foundry_store::{CallContext, TxManager};

use crate::forward::{native_entity_id, EntityAdapter};
use crate::hub_cache::HubCache;
use crate::kube::uuid_label;
use crate::ControllerError;

/// Maps a native condition type onto the internal one. Unknown conditions
/// are ignored.
pub fn map_condition_type(native_type: &str) -> Option<ConditionType> {
    match native_type {
        "Accepted" | "Progressing" | "Deleting" => Some(ConditionType::Progressing),
        "Available" => Some(ConditionType::Ready),
        _ => None,
    }
}

pub fn map_condition_status(native_status: &str) -> ConditionStatus {
    match native_status {
        "True" => ConditionStatus::True,
        "False" => ConditionStatus::False,
        _ => ConditionStatus::Unspecified,
    }
}

/// Maps a native phase onto the internal state. `Deleting` has no internal
/// counterpart and is a no-op; unknown phases are ignored.
pub fn map_phase(native_phase: &str) -> Option<ResourceState> {
    match native_phase {
        "Progressing" => Some(ResourceState::Progressing),
        "Failed" => Some(ResourceState::Failed),
        "Ready" => Some(ResourceState::Ready),
        _ => None,
    }
}

/// Applies the native object's conditions and phase onto the stored object.
/// The last-transition timestamp moves only when a condition status actually
/// changes, so repeated application of the same input is a no-op.
pub fn apply_native_status<A: EntityAdapter>(object: &mut A::Object, native: &serde_json::Value) {
    let conditions = native
        .get("status")
        .and_then(|status| status.get("conditions"))
        .and_then(|conditions| conditions.as_array())
        .cloned()
        .unwrap_or_default();
    for native_condition in &conditions {
        let native_type = native_condition
            .get("type")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        let Some(condition_type) = map_condition_type(native_type) else {
            tracing::debug!(condition = %native_type, "unknown condition, will ignore it");
            continue;
        };
        let new_status = map_condition_status(
            native_condition
                .get("status")
                .and_then(|v| v.as_str())
                .unwrap_or_default(),
        );
        let message = native_condition
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();

        let object_conditions = A::conditions_mut(object);
        let condition = match object_conditions
            .iter_mut()
            .find(|c| c.r#type == condition_type)
        {
            Some(condition) => condition,
            None => {
                object_conditions.push(Condition::unset(condition_type));
                object_conditions
                    .last_mut()
                    .expect("condition pushed above")
            }
        };
        let old_status = condition.status;
        condition.status = new_status;
        condition.message = message;
        if new_status != old_status {
            condition.last_transition_time = Some(Utc::now());
        }
    }

    let phase = native
        .get("status")
        .and_then(|status| status.get("phase"))
        .and_then(|v| v.as_str())
        .unwrap_or_default();
    if !phase.is_empty() {
        match map_phase(phase) {
            Some(state) => A::set_state(object, state),
            None => {
                if phase != "Deleting" {
                    tracing::debug!(phase = %phase, "unknown phase, will ignore it");
                }
            }
        }
    }
}

pub struct FeedbackReconciler<A: EntityAdapter> {
    dao: Arc<GenericDao<A::Object>>,
    hubs_dao: Arc<GenericDao<Hub>>,
    manager: TxManager,
    hub_cache: HubCache,
    _marker: PhantomData<fn() -> A>,
}

impl<A: EntityAdapter> FeedbackReconciler<A> {
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

    /// One pass over every hub: list the native objects that carry the
    /// entity-id label and mirror their status back. Per-hub failures are
    /// logged and do not stop the scan.
    pub async fn scan(&self) {
        let hubs = match self.list_hubs().await {
            Ok(hubs) => hubs,
            Err(err) => {
                tracing::warn!(error = %err, "failed to list hubs for feedback scan");
                return;
            }
        };

        let label = uuid_label(A::Object::KIND);
        for hub in hubs {
            if hub.metadata.pending_deletion() {
                continue;
            }
            let entry = match self.hub_cache.get(&hub.id).await {
                Ok(entry) => entry,
                Err(err) => {
                    tracing::warn!(hub = %hub.id, error = %err, "failed to resolve hub");
                    continue;
                }
            };
            let items = match entry
                .client
                .list_by_selector(&A::GVR, &entry.namespace, &label)
                .await
            {
                Ok(items) => items,
                Err(err) => {
                    tracing::warn!(hub = %hub.id, error = %err, "failed to list native objects");
                    continue;
                }
            };

            for native in items {
                let Some(id) = native_entity_id(&native, &label) else {
                    continue;
                };
                // An object going away on the hub side is handled by the
                // forward reconciler, not mirrored back.
                let being_deleted = native
                    .get("metadata")
                    .and_then(|metadata| metadata.get("deletionTimestamp"))
                    .is_some();
                if being_deleted {
                    continue;
                }
                if let Err(err) = self.reconcile_native(&id, &native).await {
                    tracing::warn!(id = %id, error = %err, "feedback reconciliation failed");
                }
            }
        }
    }

    pub async fn reconcile_native(
        &self,
        id: &str,
        native: &serde_json::Value,
    ) -> Result<(), ControllerError> {
        let ctx = CallContext::background();
        let started = self.manager.begin(&ctx).await.map_err(ControllerError::from)?;
        let result = self.reconcile_in_tx(&ctx, id, native).await;
        self.manager
            .end(&ctx, started, result.is_err())
            .await
            .map_err(ControllerError::from)?;
        result
    }

    async fn reconcile_in_tx(
        &self,
        ctx: &CallContext,
        id: &str,
        native: &serde_json::Value,
    ) -> Result<(), ControllerError> {
        let Some(mut object) = self.dao.get(ctx, id).await? else {
            return Ok(());
        };
        if object.metadata().pending_deletion() {
            return Ok(());
        }

        let before = object.clone();
        apply_native_status::<A>(&mut object, native);

        // Only write when something actually changed.
        if !object.equivalent(&before) {
            self.dao.update(ctx, &object).await?;
        }
        Ok(())
    }

    async fn list_hubs(&self) -> Result<Vec<Hub>, ControllerError> {
        let ctx = CallContext::background();
        let started = self.manager.begin(&ctx).await.map_err(ControllerError::from)?;
        let result = self
            .hubs_dao
            .list(
                &ctx,
                &ListRequest {
                    limit: 1000,
                    ..ListRequest::default()
                },
            )
            .await;
        self.manager
            .end(&ctx, started, result.is_err())
            .await
            .map_err(ControllerError::from)?;
        Ok(result.map_err(ControllerError::from)?.items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forward::{set_defaults, VirtualMachineAdapter};
    use foundry_api::private::VirtualMachine;

    fn ready_native() -> serde_json::Value {
        serde_json::json!({
            "metadata": {
                "name": "vm-abc12",
                "labels": { "foundry.dev/virtual-machine-uuid": "vm1" },
            },
            "status": {
                "phase": "Ready",
                "conditions": [
                    { "type": "Available", "status": "True", "message": "up" },
                    { "type": "Progressing", "status": "False", "message": "" },
                ],
            },
        })
    }

    #[test]
    fn conditions_and_phase_are_mirrored() {
        let mut vm = VirtualMachine::default();
        set_defaults::<VirtualMachineAdapter>(&mut vm);

        apply_native_status::<VirtualMachineAdapter>(&mut vm, &ready_native());

        assert_eq!(vm.status.state, ResourceState::Ready);
        let ready = vm
            .status
            .conditions
            .iter()
            .find(|c| c.r#type == ConditionType::Ready)
            .expect("ready condition should exist");
        assert_eq!(ready.status, ConditionStatus::True);
        assert_eq!(ready.message, "up");
        assert!(
            ready.last_transition_time.is_some(),
            "transition timestamp moves on a status change"
        );
    }

    #[test]
    fn repeated_application_is_a_no_op() {
        let mut vm = VirtualMachine::default();
        set_defaults::<VirtualMachineAdapter>(&mut vm);
        apply_native_status::<VirtualMachineAdapter>(&mut vm, &ready_native());

        let settled = vm.clone();
        apply_native_status::<VirtualMachineAdapter>(&mut vm, &ready_native());
        assert!(
            vm.equivalent(&settled),
            "unchanged input must not move timestamps or anything else"
        );
    }

    #[test]
    fn unknown_conditions_and_phases_are_ignored() {
        let mut vm = VirtualMachine::default();
        set_defaults::<VirtualMachineAdapter>(&mut vm);
        let before = vm.clone();

        let native = serde_json::json!({
            "status": {
                "phase": "Mystery",
                "conditions": [{ "type": "Exotic", "status": "True", "message": "?" }],
            },
        });
        apply_native_status::<VirtualMachineAdapter>(&mut vm, &native);
        assert!(vm.equivalent(&before));
    }

    #[test]
    fn deleting_phase_is_a_no_op() {
        let mut vm = VirtualMachine::default();
        set_defaults::<VirtualMachineAdapter>(&mut vm);
        let native = serde_json::json!({ "status": { "phase": "Deleting" } });
        apply_native_status::<VirtualMachineAdapter>(&mut vm, &native);
        assert_eq!(vm.status.state, ResourceState::Progressing);
    }

    #[test]
    fn condition_mappings() {
        assert_eq!(map_condition_type("Accepted"), Some(ConditionType::Progressing));
        assert_eq!(map_condition_type("Progressing"), Some(ConditionType::Progressing));
        assert_eq!(map_condition_type("Available"), Some(ConditionType::Ready));
        assert_eq!(map_condition_type("Deleting"), Some(ConditionType::Progressing));
        assert_eq!(map_condition_type("Degraded"), None);
        assert_eq!(map_condition_type("Nope"), None);

        assert_eq!(map_condition_status("True"), ConditionStatus::True);
        assert_eq!(map_condition_status("False"), ConditionStatus::False);
        assert_eq!(map_condition_status("Unknown"), ConditionStatus::Unspecified);

        assert_eq!(map_phase("Ready"), Some(ResourceState::Ready));
        assert_eq!(map_phase("Failed"), Some(ResourceState::Failed));
        assert_eq!(map_phase("Deleting"), None);
    }
}
