use std::sync::Arc;

use async_trait::async_trait;
use foundry_api::private::{VirtualMachine, VirtualMachineTemplate};
use foundry_api::rpc::Status;
use foundry_api::{
    CreateRequest, CreateResponse, DeleteRequest, DeleteResponse, GetRequest, GetResponse,
    ListRequest, ListResponse, UpdateRequest, UpdateResponse, WatchEvent, WatchRequest,
};
use foundry_store::dao::GenericDao;
use foundry_store::CallContext;
use tokio::sync::mpsc;

use crate::server::{store_status, validate_no_duplicate_conditions, GenericServer};
use crate::services::{required_object, typed_watch, EntityApi};
use crate::templates;

/// Private virtual machines service: validates the template reference and
/// parameters on create and update.
pub struct PrivateVirtualMachinesService {
    generic: GenericServer<VirtualMachine>,
    templates: Arc<GenericDao<VirtualMachineTemplate>>,
}

impl PrivateVirtualMachinesService {
    pub fn new(
        generic: GenericServer<VirtualMachine>,
        templates: Arc<GenericDao<VirtualMachineTemplate>>,
    ) -> Self {
        Self { generic, templates }
    }

    async fn validate_template(
        &self,
        ctx: &CallContext,
        vm: &mut VirtualMachine,
    ) -> Result<(), Status> {
        let template_id = vm.spec.template.clone();
        if template_id.is_empty() {
            return Err(Status::invalid_argument("template ID is mandatory"));
        }
        let template = self
            .templates
            .get(ctx, &template_id)
            .await
            .map_err(|err| {
                tracing::error!(template = %template_id, error = %err, "template retrieval failed");
                Status::internal(format!("failed to retrieve template '{}'", template_id))
            })?;
        let Some(template) = template else {
            return Err(Status::invalid_argument(format!(
                "template '{}' does not exist",
                template_id
            )));
        };

        templates::validate_template_parameters(
            &template_id,
            &template.parameters,
            &vm.spec.template_parameters,
        )?;
        vm.spec.template_parameters = templates::process_template_parameters_with_defaults(
            &template.parameters,
            &vm.spec.template_parameters,
        );
        Ok(())
    }
}

#[async_trait]
impl EntityApi for PrivateVirtualMachinesService {
    type Object = VirtualMachine;

    async fn list(
        &self,
        ctx: &CallContext,
        request: &ListRequest,
    ) -> Result<ListResponse<VirtualMachine>, Status> {
        self.generic.list(ctx, request).await
    }

    async fn get(
        &self,
        ctx: &CallContext,
        request: &GetRequest,
    ) -> Result<GetResponse<VirtualMachine>, Status> {
        self.generic.get(ctx, &request.id).await
    }

    async fn create(
        &self,
        ctx: &CallContext,
        request: CreateRequest<VirtualMachine>,
    ) -> Result<CreateResponse<VirtualMachine>, Status> {
        let vm = required_object(request.object)?;
        validate_no_duplicate_conditions(&vm.status.conditions)?;

        let created = self
            .generic
            .in_tx(ctx, || async {
                let mut vm = vm.clone();
                self.validate_template(ctx, &mut vm).await?;
                self.generic
                    .dao()
                    .create(ctx, &vm)
                    .await
                    .map_err(store_status)
            })
            .await?;
        Ok(CreateResponse { object: created })
    }

    async fn update(
        &self,
        ctx: &CallContext,
        request: UpdateRequest<VirtualMachine>,
    ) -> Result<UpdateResponse<VirtualMachine>, Status> {
        let vm = required_object(request.object)?;
        validate_no_duplicate_conditions(&vm.status.conditions)?;

        self.generic
            .in_tx(ctx, || async {
                let mut vm = vm.clone();
                self.validate_template(ctx, &mut vm).await?;
                self.generic
                    .update(ctx, &vm, request.update_mask.as_deref())
                    .await
            })
            .await
    }

    async fn delete(
        &self,
        ctx: &CallContext,
        request: &DeleteRequest,
    ) -> Result<DeleteResponse, Status> {
        self.generic.delete(ctx, &request.id).await
    }

    async fn watch(
        &self,
        _ctx: &CallContext,
        request: &WatchRequest,
    ) -> Result<mpsc::Receiver<WatchEvent<VirtualMachine>>, Status> {
        Ok(typed_watch(self.generic.watch(request)?))
    }
}
