use std::sync::Arc;

use async_trait::async_trait;
use foundry_api::private::{Cluster, ClusterTemplate};
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

/// Private clusters service: validates orders against their template before
/// handing them to the generic server.
pub struct PrivateClustersService {
    generic: GenericServer<Cluster>,
    templates: Arc<GenericDao<ClusterTemplate>>,
}

impl PrivateClustersService {
    pub fn new(generic: GenericServer<Cluster>, templates: Arc<GenericDao<ClusterTemplate>>) -> Self {
        Self { generic, templates }
    }

    /// Checks the template reference, node sets and parameters, and rewrites
    /// the spec with the effective node sets and defaulted parameters.
    async fn validate_and_transform(
        &self,
        ctx: &CallContext,
        cluster: &mut Cluster,
    ) -> Result<(), Status> {
        let template_id = cluster.spec.template.clone();
        if template_id.is_empty() {
            return Err(Status::invalid_argument("template is mandatory"));
        }
        let template = self
            .templates
            .get(ctx, &template_id)
            .await
            .map_err(|err| {
                tracing::error!(template = %template_id, error = %err, "failed to get template");
                Status::internal(format!("failed to get template '{}'", template_id))
            })?;
        let Some(template) = template else {
            return Err(Status::invalid_argument(format!(
                "template '{}' doesn't exist",
                template_id
            )));
        };
        if template.metadata.pending_deletion() {
            return Err(Status::invalid_argument(format!(
                "template '{}' has been deleted",
                template_id
            )));
        }

        templates::validate_cluster_node_sets(
            &template_id,
            &template.node_sets,
            &cluster.spec.node_sets,
        )?;
        cluster.spec.node_sets =
            templates::effective_node_sets(&template.node_sets, &cluster.spec.node_sets);

        templates::validate_template_parameters(
            &template_id,
            &template.parameters,
            &cluster.spec.template_parameters,
        )?;
        cluster.spec.template_parameters = templates::process_template_parameters_with_defaults(
            &template.parameters,
            &cluster.spec.template_parameters,
        );
        Ok(())
    }
}

#[async_trait]
impl EntityApi for PrivateClustersService {
    type Object = Cluster;

    async fn list(
        &self,
        ctx: &CallContext,
        request: &ListRequest,
    ) -> Result<ListResponse<Cluster>, Status> {
        self.generic.list(ctx, request).await
    }

    async fn get(
        &self,
        ctx: &CallContext,
        request: &GetRequest,
    ) -> Result<GetResponse<Cluster>, Status> {
        self.generic.get(ctx, &request.id).await
    }

    async fn create(
        &self,
        ctx: &CallContext,
        request: CreateRequest<Cluster>,
    ) -> Result<CreateResponse<Cluster>, Status> {
        let cluster = required_object(request.object)?;
        validate_no_duplicate_conditions(&cluster.status.conditions)?;

        // Validation reads the template in the same transaction as the
        // create, so a template deletion cannot slip in between.
        let created = self
            .generic
            .in_tx(ctx, || async {
                let mut cluster = cluster.clone();
                self.validate_and_transform(ctx, &mut cluster).await?;
                self.generic
                    .dao()
                    .create(ctx, &cluster)
                    .await
                    .map_err(store_status)
            })
            .await?;
        Ok(CreateResponse { object: created })
    }

    async fn update(
        &self,
        ctx: &CallContext,
        request: UpdateRequest<Cluster>,
    ) -> Result<UpdateResponse<Cluster>, Status> {
        let cluster = required_object(request.object)?;
        validate_no_duplicate_conditions(&cluster.status.conditions)?;
        self.generic
            .update(ctx, &cluster, request.update_mask.as_deref())
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
    ) -> Result<mpsc::Receiver<WatchEvent<Cluster>>, Status> {
        Ok(typed_watch(self.generic.watch(request)?))
    }
}
