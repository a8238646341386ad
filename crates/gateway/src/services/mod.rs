//! Entity services. Every entity exposes the same six methods on two
//! surfaces: the private service owns the authoritative objects, the public
//! service is a sanitized wrapper that maps between the schemas.

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use foundry_api::rpc::Status;
use foundry_api::{
    CreateRequest, CreateResponse, DeleteRequest, DeleteResponse, GetRequest, GetResponse,
    ListRequest, ListResponse, Object, UpdateRequest, UpdateResponse, WatchEvent, WatchRequest,
};
use foundry_store::{CallContext, TxManager};
use tokio::sync::mpsc;

use crate::mapper::GenericMapper;
use crate::server::{with_call_tx, GenericServer};

pub mod clusters;
pub mod virtual_machines;

pub use clusters::PrivateClustersService;
pub use virtual_machines::PrivateVirtualMachinesService;

/// Passthrough private services for the entities without extra validation.
pub type PrivateClusterTemplatesService =
    PrivateService<foundry_api::private::ClusterTemplate>;
pub type PrivateVirtualMachineTemplatesService =
    PrivateService<foundry_api::private::VirtualMachineTemplate>;
pub type PrivateHubsService = PrivateService<foundry_api::private::Hub>;
pub type PrivateHostClassesService = PrivateService<foundry_api::private::HostClass>;
pub type PrivateClusterOrdersService = PrivateService<foundry_api::private::ClusterOrder>;

#[async_trait]
pub trait EntityApi: Send + Sync + 'static {
    type Object: Object;

    async fn list(
        &self,
        ctx: &CallContext,
        request: &ListRequest,
    ) -> Result<ListResponse<Self::Object>, Status>;

    async fn get(
        &self,
        ctx: &CallContext,
        request: &GetRequest,
    ) -> Result<GetResponse<Self::Object>, Status>;

    async fn create(
        &self,
        ctx: &CallContext,
        request: CreateRequest<Self::Object>,
    ) -> Result<CreateResponse<Self::Object>, Status>;

    async fn update(
        &self,
        ctx: &CallContext,
        request: UpdateRequest<Self::Object>,
    ) -> Result<UpdateResponse<Self::Object>, Status>;

    async fn delete(
        &self,
        ctx: &CallContext,
        request: &DeleteRequest,
    ) -> Result<DeleteResponse, Status>;

    async fn watch(
        &self,
        ctx: &CallContext,
        request: &WatchRequest,
    ) -> Result<mpsc::Receiver<WatchEvent<Self::Object>>, Status>;
}

/// Private service without entity-specific validation: a thin shell over the
/// generic server.
pub struct PrivateService<O: Object> {
    generic: GenericServer<O>,
}

impl<O: Object> PrivateService<O> {
    pub fn new(generic: GenericServer<O>) -> Self {
        Self { generic }
    }
}

#[async_trait]
impl<O: Object> EntityApi for PrivateService<O> {
    type Object = O;

    async fn list(
        &self,
        ctx: &CallContext,
        request: &ListRequest,
    ) -> Result<ListResponse<O>, Status> {
        self.generic.list(ctx, request).await
    }

    async fn get(&self, ctx: &CallContext, request: &GetRequest) -> Result<GetResponse<O>, Status> {
        self.generic.get(ctx, &request.id).await
    }

    async fn create(
        &self,
        ctx: &CallContext,
        request: CreateRequest<O>,
    ) -> Result<CreateResponse<O>, Status> {
        let object = required_object(request.object)?;
        let created = self.generic.create(ctx, &object).await?;
        Ok(CreateResponse { object: created })
    }

    async fn update(
        &self,
        ctx: &CallContext,
        request: UpdateRequest<O>,
    ) -> Result<UpdateResponse<O>, Status> {
        let object = required_object(request.object)?;
        self.generic
            .update(ctx, &object, request.update_mask.as_deref())
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
    ) -> Result<mpsc::Receiver<WatchEvent<O>>, Status> {
        Ok(typed_watch(self.generic.watch(request)?))
    }
}

/// Adapts the generic server's JSON watch events to the typed surface.
pub(crate) fn typed_watch<O: Object>(
    mut events: mpsc::Receiver<WatchEvent<serde_json::Value>>,
) -> mpsc::Receiver<WatchEvent<O>> {
    let (tx, rx) = mpsc::channel(64);
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match serde_json::from_value::<O>(event.object) {
                Ok(object) => {
                    let event = WatchEvent {
                        r#type: event.r#type,
                        object,
                    };
                    if tx.send(event).await.is_err() {
                        return;
                    }
                }
                Err(err) => {
                    tracing::warn!(error = %err, "discarding undecodable watch event");
                }
            }
        }
    });
    rx
}

pub(crate) fn required_object<O>(object: Option<O>) -> Result<O, Status> {
    object.ok_or_else(|| Status::invalid_argument("object is mandatory"))
}

/// Public wrapper: sanitizes the internal schema on the way out and maps the
/// external schema strictly on the way in, delegating every operation to the
/// private service.
pub struct PublicService<P, S> {
    private: Arc<S>,
    tx: TxManager,
    _marker: PhantomData<fn() -> P>,
}

impl<P: Object, S: EntityApi> PublicService<P, S> {
    pub fn new(private: Arc<S>, tx: TxManager) -> Self {
        Self {
            private,
            tx,
            _marker: PhantomData,
        }
    }

    fn outbound(&self, from: &S::Object) -> Result<P, Status> {
        GenericMapper::lenient()
            .copy(from, &P::default())
            .map_err(|err| {
                tracing::error!(error = %err, "failed to map internal object to the public schema");
                Status::internal(format!("failed to process {}", kind_label::<P>()))
            })
    }

    fn inbound(&self, from: &P, onto: &S::Object) -> Result<S::Object, Status> {
        GenericMapper::strict().copy(from, onto).map_err(|err| {
            tracing::error!(error = %err, "failed to map public object to the internal schema");
            Status::internal(format!("failed to process {}", kind_label::<P>()))
        })
    }
}

fn kind_label<P: Object>() -> String {
    P::KIND.replace('_', " ")
}

#[async_trait]
impl<P: Object, S: EntityApi> EntityApi for PublicService<P, S> {
    type Object = P;

    async fn list(
        &self,
        ctx: &CallContext,
        request: &ListRequest,
    ) -> Result<ListResponse<P>, Status> {
        let response = self.private.list(ctx, request).await?;
        let mut items = Vec::with_capacity(response.items.len());
        for item in &response.items {
            items.push(self.outbound(item)?);
        }
        Ok(ListResponse {
            size: response.size,
            total: response.total,
            items,
        })
    }

    async fn get(&self, ctx: &CallContext, request: &GetRequest) -> Result<GetResponse<P>, Status> {
        let response = self.private.get(ctx, request).await?;
        Ok(GetResponse {
            object: self.outbound(&response.object)?,
        })
    }

    async fn create(
        &self,
        ctx: &CallContext,
        request: CreateRequest<P>,
    ) -> Result<CreateResponse<P>, Status> {
        let object = required_object(request.object)?;
        let private_object = self.inbound(&object, &S::Object::default())?;
        let response = self
            .private
            .create(
                ctx,
                CreateRequest {
                    object: Some(private_object),
                },
            )
            .await?;
        Ok(CreateResponse {
            object: self.outbound(&response.object)?,
        })
    }

    async fn update(
        &self,
        ctx: &CallContext,
        request: UpdateRequest<P>,
    ) -> Result<UpdateResponse<P>, Status> {
        let object = required_object(request.object)?;
        if object.id().is_empty() {
            return Err(Status::invalid_argument("object identifier is mandatory"));
        }

        // The whole read-merge-write runs in one transaction so the private
        // fields merged from the stored object cannot go stale.
        let response = with_call_tx(&self.tx, ctx, || async {
            let existing = self
                .private
                .get(
                    ctx,
                    &GetRequest {
                        id: object.id().to_string(),
                    },
                )
                .await?;
            let merged = self.inbound(&object, &existing.object)?;
            self.private
                .update(
                    ctx,
                    UpdateRequest {
                        object: Some(merged),
                        update_mask: request.update_mask.clone(),
                    },
                )
                .await
        })
        .await?;

        Ok(UpdateResponse {
            object: self.outbound(&response.object)?,
        })
    }

    async fn delete(
        &self,
        ctx: &CallContext,
        request: &DeleteRequest,
    ) -> Result<DeleteResponse, Status> {
        self.private.delete(ctx, request).await
    }

    async fn watch(
        &self,
        ctx: &CallContext,
        request: &WatchRequest,
    ) -> Result<mpsc::Receiver<WatchEvent<P>>, Status> {
        let mut events = self.private.watch(ctx, request).await?;
        let (tx, rx) = mpsc::channel(64);
        let mapper = GenericMapper::lenient();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match mapper.copy(&event.object, &P::default()) {
                    Ok(object) => {
                        let event = WatchEvent {
                            r#type: event.r#type,
                            object,
                        };
                        if tx.send(event).await.is_err() {
                            return;
                        }
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "discarding unmappable watch event");
                    }
                }
            }
        });
        Ok(rx)
    }
}
