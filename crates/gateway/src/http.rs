//! HTTP surface: gRPC-shaped routes (`POST /<package>.<Service>/<Method>`)
//! with JSON bodies, served with axum. Authentication and the authorization
//! gate run before any service method; watch methods answer with a
//! newline-delimited JSON event stream.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::{Body, Bytes};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use foundry_api::rpc::Status;
use foundry_api::{private, public, Object, WatchEvent};
use foundry_auth::logic::{DefaultAttributionLogic, DefaultTenancyLogic};
use foundry_auth::policy::PolicyClient;
use foundry_auth::Authenticator;
use foundry_store::dao::GenericDao;
use foundry_store::{CallContext, Notifier, NotifyCallback, TxManager};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::config::{GatewayConfig, StartupError};
use crate::metrics;
use crate::server::GenericServer;
use crate::services::{
    EntityApi, PrivateClustersService, PrivateService, PrivateVirtualMachinesService,
    PublicService,
};

#[derive(Clone)]
pub struct AppState {
    authenticator: Arc<Authenticator>,
    policy: PolicyClient,
    notifier: Notifier,
}

impl AppState {
    /// Authenticates the call and evaluates the method-level policy. Public
    /// methods bypass the policy gate.
    pub async fn authorize(
        &self,
        headers: &HeaderMap,
        method: &str,
    ) -> Result<CallContext, Status> {
        let subject = self
            .authenticator
            .authenticate(headers, method)
            .map_err(|err| Status::unauthenticated(err.message))?;

        if !self.authenticator.is_public_method(method) {
            let allowed = self
                .policy
                .evaluate(method, &subject.user)
                .await
                .map_err(|err| {
                    tracing::error!(method = %method, error = %err, "policy evaluation failed");
                    Status::internal("policy evaluation failed")
                })?;
            if !allowed {
                return Err(Status::permission_denied(format!(
                    "subject '{}' is not allowed to call '{}'",
                    subject.user, method
                )));
            }
        }

        Ok(CallContext::new(Some(subject)))
    }
}

pub async fn router(config: GatewayConfig) -> Result<Router, StartupError> {
    let manager = TxManager::connect(&config.db_url, config.db_max_connections)
        .await
        .map_err(|_| StartupError {
            code: "ERR_DB_UNAVAILABLE",
            message: "failed to initialize database pool".to_string(),
        })?;
    foundry_store::migrate(manager.pool())
        .await
        .map_err(|err| StartupError {
            code: "ERR_DB_MIGRATION",
            message: format!("failed to apply migrations: {}", err),
        })?;

    let notifier = Notifier::new();
    {
        let notifier = notifier.clone();
        let pool = manager.pool().clone();
        tokio::spawn(async move {
            if let Err(err) = notifier.run(pool).await {
                tracing::error!(error = %err, "notification listener terminated");
            }
        });
    }

    let authenticator =
        Arc::new(
            Authenticator::new(&config.public_methods).map_err(|err| StartupError {
                code: "ERR_INVALID_CONFIG",
                message: err.message,
            })?,
        );
    let policy = PolicyClient::new(
        config.policy_url.clone(),
        Duration::from_millis(config.policy_timeout_ms),
    )
    .map_err(|_| StartupError {
        code: "ERR_POLICY_UNAVAILABLE",
        message: "failed to initialize policy client".to_string(),
    })?;

    let state = AppState {
        authenticator,
        policy,
        notifier: notifier.clone(),
    };

    fn build_dao<O: Object>(table: &str) -> Result<Arc<GenericDao<O>>, StartupError> {
        GenericDao::<O>::builder()
            .table(table)
            .event_callback(Arc::new(NotifyCallback))
            .attribution(Arc::new(DefaultAttributionLogic))
            .tenancy(Arc::new(DefaultTenancyLogic))
            .build()
            .map(Arc::new)
            .map_err(|err| StartupError {
                code: "ERR_INIT",
                message: format!("failed to build data access for table {}: {}", table, err),
            })
    }

    let cluster_templates_dao = build_dao::<private::ClusterTemplate>("cluster_templates")?;
    let vm_templates_dao =
        build_dao::<private::VirtualMachineTemplate>("virtual_machine_templates")?;
    let clusters_dao = build_dao::<private::Cluster>("clusters")?;
    let vms_dao = build_dao::<private::VirtualMachine>("virtual_machines")?;
    let hubs_dao = build_dao::<private::Hub>("hubs")?;
    let host_classes_dao = build_dao::<private::HostClass>("host_classes")?;
    let cluster_orders_dao = build_dao::<private::ClusterOrder>("cluster_orders")?;

    let private_clusters = Arc::new(PrivateClustersService::new(
        GenericServer::new(clusters_dao, manager.clone(), notifier.clone()),
        cluster_templates_dao.clone(),
    ));
    let private_cluster_templates = Arc::new(PrivateService::new(GenericServer::new(
        cluster_templates_dao,
        manager.clone(),
        notifier.clone(),
    )));
    let private_vms = Arc::new(PrivateVirtualMachinesService::new(
        GenericServer::new(vms_dao, manager.clone(), notifier.clone()),
        vm_templates_dao.clone(),
    ));
    let private_vm_templates = Arc::new(PrivateService::new(GenericServer::new(
        vm_templates_dao,
        manager.clone(),
        notifier.clone(),
    )));
    let private_hubs = Arc::new(PrivateService::new(GenericServer::new(
        hubs_dao,
        manager.clone(),
        notifier.clone(),
    )));
    let private_host_classes = Arc::new(PrivateService::new(GenericServer::new(
        host_classes_dao,
        manager.clone(),
        notifier.clone(),
    )));
    let private_cluster_orders = Arc::new(PrivateService::new(GenericServer::new(
        cluster_orders_dao,
        manager.clone(),
        notifier.clone(),
    )));

    let public_clusters = Arc::new(PublicService::<public::Cluster, _>::new(
        private_clusters.clone(),
        manager.clone(),
    ));
    let public_cluster_templates = Arc::new(PublicService::<public::ClusterTemplate, _>::new(
        private_cluster_templates.clone(),
        manager.clone(),
    ));
    let public_vms = Arc::new(PublicService::<public::VirtualMachine, _>::new(
        private_vms.clone(),
        manager.clone(),
    ));
    let public_vm_templates = Arc::new(PublicService::<public::VirtualMachineTemplate, _>::new(
        private_vm_templates.clone(),
        manager.clone(),
    ));
    let public_hubs = Arc::new(PublicService::<public::Hub, _>::new(
        private_hubs.clone(),
        manager.clone(),
    ));
    let public_host_classes = Arc::new(PublicService::<public::HostClass, _>::new(
        private_host_classes.clone(),
        manager.clone(),
    ));
    let public_cluster_orders = Arc::new(PublicService::<public::ClusterOrder, _>::new(
        private_cluster_orders.clone(),
        manager.clone(),
    ));

    let mut router = Router::new().route("/healthz", get(healthz)).route(
        "/metrics",
        get({
            let state = state.clone();
            move || metrics_endpoint(state.clone())
        }),
    );

    router = mount_service(router, &state, "fulfillment.v1.Clusters", public_clusters);
    router = mount_service(router, &state, "private.v1.Clusters", private_clusters);
    router = mount_service(
        router,
        &state,
        "fulfillment.v1.ClusterTemplates",
        public_cluster_templates,
    );
    router = mount_service(
        router,
        &state,
        "private.v1.ClusterTemplates",
        private_cluster_templates,
    );
    router = mount_service(router, &state, "fulfillment.v1.VirtualMachines", public_vms);
    router = mount_service(router, &state, "private.v1.VirtualMachines", private_vms);
    router = mount_service(
        router,
        &state,
        "fulfillment.v1.VirtualMachineTemplates",
        public_vm_templates,
    );
    router = mount_service(
        router,
        &state,
        "private.v1.VirtualMachineTemplates",
        private_vm_templates,
    );
    router = mount_service(router, &state, "fulfillment.v1.Hubs", public_hubs);
    router = mount_service(router, &state, "private.v1.Hubs", private_hubs);
    router = mount_service(
        router,
        &state,
        "fulfillment.v1.HostClasses",
        public_host_classes,
    );
    router = mount_service(router, &state, "private.v1.HostClasses", private_host_classes);
    router = mount_service(
        router,
        &state,
        "fulfillment.v1.ClusterOrders",
        public_cluster_orders,
    );
    router = mount_service(
        router,
        &state,
        "private.v1.ClusterOrders",
        private_cluster_orders,
    );

    Ok(router)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn metrics_endpoint(state: AppState) -> Response {
    metrics::set_notifications_dropped(state.notifier.dropped());
    match metrics::render() {
        Ok((body, content_type)) => {
            ([(header::CONTENT_TYPE, content_type)], body).into_response()
        }
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

fn mount_service<S: EntityApi>(
    mut router: Router,
    state: &AppState,
    service_name: &str,
    service: Arc<S>,
) -> Router {
    let list_path = format!("/{}/List", service_name);
    router = router.route(&list_path.clone(), {
        let state = state.clone();
        let service = service.clone();
        post(move |headers: HeaderMap, body: Bytes| async move {
            let started = Instant::now();
            let result = async {
                let request = parse_request::<foundry_api::ListRequest>(&body)?;
                let ctx = state.authorize(&headers, &list_path).await?;
                service.list(&ctx, &request).await
            }
            .await;
            respond(&list_path, started, result)
        })
    });

    let get_path = format!("/{}/Get", service_name);
    router = router.route(&get_path.clone(), {
        let state = state.clone();
        let service = service.clone();
        post(move |headers: HeaderMap, body: Bytes| async move {
            let started = Instant::now();
            let result = async {
                let request = parse_request::<foundry_api::GetRequest>(&body)?;
                let ctx = state.authorize(&headers, &get_path).await?;
                service.get(&ctx, &request).await
            }
            .await;
            respond(&get_path, started, result)
        })
    });

    let create_path = format!("/{}/Create", service_name);
    router = router.route(&create_path.clone(), {
        let state = state.clone();
        let service = service.clone();
        post(move |headers: HeaderMap, body: Bytes| async move {
            let started = Instant::now();
            let result = async {
                let request = parse_request::<foundry_api::CreateRequest<S::Object>>(&body)?;
                let ctx = state.authorize(&headers, &create_path).await?;
                service.create(&ctx, request).await
            }
            .await;
            respond(&create_path, started, result)
        })
    });

    let update_path = format!("/{}/Update", service_name);
    router = router.route(&update_path.clone(), {
        let state = state.clone();
        let service = service.clone();
        post(move |headers: HeaderMap, body: Bytes| async move {
            let started = Instant::now();
            let result = async {
                let request = parse_request::<foundry_api::UpdateRequest<S::Object>>(&body)?;
                let ctx = state.authorize(&headers, &update_path).await?;
                service.update(&ctx, request).await
            }
            .await;
            respond(&update_path, started, result)
        })
    });

    let delete_path = format!("/{}/Delete", service_name);
    router = router.route(&delete_path.clone(), {
        let state = state.clone();
        let service = service.clone();
        post(move |headers: HeaderMap, body: Bytes| async move {
            let started = Instant::now();
            let result = async {
                let request = parse_request::<foundry_api::DeleteRequest>(&body)?;
                let ctx = state.authorize(&headers, &delete_path).await?;
                service.delete(&ctx, &request).await
            }
            .await;
            respond(&delete_path, started, result)
        })
    });

    let watch_path = format!("/{}/Watch", service_name);
    router = router.route(&watch_path.clone(), {
        let state = state.clone();
        let service = service.clone();
        post(move |headers: HeaderMap, body: Bytes| async move {
            let started = Instant::now();
            let result = async {
                let request = parse_request::<foundry_api::WatchRequest>(&body)?;
                let ctx = state.authorize(&headers, &watch_path).await?;
                service.watch(&ctx, &request).await
            }
            .await;
            match result {
                Ok(events) => {
                    metrics::observe_rpc_request(&watch_path, "OK", started.elapsed());
                    ndjson_response(events)
                }
                Err(status) => error_response(&watch_path, started, status),
            }
        })
    });

    router
}

fn parse_request<T: DeserializeOwned + Default>(body: &[u8]) -> Result<T, Status> {
    if body.is_empty() {
        return Ok(T::default());
    }
    serde_json::from_slice(body)
        .map_err(|err| Status::invalid_argument(format!("invalid request body: {}", err)))
}

fn respond<T: Serialize>(method: &str, started: Instant, result: Result<T, Status>) -> Response {
    match result {
        Ok(value) => {
            metrics::observe_rpc_request(method, "OK", started.elapsed());
            (StatusCode::OK, Json(value)).into_response()
        }
        Err(status) => error_response(method, started, status),
    }
}

fn error_response(method: &str, started: Instant, status: Status) -> Response {
    metrics::observe_rpc_request(method, status.code.as_str(), started.elapsed());
    let http_status = StatusCode::from_u16(status.code.http_status())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (http_status, Json(status)).into_response()
}

fn ndjson_response<O: Serialize + Send + 'static>(
    events: mpsc::Receiver<WatchEvent<O>>,
) -> Response {
    let stream = futures::stream::unfold(events, |mut events| async move {
        let event = events.recv().await?;
        let mut line = serde_json::to_vec(&event).unwrap_or_else(|_| b"{}".to_vec());
        line.push(b'\n');
        Some((Ok::<Vec<u8>, std::convert::Infallible>(line), events))
    });
    match Response::builder()
        .header(header::CONTENT_TYPE, "application/x-ndjson")
        .body(Body::from_stream(stream))
    {
        Ok(response) => response,
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}
