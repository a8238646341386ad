use std::sync::Arc;
use std::time::Duration;

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use foundry_api::private::{Cluster, ClusterOrder, Hub, VirtualMachine};
use foundry_api::{EventKind, Object};
use foundry_controller::config::{ControllerConfig, StartupError};
use foundry_controller::feedback::FeedbackReconciler;
use foundry_controller::forward::{ClusterAdapter, ForwardReconciler, VirtualMachineAdapter};
use foundry_controller::hub_cache::HubCache;
use foundry_controller::metrics;
use foundry_controller::webhook::{OrderWebhookReconciler, WebhookClient};
use foundry_controller::workqueue::WorkQueue;
use foundry_store::dao::{GenericDao, ListRequest};
use foundry_store::{CallContext, Notifier, NotifyCallback, TxManager};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = match ControllerConfig::load() {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("STARTUP_ERROR {}", err);
            std::process::exit(1);
        }
    };

    if let Err(err) = run(config).await {
        eprintln!("STARTUP_ERROR {}", err);
        std::process::exit(1);
    }
}

async fn run(config: ControllerConfig) -> Result<(), StartupError> {
    let manager = TxManager::connect(&config.db_url, config.db_max_connections)
        .await
        .map_err(|_| StartupError {
            code: "ERR_DB_UNAVAILABLE",
            message: "failed to initialize database pool".to_string(),
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

    let vms_dao = build_dao::<VirtualMachine>("virtual_machines")?;
    let clusters_dao = build_dao::<Cluster>("clusters")?;
    let hubs_dao = build_dao::<Hub>("hubs")?;
    let orders_dao = build_dao::<ClusterOrder>("cluster_orders")?;

    let hub_cache = HubCache::new(manager.clone(), hubs_dao.clone());
    {
        // Hub deletions invalidate cached clients.
        let hub_cache = hub_cache.clone();
        let mut deletions = notifier.subscribe("hubs", &[EventKind::Deleted], 64);
        tokio::spawn(async move {
            while let Some(notification) = deletions.recv().await {
                hub_cache.evict(&notification.id).await;
            }
        });
    }

    let vm_forward = Arc::new(ForwardReconciler::<VirtualMachineAdapter>::new(
        vms_dao.clone(),
        hubs_dao.clone(),
        manager.clone(),
        hub_cache.clone(),
    ));
    let cluster_forward = Arc::new(ForwardReconciler::<ClusterAdapter>::new(
        clusters_dao.clone(),
        hubs_dao.clone(),
        manager.clone(),
        hub_cache.clone(),
    ));
    let webhook = Arc::new(
        WebhookClient::new(Duration::from_millis(config.webhook_min_interval_ms)).map_err(
            |err| StartupError {
                code: "ERR_INIT",
                message: format!("failed to build webhook client: {}", err),
            },
        )?,
    );
    let order_webhooks = Arc::new(OrderWebhookReconciler::new(
        orders_dao.clone(),
        manager.clone(),
        webhook,
        config.order_create_webhook_url.clone(),
        config.order_delete_webhook_url.clone(),
    ));

    let vm_queue = WorkQueue::new();
    let cluster_queue = WorkQueue::new();
    let order_queue = WorkQueue::new();

    {
        let queue = vm_queue.clone();
        let reconciler = vm_forward.clone();
        let workers = config.workers;
        tokio::spawn(async move {
            queue
                .run(workers, move |id: String| {
                    let reconciler = reconciler.clone();
                    async move {
                        let result = reconciler.reconcile(&id).await;
                        observe("virtual_machine_forward", result.is_ok());
                        result
                    }
                })
                .await;
        });
    }
    {
        let queue = cluster_queue.clone();
        let reconciler = cluster_forward.clone();
        let workers = config.workers;
        tokio::spawn(async move {
            queue
                .run(workers, move |id: String| {
                    let reconciler = reconciler.clone();
                    async move {
                        let result = reconciler.reconcile(&id).await;
                        observe("cluster_forward", result.is_ok());
                        result
                    }
                })
                .await;
        });
    }
    {
        let queue = order_queue.clone();
        let reconciler = order_webhooks.clone();
        let workers = config.workers;
        tokio::spawn(async move {
            queue
                .run(workers, move |id: String| {
                    let reconciler = reconciler.clone();
                    async move {
                        let result = reconciler.reconcile(&id).await;
                        observe("cluster_order_webhook", result.is_ok());
                        result
                    }
                })
                .await;
        });
    }

    pump(&notifier, "virtual_machines", vm_queue.clone());
    pump(&notifier, "clusters", cluster_queue.clone());
    pump(&notifier, "cluster_orders", order_queue.clone());

    {
        // Periodic resync keeps the queues warm even when a notification
        // was dropped.
        let manager = manager.clone();
        let vms_dao = vms_dao.clone();
        let clusters_dao = clusters_dao.clone();
        let orders_dao = orders_dao.clone();
        let vm_queue = vm_queue.clone();
        let cluster_queue = cluster_queue.clone();
        let order_queue = order_queue.clone();
        let interval = Duration::from_millis(config.resync_interval_ms);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                for id in list_ids(&manager, &vms_dao).await {
                    vm_queue.add(&id);
                }
                for id in list_ids(&manager, &clusters_dao).await {
                    cluster_queue.add(&id);
                }
                for id in list_ids(&manager, &orders_dao).await {
                    order_queue.add(&id);
                }
            }
        });
    }

    let vm_feedback = FeedbackReconciler::<VirtualMachineAdapter>::new(
        vms_dao.clone(),
        hubs_dao.clone(),
        manager.clone(),
        hub_cache.clone(),
    );
    let cluster_feedback = FeedbackReconciler::<ClusterAdapter>::new(
        clusters_dao.clone(),
        hubs_dao.clone(),
        manager.clone(),
        hub_cache.clone(),
    );
    {
        let interval = Duration::from_millis(config.feedback_poll_interval_ms);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                vm_feedback.scan().await;
                cluster_feedback.scan().await;
            }
        });
    }

    let app = Router::new().route("/healthz", get(healthz)).route(
        "/metrics",
        get({
            let notifier = notifier.clone();
            move || metrics_endpoint(notifier.clone())
        }),
    );
    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .map_err(|_| StartupError {
            code: "ERR_BIND_FAILED",
            message: "failed to bind controller listener".to_string(),
        })?;

    tracing::info!(bind_addr = %config.bind_addr, "foundry-controller running");

    axum::serve(listener, app).await.map_err(|err| StartupError {
        code: "ERR_SERVER_FAILED",
        message: err.to_string(),
    })
}

fn build_dao<O: Object>(table: &str) -> Result<Arc<GenericDao<O>>, StartupError> {
    GenericDao::<O>::builder()
        .table(table)
        .event_callback(Arc::new(NotifyCallback))
        .build()
        .map(Arc::new)
        .map_err(|err| StartupError {
            code: "ERR_INIT",
            message: format!("failed to build data access for table {}: {}", table, err),
        })
}

fn pump(notifier: &Notifier, table: &str, queue: WorkQueue) {
    let mut subscription = notifier.subscribe(table, &[], 256);
    tokio::spawn(async move {
        while let Some(notification) = subscription.recv().await {
            queue.add(&notification.id);
        }
    });
}

async fn list_ids<O: Object>(manager: &TxManager, dao: &GenericDao<O>) -> Vec<String> {
    let ctx = CallContext::background();
    let started = match manager.begin(&ctx).await {
        Ok(started) => started,
        Err(err) => {
            tracing::warn!(table = %dao.table(), error = %err, "resync begin failed");
            return Vec::new();
        }
    };
    let result = dao
        .list(
            &ctx,
            &ListRequest {
                limit: 1000,
                ..ListRequest::default()
            },
        )
        .await;
    let _ = manager.end(&ctx, started, result.is_err()).await;
    match result {
        Ok(response) => response
            .items
            .iter()
            .map(|item| item.id().to_string())
            .collect(),
        Err(err) => {
            tracing::warn!(table = %dao.table(), error = %err, "resync list failed");
            Vec::new()
        }
    }
}

fn observe(controller: &str, ok: bool) {
    metrics::observe_reconcile(controller, if ok { "success" } else { "error" });
}

async fn healthz() -> &'static str {
    "ok"
}

async fn metrics_endpoint(notifier: Notifier) -> Response {
    metrics::set_notifications_dropped(notifier.dropped());
    match metrics::render() {
        Ok((body, content_type)) => ([(header::CONTENT_TYPE, content_type)], body).into_response(),
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}
