//! Order webhook: fires an HTTP callback when a cluster order is created or
//! deleted. An in-flight cache keyed by object name suppresses re-fires
//! within the minimum interval; the remaining time drives the requeue.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use foundry_api::private::ClusterOrder;
use foundry_api::Object;
use foundry_store::dao::GenericDao;
use foundry_store::{CallContext, TxManager};

use crate::workqueue::ReconcileResult;
use crate::{metrics, ControllerError};

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

pub struct WebhookClient {
    http: reqwest::Client,
    minimum_interval: Duration,
    inflight: DashMap<String, Instant>,
}

impl WebhookClient {
    pub fn new(minimum_interval: Duration) -> Result<Self, ControllerError> {
        let http = reqwest::Client::builder()
            .timeout(WEBHOOK_TIMEOUT)
            .build()
            .map_err(|err| ControllerError::Webhook(format!("failed to build client: {}", err)))?;
        Ok(Self {
            http,
            minimum_interval,
            inflight: DashMap::new(),
        })
    }

    /// Posts the payload unless a call for the same name fired within the
    /// minimum interval; in that case returns the remaining wait.
    pub async fn trigger(
        &self,
        url: &str,
        name: &str,
        payload: &serde_json::Value,
    ) -> Result<Option<Duration>, ControllerError> {
        if let Some(remaining) = self.existing_delay(name) {
            tracing::info!(
                name = %name,
                remaining_ms = remaining.as_millis() as u64,
                "skip webhook, found in in-flight cache"
            );
            return Ok(Some(remaining));
        }

        tracing::info!(url = %url, name = %name, "trigger webhook");
        let resp = self
            .http
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .json(payload)
            .send()
            .await
            .map_err(|err| ControllerError::Webhook(format!("failed to send request: {}", err)))?;

        if !resp.status().is_success() {
            return Err(ControllerError::Webhook(format!(
                "received non-success status code: {}",
                resp.status().as_u16()
            )));
        }

        self.mark_inflight(name);
        Ok(None)
    }

    /// Remaining minimum-interval wait for the name, purging expired
    /// entries on the way.
    fn existing_delay(&self, name: &str) -> Option<Duration> {
        let delay = self.inflight.get(name).and_then(|entry| {
            let elapsed = entry.elapsed();
            if elapsed < self.minimum_interval {
                Some(self.minimum_interval - elapsed)
            } else {
                None
            }
        });
        self.purge_expired();
        delay
    }

    fn mark_inflight(&self, name: &str) {
        self.inflight.insert(name.to_string(), Instant::now());
        self.purge_expired();
    }

    fn purge_expired(&self) {
        let minimum_interval = self.minimum_interval;
        self.inflight
            .retain(|_, created| created.elapsed() <= minimum_interval);
    }
}

/// Fires the configured webhooks for cluster orders: the create hook while
/// the order is live, the delete hook once it is pending deletion.
pub struct OrderWebhookReconciler {
    dao: Arc<GenericDao<ClusterOrder>>,
    manager: TxManager,
    webhook: Arc<WebhookClient>,
    create_url: Option<String>,
    delete_url: Option<String>,
}

impl OrderWebhookReconciler {
    pub fn new(
        dao: Arc<GenericDao<ClusterOrder>>,
        manager: TxManager,
        webhook: Arc<WebhookClient>,
        create_url: Option<String>,
        delete_url: Option<String>,
    ) -> Self {
        Self {
            dao,
            manager,
            webhook,
            create_url,
            delete_url,
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
        let Some(order) = fetched.map_err(ControllerError::from)? else {
            return Ok(None);
        };

        let (url, event) = if order.metadata.pending_deletion() {
            (self.delete_url.as_deref(), "delete")
        } else {
            (self.create_url.as_deref(), "create")
        };
        let Some(url) = url else {
            return Ok(None);
        };

        let payload = serde_json::to_value(&order)?;
        match self.webhook.trigger(url, order.id(), &payload).await {
            Ok(outcome) => {
                if outcome.is_none() {
                    metrics::observe_webhook_call(event, "success");
                }
                Ok(outcome)
            }
            Err(err) => {
                metrics::observe_webhook_call(event, "error");
                Err(err)
            }
        }
    }
}
