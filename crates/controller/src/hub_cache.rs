//! Cache of hub id → namespace and authenticated client. Entries are built
//! lazily, at most once per id at a time, and evicted when the hub record is
//! deleted. A failed construction is retried on the next access.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use foundry_api::private::Hub;
use foundry_store::dao::GenericDao;
use foundry_store::{CallContext, TxManager};
use tokio::sync::{OnceCell, RwLock};

use crate::kube::KubeClient;
use crate::ControllerError;

const HUB_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct HubEntry {
    pub namespace: String,
    pub client: Arc<KubeClient>,
}

type EntryCell = Arc<OnceCell<Arc<HubEntry>>>;

#[derive(Clone)]
pub struct HubCache {
    manager: TxManager,
    dao: Arc<GenericDao<Hub>>,
    entries: Arc<RwLock<HashMap<String, EntryCell>>>,
}

impl HubCache {
    pub fn new(manager: TxManager, dao: Arc<GenericDao<Hub>>) -> Self {
        Self {
            manager,
            dao,
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn get(&self, id: &str) -> Result<Arc<HubEntry>, ControllerError> {
        let cell = {
            let mut entries = self.entries.write().await;
            entries
                .entry(id.to_string())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        let result = cell
            .get_or_try_init(|| async { self.build(id).await })
            .await;
        match result {
            Ok(entry) => Ok(entry.clone()),
            Err(err) => {
                // Drop the failed cell so the next access retries.
                let mut entries = self.entries.write().await;
                if let Some(current) = entries.get(id) {
                    if Arc::ptr_eq(current, &cell) {
                        entries.remove(id);
                    }
                }
                Err(err)
            }
        }
    }

    pub async fn evict(&self, id: &str) {
        let mut entries = self.entries.write().await;
        if entries.remove(id).is_some() {
            tracing::debug!(hub = %id, "evicted hub cache entry");
        }
    }

    async fn build(&self, id: &str) -> Result<Arc<HubEntry>, ControllerError> {
        let ctx = CallContext::background();
        let started = self.manager.begin(&ctx).await?;
        let result = self.dao.get(&ctx, id).await;
        let _ = self.manager.end(&ctx, started, result.is_err()).await;

        let hub = result?
            .ok_or_else(|| ControllerError::Missing(format!("hub '{}' doesn't exist", id)))?;

        let client = KubeClient::new(
            &hub.spec.api_url,
            &hub.spec.token,
            &hub.spec.ca_bundle,
            hub.spec.insecure,
            HUB_REQUEST_TIMEOUT,
        )?;
        tracing::debug!(hub = %id, namespace = %hub.spec.namespace, "constructed hub client");
        Ok(Arc::new(HubEntry {
            namespace: hub.spec.namespace,
            client: Arc::new(client),
        }))
    }
}
