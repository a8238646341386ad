//! Generic service implementation: maps the list/get/create/update/delete
//! surface of every entity onto the store, scoping a transaction around each
//! call.

use std::future::Future;
use std::sync::Arc;

use foundry_api::rpc::Status;
use foundry_api::shared::Condition;
use foundry_api::{
    DeleteResponse, GetResponse, ListResponse, Object, UpdateResponse, WatchEvent,
};
use foundry_store::dao::{GenericDao, ListRequest as DaoListRequest};
use foundry_store::{CallContext, Filter, Notifier, StoreError, TxManager};
use tokio::sync::mpsc;

const WATCH_QUEUE_CAPACITY: usize = 64;

pub struct GenericServer<O: Object> {
    dao: Arc<GenericDao<O>>,
    tx: TxManager,
    notifier: Notifier,
}

impl<O: Object> GenericServer<O> {
    pub fn new(dao: Arc<GenericDao<O>>, tx: TxManager, notifier: Notifier) -> Self {
        Self { dao, tx, notifier }
    }

    pub fn dao(&self) -> &Arc<GenericDao<O>> {
        &self.dao
    }

    /// Begins a transaction unless the context already carries one and ends
    /// it on return; a nested call leaves the outer transaction untouched.
    /// Any error rolls the transaction back.
    pub async fn in_tx<T, F, Fut>(&self, ctx: &CallContext, work: F) -> Result<T, Status>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, Status>>,
    {
        with_call_tx(&self.tx, ctx, work).await
    }

    pub async fn list(
        &self,
        ctx: &CallContext,
        request: &foundry_api::ListRequest,
    ) -> Result<ListResponse<O>, Status> {
        // List parameters are copied verbatim into the store request.
        let dao_request = DaoListRequest {
            offset: request.offset,
            limit: request.limit,
            filter: request.filter.clone(),
        };
        let response = self
            .in_tx(ctx, || async {
                self.dao.list(ctx, &dao_request).await.map_err(store_status)
            })
            .await?;
        Ok(ListResponse {
            size: response.size,
            total: response.total,
            items: response.items,
        })
    }

    pub async fn get(&self, ctx: &CallContext, id: &str) -> Result<GetResponse<O>, Status> {
        let object = self
            .in_tx(ctx, || async {
                self.dao.get(ctx, id).await.map_err(store_status)
            })
            .await?;
        match object {
            Some(object) => Ok(GetResponse { object }),
            None => Err(Status::not_found(format!("object '{}' doesn't exist", id))),
        }
    }

    pub async fn create(&self, ctx: &CallContext, object: &O) -> Result<O, Status> {
        self.in_tx(ctx, || async {
            self.dao.create(ctx, object).await.map_err(store_status)
        })
        .await
    }

    pub async fn update(
        &self,
        ctx: &CallContext,
        object: &O,
        update_mask: Option<&[String]>,
    ) -> Result<UpdateResponse<O>, Status> {
        let updated = self
            .in_tx(ctx, || async {
                let effective = match update_mask {
                    Some(mask) => {
                        let current = self
                            .dao
                            .get(ctx, object.id())
                            .await
                            .map_err(store_status)?;
                        let Some(current) = current else {
                            return Err(Status::not_found(format!(
                                "object '{}' doesn't exist",
                                object.id()
                            )));
                        };
                        merge_masked(&current, object, mask).map_err(store_status)?
                    }
                    None => object.clone(),
                };
                self.dao.update(ctx, &effective).await.map_err(store_status)
            })
            .await?;
        Ok(UpdateResponse { object: updated })
    }

    pub async fn delete(&self, ctx: &CallContext, id: &str) -> Result<DeleteResponse, Status> {
        // Deleting an absent object is a no-op by contract.
        self.in_tx(ctx, || async {
            self.dao.delete(ctx, id).await.map_err(store_status)
        })
        .await?;
        Ok(DeleteResponse {})
    }

    /// Subscribes to the notifier and produces watch events for this
    /// entity's table. Events whose payload exceeded the notification size
    /// limit are re-fetched by identifier.
    pub fn watch(
        &self,
        request: &foundry_api::WatchRequest,
    ) -> Result<mpsc::Receiver<WatchEvent<serde_json::Value>>, Status> {
        let filter = if request.filter.is_empty() {
            None
        } else {
            Some(
                Filter::parse(&request.filter)
                    .map_err(|err| Status::invalid_argument(err.to_string()))?,
            )
        };

        let mut subscription = self
            .notifier
            .subscribe(self.dao.table(), &[], WATCH_QUEUE_CAPACITY);
        let (tx, rx) = mpsc::channel(WATCH_QUEUE_CAPACITY);
        let dao = self.dao.clone();
        let manager = self.tx.clone();

        tokio::spawn(async move {
            while let Some(notification) = subscription.recv().await {
                let object = match notification.object.clone() {
                    Some(object) => object,
                    None => match refetch(&dao, &manager, &notification.id).await {
                        Some(object) => object,
                        None => serde_json::json!({ "id": notification.id }),
                    },
                };
                if let Some(filter) = &filter {
                    if !filter.matches(&object) {
                        continue;
                    }
                }
                let event = WatchEvent {
                    r#type: notification.kind,
                    object,
                };
                if tx.send(event).await.is_err() {
                    return;
                }
            }
        });
        Ok(rx)
    }
}

/// Scopes a transaction to the call context for the duration of `work`:
/// begin unless one is attached, commit on success, rollback on error.
pub async fn with_call_tx<T, F, Fut>(
    manager: &TxManager,
    ctx: &CallContext,
    work: F,
) -> Result<T, Status>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, Status>>,
{
    let started = manager.begin(ctx).await.map_err(store_status)?;
    let result = work().await;
    let failed = result.is_err();
    if let Err(end_err) = manager.end(ctx, started, failed).await {
        if result.is_ok() {
            return Err(store_status(end_err));
        }
    }
    result
}

async fn refetch<O: Object>(
    dao: &GenericDao<O>,
    manager: &TxManager,
    id: &str,
) -> Option<serde_json::Value> {
    let ctx = CallContext::background();
    let started = manager.begin(&ctx).await.ok()?;
    let result = dao.get(&ctx, id).await;
    let _ = manager.end(&ctx, started, result.is_err()).await;
    result
        .ok()
        .flatten()
        .and_then(|object| serde_json::to_value(object).ok())
}

/// At most one condition entry per condition type.
pub fn validate_no_duplicate_conditions(conditions: &[Condition]) -> Result<(), Status> {
    let mut seen: u64 = 0;
    for condition in conditions {
        let bit = 1u64 << condition.r#type.ordinal();
        if seen & bit != 0 {
            return Err(Status::invalid_argument(format!(
                "condition '{}' is duplicated",
                condition.r#type.as_str()
            )));
        }
        seen |= bit;
    }
    Ok(())
}

/// Merges only the masked paths of `incoming` onto `current`. Paths are dot
/// separated; a path absent from the incoming object is skipped.
fn merge_masked<O: Object>(current: &O, incoming: &O, mask: &[String]) -> Result<O, StoreError> {
    let incoming_json = serde_json::to_value(incoming)?;
    let mut merged = serde_json::to_value(current)?;
    for path in mask {
        let segments = path.split('.').collect::<Vec<_>>();
        if segments.iter().any(|segment| segment.is_empty()) {
            continue;
        }
        if let Some(value) = get_path(&incoming_json, &segments) {
            set_path(&mut merged, &segments, value.clone());
        }
    }
    let mut object: O = serde_json::from_value(merged)?;
    object.set_id(current.id().to_string());
    Ok(object)
}

fn get_path<'a>(value: &'a serde_json::Value, segments: &[&str]) -> Option<&'a serde_json::Value> {
    let mut current = value;
    for segment in segments {
        current = current.get(segment)?;
    }
    Some(current)
}

fn set_path(target: &mut serde_json::Value, segments: &[&str], value: serde_json::Value) {
    let mut current = target;
    for segment in &segments[..segments.len() - 1] {
        if !current.is_object() {
            *current = serde_json::json!({});
        }
        let map = match current.as_object_mut() {
            Some(map) => map,
            None => return,
        };
        current = map.entry(segment.to_string()).or_insert(serde_json::json!({}));
    }
    if !current.is_object() {
        *current = serde_json::json!({});
    }
    if let Some(map) = current.as_object_mut() {
        map.insert(segments[segments.len() - 1].to_string(), value);
    }
}

/// Maps store failures onto the RPC surface.
pub fn store_status(err: StoreError) -> Status {
    match err {
        StoreError::Config(message) => Status::internal(message),
        StoreError::MissingIdentifier => Status::invalid_argument("object identifier is mandatory"),
        StoreError::Filter(err) => Status::invalid_argument(err.to_string()),
        StoreError::NoRows => Status::not_found("object doesn't exist"),
        StoreError::NoTransaction => Status::internal("no transaction on the call context"),
        StoreError::Serialization(err) => Status::internal(format!("serialization failed: {}", err)),
        StoreError::Sqlx(err) => match err {
            sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
                Status::unavailable("database is unavailable")
            }
            other => Status::internal(format!("database error: {}", other)),
        },
        StoreError::Callback(message) => Status::internal(message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use foundry_api::private::Cluster;
    use foundry_api::rpc::Code;
    use foundry_api::{ConditionStatus, ConditionType};

    fn condition(r#type: ConditionType) -> Condition {
        Condition {
            r#type,
            status: ConditionStatus::False,
            last_transition_time: None,
            message: String::new(),
        }
    }

    #[test]
    fn duplicate_condition_is_rejected_with_its_name() {
        let conditions = vec![
            condition(ConditionType::Progressing),
            condition(ConditionType::Ready),
            condition(ConditionType::Progressing),
        ];
        let err = validate_no_duplicate_conditions(&conditions).unwrap_err();
        assert_eq!(err.code, Code::InvalidArgument);
        assert_eq!(err.message, "condition 'PROGRESSING' is duplicated");
    }

    #[test]
    fn distinct_conditions_pass() {
        let conditions = vec![
            condition(ConditionType::Progressing),
            condition(ConditionType::Ready),
            condition(ConditionType::Degraded),
        ];
        validate_no_duplicate_conditions(&conditions).expect("distinct conditions should pass");
    }

    #[test]
    fn masked_merge_touches_only_listed_paths() {
        let mut current = Cluster::default();
        current.id = "c1".to_string();
        current.spec.template = "small".to_string();
        current.status.hub = "hub1".to_string();

        let mut incoming = Cluster::default();
        incoming.id = "c1".to_string();
        incoming.spec.template = "large".to_string();
        incoming.status.hub = "hub2".to_string();

        let merged = merge_masked(&current, &incoming, &["spec.template".to_string()])
            .expect("merge should succeed");
        assert_eq!(merged.spec.template, "large");
        assert_eq!(merged.status.hub, "hub1", "unlisted paths stay untouched");
    }

    #[test]
    fn masked_merge_skips_paths_missing_from_incoming() {
        let mut current = Cluster::default();
        current.id = "c1".to_string();
        current.spec.template = "small".to_string();

        let incoming = Cluster::default();
        let merged = merge_masked(
            &current,
            &incoming,
            &["spec.no_such_field".to_string(), "".to_string()],
        )
        .expect("merge should succeed");
        assert_eq!(merged.spec.template, "small");
    }

    #[test]
    fn store_errors_map_to_rpc_codes() {
        assert_eq!(
            store_status(StoreError::MissingIdentifier).code,
            Code::InvalidArgument
        );
        assert_eq!(store_status(StoreError::NoRows).code, Code::NotFound);
        assert_eq!(
            store_status(StoreError::Sqlx(sqlx::Error::PoolTimedOut)).code,
            Code::Unavailable
        );
        assert_eq!(
            store_status(StoreError::Callback("boom".to_string())).code,
            Code::Internal
        );
    }
}
