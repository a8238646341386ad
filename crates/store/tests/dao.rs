use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use foundry_api::private::Cluster;
use foundry_api::{EventKind, Object};
use foundry_auth::logic::{DefaultAttributionLogic, TenancyLogic};
use foundry_auth::Subject;
use foundry_store::dao::{Event, EventCallback, GenericDao, ListRequest};
use foundry_store::{CallContext, StoreError, TxManager};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgConnection;

fn test_db_url() -> Option<String> {
    std::env::var("FOUNDRY_TEST_DB_URL")
        .ok()
        .or_else(|| std::env::var("DATABASE_URL").ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn schema_db_url(base: &str, schema: &str) -> String {
    let separator = if base.contains('?') { "&" } else { "?" };
    format!("{base}{separator}options=-csearch_path%3D{schema}")
}

/// Creates a fresh schema and returns a transaction manager bound to it, or
/// `None` when no test database is configured.
async fn test_manager() -> Option<TxManager> {
    let db_url = match test_db_url() {
        Some(url) => url,
        None => {
            eprintln!("skipping DAO test; set FOUNDRY_TEST_DB_URL to enable");
            return None;
        }
    };

    let schema = format!("foundry_test_{}", uuid::Uuid::new_v4().simple());
    let admin = PgPoolOptions::new()
        .max_connections(1)
        .connect(&db_url)
        .await
        .expect("DB connect should succeed");
    sqlx::query(&format!("CREATE SCHEMA {}", schema))
        .execute(&admin)
        .await
        .expect("create schema should succeed");
    admin.close().await;

    let manager = TxManager::connect(&schema_db_url(&db_url, &schema), 4)
        .await
        .expect("schema pool should connect");
    foundry_store::migrate(manager.pool())
        .await
        .expect("migrations should apply");
    Some(manager)
}

struct StaticTenancy {
    assigned: Vec<String>,
    visible: Vec<String>,
}

impl TenancyLogic for StaticTenancy {
    fn determine_assigned_tenants(&self, _subject: Option<&Subject>) -> Vec<String> {
        self.assigned.clone()
    }

    fn determine_visible_tenants(&self, _subject: Option<&Subject>) -> Vec<String> {
        self.visible.clone()
    }
}

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<(EventKind, String)>>,
}

impl Recorder {
    fn events(&self) -> Vec<(EventKind, String)> {
        self.events.lock().expect("recorder lock").clone()
    }
}

#[async_trait]
impl EventCallback for Recorder {
    async fn on_event(&self, _conn: &mut PgConnection, event: &Event) -> Result<(), StoreError> {
        let id = event
            .object
            .get("id")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        self.events
            .lock()
            .expect("recorder lock")
            .push((event.kind, id));
        Ok(())
    }
}

fn subject_ctx() -> CallContext {
    CallContext::new(Some(Subject::new("jane.doe", vec!["admins".to_string()])))
}

fn cluster(template: &str) -> Cluster {
    let mut cluster = Cluster::default();
    cluster.spec.template = template.to_string();
    cluster
}

async fn with_tx<F, T>(manager: &TxManager, ctx: &CallContext, work: F) -> T
where
    F: std::future::Future<Output = Result<T, StoreError>>,
{
    let started = manager.begin(ctx).await.expect("begin should succeed");
    let result = work.await;
    let failed = result.is_err();
    manager
        .end(ctx, started, failed)
        .await
        .expect("end should succeed");
    result.expect("transactional work should succeed")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn create_then_get_is_stable_and_attributed() {
    let Some(manager) = test_manager().await else {
        return;
    };
    let dao = GenericDao::<Cluster>::builder()
        .table("clusters")
        .attribution(Arc::new(DefaultAttributionLogic))
        .build()
        .expect("dao should build");

    let ctx = subject_ctx();
    let created = with_tx(&manager, &ctx, async {
        dao.create(&ctx, &cluster("small")).await
    })
    .await;

    assert!(!created.id.is_empty());
    assert_eq!(created.metadata.creators, vec!["jane.doe".to_string()]);
    assert!(created.metadata.creation_timestamp.is_some());
    assert!(created.metadata.deletion_timestamp.is_none());

    let fetched = with_tx(&manager, &ctx, async { dao.get(&ctx, &created.id).await })
        .await
        .expect("created object should be found");
    assert_eq!(fetched.id, created.id);
    assert_eq!(fetched.spec.template, "small");
    assert_eq!(fetched.metadata.creators, created.metadata.creators);

    // Creators and creation timestamp survive updates untouched.
    let mut changed = fetched.clone();
    changed.spec.template = "large".to_string();
    let updated = with_tx(&manager, &ctx, async { dao.update(&ctx, &changed).await }).await;
    assert_eq!(updated.metadata.creators, created.metadata.creators);
    assert_eq!(
        updated.metadata.creation_timestamp,
        created.metadata.creation_timestamp
    );
    assert_eq!(updated.spec.template, "large");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn get_on_absent_row_returns_none() {
    let Some(manager) = test_manager().await else {
        return;
    };
    let dao = GenericDao::<Cluster>::builder()
        .table("clusters")
        .build()
        .expect("dao should build");

    let ctx = subject_ctx();
    let absent = with_tx(&manager, &ctx, async { dao.get(&ctx, "missing").await }).await;
    assert!(absent.is_none());

    let err = {
        let started = manager.begin(&ctx).await.expect("begin should succeed");
        let result = dao.get(&ctx, "").await;
        manager
            .end(&ctx, started, result.is_err())
            .await
            .expect("end should succeed");
        result.unwrap_err()
    };
    assert!(matches!(err, StoreError::MissingIdentifier));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn equivalent_update_writes_nothing_and_fires_no_event() {
    let Some(manager) = test_manager().await else {
        return;
    };
    let recorder = Arc::new(Recorder::default());
    let dao = GenericDao::<Cluster>::builder()
        .table("clusters")
        .event_callback(recorder.clone())
        .build()
        .expect("dao should build");

    let ctx = subject_ctx();
    let created = with_tx(&manager, &ctx, async {
        dao.create(&ctx, &cluster("small")).await
    })
    .await;
    assert_eq!(recorder.events().len(), 1);

    // Same object with different metadata timestamps is equivalent.
    let mut same = created.clone();
    same.metadata.creation_timestamp = None;
    let result = with_tx(&manager, &ctx, async { dao.update(&ctx, &same).await }).await;
    assert_eq!(result.id, created.id);
    assert_eq!(recorder.events().len(), 1, "no event for a no-op update");

    let mut changed = created.clone();
    changed.spec.template = "large".to_string();
    with_tx(&manager, &ctx, async { dao.update(&ctx, &changed).await }).await;
    let events = recorder.events();
    assert_eq!(events.len(), 2);
    assert_eq!(events[1].0, EventKind::Updated);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn finalizers_gate_archival() {
    let Some(manager) = test_manager().await else {
        return;
    };
    let recorder = Arc::new(Recorder::default());
    let dao = GenericDao::<Cluster>::builder()
        .table("clusters")
        .event_callback(recorder.clone())
        .build()
        .expect("dao should build");

    let ctx = subject_ctx();
    let mut held = cluster("small");
    held.metadata.finalizers.push("hold".to_string());
    let created = with_tx(&manager, &ctx, async { dao.create(&ctx, &held).await }).await;

    // Delete with a finalizer: the row stays live, pending deletion.
    let deleted = with_tx(&manager, &ctx, async { dao.delete(&ctx, &created.id).await })
        .await
        .expect("delete should observe the row");
    assert!(deleted.metadata.deletion_timestamp.is_some());
    assert_eq!(
        recorder.events().last().map(|(kind, _)| *kind),
        Some(EventKind::Deleted)
    );

    let live = with_tx(&manager, &ctx, async { dao.get(&ctx, &created.id).await })
        .await
        .expect("row should still be live");
    assert!(live.metadata.pending_deletion());

    let archived: i64 = sqlx::query_scalar("select count(*) from archived_clusters")
        .fetch_one(manager.pool())
        .await
        .expect("archive count should succeed");
    assert_eq!(archived, 0);

    // Removing the finalizer archives the row.
    let mut released = live.clone();
    released.metadata.finalizers.clear();
    with_tx(&manager, &ctx, async { dao.update(&ctx, &released).await }).await;

    let gone = with_tx(&manager, &ctx, async { dao.get(&ctx, &created.id).await }).await;
    assert!(gone.is_none());

    let archived: i64 = sqlx::query_scalar("select count(*) from archived_clusters where id = $1")
        .bind(&created.id)
        .fetch_one(manager.pool())
        .await
        .expect("archive count should succeed");
    assert_eq!(archived, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn delete_without_finalizers_archives_immediately() {
    let Some(manager) = test_manager().await else {
        return;
    };
    let dao = GenericDao::<Cluster>::builder()
        .table("clusters")
        .build()
        .expect("dao should build");

    let ctx = subject_ctx();
    let created = with_tx(&manager, &ctx, async {
        dao.create(&ctx, &cluster("small")).await
    })
    .await;
    with_tx(&manager, &ctx, async { dao.delete(&ctx, &created.id).await }).await;

    let gone = with_tx(&manager, &ctx, async { dao.get(&ctx, &created.id).await }).await;
    assert!(gone.is_none());

    let archived: i64 = sqlx::query_scalar("select count(*) from archived_clusters where id = $1")
        .bind(&created.id)
        .fetch_one(manager.pool())
        .await
        .expect("archive count should succeed");
    assert_eq!(archived, 1);

    // Deleting again is a no-op.
    let absent = with_tx(&manager, &ctx, async { dao.delete(&ctx, &created.id).await }).await;
    assert!(absent.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn tenancy_filters_visibility() {
    let Some(manager) = test_manager().await else {
        return;
    };

    let writer = |assigned: &[&str]| {
        GenericDao::<Cluster>::builder()
            .table("clusters")
            .tenancy(Arc::new(StaticTenancy {
                assigned: assigned.iter().map(|t| t.to_string()).collect(),
                visible: Vec::new(),
            }))
            .build()
            .expect("dao should build")
    };

    let ctx = subject_ctx();
    let tenanted = with_tx(&manager, &ctx, async {
        writer(&["tenant-a"]).create(&ctx, &cluster("small")).await
    })
    .await;
    let foreign = with_tx(&manager, &ctx, async {
        writer(&["tenant-b"]).create(&ctx, &cluster("small")).await
    })
    .await;
    let unowned = with_tx(&manager, &ctx, async {
        writer(&[]).create(&ctx, &cluster("small")).await
    })
    .await;

    let reader = GenericDao::<Cluster>::builder()
        .table("clusters")
        .tenancy(Arc::new(StaticTenancy {
            assigned: Vec::new(),
            visible: vec!["tenant-a".to_string()],
        }))
        .build()
        .expect("dao should build");

    let listed = with_tx(&manager, &ctx, async {
        reader.list(&ctx, &ListRequest::default()).await
    })
    .await;
    assert_eq!(listed.total, 1);
    assert_eq!(listed.items[0].id, tenanted.id);

    let visible = with_tx(&manager, &ctx, async { reader.get(&ctx, &tenanted.id).await }).await;
    assert!(visible.is_some());
    let hidden = with_tx(&manager, &ctx, async { reader.get(&ctx, &foreign.id).await }).await;
    assert!(hidden.is_none());
    let hidden = with_tx(&manager, &ctx, async { reader.get(&ctx, &unowned.id).await }).await;
    assert!(hidden.is_none());

    // Exists applies the same visibility rules.
    let exists = with_tx(&manager, &ctx, async { reader.exists(&ctx, &tenanted.id).await }).await;
    assert!(exists);
    let exists = with_tx(&manager, &ctx, async { reader.exists(&ctx, &foreign.id).await }).await;
    assert!(!exists);

    // An empty visible set disables filtering entirely.
    let permissive = GenericDao::<Cluster>::builder()
        .table("clusters")
        .build()
        .expect("dao should build");
    let listed = with_tx(&manager, &ctx, async {
        permissive.list(&ctx, &ListRequest::default()).await
    })
    .await;
    assert_eq!(listed.total, 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn list_filters_and_paginates() {
    let Some(manager) = test_manager().await else {
        return;
    };
    let dao = GenericDao::<Cluster>::builder()
        .table("clusters")
        .default_order("id")
        .build()
        .expect("dao should build");

    let ctx = subject_ctx();
    for template in ["small", "small", "large"] {
        with_tx(&manager, &ctx, async {
            dao.create(&ctx, &cluster(template)).await
        })
        .await;
    }

    let filtered = with_tx(&manager, &ctx, async {
        dao.list(
            &ctx,
            &ListRequest {
                filter: "spec.template == 'small'".to_string(),
                ..ListRequest::default()
            },
        )
        .await
    })
    .await;
    assert_eq!(filtered.total, 2);
    assert_eq!(filtered.size, 2);

    // Total ignores the window; size reflects it.
    let paged = with_tx(&manager, &ctx, async {
        dao.list(
            &ctx,
            &ListRequest {
                offset: 2,
                limit: 5,
                ..ListRequest::default()
            },
        )
        .await
    })
    .await;
    assert_eq!(paged.total, 3);
    assert_eq!(paged.size, 1);

    let err = {
        let started = manager.begin(&ctx).await.expect("begin should succeed");
        let result = dao
            .list(
                &ctx,
                &ListRequest {
                    filter: "bogus == 'x'".to_string(),
                    ..ListRequest::default()
                },
            )
            .await;
        manager
            .end(&ctx, started, result.is_err())
            .await
            .expect("end should succeed");
        result.unwrap_err()
    };
    assert!(matches!(err, StoreError::Filter(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failing_event_callback_aborts_the_transaction() {
    let Some(manager) = test_manager().await else {
        return;
    };

    struct Failing;

    #[async_trait]
    impl EventCallback for Failing {
        async fn on_event(
            &self,
            _conn: &mut PgConnection,
            _event: &Event,
        ) -> Result<(), StoreError> {
            Err(StoreError::Callback("refused".to_string()))
        }
    }

    let dao = GenericDao::<Cluster>::builder()
        .table("clusters")
        .event_callback(Arc::new(Failing))
        .build()
        .expect("dao should build");

    let ctx = subject_ctx();
    let started = manager.begin(&ctx).await.expect("begin should succeed");
    let result = dao.create(&ctx, &cluster("small")).await;
    manager
        .end(&ctx, started, result.is_err())
        .await
        .expect("end should succeed");
    assert!(result.is_err());

    let count: i64 = sqlx::query_scalar("select count(*) from clusters")
        .fetch_one(manager.pool())
        .await
        .expect("count should succeed");
    assert_eq!(count, 0, "rollback must discard the insert");
}
