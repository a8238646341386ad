//! Generic data access over the per-entity tables. Every table shares the
//! same column layout: `id`, `creation_timestamp`, `deletion_timestamp`,
//! `finalizers`, `creators`, `tenants` and the JSONB `data` payload holding
//! everything else.

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use foundry_api::{EventKind, Metadata, Object};
use foundry_auth::logic::{
    AttributionLogic, EmptyAttributionLogic, EmptyTenancyLogic, TenancyLogic,
};
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::query::Query;
use sqlx::{PgConnection, Postgres, Row};

use crate::filter::{Filter, SqlParam};
use crate::{CallContext, StoreError};

/// A change applied by the DAO, handed to event callbacks inside the same
/// transaction.
#[derive(Debug, Clone)]
pub struct Event {
    pub table: String,
    pub kind: EventKind,
    pub object: serde_json::Value,
}

/// Callback invoked synchronously for every create, update and delete, in
/// registration order, on the transaction connection. An error aborts the
/// transaction.
#[async_trait]
pub trait EventCallback: Send + Sync {
    async fn on_event(&self, conn: &mut PgConnection, event: &Event) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListRequest {
    pub offset: i32,
    pub limit: i32,
    pub filter: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListResponse<O> {
    pub size: i32,
    pub total: i32,
    pub items: Vec<O>,
}

pub struct GenericDaoBuilder<O: Object> {
    table: String,
    default_order: Option<String>,
    default_limit: i32,
    max_limit: i32,
    event_callbacks: Vec<Arc<dyn EventCallback>>,
    attribution: Option<Arc<dyn AttributionLogic>>,
    tenancy: Option<Arc<dyn TenancyLogic>>,
    _marker: PhantomData<fn() -> O>,
}

impl<O: Object> GenericDaoBuilder<O> {
    pub fn table(mut self, value: impl Into<String>) -> Self {
        self.table = value.into();
        self
    }

    /// Default order criteria applied when the caller requested none. Only
    /// intended for tests, where predictable ordering is convenient.
    pub fn default_order(mut self, value: impl Into<String>) -> Self {
        self.default_order = Some(value.into());
        self
    }

    pub fn default_limit(mut self, value: i32) -> Self {
        self.default_limit = value;
        self
    }

    pub fn max_limit(mut self, value: i32) -> Self {
        self.max_limit = value;
        self
    }

    pub fn event_callback(mut self, value: Arc<dyn EventCallback>) -> Self {
        self.event_callbacks.push(value);
        self
    }

    pub fn attribution(mut self, value: Arc<dyn AttributionLogic>) -> Self {
        self.attribution = Some(value);
        self
    }

    pub fn tenancy(mut self, value: Arc<dyn TenancyLogic>) -> Self {
        self.tenancy = Some(value);
        self
    }

    pub fn build(self) -> Result<GenericDao<O>, StoreError> {
        if self.table.is_empty() {
            return Err(StoreError::Config("table is mandatory".to_string()));
        }
        if self.default_limit <= 0 {
            return Err(StoreError::Config(format!(
                "default limit must be a positive integer, but it is {}",
                self.default_limit
            )));
        }
        if self.max_limit < self.default_limit {
            return Err(StoreError::Config(format!(
                "max limit must be greater or equal to default limit, but max limit is {} and \
                 default limit is {}",
                self.max_limit, self.default_limit
            )));
        }
        Ok(GenericDao {
            table: self.table,
            default_order: self.default_order,
            default_limit: self.default_limit,
            max_limit: self.max_limit,
            event_callbacks: self.event_callbacks,
            attribution: self
                .attribution
                .unwrap_or_else(|| Arc::new(EmptyAttributionLogic)),
            tenancy: self.tenancy.unwrap_or_else(|| Arc::new(EmptyTenancyLogic)),
            _marker: PhantomData,
        })
    }
}

pub struct GenericDao<O: Object> {
    table: String,
    default_order: Option<String>,
    default_limit: i32,
    max_limit: i32,
    event_callbacks: Vec<Arc<dyn EventCallback>>,
    attribution: Arc<dyn AttributionLogic>,
    tenancy: Arc<dyn TenancyLogic>,
    _marker: PhantomData<fn() -> O>,
}

impl<O: Object> GenericDao<O> {
    pub fn builder() -> GenericDaoBuilder<O> {
        GenericDaoBuilder {
            table: String::new(),
            default_order: None,
            default_limit: 100,
            max_limit: 1000,
            event_callbacks: Vec::new(),
            attribution: None,
            tenancy: None,
            _marker: PhantomData,
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub async fn list(
        &self,
        ctx: &CallContext,
        request: &ListRequest,
    ) -> Result<ListResponse<O>, StoreError> {
        let mut where_buf = String::new();
        let mut params: Vec<SqlParam> = Vec::new();
        if !request.filter.is_empty() {
            let filter = Filter::parse(&request.filter)?;
            let translation = filter.to_sql(O::FILTER_FIELDS, params.len())?;
            where_buf.push_str(&translation.sql);
            params.extend(translation.params);
        }
        self.add_tenancy_filter(ctx, &mut where_buf, &mut params);

        let mut tx = ctx.tx().await?;
        let conn = tx.conn();

        // Total disregards offset and limit.
        let mut sql = format!("select count(*) from {}", self.table);
        if !where_buf.is_empty() {
            sql.push_str(" where ");
            sql.push_str(&where_buf);
        }
        tracing::debug!(sql = %sql, "running SQL query");
        let row = bind_params(sqlx::query(&sql), &params)
            .fetch_one(&mut *conn)
            .await?;
        let total: i64 = row.try_get(0)?;

        let mut sql = format!(
            "select id, creation_timestamp, deletion_timestamp, finalizers, creators, tenants, \
             data from {}",
            self.table
        );
        if !where_buf.is_empty() {
            sql.push_str(" where ");
            sql.push_str(&where_buf);
        }
        if let Some(order) = &self.default_order {
            sql.push_str(" order by ");
            sql.push_str(order);
        }
        params.push(SqlParam::Int(i64::from(request.offset.max(0))));
        sql.push_str(&format!(" offset ${}", params.len()));
        params.push(SqlParam::Int(i64::from(self.clamp_limit(request.limit))));
        sql.push_str(&format!(" limit ${}", params.len()));

        tracing::debug!(sql = %sql, "running SQL query");
        let rows = bind_params(sqlx::query(&sql), &params)
            .fetch_all(&mut *conn)
            .await?;
        let mut items = Vec::with_capacity(rows.len());
        for row in rows {
            items.push(self.scan_row(&row)?);
        }

        Ok(ListResponse {
            size: items.len() as i32,
            total: total as i32,
            items,
        })
    }

    /// Returns the object, or `None` without error when there is no row with
    /// the given identifier.
    pub async fn get(&self, ctx: &CallContext, id: &str) -> Result<Option<O>, StoreError> {
        if id.is_empty() {
            return Err(StoreError::MissingIdentifier);
        }
        let mut where_buf = "id = $1".to_string();
        let mut params = vec![SqlParam::Text(id.to_string())];
        self.add_tenancy_filter(ctx, &mut where_buf, &mut params);

        let mut tx = ctx.tx().await?;
        self.fetch_where(tx.conn(), &where_buf, &params).await
    }

    pub async fn exists(&self, ctx: &CallContext, id: &str) -> Result<bool, StoreError> {
        if id.is_empty() {
            return Err(StoreError::MissingIdentifier);
        }
        let mut where_buf = "id = $1".to_string();
        let mut params = vec![SqlParam::Text(id.to_string())];
        self.add_tenancy_filter(ctx, &mut where_buf, &mut params);

        let sql = format!("select count(*) from {} where {}", self.table, where_buf);
        tracing::debug!(sql = %sql, "running SQL query");
        let mut tx = ctx.tx().await?;
        let row = bind_params(sqlx::query(&sql), &params)
            .fetch_one(&mut *tx.conn())
            .await?;
        let count: i64 = row.try_get(0)?;
        Ok(count > 0)
    }

    pub async fn create(&self, ctx: &CallContext, object: &O) -> Result<O, StoreError> {
        let id = if object.id().is_empty() {
            uuid::Uuid::new_v4().to_string()
        } else {
            object.id().to_string()
        };

        let finalizers = normalize_finalizers(object.metadata());
        let creators = self
            .attribution
            .determine_assigned_creators(ctx.subject_opt());
        let tenants = self.tenancy.determine_assigned_tenants(ctx.subject_opt());
        let data = self.marshal(object)?;

        let sql = format!(
            "insert into {} (id, finalizers, creators, tenants, data) values ($1, $2, $3, $4, \
             $5) returning creation_timestamp, deletion_timestamp",
            self.table
        );
        tracing::debug!(sql = %sql, "running SQL statement");
        let mut tx = ctx.tx().await?;
        let conn = tx.conn();
        let row = sqlx::query(&sql)
            .bind(&id)
            .bind(&finalizers)
            .bind(&creators)
            .bind(&tenants)
            .bind(&data)
            .fetch_one(&mut *conn)
            .await?;
        let creation_ts: DateTime<Utc> = row.try_get("creation_timestamp")?;
        let deletion_ts: DateTime<Utc> = row.try_get("deletion_timestamp")?;

        let mut created = object.clone();
        created.set_id(id);
        created.set_metadata(make_metadata(
            creation_ts,
            deletion_ts,
            finalizers,
            creators,
            tenants,
        ));

        self.fire_event(conn, EventKind::Created, &created).await?;
        Ok(created)
    }

    pub async fn update(&self, ctx: &CallContext, object: &O) -> Result<O, StoreError> {
        let id = object.id().to_string();
        if id.is_empty() {
            return Err(StoreError::MissingIdentifier);
        }

        let mut where_buf = "id = $1".to_string();
        let mut params = vec![SqlParam::Text(id.clone())];
        self.add_tenancy_filter(ctx, &mut where_buf, &mut params);

        let mut tx = ctx.tx().await?;
        let conn = tx.conn();

        // No write and no event when nothing but metadata timestamps differ.
        let current = self.fetch_where(&mut *conn, &where_buf, &params).await?;
        if let Some(current) = current {
            if current.equivalent(object) {
                return Ok(current);
            }
        }

        let finalizers = normalize_finalizers(object.metadata());
        let data = self.marshal(object)?;
        let sql = format!(
            "update {} set finalizers = $1, data = $2 where id = $3 returning \
             creation_timestamp, deletion_timestamp, creators, tenants",
            self.table
        );
        tracing::debug!(sql = %sql, "running SQL statement");
        let row = sqlx::query(&sql)
            .bind(&finalizers)
            .bind(&data)
            .bind(&id)
            .fetch_optional(&mut *conn)
            .await?;
        let Some(row) = row else {
            return Err(StoreError::NoRows);
        };
        let creation_ts: DateTime<Utc> = row.try_get("creation_timestamp")?;
        let deletion_ts: DateTime<Utc> = row.try_get("deletion_timestamp")?;
        let creators: Vec<String> = row.try_get("creators")?;
        let tenants: Vec<String> = row.try_get("tenants")?;

        let mut updated = object.clone();
        updated.set_id(id.clone());
        updated.set_metadata(make_metadata(
            creation_ts,
            deletion_ts,
            finalizers.clone(),
            creators.clone(),
            tenants.clone(),
        ));

        self.fire_event(conn, EventKind::Updated, &updated).await?;

        if deletion_ts.timestamp() != 0 && finalizers.is_empty() {
            self.archive(conn, &id, creation_ts, deletion_ts, &creators, &tenants, &data)
                .await?;
        }
        Ok(updated)
    }

    /// Sets the deletion timestamp. A no-op returning `None` when the row is
    /// absent. Archives immediately when no finalizers remain.
    pub async fn delete(&self, ctx: &CallContext, id: &str) -> Result<Option<O>, StoreError> {
        if id.is_empty() {
            return Err(StoreError::MissingIdentifier);
        }
        let mut where_buf = "id = $1".to_string();
        let mut params = vec![SqlParam::Text(id.to_string())];
        self.add_tenancy_filter(ctx, &mut where_buf, &mut params);

        let sql = format!(
            "update {} set deletion_timestamp = now() where {} returning creation_timestamp, \
             deletion_timestamp, finalizers, creators, tenants, data",
            self.table, where_buf
        );
        tracing::debug!(sql = %sql, "running SQL statement");
        let mut tx = ctx.tx().await?;
        let conn = tx.conn();
        let row = bind_params(sqlx::query(&sql), &params)
            .fetch_optional(&mut *conn)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };

        let creation_ts: DateTime<Utc> = row.try_get("creation_timestamp")?;
        let deletion_ts: DateTime<Utc> = row.try_get("deletion_timestamp")?;
        let finalizers: Vec<String> = row.try_get("finalizers")?;
        let creators: Vec<String> = row.try_get("creators")?;
        let tenants: Vec<String> = row.try_get("tenants")?;
        let data: serde_json::Value = row.try_get("data")?;

        let mut object: O = serde_json::from_value(data.clone())?;
        object.set_id(id.to_string());
        object.set_metadata(make_metadata(
            creation_ts,
            deletion_ts,
            finalizers.clone(),
            creators.clone(),
            tenants.clone(),
        ));

        self.fire_event(conn, EventKind::Deleted, &object).await?;

        if finalizers.is_empty() {
            self.archive(conn, id, creation_ts, deletion_ts, &creators, &tenants, &data)
                .await?;
        }
        Ok(Some(object))
    }

    async fn fetch_where(
        &self,
        conn: &mut PgConnection,
        where_buf: &str,
        params: &[SqlParam],
    ) -> Result<Option<O>, StoreError> {
        let sql = format!(
            "select id, creation_timestamp, deletion_timestamp, finalizers, creators, tenants, \
             data from {} where {}",
            self.table, where_buf
        );
        tracing::debug!(sql = %sql, "running SQL query");
        let row = bind_params(sqlx::query(&sql), params)
            .fetch_optional(conn)
            .await?;
        match row {
            Some(row) => Ok(Some(self.scan_row(&row)?)),
            None => Ok(None),
        }
    }

    async fn archive(
        &self,
        conn: &mut PgConnection,
        id: &str,
        creation_ts: DateTime<Utc>,
        deletion_ts: DateTime<Utc>,
        creators: &[String],
        tenants: &[String],
        data: &serde_json::Value,
    ) -> Result<(), StoreError> {
        let sql = format!(
            "insert into archived_{} (id, creation_timestamp, deletion_timestamp, creators, \
             tenants, data) values ($1, $2, $3, $4, $5, $6)",
            self.table
        );
        sqlx::query(&sql)
            .bind(id)
            .bind(creation_ts)
            .bind(deletion_ts)
            .bind(creators)
            .bind(tenants)
            .bind(data)
            .execute(&mut *conn)
            .await?;
        let sql = format!("delete from {} where id = $1", self.table);
        sqlx::query(&sql).bind(id).execute(conn).await?;
        Ok(())
    }

    async fn fire_event(
        &self,
        conn: &mut PgConnection,
        kind: EventKind,
        object: &O,
    ) -> Result<(), StoreError> {
        let event = Event {
            table: self.table.clone(),
            kind,
            object: serde_json::to_value(object)?,
        };
        for callback in &self.event_callbacks {
            callback.on_event(&mut *conn, &event).await?;
        }
        Ok(())
    }

    fn scan_row(&self, row: &PgRow) -> Result<O, StoreError> {
        let id: String = row.try_get("id")?;
        let creation_ts: DateTime<Utc> = row.try_get("creation_timestamp")?;
        let deletion_ts: DateTime<Utc> = row.try_get("deletion_timestamp")?;
        let finalizers: Vec<String> = row.try_get("finalizers")?;
        let creators: Vec<String> = row.try_get("creators")?;
        let tenants: Vec<String> = row.try_get("tenants")?;
        let data: serde_json::Value = row.try_get("data")?;

        let mut object: O = serde_json::from_value(data)?;
        object.set_id(id);
        object.set_metadata(make_metadata(
            creation_ts,
            deletion_ts,
            finalizers,
            creators,
            tenants,
        ));
        Ok(object)
    }

    fn marshal(&self, object: &O) -> Result<serde_json::Value, StoreError> {
        // The identifier and the metadata live in dedicated columns, not in
        // the payload.
        let mut value = serde_json::to_value(object)?;
        if let Some(map) = value.as_object_mut() {
            map.remove("id");
            map.remove("metadata");
        }
        Ok(value)
    }

    fn clamp_limit(&self, limit: i32) -> i32 {
        if limit < 0 {
            0
        } else if limit == 0 {
            self.default_limit
        } else if limit > self.max_limit {
            self.max_limit
        } else {
            limit
        }
    }

    fn add_tenancy_filter(
        &self,
        ctx: &CallContext,
        where_buf: &mut String,
        params: &mut Vec<SqlParam>,
    ) {
        let tenants = self.tenancy.determine_visible_tenants(ctx.subject_opt());
        // An empty visible set disables tenant filtering, which is how the
        // empty tenancy logic works as a permissive fallback.
        if tenants.is_empty() {
            return;
        }
        params.push(SqlParam::TextArray(tenants));
        let clause = format!("tenants && ${}", params.len());
        if where_buf.is_empty() {
            *where_buf = clause;
        } else {
            *where_buf = format!("({}) and {}", where_buf, clause);
        }
    }
}

fn bind_params<'q>(
    mut query: Query<'q, Postgres, PgArguments>,
    params: &[SqlParam],
) -> Query<'q, Postgres, PgArguments> {
    for param in params {
        query = match param {
            SqlParam::Text(value) => query.bind(value.clone()),
            SqlParam::Int(value) => query.bind(*value),
            SqlParam::Float(value) => query.bind(*value),
            SqlParam::Bool(value) => query.bind(*value),
            SqlParam::Timestamp(value) => query.bind(*value),
            SqlParam::TextArray(value) => query.bind(value.clone()),
        };
    }
    query
}

fn normalize_finalizers(metadata: &Metadata) -> Vec<String> {
    let mut finalizers = metadata.finalizers.clone();
    finalizers.sort();
    finalizers.dedup();
    finalizers
}

fn make_metadata(
    creation_ts: DateTime<Utc>,
    deletion_ts: DateTime<Utc>,
    finalizers: Vec<String>,
    creators: Vec<String>,
    tenants: Vec<String>,
) -> Metadata {
    Metadata {
        creation_timestamp: (creation_ts.timestamp() != 0).then_some(creation_ts),
        deletion_timestamp: (deletion_ts.timestamp() != 0).then_some(deletion_ts),
        finalizers,
        creators,
        tenants,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use foundry_api::private::Cluster;

    #[test]
    fn builder_rejects_bad_limits() {
        let err = GenericDao::<Cluster>::builder()
            .table("clusters")
            .default_limit(0)
            .build()
            .err()
            .expect("zero default limit should be rejected");
        assert!(err.to_string().contains("positive integer"));

        let err = GenericDao::<Cluster>::builder()
            .table("clusters")
            .default_limit(100)
            .max_limit(10)
            .build()
            .err()
            .expect("max below default should be rejected");
        assert!(err.to_string().contains("greater or equal"));
    }

    #[test]
    fn builder_requires_table() {
        assert!(GenericDao::<Cluster>::builder().build().is_err());
    }

    #[test]
    fn limit_clamping() {
        let dao = GenericDao::<Cluster>::builder()
            .table("clusters")
            .default_limit(100)
            .max_limit(1000)
            .build()
            .expect("builder should succeed");
        assert_eq!(dao.clamp_limit(-5), 0);
        assert_eq!(dao.clamp_limit(0), 100);
        assert_eq!(dao.clamp_limit(7), 7);
        assert_eq!(dao.clamp_limit(5000), 1000);
    }

    #[test]
    fn marshal_excludes_id_and_metadata() {
        let dao = GenericDao::<Cluster>::builder()
            .table("clusters")
            .build()
            .expect("builder should succeed");
        let mut cluster = Cluster::default();
        cluster.id = "c1".to_string();
        cluster.spec.template = "t1".to_string();
        cluster.metadata.finalizers.push("hold".to_string());

        let data = dao.marshal(&cluster).expect("marshal should succeed");
        assert!(data.get("id").is_none());
        assert!(data.get("metadata").is_none());
        assert_eq!(data["spec"]["template"], "t1");
    }

    #[test]
    fn finalizers_are_sorted_and_deduplicated() {
        let metadata = Metadata {
            finalizers: vec!["b".to_string(), "a".to_string(), "b".to_string()],
            ..Metadata::default()
        };
        assert_eq!(
            normalize_finalizers(&metadata),
            vec!["a".to_string(), "b".to_string()]
        );
    }

    #[test]
    fn metadata_epoch_timestamps_become_none() {
        let epoch = DateTime::<Utc>::from_timestamp(0, 0).expect("epoch is representable");
        let now = Utc::now();
        let metadata = make_metadata(now, epoch, Vec::new(), Vec::new(), Vec::new());
        assert_eq!(metadata.creation_timestamp, Some(now));
        assert_eq!(metadata.deletion_timestamp, None);
    }
}
