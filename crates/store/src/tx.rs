use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use crate::{CallContext, StoreError};

/// Owns the connection pool and scopes transactions to call contexts.
/// Nested begins attach nothing new; the outermost end is the one that
/// commits or rolls back.
#[derive(Clone)]
pub struct TxManager {
    pool: PgPool,
}

impl TxManager {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(db_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = tokio::time::timeout(
            Duration::from_secs(5),
            PgPoolOptions::new()
                .max_connections(max_connections)
                .connect(db_url),
        )
        .await
        .map_err(|_| StoreError::Sqlx(sqlx::Error::PoolTimedOut))??;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Attaches a transaction to the context unless one is already there.
    /// Returns whether this call started it; only the starter may end it.
    pub async fn begin(&self, ctx: &CallContext) -> Result<bool, StoreError> {
        let mut slot = ctx.tx_slot().await;
        if slot.is_some() {
            return Ok(false);
        }
        let tx = self.pool.begin().await?;
        *slot = Some(tx);
        Ok(true)
    }

    /// Ends the transaction this call started: commit on success, rollback
    /// when a failure was reported. A nested caller passes `started = false`
    /// and this is a no-op.
    pub async fn end(
        &self,
        ctx: &CallContext,
        started: bool,
        failed: bool,
    ) -> Result<(), StoreError> {
        if !started {
            return Ok(());
        }
        let mut slot = ctx.tx_slot().await;
        let Some(tx) = slot.take() else {
            return Ok(());
        };
        if failed {
            tx.rollback().await?;
        } else {
            tx.commit().await?;
        }
        Ok(())
    }
}
