pub mod context;
pub mod dao;
pub mod filter;
pub mod notifier;
pub mod tx;

pub use context::CallContext;
pub use dao::{Event, EventCallback, GenericDao, GenericDaoBuilder, ListRequest, ListResponse};
pub use filter::{Filter, FilterError};
pub use notifier::{Notification, Notifier, NotifyCallback, EVENTS_CHANNEL};
pub use tx::TxManager;

#[derive(Debug)]
pub enum StoreError {
    /// Invalid store configuration, reported at build time.
    Config(String),
    /// An operation that needs an object identifier received none.
    MissingIdentifier,
    /// No transaction is attached to the call context.
    NoTransaction,
    /// A statement that must affect a row affected none. Callers may
    /// collapse this into an absent result.
    NoRows,
    Filter(FilterError),
    Serialization(serde_json::Error),
    Sqlx(sqlx::Error),
    Callback(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Config(message) => write!(f, "{}", message),
            StoreError::MissingIdentifier => write!(f, "object identifier is mandatory"),
            StoreError::NoTransaction => {
                write!(f, "no transaction is attached to the call context")
            }
            StoreError::NoRows => write!(f, "no matching row"),
            StoreError::Filter(err) => write!(f, "filter error: {}", err),
            StoreError::Serialization(err) => write!(f, "serialization error: {}", err),
            StoreError::Sqlx(err) => write!(f, "sql error: {}", err),
            StoreError::Callback(message) => write!(f, "event callback error: {}", message),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<sqlx::Error> for StoreError {
    fn from(value: sqlx::Error) -> Self {
        match value {
            sqlx::Error::RowNotFound => StoreError::NoRows,
            other => StoreError::Sqlx(other),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(value: serde_json::Error) -> Self {
        StoreError::Serialization(value)
    }
}

impl From<FilterError> for StoreError {
    fn from(value: FilterError) -> Self {
        StoreError::Filter(value)
    }
}

/// Applies the pending migrations.
pub async fn migrate(pool: &sqlx::PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}
