use std::sync::Arc;

use foundry_auth::Subject;
use sqlx::postgres::PgConnection;
use sqlx::{Postgres, Transaction};
use tokio::sync::{Mutex, MutexGuard};

use crate::StoreError;

/// Per-call context carried through the service: the authenticated subject
/// and the transaction attached by the transaction manager. Cheap to clone;
/// clones share the same transaction slot.
#[derive(Clone)]
pub struct CallContext {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    subject: Option<Subject>,
    tx: Mutex<Option<Transaction<'static, Postgres>>>,
}

impl CallContext {
    pub fn new(subject: Option<Subject>) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                subject,
                tx: Mutex::new(None),
            }),
        }
    }

    /// Context for internal work that runs outside an authenticated call,
    /// such as the controllers.
    pub fn background() -> Self {
        Self::new(None)
    }

    /// The subject of the call, absent on background work and on public
    /// calls without a header. The attribution logic treats absence on a
    /// create path as a programming error.
    pub fn subject_opt(&self) -> Option<&Subject> {
        self.inner.subject.as_ref()
    }

    /// The attached transaction. Errors when the transaction manager has not
    /// begun one on this context.
    pub async fn tx(&self) -> Result<TxGuard<'_>, StoreError> {
        let guard = self.inner.tx.lock().await;
        if guard.is_none() {
            return Err(StoreError::NoTransaction);
        }
        Ok(TxGuard { guard })
    }

    pub(crate) async fn tx_slot(&self) -> MutexGuard<'_, Option<Transaction<'static, Postgres>>> {
        self.inner.tx.lock().await
    }
}

/// Exclusive access to the context transaction for the duration of a store
/// operation.
pub struct TxGuard<'a> {
    guard: MutexGuard<'a, Option<Transaction<'static, Postgres>>>,
}

impl TxGuard<'_> {
    pub fn conn(&mut self) -> &mut PgConnection {
        let tx = self
            .guard
            .as_mut()
            .expect("transaction present, checked on acquisition");
        &mut **tx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subject_accessor_returns_the_attached_subject() {
        let ctx = CallContext::new(Some(Subject::new("jane.doe", Vec::new())));
        let subject = ctx.subject_opt().expect("subject should be attached");
        assert_eq!(subject.user, "jane.doe");
    }

    #[test]
    fn background_context_has_no_subject() {
        let ctx = CallContext::background();
        assert!(ctx.subject_opt().is_none());
    }

    #[tokio::test]
    async fn tx_accessor_errors_without_transaction() {
        let ctx = CallContext::background();
        let err = ctx.tx().await.err().expect("no transaction is attached");
        assert!(matches!(err, StoreError::NoTransaction));
    }
}
