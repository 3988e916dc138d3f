//! Business transactions handed to handlers.
//!
//! These are separate from the store's bookkeeping transactions: the engine
//! opens one per unit (or one per tick in plain serial mode), commits it
//! when the unit reported no error and rolls it back otherwise.

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Transaction};

use rowqueue_core::TenantId;

use crate::error::HandlerError;

/// Opens and finishes business transactions.
#[async_trait]
pub trait TransactionProvider: Send + Sync + 'static {
    type Tx: Send + 'static;

    async fn begin(&self, tenant_id: TenantId) -> Result<Self::Tx, HandlerError>;

    async fn commit(&self, tx: Self::Tx) -> Result<(), HandlerError>;

    async fn rollback(&self, tx: Self::Tx) -> Result<(), HandlerError>;
}

/// For handlers that do not write to a transactional store.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTransactions;

#[async_trait]
impl TransactionProvider for NoopTransactions {
    type Tx = ();

    async fn begin(&self, _tenant_id: TenantId) -> Result<(), HandlerError> {
        Ok(())
    }

    async fn commit(&self, _tx: ()) -> Result<(), HandlerError> {
        Ok(())
    }

    async fn rollback(&self, _tx: ()) -> Result<(), HandlerError> {
        Ok(())
    }
}

/// Postgres transactions with the tenant exposed as `app.tenant_id`, so
/// row-level security policies can scope handler queries.
#[derive(Debug, Clone)]
pub struct PgTransactions {
    pool: PgPool,
}

impl PgTransactions {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TransactionProvider for PgTransactions {
    type Tx = Transaction<'static, Postgres>;

    async fn begin(&self, tenant_id: TenantId) -> Result<Self::Tx, HandlerError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| HandlerError::Transaction(format!("begin failed: {e}")))?;
        sqlx::query("SELECT set_config('app.tenant_id', $1, true)")
            .bind(tenant_id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(|e| HandlerError::Transaction(format!("tenant scoping failed: {e}")))?;
        Ok(tx)
    }

    async fn commit(&self, tx: Self::Tx) -> Result<(), HandlerError> {
        tx.commit()
            .await
            .map_err(|e| HandlerError::Transaction(format!("commit failed: {e}")))
    }

    async fn rollback(&self, tx: Self::Tx) -> Result<(), HandlerError> {
        tx.rollback()
            .await
            .map_err(|e| HandlerError::Transaction(format!("rollback failed: {e}")))
    }
}
