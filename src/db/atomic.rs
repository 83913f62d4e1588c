//! Atomic unit-of-work executor
//!
//! Every lifecycle operation runs as one all-or-nothing database transaction
//! through [`execute`]. The open transaction is handed to the closure as an
//! explicit handle; repository calls receive `&mut PgConnection` from it, so
//! there is no ambient "are we in a transaction" state to get wrong. Work
//! that must run after commit simply never receives a handle.
//!
//! Units never nest: `execute` always begins a fresh transaction on the
//! pool, and orchestrator operations must not call one another inside a
//! unit. A panic inside the closure unwinds through `execute`; the sqlx
//! transaction drop guard rolls back before the panic propagates.

use futures_util::future::BoxFuture;
use sqlx::{PgPool, Postgres, Transaction};

use crate::error::LifecycleError;

/// Run `op` inside a single transaction.
///
/// Commits on `Ok` (returning the commit error instead if the commit
/// itself fails) and rolls back on `Err`, returning the operation's error
/// unchanged so callers can match on its variant.
pub async fn execute<T, F>(pool: &PgPool, op: F) -> Result<T, LifecycleError>
where
    F: for<'t> FnOnce(
        &'t mut Transaction<'static, Postgres>,
    ) -> BoxFuture<'t, Result<T, LifecycleError>>,
{
    let mut tx = pool.begin().await?;

    match op(&mut tx).await {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(err) => {
            // Preserve the operation error; a rollback failure only gets logged.
            if let Err(rollback_err) = tx.rollback().await {
                tracing::error!(error = %rollback_err, "transaction rollback failed");
            }
            Err(err)
        }
    }
}
