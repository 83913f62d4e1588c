//! Concurrent allocation fan-out
//!
//! Multi-line acceptance allocates one loan-package account per line. The
//! calls go out concurrently, one task per line, bounded by the set of lines
//! in the request; the collaborator applies its own backpressure. Results
//! land in a shared accumulator; the first failure aborts the remaining
//! tasks and becomes the single operation error, so the enclosing
//! transaction rolls back with no partial contracts.

use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::error::LifecycleError;
use crate::external::LoanPackageClient;

/// One successful allocation, keyed back to its line
#[derive(Debug, Clone)]
pub struct AllocationResult {
    pub interest_id: Uuid,
    pub loan_package_id: i64,
    pub loan_package_account_id: i64,
    pub loan_rate: f64,
    pub interest_rate: f64,
}

/// Allocate a loan-package account for every `(line id, package id)` pair.
///
/// Returns one result per pair on full success; returns the first error
/// otherwise, after aborting the still-running siblings.
pub async fn allocate_all(
    client: Arc<dyn LoanPackageClient>,
    account_no: &str,
    lines: &[(Uuid, i64)],
) -> Result<Vec<AllocationResult>, LifecycleError> {
    let results = Arc::new(Mutex::new(Vec::with_capacity(lines.len())));
    let mut tasks = JoinSet::new();

    for &(interest_id, loan_package_id) in lines {
        let client = Arc::clone(&client);
        let account_no = account_no.to_owned();
        let results = Arc::clone(&results);

        tasks.spawn(async move {
            let allocated = client.allocate(&account_no, loan_package_id).await?;
            results.lock().await.push(AllocationResult {
                interest_id,
                loan_package_id,
                loan_package_account_id: allocated.id,
                loan_rate: allocated.loan_rate,
                interest_rate: allocated.interest_rate,
            });
            Ok::<(), LifecycleError>(())
        });
    }

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                tasks.abort_all();
                return Err(err);
            }
            Err(join_err) => {
                tasks.abort_all();
                return Err(LifecycleError::TaskFailed(join_err.to_string()));
            }
        }
    }

    let mut collected = results.lock().await;
    Ok(std::mem::take(&mut *collected))
}
