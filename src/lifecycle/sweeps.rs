//! Scheduler sweeps
//!
//! Idempotent, re-entrant batch operations run on a schedule: expiring
//! overdue offers and declining flagged high-risk requests. Each sweep
//! persists a job-tracking record summarizing what it processed (or the
//! error it hit) so operational visibility does not depend on log
//! retention; tracker persistence is itself best-effort and never fails
//! the sweep's primary effect.

use chrono::Utc;
use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

use crate::db::atomic;
use crate::error::LifecycleError;
use crate::lifecycle::model::{CancellationReason, RequestStatus};
use crate::lifecycle::repo;
use crate::lifecycle::transition::check_request_transition;
use crate::notify::Dispatcher;

const JOB_EXPIRE_OFFERS: &str = "expire_overdue_offers";
const JOB_DECLINE_HIGH_RISK: &str = "decline_high_risk_requests";
const SYSTEM_ACTOR: &str = "system";

/// Batch maintenance over the lifecycle tables
#[derive(Clone)]
pub struct SweepService {
    db_pool: PgPool,
    dispatcher: Dispatcher,
}

impl SweepService {
    pub fn new(db_pool: PgPool, dispatcher: Dispatcher) -> Self {
        Self {
            db_pool,
            dispatcher,
        }
    }

    /// Cancel every still-pending line under offers past their expiry.
    ///
    /// Safe to re-run: only pending lines are touched, so an offer already
    /// swept is a no-op.
    pub async fn expire_overdue_offers(&self) -> Result<Vec<Uuid>, LifecycleError> {
        let now = Utc::now();
        let run = async {
            let offer_ids = repo::find_expired_offer_ids(&self.db_pool, now).await?;

            let mut processed = Vec::with_capacity(offer_ids.len());
            for offer_id in offer_ids {
                // One unit per offer: a failure on one offer leaves the
                // others' work committed.
                let cancelled = atomic::execute(&self.db_pool, move |tx| {
                    Box::pin(async move {
                        repo::cancel_sibling_interests(
                            &mut **tx,
                            offer_id,
                            &[],
                            SYSTEM_ACTOR,
                            CancellationReason::OfferExpired,
                        )
                        .await
                    })
                })
                .await?;

                if cancelled > 0 {
                    processed.push(offer_id);
                }
            }
            Ok::<_, LifecycleError>(processed)
        }
        .await;

        self.track(JOB_EXPIRE_OFFERS, &run).await;
        match &run {
            Ok(processed) => {
                tracing::info!(offers = processed.len(), "expired overdue offers");
            }
            Err(err) => {
                tracing::error!(error = %err, "expire-overdue-offers sweep failed");
            }
        }
        run
    }

    /// Cancel pending requests flagged as high risk by the risk collaborator.
    ///
    /// Takes ids so the sweep stays idempotent: a request that already left
    /// Pending is skipped, not failed.
    pub async fn decline_high_risk_requests(
        &self,
        request_ids: &[Uuid],
    ) -> Result<Vec<Uuid>, LifecycleError> {
        let run = async {
            let mut processed = Vec::with_capacity(request_ids.len());
            for &request_id in request_ids {
                let declined = atomic::execute(&self.db_pool, move |tx| {
                    Box::pin(async move {
                        let request = repo::lock_request(&mut **tx, request_id).await?;
                        if check_request_transition(
                            request.status,
                            RequestStatus::Cancelled,
                            crate::lifecycle::model::FlowType::OnlineAutomated,
                        )
                        .is_err()
                        {
                            // Already confirmed or cancelled; nothing to do.
                            return Ok(false);
                        }
                        repo::update_request_status(
                            &mut **tx,
                            request_id,
                            RequestStatus::Cancelled,
                        )
                        .await?;
                        Ok(true)
                    })
                })
                .await?;

                if declined {
                    processed.push(request_id);
                }
            }
            Ok::<_, LifecycleError>(processed)
        }
        .await;

        self.track(JOB_DECLINE_HIGH_RISK, &run).await;
        match &run {
            Ok(processed) => {
                tracing::info!(requests = processed.len(), "declined high-risk requests");
            }
            Err(err) => {
                tracing::error!(error = %err, "decline-high-risk sweep failed");
            }
        }
        run
    }

    /// Persist the sweep's tracking record; a tracker failure is reported
    /// through the dispatcher, never surfaced to the sweep.
    async fn track(&self, job_type: &'static str, run: &Result<Vec<Uuid>, LifecycleError>) {
        let (status, tracking) = match run {
            Ok(processed) => ("completed", json!({ "processed": processed })),
            Err(err) => ("failed", json!({ "error": err.to_string() })),
        };

        if let Err(err) = repo::insert_job_tracker(
            &self.db_pool,
            job_type,
            status,
            SYSTEM_ACTOR,
            tracking,
        )
        .await
        {
            tracing::warn!(job_type, error = %err, "failed to persist job tracker");
            let message = err.to_string();
            self.dispatcher.go("persist job tracker", async move {
                Err(LifecycleError::TaskFailed(message))
            });
        }
    }
}
