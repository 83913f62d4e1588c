//! Deferred notification dispatch
//!
//! Notifications are strictly best-effort and fire once, after the
//! triggering transaction has committed. A notification failure is logged
//! and forwarded to the alert sink; it never rolls back, retries, or changes
//! the outcome of the committed lifecycle operation. A failure in the alert
//! sink itself is also logged.

use std::future::Future;
use std::sync::Arc;

use serde_json::json;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::LifecycleError;
use crate::external::{AccountClient, AlertSink, LoanPackageClient, MessageBus};
use crate::lifecycle::model::FlowType;

const TOPIC_OFFER_EVENTS: &str = "margin.offer.events";

/// Schedules post-commit work and reports its failures
#[derive(Clone)]
pub struct Dispatcher {
    alerts: Arc<dyn AlertSink>,
}

impl Dispatcher {
    pub fn new(alerts: Arc<dyn AlertSink>) -> Self {
        Self { alerts }
    }

    /// Run `fut` in the background. Errors are logged and forwarded to the
    /// alert sink; they never reach the caller.
    pub fn go<F>(&self, task: &'static str, fut: F) -> JoinHandle<()>
    where
        F: Future<Output = Result<(), LifecycleError>> + Send + 'static,
    {
        let alerts = Arc::clone(&self.alerts);
        tokio::spawn(async move {
            if let Err(err) = fut.await {
                tracing::error!(task, error = %err, "deferred task failed");
                if let Err(alert_err) = alerts.notify_error(task, &err.to_string()).await {
                    tracing::error!(
                        task,
                        error = %alert_err,
                        "failed to forward deferred-task failure to alert sink"
                    );
                }
            }
        })
    }
}

/// Builds and publishes investor-facing lifecycle notifications
#[derive(Clone)]
pub struct Notifications {
    dispatcher: Dispatcher,
    bus: Arc<dyn MessageBus>,
    accounts: Arc<dyn AccountClient>,
    packages: Arc<dyn LoanPackageClient>,
}

impl Notifications {
    pub fn new(
        dispatcher: Dispatcher,
        bus: Arc<dyn MessageBus>,
        accounts: Arc<dyn AccountClient>,
        packages: Arc<dyn LoanPackageClient>,
    ) -> Self {
        Self {
            dispatcher,
            bus,
            accounts,
            packages,
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// "Offer ready" after a confirmation, keyed by investor id
    pub fn offer_ready(
        &self,
        investor_id: Uuid,
        account_no: String,
        symbol_id: i64,
        offer_id: Uuid,
        flow: FlowType,
    ) -> JoinHandle<()> {
        self.publish_event(
            "notify offer ready",
            "offer_ready",
            investor_id,
            account_no,
            symbol_id,
            json!({ "offer_id": offer_id, "flow": flow }),
        )
    }

    /// "Request declined" carrying the replacement offer
    pub fn request_declined(
        &self,
        investor_id: Uuid,
        account_no: String,
        symbol_id: i64,
        offer_id: Uuid,
    ) -> JoinHandle<()> {
        self.publish_event(
            "notify request declined",
            "request_declined",
            investor_id,
            account_no,
            symbol_id,
            json!({ "offer_id": offer_id }),
        )
    }

    /// Confirmation that accepted lines materialized into contracts
    pub fn contracts_created(
        &self,
        investor_id: Uuid,
        account_no: String,
        symbol_id: i64,
        contract_ids: Vec<Uuid>,
        flow: FlowType,
    ) -> JoinHandle<()> {
        self.publish_event(
            "notify contracts created",
            "contracts_created",
            investor_id,
            account_no,
            symbol_id,
            json!({ "contract_ids": contract_ids, "flow": flow }),
        )
    }

    fn publish_event(
        &self,
        task: &'static str,
        event: &'static str,
        investor_id: Uuid,
        account_no: String,
        symbol_id: i64,
        detail: serde_json::Value,
    ) -> JoinHandle<()> {
        let bus = Arc::clone(&self.bus);
        let accounts = Arc::clone(&self.accounts);
        let packages = Arc::clone(&self.packages);

        self.dispatcher.go(task, async move {
            let symbol = packages.get_symbol(symbol_id).await?;

            // Investors with more than one account get a readable descriptor
            // so downstream routing can tell the accounts apart.
            let investor_accounts = accounts.list_accounts(investor_id).await?;
            let account_desc = if investor_accounts.len() > 1 {
                investor_accounts
                    .iter()
                    .find(|a| a.account_no == account_no)
                    .map(|a| a.description.clone())
            } else {
                None
            };

            let payload = json!({
                "event": event,
                "investor_id": investor_id,
                "account_no": account_no,
                "account_description": account_desc,
                "symbol": symbol.code,
                "detail": detail,
            });

            bus.publish(
                TOPIC_OFFER_EVENTS,
                &investor_id.to_string(),
                serde_json::to_vec(&payload)
                    .map_err(|e| LifecycleError::TaskFailed(e.to_string()))?,
            )
            .await?;

            Ok(())
        })
    }
}
