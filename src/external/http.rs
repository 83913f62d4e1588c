//! HTTP-backed implementations of the external collaborator traits
//!
//! Thin reqwest clients; each owns a base URL and a shared client. Wire
//! formats belong to the collaborators, so these only deserialize the few
//! fields the lifecycle engine consumes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use super::{
    AccountClient, AllocatedAccount, AlertSink, BusinessDayCalculator, ExternalError,
    InvestorAccount, LoanPackage, LoanPackageClient, MessageBus, Symbol, WorkflowClient,
};

async fn expect_success(
    service: &'static str,
    response: reqwest::Response,
) -> Result<reqwest::Response, ExternalError> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    Err(ExternalError::Status {
        service,
        status,
        body,
    })
}

/// Client for the financial-product service
#[derive(Clone)]
pub struct HttpLoanPackageClient {
    base_url: String,
    client: reqwest::Client,
}

impl HttpLoanPackageClient {
    pub fn new(base_url: String, client: reqwest::Client) -> Self {
        Self { base_url, client }
    }
}

#[async_trait]
impl LoanPackageClient for HttpLoanPackageClient {
    async fn get(&self, id: i64) -> Result<Option<LoanPackage>, ExternalError> {
        let response = self
            .client
            .get(format!("{}/v1/loan-packages/{}", self.base_url, id))
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = expect_success("loan-package", response).await?;
        let pkg = response
            .json::<LoanPackage>()
            .await
            .map_err(|e| ExternalError::Decode {
                service: "loan-package",
                detail: e.to_string(),
            })?;
        Ok(Some(pkg))
    }

    async fn get_many(&self, ids: &[i64]) -> Result<Vec<LoanPackage>, ExternalError> {
        let response = self
            .client
            .post(format!("{}/v1/loan-packages/batch", self.base_url))
            .json(&json!({ "ids": ids }))
            .send()
            .await?;
        let response = expect_success("loan-package", response).await?;
        response
            .json::<Vec<LoanPackage>>()
            .await
            .map_err(|e| ExternalError::Decode {
                service: "loan-package",
                detail: e.to_string(),
            })
    }

    async fn get_derivative(&self, id: i64) -> Result<Option<LoanPackage>, ExternalError> {
        let response = self
            .client
            .get(format!(
                "{}/v1/derivative-loan-packages/{}",
                self.base_url, id
            ))
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = expect_success("loan-package", response).await?;
        let pkg = response
            .json::<LoanPackage>()
            .await
            .map_err(|e| ExternalError::Decode {
                service: "loan-package",
                detail: e.to_string(),
            })?;
        Ok(Some(pkg))
    }

    async fn allocate(
        &self,
        account_no: &str,
        loan_package_id: i64,
    ) -> Result<AllocatedAccount, ExternalError> {
        let response = self
            .client
            .post(format!("{}/v1/loan-package-accounts", self.base_url))
            .json(&json!({
                "account_no": account_no,
                "loan_package_id": loan_package_id,
            }))
            .send()
            .await?;
        let response = expect_success("loan-package", response).await?;
        response
            .json::<AllocatedAccount>()
            .await
            .map_err(|e| ExternalError::Decode {
                service: "loan-package",
                detail: e.to_string(),
            })
    }

    async fn get_symbol(&self, id: i64) -> Result<Symbol, ExternalError> {
        let response = self
            .client
            .get(format!("{}/v1/symbols/{}", self.base_url, id))
            .send()
            .await?;
        let response = expect_success("loan-package", response).await?;
        response
            .json::<Symbol>()
            .await
            .map_err(|e| ExternalError::Decode {
                service: "loan-package",
                detail: e.to_string(),
            })
    }
}

/// Client for the business-day calendar service
#[derive(Clone)]
pub struct HttpBusinessDayCalculator {
    base_url: String,
    client: reqwest::Client,
}

impl HttpBusinessDayCalculator {
    pub fn new(base_url: String, client: reqwest::Client) -> Self {
        Self { base_url, client }
    }
}

#[derive(Deserialize)]
struct BusinessDayResponse {
    result: DateTime<Utc>,
}

#[async_trait]
impl BusinessDayCalculator for HttpBusinessDayCalculator {
    async fn add_business_days(
        &self,
        from: DateTime<Utc>,
        days: i64,
    ) -> Result<DateTime<Utc>, ExternalError> {
        let response = self
            .client
            .post(format!("{}/v1/business-days/offset", self.base_url))
            .json(&json!({ "from": from, "days": days }))
            .send()
            .await?;
        let response = expect_success("calendar", response).await?;
        let body = response
            .json::<BusinessDayResponse>()
            .await
            .map_err(|e| ExternalError::Decode {
                service: "calendar",
                detail: e.to_string(),
            })?;
        Ok(body.result)
    }
}

/// Client for the workflow engine
#[derive(Clone)]
pub struct HttpWorkflowClient {
    base_url: String,
    client: reqwest::Client,
}

impl HttpWorkflowClient {
    pub fn new(base_url: String, client: reqwest::Client) -> Self {
        Self { base_url, client }
    }
}

#[async_trait]
impl WorkflowClient for HttpWorkflowClient {
    async fn trigger(&self, name: &str, state: serde_json::Value) -> Result<(), ExternalError> {
        let response = self
            .client
            .post(format!("{}/v1/workflows/{}/trigger", self.base_url, name))
            .json(&state)
            .send()
            .await?;
        expect_success("workflow", response).await?;
        Ok(())
    }
}

/// Message-bus publisher over the bus's HTTP proxy
#[derive(Clone)]
pub struct HttpMessageBus {
    base_url: String,
    client: reqwest::Client,
}

impl HttpMessageBus {
    pub fn new(base_url: String, client: reqwest::Client) -> Self {
        Self { base_url, client }
    }
}

#[async_trait]
impl MessageBus for HttpMessageBus {
    async fn publish(
        &self,
        topic: &str,
        key: &str,
        payload: Vec<u8>,
    ) -> Result<(), ExternalError> {
        let response = self
            .client
            .post(format!("{}/v1/topics/{}/messages", self.base_url, topic))
            .header("x-message-key", key)
            .body(payload)
            .send()
            .await?;
        expect_success("message-bus", response).await?;
        Ok(())
    }
}

/// Client for the account-listing service
#[derive(Clone)]
pub struct HttpAccountClient {
    base_url: String,
    client: reqwest::Client,
}

impl HttpAccountClient {
    pub fn new(base_url: String, client: reqwest::Client) -> Self {
        Self { base_url, client }
    }
}

#[async_trait]
impl AccountClient for HttpAccountClient {
    async fn list_accounts(
        &self,
        investor_id: Uuid,
    ) -> Result<Vec<InvestorAccount>, ExternalError> {
        let response = self
            .client
            .get(format!(
                "{}/v1/investors/{}/accounts",
                self.base_url, investor_id
            ))
            .send()
            .await?;
        let response = expect_success("accounts", response).await?;
        response
            .json::<Vec<InvestorAccount>>()
            .await
            .map_err(|e| ExternalError::Decode {
                service: "accounts",
                detail: e.to_string(),
            })
    }
}

/// Alert sink that reports through the structured log stream.
///
/// Stands in where no external alerting endpoint is configured; the
/// dispatcher still gets a real sink to forward failures to.
#[derive(Clone, Default)]
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn notify_error(&self, context: &str, error: &str) -> Result<(), ExternalError> {
        tracing::error!(context, error, "lifecycle alert");
        Ok(())
    }
}
