//! External collaborator seams
//!
//! The lifecycle engine never talks to the outside world directly; it goes
//! through these traits. Production implementations live in [`http`]; tests
//! substitute in-memory fakes.

pub mod http;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub use http::{
    HttpAccountClient, HttpBusinessDayCalculator, HttpLoanPackageClient, HttpMessageBus,
    HttpWorkflowClient, LogAlertSink,
};

/// Error from an external collaborator call
#[derive(Error, Debug)]
pub enum ExternalError {
    #[error("http transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("{service} returned status {status}: {body}")]
    Status {
        service: &'static str,
        status: u16,
        body: String,
    },

    #[error("failed to decode {service} response: {detail}")]
    Decode {
        service: &'static str,
        detail: String,
    },

    #[error("{0}")]
    Other(String),
}

/// An external margin loan package as resolved by the product service.
///
/// Resolution returns `Option<LoanPackage>`; absence is a first-class
/// outcome, and the rate fields cannot be read without checking it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoanPackage {
    pub id: i64,
    pub initial_rate: f64,
    pub interest_rate: f64,
    pub fee_rate: f64,
    pub term_days: i32,
}

impl LoanPackage {
    /// Loan rate offered to the investor: the complement of the initial rate
    pub fn loan_rate(&self) -> f64 {
        1.0 - self.initial_rate
    }
}

/// A loan-package account allocated to an investor account
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocatedAccount {
    pub id: i64,
    pub loan_package_id: i64,
    pub loan_rate: f64,
    pub interest_rate: f64,
}

/// Symbol descriptor for notification payloads
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Symbol {
    pub id: i64,
    pub code: String,
}

/// One of the investor's trading accounts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvestorAccount {
    pub account_no: String,
    pub description: String,
}

/// External financial-product service: package resolution and allocation
#[async_trait]
pub trait LoanPackageClient: Send + Sync {
    /// Resolve a single underlying package by id
    async fn get(&self, id: i64) -> Result<Option<LoanPackage>, ExternalError>;

    /// Resolve a batch of underlying packages; unresolvable ids are omitted
    async fn get_many(&self, ids: &[i64]) -> Result<Vec<LoanPackage>, ExternalError>;

    /// Resolve a derivative package by id
    async fn get_derivative(&self, id: i64) -> Result<Option<LoanPackage>, ExternalError>;

    /// Allocate a loan-package account for the investor account
    async fn allocate(
        &self,
        account_no: &str,
        loan_package_id: i64,
    ) -> Result<AllocatedAccount, ExternalError>;

    /// Look up a symbol descriptor
    async fn get_symbol(&self, id: i64) -> Result<Symbol, ExternalError>;
}

/// External date-arithmetic service (business-day offsets)
#[async_trait]
pub trait BusinessDayCalculator: Send + Sync {
    async fn add_business_days(
        &self,
        from: DateTime<Utc>,
        days: i64,
    ) -> Result<DateTime<Utc>, ExternalError>;
}

/// External long-running-workflow trigger
#[async_trait]
pub trait WorkflowClient: Send + Sync {
    /// Fire a named workflow with a structured state payload
    async fn trigger(&self, name: &str, state: serde_json::Value) -> Result<(), ExternalError>;
}

/// Message-bus publisher (topic + key + opaque payload bytes)
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, topic: &str, key: &str, payload: Vec<u8>)
        -> Result<(), ExternalError>;
}

/// Account-listing collaborator for notification routing
#[async_trait]
pub trait AccountClient: Send + Sync {
    async fn list_accounts(&self, investor_id: Uuid)
        -> Result<Vec<InvestorAccount>, ExternalError>;
}

/// Error/alert reporting sink for post-commit notification failures
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn notify_error(&self, context: &str, error: &str) -> Result<(), ExternalError>;
}
