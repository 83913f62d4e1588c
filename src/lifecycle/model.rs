//! Lifecycle models for MarginVault
//!
//! Row types and status enums for the four coupled lifecycle entities:
//! request, offer, offer interest (line) and contract, plus the submission
//! sheet gating the offline flow and the job tracker for scheduler sweeps.

use serde::{Deserialize, Serialize};
use sqlx::types::chrono::{DateTime, Utc};
use uuid::Uuid;

/// Asset class a financing request is written against
#[derive(Debug, Serialize, Deserialize, sqlx::Type, Clone, Copy, PartialEq, Eq)]
#[sqlx(type_name = "asset_type", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum AssetType {
    Underlying,
    Derivative,
}

/// Flexible financing vs guaranteed-duration financing
#[derive(Debug, Serialize, Deserialize, sqlx::Type, Clone, Copy, PartialEq, Eq)]
#[sqlx(type_name = "request_type", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum RequestType {
    Flexible,
    Guaranteed,
}

/// Request status. Pending is the only non-terminal state; a request is
/// confirmed exactly once, or cancelled when declined with alternatives.
#[derive(Debug, Serialize, Deserialize, sqlx::Type, Clone, Copy, PartialEq, Eq)]
#[sqlx(type_name = "request_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Pending,
    Confirmed,
    Cancelled,
}

/// How an offer was produced: resolved automatically against an existing
/// external loan package, or underwritten manually via a submission sheet.
#[derive(Debug, Serialize, Deserialize, sqlx::Type, Clone, Copy, PartialEq, Eq, Hash)]
#[sqlx(type_name = "flow_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum FlowType {
    OnlineAutomated,
    OfflineManual,
}

impl FlowType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlowType::OnlineAutomated => "online_automated",
            FlowType::OfflineManual => "offline_manual",
        }
    }
}

impl std::fmt::Display for FlowType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Offer interest (line) status
#[derive(Debug, Serialize, Deserialize, sqlx::Type, Clone, Copy, PartialEq, Eq, Hash)]
#[sqlx(type_name = "interest_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum InterestStatus {
    Pending,
    CreatingLoanPackage,
    LoanPackageCreated,
    Cancelled,
}

impl InterestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InterestStatus::Pending => "pending",
            InterestStatus::CreatingLoanPackage => "creating_loan_package",
            InterestStatus::LoanPackageCreated => "loan_package_created",
            InterestStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for InterestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Why a line was cancelled
#[derive(Debug, Serialize, Deserialize, sqlx::Type, Clone, Copy, PartialEq, Eq)]
#[sqlx(type_name = "cancellation_reason", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CancellationReason {
    /// Superseded by a sibling line the investor accepted instead
    AlternativeOption,
    InvestorRequest,
    AdminRequest,
    OfferExpired,
    HighRisk,
}

/// Submission sheet status (offline underwriting), independent of but gating
/// request confirmation.
#[derive(Debug, Serialize, Deserialize, sqlx::Type, Clone, Copy, PartialEq, Eq)]
#[sqlx(type_name = "submission_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SubmissionStatus {
    Submitted,
    Approved,
    Rejected,
}

/// An investor's ask for financing against a symbol/account
#[derive(Debug, Serialize, Deserialize, sqlx::FromRow, Clone)]
pub struct LoanPackageRequest {
    pub id: Uuid,
    pub investor_id: Uuid,
    pub account_no: String,
    pub symbol_id: i64,
    pub asset_type: AssetType,
    /// Requested loan rate (underlying requests)
    pub loan_rate: f64,
    pub limit_amount: i64,
    /// Contract size (derivative requests)
    pub contract_size: Option<i64>,
    /// Initial rate (derivative requests)
    pub initial_rate: Option<f64>,
    pub request_type: RequestType,
    pub guaranteed_duration_days: Option<i32>,
    pub status: RequestStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One confirmation round issued against a request
#[derive(Debug, Serialize, Deserialize, sqlx::FromRow, Clone)]
pub struct LoanPackageOffer {
    pub id: Uuid,
    pub request_id: Uuid,
    pub flow_type: FlowType,
    pub offered_by: String,
    pub expired_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl LoanPackageOffer {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expired_at < now
    }
}

/// One candidate loan-package proposal within an offer
#[derive(Debug, Serialize, Deserialize, sqlx::FromRow, Clone)]
pub struct LoanOfferInterest {
    pub id: Uuid,
    pub offer_id: Uuid,
    /// External loan package id; None until a package is resolved/assigned
    pub loan_package_id: Option<i64>,
    pub loan_rate: f64,
    pub fee_rate: f64,
    pub interest_rate: f64,
    pub term_days: i32,
    pub asset_type: AssetType,
    pub status: InterestStatus,
    pub cancelled_by: Option<String>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub cancelled_reason: Option<CancellationReason>,
    /// Set when the line originated from a manual underwriting submission
    pub submission_detail_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The materialized accepted loan, created in the same transaction that
/// flips its line to `LoanPackageCreated`.
#[derive(Debug, Serialize, Deserialize, sqlx::FromRow, Clone)]
pub struct LoanContract {
    pub id: Uuid,
    pub interest_id: Uuid,
    pub loan_id: i64,
    pub loan_package_account_id: i64,
    pub investor_id: Uuid,
    pub account_no: String,
    pub symbol_id: i64,
    pub guaranteed_end_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Underwriting proposal for the offline flow
#[derive(Debug, Serialize, Deserialize, sqlx::FromRow, Clone)]
pub struct SubmissionSheet {
    pub id: Uuid,
    pub request_id: Uuid,
    pub status: SubmissionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, sqlx::FromRow, Clone)]
pub struct SubmissionSheetDetail {
    pub id: Uuid,
    pub sheet_id: Uuid,
    pub loan_rate: f64,
    pub firm_buying_fee_rate: f64,
    pub firm_selling_fee_rate: f64,
    pub transfer_fee_rate: f64,
    pub interest_rate: f64,
    pub term_days: i32,
    pub created_at: DateTime<Utc>,
}

/// Observability record persisted by scheduler sweeps
#[derive(Debug, Serialize, Deserialize, sqlx::FromRow, Clone)]
pub struct JobTracker {
    pub id: Uuid,
    pub job_type: String,
    pub status: String,
    pub triggered_by: String,
    pub tracking: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Who is acting on a line: the owning investor or an operator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Actor {
    Investor(Uuid),
    Admin(String),
}

impl Actor {
    /// Name recorded in cancellation metadata
    pub fn name(&self) -> String {
        match self {
            Actor::Investor(id) => id.to_string(),
            Actor::Admin(name) => name.clone(),
        }
    }
}

/// Request to confirm a pending financing request
#[derive(Debug, Deserialize)]
pub struct ConfirmRequest {
    /// Pre-chosen external loan package id; presence selects the online flow
    pub loan_package_id: Option<i64>,
}

/// Request to decline a pending request while offering alternatives
#[derive(Debug, Deserialize)]
pub struct DeclineRequest {
    pub loan_package_ids: Vec<i64>,
}

/// Result of a decline-with-alternatives call
#[derive(Debug, Serialize)]
pub struct DeclineOutcome {
    pub first_interest_id: Uuid,
    pub offer_id: Uuid,
}

/// Request to accept one or more lines under a single offer
#[derive(Debug, Deserialize)]
pub struct AcceptRequest {
    pub interest_ids: Vec<Uuid>,
}

/// Outcome of an accept call
#[derive(Debug, Serialize)]
pub struct AcceptOutcome {
    /// Contracts created inline (offline/underwritten path)
    pub contracts: Vec<LoanContract>,
    /// Lines handed to the external package-creation workflow (online path)
    pub creating: Vec<Uuid>,
}

/// Query for listing requests
#[derive(Debug, Default, Deserialize)]
pub struct ListRequestsQuery {
    pub investor_id: Option<Uuid>,
    pub status: Option<RequestStatus>,
    pub symbol_id: Option<i64>,
    pub page: Option<u32>,
    pub limit: Option<u32>,
}
