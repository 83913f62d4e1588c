//! API handlers for the MarginVault backend
//!
//! Thin wrappers over the lifecycle orchestrator: extract identifiers,
//! delegate, map domain errors onto HTTP.

use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::error::{ApiError, ApiResult};
use crate::lifecycle::model::{
    AcceptOutcome, AcceptRequest, Actor, CancellationReason, ConfirmRequest, DeclineOutcome,
    DeclineRequest, ListRequestsQuery, LoanContract, LoanOfferInterest, LoanPackageOffer,
    LoanPackageRequest, SubmissionSheet,
};
use crate::lifecycle::repo::{NewRequest, NewSubmissionDetail};

const OPERATOR_HEADER: &str = "x-operator";
const INVESTOR_HEADER: &str = "x-investor-id";

fn operator_from(headers: &HeaderMap) -> String {
    headers
        .get(OPERATOR_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("admin")
        .to_string()
}

fn investor_from(headers: &HeaderMap) -> ApiResult<Uuid> {
    let raw = headers
        .get(INVESTOR_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::BadRequest(format!("missing {INVESTOR_HEADER} header")))?;
    raw.parse::<Uuid>()
        .map_err(|_| ApiError::BadRequest(format!("invalid {INVESTOR_HEADER} header")))
}

/// Root endpoint
pub async fn root() -> Json<serde_json::Value> {
    Json(json!({ "service": "marginvault", "status": "ok" }))
}

/// Health check: verifies database connectivity
pub async fn health_check(State(state): State<AppState>) -> ApiResult<Json<serde_json::Value>> {
    if state.db.is_healthy().await {
        Ok(Json(json!({ "status": "healthy" })))
    } else {
        Err(ApiError::DatabaseError("health check failed".to_string()))
    }
}

/// Record a new financing request
pub async fn create_request(
    State(state): State<AppState>,
    Json(body): Json<NewRequest>,
) -> ApiResult<Json<LoanPackageRequest>> {
    let request = state.lifecycle.create_request(body).await?;
    Ok(Json(request))
}

pub async fn get_request(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<LoanPackageRequest>> {
    let request = state.lifecycle.get_request(id).await?;
    Ok(Json(request))
}

#[derive(Serialize)]
pub struct ListRequestsResponse {
    pub requests: Vec<LoanPackageRequest>,
    pub total: i64,
}

pub async fn list_requests(
    State(state): State<AppState>,
    Query(query): Query<ListRequestsQuery>,
) -> ApiResult<Json<ListRequestsResponse>> {
    let (requests, total) = state.lifecycle.list_requests(&query).await?;
    Ok(Json(ListRequestsResponse { requests, total }))
}

#[derive(Serialize)]
pub struct ConfirmResponse {
    pub offer: LoanPackageOffer,
    pub interest: LoanOfferInterest,
}

/// Confirm a pending request (operator)
pub async fn confirm_request(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    Json(body): Json<ConfirmRequest>,
) -> ApiResult<Json<ConfirmResponse>> {
    let admin = operator_from(&headers);
    let (offer, interest) = state
        .lifecycle
        .confirm_request(&admin, id, body.loan_package_id)
        .await?;
    Ok(Json(ConfirmResponse { offer, interest }))
}

/// Decline a pending request, offering alternatives (operator)
pub async fn decline_request(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    Json(body): Json<DeclineRequest>,
) -> ApiResult<Json<DeclineOutcome>> {
    let admin = operator_from(&headers);
    let outcome = state
        .lifecycle
        .decline_with_alternatives(&admin, id, &body.loan_package_ids)
        .await?;
    Ok(Json(outcome))
}

/// Investor accepts one or more lines under a single offer
pub async fn accept_interests(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<AcceptRequest>,
) -> ApiResult<Json<AcceptOutcome>> {
    let investor_id = investor_from(&headers)?;
    let outcome = state
        .lifecycle
        .accept_offer_interests(investor_id, &body.interest_ids)
        .await?;
    Ok(Json(outcome))
}

/// Cancel a line: investors may only cancel their own
pub async fn cancel_interest(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> ApiResult<Json<LoanOfferInterest>> {
    let (actor, reason) = if headers.contains_key(INVESTOR_HEADER) {
        (
            Actor::Investor(investor_from(&headers)?),
            CancellationReason::InvestorRequest,
        )
    } else {
        (
            Actor::Admin(operator_from(&headers)),
            CancellationReason::AdminRequest,
        )
    };
    let interest = state
        .lifecycle
        .cancel_offer_interest(actor, id, reason)
        .await?;
    Ok(Json(interest))
}

#[derive(Deserialize)]
pub struct AssignLoanBody {
    pub loan_id: i64,
}

/// Assign an external loan id to an offline line (operator)
pub async fn assign_loan_id(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    Json(body): Json<AssignLoanBody>,
) -> ApiResult<Json<LoanContract>> {
    let admin = operator_from(&headers);
    let contract = state.lifecycle.assign_loan_id(&admin, id, body.loan_id).await?;
    Ok(Json(contract))
}

/// Open a submission sheet for offline underwriting
pub async fn submit_sheet(
    State(state): State<AppState>,
    Path(request_id): Path<Uuid>,
    Json(body): Json<NewSubmissionDetail>,
) -> ApiResult<Json<SubmissionSheet>> {
    let sheet = state.lifecycle.submit_sheet(request_id, body).await?;
    Ok(Json(sheet))
}

#[derive(Deserialize)]
pub struct ReviewSheetBody {
    pub approve: bool,
}

/// Approve or reject a submitted sheet (operator)
pub async fn review_sheet(
    State(state): State<AppState>,
    Path(sheet_id): Path<Uuid>,
    Json(body): Json<ReviewSheetBody>,
) -> ApiResult<Json<SubmissionSheet>> {
    let sheet = state.lifecycle.review_sheet(sheet_id, body.approve).await?;
    Ok(Json(sheet))
}

#[derive(Deserialize)]
pub struct DeclineHighRiskBody {
    pub request_ids: Vec<Uuid>,
}

/// Trigger the high-risk decline sweep for a set of flagged requests
pub async fn decline_high_risk(
    State(state): State<AppState>,
    Json(body): Json<DeclineHighRiskBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let processed = state
        .sweeps
        .decline_high_risk_requests(&body.request_ids)
        .await?;
    Ok(Json(json!({ "processed": processed })))
}
