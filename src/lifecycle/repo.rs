//! Persistence queries for the lifecycle entities
//!
//! Every function takes the caller's connection handle explicitly: a
//! `&mut PgConnection` borrowed from the open transaction for work that is
//! part of a unit, or the pool for ambient reads. Locking reads use
//! `FOR UPDATE` so concurrent transitions against the same rows serialize
//! instead of racing past the transition check.

use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use crate::error::LifecycleError;
use crate::lifecycle::model::{
    AssetType, CancellationReason, FlowType, InterestStatus, JobTracker, ListRequestsQuery,
    LoanContract, LoanOfferInterest, LoanPackageOffer, LoanPackageRequest, RequestStatus,
    RequestType, SubmissionSheet, SubmissionSheetDetail, SubmissionStatus,
};

/// Fields for a new financing request row
#[derive(Debug, Clone, serde::Deserialize)]
pub struct NewRequest {
    pub investor_id: Uuid,
    pub account_no: String,
    pub symbol_id: i64,
    pub asset_type: AssetType,
    pub loan_rate: f64,
    pub limit_amount: i64,
    pub contract_size: Option<i64>,
    pub initial_rate: Option<f64>,
    pub request_type: RequestType,
    pub guaranteed_duration_days: Option<i32>,
}

/// Fields for a new offer row
#[derive(Debug, Clone)]
pub struct NewOffer {
    pub request_id: Uuid,
    pub flow_type: FlowType,
    pub offered_by: String,
    pub expired_at: DateTime<Utc>,
}

/// Fields for a new offer-interest (line) row
#[derive(Debug, Clone)]
pub struct NewInterest {
    pub offer_id: Uuid,
    pub loan_package_id: Option<i64>,
    pub loan_rate: f64,
    pub fee_rate: f64,
    pub interest_rate: f64,
    pub term_days: i32,
    pub asset_type: AssetType,
    pub status: InterestStatus,
    pub cancelled_by: Option<String>,
    pub cancelled_reason: Option<CancellationReason>,
    pub submission_detail_id: Option<Uuid>,
}

/// Underwriting terms submitted for the offline flow
#[derive(Debug, Clone, serde::Deserialize)]
pub struct NewSubmissionDetail {
    pub loan_rate: f64,
    pub firm_buying_fee_rate: f64,
    pub firm_selling_fee_rate: f64,
    pub transfer_fee_rate: f64,
    pub interest_rate: f64,
    pub term_days: i32,
}

/// Fields for a new contract row
#[derive(Debug, Clone)]
pub struct NewContract {
    pub interest_id: Uuid,
    pub loan_id: i64,
    pub loan_package_account_id: i64,
    pub investor_id: Uuid,
    pub account_no: String,
    pub symbol_id: i64,
    pub guaranteed_end_at: Option<DateTime<Utc>>,
}

pub async fn insert_request(
    conn: &mut PgConnection,
    new: &NewRequest,
) -> Result<LoanPackageRequest, LifecycleError> {
    let now = Utc::now();
    let request = sqlx::query_as::<_, LoanPackageRequest>(
        r#"
        INSERT INTO loan_package_requests (
            id, investor_id, account_no, symbol_id, asset_type,
            loan_rate, limit_amount, contract_size, initial_rate,
            request_type, guaranteed_duration_days, status, created_at, updated_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
        RETURNING *
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(new.investor_id)
    .bind(&new.account_no)
    .bind(new.symbol_id)
    .bind(new.asset_type)
    .bind(new.loan_rate)
    .bind(new.limit_amount)
    .bind(new.contract_size)
    .bind(new.initial_rate)
    .bind(new.request_type)
    .bind(new.guaranteed_duration_days)
    .bind(RequestStatus::Pending)
    .bind(now)
    .bind(now)
    .fetch_one(conn)
    .await?;

    Ok(request)
}

/// Read a request with a row lock inside the enclosing transaction
pub async fn lock_request(
    conn: &mut PgConnection,
    id: Uuid,
) -> Result<LoanPackageRequest, LifecycleError> {
    let request = sqlx::query_as::<_, LoanPackageRequest>(
        "SELECT * FROM loan_package_requests WHERE id = $1 FOR UPDATE",
    )
    .bind(id)
    .fetch_optional(conn)
    .await?
    .ok_or(LifecycleError::NotFound("loan package request"))?;

    Ok(request)
}

pub async fn get_request(
    conn: &mut PgConnection,
    id: Uuid,
) -> Result<LoanPackageRequest, LifecycleError> {
    let request = sqlx::query_as::<_, LoanPackageRequest>(
        "SELECT * FROM loan_package_requests WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(conn)
    .await?
    .ok_or(LifecycleError::NotFound("loan package request"))?;

    Ok(request)
}

pub async fn update_request_status(
    conn: &mut PgConnection,
    id: Uuid,
    status: RequestStatus,
) -> Result<(), LifecycleError> {
    sqlx::query("UPDATE loan_package_requests SET status = $1, updated_at = $2 WHERE id = $3")
        .bind(status)
        .bind(Utc::now())
        .bind(id)
        .execute(conn)
        .await?;

    Ok(())
}

pub async fn insert_offer(
    conn: &mut PgConnection,
    new: &NewOffer,
) -> Result<LoanPackageOffer, LifecycleError> {
    let offer = sqlx::query_as::<_, LoanPackageOffer>(
        r#"
        INSERT INTO loan_package_offers (id, request_id, flow_type, offered_by, expired_at, created_at)
        VALUES ($1, $2, $3, $4, $5, $6)
        RETURNING *
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(new.request_id)
    .bind(new.flow_type)
    .bind(&new.offered_by)
    .bind(new.expired_at)
    .bind(Utc::now())
    .fetch_one(conn)
    .await?;

    Ok(offer)
}

pub async fn get_offer(
    conn: &mut PgConnection,
    id: Uuid,
) -> Result<LoanPackageOffer, LifecycleError> {
    let offer =
        sqlx::query_as::<_, LoanPackageOffer>("SELECT * FROM loan_package_offers WHERE id = $1")
            .bind(id)
            .fetch_optional(conn)
            .await?
            .ok_or(LifecycleError::NotFound("loan package offer"))?;

    Ok(offer)
}

pub async fn insert_interest(
    conn: &mut PgConnection,
    new: &NewInterest,
) -> Result<LoanOfferInterest, LifecycleError> {
    let now = Utc::now();
    let cancelled_at = new.cancelled_reason.map(|_| now);
    let interest = sqlx::query_as::<_, LoanOfferInterest>(
        r#"
        INSERT INTO loan_offer_interests (
            id, offer_id, loan_package_id, loan_rate, fee_rate, interest_rate,
            term_days, asset_type, status, cancelled_by, cancelled_at,
            cancelled_reason, submission_detail_id, created_at, updated_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
        RETURNING *
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(new.offer_id)
    .bind(new.loan_package_id)
    .bind(new.loan_rate)
    .bind(new.fee_rate)
    .bind(new.interest_rate)
    .bind(new.term_days)
    .bind(new.asset_type)
    .bind(new.status)
    .bind(&new.cancelled_by)
    .bind(cancelled_at)
    .bind(new.cancelled_reason)
    .bind(new.submission_detail_id)
    .bind(now)
    .bind(now)
    .fetch_one(conn)
    .await?;

    Ok(interest)
}

/// Read a line with a row lock inside the enclosing transaction
pub async fn lock_interest(
    conn: &mut PgConnection,
    id: Uuid,
) -> Result<LoanOfferInterest, LifecycleError> {
    let interest = sqlx::query_as::<_, LoanOfferInterest>(
        "SELECT * FROM loan_offer_interests WHERE id = $1 FOR UPDATE",
    )
    .bind(id)
    .fetch_optional(conn)
    .await?
    .ok_or(LifecycleError::NotFound("loan offer interest"))?;

    Ok(interest)
}

/// Lock a set of lines. Ordered by id so two concurrent bulk accepts lock in
/// the same order instead of deadlocking.
pub async fn lock_interests(
    conn: &mut PgConnection,
    ids: &[Uuid],
) -> Result<Vec<LoanOfferInterest>, LifecycleError> {
    let interests = sqlx::query_as::<_, LoanOfferInterest>(
        "SELECT * FROM loan_offer_interests WHERE id = ANY($1) ORDER BY id FOR UPDATE",
    )
    .bind(ids)
    .fetch_all(conn)
    .await?;

    Ok(interests)
}

pub async fn update_interest_status(
    conn: &mut PgConnection,
    id: Uuid,
    status: InterestStatus,
) -> Result<(), LifecycleError> {
    sqlx::query("UPDATE loan_offer_interests SET status = $1, updated_at = $2 WHERE id = $3")
        .bind(status)
        .bind(Utc::now())
        .bind(id)
        .execute(conn)
        .await?;

    Ok(())
}

/// Assign the resolved external package (and its rates) to a line
pub async fn assign_interest_package(
    conn: &mut PgConnection,
    id: Uuid,
    loan_package_id: i64,
    loan_rate: f64,
    fee_rate: f64,
    interest_rate: f64,
    term_days: i32,
) -> Result<(), LifecycleError> {
    sqlx::query(
        r#"
        UPDATE loan_offer_interests
        SET loan_package_id = $1, loan_rate = $2, fee_rate = $3,
            interest_rate = $4, term_days = $5, updated_at = $6
        WHERE id = $7
        "#,
    )
    .bind(loan_package_id)
    .bind(loan_rate)
    .bind(fee_rate)
    .bind(interest_rate)
    .bind(term_days)
    .bind(Utc::now())
    .bind(id)
    .execute(conn)
    .await?;

    Ok(())
}

pub async fn cancel_interest(
    conn: &mut PgConnection,
    id: Uuid,
    cancelled_by: &str,
    reason: CancellationReason,
) -> Result<(), LifecycleError> {
    sqlx::query(
        r#"
        UPDATE loan_offer_interests
        SET status = $1, cancelled_by = $2, cancelled_at = $3,
            cancelled_reason = $4, updated_at = $3
        WHERE id = $5
        "#,
    )
    .bind(InterestStatus::Cancelled)
    .bind(cancelled_by)
    .bind(Utc::now())
    .bind(reason)
    .bind(id)
    .execute(conn)
    .await?;

    Ok(())
}

/// Cancel every still-pending sibling line under the offer that is not in
/// the accepted set. Returns the number of lines cancelled.
pub async fn cancel_sibling_interests(
    conn: &mut PgConnection,
    offer_id: Uuid,
    except: &[Uuid],
    cancelled_by: &str,
    reason: CancellationReason,
) -> Result<u64, LifecycleError> {
    let result = sqlx::query(
        r#"
        UPDATE loan_offer_interests
        SET status = $1, cancelled_by = $2, cancelled_at = $3,
            cancelled_reason = $4, updated_at = $3
        WHERE offer_id = $5 AND id != ALL($6) AND status = $7
        "#,
    )
    .bind(InterestStatus::Cancelled)
    .bind(cancelled_by)
    .bind(Utc::now())
    .bind(reason)
    .bind(offer_id)
    .bind(except)
    .bind(InterestStatus::Pending)
    .execute(conn)
    .await?;

    Ok(result.rows_affected())
}

pub async fn insert_contract(
    conn: &mut PgConnection,
    new: &NewContract,
) -> Result<LoanContract, LifecycleError> {
    let contract = sqlx::query_as::<_, LoanContract>(
        r#"
        INSERT INTO loan_contracts (
            id, interest_id, loan_id, loan_package_account_id,
            investor_id, account_no, symbol_id, guaranteed_end_at, created_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        RETURNING *
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(new.interest_id)
    .bind(new.loan_id)
    .bind(new.loan_package_account_id)
    .bind(new.investor_id)
    .bind(&new.account_no)
    .bind(new.symbol_id)
    .bind(new.guaranteed_end_at)
    .bind(Utc::now())
    .fetch_one(conn)
    .await?;

    Ok(contract)
}

/// Latest non-rejected submission sheet for a request, if any
pub async fn latest_submission_sheet(
    conn: &mut PgConnection,
    request_id: Uuid,
) -> Result<Option<SubmissionSheet>, LifecycleError> {
    let sheet = sqlx::query_as::<_, SubmissionSheet>(
        r#"
        SELECT * FROM submission_sheets
        WHERE request_id = $1 AND status != $2
        ORDER BY created_at DESC
        LIMIT 1
        "#,
    )
    .bind(request_id)
    .bind(SubmissionStatus::Rejected)
    .fetch_optional(conn)
    .await?;

    Ok(sheet)
}

pub async fn insert_submission_sheet(
    conn: &mut PgConnection,
    request_id: Uuid,
) -> Result<SubmissionSheet, LifecycleError> {
    let now = Utc::now();
    let sheet = sqlx::query_as::<_, SubmissionSheet>(
        r#"
        INSERT INTO submission_sheets (id, request_id, status, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $4)
        RETURNING *
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(request_id)
    .bind(SubmissionStatus::Submitted)
    .bind(now)
    .fetch_one(conn)
    .await?;

    Ok(sheet)
}

pub async fn get_submission_sheet(
    conn: &mut PgConnection,
    id: Uuid,
) -> Result<SubmissionSheet, LifecycleError> {
    let sheet = sqlx::query_as::<_, SubmissionSheet>("SELECT * FROM submission_sheets WHERE id = $1")
        .bind(id)
        .fetch_optional(conn)
        .await?
        .ok_or(LifecycleError::NotFound("submission sheet"))?;

    Ok(sheet)
}

pub async fn insert_submission_detail(
    conn: &mut PgConnection,
    sheet_id: Uuid,
    new: &NewSubmissionDetail,
) -> Result<SubmissionSheetDetail, LifecycleError> {
    let detail = sqlx::query_as::<_, SubmissionSheetDetail>(
        r#"
        INSERT INTO submission_sheet_details (
            id, sheet_id, loan_rate, firm_buying_fee_rate, firm_selling_fee_rate,
            transfer_fee_rate, interest_rate, term_days, created_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        RETURNING *
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(sheet_id)
    .bind(new.loan_rate)
    .bind(new.firm_buying_fee_rate)
    .bind(new.firm_selling_fee_rate)
    .bind(new.transfer_fee_rate)
    .bind(new.interest_rate)
    .bind(new.term_days)
    .bind(Utc::now())
    .fetch_one(conn)
    .await?;

    Ok(detail)
}

/// Detail row for the given sheet (offline underwriting terms)
pub async fn submission_detail_for_sheet(
    conn: &mut PgConnection,
    sheet_id: Uuid,
) -> Result<Option<SubmissionSheetDetail>, LifecycleError> {
    let detail = sqlx::query_as::<_, SubmissionSheetDetail>(
        "SELECT * FROM submission_sheet_details WHERE sheet_id = $1 ORDER BY created_at DESC LIMIT 1",
    )
    .bind(sheet_id)
    .fetch_optional(conn)
    .await?;

    Ok(detail)
}

pub async fn update_submission_status(
    conn: &mut PgConnection,
    id: Uuid,
    status: SubmissionStatus,
) -> Result<(), LifecycleError> {
    sqlx::query("UPDATE submission_sheets SET status = $1, updated_at = $2 WHERE id = $3")
        .bind(status)
        .bind(Utc::now())
        .bind(id)
        .execute(conn)
        .await?;

    Ok(())
}

/// Offers past their expiry that still carry pending lines
pub async fn find_expired_offer_ids(
    pool: &PgPool,
    now: DateTime<Utc>,
) -> Result<Vec<Uuid>, LifecycleError> {
    let ids = sqlx::query_as::<_, (Uuid,)>(
        r#"
        SELECT DISTINCT o.id
        FROM loan_package_offers o
        JOIN loan_offer_interests i ON i.offer_id = o.id
        WHERE o.expired_at < $1 AND i.status = $2
        "#,
    )
    .bind(now)
    .bind(InterestStatus::Pending)
    .fetch_all(pool)
    .await?;

    Ok(ids.into_iter().map(|(id,)| id).collect())
}

/// List requests with filters and pagination, plus the unpaginated count
pub async fn list_requests(
    pool: &PgPool,
    query: &ListRequestsQuery,
) -> Result<(Vec<LoanPackageRequest>, i64), LifecycleError> {
    let page = query.page.unwrap_or(1).max(1);
    let limit = query.limit.unwrap_or(20).clamp(1, 100);
    let offset = (page - 1) * limit;

    let mut list_builder: sqlx::QueryBuilder<sqlx::Postgres> =
        sqlx::QueryBuilder::new("SELECT * FROM loan_package_requests WHERE 1=1");
    let mut count_builder: sqlx::QueryBuilder<sqlx::Postgres> =
        sqlx::QueryBuilder::new("SELECT COUNT(*) FROM loan_package_requests WHERE 1=1");

    for builder in [&mut list_builder, &mut count_builder] {
        if let Some(investor_id) = query.investor_id {
            builder.push(" AND investor_id = ");
            builder.push_bind(investor_id);
        }
        if let Some(status) = query.status {
            builder.push(" AND status = ");
            builder.push_bind(status);
        }
        if let Some(symbol_id) = query.symbol_id {
            builder.push(" AND symbol_id = ");
            builder.push_bind(symbol_id);
        }
    }

    list_builder.push(" ORDER BY created_at DESC LIMIT ");
    list_builder.push_bind(limit as i64);
    list_builder.push(" OFFSET ");
    list_builder.push_bind(offset as i64);

    let requests = list_builder
        .build_query_as::<LoanPackageRequest>()
        .fetch_all(pool)
        .await?;

    let (total,) = count_builder
        .build_query_as::<(i64,)>()
        .fetch_one(pool)
        .await?;

    Ok((requests, total))
}

/// Persist a job-tracking record for a scheduler sweep
pub async fn insert_job_tracker(
    pool: &PgPool,
    job_type: &str,
    status: &str,
    triggered_by: &str,
    tracking: serde_json::Value,
) -> Result<JobTracker, LifecycleError> {
    let tracker = sqlx::query_as::<_, JobTracker>(
        r#"
        INSERT INTO job_trackers (id, job_type, status, triggered_by, tracking, created_at)
        VALUES ($1, $2, $3, $4, $5, $6)
        RETURNING *
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(job_type)
    .bind(status)
    .bind(triggered_by)
    .bind(tracking)
    .bind(Utc::now())
    .fetch_one(pool)
    .await?;

    Ok(tracker)
}
