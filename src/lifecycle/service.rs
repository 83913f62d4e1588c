//! Lifecycle orchestration - the use-case layer for the offer lifecycle
//!
//! Every operation here is a single atomic unit: load the gating rows with a
//! lock, validate the requested transitions against the transition table,
//! mutate, create dependents, commit. Notifications and workflow triggers
//! fire only after the commit, through the deferred dispatcher, so nothing
//! is announced that could still roll back.

use std::sync::Arc;

use chrono::{Duration, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::db::atomic;
use crate::error::LifecycleError;
use crate::external::{BusinessDayCalculator, LoanPackage, LoanPackageClient, WorkflowClient};
use crate::lifecycle::allocation::{allocate_all, AllocationResult};
use crate::lifecycle::model::{
    AcceptOutcome, Actor, AssetType, CancellationReason, DeclineOutcome, FlowType, InterestStatus,
    ListRequestsQuery, LoanContract, LoanOfferInterest, LoanPackageOffer, LoanPackageRequest,
    RequestStatus, RequestType, SubmissionSheet, SubmissionSheetDetail, SubmissionStatus,
};
use crate::lifecycle::repo::{
    self, NewContract, NewInterest, NewOffer, NewRequest, NewSubmissionDetail,
};
use crate::lifecycle::transition::{check_interest_transition, check_request_transition};
use crate::notify::Notifications;

/// Offers stay open this many business days after confirmation
const OFFER_EXPIRY_BUSINESS_DAYS: i64 = 3;

/// Workflow fired for online acceptances that need a net-new package
const WORKFLOW_CREATE_LOAN_PACKAGE: &str = "create-loan-package";

/// Orchestrates the financing-offer lifecycle
pub struct LifecycleService {
    db_pool: PgPool,
    packages: Arc<dyn LoanPackageClient>,
    calendar: Arc<dyn BusinessDayCalculator>,
    workflows: Arc<dyn WorkflowClient>,
    notifications: Notifications,
}

impl LifecycleService {
    pub fn new(
        db_pool: PgPool,
        packages: Arc<dyn LoanPackageClient>,
        calendar: Arc<dyn BusinessDayCalculator>,
        workflows: Arc<dyn WorkflowClient>,
        notifications: Notifications,
    ) -> Self {
        Self {
            db_pool,
            packages,
            calendar,
            workflows,
            notifications,
        }
    }

    /// Record a new financing request (Pending)
    pub async fn create_request(
        &self,
        new: NewRequest,
    ) -> Result<LoanPackageRequest, LifecycleError> {
        let mut conn = self.db_pool.acquire().await?;
        let request = repo::insert_request(&mut *conn, &new).await?;
        tracing::info!(request_id = %request.id, investor_id = %request.investor_id, "financing request created");
        Ok(request)
    }

    pub async fn get_request(&self, id: Uuid) -> Result<LoanPackageRequest, LifecycleError> {
        let mut conn = self.db_pool.acquire().await?;
        repo::get_request(&mut *conn, id).await
    }

    pub async fn list_requests(
        &self,
        query: &ListRequestsQuery,
    ) -> Result<(Vec<LoanPackageRequest>, i64), LifecycleError> {
        repo::list_requests(&self.db_pool, query).await
    }

    /// Confirm a pending request, creating one offer and one line.
    ///
    /// A supplied external loan package id selects the online flow and
    /// pre-fills the line from the resolved package; without one the offer
    /// is offline and gated on an approved submission sheet.
    pub async fn confirm_request(
        &self,
        admin: &str,
        request_id: Uuid,
        loan_package_id: Option<i64>,
    ) -> Result<(LoanPackageOffer, LoanOfferInterest), LifecycleError> {
        let flow = match loan_package_id {
            Some(_) => FlowType::OnlineAutomated,
            None => FlowType::OfflineManual,
        };

        // Resolution and date arithmetic have no dependency on the
        // transaction; keep them outside so the locks are held briefly.
        let package = match loan_package_id {
            Some(id) => Some(
                self.packages
                    .get(id)
                    .await?
                    .ok_or(LifecycleError::NotFound("loan package"))?,
            ),
            None => None,
        };
        let expired_at = self
            .calendar
            .add_business_days(Utc::now(), OFFER_EXPIRY_BUSINESS_DAYS)
            .await?;

        let admin = admin.to_owned();
        let (offer, interest, request) = atomic::execute(&self.db_pool, move |tx| {
            Box::pin(async move {
                let request = repo::lock_request(&mut **tx, request_id).await?;

                check_request_transition(request.status, RequestStatus::Confirmed, flow)?;
                if request.asset_type == AssetType::Derivative && flow == FlowType::OnlineAutomated
                {
                    return Err(LifecycleError::DerivativeMustBeOffline);
                }

                // The offline flow is only confirmable once underwriting
                // signed off; the line carries the approved terms.
                let terms = match package {
                    Some(pkg) => ConfirmTerms::Resolved(pkg),
                    None => {
                        let sheet = repo::latest_submission_sheet(&mut **tx, request_id)
                            .await?
                            .filter(|s| s.status == SubmissionStatus::Approved)
                            .ok_or(LifecycleError::SubmissionNotApproved)?;
                        let detail = repo::submission_detail_for_sheet(&mut **tx, sheet.id)
                            .await?
                            .ok_or(LifecycleError::NotFound("submission sheet detail"))?;
                        ConfirmTerms::Underwritten(detail)
                    }
                };

                let offer = repo::insert_offer(
                    &mut **tx,
                    &NewOffer {
                        request_id,
                        flow_type: flow,
                        offered_by: admin.clone(),
                        expired_at,
                    },
                )
                .await?;

                let new_interest = match &terms {
                    ConfirmTerms::Resolved(pkg) => NewInterest {
                        offer_id: offer.id,
                        loan_package_id: Some(pkg.id),
                        loan_rate: pkg.loan_rate(),
                        fee_rate: pkg.fee_rate,
                        interest_rate: pkg.interest_rate,
                        term_days: pkg.term_days,
                        asset_type: request.asset_type,
                        status: InterestStatus::Pending,
                        cancelled_by: None,
                        cancelled_reason: None,
                        submission_detail_id: None,
                    },
                    ConfirmTerms::Underwritten(detail) => NewInterest {
                        offer_id: offer.id,
                        loan_package_id: None,
                        loan_rate: detail.loan_rate,
                        fee_rate: detail.firm_buying_fee_rate,
                        interest_rate: detail.interest_rate,
                        term_days: detail.term_days,
                        asset_type: request.asset_type,
                        status: InterestStatus::Pending,
                        cancelled_by: None,
                        cancelled_reason: None,
                        submission_detail_id: Some(detail.id),
                    },
                };
                let interest = repo::insert_interest(&mut **tx, &new_interest).await?;

                repo::update_request_status(&mut **tx, request_id, RequestStatus::Confirmed)
                    .await?;

                Ok((offer, interest, request))
            })
        })
        .await?;

        tracing::info!(
            request_id = %request_id,
            offer_id = %offer.id,
            flow = %flow,
            "request confirmed"
        );
        self.notifications.offer_ready(
            request.investor_id,
            request.account_no,
            request.symbol_id,
            offer.id,
            flow,
        );

        Ok((offer, interest))
    }

    /// Decline a pending request while offering alternative packages.
    ///
    /// Creates one online offer carrying a pending line per resolved package
    /// plus exactly one pre-cancelled line that preserves the originally
    /// requested rate, so the superseded ask stays visible.
    pub async fn decline_with_alternatives(
        &self,
        admin: &str,
        request_id: Uuid,
        loan_package_ids: &[i64],
    ) -> Result<DeclineOutcome, LifecycleError> {
        if loan_package_ids.is_empty() {
            return Err(LifecycleError::InvalidLoanPackageIds);
        }

        let resolved = self.packages.get_many(loan_package_ids).await?;
        if resolved.len() != loan_package_ids.len() {
            return Err(LifecycleError::InvalidLoanPackageIds);
        }
        // Keep the caller's ordering: the first created line must be the
        // line for the first requested package.
        let mut ordered: Vec<LoanPackage> = Vec::with_capacity(loan_package_ids.len());
        for id in loan_package_ids {
            let pkg = resolved
                .iter()
                .find(|p| p.id == *id)
                .ok_or(LifecycleError::InvalidLoanPackageIds)?;
            ordered.push(pkg.clone());
        }

        let expired_at = self
            .calendar
            .add_business_days(Utc::now(), OFFER_EXPIRY_BUSINESS_DAYS)
            .await?;

        let admin = admin.to_owned();
        let (outcome, request) = atomic::execute(&self.db_pool, move |tx| {
            Box::pin(async move {
                let request = repo::lock_request(&mut **tx, request_id).await?;
                check_request_transition(
                    request.status,
                    RequestStatus::Cancelled,
                    FlowType::OnlineAutomated,
                )?;

                let offer = repo::insert_offer(
                    &mut **tx,
                    &NewOffer {
                        request_id,
                        flow_type: FlowType::OnlineAutomated,
                        offered_by: admin.clone(),
                        expired_at,
                    },
                )
                .await?;

                let mut first_interest_id = None;
                for pkg in &ordered {
                    let interest = repo::insert_interest(
                        &mut **tx,
                        &NewInterest {
                            offer_id: offer.id,
                            loan_package_id: Some(pkg.id),
                            loan_rate: pkg.loan_rate(),
                            fee_rate: pkg.fee_rate,
                            interest_rate: pkg.interest_rate,
                            term_days: pkg.term_days,
                            asset_type: request.asset_type,
                            status: InterestStatus::Pending,
                            cancelled_by: None,
                            cancelled_reason: None,
                            submission_detail_id: None,
                        },
                    )
                    .await?;
                    first_interest_id.get_or_insert(interest.id);
                }

                // The original ask is recorded as a pre-cancelled line so the
                // decline stays auditable next to its alternatives.
                repo::insert_interest(
                    &mut **tx,
                    &NewInterest {
                        offer_id: offer.id,
                        loan_package_id: None,
                        loan_rate: request.loan_rate,
                        fee_rate: 0.0,
                        interest_rate: 0.0,
                        term_days: 0,
                        asset_type: request.asset_type,
                        status: InterestStatus::Cancelled,
                        cancelled_by: Some(admin.clone()),
                        cancelled_reason: Some(CancellationReason::AlternativeOption),
                        submission_detail_id: None,
                    },
                )
                .await?;

                repo::update_request_status(&mut **tx, request_id, RequestStatus::Cancelled)
                    .await?;

                let outcome = DeclineOutcome {
                    first_interest_id: first_interest_id
                        .expect("at least one alternative line was created"),
                    offer_id: offer.id,
                };
                Ok((outcome, request))
            })
        })
        .await?;

        tracing::info!(
            request_id = %request_id,
            offer_id = %outcome.offer_id,
            alternatives = loan_package_ids.len(),
            "request declined with alternatives"
        );
        self.notifications.request_declined(
            request.investor_id,
            request.account_no,
            request.symbol_id,
            outcome.offer_id,
        );

        Ok(outcome)
    }

    /// Investor accepts one or more lines under a single offer.
    ///
    /// Lines that already carry a resolved package id are allocated
    /// concurrently and materialized into contracts inline; lines without
    /// one are moved to `CreatingLoanPackage` and handed to the external
    /// package-creation workflow after commit.
    pub async fn accept_offer_interests(
        &self,
        investor_id: Uuid,
        interest_ids: &[Uuid],
    ) -> Result<AcceptOutcome, LifecycleError> {
        if interest_ids.is_empty() {
            return Err(LifecycleError::NotFound("loan offer interest"));
        }

        let packages = Arc::clone(&self.packages);
        let ids = interest_ids.to_vec();
        let (outcome, offer, request) = atomic::execute(&self.db_pool, move |tx| {
            Box::pin(async move {
                let interests = repo::lock_interests(&mut **tx, &ids).await?;
                if interests.len() != ids.len() {
                    return Err(LifecycleError::NotFound("loan offer interest"));
                }

                let offer_id = interests[0].offer_id;
                if interests.iter().any(|i| i.offer_id != offer_id) {
                    return Err(LifecycleError::MixedOffers);
                }

                let offer = repo::get_offer(&mut **tx, offer_id).await?;
                let request = repo::get_request(&mut **tx, offer.request_id).await?;
                if request.investor_id != investor_id {
                    return Err(LifecycleError::NotOwner);
                }
                if offer.is_expired(Utc::now()) {
                    return Err(LifecycleError::OfferExpired);
                }
                // A line mid-creation means a previous accept is still in
                // flight; fail closed before any write.
                if interests
                    .iter()
                    .any(|i| i.status == InterestStatus::CreatingLoanPackage)
                {
                    return Err(LifecycleError::AlreadyCreating);
                }

                let underwritten = interests[0].loan_package_id.is_some();
                if interests
                    .iter()
                    .any(|i| i.loan_package_id.is_some() != underwritten)
                {
                    return Err(LifecycleError::InvalidLoanPackageIds);
                }

                let outcome = if underwritten {
                    let contracts =
                        accept_underwritten(tx, packages, &offer, &request, &interests).await?;
                    AcceptOutcome {
                        contracts,
                        creating: Vec::new(),
                    }
                } else {
                    for interest in &interests {
                        check_interest_transition(
                            interest.status,
                            InterestStatus::CreatingLoanPackage,
                            offer.flow_type,
                        )?;
                    }
                    for interest in &interests {
                        repo::update_interest_status(
                            &mut **tx,
                            interest.id,
                            InterestStatus::CreatingLoanPackage,
                        )
                        .await?;
                    }
                    AcceptOutcome {
                        contracts: Vec::new(),
                        creating: interests.iter().map(|i| i.id).collect(),
                    }
                };

                Ok((outcome, offer, request))
            })
        })
        .await?;

        if !outcome.creating.is_empty() {
            // Package creation is long-running; trigger the workflow outside
            // the unit of work so its lifetime never gates the commit.
            let workflows = Arc::clone(&self.workflows);
            let state = serde_json::json!({
                "request_id": request.id,
                "offer_id": offer.id,
                "interest_ids": outcome.creating.clone(),
                "investor_id": request.investor_id,
                "account_no": request.account_no.clone(),
            });
            self.notifications
                .dispatcher()
                .go("trigger loan package creation workflow", async move {
                    workflows
                        .trigger(WORKFLOW_CREATE_LOAN_PACKAGE, state)
                        .await?;
                    Ok(())
                });
        }

        if !outcome.contracts.is_empty() {
            tracing::info!(
                offer_id = %offer.id,
                contracts = outcome.contracts.len(),
                "offer interests accepted"
            );
            self.notifications.contracts_created(
                request.investor_id,
                request.account_no,
                request.symbol_id,
                outcome.contracts.iter().map(|c| c.id).collect(),
                offer.flow_type,
            );
        }

        Ok(outcome)
    }

    /// Cancel a line on behalf of the owning investor or an operator
    pub async fn cancel_offer_interest(
        &self,
        actor: Actor,
        interest_id: Uuid,
        reason: CancellationReason,
    ) -> Result<LoanOfferInterest, LifecycleError> {
        let interest = atomic::execute(&self.db_pool, move |tx| {
            Box::pin(async move {
                let interest = repo::lock_interest(&mut **tx, interest_id).await?;
                let offer = repo::get_offer(&mut **tx, interest.offer_id).await?;
                let request = repo::get_request(&mut **tx, offer.request_id).await?;

                if let Actor::Investor(id) = &actor {
                    if request.investor_id != *id {
                        return Err(LifecycleError::NotOwner);
                    }
                }

                check_interest_transition(
                    interest.status,
                    InterestStatus::Cancelled,
                    offer.flow_type,
                )?;

                repo::cancel_interest(&mut **tx, interest_id, &actor.name(), reason).await?;
                repo::lock_interest(&mut **tx, interest_id).await
            })
        })
        .await?;

        tracing::info!(interest_id = %interest_id, "offer interest cancelled");
        Ok(interest)
    }

    /// Assign an external loan id to an offline offer's line and materialize
    /// its contract, all in one unit.
    pub async fn assign_loan_id(
        &self,
        admin: &str,
        interest_id: Uuid,
        loan_id: i64,
    ) -> Result<LoanContract, LifecycleError> {
        let packages = Arc::clone(&self.packages);
        let (contract, offer, request) = atomic::execute(&self.db_pool, move |tx| {
            Box::pin(async move {
                let interest = repo::lock_interest(&mut **tx, interest_id).await?;
                let offer = repo::get_offer(&mut **tx, interest.offer_id).await?;
                if offer.flow_type != FlowType::OfflineManual {
                    return Err(LifecycleError::InvalidFlowType);
                }
                let request = repo::get_request(&mut **tx, offer.request_id).await?;

                check_interest_transition(
                    interest.status,
                    InterestStatus::LoanPackageCreated,
                    offer.flow_type,
                )?;

                // Underlying and derivative packages resolve through
                // different product-service calls.
                let package = match request.asset_type {
                    AssetType::Underlying => packages.get(loan_id).await?,
                    AssetType::Derivative => packages.get_derivative(loan_id).await?,
                }
                .ok_or(LifecycleError::NotFound("loan package"))?;

                repo::assign_interest_package(
                    &mut **tx,
                    interest_id,
                    package.id,
                    package.loan_rate(),
                    package.fee_rate,
                    package.interest_rate,
                    package.term_days,
                )
                .await?;

                // Allocation feeds contract creation, so it has to happen
                // inside the unit even though it is an external call.
                let allocated = packages.allocate(&request.account_no, package.id).await?;

                let contract = repo::insert_contract(
                    &mut **tx,
                    &NewContract {
                        interest_id,
                        loan_id: package.id,
                        loan_package_account_id: allocated.id,
                        investor_id: request.investor_id,
                        account_no: request.account_no.clone(),
                        symbol_id: request.symbol_id,
                        guaranteed_end_at: guaranteed_end(&request),
                    },
                )
                .await?;

                repo::update_interest_status(
                    &mut **tx,
                    interest_id,
                    InterestStatus::LoanPackageCreated,
                )
                .await?;

                Ok((contract, offer, request))
            })
        })
        .await?;

        tracing::info!(
            interest_id = %interest_id,
            contract_id = %contract.id,
            admin,
            "loan id assigned to offline line"
        );
        self.notifications.contracts_created(
            request.investor_id,
            request.account_no,
            request.symbol_id,
            vec![contract.id],
            offer.flow_type,
        );

        Ok(contract)
    }

    /// Open a submission sheet for offline underwriting of a pending request
    pub async fn submit_sheet(
        &self,
        request_id: Uuid,
        terms: NewSubmissionDetail,
    ) -> Result<SubmissionSheet, LifecycleError> {
        atomic::execute(&self.db_pool, move |tx| {
            Box::pin(async move {
                let request = repo::lock_request(&mut **tx, request_id).await?;
                if request.status != RequestStatus::Pending {
                    return Err(LifecycleError::InvalidTransition {
                        from: format!("{:?}", request.status),
                        to: "Submitted".to_string(),
                        flow: FlowType::OfflineManual,
                    });
                }
                // Re-submission is only possible after a rejection; the
                // latest non-rejected sheet wins.
                if repo::latest_submission_sheet(&mut **tx, request_id)
                    .await?
                    .is_some()
                {
                    return Err(LifecycleError::SubmissionAlreadyOpen);
                }

                let sheet = repo::insert_submission_sheet(&mut **tx, request_id).await?;
                repo::insert_submission_detail(&mut **tx, sheet.id, &terms).await?;
                Ok(sheet)
            })
        })
        .await
    }

    /// Approve or reject a submitted sheet
    pub async fn review_sheet(
        &self,
        sheet_id: Uuid,
        approve: bool,
    ) -> Result<SubmissionSheet, LifecycleError> {
        atomic::execute(&self.db_pool, move |tx| {
            Box::pin(async move {
                let sheet = repo::get_submission_sheet(&mut **tx, sheet_id).await?;
                if sheet.status != SubmissionStatus::Submitted {
                    return Err(LifecycleError::InvalidTransition {
                        from: format!("{:?}", sheet.status),
                        to: if approve { "Approved" } else { "Rejected" }.to_string(),
                        flow: FlowType::OfflineManual,
                    });
                }
                let status = if approve {
                    SubmissionStatus::Approved
                } else {
                    SubmissionStatus::Rejected
                };
                repo::update_submission_status(&mut **tx, sheet_id, status).await?;
                repo::get_submission_sheet(&mut **tx, sheet_id).await
            })
        })
        .await
    }
}

/// Where a confirmed line's terms come from: a resolved external package
/// (online) or the approved underwriting detail (offline). One of the two
/// always exists by the time the line is written.
enum ConfirmTerms {
    Resolved(LoanPackage),
    Underwritten(SubmissionSheetDetail),
}

/// Guaranteed requests carry an end date from acceptance time
fn guaranteed_end(request: &LoanPackageRequest) -> Option<chrono::DateTime<Utc>> {
    match (request.request_type, request.guaranteed_duration_days) {
        (RequestType::Guaranteed, Some(days)) => Some(Utc::now() + Duration::days(days as i64)),
        _ => None,
    }
}

/// Inline acceptance of underwritten lines: concurrent allocation, then per
/// line the terminal status flip plus its contract, then forced cancellation
/// of every sibling outside the accepted set. All inside the caller's unit.
async fn accept_underwritten(
    tx: &mut sqlx::Transaction<'static, sqlx::Postgres>,
    packages: Arc<dyn LoanPackageClient>,
    offer: &LoanPackageOffer,
    request: &LoanPackageRequest,
    interests: &[LoanOfferInterest],
) -> Result<Vec<LoanContract>, LifecycleError> {
    for interest in interests {
        can_reach_created(interest.status, offer.flow_type)?;
    }

    let pairs: Vec<(Uuid, i64)> = interests
        .iter()
        .map(|i| {
            let pkg = i
                .loan_package_id
                .ok_or(LifecycleError::InvalidLoanPackageIds)?;
            Ok((i.id, pkg))
        })
        .collect::<Result<_, LifecycleError>>()?;

    let allocations: Vec<AllocationResult> =
        allocate_all(packages, &request.account_no, &pairs).await?;

    let accepted_ids: Vec<Uuid> = interests.iter().map(|i| i.id).collect();
    let mut contracts = Vec::with_capacity(allocations.len());
    for allocation in &allocations {
        repo::update_interest_status(
            &mut **tx,
            allocation.interest_id,
            InterestStatus::LoanPackageCreated,
        )
        .await?;
        let contract = repo::insert_contract(
            &mut **tx,
            &NewContract {
                interest_id: allocation.interest_id,
                loan_id: allocation.loan_package_id,
                loan_package_account_id: allocation.loan_package_account_id,
                investor_id: request.investor_id,
                account_no: request.account_no.clone(),
                symbol_id: request.symbol_id,
                guaranteed_end_at: guaranteed_end(request),
            },
        )
        .await?;
        contracts.push(contract);
    }

    repo::cancel_sibling_interests(
        &mut **tx,
        offer.id,
        &accepted_ids,
        &request.investor_id.to_string(),
        CancellationReason::AlternativeOption,
    )
    .await?;

    Ok(contracts)
}

/// Check that a line can legally reach `LoanPackageCreated` under the flow.
///
/// The offline flow reaches it in one step; the online flow passes through
/// `CreatingLoanPackage`, so both hops are validated even though the row is
/// written once with the terminal status.
fn can_reach_created(current: InterestStatus, flow: FlowType) -> Result<(), LifecycleError> {
    match flow {
        FlowType::OfflineManual => {
            check_interest_transition(current, InterestStatus::LoanPackageCreated, flow)
        }
        FlowType::OnlineAutomated => {
            check_interest_transition(current, InterestStatus::CreatingLoanPackage, flow)?;
            check_interest_transition(
                InterestStatus::CreatingLoanPackage,
                InterestStatus::LoanPackageCreated,
                flow,
            )
        }
    }
}
