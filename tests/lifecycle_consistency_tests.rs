//! End-to-end consistency tests for the offer lifecycle
//!
//! These run against a real Postgres instance (TEST_DATABASE_URL) with the
//! external collaborators replaced by in-memory fakes, and verify that every
//! lifecycle operation leaves the four coupled tables consistent.

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use chrono::{DateTime, Duration, Utc};
    use sqlx::PgPool;
    use uuid::Uuid;

    use marginvault_server::error::LifecycleError;
    use marginvault_server::external::{
        AccountClient, AllocatedAccount, AlertSink, BusinessDayCalculator, ExternalError,
        InvestorAccount, LoanPackage, LoanPackageClient, MessageBus, Symbol, WorkflowClient,
    };
    use marginvault_server::lifecycle::model::{
        Actor, AssetType, CancellationReason, FlowType, InterestStatus, LoanOfferInterest,
        RequestStatus, RequestType, SubmissionStatus,
    };
    use marginvault_server::lifecycle::repo::{NewRequest, NewSubmissionDetail};
    use marginvault_server::lifecycle::{LifecycleService, SweepService};
    use marginvault_server::notify::{Dispatcher, Notifications};

    /// Helper to create a test database pool
    async fn setup_test_db() -> PgPool {
        let database_url = std::env::var("TEST_DATABASE_URL")
            .unwrap_or_else(|_| "postgresql://localhost/marginvault_test".to_string());

        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(5)
            .connect(&database_url)
            .await
            .expect("Failed to connect to test database");

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .expect("Failed to run migrations");

        pool
    }

    struct FakePackageClient {
        packages: HashMap<i64, LoanPackage>,
        fail_allocate_on: Option<i64>,
    }

    impl FakePackageClient {
        fn new() -> Self {
            let mut packages = HashMap::new();
            packages.insert(
                10,
                LoanPackage {
                    id: 10,
                    initial_rate: 0.3,
                    interest_rate: 0.155,
                    fee_rate: 0.001,
                    term_days: 90,
                },
            );
            packages.insert(
                20,
                LoanPackage {
                    id: 20,
                    initial_rate: 0.5,
                    interest_rate: 0.12,
                    fee_rate: 0.0015,
                    term_days: 180,
                },
            );
            Self {
                packages,
                fail_allocate_on: None,
            }
        }

        fn failing_allocation(package_id: i64) -> Self {
            Self {
                fail_allocate_on: Some(package_id),
                ..Self::new()
            }
        }
    }

    #[async_trait]
    impl LoanPackageClient for FakePackageClient {
        async fn get(&self, id: i64) -> Result<Option<LoanPackage>, ExternalError> {
            Ok(self.packages.get(&id).cloned())
        }

        async fn get_many(&self, ids: &[i64]) -> Result<Vec<LoanPackage>, ExternalError> {
            Ok(ids
                .iter()
                .filter_map(|id| self.packages.get(id).cloned())
                .collect())
        }

        async fn get_derivative(&self, id: i64) -> Result<Option<LoanPackage>, ExternalError> {
            Ok(self.packages.get(&id).cloned())
        }

        async fn allocate(
            &self,
            _account_no: &str,
            loan_package_id: i64,
        ) -> Result<AllocatedAccount, ExternalError> {
            if self.fail_allocate_on == Some(loan_package_id) {
                return Err(ExternalError::Other(format!(
                    "allocation refused for package {loan_package_id}"
                )));
            }
            let pkg = self
                .packages
                .get(&loan_package_id)
                .ok_or_else(|| ExternalError::Other("unknown package".to_string()))?;
            Ok(AllocatedAccount {
                id: 9000 + loan_package_id,
                loan_package_id,
                loan_rate: pkg.loan_rate(),
                interest_rate: pkg.interest_rate,
            })
        }

        async fn get_symbol(&self, id: i64) -> Result<Symbol, ExternalError> {
            Ok(Symbol {
                id,
                code: "MVLT".to_string(),
            })
        }
    }

    struct FakeCalendar;

    #[async_trait]
    impl BusinessDayCalculator for FakeCalendar {
        async fn add_business_days(
            &self,
            from: DateTime<Utc>,
            days: i64,
        ) -> Result<DateTime<Utc>, ExternalError> {
            Ok(from + Duration::days(days))
        }
    }

    #[derive(Default)]
    struct RecordingWorkflows {
        triggered: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl WorkflowClient for RecordingWorkflows {
        async fn trigger(
            &self,
            name: &str,
            _state: serde_json::Value,
        ) -> Result<(), ExternalError> {
            self.triggered.lock().unwrap().push(name.to_string());
            Ok(())
        }
    }

    struct NullBus;

    #[async_trait]
    impl MessageBus for NullBus {
        async fn publish(
            &self,
            _topic: &str,
            _key: &str,
            _payload: Vec<u8>,
        ) -> Result<(), ExternalError> {
            Ok(())
        }
    }

    struct SingleAccount;

    #[async_trait]
    impl AccountClient for SingleAccount {
        async fn list_accounts(
            &self,
            _investor_id: Uuid,
        ) -> Result<Vec<InvestorAccount>, ExternalError> {
            Ok(vec![InvestorAccount {
                account_no: "068C000001".to_string(),
                description: "Main".to_string(),
            }])
        }
    }

    struct NullAlertSink;

    #[async_trait]
    impl AlertSink for NullAlertSink {
        async fn notify_error(&self, _context: &str, _error: &str) -> Result<(), ExternalError> {
            Ok(())
        }
    }

    fn build_service(pool: PgPool) -> LifecycleService {
        build_service_with(pool, Arc::new(FakePackageClient::new()))
    }

    fn build_service_with(pool: PgPool, packages: Arc<FakePackageClient>) -> LifecycleService {
        let dispatcher = Dispatcher::new(Arc::new(NullAlertSink));
        let notifications = Notifications::new(
            dispatcher,
            Arc::new(NullBus),
            Arc::new(SingleAccount),
            packages.clone(),
        );
        LifecycleService::new(
            pool,
            packages,
            Arc::new(FakeCalendar),
            Arc::new(RecordingWorkflows::default()),
            notifications,
        )
    }

    fn new_request(investor_id: Uuid) -> NewRequest {
        NewRequest {
            investor_id,
            account_no: "068C000001".to_string(),
            symbol_id: 7,
            asset_type: AssetType::Underlying,
            loan_rate: 0.5,
            limit_amount: 1_000_000,
            contract_size: None,
            initial_rate: None,
            request_type: RequestType::Flexible,
            guaranteed_duration_days: None,
        }
    }

    async fn lines_for_offer(pool: &PgPool, offer_id: Uuid) -> Vec<LoanOfferInterest> {
        sqlx::query_as::<_, LoanOfferInterest>(
            "SELECT * FROM loan_offer_interests WHERE offer_id = $1 ORDER BY created_at, id",
        )
        .bind(offer_id)
        .fetch_all(pool)
        .await
        .expect("Failed to read offer lines")
    }

    #[tokio::test]
    #[ignore] // Requires database setup
    async fn test_online_confirm_creates_offer_with_resolved_terms() {
        let pool = setup_test_db().await;
        let service = build_service(pool.clone());

        let request = service
            .create_request(new_request(Uuid::new_v4()))
            .await
            .unwrap();
        assert_eq!(request.status, RequestStatus::Pending);

        // Package 10 has initial_rate 0.3, so the line's loan rate is 0.7
        let (offer, interest) = service
            .confirm_request("ops.kim", request.id, Some(10))
            .await
            .unwrap();

        assert_eq!(offer.flow_type, FlowType::OnlineAutomated);
        assert_eq!(interest.loan_package_id, Some(10));
        assert!((interest.loan_rate - 0.7).abs() < 1e-9);
        assert_eq!(interest.status, InterestStatus::Pending);

        let refreshed = service.get_request(request.id).await.unwrap();
        assert_eq!(refreshed.status, RequestStatus::Confirmed);
    }

    #[tokio::test]
    #[ignore] // Requires database setup
    async fn test_confirm_rejects_non_pending_request() {
        let pool = setup_test_db().await;
        let service = build_service(pool.clone());

        let request = service
            .create_request(new_request(Uuid::new_v4()))
            .await
            .unwrap();
        service
            .confirm_request("ops.kim", request.id, Some(10))
            .await
            .unwrap();

        let err = service
            .confirm_request("ops.kim", request.id, Some(20))
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::InvalidTransition { .. }));
    }

    #[tokio::test]
    #[ignore] // Requires database setup
    async fn test_decline_creates_alternatives_plus_audit_line() {
        let pool = setup_test_db().await;
        let service = build_service(pool.clone());

        let request = service
            .create_request(new_request(Uuid::new_v4()))
            .await
            .unwrap();

        let outcome = service
            .decline_with_alternatives("ops.kim", request.id, &[10, 20])
            .await
            .unwrap();

        let refreshed = service.get_request(request.id).await.unwrap();
        assert_eq!(refreshed.status, RequestStatus::Cancelled);

        let lines = lines_for_offer(&pool, outcome.offer_id).await;
        assert_eq!(lines.len(), 3);

        let pending: Vec<_> = lines
            .iter()
            .filter(|l| l.status == InterestStatus::Pending)
            .collect();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].id, outcome.first_interest_id);
        assert_eq!(pending[0].loan_package_id, Some(10));
        assert_eq!(pending[1].loan_package_id, Some(20));

        // The superseded ask survives as a pre-cancelled line at its rate
        let cancelled: Vec<_> = lines
            .iter()
            .filter(|l| l.status == InterestStatus::Cancelled)
            .collect();
        assert_eq!(cancelled.len(), 1);
        assert_eq!(cancelled[0].loan_package_id, None);
        assert!((cancelled[0].loan_rate - request.loan_rate).abs() < 1e-9);
        assert_eq!(
            cancelled[0].cancelled_reason,
            Some(CancellationReason::AlternativeOption)
        );
    }

    #[tokio::test]
    #[ignore] // Requires database setup
    async fn test_decline_with_unknown_package_changes_nothing() {
        let pool = setup_test_db().await;
        let service = build_service(pool.clone());

        let request = service
            .create_request(new_request(Uuid::new_v4()))
            .await
            .unwrap();

        let err = service
            .decline_with_alternatives("ops.kim", request.id, &[10, 999])
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::InvalidLoanPackageIds));

        // Nothing was written: the request is still pending with no offers
        let refreshed = service.get_request(request.id).await.unwrap();
        assert_eq!(refreshed.status, RequestStatus::Pending);

        let (offers,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM loan_package_offers WHERE request_id = $1",
        )
        .bind(request.id)
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(offers, 0);
    }

    #[tokio::test]
    #[ignore] // Requires database setup
    async fn test_accept_materializes_contract_and_cancels_siblings() {
        let pool = setup_test_db().await;
        let service = build_service(pool.clone());
        let investor_id = Uuid::new_v4();

        let request = service
            .create_request(new_request(investor_id))
            .await
            .unwrap();
        let outcome = service
            .decline_with_alternatives("ops.kim", request.id, &[10, 20])
            .await
            .unwrap();

        let accepted = service
            .accept_offer_interests(investor_id, &[outcome.first_interest_id])
            .await
            .unwrap();
        assert_eq!(accepted.contracts.len(), 1);
        assert!(accepted.creating.is_empty());
        assert_eq!(accepted.contracts[0].loan_id, 10);
        assert_eq!(accepted.contracts[0].investor_id, investor_id);

        let lines = lines_for_offer(&pool, outcome.offer_id).await;
        let created: Vec<_> = lines
            .iter()
            .filter(|l| l.status == InterestStatus::LoanPackageCreated)
            .collect();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].id, outcome.first_interest_id);

        // The non-accepted alternative was force-cancelled by the investor
        let sibling = lines
            .iter()
            .find(|l| l.loan_package_id == Some(20))
            .unwrap();
        assert_eq!(sibling.status, InterestStatus::Cancelled);
        assert_eq!(
            sibling.cancelled_reason,
            Some(CancellationReason::AlternativeOption)
        );
        assert_eq!(sibling.cancelled_by.as_deref(), Some(investor_id.to_string().as_str()));
    }

    #[tokio::test]
    #[ignore] // Requires database setup
    async fn test_accept_rejects_other_investors_and_repeat_accepts() {
        let pool = setup_test_db().await;
        let service = build_service(pool.clone());
        let investor_id = Uuid::new_v4();

        let request = service
            .create_request(new_request(investor_id))
            .await
            .unwrap();
        let outcome = service
            .decline_with_alternatives("ops.kim", request.id, &[10])
            .await
            .unwrap();

        let err = service
            .accept_offer_interests(Uuid::new_v4(), &[outcome.first_interest_id])
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::NotOwner));

        service
            .accept_offer_interests(investor_id, &[outcome.first_interest_id])
            .await
            .unwrap();

        // The line is terminal now; accepting again must fail closed
        let err = service
            .accept_offer_interests(investor_id, &[outcome.first_interest_id])
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::InvalidTransition { .. }));
    }

    #[tokio::test]
    #[ignore] // Requires database setup
    async fn test_failed_contract_insert_rolls_back_the_status_write() {
        let pool = setup_test_db().await;
        let service = build_service(pool.clone());
        let investor_id = Uuid::new_v4();

        let request = service
            .create_request(new_request(investor_id))
            .await
            .unwrap();
        let outcome = service
            .decline_with_alternatives("ops.kim", request.id, &[10])
            .await
            .unwrap();

        // A contract already exists for the line, so the accept's own
        // contract insert trips the unique constraint mid-unit, after the
        // status write.
        sqlx::query(
            r#"
            INSERT INTO loan_contracts (
                id, interest_id, loan_id, loan_package_account_id,
                investor_id, account_no, symbol_id, guaranteed_end_at, created_at
            )
            VALUES ($1, $2, 10, 9010, $3, '068C000001', 7, NULL, $4)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(outcome.first_interest_id)
        .bind(investor_id)
        .bind(Utc::now())
        .execute(&pool)
        .await
        .unwrap();

        let err = service
            .accept_offer_interests(investor_id, &[outcome.first_interest_id])
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::Database(_)));

        // The whole unit rolled back: the line reads back at its pre-call
        // status even though it was updated before the failing insert
        let lines = lines_for_offer(&pool, outcome.offer_id).await;
        let line = lines
            .iter()
            .find(|l| l.id == outcome.first_interest_id)
            .unwrap();
        assert_eq!(line.status, InterestStatus::Pending);

        let (contracts,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM loan_contracts WHERE interest_id = $1")
                .bind(outcome.first_interest_id)
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(contracts, 1);
    }

    #[tokio::test]
    #[ignore] // Requires database setup
    async fn test_one_failed_allocation_leaves_no_partial_contracts() {
        let pool = setup_test_db().await;
        let service =
            build_service_with(pool.clone(), Arc::new(FakePackageClient::failing_allocation(20)));
        let investor_id = Uuid::new_v4();

        let request = service
            .create_request(new_request(investor_id))
            .await
            .unwrap();
        let outcome = service
            .decline_with_alternatives("ops.kim", request.id, &[10, 20])
            .await
            .unwrap();

        let lines = lines_for_offer(&pool, outcome.offer_id).await;
        let accepted_ids: Vec<Uuid> = lines
            .iter()
            .filter(|l| l.status == InterestStatus::Pending)
            .map(|l| l.id)
            .collect();
        assert_eq!(accepted_ids.len(), 2);

        let err = service
            .accept_offer_interests(investor_id, &accepted_ids)
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::Upstream(_)));

        // The sibling allocation for package 10 succeeded, but the unit
        // rolled back as a whole: no contracts, every line still pending
        let (contracts,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM loan_contracts WHERE interest_id = ANY($1)",
        )
        .bind(&accepted_ids)
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(contracts, 0);

        let lines = lines_for_offer(&pool, outcome.offer_id).await;
        for id in &accepted_ids {
            let line = lines.iter().find(|l| l.id == *id).unwrap();
            assert_eq!(line.status, InterestStatus::Pending);
        }
    }

    #[tokio::test]
    #[ignore] // Requires database setup
    async fn test_accept_while_creation_in_flight_writes_nothing() {
        let pool = setup_test_db().await;
        let service = build_service(pool.clone());
        let investor_id = Uuid::new_v4();

        let request = service
            .create_request(new_request(investor_id))
            .await
            .unwrap();
        let outcome = service
            .decline_with_alternatives("ops.kim", request.id, &[10, 20])
            .await
            .unwrap();

        // A previous accept is still mid package creation on this line
        sqlx::query("UPDATE loan_offer_interests SET status = 'creating_loan_package' WHERE id = $1")
            .bind(outcome.first_interest_id)
            .execute(&pool)
            .await
            .unwrap();
        let before = lines_for_offer(&pool, outcome.offer_id).await;

        let err = service
            .accept_offer_interests(investor_id, &[outcome.first_interest_id])
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::AlreadyCreating));

        // No row under the offer changed and no contract appeared
        let after = lines_for_offer(&pool, outcome.offer_id).await;
        assert_eq!(before.len(), after.len());
        for (b, a) in before.iter().zip(after.iter()) {
            assert_eq!(b.id, a.id);
            assert_eq!(b.status, a.status);
            assert_eq!(b.updated_at, a.updated_at);
        }

        let (contracts,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM loan_contracts WHERE interest_id = $1",
        )
        .bind(outcome.first_interest_id)
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(contracts, 0);
    }

    #[tokio::test]
    #[ignore] // Requires database setup
    async fn test_accept_rejects_expired_offer() {
        let pool = setup_test_db().await;
        let service = build_service(pool.clone());
        let investor_id = Uuid::new_v4();

        let request = service
            .create_request(new_request(investor_id))
            .await
            .unwrap();
        let outcome = service
            .decline_with_alternatives("ops.kim", request.id, &[10])
            .await
            .unwrap();

        sqlx::query("UPDATE loan_package_offers SET expired_at = $1 WHERE id = $2")
            .bind(Utc::now() - Duration::days(1))
            .bind(outcome.offer_id)
            .execute(&pool)
            .await
            .unwrap();

        let err = service
            .accept_offer_interests(investor_id, &[outcome.first_interest_id])
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::OfferExpired));
    }

    #[tokio::test]
    #[ignore] // Requires database setup
    async fn test_investor_can_only_cancel_own_line() {
        let pool = setup_test_db().await;
        let service = build_service(pool.clone());
        let investor_id = Uuid::new_v4();

        let request = service
            .create_request(new_request(investor_id))
            .await
            .unwrap();
        let (_, interest) = service
            .confirm_request("ops.kim", request.id, Some(10))
            .await
            .unwrap();

        let err = service
            .cancel_offer_interest(
                Actor::Investor(Uuid::new_v4()),
                interest.id,
                CancellationReason::InvestorRequest,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::NotOwner));

        let cancelled = service
            .cancel_offer_interest(
                Actor::Investor(investor_id),
                interest.id,
                CancellationReason::InvestorRequest,
            )
            .await
            .unwrap();
        assert_eq!(cancelled.status, InterestStatus::Cancelled);
        assert_eq!(
            cancelled.cancelled_reason,
            Some(CancellationReason::InvestorRequest)
        );
        assert_eq!(
            cancelled.cancelled_by.as_deref(),
            Some(investor_id.to_string().as_str())
        );
    }

    #[tokio::test]
    #[ignore] // Requires database setup
    async fn test_offline_flow_submission_confirm_and_loan_assignment() {
        let pool = setup_test_db().await;
        let service = build_service(pool.clone());
        let investor_id = Uuid::new_v4();

        let request = service
            .create_request(new_request(investor_id))
            .await
            .unwrap();

        // Offline confirmation is gated on an approved submission sheet
        let err = service
            .confirm_request("ops.kim", request.id, None)
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::SubmissionNotApproved));

        let terms = NewSubmissionDetail {
            loan_rate: 0.65,
            firm_buying_fee_rate: 0.001,
            firm_selling_fee_rate: 0.001,
            transfer_fee_rate: 0.0005,
            interest_rate: 0.14,
            term_days: 120,
        };
        let sheet = service.submit_sheet(request.id, terms).await.unwrap();
        assert_eq!(sheet.status, SubmissionStatus::Submitted);

        let sheet = service.review_sheet(sheet.id, true).await.unwrap();
        assert_eq!(sheet.status, SubmissionStatus::Approved);

        let (offer, interest) = service
            .confirm_request("ops.kim", request.id, None)
            .await
            .unwrap();
        assert_eq!(offer.flow_type, FlowType::OfflineManual);
        assert_eq!(interest.loan_package_id, None);
        assert!((interest.loan_rate - 0.65).abs() < 1e-9);
        assert_eq!(interest.term_days, 120);
        assert!(interest.submission_detail_id.is_some());

        // Assigning the external loan id materializes the contract in the
        // same unit that flips the line to its terminal status
        let contract = service
            .assign_loan_id("ops.kim", interest.id, 20)
            .await
            .unwrap();
        assert_eq!(contract.loan_id, 20);
        assert_eq!(contract.loan_package_account_id, 9020);

        let lines = lines_for_offer(&pool, offer.id).await;
        assert_eq!(lines[0].status, InterestStatus::LoanPackageCreated);
        assert_eq!(lines[0].loan_package_id, Some(20));
    }

    #[tokio::test]
    #[ignore] // Requires database setup
    async fn test_second_sheet_rejected_while_one_is_open() {
        let pool = setup_test_db().await;
        let service = build_service(pool.clone());

        let request = service
            .create_request(new_request(Uuid::new_v4()))
            .await
            .unwrap();

        let terms = NewSubmissionDetail {
            loan_rate: 0.65,
            firm_buying_fee_rate: 0.001,
            firm_selling_fee_rate: 0.001,
            transfer_fee_rate: 0.0005,
            interest_rate: 0.14,
            term_days: 120,
        };
        let sheet = service
            .submit_sheet(request.id, terms.clone())
            .await
            .unwrap();

        let err = service
            .submit_sheet(request.id, terms.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::SubmissionAlreadyOpen));

        // A rejection reopens the door for a fresh submission
        service.review_sheet(sheet.id, false).await.unwrap();
        service.submit_sheet(request.id, terms).await.unwrap();
    }

    #[tokio::test]
    #[ignore] // Requires database setup
    async fn test_assign_loan_id_rejects_online_offers() {
        let pool = setup_test_db().await;
        let service = build_service(pool.clone());

        let request = service
            .create_request(new_request(Uuid::new_v4()))
            .await
            .unwrap();
        let (_, interest) = service
            .confirm_request("ops.kim", request.id, Some(10))
            .await
            .unwrap();

        let err = service
            .assign_loan_id("ops.kim", interest.id, 20)
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::InvalidFlowType));
    }

    #[tokio::test]
    #[ignore] // Requires database setup
    async fn test_expiry_sweep_is_idempotent() {
        let pool = setup_test_db().await;
        let service = build_service(pool.clone());
        let sweeps = SweepService::new(pool.clone(), Dispatcher::new(Arc::new(NullAlertSink)));

        let request = service
            .create_request(new_request(Uuid::new_v4()))
            .await
            .unwrap();
        let outcome = service
            .decline_with_alternatives("ops.kim", request.id, &[10, 20])
            .await
            .unwrap();

        sqlx::query("UPDATE loan_package_offers SET expired_at = $1 WHERE id = $2")
            .bind(Utc::now() - Duration::days(1))
            .bind(outcome.offer_id)
            .execute(&pool)
            .await
            .unwrap();

        let processed = sweeps.expire_overdue_offers().await.unwrap();
        assert!(processed.contains(&outcome.offer_id));

        let lines = lines_for_offer(&pool, outcome.offer_id).await;
        for line in lines
            .iter()
            .filter(|l| l.cancelled_reason != Some(CancellationReason::AlternativeOption))
        {
            assert_eq!(line.status, InterestStatus::Cancelled);
            assert_eq!(line.cancelled_by.as_deref(), Some("system"));
            assert_eq!(
                line.cancelled_reason,
                Some(CancellationReason::OfferExpired)
            );
        }

        // Second run finds nothing left to cancel on this offer
        let processed = sweeps.expire_overdue_offers().await.unwrap();
        assert!(!processed.contains(&outcome.offer_id));
    }

    #[tokio::test]
    #[ignore] // Requires database setup
    async fn test_high_risk_sweep_skips_non_pending_and_records_tracker() {
        let pool = setup_test_db().await;
        let service = build_service(pool.clone());
        let sweeps = SweepService::new(pool.clone(), Dispatcher::new(Arc::new(NullAlertSink)));

        let pending = service
            .create_request(new_request(Uuid::new_v4()))
            .await
            .unwrap();
        let confirmed = service
            .create_request(new_request(Uuid::new_v4()))
            .await
            .unwrap();
        service
            .confirm_request("ops.kim", confirmed.id, Some(10))
            .await
            .unwrap();

        let processed = sweeps
            .decline_high_risk_requests(&[pending.id, confirmed.id])
            .await
            .unwrap();
        assert_eq!(processed, vec![pending.id]);

        assert_eq!(
            service.get_request(pending.id).await.unwrap().status,
            RequestStatus::Cancelled
        );
        assert_eq!(
            service.get_request(confirmed.id).await.unwrap().status,
            RequestStatus::Confirmed
        );

        let (trackers,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM job_trackers WHERE job_type = 'decline_high_risk_requests'",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert!(trackers >= 1);
    }
}
