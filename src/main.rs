//! MarginVault Backend Server
//!
//! This is the main Rust backend server for MarginVault, orchestrating the
//! lifecycle of margin-loan financing offers: confirmation, decline with
//! alternatives, investor acceptance, cancellation, and loan-id assignment,
//! plus scheduled sweeps for expired offers.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::http::{HeaderValue, Method};
use axum::routing::get;
use axum::Router;
use tokio::signal;
use tokio_cron_scheduler::{Job, JobScheduler};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use marginvault_server::app_state::AppState;
use marginvault_server::config::Config;
use marginvault_server::db;
use marginvault_server::external::{
    HttpAccountClient, HttpBusinessDayCalculator, HttpLoanPackageClient, HttpMessageBus,
    HttpWorkflowClient, LogAlertSink,
};
use marginvault_server::handlers;
use marginvault_server::lifecycle::{LifecycleService, SweepService};
use marginvault_server::notify::{Dispatcher, Notifications};
use marginvault_server::routes;

#[tokio::main]
async fn main() {
    // Load configuration
    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .with_target(true)
        .init();

    tracing::info!(
        environment = config.environment.as_str(),
        "Starting MarginVault server"
    );

    // Initialize database connection pool and run migrations
    let db_pool = match db::create_pool(&config).await {
        Ok(pool) => pool,
        Err(e) => {
            tracing::error!("Failed to connect to database: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = db::run_migrations(&db_pool).await {
        tracing::error!("Failed to run migrations: {}", e);
        std::process::exit(1);
    }

    // Shared HTTP client for the upstream services
    let http = reqwest::Client::new();

    let packages = Arc::new(HttpLoanPackageClient::new(
        config.loan_package_service_url.clone(),
        http.clone(),
    ));
    let calendar = Arc::new(HttpBusinessDayCalculator::new(
        config.calendar_service_url.clone(),
        http.clone(),
    ));
    let workflows = Arc::new(HttpWorkflowClient::new(
        config.workflow_service_url.clone(),
        http.clone(),
    ));
    let bus = Arc::new(HttpMessageBus::new(
        config.message_bus_url.clone(),
        http.clone(),
    ));
    let accounts = Arc::new(HttpAccountClient::new(
        config.account_service_url.clone(),
        http.clone(),
    ));

    let dispatcher = Dispatcher::new(Arc::new(LogAlertSink));
    let notifications = Notifications::new(
        dispatcher.clone(),
        bus,
        accounts,
        packages.clone(),
    );

    // Initialize lifecycle orchestrator
    let lifecycle = Arc::new(LifecycleService::new(
        db_pool.clone(),
        packages,
        calendar,
        workflows,
        notifications,
    ));

    // Initialize sweep service
    let sweeps = Arc::new(SweepService::new(db_pool.clone(), dispatcher));

    // Start the offer-expiry sweep on its cron schedule
    if let Err(e) = start_expiry_scheduler(sweeps.clone(), &config.expire_sweep_cron).await {
        tracing::error!("Failed to start expiry scheduler: {}", e);
        std::process::exit(1);
    }

    // Create shared app state
    let app_state = AppState::new(lifecycle, sweeps, db::Database::new(db_pool));

    // Create the app router
    let app = Router::new()
        .route("/", get(handlers::root))
        .route("/health", get(handlers::health_check))
        .merge(routes::request_routes())
        .merge(routes::interest_routes())
        .merge(routes::operations_routes())
        .with_state(app_state)
        .layer(TraceLayer::new_for_http())
        .layer(configure_cors(&config));

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));

    tracing::info!("Server listening on {}", addr);
    tracing::info!("Health check at http://{}/health", addr);

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!("Failed to bind {}: {}", addr, e);
            std::process::exit(1);
        }
    };

    // Serve with graceful shutdown
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        tracing::error!("Server error: {}", e);
        std::process::exit(1);
    }

    tracing::info!("Server shutdown complete");
}

/// Schedule the recurring offer-expiry sweep
async fn start_expiry_scheduler(
    sweeps: Arc<SweepService>,
    cron: &str,
) -> Result<(), tokio_cron_scheduler::JobSchedulerError> {
    let scheduler = JobScheduler::new().await?;

    let job = Job::new_async(cron, move |_id, _lock| {
        let sweeps = sweeps.clone();
        Box::pin(async move {
            match sweeps.expire_overdue_offers().await {
                Ok(offer_ids) if offer_ids.is_empty() => {
                    tracing::debug!("Expiry sweep found no overdue offers");
                }
                Ok(offer_ids) => {
                    tracing::info!(count = offer_ids.len(), "Expiry sweep cancelled offers");
                }
                Err(e) => {
                    tracing::error!("Expiry sweep failed: {}", e);
                }
            }
        })
    })?;

    scheduler.add(job).await?;
    scheduler.start().await?;

    tracing::info!(schedule = cron, "Offer-expiry sweep scheduled");

    Ok(())
}

fn configure_cors(config: &Config) -> CorsLayer {
    let Some(allowed) = config.cors_allowed_origins.as_deref() else {
        tracing::warn!("CORS_ALLOWED_ORIGINS not set, allowing all origins (permissive)");
        return CorsLayer::permissive();
    };

    let origins: Vec<HeaderValue> = allowed
        .split(',')
        .filter_map(|s| s.trim().parse().ok())
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers(Any)
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown...");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown...");
        }
    }
}
