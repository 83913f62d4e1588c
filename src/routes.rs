//! Route definitions for the MarginVault API

use axum::{
    routing::{get, post},
    Router,
};

use crate::app_state::AppState;
use crate::handlers::*;

// Financing request routes
pub fn request_routes() -> Router<AppState> {
    Router::new()
        .route("/api/requests", post(create_request))
        .route("/api/requests", get(list_requests))
        .route("/api/requests/:id", get(get_request))
        .route("/api/requests/:id/confirm", post(confirm_request))
        .route("/api/requests/:id/decline", post(decline_request))
        .route("/api/requests/:id/submission-sheets", post(submit_sheet))
}

// Offer interest (line) routes
pub fn interest_routes() -> Router<AppState> {
    Router::new()
        .route("/api/offer-interests/accept", post(accept_interests))
        .route("/api/offer-interests/:id/cancel", post(cancel_interest))
        .route("/api/offer-interests/:id/assign-loan", post(assign_loan_id))
}

// Underwriting and operations routes
pub fn operations_routes() -> Router<AppState> {
    Router::new()
        .route("/api/submission-sheets/:id/review", post(review_sheet))
        .route("/api/sweeps/decline-high-risk", post(decline_high_risk))
}
