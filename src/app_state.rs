//! Application state shared across handlers

use std::sync::Arc;

use axum::extract::FromRef;

use crate::db::Database;
use crate::lifecycle::{LifecycleService, SweepService};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub lifecycle: Arc<LifecycleService>,
    pub sweeps: Arc<SweepService>,
    pub db: Database,
}

impl AppState {
    pub fn new(lifecycle: Arc<LifecycleService>, sweeps: Arc<SweepService>, db: Database) -> Self {
        Self {
            lifecycle,
            sweeps,
            db,
        }
    }
}

impl FromRef<AppState> for Arc<LifecycleService> {
    fn from_ref(app_state: &AppState) -> Self {
        app_state.lifecycle.clone()
    }
}

impl FromRef<AppState> for Arc<SweepService> {
    fn from_ref(app_state: &AppState) -> Self {
        app_state.sweeps.clone()
    }
}

impl FromRef<AppState> for Database {
    fn from_ref(app_state: &AppState) -> Self {
        app_state.db.clone()
    }
}
