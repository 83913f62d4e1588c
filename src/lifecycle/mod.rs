//! Financing-offer lifecycle domain
//!
//! Models, transition tables, persistence, orchestration and scheduler
//! sweeps for the request → offer → line → contract lifecycle.

pub mod allocation;
pub mod model;
pub mod repo;
pub mod service;
pub mod sweeps;
pub mod transition;

pub use model::*;
pub use service::LifecycleService;
pub use sweeps::SweepService;
