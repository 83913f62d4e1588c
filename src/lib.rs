//! MarginVault Backend Library
//!
//! This library exports the core modules for the MarginVault backend server:
//! the financing-offer lifecycle engine, its scheduler sweeps, and the HTTP
//! surface around them.

pub mod app_state;
pub mod config;
pub mod db;
pub mod error;
pub mod external;
pub mod handlers;
pub mod lifecycle;
pub mod notify;
pub mod routes;
