//! API Module
//!
//! HTTP handlers and routing for the diagnostics REST API.
//!
//! # Endpoints
//! - `POST /load` - Run a foreground load
//! - `POST /cancel` - Cancel outstanding loads
//! - `GET /progress` - Current load progress
//! - `GET /stats` - Cache, persistence and prefetch statistics
//! - `POST /maintenance/cleanup` - Sweep expired entries
//! - `POST /maintenance/emergency-clear` - Shed entries under memory pressure
//! - `GET /health` - Health check endpoint

pub mod handlers;
pub mod routes;

pub use handlers::*;
pub use routes::create_router;
