//! Defines routes for deposit intake and status reporting.
//!
//! ## Structure
//! - **Deposit endpoints**
//!   - `POST /collection/{path}` — create a deposit in a collection
//!   - `POST /media/{depositId}` — append a payload part to an open deposit
//!   - `GET  /container/{depositId}` — report deposit state
//!
//! - **Probe endpoints**
//!   - `GET /healthz` — liveness
//!   - `GET /readyz` — readiness (intake writability and disk headroom)

use crate::{
    handlers::{
        deposit_handlers::{add_payload, create_deposit, get_deposit},
        health_handlers::{healthz, readyz},
    },
    services::deposit_service::DepositService,
};
use axum::{
    Router,
    routing::{get, post},
};

/// Build and return the router for all deposit routes.
///
/// The router carries shared state (`DepositService`) to all handlers.
pub fn routes() -> Router<DepositService> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // deposit lifecycle
        .route("/collection/{path}", post(create_deposit))
        .route("/media/{deposit_id}", post(add_payload))
        .route("/container/{deposit_id}", get(get_deposit))
}
