//! Health & readiness handlers.
//!
//! - GET /healthz  -> simple liveness ("ok")
//! - GET /readyz   -> readiness that checks intake-area writability and disk headroom

use crate::services::deposit_service::DepositService;
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use std::collections::HashMap;

/// `GET /healthz`
///
/// Very small liveness probe — always returns 200 OK with a plain JSON body.
/// This endpoint should be cheap and never perform I/O.
pub async fn healthz() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".into(),
        }),
    )
}

/// `GET /readyz`
///
/// Readiness probe that, per collection:
/// 1. Performs a best-effort write/delete probe in the intake directory.
/// 2. Verifies free space on the intake volume is still above the
///    collection's configured margin.
///
/// Returns JSON describing each check. HTTP 200 when all checks pass,
/// HTTP 503 when any check fails.
pub async fn readyz(State(service): State<DepositService>) -> impl IntoResponse {
    let mut checks = HashMap::new();
    let mut overall_ok = true;

    for collection in service.collections() {
        let writable = service.file_service().can_write_to(&collection.uploads).await;
        let write_check = CheckStatus {
            ok: writable,
            error: (!writable).then(|| {
                format!(
                    "intake directory {} is not writable",
                    collection.uploads.display()
                )
            }),
        };

        let space_check = match service
            .space_verifier()
            .ensure_margin(&collection.uploads, collection.disk_space_margin)
        {
            Ok(()) => CheckStatus {
                ok: true,
                error: None,
            },
            Err(err) => CheckStatus {
                ok: false,
                error: Some(err.to_string()),
            },
        };

        overall_ok = overall_ok && write_check.ok && space_check.ok;
        checks.insert(format!("{}:write", collection.name), write_check);
        checks.insert(format!("{}:disk", collection.name), space_check);
    }

    let body = ReadyResponse {
        status: if overall_ok {
            "ok".into()
        } else {
            "error".into()
        },
        checks,
    };

    let status = if overall_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: String,
    checks: HashMap<String, CheckStatus>,
}

#[derive(Serialize)]
struct CheckStatus {
    ok: bool,
    error: Option<String>,
}
