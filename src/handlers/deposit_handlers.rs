//! HTTP handlers for deposit intake and status.
//! Streams request bodies to disk without buffering and delegates lifecycle
//! concerns to `DepositService`.

use crate::{
    errors::AppError,
    models::deposit::Deposit,
    models::depositor::Depositor,
    services::deposit_service::{DepositService, PayloadSpec},
    services::space_verifier::UNKNOWN_CONTENT_LENGTH,
};
use axum::{
    Json,
    body::Body,
    extract::{Path, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use base64::{Engine as _, engine::general_purpose};
use chrono::SecondsFormat;
use futures::StreamExt;
use serde_json::json;
use std::io;

/// Create a deposit: POST `/collection/{path}` with the payload as the body.
pub async fn create_deposit(
    State(service): State<DepositService>,
    Path(collection): Path<String>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, AppError> {
    let depositor = resolve_depositor(&service, &headers)?;
    let spec = payload_spec(&headers)?;
    let slug = optional_header(&headers, "slug");

    let stream = body
        .into_data_stream()
        .map(|chunk| chunk.map_err(|err| io::Error::new(io::ErrorKind::Other, err)));

    let deposit = service
        .create_deposit_with_payload(&collection, &depositor, slug, spec, stream)
        .await?;

    let mut response = (StatusCode::CREATED, Json(deposit_view(&deposit))).into_response();
    if let Ok(location) = HeaderValue::from_str(&format!("/container/{}", deposit.id)) {
        response.headers_mut().insert(header::LOCATION, location);
    }
    Ok(response)
}

/// Append a payload part: POST `/media/{depositId}`. Only legal while the
/// deposit is still in DRAFT.
pub async fn add_payload(
    State(service): State<DepositService>,
    Path(deposit_id): Path<String>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, AppError> {
    let depositor = resolve_depositor(&service, &headers)?;
    let spec = payload_spec(&headers)?;

    let stream = body
        .into_data_stream()
        .map(|chunk| chunk.map_err(|err| io::Error::new(io::ErrorKind::Other, err)));

    let deposit = service
        .add_payload(&deposit_id, &depositor, spec, stream)
        .await?;

    Ok((StatusCode::OK, Json(deposit_view(&deposit))).into_response())
}

/// Report deposit status: GET `/container/{depositId}`.
pub async fn get_deposit(
    State(service): State<DepositService>,
    Path(deposit_id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let depositor = resolve_depositor(&service, &headers)?;
    let deposit = service.get_deposit(&deposit_id, Some(&depositor)).await?;
    Ok((StatusCode::OK, Json(deposit_view(&deposit))).into_response())
}

fn deposit_view(deposit: &Deposit) -> serde_json::Value {
    json!({
        "id": deposit.canonical_id(),
        "state": deposit.state,
        "state_description": deposit.state_description,
        "created": deposit
            .created
            .to_rfc3339_opts(SecondsFormat::Millis, true),
        "depositor": deposit.depositor,
        "collection": deposit.collection_id,
        "in_progress": deposit.in_progress,
        "filename": deposit.filename,
        "packaging": deposit.packaging,
        "content_length": deposit.content_length,
        "md5": deposit.md5,
        "bag_name": deposit.bag_name,
        "sword_token": deposit.sword_token,
        "other_id": deposit.other_id,
        "other_id_version": deposit.other_id_version,
    })
}

/// Every payload-bearing request authenticates with the X-Depositor header.
fn resolve_depositor(
    service: &DepositService,
    headers: &HeaderMap,
) -> Result<Depositor, AppError> {
    let name = optional_header(headers, "x-depositor")
        .ok_or_else(|| AppError::unauthorized("X-Depositor header is required"))?;
    service
        .depositor_by_name(&name)
        .cloned()
        .ok_or_else(|| AppError::unauthorized(format!("unknown depositor `{name}`")))
}

fn payload_spec(headers: &HeaderMap) -> Result<PayloadSpec, AppError> {
    let content_type = optional_header(headers, header::CONTENT_TYPE.as_str())
        .map(|value| {
            value
                .split(';')
                .next()
                .unwrap_or_default()
                .trim()
                .to_string()
        })
        .ok_or_else(|| AppError::bad_request("Content-Type header is required"))?;

    let declared_md5 = optional_header(headers, "content-md5")
        .map(|value| normalize_content_md5(&value))
        .transpose()?;

    let filename = optional_header(headers, header::CONTENT_DISPOSITION.as_str())
        .as_deref()
        .and_then(filename_from_disposition)
        .ok_or_else(|| {
            AppError::bad_request("Content-Disposition header must carry a filename")
        })?;

    let in_progress = match optional_header(headers, "in-progress").as_deref() {
        None | Some("false") => false,
        Some("true") => true,
        Some(other) => {
            return Err(AppError::bad_request(format!(
                "In-Progress header must be `true` or `false`, got `{other}`"
            )));
        }
    };

    let content_length = match optional_header(headers, header::CONTENT_LENGTH.as_str()) {
        Some(value) => value
            .parse::<i64>()
            .map_err(|_| AppError::bad_request("Content-Length header is not a number"))?,
        None => UNKNOWN_CONTENT_LENGTH,
    };

    Ok(PayloadSpec {
        content_type,
        declared_md5,
        packaging: optional_header(headers, "packaging"),
        filename,
        content_length,
        in_progress,
    })
}

fn optional_header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_string())
}

/// Accepts the digest either as 32 hex characters or as base64 of the raw
/// 16 bytes; both normalize to lowercase hex.
fn normalize_content_md5(value: &str) -> Result<String, AppError> {
    let value = value.trim();
    if value.len() == 32 && value.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Ok(value.to_ascii_lowercase());
    }

    let decoded = general_purpose::STANDARD
        .decode(value)
        .map_err(|_| AppError::bad_request("Content-MD5 header is neither hex nor base64"))?;
    if decoded.len() != 16 {
        return Err(AppError::bad_request(
            "Content-MD5 header does not hold a 128-bit digest",
        ));
    }
    Ok(hex::encode(decoded))
}

fn filename_from_disposition(value: &str) -> Option<String> {
    value
        .split(';')
        .filter_map(|part| part.trim().strip_prefix("filename="))
        .map(|name| name.trim_matches('"').to_string())
        .find(|name| !name.is_empty())
}
