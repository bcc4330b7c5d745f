//! HTTP endpoints for attestation submission, query and revocation, plus the
//! fallback that hands everything else to the proxy router.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use tokio::task;

use crate::proxy::ProxyRouter;
use crate::store::{AttestationStore, StoreError};
use crate::verifier::{AttestationVerifier, PlatformInfo, Verdict, VerdictReason};
use crate::web_error::AppError;

/// Verification is CPU-bound and must not stall a handler unboundedly; past
/// this it fails closed as an unverified verdict.
pub const VERIFY_TIMEOUT: Duration = Duration::from_secs(5);

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub verifier: Arc<AttestationVerifier>,
    pub store: Arc<AttestationStore>,
    pub proxy: Arc<ProxyRouter>,
    /// Deadline for one verification; past it the verdict fails closed.
    pub verify_timeout: Duration,
}

// ============================================================================
// Request/Response types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct SubmitReportRequest {
    pub agent_id: String,
    /// The raw TDX quote, hex encoded.
    pub tdx_quote: String,
}

#[derive(Debug, Serialize)]
pub struct AttestationReportResponse {
    pub agent_id: String,
    pub verified: bool,
    pub timestamp: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub platform: Option<PlatformInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<VerdictReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mismatched_field: Option<String>,
}

impl From<&Verdict> for AttestationReportResponse {
    fn from(verdict: &Verdict) -> Self {
        AttestationReportResponse {
            agent_id: verdict.agent_id.clone(),
            verified: verdict.verified,
            timestamp: verdict.issued_at,
            expires_at: verdict.expires_at,
            platform: verdict.platform.clone(),
            reason: verdict.reason,
            mismatched_field: verdict.mismatched_field.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RevokeRequest {
    pub agent_id: String,
}

#[derive(Debug, Serialize)]
pub struct RevokeResponse {
    pub agent_id: String,
    pub revoked: bool,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
}

// ============================================================================
// Handlers
// ============================================================================

pub async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        service: "attestation-gateway".to_string(),
    })
}

/// Accepts a TDX quote for an agent, verifies it against the policy and
/// stores the resulting verdict.
pub async fn submit_report(
    State(state): State<AppState>,
    Json(request): Json<SubmitReportRequest>,
) -> Result<Response, AppError> {
    info!("Received attestation report for {}", request.agent_id);

    // Undecodable hex cannot be a well-formed quote; let the verifier render
    // it as MalformedQuote.
    let quote_bytes = hex::decode(&request.tdx_quote).unwrap_or_default();
    let now = Utc::now();

    let verifier = state.verifier.clone();
    let agent_id = request.agent_id.clone();
    let verdict = match tokio::time::timeout(
        state.verify_timeout,
        task::spawn_blocking(move || verifier.verify(&agent_id, &quote_bytes, now)),
    )
    .await
    {
        Ok(joined) => joined?,
        Err(_) => {
            warn!("Verification for {} timed out, failing closed", request.agent_id);
            Verdict::unverified(&request.agent_id, now, VerdictReason::Timeout)
        }
    };

    match state.store.put(verdict.clone()) {
        Ok(()) => {}
        Err(err @ StoreError::StaleWrite { .. }) => {
            warn!("Rejecting report for {}: {}", request.agent_id, err);
            return Ok((
                StatusCode::CONFLICT,
                Json(serde_json::json!({
                    "error": "StaleWrite",
                    "detail": err.to_string(),
                })),
            )
                .into_response());
        }
    }

    Ok(Json(AttestationReportResponse::from(&verdict)).into_response())
}

/// Latest verdict per agent.
pub async fn list_reports(State(state): State<AppState>) -> impl IntoResponse {
    let reports: Vec<AttestationReportResponse> = state
        .store
        .all()
        .iter()
        .map(AttestationReportResponse::from)
        .collect();
    Json(reports)
}

/// Drops the stored verdict for an agent ahead of its TTL expiry.
pub async fn revoke_report(
    State(state): State<AppState>,
    Json(request): Json<RevokeRequest>,
) -> impl IntoResponse {
    let revoked = state.store.revoke(&request.agent_id);
    if revoked {
        info!("Revoked the attestation of {}", request.agent_id);
    }
    Json(RevokeResponse {
        agent_id: request.agent_id,
        revoked,
    })
}

/// Everything that is not an attestation endpoint goes through the proxy.
pub async fn proxy_fallback(State(state): State<AppState>, request: Request) -> Response {
    state.proxy.route(request).await
}
