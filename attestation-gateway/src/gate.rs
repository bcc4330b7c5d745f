//! The access-control checkpoint between the proxy and an attested agent.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::store::AttestationStore;

/// Why a request was not admitted (or could not be completed) by the routing
/// layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Error)]
pub enum RejectReason {
    #[error("the agent has no verified attestation")]
    NotAttested,
    #[error("the agent's attestation has expired")]
    Expired,
    #[error("no route matches the request")]
    RouteNotFound,
    #[error("the target agent could not be reached")]
    UpstreamUnavailable,
    #[error("the target agent did not answer in time")]
    Timeout,
}

/// Per-request admission outcome. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RouteDecision {
    pub admit: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<RejectReason>,
}

impl RouteDecision {
    fn deny(reason: RejectReason) -> RouteDecision {
        RouteDecision {
            admit: false,
            reason: Some(reason),
        }
    }
}

/// Decides admission from the store's freshness state alone; no extra cache,
/// so the store stays the single source of truth for freshness.
pub struct RouteGate {
    store: Arc<AttestationStore>,
}

impl RouteGate {
    pub fn new(store: Arc<AttestationStore>) -> RouteGate {
        RouteGate { store }
    }

    pub fn admit(&self, agent_id: &str, now: DateTime<Utc>) -> RouteDecision {
        match self.store.get(agent_id) {
            None => RouteDecision::deny(RejectReason::NotAttested),
            Some(verdict) if !verdict.verified => RouteDecision::deny(RejectReason::NotAttested),
            Some(verdict) if now >= verdict.expires_at => {
                RouteDecision::deny(RejectReason::Expired)
            }
            Some(_) => RouteDecision {
                admit: true,
                reason: None,
            },
        }
    }
}
