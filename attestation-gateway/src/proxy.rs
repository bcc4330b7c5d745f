//! Route matching and forwarding to attested agents.
//!
//! Admission and the subsequent forward are two independent steps: a verdict
//! can expire while a long-running forward is in flight. That staleness
//! window is bounded by the upstream timeout and accepted; closing it would
//! mean holding a lock across a network call. The forward future is owned by
//! the inbound request handler, so an aborted inbound request drops the
//! in-flight upstream call with it.

use std::collections::HashMap;

use anyhow::{ensure, Context as _};
use axum::body::{Body, Bytes};
use axum::extract::Request;
use axum::http::{header, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use log::{debug, error, info, warn};
use serde::Serialize;

use crate::gate::{RejectReason, RouteGate};
use crate::policy::{AgentIdentity, RouteRule};

/// Largest request body the proxy will buffer for forwarding.
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

#[derive(Serialize)]
struct RejectionBody {
    error: RejectReason,
    detail: String,
}

fn reject(status: StatusCode, reason: RejectReason) -> Response {
    (
        status,
        Json(RejectionBody {
            error: reason,
            detail: reason.to_string(),
        }),
    )
        .into_response()
}

pub struct ProxyRouter {
    routes: Vec<RouteRule>,
    agents: HashMap<String, AgentIdentity>,
    gate: RouteGate,
    client: reqwest::Client,
    scheme: &'static str,
}

impl ProxyRouter {
    pub fn new(
        routes: Vec<RouteRule>,
        agents: Vec<AgentIdentity>,
        gate: RouteGate,
        client: reqwest::Client,
        tls: bool,
    ) -> anyhow::Result<ProxyRouter> {
        let agents: HashMap<String, AgentIdentity> = agents
            .into_iter()
            .map(|agent| (agent.agent_id.clone(), agent))
            .collect();
        for route in &routes {
            ensure!(
                agents.contains_key(&route.agent_id),
                "Route {} targets unknown agent {}",
                route.path,
                route.agent_id
            );
        }
        Ok(ProxyRouter {
            routes,
            agents,
            gate,
            client,
            scheme: if tls { "https" } else { "http" },
        })
    }

    fn match_route(&self, path: &str, method: &Method) -> Option<&RouteRule> {
        self.routes.iter().find(|rule| {
            rule.path == path
                && rule
                    .methods
                    .iter()
                    .any(|allowed| allowed.eq_ignore_ascii_case(method.as_str()))
        })
    }

    /// Matches, gates and forwards one inbound request.
    pub async fn route(&self, req: Request) -> Response {
        let (parts, body) = req.into_parts();
        let path = parts.uri.path().to_string();

        let Some(rule) = self.match_route(&path, &parts.method) else {
            debug!("No route for {} {}", parts.method, path);
            return reject(StatusCode::NOT_FOUND, RejectReason::RouteNotFound);
        };

        if rule.auth_required {
            let decision = self.gate.admit(&rule.agent_id, Utc::now());
            if !decision.admit {
                let reason = decision.reason.unwrap_or(RejectReason::NotAttested);
                info!(
                    "Denying {} {} to {}: {}",
                    parts.method, path, rule.agent_id, reason
                );
                return reject(StatusCode::FORBIDDEN, reason);
            }
        }

        // Checked at construction; a miss here means the registry changed
        // underneath us.
        let Some(agent) = self.agents.get(&rule.agent_id) else {
            error!("Agent {} vanished from the registry", rule.agent_id);
            return reject(StatusCode::BAD_GATEWAY, RejectReason::UpstreamUnavailable);
        };

        let body = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!("Failed reading the request body: {err}");
                return (StatusCode::BAD_REQUEST, "Failed reading the request body")
                    .into_response();
            }
        };

        let mut target = format!(
            "{}://{}:{}{}",
            self.scheme, agent.declared_host, agent.declared_port, path
        );
        if let Some(query) = parts.uri.query() {
            target.push('?');
            target.push_str(query);
        }

        match self
            .forward(&parts.method, &target, &parts.headers, &body)
            .await
        {
            Ok(upstream) => match relay_response(upstream).await {
                Ok(response) => response,
                Err(err) => {
                    warn!("Failed relaying the response from {target}: {err:#}");
                    reject(StatusCode::BAD_GATEWAY, RejectReason::UpstreamUnavailable)
                }
            },
            Err(err) if err.is_timeout() => {
                warn!("Upstream {target} timed out: {err}");
                reject(StatusCode::GATEWAY_TIMEOUT, RejectReason::Timeout)
            }
            Err(err) => {
                warn!("Upstream {target} unreachable: {err}");
                reject(StatusCode::BAD_GATEWAY, RejectReason::UpstreamUnavailable)
            }
        }
    }

    /// Sends the request, retrying exactly once on a transient connect
    /// failure when the method is an idempotent GET. Everything else fails
    /// on the first error.
    async fn forward(
        &self,
        method: &Method,
        target: &str,
        headers: &axum::http::HeaderMap,
        body: &Bytes,
    ) -> reqwest::Result<reqwest::Response> {
        match self.send_once(method, target, headers, body).await {
            Err(err) if *method == Method::GET && err.is_connect() => {
                warn!("Connect failure to {target}, retrying once: {err}");
                self.send_once(method, target, headers, body).await
            }
            result => result,
        }
    }

    async fn send_once(
        &self,
        method: &Method,
        target: &str,
        headers: &axum::http::HeaderMap,
        body: &Bytes,
    ) -> reqwest::Result<reqwest::Response> {
        let mut headers = headers.clone();
        // Recomputed for the upstream connection
        headers.remove(header::HOST);
        headers.remove(header::CONTENT_LENGTH);
        // Hop-by-hop headers are scoped to the inbound connection
        for name in [
            header::CONNECTION,
            header::PROXY_AUTHENTICATE,
            header::PROXY_AUTHORIZATION,
            header::TE,
            header::TRAILER,
            header::TRANSFER_ENCODING,
            header::UPGRADE,
        ] {
            headers.remove(name);
        }
        headers.remove("keep-alive");
        self.client
            .request(method.clone(), target)
            .headers(headers)
            .body(body.clone())
            .send()
            .await
    }
}

/// Relays the upstream status, headers and body bytes unchanged.
async fn relay_response(upstream: reqwest::Response) -> anyhow::Result<Response> {
    let status = upstream.status();
    let headers = upstream.headers().clone();
    let bytes = upstream
        .bytes()
        .await
        .context("Failed reading the upstream response body")?;

    let mut builder = Response::builder().status(status);
    if let Some(response_headers) = builder.headers_mut() {
        for (name, value) in headers.iter() {
            if name == header::CONTENT_LENGTH || name == header::TRANSFER_ENCODING {
                continue;
            }
            response_headers.insert(name.clone(), value.clone());
        }
    }
    builder
        .body(Body::from(bytes))
        .context("Failed building the relayed response")
}
