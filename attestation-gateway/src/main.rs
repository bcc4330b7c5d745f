//! Attestation gateway for in-CVM inference agents.
//!
//! Agents running inside TDX confidential VMs submit quotes to this service.
//! The gateway verifies each quote against the configured platform policy
//! (trust anchors, measurement allow-list, TCB floor), keeps the latest
//! verdict per agent, and only proxies inference traffic to agents whose
//! verdict is verified and still fresh.
//!
//! TLS termination for inbound traffic is handled by the reverse proxy in
//! front of this service; the transport to the agents themselves is mutual
//! TLS using the configured client identity and agent CA (or a pinned agent
//! certificate).

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context as _};
use axum::routing::{get, post};
use axum::Router;
use clap::Parser;
use log::{info, warn};
use tower_http::trace::TraceLayer;
use tower_http::validate_request::ValidateRequestHeaderLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::api::{
    health_check, list_reports, proxy_fallback, revoke_report, submit_report, AppState,
    VERIFY_TIMEOUT,
};
use crate::gate::RouteGate;
use crate::policy::{load_agents, load_routes, VerifierPolicy};
use crate::proxy::ProxyRouter;
use crate::store::AttestationStore;
use crate::upstream_tls::{mtls_client, pinned_client, plain_client, ClientIdentity};
use crate::verifier::AttestationVerifier;

mod api;
mod gate;
mod policy;
mod proxy;
mod store;
mod upstream_tls;
mod verifier;
mod web_error;

/// TDX attestation gateway
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Socket address to listen on (e.g., "0.0.0.0:8080")
    #[arg(short, long, default_value = "0.0.0.0:8080")]
    listen: SocketAddr,

    /// Path to the verifier policy (trustedRoots, measurementAllowList, maxAgeSecs)
    #[arg(long)]
    policy_path: PathBuf,

    /// Path to the route table
    #[arg(long)]
    routes_path: PathBuf,

    /// Path to the agent registry
    #[arg(long)]
    agents_path: PathBuf,

    /// CA bundle used to validate agent certificates
    #[arg(long)]
    agent_ca_path: Option<PathBuf>,

    /// Pinned agent certificate, accepted instead of a CA-validated one
    #[arg(long)]
    pinned_agent_cert_path: Option<PathBuf>,

    /// Client certificate presented to agents for mutual TLS
    #[arg(long)]
    client_cert_path: Option<PathBuf>,

    /// Private key for the client certificate
    #[arg(long)]
    client_key_path: Option<PathBuf>,

    /// Bearer token protecting the revocation endpoint
    #[arg(long)]
    admin_token: Option<String>,
}

/// Builds the upstream client from the TLS material on the command line.
/// Returns the client and whether agent targets are https.
fn build_upstream_client(args: &Args) -> anyhow::Result<(reqwest::Client, bool)> {
    let identity = match (&args.client_cert_path, &args.client_key_path) {
        (Some(cert_path), Some(key_path)) => Some(ClientIdentity {
            cert_path: cert_path.clone(),
            key_path: key_path.clone(),
        }),
        (None, None) => None,
        _ => bail!("client_cert_path and client_key_path must be provided together"),
    };

    match (&args.agent_ca_path, &args.pinned_agent_cert_path, &identity) {
        (Some(_), Some(_), _) => {
            bail!("agent_ca_path and pinned_agent_cert_path are mutually exclusive")
        }
        (Some(agent_ca), None, Some(identity)) => Ok((mtls_client(agent_ca, identity)?, true)),
        (None, Some(pinned), Some(identity)) => Ok((pinned_client(pinned, identity)?, true)),
        (None, None, None) => {
            warn!("No agent TLS material configured, forwarding over plain HTTP");
            Ok((plain_client()?, false))
        }
        _ => bail!(
            "Mutual TLS to agents needs a CA (or pinned certificate) together with a client certificate and key"
        ),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "attestation_gateway=debug,tower_http=debug,axum::rejection=trace".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Attestation gateway starting...");

    let policy = VerifierPolicy::load(&args.policy_path)?;
    let verifier =
        AttestationVerifier::new(&policy).context("Failed constructing the verifier")?;
    info!(
        "Policy loaded: {} trusted root(s), {} measurement(s) pinned, maxAge {}s",
        policy.trusted_roots.len(),
        policy.measurement_allow_list.len(),
        policy.max_age_secs
    );

    let routes = load_routes(&args.routes_path)?;
    let agents = load_agents(&args.agents_path)?;
    info!(
        "Route table has {} route(s) across {} agent(s)",
        routes.len(),
        agents.len()
    );

    let (upstream_client, tls) = build_upstream_client(&args)?;

    let store = Arc::new(AttestationStore::new());
    let proxy = ProxyRouter::new(
        routes,
        agents,
        RouteGate::new(store.clone()),
        upstream_client,
        tls,
    )
    .context("Failed constructing the proxy router")?;

    let state = AppState {
        verifier: Arc::new(verifier),
        store,
        proxy: Arc::new(proxy),
        verify_timeout: VERIFY_TIMEOUT,
    };

    let mut revoke_routes = Router::new().route("/attestation/revoke", post(revoke_report));
    if let Some(token) = &args.admin_token {
        revoke_routes = revoke_routes.route_layer(ValidateRequestHeaderLayer::bearer(token));
    }

    let app = Router::new()
        .route("/health", get(health_check))
        .route(
            "/attestation/report",
            post(submit_report).get(list_reports),
        )
        .merge(revoke_routes)
        .fallback(proxy_fallback)
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    info!("Listening on {}", args.listen);

    let server = axum_server::bind(args.listen);
    server.serve(app.into_make_service()).await?;
    Ok(())
}
