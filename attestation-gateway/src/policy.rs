//! Gateway configuration: verification policy, agent registry and route
//! table. Everything is loaded from disk at startup into immutable structs;
//! nothing reads configuration ad hoc at request time.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{ensure, Context as _};
use serde::{Deserialize, Serialize};

/// Platform policy handed to the verifier's constructor.
///
/// Carried as camelCase JSON:
/// `{trustedRoots: [...], measurementAllowList: {...}, maxAgeSecs: ..., minTcbSvn: ...}`
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct VerifierPolicy {
    /// Hex-encoded SEC1 P-256 public keys the signature chain must validate
    /// up to.
    pub trusted_roots: Vec<String>,
    /// Allowed digests per measurement register name. Every listed register
    /// must match one of its allowed values.
    pub measurement_allow_list: BTreeMap<String, Vec<String>>,
    /// How long a verified verdict stays fresh.
    pub max_age_secs: u64,
    /// Optional component-wise floor on the platform TCB SVN, hex encoded.
    #[serde(default)]
    pub min_tcb_svn: Option<String>,
}

impl VerifierPolicy {
    pub fn load(path: &Path) -> anyhow::Result<VerifierPolicy> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed reading policy file {}", path.display()))?;
        let policy: VerifierPolicy =
            serde_json::from_str(&contents).context("Failed parsing the verifier policy")?;
        ensure!(
            !policy.trusted_roots.is_empty(),
            "The policy must list at least one trusted root"
        );
        ensure!(policy.max_age_secs > 0, "maxAgeSecs must be greater than 0");
        Ok(policy)
    }
}

/// A deployed agent the gateway may forward to. Stable per deployment.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AgentIdentity {
    pub agent_id: String,
    pub declared_host: String,
    pub declared_port: u16,
}

/// One entry of the route table.
#[derive(Deserialize, Debug, Clone)]
pub struct RouteRule {
    /// Exact request path to match.
    pub path: String,
    /// Allowed methods on this path.
    pub methods: Vec<String>,
    /// The agent this route targets.
    pub agent_id: String,
    /// Whether the route gate must admit the agent before forwarding.
    #[serde(default = "default_auth_required")]
    pub auth_required: bool,
}

fn default_auth_required() -> bool {
    true
}

pub fn load_agents(path: &Path) -> anyhow::Result<Vec<AgentIdentity>> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed reading agent registry {}", path.display()))?;
    serde_json::from_str(&contents).context("Failed parsing the agent registry")
}

pub fn load_routes(path: &Path) -> anyhow::Result<Vec<RouteRule>> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed reading route table {}", path.display()))?;
    let routes: Vec<RouteRule> =
        serde_json::from_str(&contents).context("Failed parsing the route table")?;
    ensure!(!routes.is_empty(), "The route table is empty");
    Ok(routes)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn policy_parses_camel_case() {
        let policy: VerifierPolicy = serde_json::from_str(
            r#"{
                "trustedRoots": ["04aabb"],
                "measurementAllowList": {"mr_td": ["00ff"]},
                "maxAgeSecs": 300,
                "minTcbSvn": "03030303030303030303030303030303"
            }"#,
        )
        .unwrap();
        assert_eq!(policy.trusted_roots, vec!["04aabb".to_string()]);
        assert_eq!(policy.max_age_secs, 300);
        assert!(policy.min_tcb_svn.is_some());
    }

    #[test]
    fn policy_rejects_unknown_fields() {
        let result: Result<VerifierPolicy, _> = serde_json::from_str(
            r#"{"trustedRoots": [], "measurementAllowList": {}, "maxAgeSecs": 1, "extra": true}"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn route_rule_defaults_to_auth_required() {
        let rule: RouteRule = serde_json::from_str(
            r#"{"path": "/v1/models", "methods": ["GET"], "agent_id": "cube-agent-01"}"#,
        )
        .unwrap();
        assert!(rule.auth_required);
    }
}
