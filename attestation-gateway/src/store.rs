//! Latest-verdict-per-agent store.
//!
//! Writes for the same agent are serialized by the map's per-key entry lock;
//! operations on different agents never block each other. A verdict with an
//! `issued_at` older than the stored one is rejected so a replayed quote can
//! never regress the stored state.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use thiserror::Error;

use crate::verifier::Verdict;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("a newer verdict is already stored for {agent_id}")]
    StaleWrite { agent_id: String },
}

#[derive(Default)]
pub struct AttestationStore {
    verdicts: DashMap<String, Verdict>,
}

impl AttestationStore {
    pub fn new() -> AttestationStore {
        AttestationStore::default()
    }

    /// Stores a verdict, last-write-wins by `issued_at`. Equal timestamps
    /// overwrite; strictly older ones are rejected.
    pub fn put(&self, verdict: Verdict) -> Result<(), StoreError> {
        match self.verdicts.entry(verdict.agent_id.clone()) {
            Entry::Occupied(mut entry) => {
                if verdict.issued_at < entry.get().issued_at {
                    return Err(StoreError::StaleWrite {
                        agent_id: verdict.agent_id,
                    });
                }
                entry.insert(verdict);
                Ok(())
            }
            Entry::Vacant(entry) => {
                entry.insert(verdict);
                Ok(())
            }
        }
    }

    pub fn get(&self, agent_id: &str) -> Option<Verdict> {
        self.verdicts.get(agent_id).map(|entry| entry.clone())
    }

    /// True iff a verdict exists, is verified, and `now` is strictly before
    /// its expiry. `now == expires_at` is stale.
    pub fn is_fresh(&self, agent_id: &str, now: DateTime<Utc>) -> bool {
        self.verdicts
            .get(agent_id)
            .is_some_and(|verdict| verdict.verified && now < verdict.expires_at)
    }

    /// Drops the stored verdict; the agent reads as not attested afterwards.
    pub fn revoke(&self, agent_id: &str) -> bool {
        self.verdicts.remove(agent_id).is_some()
    }

    /// Latest verdict per agent, ordered by agent id for stable output.
    pub fn all(&self) -> Vec<Verdict> {
        let mut verdicts: Vec<Verdict> = self
            .verdicts
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        verdicts.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        verdicts
    }
}
