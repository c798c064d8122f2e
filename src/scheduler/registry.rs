use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{DispatchError, Result};

/// A registered execution agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub id: Uuid,
    pub fleet: String,
    #[serde(skip)]
    token_hash: String,
    pub capabilities: BTreeSet<String>,
    pub max_concurrency: usize,
    pub registered_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub is_draining: bool,
    pub drain_reason: Option<String>,
    pub is_approved: bool,
}

impl Worker {
    pub fn is_alive(&self, now: DateTime<Utc>, dead_after: Duration) -> bool {
        let silent = now.signed_duration_since(self.last_seen_at);
        silent.to_std().map_or(true, |silent| silent <= dead_after)
    }

    /// Why this worker must not receive new leases, if anything.
    pub fn lease_block_reason(&self, now: DateTime<Utc>, dead_after: Duration) -> Option<&'static str> {
        if !self.is_approved {
            Some("worker is not approved")
        } else if self.is_draining {
            Some("worker is draining")
        } else if !self.is_alive(now, dead_after) {
            Some("worker missed its heartbeat deadline")
        } else {
            None
        }
    }
}

/// Returned once at registration; the registry keeps only the hash.
#[derive(Debug, Clone)]
pub struct Registration {
    pub worker: Worker,
    pub token: String,
}

fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Tracks known workers, their capabilities and heartbeat clock.
///
/// Load is deliberately absent: it is derived from live leases in the
/// dispatch table.
#[derive(Debug)]
pub struct WorkerRegistry {
    workers: HashMap<Uuid, Worker>,
    dead_after: Duration,
    auto_approve: bool,
}

impl WorkerRegistry {
    pub fn new(dead_after: Duration, auto_approve: bool) -> Self {
        Self {
            workers: HashMap::new(),
            dead_after,
            auto_approve,
        }
    }

    pub fn dead_after(&self) -> Duration {
        self.dead_after
    }

    pub fn register(
        &mut self,
        fleet: &str,
        capabilities: impl IntoIterator<Item = String>,
        max_concurrency: usize,
        now: DateTime<Utc>,
    ) -> Result<Registration> {
        let capabilities: BTreeSet<String> = capabilities
            .into_iter()
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .collect();
        if capabilities.is_empty() {
            return Err(DispatchError::InvalidRequest(
                "worker must declare at least one capability".to_string(),
            ));
        }
        if max_concurrency == 0 {
            return Err(DispatchError::InvalidRequest(
                "max_concurrency must be at least 1".to_string(),
            ));
        }

        let token = generate_token();
        let worker = Worker {
            id: Uuid::new_v4(),
            fleet: fleet.to_string(),
            token_hash: hash_token(&token),
            capabilities,
            max_concurrency,
            registered_at: now,
            last_seen_at: now,
            is_draining: false,
            drain_reason: None,
            is_approved: self.auto_approve,
        };
        tracing::info!(
            worker_id = %worker.id,
            fleet = %worker.fleet,
            max_concurrency,
            approved = worker.is_approved,
            "Worker registered"
        );
        self.workers.insert(worker.id, worker.clone());
        Ok(Registration { worker, token })
    }

    /// Check a worker's bearer token.
    pub fn authenticate(&self, worker_id: &Uuid, token: &str) -> Result<&Worker> {
        let worker = self
            .workers
            .get(worker_id)
            .ok_or(DispatchError::WorkerNotFound(*worker_id))?;
        if worker.token_hash != hash_token(token) {
            return Err(DispatchError::Unauthorized);
        }
        Ok(worker)
    }

    pub fn get(&self, worker_id: &Uuid) -> Option<&Worker> {
        self.workers.get(worker_id)
    }

    /// Refresh the heartbeat clock.
    pub fn touch(&mut self, worker_id: &Uuid, now: DateTime<Utc>) {
        if let Some(worker) = self.workers.get_mut(worker_id) {
            if now > worker.last_seen_at {
                worker.last_seen_at = now;
            }
        }
    }

    pub fn set_draining(&mut self, worker_id: &Uuid, reason: &str) -> Result<()> {
        let worker = self
            .workers
            .get_mut(worker_id)
            .ok_or(DispatchError::WorkerNotFound(*worker_id))?;
        if !worker.is_draining {
            tracing::info!(worker_id = %worker_id, reason, "Worker draining");
        }
        worker.is_draining = true;
        worker.drain_reason = Some(reason.to_string());
        Ok(())
    }

    pub fn approve(&mut self, worker_id: &Uuid) -> Result<()> {
        let worker = self
            .workers
            .get_mut(worker_id)
            .ok_or(DispatchError::WorkerNotFound(*worker_id))?;
        worker.is_approved = true;
        tracing::info!(worker_id = %worker_id, "Worker approved");
        Ok(())
    }

    /// Workers whose heartbeat clock ran past the dead-worker threshold.
    pub fn dead_workers(&self, now: DateTime<Utc>) -> HashSet<Uuid> {
        self.workers
            .values()
            .filter(|w| !w.is_alive(now, self.dead_after))
            .map(|w| w.id)
            .collect()
    }

    /// Workers in a fleet that are able to take work right now.
    pub fn running_in_fleet(&self, fleet: &str, now: DateTime<Utc>) -> usize {
        self.workers
            .values()
            .filter(|w| w.fleet == fleet && w.lease_block_reason(now, self.dead_after).is_none())
            .count()
    }

    /// Drop workers that have been silent since before `cutoff`.
    pub fn prune_silent(&mut self, cutoff: DateTime<Utc>) -> usize {
        let before = self.workers.len();
        self.workers.retain(|_, w| w.last_seen_at >= cutoff);
        before - self.workers.len()
    }

    pub fn all_workers(&self) -> Vec<&Worker> {
        let mut workers: Vec<&Worker> = self.workers.values().collect();
        workers.sort_by_key(|w| w.registered_at);
        workers
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn caps(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn register_and_authenticate() {
        let mut registry = WorkerRegistry::new(Duration::from_secs(60), true);
        let reg = registry
            .register("sdxl-prod", caps(&["sdxl"]), 2, Utc::now())
            .unwrap();

        assert_eq!(reg.token.len(), 64);
        assert!(registry.authenticate(&reg.worker.id, &reg.token).is_ok());
        assert_eq!(
            registry.authenticate(&reg.worker.id, "nope").unwrap_err(),
            DispatchError::Unauthorized
        );
        let unknown = Uuid::new_v4();
        assert_eq!(
            registry.authenticate(&unknown, &reg.token).unwrap_err(),
            DispatchError::WorkerNotFound(unknown)
        );
    }

    #[test]
    fn register_rejects_empty_capabilities() {
        let mut registry = WorkerRegistry::new(Duration::from_secs(60), true);
        assert!(registry.register("f", caps(&[" "]), 1, Utc::now()).is_err());
        assert!(registry.register("f", caps(&["wf"]), 0, Utc::now()).is_err());
    }

    #[test]
    fn liveness_follows_heartbeat_clock() {
        let mut registry = WorkerRegistry::new(Duration::from_secs(60), true);
        let now = Utc::now();
        let reg = registry.register("f", caps(&["wf"]), 1, now).unwrap();
        let id = reg.worker.id;

        let later = now + ChronoDuration::seconds(61);
        assert!(registry.dead_workers(later).contains(&id));
        assert_eq!(registry.running_in_fleet("f", later), 0);

        registry.touch(&id, later);
        assert!(registry.dead_workers(later).is_empty());
        assert_eq!(registry.running_in_fleet("f", later), 1);
    }

    #[test]
    fn draining_and_unapproved_workers_are_blocked() {
        let mut registry = WorkerRegistry::new(Duration::from_secs(60), false);
        let now = Utc::now();
        let reg = registry.register("f", caps(&["wf"]), 1, now).unwrap();
        let id = reg.worker.id;

        let worker = registry.get(&id).unwrap();
        assert_eq!(
            worker.lease_block_reason(now, registry.dead_after()),
            Some("worker is not approved")
        );

        registry.approve(&id).unwrap();
        assert!(registry
            .get(&id)
            .unwrap()
            .lease_block_reason(now, registry.dead_after())
            .is_none());

        registry.set_draining(&id, "spot interruption").unwrap();
        let worker = registry.get(&id).unwrap();
        assert_eq!(
            worker.lease_block_reason(now, registry.dead_after()),
            Some("worker is draining")
        );
        assert_eq!(worker.drain_reason.as_deref(), Some("spot interruption"));
    }

    #[test]
    fn prune_removes_long_silent_workers() {
        let mut registry = WorkerRegistry::new(Duration::from_secs(60), true);
        let now = Utc::now();
        registry
            .register("f", caps(&["wf"]), 1, now - ChronoDuration::hours(3))
            .unwrap();
        registry.register("f", caps(&["wf"]), 1, now).unwrap();

        assert_eq!(registry.prune_silent(now - ChronoDuration::hours(1)), 1);
        assert_eq!(registry.len(), 1);
    }
}
