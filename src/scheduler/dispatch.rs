use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{DispatchError, Result};
use crate::scheduler::job::Job;

const DEFAULT_MAX_ENTRIES: usize = 10_000;

/// Provider for workflows no fleet serves. Any capable worker may claim them.
pub const UNROUTED_PROVIDER: &str = "default";

/// Opaque 128-bit random lease token.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct LeaseToken(u128);

impl LeaseToken {
    pub fn generate() -> Self {
        Self(rand::random())
    }
}

// Tokens are credentials; keep them out of debug logs.
impl fmt::Debug for LeaseToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LeaseToken(..)")
    }
}

impl fmt::Display for LeaseToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

impl FromStr for LeaseToken {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self> {
        if s.len() != 32 {
            return Err(DispatchError::InvalidRequest(
                "lease token must be 32 hex characters".to_string(),
            ));
        }
        u128::from_str_radix(s, 16)
            .map(Self)
            .map_err(|_| DispatchError::InvalidRequest("malformed lease token".to_string()))
    }
}

impl Serialize for LeaseToken {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for LeaseToken {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchStatus {
    Pending,
    Leased,
    Running,
    Done,
    Failed,
}

impl DispatchStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, DispatchStatus::Leased | DispatchStatus::Running)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, DispatchStatus::Done | DispatchStatus::Failed)
    }
}

impl fmt::Display for DispatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchStatus::Pending => write!(f, "pending"),
            DispatchStatus::Leased => write!(f, "leased"),
            DispatchStatus::Running => write!(f, "running"),
            DispatchStatus::Done => write!(f, "done"),
            DispatchStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Scheduler-facing projection of a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchEntry {
    pub id: Uuid,
    pub job_id: Uuid,
    pub tenant_id: String,
    pub provider: String,
    pub workflow_id: String,
    pub status: DispatchStatus,
    /// Lower is more urgent.
    pub priority: i32,
    pub attempts: u32,
    pub worker_id: Option<Uuid>,
    pub lease_token: Option<LeaseToken>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
    /// Not claimable before this instant; pushed forward by retry backoff.
    pub enqueued_at: DateTime<Utc>,
    pub leased_at: Option<DateTime<Utc>>,
    /// Enqueue order, breaks ties between equal `enqueued_at`.
    pub seq: u64,
    /// Bumped on every write; conditional updates compare against it.
    pub version: u64,
}

impl DispatchEntry {
    pub fn has_live_lease(&self, now: DateTime<Utc>) -> bool {
        self.status.is_active()
            && self.worker_id.is_some()
            && self.lease_token.is_some()
            && self.lease_expires_at.is_some_and(|at| now < at)
    }

    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.status == DispatchStatus::Pending && self.enqueued_at <= now
    }

    fn holds_lease(&self, worker_id: &Uuid, token: &LeaseToken, now: DateTime<Utc>) -> bool {
        self.has_live_lease(now)
            && self.worker_id.as_ref() == Some(worker_id)
            && self.lease_token.as_ref() == Some(token)
    }

    fn clear_lease(&mut self) {
        self.worker_id = None;
        self.lease_token = None;
        self.lease_expires_at = None;
    }

    fn ordering_key(&self) -> (i32, DateTime<Utc>, u64) {
        (self.priority, self.enqueued_at, self.seq)
    }
}

/// Snapshot of an entry taken for a later conditional write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    pub id: Uuid,
    pub version: u64,
}

/// Result of a heartbeat that extended a lease.
#[derive(Debug, Clone)]
pub struct Renewal {
    pub entry: DispatchEntry,
    /// True when this heartbeat moved the entry from `leased` to `running`.
    pub started: bool,
}

/// Result of reclaiming an expired or orphaned lease.
#[derive(Debug, Clone)]
pub struct Reclaimed {
    pub entry: DispatchEntry,
    /// The entry ran out of attempts and was failed instead of re-queued.
    pub exhausted: bool,
}

/// Cross-tenant table of dispatch entries.
///
/// Every mutation goes through a single-row conditional write: either the
/// caller proves it holds the current lease, or it presents the `version`
/// it read earlier. Two writers racing on the same row can never both win.
#[derive(Debug)]
pub struct DispatchTable {
    entries: HashMap<Uuid, DispatchEntry>,
    by_job: HashMap<Uuid, Uuid>,
    last_enqueued: HashMap<String, DateTime<Utc>>,
    next_seq: u64,
    max_entries: usize,
}

impl Default for DispatchTable {
    fn default() -> Self {
        Self::new()
    }
}

impl DispatchTable {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_ENTRIES)
    }

    pub fn with_capacity(max_entries: usize) -> Self {
        Self {
            entries: HashMap::new(),
            by_job: HashMap::new(),
            last_enqueued: HashMap::new(),
            next_seq: 0,
            max_entries,
        }
    }

    fn bump_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    /// Enqueue a freshly created job.
    pub fn insert(
        &mut self,
        job: &Job,
        provider: &str,
        priority: i32,
        now: DateTime<Utc>,
    ) -> Result<DispatchEntry> {
        if self.is_full() {
            return Err(DispatchError::QueueFull);
        }
        let seq = self.bump_seq();
        let entry = DispatchEntry {
            id: Uuid::new_v4(),
            job_id: job.id,
            tenant_id: job.tenant_id.clone(),
            provider: provider.to_string(),
            workflow_id: job.workflow_id.clone(),
            status: DispatchStatus::Pending,
            priority,
            attempts: 0,
            worker_id: None,
            lease_token: None,
            lease_expires_at: None,
            last_error: None,
            payload: job.payload.clone(),
            created_at: now,
            enqueued_at: now,
            leased_at: None,
            seq,
            version: 0,
        };
        self.last_enqueued.insert(entry.provider.clone(), now);
        self.by_job.insert(job.id, entry.id);
        self.entries.insert(entry.id, entry.clone());
        Ok(entry)
    }

    pub fn get(&self, id: &Uuid) -> Option<&DispatchEntry> {
        self.entries.get(id)
    }

    pub fn get_by_job(&self, job_id: &Uuid) -> Option<&DispatchEntry> {
        self.by_job.get(job_id).and_then(|id| self.entries.get(id))
    }

    pub fn remove(&mut self, id: &Uuid) -> Option<DispatchEntry> {
        let entry = self.entries.remove(id)?;
        self.by_job.remove(&entry.job_id);
        Some(entry)
    }

    /// Apply `mutate` only if the row is still at `expected_version`.
    pub fn update_if<F>(&mut self, id: &Uuid, expected_version: u64, mutate: F) -> Option<&DispatchEntry>
    where
        F: FnOnce(&mut DispatchEntry) -> bool,
    {
        let entry = self.entries.get_mut(id)?;
        if entry.version != expected_version {
            return None;
        }
        if !mutate(entry) {
            return None;
        }
        entry.version += 1;
        Some(entry)
    }

    /// Claimable entries routed to `fleet` (or unrouted) for the given
    /// workflows, in claim order.
    pub fn claim_candidates(
        &self,
        fleet: &str,
        workflows: &HashSet<String>,
        now: DateTime<Utc>,
    ) -> Vec<Candidate> {
        let mut eligible: Vec<&DispatchEntry> = self
            .entries
            .values()
            .filter(|e| {
                e.is_claimable(now)
                    && (e.provider == fleet || e.provider == UNROUTED_PROVIDER)
                    && workflows.contains(&e.workflow_id)
            })
            .collect();
        eligible.sort_by_key(|e| e.ordering_key());
        eligible
            .into_iter()
            .map(|e| Candidate {
                id: e.id,
                version: e.version,
            })
            .collect()
    }

    /// Lease a pending entry, if nobody else got there first.
    pub fn try_lease(
        &mut self,
        candidate: Candidate,
        worker_id: Uuid,
        token: LeaseToken,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Option<DispatchEntry> {
        self.update_if(&candidate.id, candidate.version, |entry| {
            if !entry.is_claimable(now) {
                return false;
            }
            entry.status = DispatchStatus::Leased;
            entry.worker_id = Some(worker_id);
            entry.lease_token = Some(token);
            entry.lease_expires_at = Some(expires_at);
            entry.leased_at = Some(now);
            true
        })
        .cloned()
    }

    fn leased_entry_mut(
        &mut self,
        id: &Uuid,
        worker_id: &Uuid,
        token: &LeaseToken,
        now: DateTime<Utc>,
    ) -> Result<&mut DispatchEntry> {
        let entry = self
            .entries
            .get_mut(id)
            .ok_or(DispatchError::DispatchNotFound(*id))?;
        if !entry.holds_lease(worker_id, token, now) {
            return Err(DispatchError::LeaseMismatch { dispatch_id: *id });
        }
        entry.version += 1;
        Ok(entry)
    }

    /// Extend a live lease; the first renewal marks the entry running.
    pub fn renew(
        &mut self,
        id: &Uuid,
        worker_id: &Uuid,
        token: &LeaseToken,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Renewal> {
        let entry = self.leased_entry_mut(id, worker_id, token, now)?;
        let started = entry.status == DispatchStatus::Leased;
        entry.status = DispatchStatus::Running;
        entry.lease_expires_at = Some(expires_at);
        Ok(Renewal {
            entry: entry.clone(),
            started,
        })
    }

    /// Finish a lease, moving the entry to `done` or `failed`.
    pub fn release(
        &mut self,
        id: &Uuid,
        worker_id: &Uuid,
        token: &LeaseToken,
        outcome: DispatchStatus,
        error: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<DispatchEntry> {
        debug_assert!(matches!(outcome, DispatchStatus::Done | DispatchStatus::Failed));
        let entry = self.leased_entry_mut(id, worker_id, token, now)?;
        entry.status = outcome;
        entry.clear_lease();
        if error.is_some() {
            entry.last_error = error;
        }
        Ok(entry.clone())
    }

    /// Voluntarily hand a leased entry back to the pending pool. Does not
    /// count as a failed attempt.
    pub fn abandon(
        &mut self,
        id: &Uuid,
        worker_id: &Uuid,
        token: &LeaseToken,
        now: DateTime<Utc>,
    ) -> Result<DispatchEntry> {
        let seq = self.bump_seq();
        let entry = self.leased_entry_mut(id, worker_id, token, now)?;
        entry.status = DispatchStatus::Pending;
        entry.clear_lease();
        entry.enqueued_at = now;
        entry.seq = seq;
        let entry = entry.clone();
        self.last_enqueued.insert(entry.workflow_id.clone(), now);
        Ok(entry)
    }

    /// Record a failed attempt reported by the lease holder.
    ///
    /// Below `max_attempts` the entry goes back to `pending`, claimable
    /// again after `backoff(attempts)`. Otherwise it is failed for good.
    #[allow(clippy::too_many_arguments)]
    pub fn fail_attempt<F>(
        &mut self,
        id: &Uuid,
        worker_id: &Uuid,
        token: &LeaseToken,
        error: String,
        max_attempts: u32,
        backoff: F,
        now: DateTime<Utc>,
    ) -> Result<Reclaimed>
    where
        F: FnOnce(u32) -> chrono::Duration,
    {
        let seq = self.bump_seq();
        let entry = self.leased_entry_mut(id, worker_id, token, now)?;
        entry.attempts += 1;
        entry.clear_lease();
        entry.last_error = Some(error);
        let exhausted = entry.attempts >= max_attempts;
        if exhausted {
            entry.status = DispatchStatus::Failed;
        } else {
            entry.status = DispatchStatus::Pending;
            entry.enqueued_at = now + backoff(entry.attempts);
            entry.seq = seq;
        }
        let entry = entry.clone();
        if !exhausted {
            self.last_enqueued.insert(entry.workflow_id.clone(), now);
        }
        Ok(Reclaimed { entry, exhausted })
    }

    /// Entries whose lease expired, or whose holder is known dead.
    pub fn reap_candidates(&self, dead_workers: &HashSet<Uuid>, now: DateTime<Utc>) -> Vec<Candidate> {
        self.entries
            .values()
            .filter(|e| e.status.is_active())
            .filter(|e| {
                let expired = e.lease_expires_at.map_or(true, |at| at <= now);
                let orphaned = e.worker_id.is_some_and(|w| dead_workers.contains(&w));
                expired || orphaned
            })
            .map(|e| Candidate {
                id: e.id,
                version: e.version,
            })
            .collect()
    }

    /// Reclaim a lease found by `reap_candidates`, unless it changed since.
    ///
    /// Counts one attempt. Reaching `max_attempts` fails the entry.
    pub fn reclaim(
        &mut self,
        candidate: Candidate,
        reason: &str,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Option<Reclaimed> {
        let seq = self.bump_seq();
        let mut exhausted = false;
        let entry = self
            .update_if(&candidate.id, candidate.version, |entry| {
                if !entry.status.is_active() {
                    return false;
                }
                entry.attempts += 1;
                entry.clear_lease();
                entry.last_error = Some(reason.to_string());
                if entry.attempts >= max_attempts {
                    entry.status = DispatchStatus::Failed;
                    exhausted = true;
                } else {
                    entry.status = DispatchStatus::Pending;
                    entry.enqueued_at = now;
                    entry.seq = seq;
                }
                true
            })?
            .clone();
        if !exhausted {
            self.last_enqueued.insert(entry.workflow_id.clone(), now);
        }
        Some(Reclaimed { entry, exhausted })
    }

    /// Fail an entry regardless of its lease (cancellation, expiry).
    pub fn force_fail(&mut self, id: &Uuid, reason: &str) -> Option<DispatchEntry> {
        let entry = self.entries.get_mut(id)?;
        if matches!(entry.status, DispatchStatus::Done | DispatchStatus::Failed) {
            return None;
        }
        entry.status = DispatchStatus::Failed;
        entry.clear_lease();
        entry.last_error = Some(reason.to_string());
        entry.version += 1;
        Some(entry.clone())
    }

    /// Pending entries created before `cutoff`.
    pub fn stale_pending(&self, cutoff: DateTime<Utc>) -> Vec<Candidate> {
        self.entries
            .values()
            .filter(|e| e.status == DispatchStatus::Pending && e.created_at < cutoff)
            .map(|e| Candidate {
                id: e.id,
                version: e.version,
            })
            .collect()
    }

    /// Live leases held by a worker.
    pub fn leases_held_by(&self, worker_id: &Uuid, now: DateTime<Utc>) -> Vec<&DispatchEntry> {
        self.entries
            .values()
            .filter(|e| e.worker_id.as_ref() == Some(worker_id) && e.has_live_lease(now))
            .collect()
    }

    /// Derived load: number of live leases held by the worker.
    pub fn load_of(&self, worker_id: &Uuid, now: DateTime<Utc>) -> usize {
        self.entries
            .values()
            .filter(|e| e.worker_id.as_ref() == Some(worker_id) && e.has_live_lease(now))
            .count()
    }

    /// Live lease counts for every worker holding at least one.
    pub fn loads(&self, now: DateTime<Utc>) -> HashMap<Uuid, usize> {
        let mut loads = HashMap::new();
        for entry in self.entries.values().filter(|e| e.has_live_lease(now)) {
            if let Some(worker_id) = entry.worker_id {
                *loads.entry(worker_id).or_insert(0) += 1;
            }
        }
        loads
    }

    /// Queue depth: pending entries routed to a fleet, including ones in
    /// backoff.
    pub fn pending_count(&self, provider: &str) -> usize {
        self.entries
            .values()
            .filter(|e| e.status == DispatchStatus::Pending && e.provider == provider)
            .count()
    }

    pub fn in_flight_count(&self, provider: &str) -> usize {
        self.entries
            .values()
            .filter(|e| e.status.is_active() && e.provider == provider)
            .count()
    }

    pub fn last_enqueued_at(&self, provider: &str) -> Option<DateTime<Utc>> {
        self.last_enqueued.get(provider).copied()
    }

    /// Entries sorted by claim order.
    pub fn all_entries(&self) -> Vec<&DispatchEntry> {
        let mut entries: Vec<&DispatchEntry> = self.entries.values().collect();
        entries.sort_by_key(|e| e.ordering_key());
        entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries not yet done or failed.
    pub fn live_count(&self) -> usize {
        self.entries
            .values()
            .filter(|e| !e.status.is_terminal())
            .count()
    }

    /// Only live entries count against the bound; finished ones wait for the
    /// retention purge without blocking new work.
    pub fn is_full(&self) -> bool {
        self.live_count() >= self.max_entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::job::SubmitRequest;
    use chrono::Duration;
    use serde_json::json;

    fn job(workflow: &str) -> Job {
        Job::new(
            &SubmitRequest::new("tenant", workflow, Uuid::new_v4().to_string(), json!({})),
            Utc::now(),
        )
    }

    fn workflows(names: &[&str]) -> HashSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn lease_first(
        table: &mut DispatchTable,
        worker: Uuid,
        now: DateTime<Utc>,
    ) -> (DispatchEntry, LeaseToken) {
        let candidate = table.claim_candidates("p", &workflows(&["wf"]), now)[0];
        let token = LeaseToken::generate();
        let entry = table
            .try_lease(candidate, worker, token, now + Duration::seconds(30), now)
            .unwrap();
        (entry, token)
    }

    #[test]
    fn lease_token_hex_roundtrip() {
        let token = LeaseToken::generate();
        let text = token.to_string();
        assert_eq!(text.len(), 32);
        assert_eq!(text.parse::<LeaseToken>().unwrap(), token);
        assert!("xyz".parse::<LeaseToken>().is_err());
        assert_eq!(format!("{:?}", token), "LeaseToken(..)");
    }

    #[test]
    fn candidates_follow_priority_then_fifo() {
        let mut table = DispatchTable::new();
        let now = Utc::now();
        let low = table.insert(&job("wf"), "p", 5, now).unwrap();
        let urgent_a = table.insert(&job("wf"), "p", 1, now).unwrap();
        let urgent_b = table.insert(&job("wf"), "p", 1, now).unwrap();
        table.insert(&job("other"), "p", 0, now).unwrap();

        let order: Vec<Uuid> = table
            .claim_candidates("p", &workflows(&["wf"]), now)
            .into_iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(order, vec![urgent_a.id, urgent_b.id, low.id]);
    }

    #[test]
    fn racing_claims_have_exactly_one_winner() {
        let mut table = DispatchTable::new();
        let now = Utc::now();
        table.insert(&job("wf"), "p", 1, now).unwrap();

        // Both claimants read the same snapshot.
        let candidate = table.claim_candidates("p", &workflows(&["wf"]), now)[0];
        let expires = now + Duration::seconds(30);
        let first = table.try_lease(candidate, Uuid::new_v4(), LeaseToken::generate(), expires, now);
        let second = table.try_lease(candidate, Uuid::new_v4(), LeaseToken::generate(), expires, now);

        assert!(first.is_some());
        assert!(second.is_none());
        let entry = table.get(&candidate.id).unwrap();
        assert_eq!(entry.status, DispatchStatus::Leased);
        assert_eq!(entry.worker_id, first.unwrap().worker_id);
    }

    #[test]
    fn renew_checks_token_and_marks_running() {
        let mut table = DispatchTable::new();
        let now = Utc::now();
        table.insert(&job("wf"), "p", 1, now).unwrap();
        let worker = Uuid::new_v4();
        let (entry, token) = lease_first(&mut table, worker, now);

        let wrong = table.renew(&entry.id, &worker, &LeaseToken::generate(), now, now);
        assert_eq!(
            wrong.unwrap_err(),
            DispatchError::LeaseMismatch {
                dispatch_id: entry.id
            }
        );

        let stranger = table.renew(&entry.id, &Uuid::new_v4(), &token, now, now);
        assert!(stranger.is_err());

        let renewal = table
            .renew(&entry.id, &worker, &token, now + Duration::seconds(60), now)
            .unwrap();
        assert!(renewal.started);
        assert_eq!(renewal.entry.status, DispatchStatus::Running);

        let again = table
            .renew(&entry.id, &worker, &token, now + Duration::seconds(90), now)
            .unwrap();
        assert!(!again.started);
    }

    #[test]
    fn expired_lease_is_not_live() {
        let mut table = DispatchTable::new();
        let now = Utc::now();
        table.insert(&job("wf"), "p", 1, now).unwrap();
        let worker = Uuid::new_v4();
        let (entry, token) = lease_first(&mut table, worker, now);

        let later = now + Duration::seconds(31);
        assert!(table.renew(&entry.id, &worker, &token, later, later).is_err());
        assert_eq!(table.load_of(&worker, later), 0);
        assert_eq!(table.load_of(&worker, now), 1);
    }

    #[test]
    fn reclaim_skips_entries_changed_since_snapshot() {
        let mut table = DispatchTable::new();
        let now = Utc::now();
        table.insert(&job("wf"), "p", 1, now).unwrap();
        let worker = Uuid::new_v4();
        let (entry, token) = lease_first(&mut table, worker, now);

        // Reaper snapshots the expired lease...
        let later = now + Duration::seconds(30);
        let candidates = table.reap_candidates(&HashSet::new(), later);
        assert_eq!(candidates.len(), 1);

        // ...then another writer updates the row before the reaper applies.
        table
            .update_if(&entry.id, candidates[0].version, |e| {
                e.lease_expires_at = Some(later + Duration::seconds(30));
                true
            })
            .unwrap();

        assert!(table.reclaim(candidates[0], "lease expired", 3, later).is_none());
        let current = table.get(&entry.id).unwrap();
        assert_eq!(current.status, DispatchStatus::Leased);
        assert_eq!(current.lease_token, Some(token));
        assert_eq!(current.attempts, 0);
    }

    #[test]
    fn reclaim_requeues_then_exhausts() {
        let mut table = DispatchTable::new();
        let now = Utc::now();
        table.insert(&job("wf"), "p", 1, now).unwrap();
        let worker = Uuid::new_v4();

        // A reclaimed entry is re-enqueued at the reap instant, so each round
        // claims at the previous round's reap time.
        let mut clock = now;
        for attempt in 1..=2 {
            let (entry, _) = lease_first(&mut table, worker, clock);
            let later = clock + Duration::seconds(31);
            let candidate = table.reap_candidates(&HashSet::new(), later)[0];
            let reclaimed = table.reclaim(candidate, "lease expired", 2, later).unwrap();
            assert_eq!(reclaimed.entry.id, entry.id);
            assert_eq!(reclaimed.entry.attempts, attempt);
            assert_eq!(reclaimed.exhausted, attempt == 2);
            assert!(reclaimed.entry.worker_id.is_none());
            assert!(reclaimed.entry.lease_token.is_none());
            clock = later;
        }

        assert_eq!(table.pending_count("p"), 0);
        assert_eq!(table.all_entries()[0].status, DispatchStatus::Failed);
    }

    #[test]
    fn dead_worker_leases_are_reap_candidates() {
        let mut table = DispatchTable::new();
        let now = Utc::now();
        table.insert(&job("wf"), "p", 1, now).unwrap();
        let worker = Uuid::new_v4();
        lease_first(&mut table, worker, now);

        assert!(table.reap_candidates(&HashSet::new(), now).is_empty());
        let dead: HashSet<Uuid> = [worker].into_iter().collect();
        assert_eq!(table.reap_candidates(&dead, now).len(), 1);
    }

    #[test]
    fn failed_attempt_backs_off_then_exhausts() {
        let mut table = DispatchTable::new();
        let now = Utc::now();
        table.insert(&job("wf"), "p", 1, now).unwrap();
        let worker = Uuid::new_v4();
        let (entry, token) = lease_first(&mut table, worker, now);

        let failed = table
            .fail_attempt(&entry.id, &worker, &token, "oom".into(), 2, |_| Duration::seconds(10), now)
            .unwrap();
        assert!(!failed.exhausted);
        assert_eq!(failed.entry.attempts, 1);
        assert_eq!(failed.entry.status, DispatchStatus::Pending);
        assert_eq!(failed.entry.last_error.as_deref(), Some("oom"));

        // Still counted as backlog, but not claimable until the backoff passes.
        assert!(table.claim_candidates("p", &workflows(&["wf"]), now).is_empty());
        assert_eq!(table.pending_count("p"), 1);

        let retry_at = now + Duration::seconds(10);
        let (entry, token) = lease_first(&mut table, worker, retry_at);
        let failed = table
            .fail_attempt(&entry.id, &worker, &token, "oom".into(), 2, |_| Duration::seconds(10), retry_at)
            .unwrap();
        assert!(failed.exhausted);
        assert_eq!(failed.entry.status, DispatchStatus::Failed);
        assert_eq!(table.pending_count("p"), 0);
    }

    #[test]
    fn abandon_does_not_count_attempt() {
        let mut table = DispatchTable::new();
        let now = Utc::now();
        table.insert(&job("wf"), "p", 1, now).unwrap();
        let worker = Uuid::new_v4();
        let (entry, token) = lease_first(&mut table, worker, now);

        let abandoned = table.abandon(&entry.id, &worker, &token, now).unwrap();
        assert_eq!(abandoned.status, DispatchStatus::Pending);
        assert_eq!(abandoned.attempts, 0);
        assert!(abandoned.lease_token.is_none());
        assert_eq!(table.claim_candidates("p", &workflows(&["wf"]), now).len(), 1);
    }

    #[test]
    fn release_clears_lease_fields() {
        let mut table = DispatchTable::new();
        let now = Utc::now();
        table.insert(&job("wf"), "p", 1, now).unwrap();
        let worker = Uuid::new_v4();
        let (entry, token) = lease_first(&mut table, worker, now);

        let done = table
            .release(&entry.id, &worker, &token, DispatchStatus::Done, None, now)
            .unwrap();
        assert_eq!(done.status, DispatchStatus::Done);
        assert!(done.worker_id.is_none() && done.lease_token.is_none());
        assert!(done.lease_expires_at.is_none());

        // The old token no longer validates anything.
        assert!(table
            .release(&entry.id, &worker, &token, DispatchStatus::Done, None, now)
            .is_err());
    }

    #[test]
    fn capacity_limit() {
        let mut table = DispatchTable::with_capacity(2);
        let now = Utc::now();
        assert!(table.insert(&job("wf"), "p", 1, now).is_ok());
        assert!(table.insert(&job("wf"), "p", 1, now).is_ok());
        assert!(table.is_full());
        assert_eq!(
            table.insert(&job("wf"), "p", 1, now).unwrap_err(),
            DispatchError::QueueFull
        );
    }

    #[test]
    fn finished_entries_do_not_count_against_capacity() {
        let mut table = DispatchTable::with_capacity(2);
        let now = Utc::now();
        table.insert(&job("wf"), "p", 1, now).unwrap();
        table.insert(&job("wf"), "p", 1, now).unwrap();
        let worker = Uuid::new_v4();
        for _ in 0..2 {
            let (entry, token) = lease_first(&mut table, worker, now);
            table
                .release(&entry.id, &worker, &token, DispatchStatus::Done, None, now)
                .unwrap();
        }

        assert_eq!(table.len(), 2);
        assert_eq!(table.live_count(), 0);
        assert!(!table.is_full());
        assert!(table.insert(&job("wf"), "p", 1, now).is_ok());
    }

    #[test]
    fn claims_and_counts_are_scoped_to_the_fleet() {
        let mut table = DispatchTable::new();
        let now = Utc::now();
        table.insert(&job("wf"), "prod", 1, now).unwrap();
        table.insert(&job("wf"), "prod", 1, now).unwrap();
        table.insert(&job("wf"), "staging", 1, now).unwrap();
        table.insert(&job("wf"), UNROUTED_PROVIDER, 1, now).unwrap();

        assert_eq!(table.pending_count("prod"), 2);
        assert_eq!(table.pending_count("staging"), 1);
        assert!(table.last_enqueued_at("staging").is_some());
        assert!(table.last_enqueued_at("canary").is_none());

        // Unrouted work is open to every fleet.
        let wf = workflows(&["wf"]);
        assert_eq!(table.claim_candidates("prod", &wf, now).len(), 3);
        assert_eq!(table.claim_candidates("staging", &wf, now).len(), 2);
        assert_eq!(table.claim_candidates("canary", &wf, now).len(), 1);
    }
}
