use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{DispatchError, Result};

/// Retry backoff applied when a worker reports a failed attempt.
///
/// The delay for attempt `n` (1-based) is `base_delay * multiplier^(n-1)`,
/// capped at `max_delay`, with up to `jitter` of extra random delay.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Fraction of the computed delay added as random jitter (0.0 disables).
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Deterministic part of the backoff for the given failed attempt count.
    pub fn base_delay_for(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(32) as i32;
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = secs.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }

    pub fn delay_for(&self, attempts: u32) -> Duration {
        let base = self.base_delay_for(attempts);
        if self.jitter <= 0.0 || base.is_zero() {
            return base;
        }
        let extra = rand::thread_rng().gen_range(0.0..=self.jitter) * base.as_secs_f64();
        base + Duration::from_secs_f64(extra)
    }
}

/// Lease protocol and ledger policy.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Expected interval between worker heartbeats.
    pub heartbeat_interval: Duration,
    /// Lease duration as a multiple of the heartbeat interval.
    pub lease_ratio: u32,
    pub max_attempts: u32,
    pub retry: RetryPolicy,
    pub reaper_interval: Duration,
    /// A worker silent for longer than this is considered dead.
    pub dead_worker_after: Duration,
    /// How long terminal jobs are kept before the reaper purges them.
    pub retention: Duration,
    /// Jobs still queued after this long expire. `None` disables expiry.
    pub queue_ttl: Option<Duration>,
    pub max_entries: usize,
    pub default_priority: i32,
    pub max_claim_batch: usize,
    pub max_claim_wait: Duration,
    pub auto_approve_workers: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(10),
            lease_ratio: 3,
            max_attempts: 3,
            retry: RetryPolicy::default(),
            reaper_interval: Duration::from_secs(5),
            dead_worker_after: Duration::from_secs(60),
            retention: Duration::from_secs(24 * 60 * 60),
            queue_ttl: Some(Duration::from_secs(24 * 60 * 60)),
            max_entries: 10_000,
            default_priority: 5,
            max_claim_batch: 16,
            max_claim_wait: Duration::from_secs(30),
            auto_approve_workers: true,
        }
    }
}

impl DispatchConfig {
    pub fn lease_duration(&self) -> Duration {
        self.heartbeat_interval * self.lease_ratio
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_interval.is_zero() {
            return Err(DispatchError::InvalidRequest(
                "heartbeat_interval must be positive".to_string(),
            ));
        }
        if self.lease_ratio < 1 {
            return Err(DispatchError::InvalidRequest(
                "lease_ratio must be at least 1".to_string(),
            ));
        }
        if self.max_attempts == 0 {
            return Err(DispatchError::InvalidRequest(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if self.reaper_interval.is_zero() {
            return Err(DispatchError::InvalidRequest(
                "reaper_interval must be positive".to_string(),
            ));
        }
        if self.max_claim_batch == 0 {
            return Err(DispatchError::InvalidRequest(
                "max_claim_batch must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Cadences of the autoscaling loops.
#[derive(Debug, Clone)]
pub struct AutoscaleConfig {
    /// Fast step controller tick.
    pub fast_interval: Duration,
    /// Scale-to-zero watchdog tick.
    pub watchdog_interval: Duration,
    /// Metrics feed emission interval.
    pub metrics_interval: Duration,
    /// Claim wait samples older than this are dropped from the p95.
    pub wait_sample_window: Duration,
    /// SLO pressure below this allows a fast-loop scale-down by one.
    pub low_pressure_threshold: f64,
}

impl Default for AutoscaleConfig {
    fn default() -> Self {
        Self {
            fast_interval: Duration::from_secs(10),
            watchdog_interval: Duration::from_secs(60),
            metrics_interval: Duration::from_secs(15),
            wait_sample_window: Duration::from_secs(5 * 60),
            low_pressure_threshold: 0.5,
        }
    }
}

/// Static configuration of one fleet, usually loaded from a JSON file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FleetConfig {
    pub slug: String,
    pub workflow_id: String,
    #[serde(default = "default_stage")]
    pub stage: String,
    #[serde(default)]
    pub instance_types: Vec<String>,
    pub max_size: u32,
    #[serde(default = "default_warmup_seconds")]
    pub warmup_seconds: u64,
    #[serde(default = "default_backlog_target")]
    pub backlog_target: u32,
    #[serde(default = "default_scale_to_zero_minutes")]
    pub scale_to_zero_minutes: u64,
    #[serde(default = "default_slo_target_wait_secs")]
    pub slo_target_wait_secs: u64,
}

fn default_stage() -> String {
    "prod".to_string()
}

fn default_warmup_seconds() -> u64 {
    300
}

fn default_backlog_target() -> u32 {
    4
}

fn default_scale_to_zero_minutes() -> u64 {
    15
}

fn default_slo_target_wait_secs() -> u64 {
    60
}

impl FleetConfig {
    pub fn new(slug: impl Into<String>, workflow_id: impl Into<String>, max_size: u32) -> Self {
        Self {
            slug: slug.into(),
            workflow_id: workflow_id.into(),
            stage: default_stage(),
            instance_types: Vec::new(),
            max_size,
            warmup_seconds: default_warmup_seconds(),
            backlog_target: default_backlog_target(),
            scale_to_zero_minutes: default_scale_to_zero_minutes(),
            slo_target_wait_secs: default_slo_target_wait_secs(),
        }
    }

    pub fn with_warmup_seconds(mut self, secs: u64) -> Self {
        self.warmup_seconds = secs;
        self
    }

    pub fn with_backlog_target(mut self, target: u32) -> Self {
        self.backlog_target = target;
        self
    }

    pub fn with_scale_to_zero_minutes(mut self, minutes: u64) -> Self {
        self.scale_to_zero_minutes = minutes;
        self
    }

    pub fn warmup(&self) -> Duration {
        Duration::from_secs(self.warmup_seconds)
    }

    pub fn scale_to_zero_window(&self) -> Duration {
        Duration::from_secs(self.scale_to_zero_minutes.saturating_mul(60))
    }

    pub fn validate(&self) -> Result<()> {
        if self.slug.trim().is_empty() {
            return Err(DispatchError::InvalidRequest(
                "fleet slug cannot be empty".to_string(),
            ));
        }
        if self.workflow_id.trim().is_empty() {
            return Err(DispatchError::InvalidRequest(format!(
                "fleet {} has no workflow_id",
                self.slug
            )));
        }
        if self.backlog_target == 0 {
            return Err(DispatchError::InvalidRequest(format!(
                "fleet {} backlog_target must be at least 1",
                self.slug
            )));
        }
        Ok(())
    }

    /// Load a JSON array of fleets.
    pub fn load_all(path: &Path) -> std::result::Result<Vec<Self>, Box<dyn std::error::Error>> {
        let data = std::fs::read_to_string(path)?;
        let fleets: Vec<Self> = serde_json::from_str(&data)?;
        for fleet in &fleets {
            fleet.validate()?;
        }
        Ok(fleets)
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub dispatch: DispatchConfig,
    pub autoscale: AutoscaleConfig,
    pub fleets: Vec<FleetConfig>,
    /// Bearer token for operator routes; `None` leaves them open.
    pub admin_token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            dispatch: DispatchConfig::default(),
            autoscale: AutoscaleConfig::default(),
            fleets: Vec::new(),
            admin_token: None,
        }
    }
}

impl ServerConfig {
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            ..Default::default()
        }
    }

    pub fn with_fleet(mut self, fleet: FleetConfig) -> Self {
        self.fleets.push(fleet);
        self
    }

    pub fn validate(&self) -> Result<()> {
        self.dispatch.validate()?;
        let mut slugs = HashSet::new();
        for fleet in &self.fleets {
            fleet.validate()?;
            if !slugs.insert(fleet.slug.as_str()) {
                return Err(DispatchError::InvalidRequest(format!(
                    "fleet {} is defined more than once",
                    fleet.slug
                )));
            }
        }
        Ok(())
    }
}
