use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::FleetConfig;
use crate::error::{DispatchError, Result};

/// Which loop asked for a capacity change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScaleSource {
    Controller,
    Watchdog,
    Operator,
}

/// A pool of homogeneous workers for one workflow and stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fleet {
    #[serde(flatten)]
    pub config: FleetConfig,
    pub desired_capacity: u32,
    /// Last change requested by the fast controller or an operator; the
    /// warm-up cooldown is measured from here.
    pub last_scaled_at: Option<DateTime<Utc>>,
    pub last_scale_source: Option<ScaleSource>,
    pub last_scale_reason: Option<String>,
}

impl Fleet {
    pub fn new(config: FleetConfig) -> Self {
        Self {
            config,
            desired_capacity: 0,
            last_scaled_at: None,
            last_scale_source: None,
            last_scale_reason: None,
        }
    }

    pub fn slug(&self) -> &str {
        &self.config.slug
    }

    /// True while a change requested by the fast controller is warming up.
    pub fn in_warmup(&self, now: DateTime<Utc>) -> bool {
        match (self.last_scaled_at, self.last_scale_source) {
            (Some(at), Some(ScaleSource::Controller | ScaleSource::Operator)) => {
                let elapsed = now.signed_duration_since(at);
                elapsed
                    .to_std()
                    .map_or(true, |elapsed| elapsed < self.config.warmup())
            }
            _ => false,
        }
    }
}

/// Desired capacity per fleet: written by the autoscaler, read by the
/// external capacity provider.
#[derive(Debug, Default)]
pub struct FleetRegistry {
    fleets: BTreeMap<String, Fleet>,
}

impl FleetRegistry {
    pub fn new(configs: impl IntoIterator<Item = FleetConfig>) -> Self {
        let fleets = configs
            .into_iter()
            .map(|config| (config.slug.clone(), Fleet::new(config)))
            .collect();
        Self { fleets }
    }

    pub fn get(&self, slug: &str) -> Option<&Fleet> {
        self.fleets.get(slug)
    }

    pub fn all(&self) -> Vec<&Fleet> {
        self.fleets.values().collect()
    }

    pub fn contains(&self, slug: &str) -> bool {
        self.fleets.contains_key(slug)
    }

    /// The first fleet (by slug) that serves a workflow; the default route
    /// for submissions that do not name a fleet.
    pub fn fleet_for_workflow(&self, workflow_id: &str) -> Option<&Fleet> {
        self.fleets
            .values()
            .find(|f| f.config.workflow_id == workflow_id)
    }

    /// Write desired capacity, clamped to `[0, max_size]`.
    ///
    /// Returns `Ok(true)` when the value changed; writing the current value
    /// again is a no-op.
    pub fn set_desired(
        &mut self,
        slug: &str,
        desired: u32,
        source: ScaleSource,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let fleet = self
            .fleets
            .get_mut(slug)
            .ok_or_else(|| DispatchError::FleetNotFound(slug.to_string()))?;
        let clamped = desired.min(fleet.config.max_size);
        if clamped == fleet.desired_capacity {
            return Ok(false);
        }

        tracing::info!(
            fleet = %slug,
            from = fleet.desired_capacity,
            to = clamped,
            source = ?source,
            reason,
            "Desired capacity changed"
        );
        fleet.desired_capacity = clamped;
        fleet.last_scaled_at = Some(now);
        fleet.last_scale_source = Some(source);
        fleet.last_scale_reason = Some(reason.to_string());
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn registry() -> FleetRegistry {
        FleetRegistry::new(vec![
            FleetConfig::new("sdxl-prod", "sdxl", 4).with_warmup_seconds(120),
            FleetConfig::new("llm-prod", "llm", 2),
        ])
    }

    #[test]
    fn set_desired_clamps_and_is_idempotent() {
        let mut fleets = registry();
        let now = Utc::now();

        assert!(fleets
            .set_desired("sdxl-prod", 10, ScaleSource::Controller, "backlog", now)
            .unwrap());
        assert_eq!(fleets.get("sdxl-prod").unwrap().desired_capacity, 4);

        assert!(!fleets
            .set_desired("sdxl-prod", 4, ScaleSource::Controller, "backlog", now)
            .unwrap());
    }

    #[test]
    fn unknown_fleet_is_an_error() {
        let mut fleets = registry();
        assert_eq!(
            fleets
                .set_desired("nope", 1, ScaleSource::Operator, "manual", Utc::now())
                .unwrap_err(),
            DispatchError::FleetNotFound("nope".to_string())
        );
    }

    #[test]
    fn warmup_applies_to_controller_changes_only() {
        let mut fleets = registry();
        let now = Utc::now();
        fleets
            .set_desired("sdxl-prod", 2, ScaleSource::Controller, "backlog", now)
            .unwrap();
        let fleet = fleets.get("sdxl-prod").unwrap();
        assert!(fleet.in_warmup(now + Duration::seconds(60)));
        assert!(!fleet.in_warmup(now + Duration::seconds(120)));

        fleets
            .set_desired("sdxl-prod", 0, ScaleSource::Watchdog, "idle", now)
            .unwrap();
        assert!(!fleets.get("sdxl-prod").unwrap().in_warmup(now));
    }

    #[test]
    fn workflow_lookup() {
        let fleets = registry();
        assert_eq!(fleets.fleet_for_workflow("llm").unwrap().slug(), "llm-prod");
        assert!(fleets.fleet_for_workflow("whisper").is_none());
        assert!(fleets.contains("llm-prod"));
        assert!(!fleets.contains("llm-staging"));
    }
}
