//! Engine configuration.
//!
//! Loaded from JSON. Every field has a default, so `{}` is a valid config.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::{EngineError, SupervisorPolicy};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Dispatcher loops spawned by `Runtime::spawn_workers`.
    pub workers: usize,
    pub lease_ttl_ms: u64,
    /// Idle sleep of a dispatcher starts here and doubles up to `idle_max_ms`.
    pub idle_min_ms: u64,
    pub idle_max_ms: u64,
    /// Bound on one provider call made by a channel processor.
    pub provider_timeout_ms: u64,
    /// Policy used by workflows that do not bring their own.
    pub supervisor: SupervisorPolicy,
    /// Allowed skew between a webhook's signed timestamp and its arrival.
    pub webhook_tolerance_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            lease_ttl_ms: 300_000,
            idle_min_ms: 100,
            idle_max_ms: 2_000,
            provider_timeout_ms: 10_000,
            supervisor: SupervisorPolicy::default(),
            webhook_tolerance_secs: 300,
        }
    }
}

impl EngineConfig {
    pub fn from_json_str(s: &str) -> Result<Self, EngineError> {
        let config: Self =
            serde_json::from_str(s).map_err(|e| EngineError::Config(format!("parse: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("read {}: {e}", path.display())))?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        let fail = |msg: &str| -> Result<(), EngineError> {
            Err(EngineError::Config(msg.to_string()))
        };
        if self.workers == 0 {
            return fail("workers must be at least 1");
        }
        if self.lease_ttl_ms == 0 {
            return fail("lease_ttl_ms must be positive");
        }
        if self.idle_min_ms > self.idle_max_ms {
            return fail("idle_min_ms must not exceed idle_max_ms");
        }
        validate_policy(&self.supervisor)
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_millis(self.lease_ttl_ms)
    }

    pub fn idle_min(&self) -> Duration {
        Duration::from_millis(self.idle_min_ms)
    }

    pub fn idle_max(&self) -> Duration {
        Duration::from_millis(self.idle_max_ms)
    }

    pub fn provider_timeout(&self) -> Duration {
        Duration::from_millis(self.provider_timeout_ms)
    }

    pub fn webhook_tolerance(&self) -> Duration {
        Duration::from_secs(self.webhook_tolerance_secs)
    }
}

/// Checks shared by the default policy and per-workflow overrides.
pub fn validate_policy(policy: &SupervisorPolicy) -> Result<(), EngineError> {
    if policy.backoff.base_delay_ms > policy.backoff.max_delay_ms {
        return Err(EngineError::Config(
            "base_delay_ms must not exceed max_delay_ms".into(),
        ));
    }
    if policy.max_attempts == 0 {
        return Err(EngineError::Config("max_attempts must be at least 1".into()));
    }
    if policy.max_runs == 0 {
        return Err(EngineError::Config("max_runs must be at least 1".into()));
    }
    Ok(())
}
