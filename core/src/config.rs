use crate::reuse_policy::ReusePolicy;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Lifetime of an assignment when the caller gives no expiry.
    pub assignment_ttl_hours: u32,
    /// Upper bound on ids in one explicit assignment request.
    pub max_leads_per_assign: u32,
    /// Upper bound on `count` for bulk assignment.
    pub max_bulk_count: u32,
    /// Upper bound on ids in one manual reuse request.
    pub max_manual_reuse: u32,
    /// Candidates considered per automatic reuse run.
    pub reuse_batch_size: u32,
    /// Stale assignments expired per reaper run.
    pub expiry_batch_size: u32,
    pub sweep_interval_secs: u64,
    pub busy_timeout_ms: u64,
    /// Materialized for a tenant the first time its policy is read.
    pub default_policy: ReusePolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            assignment_ttl_hours: 24,
            max_leads_per_assign: 100,
            max_bulk_count:       100,
            max_manual_reuse:     50,
            reuse_batch_size:     100,
            expiry_batch_size:    500,
            sweep_interval_secs:  300,
            busy_timeout_ms:      5_000,
            default_policy:       ReusePolicy::default(),
        }
    }
}

impl EngineConfig {
    /// Load from the data/ directory.
    /// In tests, use EngineConfig::default().
    pub fn load(data_dir: &str) -> anyhow::Result<Self> {
        let path = format!("{data_dir}/engine/engine_config.json");
        let content = std::fs::read_to_string(&path)
            .map_err(|e| anyhow::anyhow!("Cannot read {path}: {e}"))?;
        let config: EngineConfig = serde_json::from_str(&content)?;
        config
            .default_policy
            .validate()
            .map_err(|e| anyhow::anyhow!("{path}: default_policy: {e}"))?;
        Ok(config)
    }

    pub fn assignment_ttl(&self) -> chrono::Duration {
        chrono::Duration::hours(i64::from(self.assignment_ttl_hours))
    }

    pub fn busy_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.busy_timeout_ms)
    }

    pub fn sweep_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.sweep_interval_secs)
    }
}
