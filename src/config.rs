use crate::core::{MemberConfiguration, RegistryError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Timeouts used by the leader-routed consensus client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusClientConfig {
    /// Deadline for a single request round trip in milliseconds.
    pub rpc_timeout_ms: u64,
    /// Deadline for a leader/membership refresh in milliseconds.
    pub refresh_timeout_ms: u64,
    /// Wait before sending to a redirect target, so a freshly promoted leader can finish
    /// its start-up sequence.
    pub redirect_grace_ms: u64,
}

impl Default for ConsensusClientConfig {
    fn default() -> Self {
        Self {
            rpc_timeout_ms: 5_000,
            refresh_timeout_ms: 5_000,
            redirect_grace_ms: 1_000,
        }
    }
}

impl ConsensusClientConfig {
    pub fn rpc_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.rpc_timeout_ms = timeout_ms;
        self
    }

    pub fn refresh_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.refresh_timeout_ms = timeout_ms;
        self
    }

    pub fn redirect_grace_ms(mut self, grace_ms: u64) -> Self {
        self.redirect_grace_ms = grace_ms;
        self
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn refresh_timeout(&self) -> Duration {
        Duration::from_millis(self.refresh_timeout_ms)
    }

    pub fn redirect_grace(&self) -> Duration {
        Duration::from_millis(self.redirect_grace_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.rpc_timeout_ms == 0 {
            return Err(RegistryError::InvalidConfiguration(
                "rpc_timeout_ms must be > 0".to_string(),
            ));
        }
        if self.refresh_timeout_ms == 0 {
            return Err(RegistryError::InvalidConfiguration(
                "refresh_timeout_ms must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Sizing of one batched push-task pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub name: String,
    /// Maximum number of pending items.
    pub capacity: usize,
    /// Pending items older than this are evicted on admission.
    #[serde(default)]
    pub max_age_ms: Option<u64>,
    /// Maximum items handed to the sink per drain.
    pub batch_size: usize,
    /// Idle wait between drain cycles in milliseconds.
    pub drain_interval_ms: u64,
}

impl PipelineConfig {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            capacity: 10_000,
            max_age_ms: None,
            batch_size: 100,
            drain_interval_ms: 100,
        }
    }

    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn max_age_ms(mut self, max_age_ms: u64) -> Self {
        self.max_age_ms = Some(max_age_ms);
        self
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn drain_interval_ms(mut self, interval_ms: u64) -> Self {
        self.drain_interval_ms = interval_ms;
        self
    }

    pub fn max_age(&self) -> Option<Duration> {
        self.max_age_ms.map(Duration::from_millis)
    }

    pub fn drain_interval(&self) -> Duration {
        Duration::from_millis(self.drain_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(RegistryError::InvalidConfiguration(
                "pipeline name must not be empty".to_string(),
            ));
        }
        if self.capacity == 0 {
            return Err(RegistryError::InvalidConfiguration(format!(
                "pipeline '{}': capacity must be > 0",
                self.name
            )));
        }
        if self.batch_size == 0 {
            return Err(RegistryError::InvalidConfiguration(format!(
                "pipeline '{}': batch_size must be > 0",
                self.name
            )));
        }
        if self.max_age_ms == Some(0) {
            return Err(RegistryError::InvalidConfiguration(format!(
                "pipeline '{}': max_age_ms must be > 0 when set",
                self.name
            )));
        }
        if self.drain_interval_ms == 0 {
            return Err(RegistryError::InvalidConfiguration(format!(
                "pipeline '{}': drain_interval_ms must be > 0",
                self.name
            )));
        }
        Ok(())
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::new("default")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReporterConfig {
    pub interval_ms: u64,
}

impl Default for ReporterConfig {
    fn default() -> Self {
        Self { interval_ms: 10_000 }
    }
}

impl ReporterConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(10))
    }
}

/// Top-level node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub group_id: String,
    /// Comma-separated `host:port` list of consensus members.
    pub members: String,
    #[serde(default)]
    pub client: ConsensusClientConfig,
    #[serde(default)]
    pub pipelines: Vec<PipelineConfig>,
    #[serde(default)]
    pub reporter: ReporterConfig,
}

impl ServerConfig {
    pub fn new(group_id: &str, members: &str) -> Self {
        Self {
            group_id: group_id.to_string(),
            members: members.to_string(),
            client: ConsensusClientConfig::default(),
            pipelines: Vec::new(),
            reporter: ReporterConfig::default(),
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn member_configuration(&self) -> Result<MemberConfiguration> {
        MemberConfiguration::parse(&self.members)
    }

    pub fn validate(&self) -> Result<()> {
        if self.group_id.trim().is_empty() {
            return Err(RegistryError::InvalidConfiguration(
                "group_id must not be empty".to_string(),
            ));
        }
        self.member_configuration()?;
        self.client.validate()?;

        let mut names = std::collections::HashSet::new();
        for pipeline in &self.pipelines {
            pipeline.validate()?;
            if !names.insert(pipeline.name.as_str()) {
                return Err(RegistryError::InvalidConfiguration(format!(
                    "duplicate pipeline name '{}'",
                    pipeline.name
                )));
            }
        }
        Ok(())
    }
}
