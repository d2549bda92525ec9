use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{flog_debug, Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub log_to_stderr: bool,
    #[serde(default)]
    pub timeouts: Timeouts,
    #[serde(default = "default_agents")]
    pub agents: Vec<AgentConfig>,
    #[serde(default)]
    pub zones: ZoneConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Bounds for every suspension point a workflow can hit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Timeouts {
    #[serde(default = "default_actuator_secs")]
    pub actuator_secs: u64,
    #[serde(default = "default_gate_secs")]
    pub gate_secs: u64,
    #[serde(default = "default_zone_secs")]
    pub zone_secs: u64,
    #[serde(default = "default_join_secs")]
    pub join_secs: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_poll_deadline_secs")]
    pub poll_deadline_secs: u64,
}

fn default_actuator_secs() -> u64 {
    120
}

fn default_gate_secs() -> u64 {
    300
}

fn default_zone_secs() -> u64 {
    600
}

fn default_join_secs() -> u64 {
    1800
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_poll_deadline_secs() -> u64 {
    600
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            actuator_secs: default_actuator_secs(),
            gate_secs: default_gate_secs(),
            zone_secs: default_zone_secs(),
            join_secs: default_join_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            poll_deadline_secs: default_poll_deadline_secs(),
        }
    }
}

impl Timeouts {
    pub fn actuator(&self) -> Duration {
        Duration::from_secs(self.actuator_secs)
    }

    pub fn gate(&self) -> Duration {
        Duration::from_secs(self.gate_secs)
    }

    pub fn zone(&self) -> Duration {
        Duration::from_secs(self.zone_secs)
    }

    pub fn join(&self) -> Duration {
        Duration::from_secs(self.join_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn poll_deadline(&self) -> Duration {
        Duration::from_secs(self.poll_deadline_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    #[default]
    Robot,
    Plc,
}

/// One physical agent the orchestrator can drive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub id: String,
    #[serde(default)]
    pub kind: AgentKind,
    pub host: Option<String>,
    pub port: Option<u16>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl AgentConfig {
    pub fn new(id: &str, kind: AgentKind) -> Self {
        Self {
            id: id.to_string(),
            kind,
            host: None,
            port: None,
            enabled: true,
        }
    }
}

fn default_agents() -> Vec<AgentConfig> {
    vec![
        AgentConfig::new("robot_a", AgentKind::Robot),
        AgentConfig::new("robot_b", AgentKind::Robot),
        AgentConfig::new("plc", AgentKind::Plc),
    ]
}

/// A symmetric pair of zones that must never be occupied by two different
/// agents at once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictPair {
    pub pair: [String; 2],
}

impl ConflictPair {
    pub fn new(a: &str, b: &str) -> Self {
        Self {
            pair: [a.to_string(), b.to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZoneConfig {
    #[serde(default = "default_conflicts")]
    pub conflicts: Vec<ConflictPair>,
}

impl Default for ZoneConfig {
    fn default() -> Self {
        Self {
            conflicts: default_conflicts(),
        }
    }
}

/// Transfer-side and split-side cells of the same physical staging area.
fn default_conflicts() -> Vec<ConflictPair> {
    vec![
        ConflictPair::new("waiting_split_area_transfer", "waiting_split_area_split"),
        ConflictPair::new(
            "split_done_250ml_area_transfer",
            "split_done_250ml_area_split",
        ),
        ConflictPair::new(
            "split_done_500ml_area_transfer",
            "split_done_500ml_area_split",
        ),
    ]
}

impl Config {
    pub fn labflow_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".labflow"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::labflow_dir()?.join("labflow.toml"))
    }

    /// Load from `~/.labflow/labflow.toml`, falling back to defaults.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        flog_debug!("config", "Config::load path={}", path.display());
        if !path.exists() {
            flog_debug!("config", "Config file not found, using defaults");
            return Ok(Self::with_defaults());
        }
        let config = Self::parse(&fs::read_to_string(path)?)?;
        flog_debug!(
            "config",
            "Config loaded: agents={}, conflict_pairs={}",
            config.agents.len(),
            config.zones.conflicts.len()
        );
        Ok(config)
    }

    pub fn parse(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// The built-in configuration: two robots, one PLC, the three staging
    /// area conflict pairs.
    pub fn with_defaults() -> Self {
        Self {
            debug: false,
            log_to_stderr: false,
            timeouts: Timeouts::default(),
            agents: default_agents(),
            zones: ZoneConfig::default(),
        }
    }

    pub fn enabled_agents(&self) -> impl Iterator<Item = &AgentConfig> {
        self.agents.iter().filter(|a| a.enabled)
    }

    pub fn validate(&self) -> Result<()> {
        let mut ids = HashSet::new();
        for agent in &self.agents {
            if agent.id.trim().is_empty() {
                return Err(Error::Validation("agent id must not be empty".to_string()));
            }
            if !ids.insert(agent.id.as_str()) {
                return Err(Error::Validation(format!("duplicate agent id: {}", agent.id)));
            }
        }

        // Each zone may belong to at most one conflict pair.
        let mut zones = HashSet::new();
        for conflict in &self.zones.conflicts {
            let [a, b] = &conflict.pair;
            if a == b {
                return Err(Error::Validation(format!("zone {} conflicts with itself", a)));
            }
            for zone in [a, b] {
                if !zones.insert(zone.as_str()) {
                    return Err(Error::Validation(format!(
                        "zone {} appears in more than one conflict pair",
                        zone
                    )));
                }
            }
        }

        if self.timeouts.poll_interval_ms == 0 {
            return Err(Error::Validation("poll_interval_ms must be positive".to_string()));
        }
        Ok(())
    }

    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }
}
