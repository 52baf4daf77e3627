use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Top-level configuration for the controller.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Host this controller is responsible for. Control commands targeting
    /// other hosts are skipped.
    #[serde(default)]
    pub hostname: String,

    /// Processor model (PMU name) whose events are selected.
    #[serde(default)]
    pub pmu: String,

    /// Events bound to the fixed counters, always monitored.
    #[serde(default)]
    pub fixed_events: Vec<String>,

    /// Seed for the event pool permutation. Entropy-seeded when unset.
    #[serde(default)]
    pub seed: Option<u64>,

    /// Event catalog configuration.
    #[serde(default)]
    pub catalog: CatalogConfig,

    /// Control command source configuration.
    #[serde(default)]
    pub control: ControlConfig,

    /// Sampling sensor invocation configuration.
    #[serde(default)]
    pub sensor: SensorConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// Event catalog configuration.
#[derive(Debug, Default, Deserialize)]
pub struct CatalogConfig {
    /// Path to the YAML event catalog.
    #[serde(default)]
    pub path: PathBuf,
}

/// Where control commands come from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlSource {
    /// JSON commands POSTed to the control HTTP endpoint.
    #[default]
    Http,
    /// Newline-delimited JSON commands on standard input.
    Stdin,
}

/// Control command source configuration.
#[derive(Debug, Deserialize)]
pub struct ControlConfig {
    /// Command source. Default: http.
    #[serde(default)]
    pub source: ControlSource,

    /// Listen address for the HTTP source. Default: ":8080".
    #[serde(default = "default_control_addr")]
    pub addr: String,

    /// Commands buffered between the HTTP endpoint and the controller. Default: 64.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

/// Sampling sensor invocation configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SensorConfig {
    /// Sensor executable. Default: "hwpc-sensor".
    #[serde(default = "default_sensor_program")]
    pub program: String,

    /// Arguments passed before the event list.
    #[serde(default)]
    pub args: Vec<String>,

    /// Flag preceding each event name. Default: "-e".
    #[serde(default = "default_event_flag")]
    pub event_flag: String,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Deserialize)]
pub struct HealthConfig {
    /// Serve metrics. Default: true.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_control_addr() -> String {
    ":8080".to_string()
}

fn default_queue_capacity() -> usize {
    64
}

fn default_sensor_program() -> String {
    "hwpc-sensor".to_string()
}

fn default_event_flag() -> String {
    "-e".to_string()
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            hostname: String::new(),
            pmu: String::new(),
            fixed_events: Vec::new(),
            seed: None,
            catalog: CatalogConfig::default(),
            control: ControlConfig::default(),
            sensor: SensorConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            source: ControlSource::default(),
            addr: default_control_addr(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            program: default_sensor_program(),
            args: Vec::new(),
            event_flag: default_event_flag(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            addr: default_health_addr(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    ///
    /// Called after command-line overrides are applied, so `hostname` and
    /// `pmu` may come from either source.
    pub fn validate(&self) -> Result<()> {
        if self.hostname.is_empty() {
            bail!("hostname is required");
        }

        if self.pmu.is_empty() {
            bail!("pmu is required");
        }

        if self.catalog.path.as_os_str().is_empty() {
            bail!("catalog.path is required");
        }

        if self.sensor.program.is_empty() {
            bail!("sensor.program is required");
        }

        if self.sensor.event_flag.is_empty() {
            bail!("sensor.event_flag must not be empty");
        }

        if self.control.queue_capacity == 0 {
            bail!("control.queue_capacity must be positive");
        }

        let mut seen = HashSet::with_capacity(self.fixed_events.len());
        for event in &self.fixed_events {
            if event.is_empty() {
                bail!("fixed_events must not contain empty names");
            }
            if !seen.insert(event.as_str()) {
                bail!("fixed_events contains duplicate event {event:?}");
            }
        }

        Ok(())
    }
}

/// Turn a ":port" shorthand into a bindable address.
pub fn bind_addr(addr: &str, fallback: &str) -> String {
    let addr = if addr.is_empty() { fallback } else { addr };

    if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    }
}
