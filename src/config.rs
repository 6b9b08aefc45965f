// CCARENA: Orchestration and Metrics for Competing TCP Congestion-Control Experiments
// Copyright (C) 2024-2025 Roland Schmid <roschmi@ethz.ch> and Tibor Schneider <sctibor@ethz.ch>
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.
//! Immutable configuration of a single experiment run.

use std::{collections::HashSet, fs, path::Path, path::PathBuf, time::Duration};

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::records::Stage;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO Error while reading the configuration: {0}")]
    Io(#[from] std::io::Error),
    #[error("Cannot parse the configuration: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Bandwidth `{0}` must be positive, got {1} Mbit/s")]
    InvalidBandwidth(&'static str, f64),
    #[error("Delay `{0}` must not be negative, got {1} ms")]
    InvalidDelay(&'static str, f64),
    #[error("Loss `{0}` must be within [0, 100], got {1}%")]
    InvalidLoss(&'static str, f64),
    #[error("The maximum queue size must be at least one packet")]
    EmptyQueue,
    #[error("The experiment duration must be positive")]
    EmptyDuration,
    #[error("`{0}` must be positive")]
    ZeroInterval(&'static str),
    #[error("At least one client host is required")]
    NoHosts,
    #[error("Invalid host name {0:?}: use up to 10 letters, digits, or underscores")]
    InvalidHostName(String),
    #[error("Host name {0:?} ends with a reserved stage suffix")]
    ReservedHostName(String),
    #[error("Host name {0:?} is used more than once")]
    DuplicateHost(String),
    #[error("Host {0:?} has no congestion-control algorithm")]
    MissingAlgorithm(String),
    #[error("Invalid probe schedule: {0}")]
    InvalidSchedule(String),
    #[error("The topology does not fit into the subnet: {0}")]
    Subnet(String),
}

lazy_static! {
    // interface names are `<host>-eth0` and must fit into IFNAMSIZ
    static ref HOST_NAME: Regex = Regex::new(r"^[A-Za-z][A-Za-z0-9_]{0,9}$").unwrap();
}

/// A client host and the congestion-control algorithm its flows use.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct HostSpec {
    pub name: String,
    pub algorithm: String,
}

impl HostSpec {
    pub fn new(name: impl Into<String>, algorithm: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            algorithm: algorithm.into(),
        }
    }
}

/// Shortest cadence between two probe checkpoints.
pub const MIN_CADENCE: Duration = Duration::from_millis(1);

/// When the scheduler fires its probe actions.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeSchedule {
    /// Fractions of the total duration, each in `[0, 1)` and strictly increasing.
    Fractions(Vec<f64>),
    /// Fixed cadence in seconds, starting at offset 0.
    Cadence(f64),
}

impl Default for ProbeSchedule {
    fn default() -> Self {
        Self::Fractions(vec![0.3, 0.5, 0.7])
    }
}

impl ProbeSchedule {
    /// Compute the checkpoints as elapsed-time offsets inside `[0, duration)`.
    pub fn checkpoints(&self, duration: Duration) -> Vec<Duration> {
        match self {
            Self::Fractions(fractions) => fractions
                .iter()
                .map(|f| duration.mul_f64(*f))
                .filter(|t| *t < duration)
                .collect(),
            Self::Cadence(secs) => match Duration::try_from_secs_f64(*secs) {
                Ok(step) if step >= MIN_CADENCE => (0u32..)
                    .map_while(|k| step.checked_mul(k))
                    .take_while(|t| *t < duration)
                    .collect(),
                _ => Vec::new(),
            },
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        match self {
            Self::Fractions(fractions) => {
                if let Some(f) = fractions.iter().find(|f| !(0.0..1.0).contains(*f)) {
                    return Err(ConfigError::InvalidSchedule(format!(
                        "fraction {f} is outside of [0, 1)"
                    )));
                }
                if fractions.windows(2).any(|w| w[0] >= w[1]) {
                    return Err(ConfigError::InvalidSchedule(
                        "fractions must be strictly increasing".to_string(),
                    ));
                }
                Ok(())
            }
            Self::Cadence(secs) => match Duration::try_from_secs_f64(*secs) {
                Ok(step) if step >= MIN_CADENCE => Ok(()),
                _ => Err(ConfigError::InvalidSchedule(format!(
                    "cadence must be a finite number of seconds of at least {}ms, got {secs}",
                    MIN_CADENCE.as_millis()
                ))),
            },
        }
    }
}

/// Configuration of one experiment.
///
/// The configuration is built once (from CLI flags or a JSON file), validated, and then passed
/// to every component at construction. It is never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ExperimentConfig {
    /// Scenario identifier, used to name the run directory.
    #[serde(default = "default_name")]
    pub name: String,
    /// Bandwidth of the host links in Mbit/s.
    #[serde(default = "default_bw_host")]
    pub bw_host: f64,
    /// Bandwidth of the bottleneck link in Mbit/s.
    pub bw_net: f64,
    /// One-way delay of the bottleneck link in ms.
    pub delay_ms: f64,
    /// One-way delay of the host links in ms. Defaults to `delay_ms`.
    #[serde(default)]
    pub host_delay_ms: Option<f64>,
    /// Loss rate of the host links in percent.
    #[serde(default)]
    pub loss_pct: f64,
    /// Loss rate of the bottleneck link in percent.
    #[serde(default)]
    pub bottleneck_loss_pct: f64,
    /// Maximum queue size of the bottleneck in packets.
    #[serde(default = "default_max_queue")]
    pub max_queue: u32,
    /// Length of the competition window in seconds.
    #[serde(default = "default_duration")]
    pub duration: f64,
    #[serde(default = "default_hosts")]
    pub hosts: Vec<HostSpec>,
    #[serde(default = "default_server_name")]
    pub server_name: String,
    #[serde(default)]
    pub probe_schedule: ProbeSchedule,
    #[serde(default = "default_100")]
    pub sample_interval_ms: u64,
    #[serde(default = "default_100")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,
    /// Number of HTTP requests per client during the competition window.
    #[serde(default = "default_http_fetches")]
    pub http_fetches: usize,
    #[serde(default = "default_http_fetch_gap_ms")]
    pub http_fetch_gap_ms: u64,
    /// Number of pings for the initial and final latency measurement.
    #[serde(default = "default_ping_count")]
    pub ping_count: usize,
    #[serde(default = "default_100")]
    pub ping_train_interval_ms: u64,
    #[serde(default = "default_out_dir")]
    pub out_dir: PathBuf,
}

fn default_name() -> String {
    "competition".to_string()
}

const fn default_bw_host() -> f64 {
    1000.0
}

const fn default_max_queue() -> u32 {
    100
}

const fn default_duration() -> f64 {
    10.0
}

fn default_hosts() -> Vec<HostSpec> {
    vec![HostSpec::new("h1", "reno"), HostSpec::new("h2", "bbr")]
}

fn default_server_name() -> String {
    "srv".to_string()
}

const fn default_100() -> u64 {
    100
}

const fn default_grace_period_ms() -> u64 {
    2_000
}

const fn default_http_fetches() -> usize {
    3
}

const fn default_http_fetch_gap_ms() -> u64 {
    1_000
}

const fn default_ping_count() -> usize {
    10
}

fn default_out_dir() -> PathBuf {
    PathBuf::from("./data/")
}

impl ExperimentConfig {
    /// Create a configuration for the given bottleneck, with all other values at their default.
    pub fn new(bw_net: f64, delay_ms: f64) -> Self {
        Self {
            name: default_name(),
            bw_host: default_bw_host(),
            bw_net,
            delay_ms,
            host_delay_ms: None,
            loss_pct: 0.0,
            bottleneck_loss_pct: 0.0,
            max_queue: default_max_queue(),
            duration: default_duration(),
            hosts: default_hosts(),
            server_name: default_server_name(),
            probe_schedule: ProbeSchedule::default(),
            sample_interval_ms: default_100(),
            poll_interval_ms: default_100(),
            grace_period_ms: default_grace_period_ms(),
            http_fetches: default_http_fetches(),
            http_fetch_gap_ms: default_http_fetch_gap_ms(),
            ping_count: default_ping_count(),
            ping_train_interval_ms: default_100(),
            out_dir: default_out_dir(),
        }
    }

    /// Read a configuration from a JSON file and validate it.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        Ok(config)
    }

    /// Check all values. Must be called before any resource is allocated.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, bw) in [("bw_host", self.bw_host), ("bw_net", self.bw_net)] {
            if !(bw > 0.0 && bw.is_finite()) {
                return Err(ConfigError::InvalidBandwidth(name, bw));
            }
        }
        for (name, delay) in [("delay_ms", self.delay_ms), ("host_delay_ms", self.host_delay())] {
            if !(delay >= 0.0 && delay.is_finite()) {
                return Err(ConfigError::InvalidDelay(name, delay));
            }
        }
        for (name, loss) in [
            ("loss_pct", self.loss_pct),
            ("bottleneck_loss_pct", self.bottleneck_loss_pct),
        ] {
            if !(0.0..=100.0).contains(&loss) {
                return Err(ConfigError::InvalidLoss(name, loss));
            }
        }
        if self.max_queue == 0 {
            return Err(ConfigError::EmptyQueue);
        }
        if !(self.duration > 0.0 && Duration::try_from_secs_f64(self.duration).is_ok()) {
            return Err(ConfigError::EmptyDuration);
        }
        for (name, value) in [
            ("sample_interval_ms", self.sample_interval_ms),
            ("poll_interval_ms", self.poll_interval_ms),
            ("ping_train_interval_ms", self.ping_train_interval_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::ZeroInterval(name));
            }
        }

        if self.hosts.is_empty() {
            return Err(ConfigError::NoHosts);
        }
        if !HOST_NAME.is_match(&self.server_name) {
            return Err(ConfigError::InvalidHostName(self.server_name.clone()));
        }
        let mut seen = HashSet::from([self.server_name.as_str()]);
        for host in &self.hosts {
            if !HOST_NAME.is_match(&host.name) {
                return Err(ConfigError::InvalidHostName(host.name.clone()));
            }
            if host.name.ends_with(Stage::Final.marker_suffix()) {
                return Err(ConfigError::ReservedHostName(host.name.clone()));
            }
            if !seen.insert(host.name.as_str()) {
                return Err(ConfigError::DuplicateHost(host.name.clone()));
            }
            if host.algorithm.trim().is_empty() {
                return Err(ConfigError::MissingAlgorithm(host.name.clone()));
            }
        }

        self.probe_schedule.validate()
    }

    pub fn host_delay(&self) -> f64 {
        self.host_delay_ms.unwrap_or(self.delay_ms)
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.duration)
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn http_fetch_gap(&self) -> Duration {
        Duration::from_millis(self.http_fetch_gap_ms)
    }

    pub fn ping_train_interval(&self) -> Duration {
        Duration::from_millis(self.ping_train_interval_ms)
    }

    /// Probe checkpoints of this run.
    pub fn checkpoints(&self) -> Vec<Duration> {
        self.probe_schedule.checkpoints(self.duration())
    }

    /// All algorithm tags, in order of their first appearance.
    pub fn algorithms(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.hosts
            .iter()
            .map(|h| h.algorithm.as_str())
            .filter(|a| seen.insert(*a))
            .collect()
    }
}
