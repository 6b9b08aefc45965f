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
//! Module defining record data types to (de-)serialize measured metrics to CSV and JSON.
use serde::{Deserialize, Serialize};

/// Stage of a latency measurement relative to the competition window.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Deserialize,
    Serialize,
    strum::Display,
    strum::EnumIter,
    strum_macros::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Stage {
    Initial,
    Final,
}

impl Stage {
    /// Suffix appended to the flow tag in the section marker of this stage.
    pub fn marker_suffix(&self) -> &'static str {
        match self {
            Self::Initial => "",
            Self::Final => "_Final",
        }
    }
}

/// Role of a flow endpoint.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Deserialize,
    Serialize,
    strum::Display,
    strum_macros::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum FlowRole {
    Client,
    Server,
}

/// One per-interval throughput report of a single flow.
#[derive(Debug, Clone, Copy, PartialEq, Default, Deserialize, Serialize)]
pub struct IntervalMetric {
    /// Start of the interval, in seconds since the flow started.
    pub interval_start: f64,
    /// End of the interval, in seconds since the flow started.
    pub interval_end: f64,
    /// Bitrate in Mbit/s.
    pub bitrate_mbps: f64,
    pub retransmits: u64,
}

/// Session summary of one flow, or the combination of several flows.
#[derive(Debug, Clone, Copy, PartialEq, Default, Deserialize, Serialize)]
pub struct SummaryMetric {
    pub avg_bitrate_mbps: f64,
    pub total_retransmits: u64,
}

/// Average RTT of a flow measured at one stage of the experiment.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct LatencySample {
    pub host: String,
    pub algorithm: String,
    pub stage: Stage,
    pub avg_rtt_ms: f64,
}

/// Timing of a single HTTP request.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct HttpTiming {
    pub host: String,
    pub seq: usize,
    /// Total time in seconds
    pub total_time: f64,
    /// Time until the TCP connection was established, in seconds
    pub connect_time: f64,
    /// Time until the first byte was received, in seconds
    pub transfer_time: f64,
    /// Average download speed in bytes per second
    pub download_speed: f64,
    pub size_bytes: Option<u64>,
    pub http_code: Option<u16>,
}

/// Average of the HTTP timings of one host or of one algorithm class.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct HttpAverage {
    /// Host name, or the algorithm tag for a per-algorithm average.
    pub label: String,
    pub requests: usize,
    pub total_time: f64,
    pub connect_time: f64,
    pub transfer_time: f64,
    /// Download speed in KB/s
    pub download_speed_kbps: f64,
}

/// One sample of the bottleneck queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct QueueSample {
    /// Seconds since the experiment started, with microsecond resolution.
    #[serde(with = "micros")]
    pub timestamp: u64,
    /// Queue depth in packets
    pub depth: u64,
}

impl QueueSample {
    pub fn seconds(&self) -> f64 {
        self.timestamp as f64 / 1e6
    }
}

/// Timestamps are stored as microseconds to keep them totally ordered, but serialized as seconds.
mod micros {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(t: &u64, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(*t as f64 / 1e6)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<u64, D::Error> {
        let t = f64::deserialize(d)?;
        Ok((t * 1e6).round().max(0.0) as u64)
    }
}

/// One point of the RTT trace of the continuous ping train.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct RttPoint {
    /// Seconds since the ping train started.
    pub t: f64,
    pub rtt_ms: f64,
}

/// Outcome of one probe checkpoint.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ProbeSample {
    pub checkpoint: usize,
    /// Offset of the checkpoint, in seconds since the experiment started.
    pub scheduled: f64,
    /// Time when the probe was actually fired.
    pub fired_at: f64,
    /// Measured value (the fetch time in seconds), if the probe succeeded.
    pub value: Option<f64>,
    pub error: Option<String>,
}

/// Outcome of one flow, as written to `flows.csv`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct FlowRecord {
    pub host: String,
    pub algorithm: String,
    pub role: FlowRole,
    pub seq: usize,
    pub kind: String,
    pub status: String,
    pub error: Option<String>,
    /// Seconds since the start of the phase of the flow when the worker returned.
    pub finished_at: Option<f64>,
    pub sink: String,
}
