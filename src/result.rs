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
//! The aggregate root of one run.

use std::fmt::Display;

use serde::{Deserialize, Serialize};

use ccarena_utils::stats::MeanStd;

use crate::{
    aggregate::{AlgorithmMetrics, Analysis, HostMetrics},
    config::ExperimentConfig,
    experiments::ScheduleOutcome,
    records::{FlowRecord, HttpAverage, ProbeSample, QueueSample, RttPoint},
};

/// All metrics of one run. Built once after the scheduler has completed, and only read
/// afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentResult {
    pub name: String,
    pub run_id: String,
    pub started_at: String,
    pub config: ExperimentConfig,
    pub hosts: Vec<HostMetrics>,
    /// Combined metrics per algorithm class, in order of first appearance in the configuration.
    pub algorithms: Vec<AlgorithmMetrics>,
    pub http_hosts: Vec<HttpAverage>,
    pub queue: Vec<QueueSample>,
    pub probes: Vec<ProbeSample>,
    /// Mean and standard deviation of the successful probe fetch times.
    pub fetch_stats: Option<MeanStd>,
    pub ping_trace: Vec<RttPoint>,
    pub flows: Vec<FlowRecord>,
    /// Problems found while extracting metrics from the raw output.
    pub extraction_warnings: Vec<String>,
    /// Problems observed while running the experiment.
    pub run_warnings: Vec<String>,
    pub interrupted: bool,
}

impl ExperimentResult {
    pub fn new(config: &ExperimentConfig, run_id: impl Into<String>, started_at: String) -> Self {
        Self {
            name: config.name.clone(),
            run_id: run_id.into(),
            started_at,
            config: config.clone(),
            hosts: Vec::new(),
            algorithms: Vec::new(),
            http_hosts: Vec::new(),
            queue: Vec::new(),
            probes: Vec::new(),
            fetch_stats: None,
            ping_trace: Vec::new(),
            flows: Vec::new(),
            extraction_warnings: Vec::new(),
            run_warnings: Vec::new(),
            interrupted: false,
        }
    }

    /// Replace everything derived from the raw output.
    pub fn apply_analysis(&mut self, analysis: Analysis) {
        self.hosts = analysis.hosts;
        self.algorithms = analysis.algorithms;
        self.http_hosts = analysis.http_hosts;
        self.ping_trace = analysis.ping_trace;
        self.extraction_warnings = analysis.warnings.iter().map(|w| w.to_string()).collect();
    }

    /// Take over what the scheduler observed at runtime.
    pub fn apply_schedule(&mut self, outcome: ScheduleOutcome) {
        let mut warnings = Vec::new();
        if outcome.interrupted {
            warnings.push("The experiment was interrupted".to_string());
        }
        if outcome.sampler_killed {
            warnings.push("The queue sampler did not stop and was killed".to_string());
        }
        if let Some(e) = &outcome.sampler_error {
            warnings.push(format!("The queue sampler failed: {e}"));
        }
        for flow in &outcome.flows {
            match (&flow.error, flow.status.as_str()) {
                (Some(e), _) => warnings.push(format!(
                    "Flow {} of {} ({}) failed: {e}",
                    flow.kind, flow.host, flow.algorithm
                )),
                (None, "killed") => warnings.push(format!(
                    "Flow {} of {} ({}) was killed",
                    flow.kind, flow.host, flow.algorithm
                )),
                _ => {}
            }
        }
        for probe in &outcome.probes {
            if let Some(e) = &probe.error {
                warnings.push(format!("Probe {} failed: {e}", probe.checkpoint));
            }
        }

        let fetch_times: Vec<f64> = outcome.probes.iter().filter_map(|p| p.value).collect();
        self.fetch_stats = MeanStd::of(&fetch_times);
        self.queue = outcome.queue;
        self.probes = outcome.probes;
        self.flows = outcome.flows;
        self.interrupted = outcome.interrupted;
        self.run_warnings = warnings;
    }

    pub fn algorithm(&self, tag: &str) -> Option<&AlgorithmMetrics> {
        self.algorithms.iter().find(|a| a.algorithm == tag)
    }

    /// Successful probe fetch times, in checkpoint order.
    pub fn fetch_times(&self) -> Vec<f64> {
        self.probes.iter().filter_map(|p| p.value).collect()
    }

    pub fn warnings(&self) -> impl Iterator<Item = &String> {
        self.run_warnings.iter().chain(self.extraction_warnings.iter())
    }
}

impl Display for ExperimentResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Run {}: {} queue samples, {} probes, {} warnings",
            self.run_id,
            self.queue.len(),
            self.probes.len(),
            self.run_warnings.len() + self.extraction_warnings.len()
        )?;
        for a in &self.algorithms {
            write!(
                f,
                "\n  {:>8}: {:8.3} Mbit/s, {:6} retransmits",
                a.algorithm, a.summary.avg_bitrate_mbps, a.summary.total_retransmits
            )?;
            if let (Some(initial), Some(fin)) = (a.latency_initial_ms, a.latency_final_ms) {
                write!(f, ", RTT {initial:.3} ms -> {fin:.3} ms")?;
            }
        }
        if let Some(stats) = &self.fetch_stats {
            write!(
                f,
                "\n  fetch time: {:.4}s +- {:.4}s",
                stats.mean, stats.std_dev
            )?;
        }
        Ok(())
    }
}
