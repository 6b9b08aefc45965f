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
//! Module to write the artifacts of a run.
//!
//! Every artifact is written independently: a failure is recorded for that artifact only, and
//! the remaining artifacts are still attempted.

use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{records::Stage, result::ExperimentResult};

pub const RESULT_FILE: &str = "result.json";
pub const SUMMARY_FILE: &str = "summary.csv";
pub const LATENCY_FILE: &str = "latency.csv";
pub const HTTP_FILE: &str = "http.csv";
pub const FLOWS_FILE: &str = "flows.csv";
pub const FETCH_TIMES_FILE: &str = "fetch_times.txt";
pub const WARNINGS_FILE: &str = "warnings.txt";

/// Name of the combined throughput series of an algorithm.
pub fn throughput_file(algorithm: &str) -> String {
    ccarena_utils::other::sanitize_file_name(format!("throughput_{algorithm}.csv"))
}

#[derive(Debug, Error)]
pub enum ArtifactWriteError {
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV Error: {0}")]
    Csv(#[from] csv::Error),
    #[error("JSON Error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Artifacts written by [`ReportWriter::write`].
#[derive(Debug, Default)]
pub struct ReportSummary {
    pub written: Vec<PathBuf>,
    pub failed: Vec<(PathBuf, ArtifactWriteError)>,
}

impl ReportSummary {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// One row of `summary.csv`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryRow {
    pub algorithm: String,
    #[serde(
        serialize_with = "ccarena_utils::serde::serialize_list",
        deserialize_with = "ccarena_utils::serde::deserialize_list"
    )]
    pub hosts: Vec<String>,
    pub avg_bitrate_mbps: f64,
    pub total_retransmits: u64,
}

/// One row of `latency.csv`, either of a single host or the mean of an algorithm class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatencyRow {
    /// Host name, or `all` for the mean of the algorithm class.
    pub host: String,
    pub algorithm: String,
    pub initial_rtt_ms: Option<f64>,
    pub final_rtt_ms: Option<f64>,
}

/// Writes the artifacts of a run into its run directory.
pub struct ReportWriter {
    run_dir: PathBuf,
}

impl ReportWriter {
    pub fn new(run_dir: impl Into<PathBuf>) -> Self {
        Self {
            run_dir: run_dir.into(),
        }
    }

    /// Write all artifacts of `result`.
    pub fn write(&self, result: &ExperimentResult) -> ReportSummary {
        let mut summary = ReportSummary::default();
        let mut attempt = |name: &str, f: &dyn Fn(&Path) -> Result<(), ArtifactWriteError>| {
            let path = self.run_dir.join(name);
            match f(&path) {
                Ok(()) => summary.written.push(path),
                Err(e) => {
                    log::error!("[report] Cannot write {}: {e}", path.display());
                    summary.failed.push((path, e));
                }
            }
        };

        for a in &result.algorithms {
            attempt(&throughput_file(&a.algorithm), &|p: &Path| write_csv(p, &a.intervals));
        }
        attempt(SUMMARY_FILE, &|p: &Path| write_csv(p, &summary_rows(result)));
        attempt(LATENCY_FILE, &|p: &Path| write_csv(p, &latency_rows(result)));
        attempt(HTTP_FILE, &|p: &Path| {
            let rows = result
                .http_hosts
                .iter()
                .chain(result.algorithms.iter().filter_map(|a| a.http.as_ref()));
            write_csv(p, rows)
        });
        attempt(FLOWS_FILE, &|p: &Path| write_csv(p, &result.flows));
        attempt(FETCH_TIMES_FILE, &|p: &Path| write_fetch_times(p, &result.fetch_times()));
        attempt(WARNINGS_FILE, &|p: &Path| {
            let mut w = BufWriter::new(File::create(p)?);
            for warning in result.warnings() {
                writeln!(w, "{warning}")?;
            }
            w.flush()?;
            Ok(())
        });
        attempt(RESULT_FILE, &|p: &Path| {
            let mut w = BufWriter::new(File::create(p)?);
            serde_json::to_writer_pretty(&mut w, result)?;
            w.flush()?;
            Ok(())
        });

        log::debug!(
            "[report] Wrote {} artifacts to {}",
            summary.written.len(),
            self.run_dir.display()
        );
        summary
    }
}

fn write_csv<T: Serialize>(
    path: &Path,
    rows: impl IntoIterator<Item = T>,
) -> Result<(), ArtifactWriteError> {
    let mut w = csv::Writer::from_path(path)?;
    for row in rows {
        w.serialize(row)?;
    }
    w.flush()?;
    Ok(())
}

pub fn summary_rows(result: &ExperimentResult) -> Vec<SummaryRow> {
    result
        .algorithms
        .iter()
        .map(|a| SummaryRow {
            algorithm: a.algorithm.clone(),
            hosts: a.hosts.clone(),
            avg_bitrate_mbps: a.summary.avg_bitrate_mbps,
            total_retransmits: a.summary.total_retransmits,
        })
        .collect()
}

pub fn latency_rows(result: &ExperimentResult) -> Vec<LatencyRow> {
    let hosts = result.hosts.iter().map(|h| LatencyRow {
        host: h.host.clone(),
        algorithm: h.algorithm.clone(),
        initial_rtt_ms: h.latency(Stage::Initial),
        final_rtt_ms: h.latency(Stage::Final),
    });
    let classes = result.algorithms.iter().map(|a| LatencyRow {
        host: "all".to_string(),
        algorithm: a.algorithm.clone(),
        initial_rtt_ms: a.latency_initial_ms,
        final_rtt_ms: a.latency_final_ms,
    });
    hosts.chain(classes).collect()
}

/// Write the fetch times with their average and standard deviation, 4 decimals each.
fn write_fetch_times(path: &Path, times: &[f64]) -> Result<(), ArtifactWriteError> {
    let mut w = BufWriter::new(File::create(path)?);
    let stats = ccarena_utils::stats::MeanStd::of(times);
    match stats {
        Some(stats) => {
            writeln!(w, "Average: {:.4}", stats.mean)?;
            writeln!(w, "Std Dev: {:.4}", stats.std_dev)?;
        }
        None => {
            writeln!(w, "Average: n/a")?;
            writeln!(w, "Std Dev: n/a")?;
        }
    }
    for t in times {
        writeln!(w, "{t:.4}")?;
    }
    w.flush()?;
    Ok(())
}

/// Read back the average and standard deviation of a `fetch_times.txt`.
pub fn read_fetch_stats(path: impl AsRef<Path>) -> std::io::Result<Option<(f64, f64)>> {
    let content = fs::read_to_string(path)?;
    let value = |prefix: &str| {
        content
            .lines()
            .find_map(|l| l.strip_prefix(prefix))
            .and_then(|v| v.trim().parse::<f64>().ok())
    };
    Ok(value("Average:").zip(value("Std Dev:")))
}
