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
use std::{
    fs,
    path::{Path, PathBuf},
};

use clap::{Parser, ValueEnum};
use itertools::Itertools;
use plotly::{
    common::{Mode, Title},
    layout::{Axis, BarMode},
    Bar, Layout, Plot, Scatter,
};
use serde::Serialize;
use strum::IntoEnumIterator;

use ccarena::{
    records::Stage,
    report::RESULT_FILE,
    result::ExperimentResult,
    util::{self, PathBufExt},
};

#[derive(Parser, Debug)]
#[command(about, long_about = None)]
struct Args {
    /// Overwrite the input path for data.
    #[arg(short, long, default_value = "./data/")]
    data_path: PathBuf,
    /// Only plot runs whose directory name contains this string.
    #[arg(short, long, default_value = "")]
    filter: String,
    /// Overwrite the output path for plots.
    #[arg(short, long, default_value = "./plots/")]
    output_path: PathBuf,
    /// Type of plot to generate.
    #[arg(short, long, value_enum, default_value_t = PlotKind::All)]
    plot_type: PlotKind,
}

#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Serialize, strum::EnumIter)]
#[serde(rename_all = "kebab-case")]
enum PlotKind {
    /// Generates all of the plots below.
    #[default]
    All,
    /// Combined throughput of every algorithm over time.
    Throughput,
    /// Retransmissions of every algorithm per interval.
    Retransmits,
    /// Average bitrate and total retransmissions per algorithm.
    Summary,
    /// Average RTT before and after the competition, per algorithm.
    Latency,
    /// Average HTTP timings per algorithm.
    Http,
    /// Bottleneck queue length over time.
    Queue,
    /// RTT trace of the continuous ping train.
    PingTrace,
}

impl PlotKind {
    fn file_name(&self) -> &'static str {
        match self {
            Self::All => "all_{}.html",
            Self::Throughput => "throughput_{}.html",
            Self::Retransmits => "retransmits_{}.html",
            Self::Summary => "summary_{}.html",
            Self::Latency => "latency_{}.html",
            Self::Http => "http_{}.html",
            Self::Queue => "queue_{}.html",
            Self::PingTrace => "ping_trace_{}.html",
        }
    }
}

fn layout(title: &str, x: &str, y: &str) -> Layout {
    Layout::new()
        .title(Title::with_text(title))
        .x_axis(Axis::new().title(Title::with_text(x)))
        .y_axis(Axis::new().title(Title::with_text(y)))
}

/// Build one plot of a run, or `None` if the run holds no data for it.
fn build_plot(kind: PlotKind, result: &ExperimentResult) -> Option<Plot> {
    let mut plot = Plot::new();
    match kind {
        PlotKind::All => return None,
        PlotKind::Throughput | PlotKind::Retransmits => {
            let series = result
                .algorithms
                .iter()
                .filter(|a| !a.intervals.is_empty())
                .collect_vec();
            if series.is_empty() {
                return None;
            }
            for a in series {
                let x = a.intervals.iter().map(|i| i.interval_end).collect_vec();
                let y = match kind {
                    PlotKind::Throughput => a.intervals.iter().map(|i| i.bitrate_mbps).collect_vec(),
                    _ => a.intervals.iter().map(|i| i.retransmits as f64).collect_vec(),
                };
                plot.add_trace(Scatter::new(x, y).name(&a.algorithm).mode(Mode::LinesMarkers));
            }
            plot.set_layout(match kind {
                PlotKind::Throughput => layout("Throughput", "Time (s)", "Bitrate (Mbit/s)"),
                _ => layout("Retransmissions", "Time (s)", "Retransmits per interval"),
            });
        }
        PlotKind::Summary => {
            if result.algorithms.is_empty() {
                return None;
            }
            let names = result.algorithms.iter().map(|a| a.algorithm.clone()).collect_vec();
            let bitrate = result
                .algorithms
                .iter()
                .map(|a| a.summary.avg_bitrate_mbps)
                .collect_vec();
            let retransmits = result
                .algorithms
                .iter()
                .map(|a| a.summary.total_retransmits as f64)
                .collect_vec();
            plot.add_trace(Bar::new(names.clone(), bitrate).name("Avg. bitrate (Mbit/s)"));
            plot.add_trace(Bar::new(names, retransmits).name("Total retransmits"));
            plot.set_layout(layout("Summary", "Algorithm", "").bar_mode(BarMode::Group));
        }
        PlotKind::Latency => {
            let names = result.algorithms.iter().map(|a| a.algorithm.clone()).collect_vec();
            let mut any = false;
            for stage in Stage::iter() {
                let (x, y): (Vec<String>, Vec<f64>) = result
                    .algorithms
                    .iter()
                    .zip(&names)
                    .filter_map(|(a, name)| {
                        let value = match stage {
                            Stage::Initial => a.latency_initial_ms,
                            Stage::Final => a.latency_final_ms,
                        };
                        value.map(|v| (name.clone(), v))
                    })
                    .unzip();
                any |= !x.is_empty();
                plot.add_trace(Bar::new(x, y).name(&stage.to_string()));
            }
            if !any {
                return None;
            }
            plot.set_layout(layout("Latency", "Algorithm", "Avg. RTT (ms)").bar_mode(BarMode::Group));
        }
        PlotKind::Http => {
            let http = result.algorithms.iter().filter_map(|a| a.http.as_ref()).collect_vec();
            if http.is_empty() {
                return None;
            }
            let names = http.iter().map(|h| h.label.clone()).collect_vec();
            for (name, values) in [
                ("Total time", http.iter().map(|h| h.total_time).collect_vec()),
                ("Connect time", http.iter().map(|h| h.connect_time).collect_vec()),
                ("Transfer time", http.iter().map(|h| h.transfer_time).collect_vec()),
            ] {
                plot.add_trace(Bar::new(names.clone(), values).name(name));
            }
            plot.set_layout(layout("HTTP timing", "Algorithm", "Time (s)").bar_mode(BarMode::Group));
        }
        PlotKind::Queue => {
            if result.queue.is_empty() {
                return None;
            }
            let x = result.queue.iter().map(|s| s.seconds()).collect_vec();
            let y = result.queue.iter().map(|s| s.depth).collect_vec();
            plot.add_trace(Scatter::new(x, y).name("queue").mode(Mode::Lines));
            plot.set_layout(layout("Bottleneck queue", "Time (s)", "Queue length (packets)"));
        }
        PlotKind::PingTrace => {
            if result.ping_trace.is_empty() {
                return None;
            }
            let x = result.ping_trace.iter().map(|p| p.t).collect_vec();
            let y = result.ping_trace.iter().map(|p| p.rtt_ms).collect_vec();
            plot.add_trace(Scatter::new(x, y).name("RTT").mode(Mode::Lines));
            plot.set_layout(layout("RTT of the ping train", "Time (s)", "RTT (ms)"));
        }
    }
    Some(plot)
}

/// Write the requested plots of one run, returning the written files.
fn plot_run(kind: PlotKind, run_dir: &Path, plot_dir: &Path) -> Vec<PathBuf> {
    let result: ExperimentResult = match fs::read_to_string(run_dir.then(RESULT_FILE))
        .map_err(|e| e.to_string())
        .and_then(|s| serde_json::from_str(&s).map_err(|e| e.to_string()))
    {
        Ok(result) => result,
        Err(e) => {
            log::warn!("Skipping {}: cannot load {RESULT_FILE}: {e}", run_dir.display());
            return Vec::new();
        }
    };

    let kinds = match kind {
        PlotKind::All => PlotKind::iter().filter(|k| *k != PlotKind::All).collect_vec(),
        kind => vec![kind],
    };
    kinds
        .into_iter()
        .filter_map(|kind| {
            let Some(plot) = build_plot(kind, &result) else {
                log::debug!("No data for {kind:?} in {}", result.run_id);
                return None;
            };
            let output = plot_dir.then_ts(kind.file_name(), &result.run_id);
            log::debug!("Plotting {output:?}");
            plot.write_html(&output);
            Some(output)
        })
        .collect()
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    util::init_logging();
    let args = Args::parse();
    fs::create_dir_all(&args.output_path)?;

    for run_dir in util::run_dirs(&args.data_path, &args.filter) {
        let written = plot_run(args.plot_type, &run_dir, &args.output_path);
        log::info!("Wrote {} plots of {}", written.len(), run_dir.display());
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use ccarena::{
        aggregate::AlgorithmMetrics,
        config::ExperimentConfig,
        records::{IntervalMetric, QueueSample, SummaryMetric},
    };

    fn result() -> ExperimentResult {
        let mut result = ExperimentResult::new(&ExperimentConfig::new(10.0, 10.0), "run", String::new());
        result.algorithms = vec![AlgorithmMetrics {
            algorithm: "reno".to_string(),
            hosts: vec!["h1".to_string()],
            intervals: vec![IntervalMetric {
                interval_start: 0.0,
                interval_end: 1.0,
                bitrate_mbps: 9.5,
                retransmits: 2,
            }],
            summary: SummaryMetric {
                avg_bitrate_mbps: 9.5,
                total_retransmits: 2,
            },
            latency: Vec::new(),
            latency_initial_ms: Some(20.0),
            latency_final_ms: Some(45.0),
            http: None,
        }];
        result.queue = vec![QueueSample {
            timestamp: 100_000,
            depth: 12,
        }];
        result
    }

    #[test]
    fn skips_plots_without_data() {
        let result = result();
        assert!(build_plot(PlotKind::Throughput, &result).is_some());
        assert!(build_plot(PlotKind::Latency, &result).is_some());
        assert!(build_plot(PlotKind::Queue, &result).is_some());
        assert!(build_plot(PlotKind::Http, &result).is_none());
        assert!(build_plot(PlotKind::PingTrace, &result).is_none());
    }

    #[test]
    fn plots_a_run() {
        let data = tempfile::tempdir().unwrap();
        let plots = tempfile::tempdir().unwrap();
        fs::write(
            data.path().then(RESULT_FILE),
            serde_json::to_string(&result()).unwrap(),
        )
        .unwrap();

        let written = plot_run(PlotKind::All, data.path(), plots.path());
        assert_eq!(written.len(), 5);
        assert!(plots.path().then("throughput_run.html").exists());
        assert!(plots.path().then("queue_run.html").exists());
        assert!(!plots.path().then("http_run.html").exists());
    }
}
