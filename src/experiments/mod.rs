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
//! Module to run competition experiments on an emulated network.
//!
//! [`Experiment::run`] validates the configuration, creates the run directory, starts the
//! topology, drives the [`scheduler::ExperimentScheduler`], and finally extracts, aggregates, and
//! writes all metrics.

pub mod flows;
pub mod probes;
pub mod sampler;
pub mod scheduler;

pub use flows::*;
pub use probes::*;
pub use sampler::*;
pub use scheduler::*;

use std::{
    fs::{self, File},
    future::Future,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    sync::Arc,
};

use thiserror::Error;
use tokio::sync::watch;

use ccarena_utils::other::get_timestamp;

use crate::{
    aggregate::MetricsAggregator,
    config::{ConfigError, ExperimentConfig},
    emulator::{EmulationSetupError, Emulator, TopologyHandle},
    records::FlowRole,
    report::{ReportSummary, ReportWriter},
    result::ExperimentResult,
    topology::TopologySpec,
};

/// Directory of the flow sinks inside a run directory.
pub const RAW_DIR: &str = "raw";
pub const RAW_REPORT: &str = "raw_report.txt";
pub const QUEUE_LOG: &str = "q.txt";
pub const CONFIG_FILE: &str = "config.json";
/// Directory served by the HTTP server.
pub const WWW_DIR: &str = "www";
pub const TEST_PAGE: &str = "test_page.html";
pub const HTTP_PORT: u16 = 8080;
/// Port of the iperf3 server of the first client. Later clients use the following ports.
pub const IPERF_BASE_PORT: u16 = 5201;
/// Number of padding lines of the test page.
const TEST_PAGE_LINES: usize = 1000;

#[derive(Debug, Error)]
pub enum ExperimentError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("Emulation error: {0}")]
    Emulation(#[from] EmulationSetupError),
    #[error("Cannot set up the probe: {0}")]
    Probe(#[from] FlowExecutionError),
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON Error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Wait until the signal is raised, or until its sender is dropped.
pub(crate) async fn wait_for_signal(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Raise the returned interrupt once `signal` completes. If listening for the signal fails, the
/// interrupt is never raised.
pub fn interrupt_on<F>(signal: F) -> watch::Receiver<bool>
where
    F: Future<Output = std::io::Result<()>> + Send + 'static,
{
    let (interrupt, rx) = watch::channel(false);
    tokio::spawn(async move {
        match signal.await {
            Ok(()) => {
                log::warn!("Interrupted, stopping the experiment");
                interrupt.send_replace(true);
            }
            Err(e) => {
                log::error!("Cannot listen for the interrupt signal: {e}");
                // dropping the sender would count as an interrupt
                std::future::pending::<()>().await;
            }
        }
        drop(interrupt);
    });
    rx
}

/// Summary of a finished run.
#[derive(Debug)]
pub struct RunSummary {
    pub run_dir: PathBuf,
    pub result: ExperimentResult,
    pub report: ReportSummary,
}

/// One experiment, ready to run.
pub struct Experiment {
    config: Arc<ExperimentConfig>,
    emulator: Arc<dyn Emulator>,
    plan: Option<FlowPlan>,
    probe: Option<Arc<dyn ProbeAction>>,
}

impl Experiment {
    /// Validate the configuration. Nothing is allocated if it is invalid.
    pub fn new(config: ExperimentConfig, emulator: Arc<dyn Emulator>) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
            emulator,
            plan: None,
            probe: None,
        })
    }

    /// Replace the standard flow plan.
    pub fn with_plan(mut self, plan: FlowPlan) -> Self {
        self.plan = Some(plan);
        self
    }

    /// Replace the standard probe, which fetches the test page from the first client.
    pub fn with_probe(mut self, probe: Arc<dyn ProbeAction>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn config(&self) -> &ExperimentConfig {
        &self.config
    }

    /// Run the experiment. The topology is stopped on every exit path. Raising `interrupt` ends
    /// the run early; the metrics obtained until then are still written.
    pub async fn run(self, interrupt: watch::Receiver<bool>) -> Result<RunSummary, ExperimentError> {
        let config = self.config;
        let spec = TopologySpec::from_config(&config)?;
        let run_dir = prepare_run_dir(&config.out_dir, &config.name)?;
        log::info!("[experiment] Writing to {}", run_dir.display());

        let www = run_dir.join(WWW_DIR);
        write_test_page(&www)?;
        serde_json::to_writer_pretty(File::create(run_dir.join(CONFIG_FILE))?, &*config)?;

        let started_at = chrono::Local::now();
        let plan = self
            .plan
            .unwrap_or_else(|| FlowPlan::standard(&config, &spec, www));
        let probe = self.probe;
        let client = config
            .hosts
            .first()
            .map(|h| h.name.clone())
            .ok_or(ConfigError::NoHosts)?;

        let outcome = {
            let config = config.clone();
            let run_dir = run_dir.clone();
            TopologyHandle::scoped(self.emulator, spec, move |topo| async move {
                let server = topo.spec().server.name.clone();
                let probe: Arc<dyn ProbeAction> = match probe {
                    Some(probe) => probe,
                    None => Arc::new(WebFetchProbe::new(
                        topo.clone(),
                        client,
                        &server,
                        HTTP_PORT,
                        TEST_PAGE,
                    )?),
                };
                ExperimentScheduler::new(config, topo, run_dir, plan, probe, interrupt)
                    .run()
                    .await
            })
            .await?
        };

        let raw = write_raw_report(&run_dir, &outcome.sinks)?;
        let mut result = ExperimentResult::new(
            &config,
            run_id(&run_dir),
            started_at.format("%Y-%m-%d %H:%M:%S").to_string(),
        );
        result.apply_analysis(MetricsAggregator::new(&config).analyze(&raw));
        result.apply_schedule(outcome);
        log::info!("[experiment] {result}");

        let report = ReportWriter::new(&run_dir).write(&result);
        for (path, e) in &report.failed {
            log::error!("[experiment] Cannot write {}: {e}", path.display());
        }
        Ok(RunSummary {
            run_dir,
            result,
            report,
        })
    }
}

/// Run one experiment with the standard flow plan.
pub async fn run_experiment(
    config: ExperimentConfig,
    emulator: Arc<dyn Emulator>,
    interrupt: watch::Receiver<bool>,
) -> Result<RunSummary, ExperimentError> {
    Experiment::new(config, emulator)?.run(interrupt).await
}

/// Create a fresh run directory `<out_dir>/<name>_<timestamp>`. If it exists already, a suffix
/// `_k` is appended, so concurrent runs never share a directory.
pub fn prepare_run_dir(out_dir: impl AsRef<Path>, name: &str) -> std::io::Result<PathBuf> {
    let out_dir = out_dir.as_ref();
    fs::create_dir_all(out_dir)?;
    let base = format!("{name}_{}", get_timestamp());
    let mut k = 0;
    loop {
        let dir = match k {
            0 => out_dir.join(&base),
            k => out_dir.join(format!("{base}_{k}")),
        };
        match fs::create_dir(&dir) {
            Ok(()) => return Ok(dir),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => k += 1,
            Err(e) => return Err(e),
        }
    }
}

/// Identifier of a run: the name of its directory.
pub fn run_id(run_dir: &Path) -> String {
    run_dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}

/// Write the page served to the HTTP clients.
pub fn write_test_page(www: &Path) -> std::io::Result<PathBuf> {
    fs::create_dir_all(www)?;
    let path = www.join(TEST_PAGE);
    let mut w = BufWriter::new(File::create(&path)?);
    writeln!(w, "<!DOCTYPE html>\n<html>\n<head><title>Test Page</title></head>\n<body>")?;
    for i in 0..TEST_PAGE_LINES {
        writeln!(w, "<p>Line {i}: padding to give the page a realistic transfer size.</p>")?;
    }
    writeln!(w, "</body>\n</html>")?;
    w.flush()?;
    Ok(path)
}

/// Concatenate all sinks in key order into the raw report, and return its content. Sinks that
/// cannot be read are skipped.
pub fn write_raw_report(run_dir: &Path, sinks: &[(SinkKey, PathBuf)]) -> std::io::Result<String> {
    let mut raw = String::new();
    // server output has no section of its own
    for (key, path) in sinks.iter().filter(|(key, _)| key.role != FlowRole::Server) {
        match fs::read_to_string(path) {
            Ok(content) => {
                raw.push_str(&content);
                if !content.is_empty() && !content.ends_with('\n') {
                    raw.push('\n');
                }
            }
            Err(e) => log::warn!("[experiment] Cannot read the sink of {key}: {e}"),
        }
    }
    fs::write(run_dir.join(RAW_REPORT), &raw)?;
    Ok(raw)
}

/// Extract, aggregate, and write the metrics of an existing run directory again.
pub fn reanalyze(run_dir: &Path) -> Result<(ExperimentResult, ReportSummary), ExperimentError> {
    let config: ExperimentConfig =
        serde_json::from_str(&fs::read_to_string(run_dir.join(CONFIG_FILE))?)?;
    let raw = fs::read_to_string(run_dir.join(RAW_REPORT))?;

    // keep what was observed at runtime, and recompute everything derived from the raw output
    let previous = fs::read_to_string(run_dir.join(crate::report::RESULT_FILE))
        .ok()
        .and_then(|s| serde_json::from_str::<ExperimentResult>(&s).ok());
    let mut result = match previous {
        Some(previous) => previous,
        None => {
            let mut result = ExperimentResult::new(&config, run_id(run_dir), String::new());
            result.queue = read_queue_log(run_dir.join(QUEUE_LOG)).unwrap_or_default();
            result
        }
    };
    result.apply_analysis(MetricsAggregator::new(&config).analyze(&raw));
    let report = ReportWriter::new(run_dir).write(&result);
    Ok((result, report))
}
