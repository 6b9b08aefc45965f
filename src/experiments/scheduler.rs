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
//! The control timeline of one experiment.
//!
//! A run consists of three phases. The initial latency phase measures the idle RTT of every
//! client. The competition window starts the queue sampler and all competing flows at once,
//! fires the probe checkpoints, and ends after the configured duration, no matter whether the
//! flows or probes are done. The final latency phase measures the RTT again. Afterwards, the
//! topology is stopped.

use std::{collections::BTreeMap, path::PathBuf, sync::Arc, time::Duration};

use tokio::{sync::watch, task::JoinSet, time::Instant};

use super::{
    flows::{ConcurrentFlowRunner, Flow, FlowKind, SinkKey},
    probes::ProbeAction,
    sampler::QueueSampler,
    wait_for_signal, ExperimentError, HTTP_PORT, IPERF_BASE_PORT, QUEUE_LOG, RAW_DIR, TEST_PAGE,
};
use crate::{
    config::ExperimentConfig,
    emulator::TopologyHandle,
    records::{FlowRecord, FlowRole, ProbeSample, QueueSample, Stage},
    topology::TopologySpec,
};

/// Time given to the servers to bind their ports when no initial phase precedes the competition.
const SERVER_WARMUP: Duration = Duration::from_millis(500);

/// Algorithm tag of flows that do not belong to any algorithm class.
const AUX_TAG: &str = "aux";

/// All flows of one experiment, grouped by the phase in which they are launched.
#[derive(Debug, Clone, Default)]
pub struct FlowPlan {
    /// Persistent servers, launched before the first phase and stopped at the end of the
    /// competition window.
    pub servers: Vec<Flow>,
    /// Latency measurement before the competition.
    pub initial: Vec<Flow>,
    /// Competing flows, all launched at offset zero of the competition window.
    pub competition: Vec<Flow>,
    /// Latency measurement after the competition.
    pub closing: Vec<Flow>,
}

impl FlowPlan {
    /// The standard plan: one iperf3 server per client, an HTTP server, one iperf3 client and a
    /// series of HTTP requests per client, a ping train from the first client, and latency
    /// measurements before and after the competition.
    pub fn standard(config: &ExperimentConfig, spec: &TopologySpec, www_root: PathBuf) -> Self {
        let server = spec.server.name.clone();
        let flow = |host: &str, role, algorithm: &str, kind| Flow {
            host: host.to_string(),
            role,
            algorithm: algorithm.to_string(),
            start_offset: Duration::ZERO,
            duration: config.duration(),
            kind,
        };
        let latency = |stage| {
            config
                .hosts
                .iter()
                .filter(|_| config.ping_count > 0)
                .map(|h| {
                    let kind = FlowKind::Ping {
                        target: server.clone(),
                        count: config.ping_count,
                        stage,
                    };
                    flow(&h.name, FlowRole::Client, &h.algorithm, kind)
                })
                .collect::<Vec<_>>()
        };

        let mut plan = FlowPlan {
            initial: latency(Stage::Initial),
            closing: latency(Stage::Final),
            ..Default::default()
        };

        for (i, host) in config.hosts.iter().enumerate() {
            let port = IPERF_BASE_PORT + i as u16;
            plan.servers.push(flow(
                &server,
                FlowRole::Server,
                &host.algorithm,
                FlowKind::IperfServer { port },
            ));
            plan.competition.push(flow(
                &host.name,
                FlowRole::Client,
                &host.algorithm,
                FlowKind::IperfClient {
                    server: server.clone(),
                    port,
                },
            ));
            if config.http_fetches > 0 {
                plan.competition.push(flow(
                    &host.name,
                    FlowRole::Client,
                    &host.algorithm,
                    FlowKind::HttpFetch {
                        server: server.clone(),
                        port: HTTP_PORT,
                        path: TEST_PAGE.to_string(),
                        count: config.http_fetches,
                        gap: config.http_fetch_gap(),
                    },
                ));
            }
        }
        plan.servers.push(flow(
            &server,
            FlowRole::Server,
            AUX_TAG,
            FlowKind::HttpServer {
                port: HTTP_PORT,
                root: www_root,
            },
        ));
        if let Some(first) = config.hosts.first() {
            plan.competition.push(flow(
                &first.name,
                FlowRole::Client,
                &first.algorithm,
                FlowKind::PingTrain {
                    target: server,
                    interval: config.ping_train_interval(),
                },
            ));
        }
        plan
    }
}

/// Timing of the probe checkpoints within the competition window.
#[derive(Debug, Clone, PartialEq)]
pub struct Timeline {
    pub checkpoints: Vec<Duration>,
    pub duration: Duration,
    pub poll_interval: Duration,
    pub grace_period: Duration,
}

/// Result of driving a [`Timeline`].
#[derive(Debug, Clone, Default)]
pub struct TimelineOutcome {
    /// One sample per fired checkpoint, ordered by checkpoint.
    pub probes: Vec<ProbeSample>,
    pub interrupted: bool,
}

impl Timeline {
    pub fn from_config(config: &ExperimentConfig) -> Self {
        Self {
            checkpoints: config.checkpoints(),
            duration: config.duration(),
            poll_interval: config.poll_interval(),
            grace_period: config.grace_period(),
        }
    }

    /// Drive the timeline starting at `start`, and wait at most the grace period for probes
    /// still running when the window closes.
    pub async fn run(
        &self,
        start: Instant,
        probe: Arc<dyn ProbeAction>,
        interrupt: &mut watch::Receiver<bool>,
    ) -> TimelineOutcome {
        self.run_window(start, probe, interrupt).await.drain().await
    }

    /// Drive the timeline starting at `start` until `duration` has elapsed (or on interrupt).
    /// Checkpoints fire by elapsed time, each at most once, and probes run concurrently to the
    /// timeline. Probes still running are returned in the [`ClosedWindow`].
    pub async fn run_window(
        &self,
        start: Instant,
        probe: Arc<dyn ProbeAction>,
        interrupt: &mut watch::Receiver<bool>,
    ) -> ClosedWindow {
        let end = start + self.duration;
        let mut window = ClosedWindow {
            tasks: JoinSet::new(),
            pending: BTreeMap::new(),
            samples: Vec::new(),
            interrupted: false,
            grace_period: self.grace_period,
        };
        let mut next = 0;

        loop {
            let now = Instant::now();
            let elapsed = now.duration_since(start);
            while next < self.checkpoints.len() && elapsed >= self.checkpoints[next] {
                let checkpoint = next;
                let fired_at = elapsed.as_secs_f64();
                log::info!(
                    "[scheduler] Checkpoint {checkpoint} at {fired_at:.3}s: {}",
                    probe.description()
                );
                window
                    .pending
                    .insert(checkpoint, (self.checkpoints[checkpoint], fired_at));
                let probe = probe.clone();
                window
                    .tasks
                    .spawn(async move { (checkpoint, probe.probe(checkpoint).await) });
                next += 1;
            }

            if now >= end {
                break;
            }
            let wake = self
                .checkpoints
                .get(next)
                .map(|c| start + *c)
                .unwrap_or(end)
                .min(end)
                .min(now + self.poll_interval);
            tokio::select! {
                biased;
                _ = wait_for_signal(interrupt) => {
                    log::warn!("[scheduler] Interrupted after {:.3}s", elapsed.as_secs_f64());
                    window.interrupted = true;
                    break;
                }
                _ = tokio::time::sleep_until(wake) => {}
            }
        }

        window
    }
}

/// A timeline whose window has closed, with the probes that may still be running.
pub struct ClosedWindow {
    tasks: JoinSet<ProbeResult>,
    pending: BTreeMap<usize, (Duration, f64)>,
    samples: Vec<ProbeSample>,
    interrupted: bool,
    grace_period: Duration,
}

impl ClosedWindow {
    /// Wait up to the grace period for the outstanding probes. Probes that do not return in
    /// time are aborted and recorded as failed.
    pub async fn drain(mut self) -> TimelineOutcome {
        let deadline = Instant::now() + self.grace_period;
        while !self.pending.is_empty() {
            match tokio::time::timeout_at(deadline, self.tasks.join_next()).await {
                Ok(Some(res)) => collect(res, &mut self.pending, &mut self.samples),
                Ok(None) | Err(_) => break,
            }
        }
        self.tasks.abort_all();
        for (checkpoint, (scheduled, fired_at)) in self.pending {
            log::warn!("[scheduler] Probe of checkpoint {checkpoint} did not return in time");
            self.samples.push(ProbeSample {
                checkpoint,
                scheduled: scheduled.as_secs_f64(),
                fired_at,
                value: None,
                error: Some("the probe did not return within the grace period".to_string()),
            });
        }

        self.samples.sort_by_key(|s| s.checkpoint);
        TimelineOutcome {
            probes: self.samples,
            interrupted: self.interrupted,
        }
    }
}

type ProbeResult = (usize, Result<f64, super::flows::FlowExecutionError>);

fn collect(
    res: Result<ProbeResult, tokio::task::JoinError>,
    pending: &mut BTreeMap<usize, (Duration, f64)>,
    samples: &mut Vec<ProbeSample>,
) {
    // a panicked probe stays pending and is reported as not returning
    let Ok((checkpoint, result)) = res else {
        return;
    };
    let Some((scheduled, fired_at)) = pending.remove(&checkpoint) else {
        return;
    };
    let (value, error) = match result {
        Ok(v) => (Some(v), None),
        Err(e) => {
            log::warn!("[scheduler] Probe of checkpoint {checkpoint} failed: {e}");
            (None, Some(e.to_string()))
        }
    };
    samples.push(ProbeSample {
        checkpoint,
        scheduled: scheduled.as_secs_f64(),
        fired_at,
        value,
        error,
    });
}

/// Everything observed while driving one experiment.
#[derive(Debug, Default)]
pub struct ScheduleOutcome {
    pub queue: Vec<QueueSample>,
    pub sampler_killed: bool,
    pub sampler_error: Option<String>,
    pub probes: Vec<ProbeSample>,
    pub flows: Vec<FlowRecord>,
    /// Sinks of all flows, ordered by their key.
    pub sinks: Vec<(SinkKey, PathBuf)>,
    pub interrupted: bool,
}

/// Drives the phases of one experiment on a running topology.
pub struct ExperimentScheduler {
    config: Arc<ExperimentConfig>,
    topo: Arc<TopologyHandle>,
    run_dir: PathBuf,
    plan: FlowPlan,
    probe: Arc<dyn ProbeAction>,
    interrupt: watch::Receiver<bool>,
}

impl ExperimentScheduler {
    pub fn new(
        config: Arc<ExperimentConfig>,
        topo: Arc<TopologyHandle>,
        run_dir: impl Into<PathBuf>,
        plan: FlowPlan,
        probe: Arc<dyn ProbeAction>,
        interrupt: watch::Receiver<bool>,
    ) -> Self {
        Self {
            config,
            topo,
            run_dir: run_dir.into(),
            plan,
            probe,
            interrupt,
        }
    }

    /// Run all phases and stop the topology afterwards.
    pub async fn run(mut self) -> Result<ScheduleOutcome, ExperimentError> {
        let result = self.run_phases().await;
        if let Err(e) = self.topo.stop().await {
            log::error!("[scheduler] Cannot stop the topology: {e}");
        }
        result
    }

    async fn run_phases(&mut self) -> Result<ScheduleOutcome, ExperimentError> {
        let grace = self.config.grace_period();
        let latency_bound = Duration::from_secs(self.config.ping_count as u64) + grace;
        let mut runner = ConcurrentFlowRunner::new(
            self.topo.clone(),
            self.run_dir.join(RAW_DIR),
            Instant::now(),
        )?;
        let mut outcome = ScheduleOutcome::default();

        let plan = std::mem::take(&mut self.plan);
        for flow in plan.servers.iter().cloned() {
            runner.launch(flow);
        }

        if !plan.initial.is_empty() {
            log::info!("[scheduler] Measuring the initial latency");
            outcome.interrupted =
                run_phase(&mut runner, plan.initial, latency_bound, grace, &mut self.interrupt)
                    .await;
        } else if !plan.servers.is_empty() {
            tokio::time::sleep(SERVER_WARMUP).await;
        }

        if !outcome.interrupted {
            log::info!(
                "[scheduler] Starting the competition of {} flows for {:?}",
                plan.competition.len(),
                self.config.duration()
            );
            let start = Instant::now();
            runner.set_epoch(start);
            let sampler = QueueSampler::new(
                self.topo.clone(),
                self.topo.spec().bottleneck_iface(),
                self.config.sample_interval(),
                self.run_dir.join(QUEUE_LOG),
            )
            .spawn(start)?;
            for flow in plan.competition {
                runner.launch(flow);
            }

            let window = Timeline::from_config(&self.config)
                .run_window(start, self.probe.clone(), &mut self.interrupt)
                .await;
            // the queue log covers the window only, outstanding probes drain meanwhile
            let (sampled, timeline) = tokio::join!(sampler.stop(grace), window.drain());
            outcome.probes = timeline.probes;
            outcome.interrupted = timeline.interrupted;

            log::info!(
                "[scheduler] Competition over after {:.3}s, {} queue samples",
                start.elapsed().as_secs_f64(),
                sampled.samples.len()
            );
            outcome.queue = sampled.samples;
            outcome.sampler_killed = sampled.killed;
            outcome.sampler_error = sampled.error;

            let joined = runner.shutdown(grace).await;
            for (key, status) in joined.failed() {
                log::warn!("[scheduler] Flow {key} ended as {}", status.name());
            }
        }

        if !outcome.interrupted && !plan.closing.is_empty() {
            log::info!("[scheduler] Measuring the final latency");
            runner.set_epoch(Instant::now());
            outcome.interrupted =
                run_phase(&mut runner, plan.closing, latency_bound, grace, &mut self.interrupt)
                    .await;
        }

        runner.shutdown(grace).await;
        outcome.flows = runner.records();
        outcome.sinks = runner.sinks();
        Ok(outcome)
    }
}

/// Launch the flows of one phase and wait for them, at most `bound`. Flows still running
/// afterwards are cancelled. Returns whether the phase was interrupted.
async fn run_phase(
    runner: &mut ConcurrentFlowRunner,
    flows: Vec<Flow>,
    bound: Duration,
    grace: Duration,
    interrupt: &mut watch::Receiver<bool>,
) -> bool {
    let keys: Vec<SinkKey> = flows.into_iter().map(|f| runner.launch(f)).collect();
    let interrupted = tokio::select! {
        biased;
        _ = wait_for_signal(interrupt) => true,
        outcome = runner.join(&keys, bound) => {
            if !outcome.running.is_empty() {
                log::warn!("[scheduler] {} flows exceeded the phase, cancelling them", outcome.running.len());
            }
            false
        }
    };
    runner.cancel(&keys);
    runner.join(&keys, grace).await;
    interrupted
}
