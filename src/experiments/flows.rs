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
//! Module to launch traffic flows as independent concurrent workers.
//!
//! Every flow runs in its own tokio task and writes the raw output of its tool to its own sink
//! file, keyed by `(host, algorithm, role, sequence number)`. Workers share nothing but the sink
//! directory. The failure of one flow is recorded on its handle and never affects its siblings.

use std::{
    collections::HashMap,
    fs::{self, File},
    io::Write,
    path::{Path, PathBuf},
    process::Stdio,
    sync::Arc,
    time::Duration,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{process::Command, sync::watch, task::JoinHandle, time::Instant};

use ccarena_utils::other::sanitize_file_name;

use super::wait_for_signal;
use crate::{
    emulator::TopologyHandle,
    extract::{curl, iperf_title, latency_title, marker, ping_train_title},
    records::{FlowRecord, FlowRole, Stage},
};

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum FlowExecutionError {
    #[error("Tool `{tool}` is not available: {reason}")]
    Unavailable { tool: String, reason: String },
    #[error("Cannot spawn `{tool}`: {reason}")]
    Spawn { tool: String, reason: String },
    #[error("Tool `{tool}` exited with {status}")]
    NonZeroExit { tool: String, status: String },
    #[error("Cannot write the output sink {path}: {reason}")]
    Sink { path: String, reason: String },
    #[error("Host {host} already runs a flow of {algorithm} in another role")]
    RoleConflict { host: String, algorithm: String },
    #[error("Emulation error: {0}")]
    Emulation(String),
    #[error("Output of `{tool}` cannot be parsed: {output:?}")]
    UnexpectedOutput { tool: String, output: String },
    #[error("Worker panicked: {0}")]
    Panicked(String),
}

/// The external tool a flow runs.
#[derive(Debug, Clone, PartialEq)]
pub enum FlowKind {
    /// `iperf3 -s` serving one client at a time.
    IperfServer { port: u16 },
    /// `iperf3 -c` sending to `server` for the duration of the flow, with the congestion control
    /// of the flow.
    IperfClient { server: String, port: u16 },
    /// Continuous `ping` until cancelled.
    PingTrain { target: String, interval: Duration },
    /// `ping -c <count>` measuring the latency at one stage of the experiment.
    Ping {
        target: String,
        count: usize,
        stage: Stage,
    },
    /// Static file server rooted at `root`.
    HttpServer { port: u16, root: PathBuf },
    /// `count` sequential requests to `http://<server>:<port>/<path>`, `gap` apart.
    HttpFetch {
        server: String,
        port: u16,
        path: String,
        count: usize,
        gap: Duration,
    },
    /// Any other program. Its output is written below `header`, if given.
    Custom {
        program: String,
        args: Vec<String>,
        header: Option<String>,
    },
}

impl FlowKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::IperfServer { .. } => "iperf_server",
            Self::IperfClient { .. } => "iperf_client",
            Self::PingTrain { .. } => "ping_train",
            Self::Ping { .. } => "ping",
            Self::HttpServer { .. } => "http_server",
            Self::HttpFetch { .. } => "http_fetch",
            Self::Custom { .. } => "custom",
        }
    }

    /// Persistent flows run until they are cancelled.
    pub fn is_persistent(&self) -> bool {
        matches!(
            self,
            Self::IperfServer { .. } | Self::PingTrain { .. } | Self::HttpServer { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Flow {
    pub host: String,
    pub role: FlowRole,
    pub algorithm: String,
    pub start_offset: Duration,
    pub duration: Duration,
    pub kind: FlowKind,
}

/// Unique key of the output sink of a flow.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SinkKey {
    pub host: String,
    pub algorithm: String,
    pub role: FlowRole,
    pub seq: usize,
}

impl SinkKey {
    pub fn file_name(&self) -> String {
        sanitize_file_name(format!(
            "{}_{}_{}_{}.txt",
            self.host, self.algorithm, self.role, self.seq
        ))
    }
}

impl std::fmt::Display for SinkKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}#{}", self.host, self.algorithm, self.role, self.seq)
    }
}

/// Final state of a flow worker.
#[derive(Debug, Clone, PartialEq)]
pub enum FlowStatus {
    Completed,
    Failed(FlowExecutionError),
    /// Stopped on request.
    Cancelled,
    /// Did not honor the cancellation within the grace period.
    Killed,
}

impl FlowStatus {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed(_) => "failed",
            Self::Cancelled => "cancelled",
            Self::Killed => "killed",
        }
    }

    pub fn error(&self) -> Option<&FlowExecutionError> {
        match self {
            Self::Failed(e) => Some(e),
            _ => None,
        }
    }
}

/// Handle of one launched flow.
#[derive(Debug)]
pub struct FlowHandle {
    pub key: SinkKey,
    pub sink: PathBuf,
    kind: &'static str,
    persistent: bool,
    cancel: watch::Sender<bool>,
    join: Option<JoinHandle<(FlowStatus, f64)>>,
    status: Option<(FlowStatus, Option<f64>)>,
}

impl FlowHandle {
    pub fn status(&self) -> Option<&FlowStatus> {
        self.status.as_ref().map(|(s, _)| s)
    }

    fn is_active(&self) -> bool {
        self.join.as_ref().is_some_and(|j| !j.is_finished())
    }

    pub fn record(&self) -> FlowRecord {
        let (status, finished_at) = match &self.status {
            Some((s, t)) => (s.name().to_string(), *t),
            None => ("running".to_string(), None),
        };
        FlowRecord {
            host: self.key.host.clone(),
            algorithm: self.key.algorithm.clone(),
            role: self.key.role,
            seq: self.key.seq,
            kind: self.kind.to_string(),
            status,
            error: self
                .status()
                .and_then(FlowStatus::error)
                .map(|e| e.to_string()),
            finished_at,
            sink: self.key.file_name(),
        }
    }
}

/// Result of waiting for flows.
#[derive(Debug, Default)]
pub struct JoinOutcome {
    /// Flows that finished, with their status.
    pub finished: Vec<(SinkKey, FlowStatus)>,
    /// Flows still running when the timeout expired.
    pub running: Vec<SinkKey>,
}

impl JoinOutcome {
    pub fn completed(&self) -> impl Iterator<Item = &SinkKey> {
        self.finished
            .iter()
            .filter(|(_, s)| matches!(s, FlowStatus::Completed | FlowStatus::Cancelled))
            .map(|(k, _)| k)
    }

    pub fn failed(&self) -> impl Iterator<Item = (&SinkKey, &FlowStatus)> {
        self.finished
            .iter()
            .filter(|(_, s)| matches!(s, FlowStatus::Failed(_) | FlowStatus::Killed))
            .map(|(k, s)| (k, s))
    }
}

pub struct ConcurrentFlowRunner {
    topo: Arc<TopologyHandle>,
    sink_dir: PathBuf,
    start: Instant,
    seqs: HashMap<(String, String, FlowRole), usize>,
    handles: Vec<FlowHandle>,
}

impl ConcurrentFlowRunner {
    /// Create a runner writing its sinks to `sink_dir`. Offsets of flows are relative to `start`.
    pub fn new(
        topo: Arc<TopologyHandle>,
        sink_dir: impl Into<PathBuf>,
        start: Instant,
    ) -> std::io::Result<Self> {
        let sink_dir = sink_dir.into();
        fs::create_dir_all(&sink_dir)?;
        Ok(Self {
            topo,
            sink_dir,
            start,
            seqs: HashMap::new(),
            handles: Vec::new(),
        })
    }

    /// Launch a flow as its own worker and return the key of its sink.
    pub fn launch(&mut self, flow: Flow) -> SinkKey {
        let seq = self
            .seqs
            .entry((flow.host.clone(), flow.algorithm.clone(), flow.role))
            .or_default();
        *seq += 1;
        let key = SinkKey {
            host: flow.host.clone(),
            algorithm: flow.algorithm.clone(),
            role: flow.role,
            seq: *seq,
        };
        let sink = self.sink_dir.join(key.file_name());
        let (cancel, cancel_rx) = watch::channel(false);
        let mut handle = FlowHandle {
            key: key.clone(),
            sink: sink.clone(),
            kind: flow.kind.name(),
            persistent: flow.kind.is_persistent(),
            cancel,
            join: None,
            status: None,
        };

        let conflict = self.handles.iter().any(|h| {
            h.is_active()
                && h.key.host == flow.host
                && h.key.algorithm == flow.algorithm
                && h.key.role != flow.role
        });
        if conflict {
            log::error!("[flows] Refusing to launch {key}: the host is busy in another role");
            handle.status = Some((
                FlowStatus::Failed(FlowExecutionError::RoleConflict {
                    host: flow.host,
                    algorithm: flow.algorithm,
                }),
                None,
            ));
        } else {
            log::debug!("[flows] Launching {} flow {key}", flow.kind.name());
            let topo = self.topo.clone();
            let start = self.start;
            handle.join = Some(tokio::spawn(async move {
                let status = run_flow(topo, flow, sink, start, cancel_rx).await;
                (status, start.elapsed().as_secs_f64())
            }));
        }

        self.handles.push(handle);
        key
    }

    /// Move the reference point of flow offsets. Flows launched afterwards start relative to
    /// `start`.
    pub fn set_epoch(&mut self, start: Instant) {
        self.start = start;
    }

    /// Signal all flows to stop.
    pub fn cancel_all(&self) {
        for h in &self.handles {
            h.cancel.send_replace(true);
        }
    }

    /// Signal the given flows to stop.
    pub fn cancel(&self, keys: &[SinkKey]) {
        for h in self.handles.iter().filter(|h| keys.contains(&h.key)) {
            h.cancel.send_replace(true);
        }
    }

    /// Wait until all flows have finished, or until `timeout` expires.
    pub async fn join_all(&mut self, timeout: Duration) -> JoinOutcome {
        self.join_where(Instant::now() + timeout, |_| true).await
    }

    /// Wait until the given flows have finished, or until `timeout` expires.
    pub async fn join(&mut self, keys: &[SinkKey], timeout: Duration) -> JoinOutcome {
        self.join_where(Instant::now() + timeout, |h| keys.contains(&h.key))
            .await
    }

    async fn join_where(
        &mut self,
        deadline: Instant,
        select: impl Fn(&FlowHandle) -> bool,
    ) -> JoinOutcome {
        let mut outcome = JoinOutcome::default();
        for handle in self.handles.iter_mut().filter(|h| select(h)) {
            if let Some(join) = handle.join.as_mut() {
                if let Ok(res) = tokio::time::timeout_at(deadline, join).await {
                    let (status, finished_at) = match res {
                        Ok((status, t)) => (status, Some(t)),
                        Err(e) => (FlowStatus::Failed(FlowExecutionError::Panicked(e.to_string())), None),
                    };
                    handle.join = None;
                    handle.status = Some((status, finished_at));
                }
            }
            match &handle.status {
                Some((status, _)) => outcome.finished.push((handle.key.clone(), status.clone())),
                None => outcome.running.push(handle.key.clone()),
            }
        }
        outcome
    }

    /// Stop all flows: wait up to `grace` for finite flows to end on their own, then cancel
    /// everything, wait up to `grace` again, and finally abort the remaining workers.
    pub async fn shutdown(&mut self, grace: Duration) -> JoinOutcome {
        let drained = self
            .join_where(Instant::now() + grace, |h| !h.persistent)
            .await;
        if !drained.running.is_empty() {
            log::warn!(
                "[flows] {} flows did not finish on time, cancelling them",
                drained.running.len()
            );
        }

        self.cancel_all();
        let outcome = self.join_all(grace).await;

        for handle in self.handles.iter_mut() {
            let Some(join) = handle.join.take() else {
                continue;
            };
            log::error!("[flows] Killing {} which ignored the cancellation", handle.key);
            join.abort();
            let status = match join.await {
                Ok((status, t)) => (status, Some(t)),
                Err(e) if e.is_cancelled() => (FlowStatus::Killed, None),
                Err(e) => (FlowStatus::Failed(FlowExecutionError::Panicked(e.to_string())), None),
            };
            handle.status = Some(status);
        }

        if outcome.running.is_empty() {
            return outcome;
        }
        JoinOutcome {
            finished: self
                .handles
                .iter()
                .filter_map(|h| Some((h.key.clone(), h.status()?.clone())))
                .collect(),
            running: Vec::new(),
        }
    }

    /// Records of all flows, ordered by their key.
    pub fn records(&self) -> Vec<FlowRecord> {
        let mut records: Vec<_> = self.handles.iter().map(FlowHandle::record).collect();
        records.sort_by(|a, b| {
            (&a.host, &a.algorithm, a.role, a.seq).cmp(&(&b.host, &b.algorithm, b.role, b.seq))
        });
        records
    }

    /// All sinks, ordered by their key.
    pub fn sinks(&self) -> Vec<(SinkKey, PathBuf)> {
        let mut sinks: Vec<_> = self
            .handles
            .iter()
            .map(|h| (h.key.clone(), h.sink.clone()))
            .collect();
        sinks.sort();
        sinks
    }
}

/// Worker of a single flow.
async fn run_flow(
    topo: Arc<TopologyHandle>,
    flow: Flow,
    sink: PathBuf,
    start: Instant,
    mut cancel: watch::Receiver<bool>,
) -> FlowStatus {
    tokio::select! {
        biased;
        _ = wait_for_signal(&mut cancel) => return FlowStatus::Cancelled,
        _ = tokio::time::sleep_until(start + flow.start_offset) => {}
    }

    match execute(&topo, &flow, &sink, &mut cancel).await {
        Ok(status) => {
            log::debug!("[flows] {} flow on {} {}", flow.kind.name(), flow.host, status.name());
            status
        }
        Err(e) => {
            log::warn!("[flows] {} flow on {} failed: {e}", flow.kind.name(), flow.host);
            FlowStatus::Failed(e)
        }
    }
}

fn sink_error(path: &Path, e: std::io::Error) -> FlowExecutionError {
    FlowExecutionError::Sink {
        path: path.display().to_string(),
        reason: e.to_string(),
    }
}

async fn execute(
    topo: &TopologyHandle,
    flow: &Flow,
    sink: &Path,
    cancel: &mut watch::Receiver<bool>,
) -> Result<FlowStatus, FlowExecutionError> {
    let mut file = File::create(sink).map_err(|e| sink_error(sink, e))?;
    let addr = |host: &str| {
        topo.host_addr(host)
            .map(|a| a.to_string())
            .map_err(|e| FlowExecutionError::Emulation(e.to_string()))
    };
    let command = |program: &str| {
        topo.command(&flow.host, program)
            .map_err(|e| FlowExecutionError::Emulation(e.to_string()))
    };

    let (cmd, header) = match &flow.kind {
        FlowKind::IperfServer { port } => {
            let port = port.to_string();
            let mut cmd = command("iperf3")?;
            cmd.args(["-s", "-p", port.as_str()]);
            (cmd, None)
        }
        FlowKind::IperfClient { server, port } => {
            let (server, port) = (addr(server)?, port.to_string());
            let secs = (flow.duration.as_secs_f64().ceil().max(1.0) as u64).to_string();
            let mut cmd = command("iperf3")?;
            cmd.args(["-c", server.as_str(), "-p", port.as_str(), "-t", secs.as_str()])
                .args(["-C", flow.algorithm.as_str(), "-i", "1"]);
            (cmd, Some(iperf_title(&flow.host)))
        }
        FlowKind::PingTrain { target, interval } => {
            let (target, interval) = (addr(target)?, interval.as_secs_f64().to_string());
            let mut cmd = command("ping")?;
            cmd.args(["-i", interval.as_str(), target.as_str()]);
            (cmd, Some(ping_train_title(&flow.host)))
        }
        FlowKind::Ping {
            target,
            count,
            stage,
        } => {
            let (target, count) = (addr(target)?, count.to_string());
            let mut cmd = command("ping")?;
            cmd.args(["-c", count.as_str(), target.as_str()]);
            (cmd, Some(latency_title(&flow.host, *stage)))
        }
        FlowKind::HttpServer { port, root } => {
            let port = port.to_string();
            let mut cmd = command("python3")?;
            cmd.args(["-m", "http.server", port.as_str(), "--directory"])
                .arg(root);
            (cmd, None)
        }
        FlowKind::HttpFetch {
            server,
            port,
            path,
            count,
            gap,
        } => {
            let url = format!("http://{}:{port}/{path}", addr(server)?);
            let mut first_error = None;
            for seq in 1..=*count {
                if seq > 1 {
                    tokio::select! {
                        biased;
                        _ = wait_for_signal(cancel) => return Ok(FlowStatus::Cancelled),
                        _ = tokio::time::sleep(*gap) => {}
                    }
                }
                let mut cmd = command("curl")?;
                cmd.args(["-o", "/dev/null", "-s", "-w"])
                    .arg(curl::write_out_template(&flow.host, seq))
                    .arg(&url);
                match wait_child(cmd, "curl", &file, sink, cancel).await {
                    Ok(FlowStatus::Completed) => {}
                    Ok(status) => return Ok(status),
                    Err(e) => {
                        log::warn!("[flows] Request {seq} of {} failed: {e}", flow.host);
                        first_error.get_or_insert(e);
                    }
                }
            }
            return Ok(first_error.map_or(FlowStatus::Completed, FlowStatus::Failed));
        }
        FlowKind::Custom {
            program,
            args,
            header,
        } => {
            let mut cmd = command(program)?;
            cmd.args(args);
            (cmd, header.clone())
        }
    };

    if let Some(header) = header {
        writeln!(file, "{}", marker(&header)).map_err(|e| sink_error(sink, e))?;
    }
    let tool = match &flow.kind {
        FlowKind::Custom { program, .. } => program.as_str(),
        FlowKind::IperfServer { .. } | FlowKind::IperfClient { .. } => "iperf3",
        FlowKind::PingTrain { .. } | FlowKind::Ping { .. } => "ping",
        FlowKind::HttpServer { .. } => "python3",
        FlowKind::HttpFetch { .. } => "curl",
    };
    wait_child(cmd, tool, &file, sink, cancel).await
}

/// Spawn the command with its output redirected into the sink and wait for it to exit, or kill
/// it on cancellation.
async fn wait_child(
    mut cmd: Command,
    tool: &str,
    file: &File,
    sink: &Path,
    cancel: &mut watch::Receiver<bool>,
) -> Result<FlowStatus, FlowExecutionError> {
    let stdout = file.try_clone().map_err(|e| sink_error(sink, e))?;
    let stderr = file.try_clone().map_err(|e| sink_error(sink, e))?;
    cmd.stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr))
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => FlowExecutionError::Unavailable {
            tool: tool.to_string(),
            reason: e.to_string(),
        },
        _ => FlowExecutionError::Spawn {
            tool: tool.to_string(),
            reason: e.to_string(),
        },
    })?;

    tokio::select! {
        status = child.wait() => {
            let status = status.map_err(|e| FlowExecutionError::Spawn {
                tool: tool.to_string(),
                reason: e.to_string(),
            })?;
            if status.success() {
                Ok(FlowStatus::Completed)
            } else {
                Err(FlowExecutionError::NonZeroExit {
                    tool: tool.to_string(),
                    status: status.to_string(),
                })
            }
        }
        _ = wait_for_signal(cancel) => {
            if let Err(e) = child.start_kill() {
                log::debug!("[flows] Cannot kill {tool}: {e}");
            }
            let _ = child.wait().await;
            Ok(FlowStatus::Cancelled)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        config::ExperimentConfig, emulator::LoopbackEmulator, topology::TopologySpec,
    };

    async fn topo() -> Arc<TopologyHandle> {
        let spec = TopologySpec::from_config(&ExperimentConfig::new(10.0, 10.0)).unwrap();
        Arc::new(
            TopologyHandle::start(Arc::new(LoopbackEmulator::new()), spec)
                .await
                .unwrap(),
        )
    }

    fn custom(host: &str, algorithm: &str, script: &str) -> Flow {
        Flow {
            host: host.to_string(),
            role: FlowRole::Client,
            algorithm: algorithm.to_string(),
            start_offset: Duration::ZERO,
            duration: Duration::from_secs(1),
            kind: FlowKind::Custom {
                program: "sh".to_string(),
                args: vec!["-c".to_string(), script.to_string()],
                header: Some(format!("TEST {host}")),
            },
        }
    }

    #[test]
    fn sink_names() {
        let key = SinkKey {
            host: "h1".to_string(),
            algorithm: "reno".to_string(),
            role: FlowRole::Client,
            seq: 2,
        };
        assert_eq!(key.file_name(), "h1_reno_client_2.txt");
    }

    #[tokio::test]
    async fn failures_are_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let topo = topo().await;
        let mut runner = ConcurrentFlowRunner::new(topo.clone(), dir.path(), Instant::now()).unwrap();

        let ok = runner.launch(custom("h1", "reno", "echo hello"));
        let bad = runner.launch(custom("h2", "bbr", "echo oops; exit 3"));
        let mut missing = custom("h1", "reno", "");
        missing.kind = FlowKind::Custom {
            program: "ccarena-no-such-tool".to_string(),
            args: vec![],
            header: None,
        };
        let missing = runner.launch(missing);

        let outcome = runner.join_all(Duration::from_secs(10)).await;
        assert!(outcome.running.is_empty());
        assert_eq!(outcome.completed().collect::<Vec<_>>(), vec![&ok]);
        let failed: HashMap<_, _> = outcome.failed().collect();
        assert!(matches!(
            failed[&bad],
            FlowStatus::Failed(FlowExecutionError::NonZeroExit { .. })
        ));
        assert!(matches!(
            failed[&missing],
            FlowStatus::Failed(FlowExecutionError::Unavailable { .. })
        ));

        // distinct sinks for the same (host, algorithm, role)
        assert_eq!(ok.seq, 1);
        assert_eq!(missing.seq, 2);
        let content = fs::read_to_string(dir.path().join(ok.file_name())).unwrap();
        assert_eq!(content, "=== TEST h1 ===\nhello\n");
        let content = fs::read_to_string(dir.path().join(bad.file_name())).unwrap();
        assert_eq!(content, "=== TEST h2 ===\noops\n");

        topo.stop().await.unwrap();
    }

    #[tokio::test]
    async fn flows_run_concurrently() {
        let dir = tempfile::tempdir().unwrap();
        let topo = topo().await;
        let mut runner = ConcurrentFlowRunner::new(topo.clone(), dir.path(), Instant::now()).unwrap();
        let begin = std::time::Instant::now();
        runner.launch(custom("h1", "reno", "sleep 1"));
        runner.launch(custom("h2", "bbr", "sleep 1"));
        runner.launch(custom("h1", "bbr", "sleep 1"));
        let outcome = runner.join_all(Duration::from_secs(10)).await;
        assert_eq!(outcome.completed().count(), 3);
        assert!(begin.elapsed() < Duration::from_millis(2500));
        topo.stop().await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_cancels_persistent_flows() {
        let dir = tempfile::tempdir().unwrap();
        let topo = topo().await;
        let mut runner = ConcurrentFlowRunner::new(topo.clone(), dir.path(), Instant::now()).unwrap();

        let finite = runner.launch(custom("h1", "reno", "echo done"));
        let mut server = custom("srv", "reno", "sleep 30");
        server.role = FlowRole::Server;
        let long = runner.launch(server);

        let begin = std::time::Instant::now();
        let outcome = runner.shutdown(Duration::from_millis(500)).await;
        assert!(begin.elapsed() < Duration::from_secs(5));
        assert!(outcome.running.is_empty());
        let statuses: HashMap<_, _> = outcome.finished.into_iter().collect();
        assert_eq!(statuses[&finite], FlowStatus::Completed);
        assert_eq!(statuses[&long], FlowStatus::Cancelled);
        topo.stop().await.unwrap();
    }

    #[tokio::test]
    async fn role_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let topo = topo().await;
        let mut runner = ConcurrentFlowRunner::new(topo.clone(), dir.path(), Instant::now()).unwrap();
        runner.launch(custom("h1", "reno", "sleep 2"));
        let mut server = custom("h1", "reno", "true");
        server.role = FlowRole::Server;
        let server = runner.launch(server);
        let outcome = runner.shutdown(Duration::from_millis(100)).await;
        let statuses: HashMap<_, _> = outcome.finished.into_iter().collect();
        assert!(matches!(
            statuses[&server],
            FlowStatus::Failed(FlowExecutionError::RoleConflict { .. })
        ));
        topo.stop().await.unwrap();
    }
}
