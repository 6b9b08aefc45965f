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
//! Periodic sampling of the bottleneck queue.

use std::{
    fs::{self, File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use itertools::Itertools;
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};

use crate::{emulator::TopologyHandle, records::QueueSample};

/// Samples the queue depth of one interface at a fixed interval into a log file.
///
/// Each sample is appended as one line `<seconds> <depth>` with a single write, and the loop only
/// stops between two samples. Hence, the log never contains a partial line.
pub struct QueueSampler {
    topo: Arc<TopologyHandle>,
    iface: String,
    interval: Duration,
    log_path: PathBuf,
}

/// Handle of a running [`QueueSampler`].
pub struct SamplerHandle {
    stop: watch::Sender<bool>,
    join: JoinHandle<std::io::Result<Vec<QueueSample>>>,
    log_path: PathBuf,
}

/// Samples collected by a stopped sampler.
#[derive(Debug, Default)]
pub struct SamplerOutcome {
    pub samples: Vec<QueueSample>,
    /// Whether the sampler ignored the stop signal and had to be aborted.
    pub killed: bool,
    pub error: Option<String>,
}

impl QueueSampler {
    pub fn new(
        topo: Arc<TopologyHandle>,
        iface: impl Into<String>,
        interval: Duration,
        log_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            topo,
            iface: iface.into(),
            interval,
            log_path: log_path.into(),
        }
    }

    /// Create the log file and start sampling. Timestamps are relative to `start`.
    pub fn spawn(self, start: Instant) -> std::io::Result<SamplerHandle> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.log_path)?;
        let (stop, stop_rx) = watch::channel(false);
        let log_path = self.log_path.clone();
        log::debug!(
            "[sampler] Sampling {} every {:?} into {}",
            self.iface,
            self.interval,
            log_path.display()
        );
        let join = tokio::spawn(self.run(file, start, stop_rx));
        Ok(SamplerHandle {
            stop,
            join,
            log_path,
        })
    }

    async fn run(
        self,
        mut file: File,
        start: Instant,
        mut stop: watch::Receiver<bool>,
    ) -> std::io::Result<Vec<QueueSample>> {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut samples: Vec<QueueSample> = Vec::new();

        loop {
            tokio::select! {
                biased;
                _ = stop.changed() => break,
                _ = ticker.tick() => {}
            }
            if *stop.borrow() {
                break;
            }

            let depth = self.topo.queue_depth(&self.iface).await;
            let timestamp = start.elapsed().as_micros() as u64;
            if samples.last().is_some_and(|s| s.timestamp >= timestamp) {
                continue;
            }
            let sample = QueueSample { timestamp, depth };
            // one write per line, no suspension point in between
            file.write_all(format!("{:.6} {}\n", sample.seconds(), sample.depth).as_bytes())?;
            samples.push(sample);
        }

        file.flush()?;
        log::debug!("[sampler] Stopped after {} samples", samples.len());
        Ok(samples)
    }
}

impl SamplerHandle {
    /// Signal the sampler to stop and wait up to `grace` for it. If it does not stop in time, it
    /// is aborted and the samples are read back from the log.
    pub async fn stop(mut self, grace: Duration) -> SamplerOutcome {
        self.stop.send_replace(true);
        match tokio::time::timeout(grace, &mut self.join).await {
            Ok(Ok(Ok(samples))) => SamplerOutcome {
                samples,
                ..Default::default()
            },
            Ok(Ok(Err(e))) => {
                log::error!("[sampler] Cannot write the queue log: {e}");
                self.recover(false, Some(e.to_string()))
            }
            Ok(Err(e)) => {
                log::error!("[sampler] Sampler failed: {e}");
                self.recover(false, Some(e.to_string()))
            }
            Err(_) => {
                log::error!("[sampler] Sampler ignored the stop signal, aborting it");
                self.join.abort();
                let _ = (&mut self.join).await;
                self.recover(true, None)
            }
        }
    }

    fn recover(&self, killed: bool, error: Option<String>) -> SamplerOutcome {
        let samples = read_queue_log(&self.log_path).unwrap_or_default();
        SamplerOutcome {
            samples,
            killed,
            error,
        }
    }
}

/// Read a queue log written by the sampler. Lines that cannot be parsed are skipped.
pub fn read_queue_log(path: impl AsRef<Path>) -> std::io::Result<Vec<QueueSample>> {
    Ok(parse_queue_log(&fs::read_to_string(path)?))
}

pub fn parse_queue_log(content: &str) -> Vec<QueueSample> {
    content
        .lines()
        .filter_map(|line| {
            let (t, depth) = line.split_whitespace().collect_tuple()?;
            let t: f64 = t.parse().ok()?;
            Some(QueueSample {
                timestamp: (t * 1e6).round() as u64,
                depth: depth.parse().ok()?,
            })
        })
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        config::ExperimentConfig, emulator::LoopbackEmulator, topology::TopologySpec,
    };
    use std::sync::atomic::{AtomicU64, Ordering};

    async fn topo() -> Arc<TopologyHandle> {
        let counter = AtomicU64::new(0);
        let emu = LoopbackEmulator::with_depth_source(move || {
            counter.fetch_add(1, Ordering::SeqCst) % 100
        });
        let spec = TopologySpec::from_config(&ExperimentConfig::new(10.0, 10.0)).unwrap();
        Arc::new(TopologyHandle::start(Arc::new(emu), spec).await.unwrap())
    }

    #[tokio::test(start_paused = true)]
    async fn samples_every_interval() {
        let dir = tempfile::tempdir().unwrap();
        let topo = topo().await;
        let iface = topo.spec().bottleneck_iface();
        let path = dir.path().join("q.txt");

        let start = Instant::now();
        let handle = QueueSampler::new(topo.clone(), iface, Duration::from_millis(100), &path)
            .spawn(start)
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10_050)).await;
        let outcome = handle.stop(Duration::from_secs(1)).await;

        assert!(!outcome.killed);
        // first tick at 0, then every 100ms up to 10s
        assert_eq!(outcome.samples.len(), 101);
        assert!(outcome
            .samples
            .windows(2)
            .all(|w| w[0].timestamp < w[1].timestamp));
        assert_eq!(outcome.samples.last().unwrap().seconds(), 10.0);
        assert_eq!(outcome.samples[3].depth, 3);

        let logged = read_queue_log(&path).unwrap();
        assert_eq!(logged, outcome.samples);
        topo.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_mid_interval_leaves_whole_lines() {
        let dir = tempfile::tempdir().unwrap();
        let topo = topo().await;
        let iface = topo.spec().bottleneck_iface();
        let path = dir.path().join("q.txt");

        let handle = QueueSampler::new(topo.clone(), iface, Duration::from_millis(100), &path)
            .spawn(Instant::now())
            .unwrap();
        tokio::time::sleep(Duration::from_millis(1_234)).await;
        let outcome = handle.stop(Duration::from_secs(1)).await;
        assert_eq!(outcome.samples.len(), 13);

        let content = fs::read_to_string(&path).unwrap();
        assert!(content.ends_with('\n'));
        for line in content.lines() {
            let fields: Vec<_> = line.split(' ').collect();
            assert_eq!(fields.len(), 2, "partial line {line:?}");
            assert!(fields[0].parse::<f64>().is_ok());
            assert!(fields[1].parse::<u64>().is_ok());
        }
        topo.stop().await.unwrap();
    }

    #[test]
    fn parse_log() {
        let samples = parse_queue_log("0.100000 3\n0.200000 7\ngarbage\n0.300000\n");
        assert_eq!(
            samples,
            vec![
                QueueSample {
                    timestamp: 100_000,
                    depth: 3
                },
                QueueSample {
                    timestamp: 200_000,
                    depth: 7
                }
            ]
        );
    }
}
