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
//! Full runs of a competition between two algorithm classes.

use std::{
    fs,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use tokio::sync::watch;

use super::*;
use crate::{
    emulator::LoopbackEmulator,
    experiments::{
        reanalyze, Experiment, FlowExecutionError, FlowPlan, FnProbe, QUEUE_LOG, RAW_REPORT,
    },
    report::{self, FETCH_TIMES_FILE, RESULT_FILE, SUMMARY_FILE},
    result::ExperimentResult,
};

fn reno_h1() -> IperfFixture {
    IperfFixture {
        rates: vec![4.0, 5.0, 6.0],
        retransmits: vec![1, 2, 0],
        avg: 5.0,
    }
}

fn reno_h2() -> IperfFixture {
    IperfFixture {
        rates: vec![2.0, 3.0, 4.0],
        retransmits: vec![0, 4, 1],
        avg: 3.0,
    }
}

fn bbr_h3() -> IperfFixture {
    IperfFixture {
        rates: vec![6.0, 6.0],
        retransmits: vec![0, 0],
        avg: 6.0,
    }
}

/// The plan of [`config`]: latency before and after, iperf and one HTTP request per host, and a
/// ping train from the first host.
fn plan(config: &ExperimentConfig, fixtures: &mut Fixtures) -> FlowPlan {
    let [h1, h2, h3] = [&config.hosts[0], &config.hosts[1], &config.hosts[2]];
    FlowPlan {
        servers: Vec::new(),
        initial: vec![
            fixtures.latency(h1, Stage::Initial, 20.0),
            fixtures.latency(h2, Stage::Initial, 22.0),
            fixtures.latency(h3, Stage::Initial, 25.0),
        ],
        competition: vec![
            fixtures.iperf(h1, &reno_h1()),
            fixtures.iperf(h2, &reno_h2()),
            fixtures.iperf(h3, &bbr_h3()),
            fixtures.http(h1, 1, 0.5, 100_000.0),
            fixtures.http(h2, 1, 0.7, 80_000.0),
            fixtures.http(h3, 1, 0.4, 120_000.0),
            fixtures.ping_train(h1, &[5.0, 6.0, 7.5]),
        ],
        closing: vec![
            fixtures.latency(h1, Stage::Final, 40.0),
            fixtures.latency(h2, Stage::Final, 44.0),
            fixtures.latency(h3, Stage::Final, 50.0),
        ],
    }
}

fn probe() -> Arc<FnProbe<impl Fn(usize) -> std::future::Ready<Result<f64, FlowExecutionError>>>> {
    Arc::new(FnProbe::new("constant", |checkpoint: usize| {
        std::future::ready(Ok(0.1 * (checkpoint + 1) as f64))
    }))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn full_competition() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path().join("data"));
    let mut fixtures = Fixtures::new(dir.path().join("fixtures"), config.duration());
    let plan = plan(&config, &mut fixtures);

    let depth = Arc::new(AtomicU64::new(0));
    let emu = {
        let depth = depth.clone();
        Arc::new(LoopbackEmulator::with_depth_source(move || {
            depth.fetch_add(1, Ordering::SeqCst) % 50
        }))
    };
    let (_tx, rx) = watch::channel(false);

    let start = Instant::now();
    let summary = Experiment::new(config.clone(), emu.clone())
        .unwrap()
        .with_plan(plan)
        .with_probe(probe())
        .run(rx)
        .await
        .unwrap();
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_secs(3), "{elapsed:?}");
    assert!(elapsed < Duration::from_secs(15), "{elapsed:?}");
    assert_eq!(emu.start_count(), 1);
    assert_eq!(emu.stop_count(), 1);

    let result = &summary.result;
    assert!(!result.interrupted);
    assert!(result.run_warnings.is_empty(), "{:?}", result.run_warnings);
    assert!(
        result.extraction_warnings.is_empty(),
        "{:?}",
        result.extraction_warnings
    );

    // queue samples every 100 ms over the 3 s window, in order
    assert!(result.queue.len() >= 20, "{}", result.queue.len());
    assert!(result.queue.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
    assert!(result.queue.iter().all(|s| s.seconds() < 3.5));
    assert!(result.queue.iter().all(|s| s.depth < 50));

    // one probe per checkpoint at 30%, 50%, and 70%
    assert_eq!(result.probes.len(), 3);
    assert_eq!(result.fetch_times().len(), 3);
    for (probe, scheduled) in result.probes.iter().zip([0.9, 1.5, 2.1]) {
        assert!((probe.scheduled - scheduled).abs() < 1e-6);
        assert!(probe.fired_at >= probe.scheduled);
    }
    let stats = result.fetch_stats.unwrap();
    assert!((stats.mean - 0.2).abs() < 1e-9);

    // one summary per algorithm, in order of appearance
    assert_eq!(result.algorithms.len(), 2);
    let reno = result.algorithm("reno").unwrap();
    assert_eq!(reno.hosts, vec!["h1".to_string(), "h2".to_string()]);
    assert_eq!(reno.summary.avg_bitrate_mbps, 4.0);
    assert_eq!(reno.summary.total_retransmits, 8);
    let rates: Vec<f64> = reno.intervals.iter().map(|i| i.bitrate_mbps).collect();
    assert_eq!(rates, vec![3.0, 4.0, 5.0]);
    assert_eq!(reno.latency_initial_ms, Some(21.0));
    assert_eq!(reno.latency_final_ms, Some(42.0));
    assert_eq!(reno.http.as_ref().unwrap().requests, 2);
    assert_eq!(reno.http.as_ref().unwrap().download_speed_kbps, 90.0);

    let bbr = result.algorithm("bbr").unwrap();
    assert_eq!(bbr.summary.avg_bitrate_mbps, 6.0);
    assert_eq!(bbr.summary.total_retransmits, 0);
    assert_eq!(bbr.intervals.len(), 2);
    assert_eq!(bbr.http.as_ref().unwrap().download_speed_kbps, 120.0);
    for a in &result.algorithms {
        assert!(a.summary.avg_bitrate_mbps >= 0.0);
        assert!(a.intervals.iter().all(|i| i.bitrate_mbps >= 0.0));
    }

    assert_eq!(result.ping_trace.len(), 3);
    assert_eq!(result.ping_trace[2].rtt_ms, 7.5);
    assert_eq!(result.flows.len(), 13);
    assert!(result.flows.iter().all(|f| f.status == "completed"));

    // artifacts
    assert!(summary.report.is_complete(), "{:?}", summary.report.failed);
    let run_dir = &summary.run_dir;
    assert!(run_dir.starts_with(dir.path().join("data")));
    for file in [
        RESULT_FILE,
        SUMMARY_FILE,
        FETCH_TIMES_FILE,
        QUEUE_LOG,
        RAW_REPORT,
        "throughput_reno.csv",
        "throughput_bbr.csv",
    ] {
        assert!(run_dir.join(file).is_file(), "{file} is missing");
    }
    let (avg, _) = report::read_fetch_stats(run_dir.join(FETCH_TIMES_FILE))
        .unwrap()
        .unwrap();
    assert_eq!(avg, 0.2);
    let stored: ExperimentResult =
        serde_json::from_str(&fs::read_to_string(run_dir.join(RESULT_FILE)).unwrap()).unwrap();
    let summaries = |r: &ExperimentResult| r.algorithms.iter().map(|a| a.summary).collect::<Vec<_>>();
    assert_eq!(summaries(&stored), summaries(result));
    assert_eq!(stored.queue.len(), result.queue.len());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reanalyze_keeps_runtime_observations() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path().join("data"));
    let mut fixtures = Fixtures::new(dir.path().join("fixtures"), config.duration());
    let plan = plan(&config, &mut fixtures);
    let (_tx, rx) = watch::channel(false);

    let summary = Experiment::new(config, Arc::new(LoopbackEmulator::new()))
        .unwrap()
        .with_plan(plan)
        .with_probe(probe())
        .run(rx)
        .await
        .unwrap();
    fs::remove_file(summary.run_dir.join(SUMMARY_FILE)).unwrap();

    let (result, report) = reanalyze(&summary.run_dir).unwrap();
    assert!(report.is_complete());
    assert!(summary.run_dir.join(SUMMARY_FILE).is_file());
    assert_eq!(result.algorithms, summary.result.algorithms);
    assert_eq!(result.probes.len(), summary.result.probes.len());
    for (a, b) in result.probes.iter().zip(&summary.result.probes) {
        assert_eq!(a.checkpoint, b.checkpoint);
        assert!((a.fired_at - b.fired_at).abs() < 1e-9);
    }
    assert_eq!(result.queue.len(), summary.result.queue.len());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn interrupted_competition_still_writes_results() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path().join("data"));
    config.duration = 30.0;
    let mut fixtures = Fixtures::new(dir.path().join("fixtures"), config.duration());
    let h1 = config.hosts[0].clone();
    let h3 = config.hosts[2].clone();
    let plan = FlowPlan {
        competition: vec![fixtures.iperf(&h1, &reno_h1()), fixtures.endless(&h3)],
        closing: vec![fixtures.latency(&h1, Stage::Final, 40.0)],
        ..Default::default()
    };

    let emu = Arc::new(LoopbackEmulator::new());
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        tx.send_replace(true);
        // keep the sender alive until the run is over
        tokio::time::sleep(Duration::from_secs(60)).await;
    });

    let start = Instant::now();
    let summary = Experiment::new(config, emu.clone())
        .unwrap()
        .with_plan(plan)
        .with_probe(probe())
        .run(rx)
        .await
        .unwrap();
    assert!(start.elapsed() < Duration::from_secs(10));
    assert_eq!(emu.stop_count(), 1);

    let result = &summary.result;
    assert!(result.interrupted);
    assert!(result.run_warnings[0].contains("interrupted"));
    // the checkpoint at 30% of 30 s was never reached
    assert!(result.probes.is_empty());
    // the closing phase is skipped
    assert!(result.algorithm("reno").unwrap().latency_final_ms.is_none());
    assert_eq!(result.algorithm("reno").unwrap().summary.avg_bitrate_mbps, 5.0);
    assert!(!result.queue.is_empty());
    assert!(summary.run_dir.join(RESULT_FILE).is_file());
}
