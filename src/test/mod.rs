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
//! End-to-end tests running whole experiments on the loopback emulator.
//!
//! Every tool is replaced by `cat` of a canned output file, so the tests exercise the scheduler,
//! the flow runner, the sampler, extraction, aggregation, and the artifacts, without requiring
//! iperf3, ping, or curl.

use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{
    config::{ExperimentConfig, HostSpec},
    experiments::{Flow, FlowKind},
    extract::{http_title, iperf_title, latency_title, ping_train_title},
    records::{FlowRole, Stage},
};

mod competition;

/// Throughput of a canned iperf3 client: one rate per 1 s interval, and the sender summary.
pub struct IperfFixture {
    pub rates: Vec<f64>,
    pub retransmits: Vec<u64>,
    pub avg: f64,
}

impl IperfFixture {
    pub fn output(&self) -> String {
        let mut out = String::from(
            "Connecting to host 127.0.0.1, port 5201\n\
             [  5] local 127.0.0.1 port 43210 connected to 127.0.0.1 port 5201\n\
             [ ID] Interval           Transfer     Bitrate         Retr  Cwnd\n",
        );
        for (i, (rate, retr)) in self.rates.iter().zip(&self.retransmits).enumerate() {
            out.push_str(&format!(
                "[  5]   {i}.00-{}.00   sec  1.00 MBytes  {rate:.2} Mbits/sec  {retr:>3}   84.8 KBytes\n",
                i + 1
            ));
        }
        let n = self.rates.len();
        let total: u64 = self.retransmits.iter().sum();
        out.push_str(&format!(
            "- - - - - - - - - - - - - - - - - - - - - - - - -\n\
             [ ID] Interval           Transfer     Bitrate         Retr\n\
             [  5]   0.00-{n}.00   sec  3.00 MBytes  {:.2} Mbits/sec  {total:>3}             sender\n\
             [  5]   0.00-{n}.05   sec  2.90 MBytes  {:.2} Mbits/sec                  receiver\n\
             \n\
             iperf Done.\n",
            self.avg, self.avg
        ));
        out
    }
}

pub fn ping_output(avg_rtt_ms: f64) -> String {
    format!(
        "PING 127.0.0.1 (127.0.0.1) 56(84) bytes of data.\n\
         64 bytes from 127.0.0.1: icmp_seq=1 ttl=64 time={avg_rtt_ms} ms\n\
         \n\
         --- 127.0.0.1 ping statistics ---\n\
         1 packets transmitted, 1 received, 0% packet loss, time 0ms\n\
         rtt min/avg/max/mdev = {avg_rtt_ms:.3}/{avg_rtt_ms:.3}/{avg_rtt_ms:.3}/0.000 ms\n"
    )
}

pub fn ping_train_output(rtts: &[f64]) -> String {
    rtts.iter()
        .enumerate()
        .map(|(i, rtt)| format!("64 bytes from 127.0.0.1: icmp_seq={} ttl=64 time={rtt} ms\n", i + 1))
        .collect()
}

pub fn http_output(total: f64, speed: f64) -> String {
    format!(
        "Total time: {total}s\n\
         Connect time: 0.1s\n\
         Transfer time: 0.3s\n\
         Download speed: {speed} bytes/s\n\
         Downloaded size: 50000 bytes\n\
         HTTP code: 200\n"
    )
}

/// Builds flows that print canned output below the section header of the real tool.
pub struct Fixtures {
    dir: PathBuf,
    count: usize,
    duration: Duration,
}

impl Fixtures {
    pub fn new(dir: impl AsRef<Path>, duration: Duration) -> Self {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).unwrap();
        Self {
            dir,
            count: 0,
            duration,
        }
    }

    /// Flow that prints `content` below `=== <header> ===`.
    pub fn flow(&mut self, host: &HostSpec, header: String, content: &str) -> Flow {
        self.count += 1;
        let path = self.dir.join(format!("fixture_{}.txt", self.count));
        fs::write(&path, content).unwrap();
        Flow {
            host: host.name.clone(),
            role: FlowRole::Client,
            algorithm: host.algorithm.clone(),
            start_offset: Duration::ZERO,
            duration: self.duration,
            kind: FlowKind::Custom {
                program: "cat".to_string(),
                args: vec![path.display().to_string()],
                header: Some(header),
            },
        }
    }

    pub fn iperf(&mut self, host: &HostSpec, fixture: &IperfFixture) -> Flow {
        self.flow(host, iperf_title(&host.name), &fixture.output())
    }

    pub fn latency(&mut self, host: &HostSpec, stage: Stage, avg_rtt_ms: f64) -> Flow {
        self.flow(host, latency_title(&host.name, stage), &ping_output(avg_rtt_ms))
    }

    pub fn http(&mut self, host: &HostSpec, seq: usize, total: f64, speed: f64) -> Flow {
        self.flow(
            host,
            format!("{}_{seq}", http_title(&host.name)),
            &http_output(total, speed),
        )
    }

    pub fn ping_train(&mut self, host: &HostSpec, rtts: &[f64]) -> Flow {
        self.flow(host, ping_train_title(&host.name), &ping_train_output(rtts))
    }

    /// Flow that runs until it is cancelled.
    pub fn endless(&mut self, host: &HostSpec) -> Flow {
        Flow {
            host: host.name.clone(),
            role: FlowRole::Client,
            algorithm: host.algorithm.clone(),
            start_offset: Duration::ZERO,
            duration: self.duration,
            kind: FlowKind::Custom {
                program: "sleep".to_string(),
                args: vec!["60".to_string()],
                header: None,
            },
        }
    }
}

/// Configuration of a short competition of two reno hosts against one bbr host.
pub fn config(out_dir: impl AsRef<Path>) -> ExperimentConfig {
    let mut config = ExperimentConfig::new(10.0, 5.0);
    config.name = "e2e".to_string();
    config.hosts = vec![
        HostSpec::new("h1", "reno"),
        HostSpec::new("h2", "reno"),
        HostSpec::new("h3", "bbr"),
    ];
    config.duration = 3.0;
    config.http_fetches = 1;
    config.ping_count = 1;
    config.grace_period_ms = 1_000;
    config.out_dir = out_dir.as_ref().to_path_buf();
    config
}
