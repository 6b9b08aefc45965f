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
//! Module to combine the metrics of all hosts of one algorithm class.
//!
//! Series of unequal length are combined index by index. At every index, only hosts whose series
//! has a value there take part: the rate is their mean (missing hosts are not counted as zero),
//! and the retransmissions are their sum (missing hosts contribute nothing).

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use ccarena_utils::stats::mean;

use crate::{
    config::{ExperimentConfig, HostSpec},
    extract::{
        curl::extract_http, iperf::extract_throughput, iperf::Throughput,
        ping::extract_latency, ping::extract_ping_train, ExtractWarning,
    },
    records::{HttpAverage, HttpTiming, IntervalMetric, LatencySample, RttPoint, Stage, SummaryMetric},
};

/// Combine the interval series of several hosts of the same algorithm class into one series.
pub fn combine(series: &[&[IntervalMetric]]) -> Vec<IntervalMetric> {
    let max_len = series.iter().map(|s| s.len()).max().unwrap_or(0);
    (0..max_len)
        .map(|i| {
            let present = series.iter().filter_map(|s| s.get(i)).collect_vec();
            let avg = |f: fn(&IntervalMetric) -> f64| {
                mean(&present.iter().map(|m| f(m)).collect_vec()).unwrap_or_default()
            };
            IntervalMetric {
                interval_start: avg(|m| m.interval_start),
                interval_end: avg(|m| m.interval_end),
                bitrate_mbps: avg(|m| m.bitrate_mbps),
                retransmits: present.iter().map(|m| m.retransmits).sum(),
            }
        })
        .collect()
}

/// Combine the session summaries of several hosts: the mean of the average bitrates, and the sum
/// of the retransmissions.
pub fn combine_summaries(summaries: &[SummaryMetric]) -> SummaryMetric {
    SummaryMetric {
        avg_bitrate_mbps: mean(&summaries.iter().map(|s| s.avg_bitrate_mbps).collect_vec())
            .unwrap_or_default(),
        total_retransmits: summaries.iter().map(|s| s.total_retransmits).sum(),
    }
}

/// Average a set of HTTP timings. The download speed is converted to KB/s.
pub fn average_http<'a>(
    label: impl Into<String>,
    timings: impl IntoIterator<Item = &'a HttpTiming>,
) -> Option<HttpAverage> {
    let timings = timings.into_iter().collect_vec();
    let avg = |f: fn(&HttpTiming) -> f64| mean(&timings.iter().map(|t| f(t)).collect_vec());
    Some(HttpAverage {
        label: label.into(),
        requests: timings.len(),
        total_time: avg(|t| t.total_time)?,
        connect_time: avg(|t| t.connect_time)?,
        transfer_time: avg(|t| t.transfer_time)?,
        download_speed_kbps: avg(|t| t.download_speed)? / 1000.0,
    })
}

/// All metrics extracted for one client host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostMetrics {
    pub host: String,
    pub algorithm: String,
    pub throughput: Throughput,
    pub latency_initial_ms: Option<f64>,
    pub latency_final_ms: Option<f64>,
    pub http: Vec<HttpTiming>,
}

impl HostMetrics {
    pub fn latency(&self, stage: Stage) -> Option<f64> {
        match stage {
            Stage::Initial => self.latency_initial_ms,
            Stage::Final => self.latency_final_ms,
        }
    }
}

/// Combined metrics of one algorithm class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlgorithmMetrics {
    pub algorithm: String,
    pub hosts: Vec<String>,
    pub intervals: Vec<IntervalMetric>,
    pub summary: SummaryMetric,
    /// Latency samples of all hosts of this class.
    pub latency: Vec<LatencySample>,
    pub latency_initial_ms: Option<f64>,
    pub latency_final_ms: Option<f64>,
    pub http: Option<HttpAverage>,
}

/// Everything derived from the raw output of one run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Analysis {
    pub hosts: Vec<HostMetrics>,
    pub algorithms: Vec<AlgorithmMetrics>,
    /// HTTP averages per host
    pub http_hosts: Vec<HttpAverage>,
    pub ping_trace: Vec<RttPoint>,
    pub warnings: Vec<ExtractWarning>,
}

/// Extracts the metrics of every host of a run from its raw report, and combines them per
/// algorithm class.
pub struct MetricsAggregator<'a> {
    config: &'a ExperimentConfig,
}

impl<'a> MetricsAggregator<'a> {
    pub fn new(config: &'a ExperimentConfig) -> Self {
        Self { config }
    }

    pub fn analyze(&self, raw: &str) -> Analysis {
        let mut warnings = Vec::new();
        let hosts = self
            .config
            .hosts
            .iter()
            .map(|h| {
                let (metrics, w) = self.extract_host(raw, h);
                warnings.extend(w);
                metrics
            })
            .collect_vec();

        let http_hosts = hosts
            .iter()
            .filter_map(|h| average_http(&h.host, &h.http))
            .collect_vec();

        let ping_trace = match self.config.hosts.first() {
            Some(first) => {
                let interval = self.config.ping_train_interval().as_secs_f64();
                let trace = extract_ping_train(raw, &first.name, interval);
                warnings.extend(trace.warnings);
                trace.value
            }
            None => Vec::new(),
        };

        if !warnings.is_empty() {
            log::warn!("[aggregate] {} warnings while extracting metrics", warnings.len());
        }
        Analysis {
            algorithms: self.aggregate(&hosts),
            hosts,
            http_hosts,
            ping_trace,
            warnings,
        }
    }

    /// Extract the metrics of a single host.
    pub fn extract_host(&self, raw: &str, host: &HostSpec) -> (HostMetrics, Vec<ExtractWarning>) {
        let mut warnings = Vec::new();
        let throughput = extract_throughput(raw, &host.name);
        warnings.extend(throughput.warnings);

        let mut latency = |stage| {
            if self.config.ping_count == 0 {
                return None;
            }
            let sample = extract_latency(raw, &host.name, &host.algorithm, stage);
            warnings.extend(sample.warnings);
            sample.value.map(|s| s.avg_rtt_ms)
        };
        let latency_initial_ms = latency(Stage::Initial);
        let latency_final_ms = latency(Stage::Final);

        let http = if self.config.http_fetches > 0 {
            let http = extract_http(raw, &host.name);
            warnings.extend(http.warnings);
            http.value
        } else {
            Vec::new()
        };

        let metrics = HostMetrics {
            host: host.name.clone(),
            algorithm: host.algorithm.clone(),
            throughput: throughput.value,
            latency_initial_ms,
            latency_final_ms,
            http,
        };
        (metrics, warnings)
    }

    /// Combine the host metrics per algorithm class, in the order in which the algorithms first
    /// appear in the configuration.
    pub fn aggregate(&self, hosts: &[HostMetrics]) -> Vec<AlgorithmMetrics> {
        self.config
            .algorithms()
            .into_iter()
            .map(|algorithm| {
                let members = hosts.iter().filter(|h| h.algorithm == algorithm).collect_vec();
                let series = members
                    .iter()
                    .map(|h| h.throughput.intervals.as_slice())
                    .collect_vec();
                // hosts without any throughput section are not part of the summary
                let summaries = members
                    .iter()
                    .filter(|h| h.throughput.found)
                    .map(|h| h.throughput.summary)
                    .collect_vec();

                let latency = members
                    .iter()
                    .flat_map(|h| {
                        [Stage::Initial, Stage::Final].into_iter().filter_map(|stage| {
                            Some(LatencySample {
                                host: h.host.clone(),
                                algorithm: algorithm.to_string(),
                                stage,
                                avg_rtt_ms: h.latency(stage)?,
                            })
                        })
                    })
                    .collect_vec();
                let stage_mean = |stage| {
                    mean(
                        &latency
                            .iter()
                            .filter(|s| s.stage == stage)
                            .map(|s| s.avg_rtt_ms)
                            .collect_vec(),
                    )
                };

                AlgorithmMetrics {
                    algorithm: algorithm.to_string(),
                    hosts: members.iter().map(|h| h.host.clone()).collect(),
                    intervals: combine(&series),
                    summary: combine_summaries(&summaries),
                    latency_initial_ms: stage_mean(Stage::Initial),
                    latency_final_ms: stage_mean(Stage::Final),
                    latency,
                    http: average_http(algorithm, members.iter().copied().flat_map(|h| &h.http)),
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn interval(i: usize, bitrate_mbps: f64, retransmits: u64) -> IntervalMetric {
        IntervalMetric {
            interval_start: i as f64,
            interval_end: i as f64 + 1.0,
            bitrate_mbps,
            retransmits,
        }
    }

    #[test]
    fn combine_unequal_series() {
        let a = [interval(0, 10.0, 1), interval(1, 20.0, 2)];
        let b = [interval(0, 30.0, 3)];
        let combined = combine(&[&a, &b]);
        assert_eq!(combined.len(), 2);
        assert_eq!(combined[0].retransmits, 4);
        assert_eq!(combined[1].retransmits, 2);
        assert_eq!(combined[0].bitrate_mbps, 20.0);
        // only A has an interval at index 1, B is not counted as zero
        assert_eq!(combined[1].bitrate_mbps, 20.0);
        assert_eq!(combined[1].interval_end, 2.0);
    }

    #[test]
    fn combine_nothing() {
        assert!(combine(&[]).is_empty());
        assert!(combine(&[&[], &[]]).is_empty());
        assert_eq!(combine_summaries(&[]), SummaryMetric::default());
    }

    #[test]
    fn summaries() {
        let s = combine_summaries(&[
            SummaryMetric {
                avg_bitrate_mbps: 4.0,
                total_retransmits: 10,
            },
            SummaryMetric {
                avg_bitrate_mbps: 6.0,
                total_retransmits: 5,
            },
        ]);
        assert_eq!(s.avg_bitrate_mbps, 5.0);
        assert_eq!(s.total_retransmits, 15);
    }

    #[test]
    fn http_average_in_kbps() {
        let timing = |total_time, download_speed| HttpTiming {
            host: "h1".to_string(),
            seq: 1,
            total_time,
            connect_time: 0.01,
            transfer_time: 0.02,
            download_speed,
            size_bytes: None,
            http_code: Some(200),
        };
        let timings = [timing(0.1, 1000.0), timing(0.3, 3000.0)];
        let avg = average_http("h1", &timings).unwrap();
        assert_eq!(avg.requests, 2);
        assert!((avg.total_time - 0.2).abs() < 1e-9);
        assert_eq!(avg.download_speed_kbps, 2.0);
        assert_eq!(average_http("h1", &Vec::new()), None);
    }

    fn iperf(host: &str, rates: &[f64], summary: Option<(f64, u64)>) -> String {
        let mut out = format!("=== IPERF3 {host} ===\n");
        for (i, r) in rates.iter().enumerate() {
            out += &format!(
                "[  5]   {i}.00-{}.00   sec  1.00 MBytes  {r} Mbits/sec    1   43.8 KBytes\n",
                i + 1
            );
        }
        if let Some((rate, retr)) = summary {
            out += &format!(
                "[  5]   0.00-{}.00  sec  5.00 MBytes  {rate} Mbits/sec  {retr}             sender\n",
                rates.len()
            );
        }
        out + "\niperf Done.\n"
    }

    #[test]
    fn analyze_groups_by_algorithm() {
        let mut config = ExperimentConfig::new(10.0, 10.0);
        config.hosts = vec![
            HostSpec::new("h1", "reno"),
            HostSpec::new("h2", "bbr"),
            HostSpec::new("h3", "reno"),
        ];
        config.http_fetches = 0;
        config.ping_count = 0;
        let raw = iperf("h1", &[2.0, 4.0], Some((3.0, 2)))
            + &iperf("h2", &[8.0], Some((8.0, 7)))
            + &iperf("h3", &[6.0], None);

        let analysis = MetricsAggregator::new(&config).analyze(&raw);
        assert_eq!(analysis.algorithms.len(), 2);
        let reno = &analysis.algorithms[0];
        assert_eq!(reno.algorithm, "reno");
        assert_eq!(reno.hosts, vec!["h1", "h3"]);
        assert_eq!(reno.intervals.len(), 2);
        assert_eq!(reno.intervals[0].bitrate_mbps, 4.0);
        assert_eq!(reno.intervals[0].retransmits, 2);
        assert_eq!(reno.intervals[1].bitrate_mbps, 4.0);
        // h3 has a section without a sender line and contributes a zero summary
        assert_eq!(reno.summary.avg_bitrate_mbps, 1.5);
        assert_eq!(reno.summary.total_retransmits, 2);
        assert_eq!(analysis.algorithms[1].summary.avg_bitrate_mbps, 8.0);

        // missing sender line of h3, missing ping train
        assert_eq!(analysis.warnings.len(), 2);
    }

    #[test]
    fn missing_host_is_excluded_from_summary() {
        let mut config = ExperimentConfig::new(10.0, 10.0);
        config.hosts = vec![HostSpec::new("h1", "reno"), HostSpec::new("h2", "reno")];
        let raw = iperf("h1", &[2.0], Some((2.0, 1)))
            + "=== LATENCY h1 ===\nrtt min/avg/max/mdev = 20.1/20.5/21.0/0.3 ms\n"
            + "=== LATENCY h1_Final ===\nrtt min/avg/max/mdev = 30.1/31.5/33.0/0.9 ms\n"
            + "=== LATENCY h2 ===\nrtt min/avg/max/mdev = 20.1/22.5/21.0/0.3 ms\n";

        let analysis = MetricsAggregator::new(&config).analyze(&raw);
        let reno = &analysis.algorithms[0];
        assert_eq!(reno.summary.avg_bitrate_mbps, 2.0);
        assert_eq!(reno.latency.len(), 3);
        assert_eq!(reno.latency_initial_ms, Some(21.5));
        assert_eq!(reno.latency_final_ms, Some(31.5));
        assert!(reno.http.is_none());
        assert!(analysis.http_hosts.is_empty());
        assert!(analysis
            .warnings
            .contains(&ExtractWarning::MissingSection("IPERF3 h2".to_string())));
    }
}
