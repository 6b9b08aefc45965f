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
//! Throughput extraction from iperf3 client output.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::records::{IntervalMetric, SummaryMetric};

use super::{
    iperf_title, parse_float, parse_num, ExtractWarning, Extraction, GenericLine,
    GenericSectionParser, SectionLocator, SectionParser, IPERF_TERMINATOR,
};

/// Intervals may touch, but not overlap by more than this (in seconds).
const OVERLAP_TOLERANCE: f64 = 1e-3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IperfKind {
    Summary,
    Interval,
}

pub struct IperfParser;

impl SectionParser for IperfParser {
    type Kind = IperfKind;

    fn description() -> &'static str {
        "iperf3"
    }

    fn re() -> Vec<(IperfKind, Regex)> {
        vec![
            (
                IperfKind::Summary,
                Regex::new(
                    r"^\[\s*\d+\]\s+([0-9]\S*)-([0-9]\S*)\s+sec\s+.*?([0-9]\S*)\s+([KMG]?)bits/sec\s+([0-9]\S*)\s+sender$",
                ).unwrap(),
            ),
            (
                IperfKind::Interval,
                Regex::new(
                    r"^\[\s*\d+\]\s+([0-9]\S*)-([0-9]\S*)\s+sec\s+.*?([0-9]\S*)\s+([KMG]?)bits/sec\s+([0-9]\S*)(?:\s+\S+\s+[KMG]?Bytes)?$",
                ).unwrap(),
            ),
        ]
    }
}

lazy_static! {
    static ref PARSER: GenericSectionParser<IperfKind> =
        GenericSectionParser::from_parser::<IperfParser>();
}

/// Throughput of a single flow.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Throughput {
    /// Whether the section of the flow was found at all.
    pub found: bool,
    pub intervals: Vec<IntervalMetric>,
    /// Session summary from the sender line, or zero if there is none.
    pub summary: SummaryMetric,
}

/// Normalize a rate with the given unit prefix to Mbit/s.
pub fn normalize_rate(value: f64, unit: &str) -> Option<f64> {
    match unit {
        "" => Some(value / 1e6),
        "K" => Some(value / 1e3),
        "M" => Some(value),
        "G" => Some(value * 1e3),
        _ => None,
    }
}

/// Parse the groups `(start, end, rate, unit, retransmits)` shared by both kinds of lines.
fn parse_report(line: &GenericLine<IperfKind>) -> Option<IntervalMetric> {
    let interval_start = line.group(1).and_then(parse_float)?;
    let interval_end = line.group(2).and_then(parse_float)?;
    let rate = line.group(3).and_then(parse_float)?;
    let bitrate_mbps = normalize_rate(rate, line.group(4)?)?;
    let retransmits = line.group(5).and_then(parse_num)?;
    (interval_end >= interval_start).then_some(IntervalMetric {
        interval_start,
        interval_end,
        bitrate_mbps,
        retransmits,
    })
}

/// Extract the per-interval reports and the session summary of the flow tagged `tag`.
pub fn extract_throughput(text: &str, tag: &str) -> Extraction<Throughput> {
    let locator = SectionLocator::new(iperf_title(tag)).terminated_by(IPERF_TERMINATOR);
    let section_name = locator.title().to_string();
    let mut warnings = Vec::new();

    let Some(section) = locator.locate(text) else {
        log::warn!("[extract] {} section `{section_name}` not found", IperfParser::description());
        warnings.push(ExtractWarning::MissingSection(section_name));
        return Extraction {
            value: Throughput::default(),
            warnings,
        };
    };
    if !section.terminated {
        warnings.push(ExtractWarning::MissingTerminator(section_name.clone()));
    }

    let mut intervals: Vec<IntervalMetric> = Vec::new();
    let mut summary = None;
    for line in PARSER.parse_section(section.body) {
        let Some(report) = parse_report(&line) else {
            warnings.push(ExtractWarning::MalformedLine {
                section: section_name.clone(),
                line: line.line().to_string(),
            });
            continue;
        };
        match line.kind {
            IperfKind::Interval => {
                if intervals
                    .last()
                    .is_some_and(|prev| report.interval_start < prev.interval_end - OVERLAP_TOLERANCE)
                {
                    warnings.push(ExtractWarning::OverlappingInterval {
                        section: section_name.clone(),
                        line: line.line().to_string(),
                    });
                    continue;
                }
                intervals.push(report);
            }
            IperfKind::Summary => {
                if summary.is_none() {
                    summary = Some(SummaryMetric {
                        avg_bitrate_mbps: report.bitrate_mbps,
                        total_retransmits: report.retransmits,
                    });
                }
            }
        }
    }

    if summary.is_none() {
        warnings.push(ExtractWarning::MissingLine {
            section: section_name.clone(),
            what: "sender summary".to_string(),
        });
    }
    if intervals.is_empty() {
        warnings.push(ExtractWarning::MissingLine {
            section: section_name,
            what: "interval report".to_string(),
        });
    }

    Extraction {
        value: Throughput {
            found: true,
            intervals,
            summary: summary.unwrap_or_default(),
        },
        warnings,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn parser() -> GenericSectionParser<IperfKind> {
        GenericSectionParser::from_parser::<IperfParser>()
    }

    const OUTPUT: &str = "\
=== IPERF3 h1 ===
Connecting to host 10.0.0.3, port 5201
[  5] local 10.0.0.1 port 43210 connected to 10.0.0.3 port 5201
[ ID] Interval           Transfer     Bitrate         Retr  Cwnd
[  5]   0.00-1.00   sec  1.12 MBytes  9.38 Mbits/sec    0   84.8 KBytes
[  5]   1.00-2.00   sec  1.06 MBytes  8.91 Mbits/sec   12   41.0 KBytes
[  5]   2.00-3.00   sec  62.5 KBytes   512 Kbits/sec    3   22.6 KBytes
- - - - - - - - - - - - - - - - - - - - - - - - -
[ ID] Interval           Transfer     Bitrate         Retr
[  5]   0.00-3.00   sec  2.24 MBytes  6.27 Mbits/sec   15             sender
[  5]   0.00-3.05   sec  2.10 MBytes  5.78 Mbits/sec                  receiver

iperf Done.
";

    #[test]
    fn interval_line() {
        parser().test_line(
            "[  5]   0.00-1.00   sec  1.12 MBytes  9.38 Mbits/sec    0   84.8 KBytes",
            Some((IperfKind::Interval, ["0.00", "1.00", "9.38", "M", "0"])),
        )
    }

    #[test]
    fn interval_line_raw_bits() {
        parser().test_line(
            "[  5]   4.00-5.00   sec  0.00 Bytes  0.00 bits/sec    2   1.41 KBytes",
            Some((IperfKind::Interval, ["4.00", "5.00", "0.00", "", "2"])),
        )
    }

    #[test]
    fn interval_line_without_cwnd() {
        parser().test_line(
            "[  4]  9.00-10.00  sec   640 KBytes  5.24 Mbits/sec    1",
            Some((IperfKind::Interval, ["9.00", "10.00", "5.24", "M", "1"])),
        )
    }

    #[test]
    fn sender_line() {
        parser().test_line(
            "[  5]   0.00-10.00  sec  11.2 MBytes  9.42 Mbits/sec  123             sender",
            Some((IperfKind::Summary, ["0.00", "10.00", "9.42", "M", "123"])),
        )
    }

    #[test]
    fn receiver_line() {
        parser().test_line::<0>(
            "[  5]   0.00-10.04  sec  11.0 MBytes  9.19 Mbits/sec                  receiver",
            None,
        )
    }

    #[test]
    fn header_lines() {
        parser().test_line::<0>(
            "[ ID] Interval           Transfer     Bitrate         Retr  Cwnd",
            None,
        );
        parser().test_line::<0>("- - - - - - - - - - - - - - - - - - - - - - - - -", None);
    }

    #[test]
    fn unit_normalization() {
        assert_eq!(normalize_rate(500.0, "K"), Some(0.5));
        assert_eq!(normalize_rate(2_000_000.0, ""), Some(2.0));
        assert_eq!(normalize_rate(5.0, "M"), Some(5.0));
        assert_eq!(normalize_rate(1.5, "G"), Some(1500.0));
        assert_eq!(normalize_rate(1.0, "T"), None);
    }

    #[test]
    fn extract() {
        let Extraction { value, warnings } = extract_throughput(OUTPUT, "h1");
        assert!(warnings.is_empty(), "{warnings:?}");
        assert!(value.found);
        assert_eq!(value.intervals.len(), 3);
        assert_eq!(value.intervals[1].interval_end, 2.0);
        assert_eq!(value.intervals[1].retransmits, 12);
        assert_eq!(value.intervals[2].bitrate_mbps, 0.512);
        assert_eq!(value.summary.avg_bitrate_mbps, 6.27);
        assert_eq!(value.summary.total_retransmits, 15);
    }

    #[test]
    fn missing_section() {
        let Extraction { value, warnings } = extract_throughput(OUTPUT, "h2");
        assert!(!value.found);
        assert!(value.intervals.is_empty());
        assert_eq!(value.summary, SummaryMetric::default());
        assert_eq!(
            warnings,
            vec![ExtractWarning::MissingSection("IPERF3 h2".to_string())]
        );
    }

    #[test]
    fn malformed_and_overlapping_lines() {
        let text = "\
=== IPERF3 h1 ===
[  5]   0.00-1.00   sec  1.12 MBytes  9.38 Mbits/sec    0   84.8 KBytes
[  5]   1.00-2.00   sec  1.06 MBytes  8.9.1 Mbits/sec   12   41.0 KBytes
[  5]   0.50-1.50   sec  1.06 MBytes  8.00 Mbits/sec    1   41.0 KBytes
[  5]   1.00-2.00   sec  1.06 MBytes  7.00 Mbits/sec    2   41.0 KBytes
";
        let Extraction { value, warnings } = extract_throughput(text, "h1");
        assert!(value.found);
        assert_eq!(value.intervals.len(), 2);
        assert_eq!(value.intervals[1].bitrate_mbps, 7.0);
        assert_eq!(value.summary, SummaryMetric::default());
        assert!(warnings.contains(&ExtractWarning::MissingTerminator("IPERF3 h1".to_string())));
        assert!(warnings
            .iter()
            .any(|w| matches!(w, ExtractWarning::MalformedLine { line, .. } if line.contains("8.9.1"))));
        assert!(warnings
            .iter()
            .any(|w| matches!(w, ExtractWarning::OverlappingInterval { line, .. } if line.contains("0.50-1.50"))));
        assert!(warnings
            .iter()
            .any(|w| matches!(w, ExtractWarning::MissingLine { what, .. } if what == "sender summary")));
    }

    #[test]
    fn other_flows_are_ignored() {
        let text = format!("{OUTPUT}\n=== IPERF3 h2 ===\n[  5]   0.00-1.00   sec  1.12 MBytes  1.00 Mbits/sec    9   84.8 KBytes\niperf Done.\n");
        let h1 = extract_throughput(&text, "h1").value;
        let h2 = extract_throughput(&text, "h2").value;
        assert_eq!(h1.intervals.len(), 3);
        assert_eq!(h2.intervals.len(), 1);
        assert_eq!(h2.intervals[0].retransmits, 9);
    }
}
