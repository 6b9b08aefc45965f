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
//! Latency extraction from ping output.

use lazy_static::lazy_static;
use regex::Regex;

use crate::records::{LatencySample, RttPoint, Stage};

use super::{
    latency_title, parse_float, ping_train_title, ExtractWarning, Extraction,
    GenericSectionParser, SectionLocator, SectionParser,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingKind {
    /// `rtt min/avg/max/mdev = a/b/c/d ms`
    Rtt,
    /// `64 bytes from 10.0.0.2: icmp_seq=1 ttl=64 time=20.3 ms`
    Reply,
}

pub struct PingParser;

impl SectionParser for PingParser {
    type Kind = PingKind;

    fn description() -> &'static str {
        "ping"
    }

    fn re() -> Vec<(PingKind, Regex)> {
        vec![
            (
                PingKind::Rtt,
                Regex::new(
                    r"^(?:rtt|round-trip) min/avg/max/(?:mdev|stddev) = ([^/\s]+)/([^/\s]+)/([^/\s]+)/([^/\s]+) ms$",
                )
                .unwrap(),
            ),
            (
                PingKind::Reply,
                Regex::new(r"^\d+ bytes from .*\btime[=<](\S+?) ?ms$").unwrap(),
            ),
        ]
    }
}

lazy_static! {
    static ref PARSER: GenericSectionParser<PingKind> =
        GenericSectionParser::from_parser::<PingParser>();
}

/// Extract the average RTT of the flow tagged `tag` at the given stage. Returns `None` (plus a
/// warning) if the section or its RTT line is missing.
pub fn extract_latency(
    text: &str,
    tag: &str,
    algorithm: &str,
    stage: Stage,
) -> Extraction<Option<LatencySample>> {
    let locator = SectionLocator::new(latency_title(tag, stage));
    let section_name = locator.title().to_string();
    let mut warnings = Vec::new();

    let Some(section) = locator.locate(text) else {
        log::warn!("[extract] latency section `{section_name}` not found");
        warnings.push(ExtractWarning::MissingSection(section_name));
        return Extraction {
            value: None,
            warnings,
        };
    };

    let mut value = None;
    for line in PARSER
        .parse_section(section.body)
        .filter(|l| l.kind == PingKind::Rtt)
    {
        match line.group(2).and_then(parse_float) {
            Some(avg_rtt_ms) => {
                value = Some(LatencySample {
                    host: tag.to_string(),
                    algorithm: algorithm.to_string(),
                    stage,
                    avg_rtt_ms,
                });
                break;
            }
            None => warnings.push(ExtractWarning::MalformedLine {
                section: section_name.clone(),
                line: line.line().to_string(),
            }),
        }
    }

    if value.is_none() {
        warnings.push(ExtractWarning::MissingLine {
            section: section_name,
            what: "rtt summary".to_string(),
        });
    }

    Extraction { value, warnings }
}

/// Parse every reply of a ping trace into a point `(index * interval, rtt)`. The index only
/// advances on parsed replies.
pub fn parse_ping_trace(text: &str, interval: f64) -> Vec<RttPoint> {
    PARSER
        .parse_section(text)
        .filter(|l| l.kind == PingKind::Reply)
        .filter_map(|l| l.group(1).and_then(parse_float))
        .enumerate()
        .map(|(i, rtt_ms)| RttPoint {
            t: i as f64 * interval,
            rtt_ms,
        })
        .collect()
}

/// Extract the RTT trace of the continuous ping train started on host `tag`.
pub fn extract_ping_train(text: &str, tag: &str, interval: f64) -> Extraction<Vec<RttPoint>> {
    let locator = SectionLocator::new(ping_train_title(tag));
    match locator.locate(text) {
        Some(section) => Extraction {
            value: parse_ping_trace(section.body, interval),
            warnings: Vec::new(),
        },
        None => Extraction {
            value: Vec::new(),
            warnings: vec![ExtractWarning::MissingSection(locator.title().to_string())],
        },
    }
}
