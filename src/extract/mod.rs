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
//! Module to turn the raw textual output of the traffic and probing tools into typed records.
//!
//! Raw output is organized in sections, each opened by a marker line `=== <TITLE> ===`. A
//! [`SectionLocator`] finds the body of a section, and a [`GenericSectionParser`] matches each line
//! of that body against a set of regexes, returning which regex matched and its capture groups.
//! The tool-specific modules turn those matches into records.
//!
//! Extraction never fails. A missing section yields an empty result plus an [`ExtractWarning`],
//! and a malformed line is skipped with a warning.

pub mod curl;
pub mod iperf;
pub mod ping;

use std::{fmt::Debug, str::FromStr};

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::records::Stage;

/// Terminator line printed by iperf3 after the session summary.
pub const IPERF_TERMINATOR: &str = "iperf Done.";

/// Format the marker line opening a section.
pub fn marker(title: &str) -> String {
    format!("=== {title} ===")
}

/// Title of the throughput section of a flow.
pub fn iperf_title(tag: &str) -> String {
    format!("IPERF3 {tag}")
}

/// Title of the latency section of a flow at the given stage.
pub fn latency_title(tag: &str, stage: Stage) -> String {
    format!("LATENCY {tag}{}", stage.marker_suffix())
}

/// Title of the HTTP timing sections of a flow. The request sequence number is appended as
/// `_<seq>`.
pub fn http_title(tag: &str) -> String {
    format!("METRICS {tag}")
}

/// Title of the section holding the continuous ping train of a host.
pub fn ping_train_title(tag: &str) -> String {
    format!("PING TRAIN {tag}")
}

/// Non-fatal problem found while extracting metrics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum ExtractWarning {
    #[error("Section `{0}` not found")]
    MissingSection(String),
    #[error("Section `{0}` is not terminated")]
    MissingTerminator(String),
    #[error("Section `{section}` contains no {what}")]
    MissingLine { section: String, what: String },
    #[error("Section `{section}`: skipped malformed line `{line}`")]
    MalformedLine { section: String, line: String },
    #[error("Section `{section}`: skipped interval `{line}` overlapping the previous one")]
    OverlappingInterval { section: String, line: String },
}

/// Result of an extraction, together with all warnings raised while producing it.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Extraction<T> {
    pub value: T,
    pub warnings: Vec<ExtractWarning>,
}

lazy_static! {
    static ref MARKER: Regex = Regex::new(r"(?m)^=== (.+?) ===[ \t\r]*$").unwrap();
}

/// A located section of raw text.
#[derive(Debug, Clone, PartialEq)]
pub struct Section<'a> {
    pub title: &'a str,
    /// Sequence number for numbered sections.
    pub seq: Option<usize>,
    /// Everything after the marker line, up to the terminator, the next marker, or the end.
    pub body: &'a str,
    /// Whether the terminator line was found. Always true if the locator has no terminator.
    pub terminated: bool,
}

/// Finds sections by their title.
#[derive(Debug, Clone)]
pub struct SectionLocator {
    title: String,
    numbered: bool,
    terminator: Option<&'static str>,
}

impl SectionLocator {
    /// Locate sections whose title is exactly `title`.
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            numbered: false,
            terminator: None,
        }
    }

    /// Locate sections titled `<title>_<seq>` instead.
    pub fn numbered(mut self) -> Self {
        self.numbered = true;
        self
    }

    /// The section ends at the first line equal to `terminator`.
    pub fn terminated_by(mut self, terminator: &'static str) -> Self {
        self.terminator = Some(terminator);
        self
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    fn matches(&self, title: &str) -> Option<Option<usize>> {
        if !self.numbered {
            return (title == self.title).then_some(None);
        }
        let seq = title.strip_prefix(self.title.as_str())?.strip_prefix('_')?;
        if seq.is_empty() || !seq.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        seq.parse().ok().map(Some)
    }

    /// Locate all matching sections, in order of appearance.
    pub fn locate_all<'a>(&self, text: &'a str) -> Vec<Section<'a>> {
        let markers: Vec<_> = MARKER.captures_iter(text).collect();
        let mut sections = Vec::new();
        for (i, caps) in markers.iter().enumerate() {
            let (Some(full), Some(title)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            let Some(seq) = self.matches(title.as_str()) else {
                continue;
            };
            let end = markers
                .get(i + 1)
                .and_then(|next| next.get(0))
                .map(|m| m.start())
                .unwrap_or(text.len());
            let mut body = &text[full.end()..end];
            let mut terminated = true;
            if let Some(terminator) = self.terminator {
                match find_line(body, terminator) {
                    Some(pos) => body = &body[..pos],
                    None => terminated = false,
                }
            }
            sections.push(Section {
                title: title.as_str(),
                seq,
                body,
                terminated,
            });
        }
        sections
    }

    /// Locate the first matching section.
    pub fn locate<'a>(&self, text: &'a str) -> Option<Section<'a>> {
        self.locate_all(text).into_iter().next()
    }
}

/// Byte offset of the first line of `text` that equals `line` after trimming.
fn find_line(text: &str, line: &str) -> Option<usize> {
    let mut offset = 0;
    for l in text.split_inclusive('\n') {
        if l.trim() == line {
            return Some(offset);
        }
        offset += l.len();
    }
    None
}

/// Set of regexes matching the lines of one kind of section.
pub trait SectionParser {
    type Kind: Clone + Debug + PartialEq;

    /// Return a description of the parsed tool output.
    fn description() -> &'static str;

    /// Return the list of all regexes. Earlier regexes take precedence.
    fn re() -> Vec<(Self::Kind, Regex)>;
}

/// A line matched by one of the regexes of a [`GenericSectionParser`]. `groups[0]` holds the
/// entire line.
#[derive(Debug, Clone, PartialEq)]
pub struct GenericLine<T> {
    pub kind: T,
    pub groups: Vec<String>,
}

impl<T> GenericLine<T> {
    pub fn line(&self) -> &str {
        self.groups.first().map(String::as_str).unwrap_or_default()
    }

    pub fn group(&self, i: usize) -> Option<&str> {
        self.groups.get(i).map(String::as_str)
    }
}

pub struct GenericSectionParser<T> {
    re: Vec<(T, Regex)>,
}

impl<T: Clone> GenericSectionParser<T> {
    pub fn new(re: Vec<(T, Regex)>) -> Self {
        Self { re }
    }

    pub fn from_parser<P: SectionParser<Kind = T>>() -> Self {
        Self::new(P::re())
    }

    pub fn parse_line(&self, line: &str) -> Option<GenericLine<T>> {
        let line = line.trim_end();
        for (t, re) in &self.re {
            if let Some(m) = re.captures(line) {
                let groups = m
                    .iter()
                    .map(|x| x.map(|x| x.as_str().to_string()).unwrap_or_default())
                    .collect();
                return Some(GenericLine {
                    kind: t.clone(),
                    groups,
                });
            }
        }
        None
    }

    /// Match all lines of a section body, skipping the lines no regex matches.
    pub fn parse_section<'a>(&'a self, body: &'a str) -> impl Iterator<Item = GenericLine<T>> + 'a {
        body.lines().filter_map(|l| self.parse_line(l))
    }
}

impl<T: Clone + Debug + PartialEq> GenericSectionParser<T> {
    #[cfg(test)]
    #[track_caller]
    /// Test whether a given line matches. The expected groups *must not* contain the group 0
    /// (which matches the entire line), but immediately start with the first one.
    pub fn test_line<const N: usize>(&self, line: &str, exp: Option<(T, [&str; N])>) {
        match (self.parse_line(line), exp) {
            (Some(got), Some((want_kind, want_groups))) => {
                assert_eq!(got.kind, want_kind, "Invalid line kind");
                assert_eq!(
                    got.groups.len() - 1,
                    want_groups.len(),
                    "Unexpected number of matched groups."
                );
                for (i, (got_g, want_g)) in got
                    .groups
                    .iter()
                    .map(String::as_str)
                    .skip(1)
                    .zip(want_groups)
                    .enumerate()
                {
                    assert_eq!(got_g, want_g, "Capture group {} doesn't match", i + 1)
                }
            }
            (None, None) => {}
            (Some(got), None) => panic!(
                "Line matched with kind {:?} and groups {:?}",
                got.kind,
                &got.groups[1..]
            ),
            (None, Some((want_kind, want_groups))) => {
                panic!("Line did not match. Expected kind {want_kind:?} and groups {want_groups:?}",)
            }
        }
    }
}

pub fn parse_num(num: impl AsRef<str>) -> Option<u64> {
    u64::from_str(num.as_ref()).ok()
}

/// Parse a non-negative decimal number, accepting both `.` and `,` as decimal separator.
pub fn parse_float(num: impl AsRef<str>) -> Option<f64> {
    let x = f64::from_str(&num.as_ref().trim().replace(',', ".")).ok()?;
    (x.is_finite() && x >= 0.0).then_some(x)
}
