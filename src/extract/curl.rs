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
//! HTTP timing extraction from curl output.

use lazy_static::lazy_static;
use regex::Regex;

use crate::records::HttpTiming;

use super::{
    http_title, parse_float, parse_num, ExtractWarning, Extraction, GenericSectionParser,
    SectionLocator, SectionParser,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum CurlKind {
    #[strum(serialize = "total time")]
    TotalTime,
    #[strum(serialize = "connect time")]
    ConnectTime,
    #[strum(serialize = "transfer time")]
    TransferTime,
    #[strum(serialize = "download speed")]
    DownloadSpeed,
    #[strum(serialize = "downloaded size")]
    DownloadSize,
    #[strum(serialize = "http code")]
    HttpCode,
}

/// The `-w` template passed to curl. Renders one numbered `METRICS` section per request.
pub fn write_out_template(tag: &str, seq: usize) -> String {
    format!(
        "\n=== {}_{seq} ===\n\
         Total time: %{{time_total}}s\n\
         Connect time: %{{time_connect}}s\n\
         Transfer time: %{{time_starttransfer}}s\n\
         Download speed: %{{speed_download}} bytes/s\n\
         Downloaded size: %{{size_download}} bytes\n\
         HTTP code: %{{http_code}}\n",
        http_title(tag)
    )
}

/// `-w` template of a probe fetch: the bare total time.
pub const FETCH_TIME_TEMPLATE: &str = "%{time_total}";

pub struct CurlParser;

impl SectionParser for CurlParser {
    type Kind = CurlKind;

    fn description() -> &'static str {
        "curl"
    }

    fn re() -> Vec<(CurlKind, Regex)> {
        vec![
            (
                CurlKind::TotalTime,
                Regex::new(r"^Total time: (\S+?)s$").unwrap(),
            ),
            (
                CurlKind::ConnectTime,
                Regex::new(r"^Connect time: (\S+?)s$").unwrap(),
            ),
            (
                CurlKind::TransferTime,
                Regex::new(r"^Transfer time: (\S+?)s$").unwrap(),
            ),
            (
                CurlKind::DownloadSpeed,
                Regex::new(r"^Download speed: (\S+) bytes/s$").unwrap(),
            ),
            (
                CurlKind::DownloadSize,
                Regex::new(r"^Downloaded size: (\S+) bytes$").unwrap(),
            ),
            (CurlKind::HttpCode, Regex::new(r"^HTTP code: (\S+)$").unwrap()),
        ]
    }
}

lazy_static! {
    static ref PARSER: GenericSectionParser<CurlKind> =
        GenericSectionParser::from_parser::<CurlParser>();
}

/// Extract the timings of all HTTP requests made by the flow tagged `tag`. Requests missing one
/// of the four timing fields are skipped with a warning.
pub fn extract_http(text: &str, tag: &str) -> Extraction<Vec<HttpTiming>> {
    let locator = SectionLocator::new(http_title(tag)).numbered();
    let mut warnings = Vec::new();

    let sections = locator.locate_all(text);
    if sections.is_empty() {
        log::warn!("[extract] no HTTP timing sections for `{tag}`");
        warnings.push(ExtractWarning::MissingSection(format!(
            "{}_<seq>",
            locator.title()
        )));
    }

    let mut timings = Vec::new();
    for section in sections {
        let section_name = section.title.to_string();
        let mut total = None;
        let mut connect = None;
        let mut transfer = None;
        let mut speed = None;
        let mut size = None;
        let mut code = None;

        for line in PARSER.parse_section(section.body) {
            let value = line.group(1).unwrap_or_default();
            let ok = match line.kind {
                CurlKind::TotalTime => parse_float(value).map(|x| total = Some(x)),
                CurlKind::ConnectTime => parse_float(value).map(|x| connect = Some(x)),
                CurlKind::TransferTime => parse_float(value).map(|x| transfer = Some(x)),
                CurlKind::DownloadSpeed => parse_float(value).map(|x| speed = Some(x)),
                CurlKind::DownloadSize => parse_num(value).map(|x| size = Some(x)),
                CurlKind::HttpCode => value.parse::<u16>().ok().map(|x| code = Some(x)),
            };
            if ok.is_none() {
                warnings.push(ExtractWarning::MalformedLine {
                    section: section_name.clone(),
                    line: line.line().to_string(),
                });
            }
        }

        let required = [
            (CurlKind::TotalTime, total),
            (CurlKind::ConnectTime, connect),
            (CurlKind::TransferTime, transfer),
            (CurlKind::DownloadSpeed, speed),
        ];
        if let Some((kind, _)) = required.iter().find(|(_, x)| x.is_none()) {
            warnings.push(ExtractWarning::MissingLine {
                section: section_name,
                what: kind.to_string(),
            });
            continue;
        }

        timings.push(HttpTiming {
            host: tag.to_string(),
            seq: section.seq.unwrap_or_default(),
            total_time: total.unwrap_or_default(),
            connect_time: connect.unwrap_or_default(),
            transfer_time: transfer.unwrap_or_default(),
            download_speed: speed.unwrap_or_default(),
            size_bytes: size,
            http_code: code,
        });
    }

    Extraction {
        value: timings,
        warnings,
    }
}

/// Parse the output of a probe fetch (`%{time_total}`) into seconds.
pub fn parse_fetch_time(output: &str) -> Option<f64> {
    parse_float(output)
}
