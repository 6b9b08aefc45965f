//! Module containing some utility functions that didn't fit anywhere else.

use time::{format_description, OffsetDateTime};

/// Produces a timestamp `String` of the current time in YYYY-MM-DD_HH-mm-SS format.
///
/// Falls back to UTC if the local offset cannot be determined, and to the unix timestamp if
/// formatting fails.
pub fn get_timestamp() -> String {
    let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
    format_description::parse("[year]-[month]-[day]_[hour]-[minute]-[second]")
        .ok()
        .and_then(|fmt| now.format(&fmt).ok())
        .unwrap_or_else(|| now.unix_timestamp().to_string())
}

/// Replace every character that is not safe to use in a file name with an underscore.
pub fn sanitize_file_name(name: impl AsRef<str>) -> String {
    name.as_ref()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
