use chrono::{DateTime, Utc};

use crate::config::KeyLayout;
use crate::constants::{KEY_DATE_FORMAT, UNKNOWN_HOSTNAME};

/// Normalize a hostname for use in a key partition.
///
/// Lowercases and replaces `/`, `:` and whitespace with `-`. An empty result
/// becomes `unknown`.
pub fn normalize_hostname(raw: &str) -> String {
    let normalized: String = raw
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| match c {
            '/' | ':' => '-',
            c if c.is_whitespace() => '-',
            c => c,
        })
        .collect();

    if normalized.is_empty() {
        UNKNOWN_HOSTNAME.to_string()
    } else {
        normalized
    }
}

/// Read the machine hostname and normalize it
pub fn local_hostname() -> String {
    let raw = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_default();
    normalize_hostname(&raw)
}

/// Builds storage keys from a filename and the source timestamp.
///
/// Pure and deterministic: the date partition comes from the timestamp passed
/// in (file mtime or flush time), never from the wall clock, so a retry after a
/// crash lands on the same key.
#[derive(Debug, Clone)]
pub struct ObjectKeyBuilder {
    prefix: Option<String>,
    hostname: String,
    layout: KeyLayout,
}

impl ObjectKeyBuilder {
    pub fn new(prefix: Option<&str>, hostname: &str, layout: KeyLayout) -> Self {
        let prefix = prefix
            .map(|p| p.replace('\\', "/").trim_matches('/').to_string())
            .filter(|p| !p.is_empty());
        Self {
            prefix,
            hostname: normalize_hostname(hostname),
            layout,
        }
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn build(&self, filename: &str, timestamp: DateTime<Utc>) -> String {
        let filename = filename.replace('\\', "/");
        let filename = filename.trim_start_matches('/');

        let mut parts: Vec<String> = Vec::with_capacity(4);
        if let Some(prefix) = &self.prefix {
            parts.push(prefix.clone());
        }
        if self.layout == KeyLayout::Partitioned {
            parts.push(format!("hostname={}", self.hostname));
            parts.push(format!("date={}", timestamp.format(KEY_DATE_FORMAT)));
        }
        parts.push(filename.to_string());
        parts.join("/")
    }
}
