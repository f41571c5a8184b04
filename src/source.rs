//! Proxy list files and remote proxy lists.
//!
//! One proxy per line. Blank lines and lines starting with `#` are ignored.

use crate::error::{Error, ParseError};
use crate::proxy::ProxyRecord;

use log::warn;
use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::Path;
use tokio::io::AsyncWriteExt;

/// Outcome of parsing a proxy list.
#[derive(Debug, Default)]
pub struct ParsedList {
    pub records: Vec<ProxyRecord>,
    /// Rejected lines as `(line number, line, error)`.
    pub rejected: Vec<(usize, String, ParseError)>,
}

/// Parse a proxy list, skipping and logging malformed lines.
pub fn parse_proxy_list(content: &str) -> ParsedList {
    let mut parsed = ParsedList::default();
    for (index, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match ProxyRecord::parse(line) {
            Ok(record) => parsed.records.push(record),
            Err(e) => {
                warn!("Skipping proxy on line {}: {}", index + 1, e);
                parsed.rejected.push((index + 1, line.to_string(), e));
            }
        }
    }
    parsed
}

/// Read a proxy list from an `http(s)` URL or a local file.
pub async fn fetch_proxy_list(source: &str) -> Result<String, Error> {
    if source.starts_with("http://") || source.starts_with("https://") {
        let response = reqwest::get(source).await?.error_for_status()?;
        Ok(response.text().await?)
    } else {
        Ok(tokio::fs::read_to_string(source).await?)
    }
}

/// Append proxies to a list file, skipping entries already present.
///
/// Entries are compared by their lowercased canonical form, so `10.0.0.1:80`
/// and `http://10.0.0.1:80` are the same proxy. Lines that do not parse are
/// compared by their trimmed text. Returns how many lines were written.
pub async fn append_proxies<I>(path: &Path, proxies: I) -> Result<usize, Error>
where
    I: IntoIterator,
    I::Item: AsRef<str>,
{
    let existing = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e.into()),
    };

    let mut seen: HashSet<String> = existing.lines().map(normalize).collect();
    let mut buffer = String::new();
    if !existing.is_empty() && !existing.ends_with('\n') {
        buffer.push('\n');
    }

    let mut written = 0;
    for proxy in proxies {
        let line = proxy.as_ref().trim();
        if line.is_empty() || !seen.insert(normalize(line)) {
            continue;
        }
        buffer.push_str(line);
        buffer.push('\n');
        written += 1;
    }

    if written > 0 {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        file.write_all(buffer.as_bytes()).await?;
        file.flush().await?;
    }
    Ok(written)
}

fn normalize(line: &str) -> String {
    match ProxyRecord::parse(line) {
        Ok(record) => record.to_string().to_lowercase(),
        Err(_) => line.trim().to_lowercase(),
    }
}
