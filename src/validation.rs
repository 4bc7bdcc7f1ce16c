//! Input grammars checked before any state change or I/O.

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use std::net::Ipv4Addr;
use url::Url;

use crate::errors::{TaskError, TaskResult};

const MAX_HOSTNAME_LEN: usize = 253;
const MAX_LABEL_LEN: usize = 63;
const MAX_FILENAME_LEN: usize = 255;
const UNSAFE_FILENAME_CHARS: &[char] = &['/', '\\', ':', '*', '?', '"', '<', '>', '|'];
const DOWNLOAD_SCHEMES: &[&str] = &["http", "https", "ftp"];

pub fn is_ipv4_literal(target: &str) -> bool {
    target.parse::<Ipv4Addr>().is_ok()
}

/// RFC 1123 hostname. The last label must not be all digits, so a malformed
/// dotted quad such as `256.1.1.1` is not accepted as a name.
pub fn is_hostname(target: &str) -> bool {
    let name = target.strip_suffix('.').unwrap_or(target);
    if name.is_empty() || name.len() > MAX_HOSTNAME_LEN {
        return false;
    }

    let labels: Vec<&str> = name.split('.').collect();
    let valid_labels = labels.iter().all(|label| {
        !label.is_empty()
            && label.len() <= MAX_LABEL_LEN
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    });

    let numeric_tld = labels
        .last()
        .map_or(true, |tld| tld.chars().all(|c| c.is_ascii_digit()));

    valid_labels && !numeric_tld
}

pub fn validate_scan_target(target: &str) -> TaskResult<()> {
    let target = target.trim();
    if is_ipv4_literal(target) || is_hostname(target) {
        Ok(())
    } else {
        Err(TaskError::Validation(format!(
            "'{}' is neither an IPv4 address nor a hostname",
            target
        )))
    }
}

/// Converts raw port numbers, rejecting an empty list and anything outside
/// `1..=65535`.
pub fn validate_ports(ports: &[u32]) -> TaskResult<Vec<u16>> {
    if ports.is_empty() {
        return Err(TaskError::Validation("port list is empty".into()));
    }

    ports
        .iter()
        .map(|&port| match u16::try_from(port) {
            Ok(p) if p != 0 => Ok(p),
            _ => Err(TaskError::Validation(format!(
                "port {} is outside 1-65535",
                port
            ))),
        })
        .collect()
}

pub fn validate_download_url(raw: &str) -> TaskResult<Url> {
    let url = Url::parse(raw.trim())
        .map_err(|e| TaskError::Validation(format!("malformed URL '{}': {}", raw, e)))?;

    if !DOWNLOAD_SCHEMES.contains(&url.scheme()) {
        return Err(TaskError::Validation(format!(
            "unsupported URL scheme '{}'",
            url.scheme()
        )));
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(TaskError::Validation(format!("URL '{}' has no host", raw)));
    }
    Ok(url)
}

pub fn validate_filename(filename: &str) -> TaskResult<()> {
    if filename.trim().is_empty() {
        return Err(TaskError::Validation("filename is empty".into()));
    }
    if filename == "." || filename == ".." {
        return Err(TaskError::Validation(format!(
            "'{}' is not a valid filename",
            filename
        )));
    }
    if filename.len() > MAX_FILENAME_LEN {
        return Err(TaskError::Validation(format!(
            "filename exceeds {} bytes",
            MAX_FILENAME_LEN
        )));
    }
    if let Some(c) = filename
        .chars()
        .find(|c| UNSAFE_FILENAME_CHARS.contains(c) || c.is_control())
    {
        return Err(TaskError::Validation(format!(
            "filename '{}' contains unsafe character {:?}",
            filename, c
        )));
    }
    Ok(())
}

/// File extension allow-list. `*` admits everything; other entries may be a
/// bare extension (`mp4`), a dotted one (`.mp4`) or a glob (`*.tar.gz`).
#[derive(Debug, Clone)]
pub struct ExtensionPolicy {
    allow_all: bool,
    globs: GlobSet,
    entries: Vec<String>,
}

impl ExtensionPolicy {
    pub fn new(entries: &[String]) -> TaskResult<Self> {
        let allow_all = entries.iter().any(|e| e.trim() == "*");
        let mut builder = GlobSetBuilder::new();

        for entry in entries.iter().map(|e| e.trim()).filter(|e| !e.is_empty() && *e != "*") {
            let pattern = if entry.contains('*') {
                entry.to_string()
            } else {
                format!("*.{}", entry.trim_start_matches('.'))
            };
            let glob = GlobBuilder::new(&pattern)
                .case_insensitive(true)
                .literal_separator(true)
                .build()
                .map_err(|e| {
                    TaskError::Validation(format!("invalid extension pattern '{}': {}", entry, e))
                })?;
            builder.add(glob);
        }

        let globs = builder
            .build()
            .map_err(|e| TaskError::Validation(format!("invalid extension allow-list: {}", e)))?;

        Ok(Self {
            allow_all,
            globs,
            entries: entries.to_vec(),
        })
    }

    pub fn allow_all() -> Self {
        Self {
            allow_all: true,
            globs: GlobSet::empty(),
            entries: vec!["*".to_string()],
        }
    }

    pub fn allows(&self, filename: &str) -> bool {
        self.allow_all || self.globs.is_match(filename)
    }

    pub fn check(&self, filename: &str) -> TaskResult<()> {
        if self.allows(filename) {
            Ok(())
        } else {
            Err(TaskError::Validation(format!(
                "extension of '{}' is not in the allow-list {:?}",
                filename, self.entries
            )))
        }
    }
}
