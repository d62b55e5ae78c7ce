//! Top-level `Release` manifest

use crate::error::{SyncError, SyncResult};
use aptmirror_common::Digest;
use regex::Regex;
use tracing::{debug, warn};

const MD5_SECTION: &str = "MD5Sum:";

/// One `digest size path` line of the MD5 section
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    pub digest: Digest,
    pub size: u64,
    pub path: String,
}

/// Which manifest paths become index work
#[derive(Debug, Clone)]
pub struct PathFilter {
    include: Regex,
    exclude: Regex,
}

impl PathFilter {
    pub fn new(architectures: &[String]) -> SyncResult<Self> {
        let archs = architectures
            .iter()
            .map(|a| regex::escape(a))
            .collect::<Vec<_>>()
            .join("|");

        let include = Regex::new(&format!(
            r"binary-({archs})/|Contents-({archs})\.gz$|source|i18n/"
        ))
        .map_err(|e| SyncError::Config(format!("bad architecture list: {}", e)))?;

        // Uncompressed lists are never published; their compressed siblings are
        let exclude = Regex::new(r"debian-installer|(Sources|Packages)$")
            .map_err(|e| SyncError::Config(e.to_string()))?;

        Ok(Self { include, exclude })
    }

    pub fn accepts(&self, path: &str) -> bool {
        self.include.is_match(path) && !self.exclude.is_match(path)
    }
}

/// Entries of the `MD5Sum:` section.
///
/// The section starts at the exact `MD5Sum:` line and ends at the next field
/// header (`SHA1:`, `SHA256:`, ...). Malformed lines are skipped.
pub fn parse_manifest(content: &str, source_name: &str) -> Vec<ManifestEntry> {
    let mut entries = Vec::new();
    let mut in_section = false;

    for line in content.lines() {
        if !in_section {
            in_section = line.trim_end() == MD5_SECTION;
            continue;
        }

        // Section lines are indented; anything else is the next field
        if !line.starts_with(char::is_whitespace) {
            break;
        }

        match parse_line(line) {
            Some(entry) => entries.push(entry),
            None if line.trim().is_empty() => {},
            None => warn!(source = %source_name, line = %line.trim(), "Skipping malformed manifest line"),
        }
    }

    debug!(source = %source_name, entries = entries.len(), "Parsed manifest");
    entries
}

fn parse_line(line: &str) -> Option<ManifestEntry> {
    let mut fields = line.split_whitespace();
    let digest = Digest::from_hex(fields.next()?).ok()?;
    let size = fields.next()?.parse().ok()?;
    let path = fields.next()?.to_string();

    if fields.next().is_some() {
        return None;
    }

    Some(ManifestEntry { digest, size, path })
}
