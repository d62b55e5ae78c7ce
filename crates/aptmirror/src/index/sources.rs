//! Source package lists (`Sources.gz`)

use super::{for_each_line, join, ListContext, ParseOutcome};
use crate::error::SyncResult;
use crate::model::WorkItem;
use aptmirror_common::Digest;
use std::io::BufRead;
use tracing::{debug, warn};

const ARTIFACT_SUFFIXES: [&str; 4] = [".dsc", ".gz", ".xz", ".bz2"];

fn is_artifact(name: &str) -> bool {
    ARTIFACT_SUFFIXES.iter().any(|suffix| name.ends_with(suffix))
}

#[derive(Default)]
struct Record {
    package: Option<String>,
    directory: Option<String>,
    in_files: bool,
    /// Package or directory was unreadable; nothing is emitted until the next record
    poisoned: bool,
}

/// Stream a decompressed source list into artifact work items.
///
/// Within a record `Package:` then `Directory:` then `Files:` opens the file
/// section; each following `md5 size name` line for a source artifact emits
/// one item. Any other line inside the section closes the record.
pub fn parse_sources<R: BufRead>(reader: R, ctx: &ListContext<'_>) -> SyncResult<ParseOutcome> {
    let mut outcome = ParseOutcome::default();
    let mut record = Record::default();

    for_each_line(reader, ctx.source_name, |line, lossy| {
        parse_line(line, lossy, &mut record, &mut outcome, ctx);
    })?;

    debug!(
        source = %ctx.source_name,
        items = outcome.items.len(),
        dropped = outcome.dropped,
        "Parsed source list"
    );
    Ok(outcome)
}

fn parse_line(line: &str, lossy: bool, record: &mut Record, outcome: &mut ParseOutcome, ctx: &ListContext<'_>) {
    if let Some(package) = line.strip_prefix("Package:") {
        *record = Record {
            package: Some(package.trim().to_string()),
            ..Record::default()
        };
        if lossy {
            poison(record, outcome, ctx, "Package is not valid UTF-8");
        }
        return;
    }

    if record.poisoned {
        return;
    }

    if record.in_files {
        let is_file_line = line.starts_with(char::is_whitespace) && is_artifact(line.trim_end());
        if !is_file_line {
            *record = Record::default();
            return;
        }

        let dir = record.directory.as_deref().unwrap_or_default();
        match parse_file_line(line).filter(|_| !lossy) {
            Some((digest, size, name)) => {
                let path = format!("{}/{}", dir.trim_end_matches('/'), name);
                outcome.items.push(
                    WorkItem::artifact(join(ctx.dest_prefix, &path), join(ctx.origin_base, &path))
                        .with_name(name)
                        .with_remote_size(size)
                        .with_remote_digest(digest),
                );
            },
            None => {
                warn!(
                    source = %ctx.source_name,
                    package = ?record.package,
                    line = %line.trim(),
                    lossy,
                    "Dropping malformed source file line"
                );
                outcome.dropped += 1;
            },
        }
        return;
    }

    if let Some(directory) = line.strip_prefix("Directory:") {
        if record.package.is_some() {
            record.directory = Some(directory.trim().to_string());
            if lossy {
                poison(record, outcome, ctx, "Directory is not valid UTF-8");
            }
        }
    } else if line.starts_with("Files:") && record.directory.is_some() {
        record.in_files = true;
    }
}

fn poison(record: &mut Record, outcome: &mut ParseOutcome, ctx: &ListContext<'_>, reason: &str) {
    warn!(
        source = %ctx.source_name,
        package = ?record.package,
        reason,
        "Dropping source record"
    );
    outcome.dropped += 1;
    record.poisoned = true;
}

fn parse_file_line(line: &str) -> Option<(Digest, u64, String)> {
    let mut fields = line.split_whitespace();
    let digest = Digest::from_hex(fields.next()?).ok()?;
    let size = fields.next()?.parse().ok()?;
    let name = fields.next()?.to_string();
    if fields.next().is_some() {
        return None;
    }
    Some((digest, size, name))
}
