//! Binary package lists (`Packages.gz`)

use super::{for_each_line, join, ListContext, ParseOutcome};
use crate::error::SyncResult;
use crate::model::WorkItem;
use aptmirror_common::Digest;
use std::io::BufRead;
use tracing::{debug, warn};

/// Fields the parser acts on. A non-UTF-8 value in any of them spoils the record.
const TRACKED_FIELDS: [&str; 5] = ["Package", "Filename", "Size", "MD5sum", "SHA256"];

#[derive(Default)]
struct Record {
    package: Option<String>,
    filename: Option<String>,
    size: Option<u64>,
    /// Index into the outcome of the item this record already emitted
    emitted: Option<usize>,
    /// Dropped; remaining fields are ignored until the next record
    poisoned: bool,
}

/// Stream a decompressed package list into artifact work items.
///
/// `Package:` opens a record, `Filename:` needs an open record, `Size:` needs
/// a filename, and `MD5sum:` emits the item. A later `SHA256:` in the same
/// record is attached to the emitted item. Fields arriving out of order drop
/// the record.
pub fn parse_packages<R: BufRead>(reader: R, ctx: &ListContext<'_>) -> SyncResult<ParseOutcome> {
    let mut outcome = ParseOutcome::default();
    let mut record = Record::default();

    for_each_line(reader, ctx.source_name, |line, lossy| {
        parse_line(line, lossy, &mut record, &mut outcome, ctx);
    })?;

    debug!(
        source = %ctx.source_name,
        items = outcome.items.len(),
        dropped = outcome.dropped,
        "Parsed package list"
    );
    Ok(outcome)
}

fn parse_line(line: &str, lossy: bool, record: &mut Record, outcome: &mut ParseOutcome, ctx: &ListContext<'_>) {
    if line.trim().is_empty() {
        *record = Record::default();
        return;
    }

    // Continuation lines of multi-line fields
    if line.starts_with(char::is_whitespace) {
        return;
    }

    let Some((field, value)) = line.split_once(':') else {
        return;
    };
    let value = value.trim();

    if lossy && TRACKED_FIELDS.contains(&field) {
        if !record.poisoned {
            if let Some(index) = record.emitted {
                outcome.items.truncate(index);
            }
            drop_record(record, outcome, ctx, "field is not valid UTF-8");
            record.poisoned = true;
        }
        return;
    }
    if record.poisoned && field != "Package" {
        return;
    }

    match field {
        "Package" => {
            *record = Record {
                package: Some(value.to_string()),
                ..Record::default()
            };
        },
        "Filename" if record.package.is_some() => {
            record.filename = Some(value.to_string());
        },
        "Size" if record.filename.is_some() => match value.parse() {
            Ok(size) => record.size = Some(size),
            Err(_) => drop_record(record, outcome, ctx, "unparseable Size"),
        },
        "MD5sum" if record.emitted.is_none() => {
            match (record.filename.clone(), record.size, Digest::from_hex(value)) {
                (Some(filename), Some(size), Ok(digest)) => {
                    let item = WorkItem::artifact(
                        join(ctx.dest_prefix, &filename),
                        join(ctx.origin_base, &filename),
                    )
                    .with_name(filename)
                    .with_remote_size(size)
                    .with_remote_digest(digest);

                    outcome.items.push(item);
                    record.emitted = Some(outcome.items.len() - 1);
                },
                _ => drop_record(record, outcome, ctx, "MD5sum without Filename and Size"),
            }
        },
        "SHA256" => {
            if let Some(index) = record.emitted {
                outcome.items[index].sha256 = Some(value.to_ascii_lowercase());
            }
        },
        "Filename" | "Size" => {
            drop_record(record, outcome, ctx, "field out of order");
        },
        _ => {},
    }
}

fn drop_record(record: &mut Record, outcome: &mut ParseOutcome, ctx: &ListContext<'_>, reason: &str) {
    warn!(
        source = %ctx.source_name,
        package = ?record.package,
        reason,
        "Dropping package record"
    );
    outcome.dropped += 1;
    *record = Record::default();
}
