//! Full mirror runs over an in-memory origin and store
//!
//! The origin serves a one-distribution repository built from gzip fixtures:
//! binary and source lists, translations, and lists carrying bytes that are
//! not UTF-8.

use aptmirror::config::MirrorConfig;
use aptmirror::origin::MemoryOrigin;
use aptmirror::publish::BatchOutcome;
use aptmirror::storage::{MemoryStore, StoreOp};
use aptmirror::MirrorPipeline;
use aptmirror_common::checksum::sha256_hex;
use aptmirror_common::Digest;
use chrono::NaiveDate;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::Write;
use std::sync::Arc;
use tempfile::TempDir;

const BASE: &str = "http://mirror.test/ubuntu";
const DEB_PATH: &str = "pool/main/h/hello/hello_2.10_amd64.deb";
const DEB: &[u8] = b"hello package bytes";
const PACKAGES_PATH: &str = "main/binary-amd64/Packages.gz";
const SOURCES_PATH: &str = "main/source/Sources.gz";

fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

fn package_record(path: &str, data: &[u8]) -> String {
    format!(
        "Package: {name}\nVersion: 1.0\nFilename: {path}\nSize: {size}\nMD5sum: {md5}\nSHA256: {sha}\n\n",
        name = path.rsplit('/').next().unwrap_or(path),
        size = data.len(),
        md5 = Digest::of_bytes(data).hex(),
        sha = sha256_hex(data),
    )
}

fn packages_list(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let text: String = entries
        .iter()
        .map(|&(path, data)| package_record(path, data))
        .collect();
    gzip(text.as_bytes())
}

fn sources_list(directory: &str, files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut text = format!("Package: hello\nBinary: hello\nDirectory: {}\nFiles:\n", directory);
    for (name, data) in files {
        text.push_str(&format!(" {} {} {}\n", Digest::of_bytes(data).hex(), data.len(), name));
    }
    text.push('\n');
    gzip(text.as_bytes())
}

/// Origin serving `jammy` with exactly the given index files
fn serve_dist(origin: &MemoryOrigin, files: &[(&str, &[u8])]) {
    origin.insert(format!("{}/dists/jammy/Release", BASE), release(files));
    for (path, data) in files {
        origin.insert(format!("{}/dists/jammy/{}", BASE, path), data.to_vec());
    }
}

fn release(files: &[(&str, &[u8])]) -> String {
    let mut text = String::from("Origin: Ubuntu\nSuite: jammy\nCodename: jammy\nMD5Sum:\n");
    for (path, data) in files {
        text.push_str(&format!(" {} {:>8} {}\n", Digest::of_bytes(data).hex(), data.len(), path));
    }
    text.push_str("SHA256:\n");
    text
}

/// Origin serving `jammy` with one package list
fn repository(entries: &[(&str, &[u8])]) -> MemoryOrigin {
    let origin = MemoryOrigin::new();
    let packages = packages_list(entries);

    origin.insert(
        format!("{}/dists/jammy/Release", BASE),
        release(&[(PACKAGES_PATH, packages.as_slice()), ("main/binary-amd64/Packages", &b"plain"[..])]),
    );
    origin.insert(format!("{}/dists/jammy/{}", BASE, PACKAGES_PATH), packages);
    for (path, data) in entries {
        origin.insert(format!("{}/{}", BASE, path), data.to_vec());
    }
    origin
}

fn config(cache: &TempDir) -> MirrorConfig {
    let mut config = MirrorConfig::default();
    config.origin.url = "http://mirror.test".to_string();
    config.origin.source_dir = "ubuntu".to_string();
    config.mirror.dest_prefix = "ubuntu".to_string();
    config.mirror.dists = vec!["jammy".to_string()];
    config.mirror.architectures = vec!["amd64".to_string()];
    config.workers.content_workers = 2;
    config.workers.index_workers = 2;
    config.retry.max_retry = 2;
    config.retry.index_retry = 2;
    config.retry.flip_backoff_ms = 0;
    config.cache_dir = cache.path().to_path_buf();
    config
}

fn pipeline(cache: &TempDir, store: &MemoryStore, origin: &MemoryOrigin) -> MirrorPipeline {
    MirrorPipeline::new(config(cache), Arc::new(store.clone()), Arc::new(origin.clone()))
        .with_today(NaiveDate::from_ymd_opt(2026, 10, 16).unwrap())
}

#[tokio::test]
async fn test_first_run_mirrors_artifacts_and_metadata() {
    let cache = TempDir::new().unwrap();
    let store = MemoryStore::new();
    let origin = repository(&[(DEB_PATH, DEB)]);

    let report = pipeline(&cache, &store, &origin).run().await.unwrap();

    assert!(report.success(), "{:?}", report.error);
    assert_eq!(report.exit_code(), 0);
    assert_eq!(report.content.uploaded, 1);
    assert_eq!(report.index.artifacts, 1);
    assert_eq!(report.batch("jammy").unwrap().outcome, BatchOutcome::Published);

    assert_eq!(store.data(&format!("ubuntu/{}", DEB_PATH)).unwrap(), DEB);
    assert!(store.contains("ubuntu/dists/jammy/Release"));
    assert!(store.contains("ubuntu/dists/jammy/main/binary-amd64/Packages.gz"));
    assert!(!store.contains("ubuntu/dists/jammy/main/binary-amd64/Packages"));
    assert!(store.keys().iter().all(|k| !k.ends_with("-new")));

    // Run cache is cleaned up
    assert_eq!(std::fs::read_dir(cache.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_rerun_against_unchanged_origin_uploads_nothing() {
    let cache = TempDir::new().unwrap();
    let store = MemoryStore::new();
    let origin = repository(&[(DEB_PATH, DEB)]);

    pipeline(&cache, &store, &origin).run().await.unwrap();
    let puts = store.count(StoreOp::Put);
    let copies = store.count(StoreOp::Copy);

    let report = pipeline(&cache, &store, &origin).run().await.unwrap();

    assert!(report.success());
    assert_eq!(report.content.uploaded, 0);
    assert_eq!(report.content.skipped, 1);
    assert_eq!(report.batch("jammy").unwrap().outcome, BatchOutcome::Unchanged);
    assert_eq!(store.count(StoreOp::Put), puts);
    assert_eq!(store.count(StoreOp::Copy), copies);
}

#[tokio::test]
async fn test_empty_manifest_produces_no_work() {
    let cache = TempDir::new().unwrap();
    let store = MemoryStore::new();
    let origin = MemoryOrigin::new();
    origin.insert(format!("{}/dists/jammy/Release", BASE), "Origin: Ubuntu\nSuite: jammy\n");

    let report = pipeline(&cache, &store, &origin).run().await.unwrap();

    assert!(report.success());
    assert_eq!(report.index.artifacts, 0);
    assert_eq!(report.content.uploaded + report.content.skipped, 0);
    assert_eq!(report.batch("jammy").unwrap().outcome, BatchOutcome::Published);
    assert_eq!(
        store.keys(),
        vec!["ubuntu/dists/jammy/Release".to_string()]
    );
}

#[tokio::test]
async fn test_artifact_missing_upstream_is_excluded() {
    let cache = TempDir::new().unwrap();
    let store = MemoryStore::new();
    let gone = "pool/main/g/gone/gone_1.0_amd64.deb";
    let origin = repository(&[(DEB_PATH, DEB)]);

    // Re-serve the list with a second entry the origin does not have
    let packages = packages_list(&[(DEB_PATH, DEB), (gone, &b"never served"[..])]);
    origin.insert(
        format!("{}/dists/jammy/Release", BASE),
        release(&[(PACKAGES_PATH, packages.as_slice())]),
    );
    origin.insert(format!("{}/dists/jammy/{}", BASE, PACKAGES_PATH), packages);

    let report = pipeline(&cache, &store, &origin).run().await.unwrap();

    assert!(report.success(), "{:?}", report.error);
    assert_eq!(report.content.uploaded, 1);
    assert_eq!(report.content.excluded, 1);
    assert!(!store.contains(&format!("ubuntu/{}", gone)));
}

#[tokio::test]
async fn test_failed_artifact_blocks_metadata_publish() {
    let cache = TempDir::new().unwrap();
    let store = MemoryStore::new();
    let origin = repository(&[(DEB_PATH, DEB)]);
    origin.fail(format!("{}/{}", BASE, DEB_PATH), 100);

    let report = pipeline(&cache, &store, &origin).run().await.unwrap();

    assert!(!report.success());
    assert_eq!(report.exit_code(), 1);
    assert_eq!(report.content.failed, 1);
    assert!(report.batches.is_empty());
    assert!(!store.contains("ubuntu/dists/jammy/Release"));
}

#[tokio::test]
async fn test_missing_release_fails_run() {
    let cache = TempDir::new().unwrap();
    let store = MemoryStore::new();

    let report = pipeline(&cache, &store, &MemoryOrigin::new()).run().await.unwrap();

    assert!(!report.success());
    assert!(report.error.unwrap().contains("jammy"));
    assert!(store.keys().is_empty());
}

#[tokio::test]
async fn test_changed_release_is_backed_up() {
    let cache = TempDir::new().unwrap();
    let store = MemoryStore::new();
    store.insert("ubuntu/dists/jammy/Release", "yesterday's release");
    let origin = repository(&[(DEB_PATH, DEB)]);

    let report = pipeline(&cache, &store, &origin).run().await.unwrap();

    assert!(report.success());
    assert_eq!(
        store.data("ubuntu/dists/jammy/Release-latest").unwrap(),
        "yesterday's release"
    );
    assert!(store.contains("ubuntu/dists/jammy/Release-2026-10-16"));
}

#[tokio::test]
async fn test_source_packages_are_mirrored() {
    let cache = TempDir::new().unwrap();
    let store = MemoryStore::new();
    let origin = MemoryOrigin::new();
    let dsc: &[u8] = b"Format: 3.0 (quilt)";
    let tarball: &[u8] = b"orig tarball bytes";

    let sources = sources_list(
        "pool/main/h/hello",
        &[("hello_2.10-2.dsc", dsc), ("hello_2.10.orig.tar.gz", tarball)],
    );
    serve_dist(&origin, &[(SOURCES_PATH, sources.as_slice())]);
    origin.insert(format!("{}/pool/main/h/hello/hello_2.10-2.dsc", BASE), dsc.to_vec());
    origin.insert(format!("{}/pool/main/h/hello/hello_2.10.orig.tar.gz", BASE), tarball.to_vec());

    let report = pipeline(&cache, &store, &origin).run().await.unwrap();

    assert!(report.success(), "{:?}", report.error);
    assert_eq!(report.index.artifacts, 2);
    assert_eq!(report.content.uploaded, 2);
    assert_eq!(store.data("ubuntu/pool/main/h/hello/hello_2.10-2.dsc").unwrap(), dsc);
    assert_eq!(store.data("ubuntu/pool/main/h/hello/hello_2.10.orig.tar.gz").unwrap(), tarball);
    assert!(store.contains(&format!("ubuntu/dists/jammy/{}", SOURCES_PATH)));
}

#[tokio::test]
async fn test_translations_listed_in_index_are_published() {
    let cache = TempDir::new().unwrap();
    let store = MemoryStore::new();
    let origin = MemoryOrigin::new();
    let english: &[u8] = b"Package: hello\nDescription-en: greeting\n";

    let index = format!(
        "SHA1:\n {} {:>8} Translation-en.bz2\n {} {:>8} Translation-de.bz2\n",
        "a".repeat(40),
        english.len(),
        "b".repeat(40),
        10,
    );
    serve_dist(&origin, &[("main/i18n/Index", index.as_bytes())]);
    origin.insert(format!("{}/dists/jammy/main/i18n/Translation-en.bz2", BASE), english.to_vec());

    let report = pipeline(&cache, &store, &origin).run().await.unwrap();

    assert!(report.success(), "{:?}", report.error);
    assert_eq!(report.index.excluded, 1);
    assert_eq!(report.batch("jammy").unwrap().outcome, BatchOutcome::Published);
    assert!(store.contains("ubuntu/dists/jammy/main/i18n/Index"));
    assert_eq!(
        store.data("ubuntu/dists/jammy/main/i18n/Translation-en.bz2").unwrap(),
        english
    );
    assert!(!store.contains("ubuntu/dists/jammy/main/i18n/Translation-de.bz2"));
}

#[tokio::test]
async fn test_latin1_bytes_in_package_list_do_not_hide_artifacts() {
    let cache = TempDir::new().unwrap();
    let store = MemoryStore::new();
    let origin = MemoryOrigin::new();
    let cafe_path = "pool/main/c/cafe/cafe_1.0_amd64.deb";
    let cafe: &[u8] = b"cafe package bytes";

    let record = package_record(cafe_path, cafe);
    let (package_line, rest) = record.split_once('\n').unwrap();
    let mut list = format!("{}\n", package_line).into_bytes();
    // Maintainer-supplied description in latin-1
    list.extend_from_slice(b"Description: caf\xe9 cr\xe8me\n");
    list.extend_from_slice(rest.as_bytes());
    list.extend_from_slice(package_record(DEB_PATH, DEB).as_bytes());
    let packages = gzip(&list);

    serve_dist(&origin, &[(PACKAGES_PATH, packages.as_slice())]);
    origin.insert(format!("{}/{}", BASE, cafe_path), cafe.to_vec());
    origin.insert(format!("{}/{}", BASE, DEB_PATH), DEB.to_vec());

    let report = pipeline(&cache, &store, &origin).run().await.unwrap();

    assert!(report.success(), "{:?}", report.error);
    assert_eq!(report.index.artifacts, 2);
    assert_eq!(report.content.uploaded, 2);
    assert_eq!(store.data(&format!("ubuntu/{}", cafe_path)).unwrap(), cafe);
    assert_eq!(store.data(&format!("ubuntu/{}", DEB_PATH)).unwrap(), DEB);
    assert!(store.contains(&format!("ubuntu/dists/jammy/{}", PACKAGES_PATH)));
}

#[tokio::test]
async fn test_unreadable_list_fails_run_without_publishing() {
    let cache = TempDir::new().unwrap();
    let store = MemoryStore::new();
    let origin = MemoryOrigin::new();

    // Verifies against the manifest but is not gzip
    serve_dist(&origin, &[(PACKAGES_PATH, &b"plain text, not gzip"[..])]);

    let report = pipeline(&cache, &store, &origin).run().await.unwrap();

    assert!(!report.success());
    assert!(report.error.unwrap().contains(PACKAGES_PATH));
    assert!(report.batches.is_empty());
    assert!(store.keys().is_empty());
    assert_eq!(std::fs::read_dir(cache.path()).unwrap().count(), 0);
}
