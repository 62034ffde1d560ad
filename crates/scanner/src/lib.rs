use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::future::{join_all, BoxFuture};
use futures_util::FutureExt;
use reqwest::header::{CONTENT_TYPE, RANGE};
use reqwest::Client;
use serde::{Deserialize, Deserializer};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use common::{
    canonical_path, file_ext, media_type_for_ext, validate_entry_name, validate_path,
    validate_root_url,
};
use metadata::{MediaFetcher, MetadataError};

#[derive(Clone, Debug)]
pub struct ScannerConfig {
    /// Per-directory-request budget; an expired fetch skips that subtree.
    pub fetch_timeout: Duration,
    pub max_depth: u32,
    pub max_entries_per_dir: usize,
    pub max_html_bytes: usize,
    pub max_links_per_page: usize,
    /// Roots walked concurrently in parallel mode.
    pub parallel_batch: usize,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            fetch_timeout: Duration::from_secs(30),
            max_depth: 16,
            max_entries_per_dir: 10_000,
            max_html_bytes: 2 * 1024 * 1024,
            max_links_per_page: 5_000,
            parallel_batch: 4,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScanMode {
    Sequential,
    Parallel,
}

/// What the catalog remembers about an indexed file, for change detection.
#[derive(Clone, Copy, Debug)]
pub struct FileStamp {
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
}

/// A supported file discovered during the walk.
#[derive(Clone, Debug)]
pub struct RemoteFile {
    pub root: String,
    pub rel_path: String,
    /// Percent-encoded URL suitable for fetching.
    pub url: String,
    pub canonical: String,
    pub filename: String,
    pub mime: &'static str,
    pub size: Option<u64>,
    pub modified: Option<DateTime<Utc>>,
}

/// Receiving side of a walk. One sink instance accumulates a whole scan
/// pass; parallel root batches share it behind a mutex.
#[async_trait]
pub trait ScanSink: Send {
    /// Stamp of the currently-indexed track at this canonical path.
    fn stamp(&self, canonical: &str) -> Option<FileStamp>;
    /// Invoked for every supported file, whether or not it changed.
    async fn file_found(&mut self, file: RemoteFile, changed: bool);
}

#[derive(Clone, Debug, Deserialize)]
pub struct ListingEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: EntryKind,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default, deserialize_with = "lenient_mtime")]
    pub mtime: Option<DateTime<Utc>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Directory,
}

/// Listing servers are not trusted to emit well-formed timestamps; a bad
/// mtime downgrades to "unknown" instead of rejecting the whole entry.
fn lenient_mtime<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<DateTime<Utc>>, D::Error> {
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw.and_then(|value| {
        DateTime::parse_from_rfc3339(value.trim())
            .ok()
            .map(|parsed| parsed.with_timezone(&Utc))
    }))
}

#[derive(Debug)]
pub enum ScanError {
    Http(String),
    Status(u16),
    Malformed(String),
}

impl std::fmt::Display for ScanError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScanError::Http(err) => write!(f, "request failed: {}", err),
            ScanError::Status(code) => write!(f, "http {}", code),
            ScanError::Malformed(err) => write!(f, "malformed listing: {}", err),
        }
    }
}

impl std::error::Error for ScanError {}

/// The depth ceiling aborts the whole root, unlike every other failure
/// which only skips its own unit.
struct DepthExceeded;

#[derive(Default)]
struct WalkStats {
    files_without_mtime: AtomicUsize,
}

pub struct Scanner {
    client: Client,
    config: ScannerConfig,
}

impl Scanner {
    pub fn new(client: Client, config: ScannerConfig) -> Self {
        Self { client, config }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn config(&self) -> &ScannerConfig {
        &self.config
    }

    /// Walks every root, feeding discoveries into the sink. All failures
    /// below the root level are logged and contained; this never errors.
    pub async fn scan_paths<S: ScanSink>(
        &self,
        roots: &[String],
        sink: &Mutex<S>,
        mode: ScanMode,
        cancel: &CancellationToken,
    ) {
        match mode {
            ScanMode::Sequential => {
                for root in roots {
                    if cancel.is_cancelled() {
                        return;
                    }
                    self.walk_root(root, sink, cancel).await;
                }
            }
            ScanMode::Parallel => {
                for batch in roots.chunks(self.config.parallel_batch.max(1)) {
                    if cancel.is_cancelled() {
                        return;
                    }
                    join_all(batch.iter().map(|root| self.walk_root(root, sink, cancel))).await;
                }
            }
        }
    }

    async fn walk_root<S: ScanSink>(
        &self,
        root: &str,
        sink: &Mutex<S>,
        cancel: &CancellationToken,
    ) {
        if let Err(err) = validate_root_url(root) {
            warn!("Skipping scan root {:?}: {}", root, err);
            return;
        }
        let root = if root.ends_with('/') {
            root.to_string()
        } else {
            format!("{}/", root)
        };

        let stats = WalkStats::default();
        match self
            .walk_dir(&root, String::new(), 0, sink, cancel, &stats)
            .await
        {
            Ok(()) => {}
            Err(DepthExceeded) => {
                warn!(
                    "Aborting scan of {}: directory depth exceeds {}",
                    root, self.config.max_depth
                );
            }
        }

        let missing_mtime = stats.files_without_mtime.load(Ordering::Relaxed);
        if missing_mtime > 0 {
            warn!(
                "{} files under {} reported no modification time; changes there are only detected by size",
                missing_mtime, root
            );
        }
    }

    fn walk_dir<'a, S: ScanSink>(
        &'a self,
        root: &'a str,
        rel: String,
        depth: u32,
        sink: &'a Mutex<S>,
        cancel: &'a CancellationToken,
        stats: &'a WalkStats,
    ) -> BoxFuture<'a, Result<(), DepthExceeded>> {
        async move {
            if cancel.is_cancelled() {
                return Ok(());
            }
            if depth > self.config.max_depth {
                return Err(DepthExceeded);
            }

            let url = dir_url(root, &rel);
            let entries = match self.fetch_listing(&url).await {
                Ok(entries) => entries,
                Err(err) => {
                    warn!("Listing failed for {}: {}", url, err);
                    return Ok(());
                }
            };

            let entries = match vet_entries(&url, entries, self.config.max_entries_per_dir) {
                Some(entries) => entries,
                None => return Ok(()),
            };

            for entry in entries {
                if cancel.is_cancelled() {
                    return Ok(());
                }

                let child_rel = if rel.is_empty() {
                    entry.name.clone()
                } else {
                    format!("{}/{}", rel, entry.name)
                };
                let display_path = format!("{}{}", root, child_rel);
                if let Err(err) = validate_path(&display_path) {
                    warn!("Skipping {:?}: {}", display_path, err);
                    continue;
                }

                match entry.kind {
                    EntryKind::Directory => {
                        self.walk_dir(root, child_rel, depth + 1, sink, cancel, stats)
                            .await?;
                    }
                    EntryKind::File => {
                        let Some(mime) =
                            file_ext(&entry.name).as_deref().and_then(media_type_for_ext)
                        else {
                            debug!("Ignoring unsupported file {:?}", display_path);
                            continue;
                        };
                        if entry.mtime.is_none() {
                            stats.files_without_mtime.fetch_add(1, Ordering::Relaxed);
                        }

                        let canonical = canonical_path(&display_path);
                        let file = RemoteFile {
                            root: root.to_string(),
                            rel_path: child_rel.clone(),
                            url: format!("{}{}", root, encode_rel(&child_rel)),
                            canonical: canonical.clone(),
                            filename: entry.name.clone(),
                            mime,
                            size: entry.size,
                            modified: entry.mtime,
                        };

                        let mut sink = sink.lock().await;
                        let stamp = sink.stamp(&canonical);
                        let changed = needs_refresh(entry.size, entry.mtime, stamp.as_ref());
                        sink.file_found(file, changed).await;
                    }
                }
            }

            Ok(())
        }
        .boxed()
    }

    async fn fetch_listing(&self, url: &str) -> Result<Vec<ListingEntry>, ScanError> {
        let response = self
            .client
            .get(url)
            .timeout(self.config.fetch_timeout)
            .send()
            .await
            .map_err(|err| ScanError::Http(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ScanError::Status(status.as_u16()));
        }

        let structured = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.to_ascii_lowercase().contains("application/json"))
            .unwrap_or(false);

        let body = response
            .bytes()
            .await
            .map_err(|err| ScanError::Http(err.to_string()))?;

        if structured {
            serde_json::from_slice::<Vec<ListingEntry>>(&body)
                .map_err(|err| ScanError::Malformed(err.to_string()))
        } else {
            let cap = body.len().min(self.config.max_html_bytes);
            let html = String::from_utf8_lossy(&body[..cap]);
            Ok(listing_from_html(&html, self.config.max_links_per_page))
        }
    }
}

/// Count guard plus per-entry name validation. `None` means the whole
/// directory is skipped.
fn vet_entries(
    url: &str,
    entries: Vec<ListingEntry>,
    max_entries: usize,
) -> Option<Vec<ListingEntry>> {
    if entries.len() > max_entries {
        warn!(
            "Skipping {}: {} entries exceeds the per-directory limit of {}",
            url,
            entries.len(),
            max_entries
        );
        return None;
    }
    let vetted = entries
        .into_iter()
        .filter(|entry| match validate_entry_name(&entry.name) {
            Ok(()) => true,
            Err(err) => {
                warn!("Skipping entry {:?} under {}: {}", entry.name, url, err);
                false
            }
        })
        .collect();
    Some(vetted)
}

/// A listing that never reports mtime (HTML fallback, sparse servers) can
/// only be caught by size drift.
pub fn needs_refresh(
    size: Option<u64>,
    mtime: Option<DateTime<Utc>>,
    stamp: Option<&FileStamp>,
) -> bool {
    let Some(stamp) = stamp else {
        return true;
    };
    let listed = mtime.map(|value| value.timestamp()).unwrap_or(0);
    let known = stamp.modified.map(|value| value.timestamp()).unwrap_or(0);
    if listed > known {
        return true;
    }
    if let Some(size) = size {
        if size != stamp.size {
            return true;
        }
    }
    false
}

/// Anchor extraction fallback for plain directory-index pages. The body
/// is already capped by the caller; the link count is capped here.
pub fn listing_from_html(html: &str, max_links: usize) -> Vec<ListingEntry> {
    let mut entries = Vec::new();
    for href in extract_hrefs(html, max_links) {
        let href = href.trim();
        if href.is_empty() || href.starts_with('#') || href.starts_with('?') {
            continue;
        }
        // Parent, absolute, and cross-origin links are never part of the
        // directory being listed.
        if href == ".." || href.starts_with("../") || href.starts_with('/') {
            continue;
        }
        if href.contains("://") || href.starts_with("//") {
            continue;
        }

        let href = href.strip_prefix("./").unwrap_or(href);
        let (raw_name, kind) = match href.strip_suffix('/') {
            Some(dir) => (dir, EntryKind::Directory),
            None => (href, EntryKind::File),
        };
        let raw_name = match raw_name.split(['?', '#']).next() {
            Some(name) if !name.is_empty() => name,
            _ => continue,
        };
        // Only direct children; anything deeper is not this directory's
        // entry.
        if raw_name.contains('/') {
            continue;
        }
        let name = match urlencoding::decode(raw_name) {
            Ok(decoded) => decoded.into_owned(),
            Err(_) => continue,
        };

        entries.push(ListingEntry {
            name,
            kind,
            size: None,
            mtime: None,
        });
    }
    entries
}

fn extract_hrefs(html: &str, max_links: usize) -> Vec<String> {
    let mut out = Vec::new();
    let mut rest = html;
    while out.len() < max_links {
        let Some(idx) = rest.find("href=") else {
            break;
        };
        rest = &rest[idx + 5..];
        let Some(quote) = rest.chars().next() else {
            break;
        };
        if quote != '"' && quote != '\'' {
            continue;
        }
        rest = &rest[1..];
        let Some(end) = rest.find(quote) else {
            break;
        };
        out.push(rest[..end].to_string());
        rest = &rest[end + 1..];
    }
    out
}

fn encode_rel(rel: &str) -> String {
    rel.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

fn dir_url(root: &str, rel: &str) -> String {
    if rel.is_empty() {
        root.to_string()
    } else {
        format!("{}{}/", root, encode_rel(rel))
    }
}

/// Bounded-prefix reads over HTTP, for embedded-tag extraction. Asks for a
/// byte range but also truncates locally in case the server ignores it.
pub struct HttpMediaFetcher {
    client: Client,
    timeout: Duration,
}

impl HttpMediaFetcher {
    pub fn new(client: Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }
}

#[async_trait]
impl MediaFetcher for HttpMediaFetcher {
    async fn fetch_prefix(&self, url: &str, max_bytes: u64) -> Result<Vec<u8>, MetadataError> {
        let mut response = self
            .client
            .get(url)
            .timeout(self.timeout)
            .header(RANGE, format!("bytes=0-{}", max_bytes.saturating_sub(1)))
            .send()
            .await
            .map_err(|err| MetadataError::Fetch(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(MetadataError::Fetch(format!("http {}", status.as_u16())));
        }

        let mut out = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|err| MetadataError::Fetch(err.to_string()))?
        {
            out.extend_from_slice(&chunk);
            if out.len() as u64 >= max_bytes {
                out.truncate(max_bytes as usize);
                break;
            }
        }
        Ok(out)
    }
}
