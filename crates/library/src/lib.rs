mod catalog;
mod events;
pub mod query;

pub use events::{EventKind, LibraryEvent, Subscription};
pub use query::TrackFilter;

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::{BoxFuture, Shared};
use futures_util::FutureExt;
use parking_lot::{Mutex, RwLock};
use reqwest::Client;
use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use catalog::Catalog;
use common::{Album, Artist, Genre, Track};
use events::EventBus;
use metadata::{FactoryLimits, TrackFactory};
use scanner::{
    FileStamp, HttpMediaFetcher, RemoteFile, ScanMode, ScanSink, Scanner, ScannerConfig,
};

const USER_AGENT: &str = "tonearm/0.1";

#[derive(Clone, Debug)]
pub enum LibraryError {
    Client(String),
    Scan(String),
}

impl std::fmt::Display for LibraryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LibraryError::Client(err) => write!(f, "client error: {}", err),
            LibraryError::Scan(err) => write!(f, "scan error: {}", err),
        }
    }
}

impl std::error::Error for LibraryError {}

#[derive(Clone, Debug, Serialize)]
pub struct LibraryStats {
    pub artists: usize,
    pub albums: usize,
    pub tracks: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanStatus {
    Idle,
    Scanning,
    Complete,
    Error,
}

#[derive(Clone, Debug, Serialize)]
pub struct ScanProgress {
    pub status: ScanStatus,
    pub files_scanned: usize,
    pub files_found: usize,
    pub current_file: Option<String>,
    pub error: Option<String>,
}

impl Default for ScanProgress {
    fn default() -> Self {
        Self {
            status: ScanStatus::Idle,
            files_scanned: 0,
            files_found: 0,
            current_file: None,
            error: None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ScanSummary {
    pub tracks_found: usize,
    pub files_scanned: usize,
    pub aborted: bool,
}

/// Handle to an in-flight (or finished) scan. Cloneable; awaiting a clone
/// of an active scan joins it instead of starting another.
pub type ScanFuture = Shared<BoxFuture<'static, Result<ScanSummary, LibraryError>>>;

#[derive(Clone, Debug, Default)]
pub struct EngineConfig {
    pub scanner: ScannerConfig,
    pub factory: FactoryLimits,
    /// Walk root paths in bounded batches instead of one at a time.
    pub parallel: bool,
}

/// Owns the catalog and drives scans end to end. Cheap to clone; all
/// clones share one catalog and one event registry.
#[derive(Clone)]
pub struct Library {
    inner: Arc<LibraryInner>,
}

struct LibraryInner {
    catalog: RwLock<Catalog>,
    progress: RwLock<ScanProgress>,
    events: EventBus,
    scanner: Scanner,
    factory: TrackFactory,
    fetcher: HttpMediaFetcher,
    parallel: bool,
    active_scan: Mutex<Option<ScanFuture>>,
    cancel: Mutex<Option<CancellationToken>>,
}

impl Library {
    pub fn new(config: EngineConfig) -> Result<Self, LibraryError> {
        let fetch_timeout = config.scanner.fetch_timeout;
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .map_err(|err| LibraryError::Client(err.to_string()))?;
        let fetcher = HttpMediaFetcher::new(client.clone(), fetch_timeout);
        let scanner = Scanner::new(client, config.scanner);

        Ok(Self {
            inner: Arc::new(LibraryInner {
                catalog: RwLock::new(Catalog::default()),
                progress: RwLock::new(ScanProgress::default()),
                events: EventBus::default(),
                scanner,
                factory: TrackFactory::new(config.factory),
                fetcher,
                parallel: config.parallel,
                active_scan: Mutex::new(None),
                cancel: Mutex::new(None),
            }),
        })
    }

    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> Subscription
    where
        F: Fn(&LibraryEvent) + Send + Sync + 'static,
    {
        self.inner.events.subscribe(kind, handler)
    }

    pub fn unsubscribe(&self, subscription: &Subscription) {
        self.inner.events.unsubscribe(subscription);
    }

    /// Starts a scan, or joins the one already in flight: there is never
    /// more than one walk mutating the shared catalog. Must be called
    /// from within a tokio runtime.
    pub fn scan(&self, roots: Vec<String>) -> ScanFuture {
        let mut active = self.inner.active_scan.lock();
        if let Some(in_flight) = active.as_ref() {
            return in_flight.clone();
        }

        let inner = Arc::clone(&self.inner);
        let future: ScanFuture = async move { LibraryInner::run_scan(inner, roots).await }
            .boxed()
            .shared();
        *active = Some(future.clone());

        // Drive the scan even if every caller drops its handle.
        tokio::spawn(future.clone().map(|_| ()));
        future
    }

    /// Cooperative: the walk observes the flag at its next checkpoint.
    pub fn cancel_scan(&self) {
        if let Some(token) = self.inner.cancel.lock().as_ref() {
            info!("Cancelling scan");
            token.cancel();
        }
    }

    /// Rehydrates the catalog from a persisted snapshot; no network.
    pub fn restore(&self, tracks: Vec<Track>) {
        info!("Restoring {} tracks from snapshot", tracks.len());
        self.inner.catalog.write().restore(tracks);
        self.inner.events.emit(&LibraryEvent::LibraryUpdated);
    }

    pub fn clear(&self) {
        self.inner.catalog.write().clear();
        *self.inner.progress.write() = ScanProgress::default();
        self.inner.events.emit(&LibraryEvent::LibraryUpdated);
    }

    pub fn get_tracks(&self, filter: &TrackFilter) -> Vec<Track> {
        query::tracks_query(&self.snapshot(), filter)
    }

    pub fn get_albums(&self) -> Vec<Album> {
        query::albums_query(&self.snapshot())
    }

    pub fn get_artists(&self) -> Vec<Artist> {
        query::artists_query(&self.snapshot())
    }

    pub fn get_genres(&self) -> Vec<Genre> {
        query::genres_query(&self.snapshot())
    }

    pub fn get_stats(&self) -> LibraryStats {
        let snapshot = self.snapshot();
        LibraryStats {
            artists: query::artists_query(&snapshot).len(),
            albums: query::albums_query(&snapshot).len(),
            tracks: snapshot.len(),
        }
    }

    pub fn get_scan_progress(&self) -> ScanProgress {
        self.inner.progress.read().clone()
    }

    pub fn get_track(&self, track_id: &str) -> Option<Track> {
        self.inner.catalog.read().get(track_id).cloned()
    }

    /// Lazily completes a cheaply-indexed track. Safe to call repeatedly;
    /// once cover art is present nothing is fetched.
    pub async fn hydrate(&self, track_id: &str) -> bool {
        let Some(mut track) = self.get_track(track_id) else {
            return false;
        };
        let updated = self
            .inner
            .factory
            .hydrate_track(&mut track, &self.inner.fetcher)
            .await;
        if updated {
            self.inner.catalog.write().upsert(track);
            self.inner.events.emit(&LibraryEvent::LibraryUpdated);
        }
        updated
    }

    /// The raw track set, for external persistence collaborators. Unlike
    /// the query surface this is not size-guarded: a snapshot must never
    /// silently come back empty.
    pub fn export_tracks(&self) -> Vec<Track> {
        self.snapshot()
    }

    fn snapshot(&self) -> Vec<Track> {
        self.inner.catalog.read().snapshot()
    }
}

impl LibraryInner {
    async fn run_scan(
        inner: Arc<LibraryInner>,
        roots: Vec<String>,
    ) -> Result<ScanSummary, LibraryError> {
        let result = LibraryInner::scan_pass(&inner, roots).await;
        *inner.active_scan.lock() = None;
        *inner.cancel.lock() = None;
        result
    }

    async fn scan_pass(
        inner: &Arc<LibraryInner>,
        roots: Vec<String>,
    ) -> Result<ScanSummary, LibraryError> {
        {
            let mut progress = inner.progress.write();
            *progress = ScanProgress {
                status: ScanStatus::Scanning,
                ..ScanProgress::default()
            };
        }
        inner.events.emit(&LibraryEvent::ScanStart);
        info!("Scan started over {} root paths", roots.len());

        let token = CancellationToken::new();
        *inner.cancel.lock() = Some(token.clone());

        // The walk runs in its own task so a panic anywhere inside it
        // surfaces as a join error instead of corrupting the catalog.
        let walker = {
            let inner = Arc::clone(inner);
            let token = token.clone();
            tokio::spawn(async move {
                let sink = AsyncMutex::new(ScanBridge {
                    inner: Arc::clone(&inner),
                    found: HashSet::new(),
                    files_scanned: 0,
                });
                let mode = if inner.parallel {
                    ScanMode::Parallel
                } else {
                    ScanMode::Sequential
                };
                inner.scanner.scan_paths(&roots, &sink, mode, &token).await;
                sink.into_inner()
            })
        };

        let bridge = match walker.await {
            Ok(bridge) => bridge,
            Err(err) => {
                let message = err.to_string();
                {
                    let mut progress = inner.progress.write();
                    progress.status = ScanStatus::Error;
                    progress.error = Some(message.clone());
                    progress.current_file = None;
                }
                warn!("Scan failed: {}", message);
                inner
                    .events
                    .emit(&LibraryEvent::ScanError {
                        error: message.clone(),
                    });
                return Err(LibraryError::Scan(message));
            }
        };

        let aborted = token.is_cancelled();
        if aborted {
            // A cancelled pass never deletes: whatever it saw is kept,
            // whatever it did not reach stays indexed.
            info!(
                "Scan cancelled after {} files; catalog left as-is",
                bridge.files_scanned
            );
        } else {
            let removed = { inner.catalog.write().remove_orphans(&bridge.found) };
            if !removed.is_empty() {
                info!("Removed {} orphaned tracks", removed.len());
            }
            for track in removed {
                inner.events.emit(&LibraryEvent::TrackRemoved { track });
            }
            let backfilled = { inner.catalog.write().backfill_covers() };
            if backfilled > 0 {
                info!("Backfilled cover art for {} tracks", backfilled);
            }
        }

        let summary = ScanSummary {
            tracks_found: bridge.found.len(),
            files_scanned: bridge.files_scanned,
            aborted,
        };
        {
            let mut progress = inner.progress.write();
            progress.status = ScanStatus::Complete;
            progress.current_file = None;
        }
        info!(
            "Scan complete: {} files found, {} scanned",
            summary.tracks_found, summary.files_scanned
        );
        inner.events.emit(&LibraryEvent::ScanComplete {
            tracks_found: summary.tracks_found,
            aborted,
        });
        inner.events.emit(&LibraryEvent::LibraryUpdated);
        Ok(summary)
    }
}

/// Bridges the scanner into the catalog: change-detection lookups on the
/// way in, factory + catalog + events on the way out.
struct ScanBridge {
    inner: Arc<LibraryInner>,
    found: HashSet<String>,
    files_scanned: usize,
}

#[async_trait]
impl ScanSink for ScanBridge {
    fn stamp(&self, canonical: &str) -> Option<FileStamp> {
        self.inner
            .catalog
            .read()
            .track_at(canonical)
            .map(|track| FileStamp {
                size: track.size,
                modified: track.modified,
            })
    }

    async fn file_found(&mut self, file: RemoteFile, changed: bool) {
        self.found.insert(file.canonical.clone());
        self.files_scanned += 1;
        {
            let mut progress = self.inner.progress.write();
            progress.files_scanned = self.files_scanned;
            progress.files_found = self.found.len();
            progress.current_file = Some(file.filename.clone());
        }
        self.inner.events.emit(&LibraryEvent::ScanProgress {
            files_scanned: self.files_scanned,
            current_file: file.filename.clone(),
        });

        if !changed {
            return;
        }

        let track = self
            .inner
            .factory
            .create_track(
                &file.root,
                &file.rel_path,
                file.size.unwrap_or(0),
                file.modified,
                &self.inner.fetcher,
            )
            .await;
        let is_new = { self.inner.catalog.write().upsert(track.clone()) };
        if is_new {
            self.inner.events.emit(&LibraryEvent::TrackAdded { track });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use common::{canonical_path, stable_id, OneOrMany, TrackMeta};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn library() -> Library {
        Library::new(EngineConfig::default()).unwrap()
    }

    fn track(path: &str, artist: &str, album: &str, track_no: Option<u32>) -> Track {
        Track {
            id: stable_id(&canonical_path(path)),
            path: path.to_string(),
            filename: common::file_name_of(path).to_string(),
            mime: "audio/mpeg".to_string(),
            size: 100,
            modified: None,
            added: Utc::now(),
            meta: TrackMeta {
                title: common::file_stem(common::file_name_of(path)).to_string(),
                artists: OneOrMany::One(artist.to_string()),
                album: album.to_string(),
                track_no,
                ..TrackMeta::default()
            },
        }
    }

    #[tokio::test]
    async fn restore_feeds_the_whole_query_surface() {
        let library = library();
        library.restore(vec![
            track("http://h/media/A/X/01.mp3", "A", "X", Some(1)),
            track("http://h/media/A/X/02.mp3", "A", "X", Some(2)),
            track("http://h/media/B/Y/01.mp3", "B", "Y", Some(1)),
        ]);

        let stats = library.get_stats();
        assert_eq!(stats.tracks, 3);
        assert_eq!(stats.albums, 2);
        assert_eq!(stats.artists, 2);

        let filtered = library.get_tracks(&TrackFilter {
            album: Some("X".to_string()),
            ..TrackFilter::default()
        });
        assert_eq!(filtered.len(), 2);

        assert_eq!(library.get_scan_progress().status, ScanStatus::Idle);
    }

    #[tokio::test]
    async fn clear_empties_catalog_and_resets_progress() {
        let library = library();
        library.restore(vec![track("http://h/media/A/X/01.mp3", "A", "X", Some(1))]);
        library.clear();
        assert_eq!(library.get_stats().tracks, 0);
        assert_eq!(library.get_scan_progress().status, ScanStatus::Idle);
    }

    #[tokio::test]
    async fn scan_over_rejected_roots_still_completes_cleanly() {
        let library = library();
        let starts = Arc::new(AtomicUsize::new(0));
        let completes = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&starts);
        library.subscribe(EventKind::ScanStart, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let counter = Arc::clone(&completes);
        library.subscribe(EventKind::ScanComplete, move |event| {
            if let LibraryEvent::ScanComplete { aborted, .. } = event {
                assert!(!*aborted);
            }
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let summary = library
            .scan(vec!["ftp://not-allowed/media/".to_string()])
            .await
            .unwrap();
        assert_eq!(summary.tracks_found, 0);
        assert!(!summary.aborted);
        assert_eq!(starts.load(Ordering::SeqCst), 1);
        assert_eq!(completes.load(Ordering::SeqCst), 1);
        assert_eq!(library.get_scan_progress().status, ScanStatus::Complete);
    }

    #[tokio::test]
    async fn concurrent_scan_calls_share_one_pass() {
        let library = library();
        let starts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&starts);
        library.subscribe(EventKind::ScanStart, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let first = library.scan(vec!["ftp://rejected/".to_string()]);
        let second = library.scan(vec!["ftp://rejected/".to_string()]);
        let (a, b) = futures_util::join!(first, second);
        assert!(a.is_ok());
        assert!(b.is_ok());
        assert_eq!(starts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancel_without_scan_is_a_no_op() {
        let library = library();
        library.cancel_scan();
        assert_eq!(library.get_scan_progress().status, ScanStatus::Idle);
    }

    #[tokio::test]
    async fn hydrate_unknown_track_reports_false() {
        let library = library();
        assert!(!library.hydrate("missing").await);
    }
}
