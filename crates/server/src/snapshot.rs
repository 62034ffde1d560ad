use std::path::Path;

use tracing::{info, warn};

use crate::state::AppState;
use common::Track;
use library::EventKind;

/// Loads the persisted catalog, if any. A corrupt file is logged and
/// ignored; the next completed scan rewrites it.
pub async fn load_snapshot(path: &Path) -> Option<Vec<Track>> {
    let data = match tokio::fs::read(path).await {
        Ok(data) => data,
        Err(_) => return None,
    };
    match serde_json::from_slice::<Vec<Track>>(&data) {
        Ok(tracks) => {
            info!("Loaded snapshot with {} tracks from {:?}", tracks.len(), path);
            Some(tracks)
        }
        Err(err) => {
            warn!("Ignoring unreadable snapshot {:?}: {}", path, err);
            None
        }
    }
}

/// Writes the catalog back to disk every time the engine announces a
/// change. Burst updates are coalesced into one write.
pub fn spawn_persistence(state: &AppState) {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    state.library.subscribe(EventKind::LibraryUpdated, move |_| {
        let _ = tx.send(());
    });

    let library = state.library.clone();
    let path = state.snapshot_path.clone();
    tokio::spawn(async move {
        while rx.recv().await.is_some() {
            while rx.try_recv().is_ok() {}
            write_snapshot(&path, &library.export_tracks()).await;
        }
    });
}

async fn write_snapshot(path: &Path, tracks: &[Track]) {
    let json = match serde_json::to_vec(tracks) {
        Ok(json) => json,
        Err(err) => {
            warn!("Failed to serialize snapshot: {}", err);
            return;
        }
    };
    if let Err(err) = tokio::fs::write(path, json).await {
        warn!("Failed to write snapshot {:?}: {}", path, err);
    } else {
        info!("Wrote snapshot with {} tracks to {:?}", tracks.len(), path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use common::{canonical_path, stable_id, TrackMeta};

    fn track(path: &str) -> Track {
        Track {
            id: stable_id(&canonical_path(path)),
            path: path.to_string(),
            filename: common::file_name_of(path).to_string(),
            mime: "audio/mpeg".to_string(),
            size: 42,
            modified: Some(Utc::now()),
            added: Utc::now(),
            meta: TrackMeta::default(),
        }
    }

    #[tokio::test]
    async fn snapshot_roundtrip_preserves_tracks_and_dates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("library.json");

        let tracks = vec![track("http://h/media/a.mp3"), track("http://h/media/b.mp3")];
        write_snapshot(&path, &tracks).await;

        let restored = load_snapshot(&path).await.unwrap();
        assert_eq!(restored.len(), 2);
        assert_eq!(restored[0].id, tracks[0].id);
        assert_eq!(restored[0].modified, tracks[0].modified);
    }

    #[tokio::test]
    async fn corrupt_snapshot_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("library.json");
        tokio::fs::write(&path, b"{not json").await.unwrap();
        assert!(load_snapshot(&path).await.is_none());
    }

    #[tokio::test]
    async fn missing_snapshot_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_snapshot(&dir.path().join("absent.json")).await.is_none());
    }
}
