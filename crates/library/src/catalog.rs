use std::collections::{HashMap, HashSet};

use common::{canonical_path, Track};

use crate::query;

/// The authoritative track set: `id -> track` plus the `path -> id` index
/// used by change detection. The two maps are only ever mutated together.
#[derive(Clone, Debug, Default)]
pub struct Catalog {
    tracks: HashMap<String, Track>,
    by_path: HashMap<String, String>,
}

impl Catalog {
    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn get(&self, track_id: &str) -> Option<&Track> {
        self.tracks.get(track_id)
    }

    pub fn track_at(&self, canonical: &str) -> Option<&Track> {
        self.by_path
            .get(canonical)
            .and_then(|id| self.tracks.get(id))
    }

    /// Inserts or replaces in place. A replaced track keeps its original
    /// added-at timestamp. Returns true when the track is new.
    pub fn upsert(&mut self, mut track: Track) -> bool {
        let canonical = canonical_path(&track.path);
        let is_new = match self.tracks.get(&track.id) {
            Some(existing) => {
                track.added = existing.added;
                false
            }
            None => true,
        };
        self.by_path.insert(canonical, track.id.clone());
        self.tracks.insert(track.id.clone(), track);
        is_new
    }

    /// Drops every track whose canonical path is absent from the given
    /// found-set. Only called after a completed, non-cancelled pass.
    pub fn remove_orphans(&mut self, found: &HashSet<String>) -> Vec<Track> {
        let orphan_paths: Vec<String> = self
            .by_path
            .keys()
            .filter(|path| !found.contains(*path))
            .cloned()
            .collect();

        let mut removed = Vec::new();
        for path in orphan_paths {
            if let Some(id) = self.by_path.remove(&path) {
                if let Some(track) = self.tracks.remove(&id) {
                    removed.push(track);
                }
            }
        }
        removed
    }

    /// Post-scan enrichment: tracks without cover art inherit their
    /// album's representative cover.
    pub fn backfill_covers(&mut self) -> usize {
        let snapshot = self.snapshot();
        let mut updated = 0;
        for album in query::albums_query(&snapshot) {
            let Some(cover) = album.cover else {
                continue;
            };
            for member in &album.tracks {
                if member.meta.cover.is_some() {
                    continue;
                }
                if let Some(track) = self.tracks.get_mut(&member.id) {
                    if track.meta.cover.is_none() {
                        track.meta.cover = Some(cover.clone());
                        updated += 1;
                    }
                }
            }
        }
        updated
    }

    pub fn snapshot(&self) -> Vec<Track> {
        self.tracks.values().cloned().collect()
    }

    pub fn restore(&mut self, tracks: Vec<Track>) {
        self.clear();
        for track in tracks {
            self.by_path
                .insert(canonical_path(&track.path), track.id.clone());
            self.tracks.insert(track.id.clone(), track);
        }
    }

    pub fn clear(&mut self) {
        self.tracks.clear();
        self.by_path.clear();
    }
}
