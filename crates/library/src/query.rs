use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use serde::Deserialize;
use tracing::warn;

use common::{
    album_key, artist_key, validate_filter_text, Album, Artist, Genre, Track, MAX_CATALOG_SIZE,
};

const GENRE_DELIMITERS: &[char] = &[';', ',', '/', '|', '\0'];

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct TrackFilter {
    pub artist: Option<String>,
    pub album: Option<String>,
    pub search: Option<String>,
}

/// Filtered, sorted track view. Sort order is (primary artist, album,
/// track number, title), case-insensitive.
pub fn tracks_query(snapshot: &[Track], filter: &TrackFilter) -> Vec<Track> {
    if !within_catalog_limit(snapshot, "tracks") {
        return Vec::new();
    }
    let Some(filter) = normalize_filter(filter) else {
        return Vec::new();
    };

    let mut tracks: Vec<Track> = snapshot
        .iter()
        .filter(|track| filter.matches(track))
        .cloned()
        .collect();

    tracks.sort_by(|a, b| {
        a.primary_artist()
            .to_lowercase()
            .cmp(&b.primary_artist().to_lowercase())
            .then_with(|| a.meta.album.to_lowercase().cmp(&b.meta.album.to_lowercase()))
            .then_with(|| track_order(a, b))
    });
    tracks
}

/// Albums regrouped from scratch on every call; they carry no state of
/// their own and so can never drift from the track set.
pub fn albums_query(snapshot: &[Track]) -> Vec<Album> {
    if !within_catalog_limit(snapshot, "albums") {
        return Vec::new();
    }

    let mut albums: HashMap<String, Album> = HashMap::new();
    for track in snapshot {
        let artist = track.primary_artist().to_string();
        let title = album_title_of(track);
        let key = album_key(&artist, &title);
        albums
            .entry(key.clone())
            .or_insert_with(|| Album {
                id: key,
                title,
                artist,
                year: None,
                cover: None,
                tracks: Vec::new(),
            })
            .tracks
            .push(track.clone());
    }

    let mut albums: Vec<Album> = albums
        .into_values()
        .map(|mut album| {
            album.tracks.sort_by(track_order);
            album.cover = album
                .tracks
                .iter()
                .find_map(|track| track.meta.cover.clone());
            album.year = album.tracks.iter().find_map(|track| track.meta.year);
            album
        })
        .collect();

    albums.sort_by(|a, b| {
        a.artist
            .to_lowercase()
            .cmp(&b.artist.to_lowercase())
            .then_with(|| a.title.to_lowercase().cmp(&b.title.to_lowercase()))
    });
    albums
}

/// Every artist credit on a track counts (fan-out), but the albums
/// attached to each artist keep their single global identity, so a shared
/// album shows up under several artists without splitting in two.
pub fn artists_query(snapshot: &[Track]) -> Vec<Artist> {
    if !within_catalog_limit(snapshot, "artists") {
        return Vec::new();
    }

    let albums = albums_query(snapshot);
    let album_by_id: HashMap<&str, &Album> =
        albums.iter().map(|album| (album.id.as_str(), album)).collect();

    struct Membership {
        name: String,
        album_ids: HashSet<String>,
    }

    let mut memberships: HashMap<String, Membership> = HashMap::new();
    for track in snapshot {
        let album_id = album_key(track.primary_artist(), &album_title_of(track));
        for name in credited_artists(track) {
            let entry = memberships
                .entry(artist_key(&name))
                .or_insert_with(|| Membership {
                    name: name.clone(),
                    album_ids: HashSet::new(),
                });
            entry.album_ids.insert(album_id.clone());
        }
    }

    let mut artists: Vec<Artist> = memberships
        .into_iter()
        .map(|(id, membership)| {
            let mut member_albums: Vec<Album> = membership
                .album_ids
                .iter()
                .filter_map(|album_id| album_by_id.get(album_id.as_str()).map(|a| (*a).clone()))
                .collect();
            member_albums
                .sort_by(|a, b| a.title.to_lowercase().cmp(&b.title.to_lowercase()));
            let track_count = member_albums.iter().map(|album| album.tracks.len()).sum();
            Artist {
                id,
                name: membership.name,
                album_count: member_albums.len(),
                track_count,
                albums: member_albums,
            }
        })
        .collect();

    artists.sort_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase()));
    artists
}

pub fn genres_query(snapshot: &[Track]) -> Vec<Genre> {
    if !within_catalog_limit(snapshot, "genres") {
        return Vec::new();
    }

    let mut tally: HashMap<String, Genre> = HashMap::new();
    for track in snapshot {
        let mut seen = HashSet::new();
        for value in track.meta.genres.iter() {
            for name in split_genres(value) {
                let key = name.to_lowercase();
                if !seen.insert(key.clone()) {
                    continue;
                }
                tally
                    .entry(key)
                    .or_insert_with(|| Genre {
                        name,
                        track_count: 0,
                    })
                    .track_count += 1;
            }
        }
    }

    let mut genres: Vec<Genre> = tally.into_values().collect();
    genres.sort_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase()));
    genres
}

/// Tags often pack several genres into one delimited string.
pub fn split_genres(value: &str) -> Vec<String> {
    let mut out = Vec::new();
    for part in value.split(GENRE_DELIMITERS) {
        let trimmed = part.trim();
        if !trimmed.is_empty() {
            out.push(trimmed.to_string());
        }
    }
    out
}

fn album_title_of(track: &Track) -> String {
    let title = track.meta.album.trim();
    if title.is_empty() {
        "Unknown Album".to_string()
    } else {
        title.to_string()
    }
}

fn credited_artists(track: &Track) -> Vec<String> {
    let names: Vec<String> = track
        .meta
        .artists
        .iter()
        .map(|name| name.trim())
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect();
    if names.is_empty() {
        vec![track.primary_artist().to_string()]
    } else {
        names
    }
}

fn track_order(a: &Track, b: &Track) -> Ordering {
    let number_a = a.meta.track_no.unwrap_or(u32::MAX);
    let number_b = b.meta.track_no.unwrap_or(u32::MAX);
    number_a
        .cmp(&number_b)
        .then_with(|| a.meta.title.to_lowercase().cmp(&b.meta.title.to_lowercase()))
        .then_with(|| a.id.cmp(&b.id))
}

fn within_catalog_limit(snapshot: &[Track], what: &str) -> bool {
    if snapshot.len() > MAX_CATALOG_SIZE {
        warn!(
            "Refusing {} aggregation over {} tracks (limit {})",
            what,
            snapshot.len(),
            MAX_CATALOG_SIZE
        );
        return false;
    }
    true
}

struct NormalizedFilter {
    artist: Option<String>,
    album: Option<String>,
    search: Option<String>,
}

impl NormalizedFilter {
    fn matches(&self, track: &Track) -> bool {
        if let Some(artist) = &self.artist {
            if !artist_fields(track).any(|name| name.to_lowercase().contains(artist)) {
                return false;
            }
        }
        if let Some(album) = &self.album {
            if !track.meta.album.to_lowercase().contains(album) {
                return false;
            }
        }
        if let Some(search) = &self.search {
            let in_title = track.meta.title.to_lowercase().contains(search);
            let in_album = track.meta.album.to_lowercase().contains(search);
            let in_artist = artist_fields(track).any(|name| name.to_lowercase().contains(search));
            if !in_title && !in_album && !in_artist {
                return false;
            }
        }
        true
    }
}

fn artist_fields(track: &Track) -> impl Iterator<Item = &str> {
    track
        .meta
        .artists
        .iter()
        .map(String::as_str)
        .chain(track.meta.album_artist.as_deref())
}

/// Returns None (and logs) when any filter string fails validation; the
/// query surface answers with an empty result instead of an error.
fn normalize_filter(filter: &TrackFilter) -> Option<NormalizedFilter> {
    let mut normalized = NormalizedFilter {
        artist: None,
        album: None,
        search: None,
    };
    for (value, slot) in [
        (&filter.artist, &mut normalized.artist),
        (&filter.album, &mut normalized.album),
        (&filter.search, &mut normalized.search),
    ] {
        if let Some(text) = value {
            if let Err(err) = validate_filter_text(text) {
                warn!("Rejecting track filter: {}", err);
                return None;
            }
            let trimmed = text.trim();
            if !trimmed.is_empty() {
                *slot = Some(trimmed.to_lowercase());
            }
        }
    }
    Some(normalized)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use common::{canonical_path, stable_id, CoverRef, OneOrMany, TrackMeta};

    fn track(path: &str, artists: &[&str], album: &str, track_no: Option<u32>) -> Track {
        let artists: Vec<String> = artists.iter().map(|s| s.to_string()).collect();
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
                artists: OneOrMany::Many(artists),
                album: album.to_string(),
                track_no,
                ..TrackMeta::default()
            },
        }
    }

    #[test]
    fn albums_group_deterministically_regardless_of_input_order() {
        let t2 = track("http://h/media/A/X/two.mp3", &["A"], "X", Some(2));
        let t1 = track("http://h/media/A/X/one.mp3", &["A"], "X", Some(1));

        for snapshot in [vec![t1.clone(), t2.clone()], vec![t2.clone(), t1.clone()]] {
            let albums = albums_query(&snapshot);
            assert_eq!(albums.len(), 1);
            let album = &albums[0];
            assert_eq!(album.title, "X");
            assert_eq!(album.artist, "A");
            let numbers: Vec<Option<u32>> =
                album.tracks.iter().map(|t| t.meta.track_no).collect();
            assert_eq!(numbers, vec![Some(1), Some(2)]);
        }
    }

    #[test]
    fn multi_artist_tracks_fan_out_but_albums_stay_singular() {
        let shared = track("http://h/media/A/X/duet.mp3", &["A", "B"], "X", Some(1));
        let snapshot = vec![shared];

        let albums = albums_query(&snapshot);
        assert_eq!(albums.len(), 1);
        assert_eq!(albums[0].artist, "A");

        let artists = artists_query(&snapshot);
        let names: Vec<&str> = artists.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["A", "B"]);
        // Both artist pages reference the same album identity.
        assert_eq!(artists[0].albums[0].id, artists[1].albums[0].id);
        assert_eq!(artists[0].track_count, 1);
        assert_eq!(artists[1].album_count, 1);
    }

    #[test]
    fn album_year_and_cover_come_from_first_track_that_has_them() {
        let mut t1 = track("http://h/media/A/X/01.mp3", &["A"], "X", Some(1));
        let mut t2 = track("http://h/media/A/X/02.mp3", &["A"], "X", Some(2));
        t2.meta.year = Some(1999);
        t2.meta.cover = Some(CoverRef::Embedded {
            track_id: t2.id.clone(),
        });
        t1.meta.year = None;

        let albums = albums_query(&[t1, t2]);
        assert_eq!(albums[0].year, Some(1999));
        assert!(albums[0].cover.is_some());
    }

    #[test]
    fn genres_split_and_dedupe_per_track() {
        let mut t1 = track("http://h/media/A/X/01.mp3", &["A"], "X", Some(1));
        t1.meta.genres = OneOrMany::One("Rock; Electronic;rock".to_string());
        let mut t2 = track("http://h/media/A/X/02.mp3", &["A"], "X", Some(2));
        t2.meta.genres = OneOrMany::Many(vec!["Rock".to_string()]);

        let genres = genres_query(&[t1, t2]);
        assert_eq!(genres.len(), 2);
        assert_eq!(genres[0].name, "Electronic");
        assert_eq!(genres[0].track_count, 1);
        assert_eq!(genres[1].name, "Rock");
        assert_eq!(genres[1].track_count, 2);
    }

    #[test]
    fn filters_combine_and_match_case_insensitively() {
        let snapshot = vec![
            track("http://h/media/A/X/one.mp3", &["Alpha"], "X", Some(1)),
            track("http://h/media/B/Y/two.mp3", &["Beta"], "Y", Some(1)),
        ];

        let by_artist = tracks_query(
            &snapshot,
            &TrackFilter {
                artist: Some("alp".to_string()),
                ..TrackFilter::default()
            },
        );
        assert_eq!(by_artist.len(), 1);
        assert_eq!(by_artist[0].meta.album, "X");

        let by_search = tracks_query(
            &snapshot,
            &TrackFilter {
                search: Some("TWO".to_string()),
                ..TrackFilter::default()
            },
        );
        assert_eq!(by_search.len(), 1);
        assert_eq!(by_search[0].meta.album, "Y");
    }

    #[test]
    fn hostile_filters_yield_empty_results_not_errors() {
        let snapshot = vec![track("http://h/media/A/X/one.mp3", &["A"], "X", Some(1))];

        let with_nul = tracks_query(
            &snapshot,
            &TrackFilter {
                search: Some("x\0y".to_string()),
                ..TrackFilter::default()
            },
        );
        assert!(with_nul.is_empty());

        let oversized = tracks_query(
            &snapshot,
            &TrackFilter {
                artist: Some("a".repeat(100_000)),
                ..TrackFilter::default()
            },
        );
        assert!(oversized.is_empty());
    }

    #[test]
    fn tracks_sort_by_artist_album_then_number() {
        let snapshot = vec![
            track("http://h/media/B/Y/one.mp3", &["B"], "Y", Some(1)),
            track("http://h/media/A/X/two.mp3", &["A"], "X", Some(2)),
            track("http://h/media/A/X/one.mp3", &["A"], "X", Some(1)),
        ];
        let tracks = tracks_query(&snapshot, &TrackFilter::default());
        let order: Vec<(String, Option<u32>)> = tracks
            .iter()
            .map(|t| (t.meta.album.clone(), t.meta.track_no))
            .collect();
        assert_eq!(
            order,
            vec![
                ("X".to_string(), Some(1)),
                ("X".to_string(), Some(2)),
                ("Y".to_string(), Some(1)),
            ]
        );
    }

    #[test]
    fn empty_album_groups_under_unknown() {
        let snapshot = vec![track("http://h/media/A/loose.mp3", &["A"], "", None)];
        let albums = albums_query(&snapshot);
        assert_eq!(albums[0].title, "Unknown Album");
    }
}
