use std::io::Cursor;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lofty::error::LoftyError;
use lofty::file::FileType;
use lofty::picture::{Picture, PictureType};
use lofty::prelude::{AudioFile, ItemKey, TaggedFileExt};
use lofty::probe::Probe;
use tracing::debug;

use common::{
    canonical_path, file_ext, file_name_of, file_stem, media_type_for_ext, stable_id, CoverRef,
    OneOrMany, Track, TrackMeta,
};

#[derive(Debug, Default, Clone)]
pub struct TagInfo {
    pub title: Option<String>,
    pub artists: Vec<String>,
    pub album: Option<String>,
    pub album_artist: Option<String>,
    pub track_no: Option<u32>,
    pub year: Option<i32>,
    pub duration_ms: Option<u32>,
    pub genres: Vec<String>,
    pub cover_len: Option<usize>,
}

#[derive(Debug)]
pub enum MetadataError {
    Io(std::io::Error),
    Lofty(LoftyError),
    Fetch(String),
}

impl std::fmt::Display for MetadataError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MetadataError::Io(err) => write!(f, "io error: {}", err),
            MetadataError::Lofty(err) => write!(f, "tag error: {}", err),
            MetadataError::Fetch(err) => write!(f, "fetch error: {}", err),
        }
    }
}

impl std::error::Error for MetadataError {}

impl From<std::io::Error> for MetadataError {
    fn from(err: std::io::Error) -> Self {
        MetadataError::Io(err)
    }
}

impl From<LoftyError> for MetadataError {
    fn from(err: LoftyError) -> Self {
        MetadataError::Lofty(err)
    }
}

/// Supplies a bounded prefix of a remote file for tag extraction. The
/// scanner provides an HTTP-backed implementation; tests use in-memory
/// doubles.
#[async_trait]
pub trait MediaFetcher: Send + Sync {
    async fn fetch_prefix(&self, url: &str, max_bytes: u64) -> Result<Vec<u8>, MetadataError>;
}

#[derive(Clone, Debug)]
pub struct FactoryLimits {
    /// Read budget for embedded-tag extraction per file.
    pub max_read_bytes: u64,
    /// Cover art above this size is dropped; other tag fields still apply.
    pub max_cover_bytes: usize,
    /// Path segments skipped before the Artist/Album/Title interpretation.
    pub root_markers: Vec<String>,
}

impl Default for FactoryLimits {
    fn default() -> Self {
        Self {
            max_read_bytes: 2 * 1024 * 1024,
            max_cover_bytes: 1024 * 1024,
            root_markers: vec!["media".to_string(), "music".to_string()],
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct TrackFactory {
    limits: FactoryLimits,
}

impl TrackFactory {
    pub fn new(limits: FactoryLimits) -> Self {
        Self { limits }
    }

    /// Builds a fully-populated track from a listing tuple. Path-structure
    /// heuristics fill the metadata first; embedded tags, when the bounded
    /// read yields any, override them field by field. Extraction failure is
    /// not an error.
    pub async fn create_track(
        &self,
        root: &str,
        filename: &str,
        size: u64,
        modified: Option<DateTime<Utc>>,
        fetcher: &dyn MediaFetcher,
    ) -> Track {
        let url = join_url(root, filename);
        let canonical = canonical_path(&url);
        let id = stable_id(&canonical);
        let name = file_name_of(filename).to_string();
        let mime = file_ext(&name)
            .as_deref()
            .and_then(media_type_for_ext)
            .unwrap_or("application/octet-stream")
            .to_string();

        let mut meta = self.guess_from_path(&canonical, &name);
        self.extract_into(&mut meta, &url, &name, &id, fetcher).await;

        Track {
            id,
            path: url,
            filename: name,
            mime,
            size,
            modified,
            added: Utc::now(),
            meta,
        }
    }

    /// Lazily completes a track indexed without embedded extraction.
    /// Idempotent: once cover art is present this does nothing.
    pub async fn hydrate_track(&self, track: &mut Track, fetcher: &dyn MediaFetcher) -> bool {
        if track.meta.cover.is_some() {
            return false;
        }
        let url = track.path.clone();
        let name = track.filename.clone();
        let id = track.id.clone();
        let mut meta = track.meta.clone();
        self.extract_into(&mut meta, &url, &name, &id, fetcher).await;
        let updated = meta.cover.is_some();
        track.meta = meta;
        updated
    }

    fn guess_from_path(&self, canonical: &str, filename: &str) -> TrackMeta {
        let segments: Vec<&str> = canonical
            .split('/')
            .filter(|segment| !segment.is_empty())
            .filter(|segment| {
                let lower = segment.to_lowercase();
                !self.limits.root_markers.iter().any(|marker| *marker == lower)
            })
            .collect();

        let mut meta = TrackMeta::default();
        let raw_title = match segments.len() {
            0 => file_stem(filename).to_string(),
            1 => file_stem(segments[0]).to_string(),
            2 => {
                meta.artists = OneOrMany::One(normalize_display(segments[0]));
                file_stem(segments[1]).to_string()
            }
            _ => {
                meta.artists = OneOrMany::One(normalize_display(segments[0]));
                let (year, album) = split_year_prefix(segments[1]);
                meta.year = year;
                meta.album = normalize_display(album);
                file_stem(segments[segments.len() - 1]).to_string()
            }
        };

        let (track_no, title) = split_track_prefix(&raw_title);
        meta.track_no = track_no;
        meta.title = normalize_display(title);
        meta
    }

    async fn extract_into(
        &self,
        meta: &mut TrackMeta,
        url: &str,
        filename: &str,
        track_id: &str,
        fetcher: &dyn MediaFetcher,
    ) {
        let bytes = match fetcher.fetch_prefix(url, self.limits.max_read_bytes).await {
            Ok(bytes) if !bytes.is_empty() => bytes,
            Ok(_) => return,
            Err(err) => {
                debug!("Tag fetch failed for {}: {}", url, err);
                return;
            }
        };

        let info = match read_tags_from_slice(&bytes, file_ext(filename).as_deref()) {
            Ok(info) => info,
            Err(err) => {
                debug!("Tag parse failed for {}: {}", url, err);
                return;
            }
        };

        apply_tags(meta, &info, track_id, self.limits.max_cover_bytes);
    }
}

/// Parses embedded tags out of an in-memory file prefix. The extension
/// hint avoids content sniffing when the container is already known.
pub fn read_tags_from_slice(bytes: &[u8], ext: Option<&str>) -> Result<TagInfo, MetadataError> {
    let tagged_file = match ext.and_then(FileType::from_ext) {
        Some(file_type) => Probe::with_file_type(Cursor::new(bytes), file_type).read()?,
        None => Probe::new(Cursor::new(bytes)).guess_file_type()?.read()?,
    };
    let properties = tagged_file.properties();

    let mut info = TagInfo::default();

    let duration_ms = properties.duration().as_millis();
    if duration_ms > 0 {
        info.duration_ms = Some(duration_ms.min(u128::from(u32::MAX)) as u32);
    }

    if let Some(tag) = tagged_file.primary_tag().or_else(|| tagged_file.first_tag()) {
        info.title = tag.get_string(&ItemKey::TrackTitle).map(|v| v.to_string());
        info.album = tag.get_string(&ItemKey::AlbumTitle).map(|v| v.to_string());
        info.album_artist = tag.get_string(&ItemKey::AlbumArtist).map(|v| v.to_string());
        info.artists = collect_values(tag.get_strings(&ItemKey::TrackArtist));
        info.track_no = tag.get_string(&ItemKey::TrackNumber).and_then(parse_u32);
        info.year = tag.get_string(&ItemKey::Year).and_then(parse_year);
        info.genres = collect_values(tag.get_strings(&ItemKey::Genre));
        info.cover_len = pick_picture(tag.pictures()).map(|picture| picture.data().len());
    }

    Ok(info)
}

fn apply_tags(meta: &mut TrackMeta, info: &TagInfo, track_id: &str, max_cover_bytes: usize) {
    if let Some(title) = non_empty(info.title.as_deref()) {
        meta.title = title;
    }
    if !info.artists.is_empty() {
        meta.artists = OneOrMany::Many(info.artists.clone());
    }
    if let Some(album) = non_empty(info.album.as_deref()) {
        meta.album = album;
    }
    if let Some(album_artist) = non_empty(info.album_artist.as_deref()) {
        meta.album_artist = Some(album_artist);
    }
    if info.year.is_some() {
        meta.year = info.year;
    }
    if info.track_no.is_some() {
        meta.track_no = info.track_no;
    }
    if !info.genres.is_empty() {
        meta.genres = OneOrMany::Many(info.genres.clone());
    }
    if info.duration_ms.is_some() {
        meta.duration_ms = info.duration_ms;
    }
    if let Some(len) = info.cover_len {
        if len <= max_cover_bytes {
            meta.cover = Some(CoverRef::Embedded {
                track_id: track_id.to_string(),
            });
        }
    }
}

fn join_url(root: &str, rel: &str) -> String {
    let mut url = root.trim_end_matches('/').to_string();
    for part in rel.split('/') {
        if part.is_empty() {
            continue;
        }
        url.push('/');
        url.push_str(part);
    }
    url
}

fn collect_values<'a>(values: impl Iterator<Item = &'a str>) -> Vec<String> {
    let mut out = Vec::new();
    for value in values {
        for part in value.split(';') {
            let trimmed = part.trim();
            if !trimmed.is_empty() {
                out.push(trimmed.to_string());
            }
        }
    }
    out
}

fn non_empty(value: Option<&str>) -> Option<String> {
    let trimmed = value?.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// `"YYYY - Album"` folder convention.
fn split_year_prefix(album: &str) -> (Option<i32>, &str) {
    let trimmed = album.trim();
    if trimmed.len() >= 5 && trimmed.as_bytes()[..4].iter().all(u8::is_ascii_digit) {
        let rest = trimmed[4..].trim_start();
        if let Some(rest) = rest.strip_prefix('-') {
            let rest = rest.trim_start();
            if !rest.is_empty() {
                if let Ok(year) = trimmed[..4].parse::<i32>() {
                    return (Some(year), rest);
                }
            }
        }
    }
    (None, trimmed)
}

/// `"NN - Title"` / `"NN. Title"` filename convention. Three digits at
/// most, so a leading year never reads as a track number.
fn split_track_prefix(title: &str) -> (Option<u32>, &str) {
    let trimmed = title.trim_start();
    let digits = trimmed
        .bytes()
        .take_while(u8::is_ascii_digit)
        .count();
    if digits == 0 || digits > 3 {
        return (None, title);
    }
    let rest = trimmed[digits..].trim_start();
    if let Some(rest) = rest.strip_prefix(['-', '.']) {
        let rest = rest.trim_start();
        if !rest.is_empty() {
            if let Ok(number) = trimmed[..digits].parse::<u32>() {
                return (Some(number), rest);
            }
        }
    }
    (None, title)
}

fn normalize_display(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut last_space = true;
    for ch in value.chars() {
        let ch = if ch == '_' { ' ' } else { ch };
        if ch.is_whitespace() {
            if !last_space {
                out.push(' ');
                last_space = true;
            }
        } else {
            out.push(ch);
            last_space = false;
        }
    }
    out.trim_end().to_string()
}

fn parse_u32(text: &str) -> Option<u32> {
    let head = text.split('/').next().unwrap_or(text).trim();
    head.parse().ok()
}

fn parse_year(text: &str) -> Option<i32> {
    let mut digits = String::new();
    for ch in text.chars() {
        if ch.is_ascii_digit() {
            digits.push(ch);
            if digits.len() == 4 {
                break;
            }
        } else if !digits.is_empty() {
            break;
        }
    }
    if digits.is_empty() {
        None
    } else {
        digits.parse().ok()
    }
}

fn pick_picture(pictures: &[Picture]) -> Option<&Picture> {
    pictures
        .iter()
        .find(|picture| picture.pic_type() == PictureType::CoverFront)
        .or_else(|| pictures.first())
}
