use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const MAX_PATH_LEN: usize = 4096;
pub const MAX_NAME_LEN: usize = 255;
pub const MAX_FILTER_LEN: usize = 512;
pub const MAX_CATALOG_SIZE: usize = 100_000;

const KEY_SEP: char = '\x1f';

/// A field that tags may carry as either a single value or a list.
/// Artist and genre credits come in both shapes; every consumer goes
/// through `as_slice`/`first` instead of matching on the variant.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> OneOrMany<T> {
    pub fn as_slice(&self) -> &[T] {
        match self {
            OneOrMany::One(value) => std::slice::from_ref(value),
            OneOrMany::Many(values) => values.as_slice(),
        }
    }

    pub fn first(&self) -> Option<&T> {
        self.as_slice().first()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.as_slice().iter()
    }

    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.as_slice().is_empty()
    }
}

impl<T> Default for OneOrMany<T> {
    fn default() -> Self {
        OneOrMany::Many(Vec::new())
    }
}

impl<T> From<T> for OneOrMany<T> {
    fn from(value: T) -> Self {
        OneOrMany::One(value)
    }
}

impl<T> From<Vec<T>> for OneOrMany<T> {
    fn from(values: Vec<T>) -> Self {
        OneOrMany::Many(values)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoverRef {
    Embedded { track_id: String },
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackMeta {
    pub title: String,
    pub artists: OneOrMany<String>,
    pub album: String,
    pub album_artist: Option<String>,
    pub year: Option<i32>,
    pub track_no: Option<u32>,
    pub genres: OneOrMany<String>,
    pub cover: Option<CoverRef>,
    pub duration_ms: Option<u32>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Track {
    pub id: String,
    pub path: String,
    pub filename: String,
    pub mime: String,
    pub size: u64,
    #[serde(default)]
    pub modified: Option<DateTime<Utc>>,
    pub added: DateTime<Utc>,
    #[serde(default)]
    pub meta: TrackMeta,
}

impl Track {
    /// Album-artist wins over the first track artist; album identity is
    /// always keyed by this value even for multi-artist tracks.
    pub fn primary_artist(&self) -> &str {
        if let Some(album_artist) = self.meta.album_artist.as_deref() {
            if !album_artist.trim().is_empty() {
                return album_artist;
            }
        }
        self.meta
            .artists
            .first()
            .map(String::as_str)
            .filter(|name| !name.trim().is_empty())
            .unwrap_or("Unknown Artist")
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Album {
    pub id: String,
    pub title: String,
    pub artist: String,
    pub year: Option<i32>,
    pub cover: Option<CoverRef>,
    pub tracks: Vec<Track>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Artist {
    pub id: String,
    pub name: String,
    pub albums: Vec<Album>,
    pub album_count: usize,
    pub track_count: usize,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Genre {
    pub name: String,
    pub track_count: usize,
}

/// Supported container types. Extensions outside this list are never
/// indexed, whatever shape the listing response takes.
pub fn media_type_for_ext(ext: &str) -> Option<&'static str> {
    match ext {
        "mp3" => Some("audio/mpeg"),
        "flac" => Some("audio/flac"),
        "wav" => Some("audio/wav"),
        "ogg" | "oga" => Some("audio/ogg"),
        "opus" => Some("audio/opus"),
        "m4a" | "alac" => Some("audio/mp4"),
        "aac" => Some("audio/aac"),
        "aiff" | "aif" => Some("audio/aiff"),
        "wma" => Some("audio/x-ms-wma"),
        "ape" => Some("audio/x-ape"),
        _ => None,
    }
}

pub fn stable_id(input: &str) -> String {
    blake3::hash(input.as_bytes()).to_hex().to_string()
}

pub fn album_key(primary_artist: &str, album_title: &str) -> String {
    let mut key = String::new();
    key.push_str(primary_artist.trim().to_lowercase().as_str());
    key.push(KEY_SEP);
    key.push_str(album_title.trim().to_lowercase().as_str());
    stable_id(&key)
}

pub fn artist_key(name: &str) -> String {
    stable_id(name.trim().to_lowercase().as_str())
}

/// Strips `scheme://host[:port]` plus any query/fragment so the same file
/// keeps its identity when the server is reached via a different host or
/// port. Always returns a single-leading-slash path.
pub fn canonical_path(path: &str) -> String {
    let mut rest = path;
    if let Some(idx) = rest.find("://") {
        rest = &rest[idx + 3..];
        rest = match rest.find('/') {
            Some(slash) => &rest[slash..],
            None => "/",
        };
    }
    if let Some(idx) = rest.find(['?', '#']) {
        rest = &rest[..idx];
    }

    let mut out = String::with_capacity(rest.len() + 1);
    out.push('/');
    for segment in rest.split('/') {
        if segment.is_empty() {
            continue;
        }
        if !out.ends_with('/') {
            out.push('/');
        }
        out.push_str(segment);
    }
    if rest.ends_with('/') && out.len() > 1 {
        out.push('/');
    }
    out
}

pub fn file_name_of(path: &str) -> &str {
    path.trim_end_matches('/').rsplit('/').next().unwrap_or(path)
}

pub fn file_stem(name: &str) -> &str {
    match name.rfind('.') {
        Some(idx) if idx > 0 => &name[..idx],
        _ => name,
    }
}

pub fn file_ext(name: &str) -> Option<String> {
    let idx = name.rfind('.')?;
    if idx == 0 || idx + 1 == name.len() {
        return None;
    }
    Some(name[idx + 1..].to_ascii_lowercase())
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ValidationError {
    TooLong { limit: usize },
    Empty,
    NullByte,
    Traversal,
    Protocol,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::TooLong { limit } => write!(f, "exceeds {} bytes", limit),
            ValidationError::Empty => write!(f, "empty value"),
            ValidationError::NullByte => write!(f, "embedded null byte"),
            ValidationError::Traversal => write!(f, "path traversal segment"),
            ValidationError::Protocol => write!(f, "protocol not allowed"),
        }
    }
}

impl std::error::Error for ValidationError {}

pub fn validate_path(path: &str) -> Result<(), ValidationError> {
    if path.len() > MAX_PATH_LEN {
        return Err(ValidationError::TooLong { limit: MAX_PATH_LEN });
    }
    if path.contains('\0') {
        return Err(ValidationError::NullByte);
    }
    if path.split('/').any(|segment| segment == "..") {
        return Err(ValidationError::Traversal);
    }
    Ok(())
}

/// A single listing entry name: one path segment, nothing more.
pub fn validate_entry_name(name: &str) -> Result<(), ValidationError> {
    if name.is_empty() {
        return Err(ValidationError::Empty);
    }
    if name.len() > MAX_NAME_LEN {
        return Err(ValidationError::TooLong { limit: MAX_NAME_LEN });
    }
    if name.contains('\0') {
        return Err(ValidationError::NullByte);
    }
    if name == ".." || name == "." || name.contains('/') || name.contains('\\') {
        return Err(ValidationError::Traversal);
    }
    Ok(())
}

pub fn validate_root_url(url: &str) -> Result<(), ValidationError> {
    let lower = url.to_ascii_lowercase();
    if !lower.starts_with("http://") && !lower.starts_with("https://") {
        return Err(ValidationError::Protocol);
    }
    validate_path(url)
}

pub fn validate_filter_text(text: &str) -> Result<(), ValidationError> {
    if text.len() > MAX_FILTER_LEN {
        return Err(ValidationError::TooLong { limit: MAX_FILTER_LEN });
    }
    if text.contains('\0') {
        return Err(ValidationError::NullByte);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stable_id_is_deterministic() {
        let first = stable_id("/media/Artist/Album/Track.mp3");
        let second = stable_id("/media/Artist/Album/Track.mp3");
        assert_eq!(first, second);
        assert_ne!(first, stable_id("/media/Artist/Album/Track2.mp3"));
    }

    #[test]
    fn canonical_path_strips_scheme_and_host() {
        assert_eq!(
            canonical_path("http://localhost:8080/media/a.mp3"),
            "/media/a.mp3"
        );
        assert_eq!(
            canonical_path("https://music.example.com/media/a.mp3"),
            "/media/a.mp3"
        );
        assert_eq!(canonical_path("/media//a.mp3"), "/media/a.mp3");
        assert_eq!(canonical_path("http://host"), "/");
    }

    #[test]
    fn canonical_path_drops_query_and_fragment() {
        assert_eq!(canonical_path("/media/a.mp3?token=1#x"), "/media/a.mp3");
    }

    #[test]
    fn canonical_path_gives_same_id_across_hosts() {
        let a = stable_id(&canonical_path("http://10.0.0.1:8080/media/x.flac"));
        let b = stable_id(&canonical_path("http://nas.local/media/x.flac"));
        assert_eq!(a, b);
    }

    #[test]
    fn one_or_many_accepts_both_shapes() {
        let one: OneOrMany<String> = serde_json::from_str("\"Artist A\"").unwrap();
        assert_eq!(one.as_slice(), ["Artist A".to_string()]);

        let many: OneOrMany<String> = serde_json::from_str("[\"A\", \"B\"]").unwrap();
        assert_eq!(many.len(), 2);
        assert_eq!(many.first().map(String::as_str), Some("A"));
    }

    #[test]
    fn primary_artist_prefers_album_artist() {
        let mut track = Track {
            id: "t".into(),
            path: "/media/x.mp3".into(),
            filename: "x.mp3".into(),
            mime: "audio/mpeg".into(),
            size: 1,
            modified: None,
            added: Utc::now(),
            meta: TrackMeta {
                artists: OneOrMany::Many(vec!["A".into(), "B".into()]),
                ..TrackMeta::default()
            },
        };
        assert_eq!(track.primary_artist(), "A");
        track.meta.album_artist = Some("Various".into());
        assert_eq!(track.primary_artist(), "Various");
    }

    #[test]
    fn validators_reject_hostile_input() {
        assert!(validate_entry_name("../../etc/passwd").is_err());
        assert!(validate_entry_name("ok\0.mp3").is_err());
        assert!(validate_entry_name("..").is_err());
        assert!(validate_entry_name(&"x".repeat(MAX_NAME_LEN + 1)).is_err());
        assert!(validate_entry_name("track.mp3").is_ok());

        assert!(validate_path("/media/../etc").is_err());
        assert!(validate_path("/media/ok/track.mp3").is_ok());

        assert!(validate_root_url("ftp://host/media/").is_err());
        assert!(validate_root_url("file:///etc").is_err());
        assert!(validate_root_url("http://host/media/").is_ok());
    }

    #[test]
    fn album_key_is_case_insensitive() {
        assert_eq!(album_key("Artist", "Album"), album_key("artist", "ALBUM"));
        assert_ne!(album_key("Artist", "Album"), album_key("Artist", "Other"));
    }

    #[test]
    fn media_types_cover_the_allow_list_only() {
        assert_eq!(media_type_for_ext("mp3"), Some("audio/mpeg"));
        assert_eq!(media_type_for_ext("flac"), Some("audio/flac"));
        assert_eq!(media_type_for_ext("opus"), Some("audio/opus"));
        assert_eq!(media_type_for_ext("m4a"), Some("audio/mp4"));
        assert_eq!(media_type_for_ext("ape"), Some("audio/x-ape"));
        assert_eq!(media_type_for_ext("txt"), None);
        assert_eq!(media_type_for_ext("exe"), None);
    }

    #[test]
    fn file_helpers() {
        assert_eq!(file_name_of("/media/a/b/track.mp3"), "track.mp3");
        assert_eq!(file_stem("track.mp3"), "track");
        assert_eq!(file_ext("track.FLAC").as_deref(), Some("flac"));
        assert_eq!(file_ext("noext"), None);
        assert_eq!(file_ext(".hidden"), None);
    }
}
