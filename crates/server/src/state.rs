use std::path::PathBuf;
use std::sync::Arc;

use axum::http::StatusCode;
use axum::Json;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::config::ServerConfig;
use library::Library;

#[derive(Clone)]
pub struct AppState {
    pub library: Library,
    pub config: Arc<RwLock<ServerConfig>>,
    pub snapshot_path: PathBuf,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

#[derive(Serialize)]
pub struct ListResponse<T> {
    pub items: Vec<T>,
    pub total: usize,
}

#[derive(Debug, Deserialize)]
pub struct TrackQuery {
    pub search: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct PageQuery {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ScanRequest {
    pub roots: Vec<String>,
}

#[derive(Serialize)]
pub struct ScanStartedResponse {
    pub scanning: bool,
    pub roots: usize,
}

#[derive(Serialize)]
pub struct HydrateResponse {
    pub updated: bool,
}

pub type JsonResult<T> = Result<Json<T>, (StatusCode, Json<ErrorResponse>)>;

pub fn json_error<T>(status: StatusCode, message: impl Into<String>) -> JsonResult<T> {
    Err((
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    ))
}
