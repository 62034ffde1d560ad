use axum::extract::{Path as AxumPath, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};

use common::{Album, Artist, Genre, Track};
use library::{LibraryStats, ScanProgress, TrackFilter};

use crate::state::{
    json_error, AppState, HealthResponse, HydrateResponse, JsonResult, ListResponse, PageQuery,
    ScanRequest, ScanStartedResponse, TrackQuery,
};

const DEFAULT_PAGE: usize = 100;
const MAX_PAGE: usize = 500;

pub fn api_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/tracks", get(list_tracks))
        .route("/tracks/:track_id/hydrate", post(hydrate_track))
        .route("/albums", get(list_albums))
        .route("/artists", get(list_artists))
        .route("/genres", get(list_genres))
        .route("/stats", get(stats))
        .route("/progress", get(progress))
        .route("/scan", post(start_scan))
        .route("/scan/cancel", post(cancel_scan))
        .with_state(state)
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn list_tracks(
    State(state): State<AppState>,
    Query(query): Query<TrackQuery>,
) -> Json<ListResponse<Track>> {
    let filter = TrackFilter {
        search: query.search,
        artist: query.artist,
        album: query.album,
    };
    let tracks = state.library.get_tracks(&filter);
    Json(paginate(tracks, query.limit, query.offset))
}

async fn list_albums(
    State(state): State<AppState>,
    Query(query): Query<PageQuery>,
) -> Json<ListResponse<Album>> {
    Json(paginate(state.library.get_albums(), query.limit, query.offset))
}

async fn list_artists(
    State(state): State<AppState>,
    Query(query): Query<PageQuery>,
) -> Json<ListResponse<Artist>> {
    Json(paginate(
        state.library.get_artists(),
        query.limit,
        query.offset,
    ))
}

async fn list_genres(
    State(state): State<AppState>,
    Query(query): Query<PageQuery>,
) -> Json<ListResponse<Genre>> {
    Json(paginate(state.library.get_genres(), query.limit, query.offset))
}

async fn stats(State(state): State<AppState>) -> Json<LibraryStats> {
    Json(state.library.get_stats())
}

async fn progress(State(state): State<AppState>) -> Json<ScanProgress> {
    Json(state.library.get_scan_progress())
}

async fn start_scan(
    State(state): State<AppState>,
    body: Option<Json<ScanRequest>>,
) -> JsonResult<ScanStartedResponse> {
    let mut roots = body.map(|Json(req)| req.roots).unwrap_or_default();
    if roots.is_empty() {
        roots = state.config.read().root_urls.clone();
    }
    if roots.is_empty() {
        return json_error(
            StatusCode::BAD_REQUEST,
            "no scan roots given and none configured",
        );
    }

    let count = roots.len();
    let _ = state.library.scan(roots);
    Ok(Json(ScanStartedResponse {
        scanning: true,
        roots: count,
    }))
}

async fn cancel_scan(State(state): State<AppState>) -> Json<ScanStartedResponse> {
    state.library.cancel_scan();
    Json(ScanStartedResponse {
        scanning: false,
        roots: 0,
    })
}

async fn hydrate_track(
    State(state): State<AppState>,
    AxumPath(track_id): AxumPath<String>,
) -> JsonResult<HydrateResponse> {
    if state.library.get_track(&track_id).is_none() {
        return json_error(StatusCode::NOT_FOUND, "track not found");
    }
    let updated = state.library.hydrate(&track_id).await;
    Ok(Json(HydrateResponse { updated }))
}

fn paginate<T>(items: Vec<T>, limit: Option<usize>, offset: Option<usize>) -> ListResponse<T> {
    let total = items.len();
    let limit = limit.unwrap_or(DEFAULT_PAGE).clamp(1, MAX_PAGE);
    let offset = offset.unwrap_or(0);
    let items = items.into_iter().skip(offset).take(limit).collect();
    ListResponse { items, total }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pagination_clamps_and_slices() {
        let page = paginate((0..10).collect(), Some(3), Some(4));
        assert_eq!(page.total, 10);
        assert_eq!(page.items, vec![4, 5, 6]);

        let oversized = paginate((0..3).collect::<Vec<i32>>(), Some(9_999), None);
        assert_eq!(oversized.items.len(), 3);

        let empty_tail = paginate((0..3).collect::<Vec<i32>>(), None, Some(10));
        assert!(empty_tail.items.is_empty());
        assert_eq!(empty_tail.total, 3);
    }
}
