use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, State},
    http::StatusCode,
    routing::{delete, get, put},
    Json, Router,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use tracing::{info, instrument, warn};

use super::dto::{
    AnalysisListResponse, AnalysisResponse, AnalyzeBase64Request, DeleteAnalysisRequest,
    MessageResponse,
};
use super::repo::StoreSnapshot;
use super::services::{analyze_plate, delete_analysis, get_analysis, list_analyses, AnalysisRequest};
use crate::state::AppState;

const UPLOAD_BODY_LIMIT: usize = 20 * 1024 * 1024; // 20MB

// --- public routers ---

pub fn read_routes() -> Router<AppState> {
    Router::new()
        .route("/show-analysis/:id", get(show_analysis))
        .route("/list-analyses", get(list_all))
        .route("/debug-analyses", get(debug_analyses))
}

pub fn write_routes() -> Router<AppState> {
    Router::new()
        .route("/analyze-image", put(analyze_multipart)) // media_file + optional id
        .route("/analyze-image/base64", put(analyze_base64))
        .route("/delete-analysis", delete(remove_analysis))
        .layer(DefaultBodyLimit::max(UPLOAD_BODY_LIMIT))
}

// --- handlers ---

/// PUT /analyze-image (multipart)
/// Fields: media_file (required), id (optional requested analysis id)
#[instrument(skip(state, mp))]
pub async fn analyze_multipart(
    State(state): State<AppState>,
    mut mp: Multipart,
) -> Result<Json<AnalysisResponse>, (StatusCode, String)> {
    let mut image: Option<(Bytes, Option<String>)> = None;
    let mut requested_id = None;

    while let Some(field) = mp.next_field().await.map_err(bad_request)? {
        match field.name() {
            Some("media_file") => {
                let filename = field.file_name().map(str::to_string);
                let data = field.bytes().await.map_err(bad_request)?;
                image = Some((data, filename));
            }
            Some("id") => {
                let text = field.text().await.map_err(bad_request)?;
                let text = text.trim();
                if !text.is_empty() {
                    requested_id = Some(text.parse::<u64>().map_err(|_| {
                        (StatusCode::BAD_REQUEST, format!("id must be a positive integer, got {:?}", text))
                    })?);
                }
            }
            other => warn!(field = ?other, "ignoring multipart field"),
        }
    }

    let Some((image, filename)) = image else {
        return Err((StatusCode::BAD_REQUEST, "media_file is required".into()));
    };
    info!(size = image.len(), ?filename, ?requested_id, "analyze request");

    let record = analyze_plate(
        &state,
        AnalysisRequest {
            image,
            filename,
            requested_id,
        },
    )
    .await?;
    Ok(Json(record.into()))
}

/// PUT /analyze-image/base64 { image_base64, conversation_id? }
#[instrument(skip(state, body))]
pub async fn analyze_base64(
    State(state): State<AppState>,
    Json(body): Json<AnalyzeBase64Request>,
) -> Result<Json<AnalysisResponse>, (StatusCode, String)> {
    let image = decode_base64_image(&body.image_base64)?;
    let record = analyze_plate(
        &state,
        AnalysisRequest {
            image,
            filename: None,
            requested_id: body.conversation_id,
        },
    )
    .await?;
    Ok(Json(record.into()))
}

#[instrument(skip(state))]
pub async fn show_analysis(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> Result<Json<AnalysisResponse>, (StatusCode, String)> {
    let record = get_analysis(&state, id).await?;
    Ok(Json(record.into()))
}

#[instrument(skip(state))]
pub async fn list_all(
    State(state): State<AppState>,
) -> Result<Json<AnalysisListResponse>, (StatusCode, String)> {
    let analyses = list_analyses(&state)
        .await?
        .into_iter()
        .map(AnalysisResponse::from)
        .collect();
    Ok(Json(AnalysisListResponse { analyses }))
}

#[instrument(skip(state))]
pub async fn remove_analysis(
    State(state): State<AppState>,
    Json(body): Json<DeleteAnalysisRequest>,
) -> Result<Json<MessageResponse>, (StatusCode, String)> {
    delete_analysis(&state, body.id).await?;
    Ok(Json(MessageResponse {
        message: format!("analysis {} deleted", body.id),
    }))
}

#[instrument(skip(state))]
pub async fn debug_analyses(
    State(state): State<AppState>,
) -> Result<Json<StoreSnapshot>, (StatusCode, String)> {
    state.store.snapshot().await.map(Json).map_err(internal)
}

/// Accepts bare base64 or a `data:<mime>;base64,` URL.
fn decode_base64_image(raw: &str) -> Result<Bytes, (StatusCode, String)> {
    let payload = match raw.split_once(";base64,") {
        Some((prefix, data)) if prefix.starts_with("data:") => data,
        _ => raw,
    };
    let payload = payload.trim();
    if payload.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "image_base64 is required".into()));
    }
    STANDARD
        .decode(payload)
        .map(Bytes::from)
        .map_err(|_| (StatusCode::BAD_REQUEST, "invalid base64".into()))
}

fn bad_request<E: std::fmt::Display>(e: E) -> (StatusCode, String) {
    (StatusCode::BAD_REQUEST, e.to_string())
}

fn internal(e: anyhow::Error) -> (StatusCode, String) {
    (StatusCode::INTERNAL_SERVER_ERROR, format!("{:#}", e))
}
