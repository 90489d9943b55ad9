use std::path::Path;
use std::time::Duration;

use bytes::Bytes;
use image::{DynamicImage, ImageFormat};
use tracing::{error, info, instrument, warn};

use super::annotate::annotate;
use super::model::{AnalysisRecord, ImageDimensions};
use super::normalize::normalize_percentages;
use super::parse::{finalize_recommendations, parse_model_response};
use crate::errors::AnalysisError;
use crate::images::services::mime_from_ext;
use crate::state::AppState;

const STORAGE_SERVICE: &str = "object storage";
const VISION_SERVICE: &str = "vision model";

/// Progress of one analysis. On failure the last reached stage is logged and
/// every object uploaded so far is removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Requested,
    Validated,
    OriginalUploaded,
    ModelInvoked,
    Parsed,
    Normalized,
    Annotated,
    ProcessedUploaded,
    Persisted,
}

pub struct AnalysisRequest {
    pub image: Bytes,
    /// Client-side name, used only to name the stored objects.
    pub filename: Option<String>,
    pub requested_id: Option<u64>,
}

pub struct ValidatedImage {
    pub extension: &'static str,
    pub image: DynamicImage,
    pub dims: ImageDimensions,
}

impl ValidatedImage {
    pub fn mime(&self) -> &'static str {
        mime_from_ext(self.extension)
    }
}

/// Checks size and format, then decodes to learn the dimensions.
pub fn validate_image(bytes: &[u8], max_bytes: usize) -> Result<ValidatedImage, AnalysisError> {
    if bytes.is_empty() {
        return Err(AnalysisError::validation("image is empty"));
    }
    if bytes.len() > max_bytes {
        return Err(AnalysisError::validation(format!(
            "image is {} bytes, limit is {}",
            bytes.len(),
            max_bytes
        )));
    }

    let format = image::guess_format(bytes)
        .map_err(|_| AnalysisError::validation("unrecognised image format"))?;
    let extension = match format {
        ImageFormat::Jpeg => "jpg",
        ImageFormat::Png => "png",
        ImageFormat::Gif => "gif",
        other => {
            return Err(AnalysisError::validation(format!(
                "unsupported image format {:?}; use JPEG, PNG or GIF",
                other
            )))
        }
    };

    let image = image::load_from_memory_with_format(bytes, format)
        .map_err(|e| AnalysisError::validation(format!("could not decode image: {}", e)))?;
    let dims = ImageDimensions {
        width: image.width(),
        height: image.height(),
    };
    Ok(ValidatedImage {
        extension,
        image,
        dims,
    })
}

struct Progress {
    stage: Stage,
    analysis_id: Option<u64>,
    uploaded: Vec<String>,
}

impl Progress {
    fn reach(&mut self, stage: Stage) {
        self.stage = stage;
        info!(?stage, "analysis stage reached");
    }
}

/// Runs one photo through validation, the vision model, normalization and
/// annotation, then stores both images and the record.
#[instrument(skip(state, request), fields(size = request.image.len(), requested_id = ?request.requested_id))]
pub async fn analyze_plate(
    state: &AppState,
    request: AnalysisRequest,
) -> Result<AnalysisRecord, AnalysisError> {
    let mut progress = Progress {
        stage: Stage::Requested,
        analysis_id: None,
        uploaded: Vec::new(),
    };

    match run(state, request, &mut progress).await {
        Ok(record) => Ok(record),
        Err(e) => {
            error!(
                analysis_id = ?progress.analysis_id,
                stage = ?progress.stage,
                error = %e,
                "analysis failed"
            );
            if !progress.uploaded.is_empty() {
                state.assets.rollback(&progress.uploaded).await;
            }
            Err(e)
        }
    }
}

async fn run(
    state: &AppState,
    request: AnalysisRequest,
    progress: &mut Progress,
) -> Result<AnalysisRecord, AnalysisError> {
    let validated = validate_image(&request.image, state.config.max_image_bytes)?;
    progress.reach(Stage::Validated);

    let id = state
        .store
        .allocate_id(request.requested_id)
        .await
        .map_err(store_error)?;
    progress.analysis_id = Some(id);

    let stem = request
        .filename
        .as_deref()
        .and_then(|f| Path::new(f).file_stem())
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .unwrap_or("plate")
        .to_string();
    let folder = state.config.storage.plates_folder.as_str();

    let original = state
        .assets
        .upload(
            request.image.clone(),
            validated.extension,
            Some(id),
            Some(&format!("{}.{}", stem, validated.extension)),
            folder,
        )
        .await
        .map_err(|e| AnalysisError::external(STORAGE_SERVICE, format!("{:#}", e)))?;
    progress.uploaded.push(original.url.clone());
    progress.reach(Stage::OriginalUploaded);

    let limit = Duration::from_secs(state.config.vision.timeout_secs);
    let answer = tokio::time::timeout(
        limit,
        state
            .vision
            .describe_plate(&request.image, validated.mime(), validated.dims),
    )
    .await
    .map_err(|_| {
        AnalysisError::external(VISION_SERVICE, format!("no answer within {}s", limit.as_secs()))
    })??;
    progress.reach(Stage::ModelInvoked);

    let plate = parse_model_response(&answer, validated.dims)?;
    progress.reach(Stage::Parsed);

    let mut items = plate.items;
    if plate.assessment.is_food() {
        if items.is_empty() {
            return Err(AnalysisError::parse("food plate reported without any items"));
        }
        let areas: Vec<f64> = items.iter().map(|i| i.area_percentage).collect();
        let normalized = normalize_percentages(&areas);
        if normalized.is_degenerate() {
            return Err(AnalysisError::parse("item areas add up to zero"));
        }
        if normalized.rescaled {
            info!(raw_sum = normalized.raw_sum, items = items.len(), "areas rescaled to 100");
        }
        for (item, value) in items.iter_mut().zip(normalized.values) {
            item.area_percentage = value;
        }
    } else if !items.is_empty() {
        warn!(count = items.len(), "non-food image came with items; discarding them");
        items.clear();
    }
    let recommendations = finalize_recommendations(plate.assessment, plate.recommendations);
    progress.reach(Stage::Normalized);

    let source = validated.image;
    let to_draw = items.clone();
    let annotated = tokio::task::spawn_blocking(move || annotate(&source, &to_draw))
        .await
        .map_err(|e| AnalysisError::Annotation(e.into()))?
        .map_err(AnalysisError::Annotation)?;
    info!(drawn = annotated.drawn, labelled = annotated.labelled, "image annotated");
    progress.reach(Stage::Annotated);

    let processed = state
        .assets
        .upload(
            Bytes::from(annotated.bytes),
            "jpg",
            Some(id),
            Some(&format!("processed_{}.jpg", stem)),
            folder,
        )
        .await
        .map_err(|e| AnalysisError::external(STORAGE_SERVICE, format!("{:#}", e)))?;
    progress.uploaded.push(processed.url.clone());
    progress.reach(Stage::ProcessedUploaded);
    info!(original = %original.key, processed = %processed.key, "images stored");

    let record = AnalysisRecord::new(
        id,
        plate.assessment,
        items,
        recommendations,
        original.url,
        processed.url,
    );
    state
        .store
        .save(id, &record)
        .await
        .map_err(store_error)?;
    progress.reach(Stage::Persisted);

    info!(id, assessment = ?record.overall_assessment, "analysis stored");
    Ok(record)
}

/// Store failures are internal unless the store blamed the request.
fn store_error(e: anyhow::Error) -> AnalysisError {
    match e.downcast::<AnalysisError>() {
        Ok(e) => e,
        Err(e) => AnalysisError::Storage(e),
    }
}

pub async fn get_analysis(state: &AppState, id: u64) -> Result<AnalysisRecord, AnalysisError> {
    state
        .store
        .get(id)
        .await
        .map_err(store_error)?
        .ok_or(AnalysisError::NotFound(id))
}

pub async fn list_analyses(state: &AppState) -> Result<Vec<AnalysisRecord>, AnalysisError> {
    state.store.list().await.map_err(store_error)
}

#[instrument(skip(state))]
pub async fn delete_analysis(state: &AppState, id: u64) -> Result<(), AnalysisError> {
    if !state.store.exists(id).await.map_err(store_error)? {
        warn!(id, "analysis not found");
        return Err(AnalysisError::NotFound(id));
    }
    let deleted = state
        .store
        .delete(id, &state.assets, &state.config.storage.plates_folder)
        .await
        .map_err(store_error)?;
    if deleted {
        Ok(())
    } else {
        Err(AnalysisError::NotFound(id))
    }
}
