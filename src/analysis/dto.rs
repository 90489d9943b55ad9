use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::model::{AnalysisRecord, Assessment, CategoryPercentages, FoodItem};

#[derive(Debug, Serialize)]
pub struct AnalysisResponse {
    pub id: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub overall_assessment: Assessment,
    pub category_percentages: CategoryPercentages,
    pub items: Vec<FoodItem>,
    pub recommendations: Vec<String>,
    pub original_image_url: String,
    pub processed_image_url: String,
}

impl From<AnalysisRecord> for AnalysisResponse {
    fn from(r: AnalysisRecord) -> Self {
        Self {
            id: r.id,
            created_at: r.created_at,
            overall_assessment: r.overall_assessment,
            category_percentages: r.category_percentages(),
            items: r.items,
            recommendations: r.recommendations,
            original_image_url: r.original_image_ref,
            processed_image_url: r.processed_image_ref,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct AnalysisListResponse {
    pub analyses: Vec<AnalysisResponse>,
}

#[derive(Debug, Deserialize)]
pub struct AnalyzeBase64Request {
    pub image_base64: String,
    /// Requested analysis id.
    #[serde(default)]
    pub conversation_id: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct DeleteAnalysisRequest {
    pub id: u64,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: String,
}
