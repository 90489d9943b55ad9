use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use super::model::{
    Assessment, Category, FoodItem, ImageDimensions, MAX_RECOMMENDATION_CHARS,
};
use super::sanitize::sanitize_box;
use crate::errors::AnalysisError;

/// Generic advice used to top up a food plate to three recommendations.
/// Slot i always gets FOOD_FALLBACKS[i], whatever the model already said.
pub const FOOD_FALLBACKS: [&str; 3] = [
    "Increase the share of vegetables on your plate; they should cover about half of it for a balanced meal.",
    "Choose lean proteins such as chicken, fish or legumes and keep them to about a quarter of the plate.",
    "Prefer complex carbohydrates such as whole grains and keep them to a quarter of the plate for better glycemic control.",
];

pub const NOT_FOOD_REMARK: &str =
    "This image does not seem to contain a plate of food that can be analysed nutritionally.";

#[derive(Debug, Deserialize)]
struct RawPlate {
    evaluacion_general: String,
    #[serde(default)]
    detalle_alimentos: Vec<RawFoodItem>,
    #[serde(default)]
    recomendaciones: Value,
}

#[derive(Debug, Deserialize)]
struct RawFoodItem {
    nombre: String,
    #[serde(default)]
    categoria: String,
    #[serde(default)]
    porcentaje_area: f64,
    #[serde(default)]
    coordenadas: Value,
}

/// Model output after decoding, before percentages are normalized.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedPlate {
    pub assessment: Assessment,
    pub items: Vec<FoodItem>,
    pub recommendations: Vec<String>,
}

pub fn parse_model_response(body: &str, dims: ImageDimensions) -> Result<ParsedPlate, AnalysisError> {
    let raw: RawPlate = serde_json::from_str(body.trim())
        .map_err(|e| AnalysisError::parse(format!("model response is not the expected JSON: {}", e)))?;

    let assessment = Assessment::from_model_label(&raw.evaluacion_general).ok_or_else(|| {
        AnalysisError::parse(format!(
            "unknown overall assessment {:?}",
            raw.evaluacion_general
        ))
    })?;

    let items = raw
        .detalle_alimentos
        .into_iter()
        .filter_map(|it| {
            if it.porcentaje_area <= 0.0 {
                warn!(name = %it.nombre, area = it.porcentaje_area, "dropping item without area");
                return None;
            }
            let category = Category::from_model_label(&it.categoria);
            if category == Category::Unclassified {
                warn!(name = %it.nombre, label = %it.categoria, "unrecognised category");
            }
            Some(FoodItem {
                bounding_box: sanitize_box(&it.coordenadas, dims),
                name: it.nombre,
                category,
                area_percentage: it.porcentaje_area,
            })
        })
        .collect();

    Ok(ParsedPlate {
        assessment,
        items,
        recommendations: coerce_recommendations(raw.recomendaciones),
    })
}

/// Turns whatever the model put under `recomendaciones` into bounded strings.
fn coerce_recommendations(raw: Value) -> Vec<String> {
    let entries = match raw {
        Value::Array(entries) => entries,
        Value::Null => return Vec::new(),
        other => {
            warn!(value = %other, "recommendations are not a list; ignoring");
            return Vec::new();
        }
    };

    entries
        .into_iter()
        .enumerate()
        .filter_map(|(i, v)| match v {
            Value::String(s) => Some(s),
            Value::Null => None,
            other => {
                warn!(index = i, "recommendation is not a string; coercing");
                Some(other.to_string())
            }
        })
        .map(truncate_recommendation)
        .collect()
}

pub fn truncate_recommendation(text: String) -> String {
    if text.chars().count() <= MAX_RECOMMENDATION_CHARS {
        return text;
    }
    let mut cut: String = text.chars().take(MAX_RECOMMENDATION_CHARS - 3).collect();
    cut.push_str("...");
    cut
}

/// Food plates get exactly three recommendations, anything else at most one remark.
pub fn finalize_recommendations(assessment: Assessment, mut recs: Vec<String>) -> Vec<String> {
    if assessment.is_food() {
        recs.truncate(FOOD_FALLBACKS.len());
        while recs.len() < FOOD_FALLBACKS.len() {
            warn!(slot = recs.len(), "missing recommendation; using generic advice");
            recs.push(FOOD_FALLBACKS[recs.len()].to_string());
        }
    } else {
        recs.truncate(1);
        if recs.is_empty() {
            recs.push(NOT_FOOD_REMARK.to_string());
        }
    }
    recs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::model::BoundingBox;
    use serde_json::json;

    const DIMS: ImageDimensions = ImageDimensions {
        width: 640,
        height: 480,
    };

    #[test]
    fn parses_full_response() {
        let body = json!({
            "evaluacion_general": "Plato desequilibrado",
            "porcentaje_verduras": 10,
            "porcentaje_proteinas": 60,
            "porcentaje_carbohidratos": 30,
            "detalle_alimentos": [
                {"nombre": "Pollo", "categoria": "Proteínas", "porcentaje_area": 60.0,
                 "coordenadas": {"x1": 10, "y1": 10, "x2": 300, "y2": 200}},
                {"nombre": "Arroz", "categoria": "Carbohidratos", "porcentaje_area": 40.0,
                 "coordenadas": {"x1": 320, "y1": -4, "x2": 800, "y2": 300}}
            ],
            "recomendaciones": ["Add greens", 42, null]
        })
        .to_string();

        let plate = parse_model_response(&body, DIMS).unwrap();
        assert_eq!(plate.assessment, Assessment::Unbalanced);
        assert_eq!(plate.items.len(), 2);
        assert_eq!(plate.items[0].category, Category::Protein);
        assert_eq!(
            plate.items[1].bounding_box,
            BoundingBox { x1: 320, y1: 0, x2: 639, y2: 300 }
        );
        assert_eq!(plate.recommendations, vec!["Add greens", "42"]);
    }

    #[test]
    fn rejects_non_json_and_unknown_assessment() {
        let err = parse_model_response("I think it is pasta", DIMS).unwrap_err();
        assert!(matches!(err, AnalysisError::Parse(_)));

        let err = parse_model_response(r#"{"evaluacion_general": "tasty"}"#, DIMS).unwrap_err();
        assert!(matches!(err, AnalysisError::Parse(_)));
    }

    #[test]
    fn drops_items_without_area() {
        let body = json!({
            "evaluacion_general": "Plato saludable",
            "detalle_alimentos": [
                {"nombre": "Sal", "categoria": "Otros", "porcentaje_area": 0},
                {"nombre": "Brócoli", "categoria": "Verduras/vegetales", "porcentaje_area": 100,
                 "coordenadas": {"x1": 0, "y1": 0, "x2": 50, "y2": 50}}
            ]
        })
        .to_string();
        let plate = parse_model_response(&body, DIMS).unwrap();
        assert_eq!(plate.items.len(), 1);
        assert_eq!(plate.items[0].name, "Brócoli");
        assert!(plate.recommendations.is_empty());
    }

    #[test]
    fn non_list_recommendations_become_empty() {
        let body = r#"{"evaluacion_general": "No aplicable", "recomendaciones": "none"}"#;
        let plate = parse_model_response(body, DIMS).unwrap();
        assert!(plate.recommendations.is_empty());
    }

    #[test]
    fn long_recommendations_are_truncated() {
        let long = "é".repeat(250);
        let out = truncate_recommendation(long);
        assert_eq!(out.chars().count(), MAX_RECOMMENDATION_CHARS);
        assert!(out.ends_with("..."));
        assert_eq!(truncate_recommendation("short".into()), "short");
    }

    #[test]
    fn food_recommendations_are_padded_by_position() {
        let out = finalize_recommendations(Assessment::Balanced, vec!["Keep it up".into()]);
        assert_eq!(out.len(), 3);
        assert_eq!(out[0], "Keep it up");
        // Slot 1 is always the protein text, even if protein was never the issue.
        assert_eq!(out[1], FOOD_FALLBACKS[1]);
        assert_eq!(out[2], FOOD_FALLBACKS[2]);

        let out = finalize_recommendations(Assessment::Unbalanced, vec![]);
        assert_eq!(out, FOOD_FALLBACKS.map(String::from).to_vec());
    }

    #[test]
    fn food_recommendations_are_capped_at_three() {
        let recs = (0..5).map(|i| format!("tip {}", i)).collect();
        let out = finalize_recommendations(Assessment::Balanced, recs);
        assert_eq!(out, vec!["tip 0", "tip 1", "tip 2"]);
    }

    #[test]
    fn non_food_gets_exactly_one_remark() {
        let out = finalize_recommendations(Assessment::NotApplicable, vec![]);
        assert_eq!(out, vec![NOT_FOOD_REMARK.to_string()]);

        let out = finalize_recommendations(
            Assessment::NotApplicable,
            vec!["A cat".into(), "On a sofa".into()],
        );
        assert_eq!(out, vec!["A cat".to_string()]);
    }
}
