use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

pub const MAX_RECOMMENDATION_CHARS: usize = 200;

/// Overall verdict on a plate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Assessment {
    Balanced,
    Unbalanced,
    NotApplicable,
}

impl Assessment {
    /// Maps the model's label. Spanish labels are what the instruction asks for,
    /// English ones are accepted too. Whole labels only, so a negated verdict
    /// never reads as its opposite.
    pub fn from_model_label(label: &str) -> Option<Self> {
        const BALANCED: &[&str] = &[
            "plato saludable",
            "saludable",
            "plato equilibrado",
            "equilibrado",
            "balanced",
            "balanced plate",
            "healthy plate",
        ];
        const UNBALANCED: &[&str] = &[
            "plato desequilibrado",
            "desequilibrado",
            "plato no saludable",
            "no saludable",
            "unbalanced",
            "unbalanced plate",
            "not balanced",
            "imbalanced",
            "unhealthy plate",
        ];
        const NOT_APPLICABLE: &[&str] = &["no aplicable", "no aplica", "not applicable", "n/a"];

        let l = fold(label);
        let l = l.trim_end_matches(['.', '!']);
        if BALANCED.contains(&l) {
            Some(Self::Balanced)
        } else if UNBALANCED.contains(&l) {
            Some(Self::Unbalanced)
        } else if NOT_APPLICABLE.contains(&l) {
            Some(Self::NotApplicable)
        } else {
            None
        }
    }

    pub fn is_food(self) -> bool {
        self != Self::NotApplicable
    }
}

/// Harvard-plate bucket of a detected food item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Vegetable,
    Protein,
    Carbohydrate,
    /// Label outside the fixed set. Counts toward the 100% total only.
    Unclassified,
}

impl Category {
    pub fn from_model_label(label: &str) -> Self {
        let l = fold(label);
        if l.starts_with("verdura") || l.starts_with("vegeta") {
            Self::Vegetable
        } else if l.starts_with("proteina") || l.starts_with("protein") {
            Self::Protein
        } else if l.starts_with("carbohidrato") || l.starts_with("carbohydrate") {
            Self::Carbohydrate
        } else {
            Self::Unclassified
        }
    }
}

/// Lowercases, collapses whitespace and strips the Spanish accents the model
/// tends to emit.
fn fold(s: &str) -> String {
    s.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
        .chars()
        .map(|c| match c {
            'á' => 'a',
            'é' => 'e',
            'í' => 'i',
            'ó' => 'o',
            'ú' | 'ü' => 'u',
            other => other,
        })
        .collect()
}

/// Pixel rectangle, inclusive on both corners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: u32,
    pub y1: u32,
    pub x2: u32,
    pub y2: u32,
}

impl BoundingBox {
    pub fn is_degenerate(&self) -> bool {
        self.x2 <= self.x1 || self.y2 <= self.y1
    }

    pub fn width(&self) -> u32 {
        self.x2.saturating_sub(self.x1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageDimensions {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FoodItem {
    pub name: String,
    pub category: Category,
    pub area_percentage: f64,
    pub bounding_box: BoundingBox,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CategoryPercentages {
    pub vegetables: f64,
    pub protein: f64,
    pub carbohydrate: f64,
}

impl CategoryPercentages {
    pub fn from_items(items: &[FoodItem]) -> Self {
        items.iter().fold(Self::default(), |mut acc, item| {
            match item.category {
                Category::Vegetable => acc.vegetables += item.area_percentage,
                Category::Protein => acc.protein += item.area_percentage,
                Category::Carbohydrate => acc.carbohydrate += item.area_percentage,
                Category::Unclassified => {}
            }
            acc
        })
    }
}

/// Persisted result of one plate analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRecord {
    pub id: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub overall_assessment: Assessment,
    #[serde(default)]
    category_percentages: CategoryPercentages,
    pub items: Vec<FoodItem>,
    pub recommendations: Vec<String>,
    pub original_image_ref: String,
    pub processed_image_ref: String,
}

impl AnalysisRecord {
    pub fn new(
        id: u64,
        overall_assessment: Assessment,
        items: Vec<FoodItem>,
        recommendations: Vec<String>,
        original_image_ref: String,
        processed_image_ref: String,
    ) -> Self {
        let mut record = Self {
            id,
            created_at: OffsetDateTime::now_utc(),
            overall_assessment,
            category_percentages: CategoryPercentages::default(),
            items,
            recommendations,
            original_image_ref,
            processed_image_ref,
        };
        record.refresh_aggregates();
        record
    }

    pub fn category_percentages(&self) -> CategoryPercentages {
        self.category_percentages
    }

    /// Re-derives the category aggregates from `items`; stored values are never trusted.
    pub fn refresh_aggregates(&mut self) {
        self.category_percentages = CategoryPercentages::from_items(&self.items);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(cat: Category, area: f64) -> FoodItem {
        FoodItem {
            name: "x".into(),
            category: cat,
            area_percentage: area,
            bounding_box: BoundingBox { x1: 0, y1: 0, x2: 5, y2: 5 },
        }
    }

    #[test]
    fn assessment_labels() {
        assert_eq!(
            Assessment::from_model_label("Plato saludable"),
            Some(Assessment::Balanced)
        );
        assert_eq!(
            Assessment::from_model_label("Plato desequilibrado"),
            Some(Assessment::Unbalanced)
        );
        assert_eq!(
            Assessment::from_model_label("No aplicable"),
            Some(Assessment::NotApplicable)
        );
        assert_eq!(
            Assessment::from_model_label("Unbalanced plate"),
            Some(Assessment::Unbalanced)
        );
        assert_eq!(
            Assessment::from_model_label("  PLATO  Saludable. "),
            Some(Assessment::Balanced)
        );
        assert_eq!(Assessment::from_model_label("delicious"), None);
    }

    #[test]
    fn negated_assessments_are_not_balanced() {
        assert_eq!(
            Assessment::from_model_label("Plato no saludable"),
            Some(Assessment::Unbalanced)
        );
        assert_eq!(
            Assessment::from_model_label("Not balanced"),
            Some(Assessment::Unbalanced)
        );
        assert_eq!(Assessment::from_model_label("Plato casi saludable"), None);
        assert_eq!(Assessment::from_model_label("not healthy at all"), None);
    }

    #[test]
    fn category_labels_ignore_accents_and_case() {
        assert_eq!(Category::from_model_label("Verduras/vegetales"), Category::Vegetable);
        assert_eq!(Category::from_model_label("Proteínas"), Category::Protein);
        assert_eq!(Category::from_model_label("PROTEINAS"), Category::Protein);
        assert_eq!(Category::from_model_label("Carbohidratos"), Category::Carbohydrate);
        assert_eq!(Category::from_model_label("Grasas"), Category::Unclassified);
    }

    #[test]
    fn aggregates_are_grouped_sums() {
        let items = vec![
            item(Category::Vegetable, 30.0),
            item(Category::Vegetable, 20.0),
            item(Category::Protein, 25.0),
            item(Category::Carbohydrate, 15.0),
            item(Category::Unclassified, 10.0),
        ];
        let agg = CategoryPercentages::from_items(&items);
        assert_eq!(agg.vegetables, 50.0);
        assert_eq!(agg.protein, 25.0);
        assert_eq!(agg.carbohydrate, 15.0);
    }

    #[test]
    fn record_derives_aggregates_on_construction() {
        let record = AnalysisRecord::new(
            1,
            Assessment::Balanced,
            vec![item(Category::Protein, 100.0)],
            vec![],
            "a".into(),
            "b".into(),
        );
        assert_eq!(record.category_percentages().protein, 100.0);
    }

    #[test]
    fn stored_aggregates_are_overwritten_on_refresh() {
        let json = serde_json::json!({
            "id": 4,
            "created_at": "2024-05-01T12:00:00Z",
            "overall_assessment": "balanced",
            "category_percentages": { "vegetables": 99.0, "protein": 0.0, "carbohydrate": 0.0 },
            "items": [{
                "name": "rice",
                "category": "carbohydrate",
                "area_percentage": 100.0,
                "bounding_box": { "x1": 0, "y1": 0, "x2": 10, "y2": 10 }
            }],
            "recommendations": ["a", "b", "c"],
            "original_image_ref": "o",
            "processed_image_ref": "p"
        });
        let mut record: AnalysisRecord = serde_json::from_value(json).unwrap();
        record.refresh_aggregates();
        assert_eq!(record.category_percentages().vegetables, 0.0);
        assert_eq!(record.category_percentages().carbohydrate, 100.0);
    }
}
