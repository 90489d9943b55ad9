//! Vision model access: the instruction sent with each plate photo and the
//! client that returns the model's raw JSON answer.

mod client;

pub use client::OpenAiVisionClient;

use async_trait::async_trait;

use crate::analysis::model::ImageDimensions;
use crate::errors::AnalysisError;

#[async_trait]
pub trait VisionClient: Send + Sync {
    /// Returns the model's JSON description of the plate, unparsed.
    async fn describe_plate(
        &self,
        image: &[u8],
        mime: &str,
        dims: ImageDimensions,
    ) -> Result<String, AnalysisError>;
}

/// Instruction for one photo. Embeds the pixel bounds the boxes must respect
/// and the exact JSON shape the parser expects.
pub fn build_instruction(dims: ImageDimensions) -> String {
    let max_x = dims.width.saturating_sub(1);
    let max_y = dims.height.saturating_sub(1);
    let area = u64::from(dims.width) * u64::from(dims.height);
    format!(
        r#"You are a computer-vision system specialised in nutritional analysis of meal photos.

IMAGE
- Size: {w}x{h} pixels (total area {area} px²)
- Valid x coordinates: 0..={max_x}; valid y coordinates: 0..={max_y}

TASK
1. Detect every visible food item.
2. For each item give the integer bounding box (x1, y1) top-left and (x2, y2) bottom-right,
   inside the bounds above, and the share of the plate it covers as a percentage.
   The percentages of all items must add up to exactly 100.
3. Classify each item as "Verduras/vegetales", "Proteínas" or "Carbohidratos"
   (Harvard plate targets: 50% / 25% / 25%).
4. Assess the plate: "Plato saludable" when every share is within ±10 points of its
   target, otherwise "Plato desequilibrado". Use "No aplicable" when the image is not food.
5. Give three recommendations specific to this plate (max 200 characters each), or a
   single observation when the image is not food.

Answer ONLY with JSON of this shape:
{{
  "evaluacion_general": "Plato saludable" | "Plato desequilibrado" | "No aplicable",
  "porcentaje_verduras": number,
  "porcentaje_proteinas": number,
  "porcentaje_carbohidratos": number,
  "detalle_alimentos": [
    {{
      "nombre": string,
      "categoria": "Verduras/vegetales" | "Proteínas" | "Carbohidratos",
      "porcentaje_area": number between 0.1 and 100,
      "coordenadas": {{ "x1": 0..{max_x}, "y1": 0..{max_y}, "x2": x1..{max_x}, "y2": y1..{max_y} }}
    }}
  ],
  "recomendaciones": [string, string, string]
}}"#,
        w = dims.width,
        h = dims.height,
    )
}

#[cfg(test)]
pub mod scripted {
    //! Vision client that replays a canned answer.

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use super::VisionClient;
    use crate::analysis::model::ImageDimensions;
    use crate::errors::AnalysisError;

    pub struct ScriptedVision {
        answer: Result<String, String>,
        delay: Option<Duration>,
        pub calls: AtomicUsize,
    }

    impl ScriptedVision {
        pub fn answering(body: impl Into<String>) -> Self {
            Self {
                answer: Ok(body.into()),
                delay: None,
                calls: AtomicUsize::new(0),
            }
        }

        pub fn failing(msg: &str) -> Self {
            Self {
                answer: Err(msg.to_string()),
                delay: None,
                calls: AtomicUsize::new(0),
            }
        }

        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = Some(delay);
            self
        }
    }

    #[async_trait]
    impl VisionClient for ScriptedVision {
        async fn describe_plate(
            &self,
            _image: &[u8],
            _mime: &str,
            _dims: ImageDimensions,
        ) -> Result<String, AnalysisError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.answer
                .clone()
                .map_err(|msg| AnalysisError::external("vision model", msg))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instruction_embeds_dimensions_and_bounds() {
        let text = build_instruction(ImageDimensions {
            width: 640,
            height: 480,
        });
        assert!(text.contains("640x480"));
        assert!(text.contains("307200"));
        assert!(text.contains("0..=639"));
        assert!(text.contains("0..=479"));
        assert!(text.contains("\"detalle_alimentos\""));
        assert!(text.contains("\"x2\": x1..639"));
    }
}
