use serde_json::Value;
use tracing::warn;

use super::model::{BoundingBox, ImageDimensions};

const FALLBACK_EDGE: u32 = 10;

/// Clamps a model-supplied box into the image.
///
/// Coordinates may be floats, numeric strings or out of range; they are
/// truncated toward zero and clamped to `[0, width-1]` / `[0, height-1]`.
/// The result can still be degenerate (`x2 <= x1`), callers skip drawing those.
/// A box that cannot be coerced at all becomes a small box at the origin.
pub fn sanitize_box(raw: &Value, dims: ImageDimensions) -> BoundingBox {
    match coerce(raw, dims) {
        Ok(b) => b,
        Err(e) => {
            warn!(error = %e, raw = %raw, "unusable coordinates; using fallback box");
            fallback_box(dims)
        }
    }
}

pub fn fallback_box(dims: ImageDimensions) -> BoundingBox {
    BoundingBox {
        x1: 0,
        y1: 0,
        x2: FALLBACK_EDGE.min(dims.width.saturating_sub(1)),
        y2: FALLBACK_EDGE.min(dims.height.saturating_sub(1)),
    }
}

fn coerce(raw: &Value, dims: ImageDimensions) -> anyhow::Result<BoundingBox> {
    let max_x = dims.width.saturating_sub(1);
    let max_y = dims.height.saturating_sub(1);
    Ok(BoundingBox {
        x1: clamp(coordinate(raw, "x1")?, max_x),
        y1: clamp(coordinate(raw, "y1")?, max_y),
        x2: clamp(coordinate(raw, "x2")?, max_x),
        y2: clamp(coordinate(raw, "y2")?, max_y),
    })
}

fn coordinate(raw: &Value, field: &str) -> anyhow::Result<f64> {
    let v = raw
        .get(field)
        .ok_or_else(|| anyhow::anyhow!("missing coordinate {}", field))?;
    let n = match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .ok_or_else(|| anyhow::anyhow!("coordinate {} is not numeric: {}", field, v))?;
    anyhow::ensure!(n.is_finite(), "coordinate {} is not finite", field);
    Ok(n.trunc())
}

fn clamp(v: f64, max: u32) -> u32 {
    v.clamp(0.0, max as f64) as u32
}
