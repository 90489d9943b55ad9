use tracing::{debug, warn};

/// Raw sums this close to 100 are not rescaled.
pub const PASSTHROUGH_TOLERANCE: f64 = 0.1;
/// Largest deviation from 100 allowed after normalization.
pub const SUM_TOLERANCE: f64 = 0.01;

#[derive(Debug, Clone, PartialEq)]
pub struct Normalized {
    pub values: Vec<f64>,
    pub raw_sum: f64,
    pub rescaled: bool,
}

impl Normalized {
    /// A zero raw sum cannot be scaled to 100; every value came out 0.
    pub fn is_degenerate(&self) -> bool {
        self.raw_sum <= 0.0
    }
}

/// Forces area percentages to sum to 100.
///
/// Sums within [`PASSTHROUGH_TOLERANCE`] are left unscaled, otherwise every
/// value is multiplied by `100 / raw_sum`. Any residual still above
/// [`SUM_TOLERANCE`] goes entirely to the first value, never the largest.
/// When that would leave the first value at or below zero, the values are
/// rescaled instead.
pub fn normalize_percentages(raw: &[f64]) -> Normalized {
    let raw_sum: f64 = raw.iter().sum();
    let mut values = raw.to_vec();
    if values.is_empty() {
        return Normalized {
            values,
            raw_sum,
            rescaled: false,
        };
    }

    let mut rescaled = (raw_sum - 100.0).abs() > PASSTHROUGH_TOLERANCE;
    if !rescaled {
        let residual = 100.0 - raw_sum;
        if residual.abs() > SUM_TOLERANCE && values[0] + residual <= 0.0 {
            debug!(residual, first = values[0], "first item cannot absorb residual; rescaling");
            rescaled = true;
        }
    }
    if rescaled {
        let factor = if raw_sum > 0.0 { 100.0 / raw_sum } else { 0.0 };
        warn!(raw_sum, factor, "area percentages do not sum to 100; rescaling");
        values.iter_mut().for_each(|v| *v *= factor);
        if raw_sum <= 0.0 {
            return Normalized {
                values,
                raw_sum,
                rescaled,
            };
        }
    }

    let residual = 100.0 - values.iter().sum::<f64>();
    if residual.abs() > SUM_TOLERANCE && values[0] + residual > 0.0 {
        debug!(residual, "assigning residual to first item");
        values[0] += residual;
    }

    Normalized {
        values,
        raw_sum,
        rescaled,
    }
}
