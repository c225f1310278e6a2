//! Log-space helpers for tree densities.
//!
//! Densities routinely underflow `f64` when multiplied out, so every
//! likelihood in the workspace is accumulated in log space and probability
//! zero is carried as negative infinity.

/// `ln(n!)`, summed exactly for the tree sizes used here.
pub fn ln_factorial(n: usize) -> f64 {
    (2..=n).map(|k| (k as f64).ln()).sum()
}

/// `ln(Σ exp(x_i))` over a slice, stable for large magnitudes.
///
/// Returns negative infinity for an empty slice or when every term is `-∞`.
pub fn ln_sum_exp(values: &[f64]) -> f64 {
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if max == f64::NEG_INFINITY {
        return f64::NEG_INFINITY;
    }
    if max.is_infinite() {
        return max;
    }
    let sum: f64 = values.iter().map(|&v| (v - max).exp()).sum();
    max + sum.ln()
}
