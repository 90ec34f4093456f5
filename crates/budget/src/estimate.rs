//! Admission-time cost estimation.

/// Fallback estimate when no pricing entry exists for the model.
pub const CONSERVATIVE_ESTIMATE: f64 = 0.01;

/// Default output reservation when the client did not set `max_tokens`.
pub const DEFAULT_MAX_TOKENS: u32 = 1024;

/// Estimate the worst-case cost of a request before dispatch.
///
/// `(input estimate + max_tokens or default) × pricing`; a conservative
/// constant when the model has no pricing entry. Reconciliation corrects
/// the cached spend once the actual cost is known.
pub fn estimate_cost(
    input_tokens: u32,
    max_tokens: Option<u32>,
    pricing: Option<(f64, f64)>,
) -> f64 {
    let output_tokens = max_tokens.unwrap_or(DEFAULT_MAX_TOKENS);
    match pricing {
        Some((input_cost, output_cost)) => {
            input_tokens as f64 * input_cost + output_tokens as f64 * output_cost
        }
        None => CONSERVATIVE_ESTIMATE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priced_model_uses_token_volumes() {
        // 100 in @ $10/M, 50 out @ $30/M
        let cost = estimate_cost(100, Some(50), Some((10.0 / 1e6, 30.0 / 1e6)));
        assert!((cost - (100.0 * 10.0 + 50.0 * 30.0) / 1e6).abs() < 1e-12);
    }

    #[test]
    fn missing_max_tokens_reserves_default() {
        let with_default = estimate_cost(10, None, Some((1e-6, 1e-6)));
        let explicit = estimate_cost(10, Some(DEFAULT_MAX_TOKENS), Some((1e-6, 1e-6)));
        assert_eq!(with_default, explicit);
    }

    #[test]
    fn unpriced_model_is_conservative() {
        assert_eq!(estimate_cost(1_000_000, Some(1_000_000), None), CONSERVATIVE_ESTIMATE);
    }
}
