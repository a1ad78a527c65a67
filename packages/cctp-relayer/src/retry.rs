//! Retry and error recovery utilities
//!
//! Provides exponential backoff for scan jobs and error-text classification
//! for broadcast failures.

use std::time::Duration;

/// Backoff configuration
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Initial backoff duration
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    pub max_backoff: Duration,
    /// Backoff multiplier for exponential growth
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(60),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Calculate backoff duration for a given attempt (0-indexed)
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let backoff_secs =
            self.initial_backoff.as_secs_f64() * self.backoff_multiplier.powi(attempt as i32);
        let capped = backoff_secs.min(self.max_backoff.as_secs_f64());
        Duration::from_secs_f64(capped)
    }
}

/// Classifies broadcast errors for retry decisions
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorClass {
    /// The destination already consumed this message nonce
    AlreadyConsumed,
    /// Account sequence / EVM nonce out of sync - resync then retry
    SequenceMismatch,
    /// Temporary failure - should retry (RPC timeout, network issues)
    Transient,
    /// Permanent failure - retrying the same tx will not help
    Permanent,
    /// Unknown error - may retry with backoff
    Unknown,
}

/// Classify an error for retry decisions
pub fn classify_error(error: &str) -> ErrorClass {
    let error_lower = error.to_lowercase();

    // Checked first: the contract revert for a consumed nonce also reads "reverted"
    if error_lower.contains("nonce already used") {
        return ErrorClass::AlreadyConsumed;
    }

    if error_lower.contains("account sequence mismatch")
        || error_lower.contains("incorrect account sequence")
        || error_lower.contains("nonce too low")
        || error_lower.contains("nonce too high")
    {
        return ErrorClass::SequenceMismatch;
    }

    // Transient errors
    if error_lower.contains("timeout")
        || error_lower.contains("timed out")
        || error_lower.contains("connection")
        || error_lower.contains("network")
        || error_lower.contains("rate limit")
        || error_lower.contains("too many requests")
        || error_lower.contains("503")
        || error_lower.contains("502")
        || error_lower.contains("temporarily unavailable")
        || error_lower.contains("mempool is full")
    {
        return ErrorClass::Transient;
    }

    // Permanent errors
    if error_lower.contains("reverted")
        || error_lower.contains("invalid signature")
        || error_lower.contains("invalid attestation")
        || error_lower.contains("insufficient funds")
        || error_lower.contains("out of gas")
        || error_lower.contains("invalid parameters")
    {
        return ErrorClass::Permanent;
    }

    ErrorClass::Unknown
}

/// Extract the sequence the chain expects from a mismatch error.
///
/// Understands the Cosmos SDK form (`account sequence mismatch, expected 42,
/// got 41`) and the geth form (`nonce too low: next nonce 42, tx nonce 41`).
pub fn parse_expected_sequence(error: &str) -> Option<u64> {
    let error_lower = error.to_lowercase();
    ["expected ", "next nonce "]
        .iter()
        .find_map(|marker| number_after(&error_lower, marker))
}

fn number_after(haystack: &str, marker: &str) -> Option<u64> {
    let start = haystack.find(marker)? + marker.len();
    let digits: String = haystack[start..]
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_calculation() {
        let config = RetryConfig::default();

        assert_eq!(config.backoff_for_attempt(0), Duration::from_secs(2));
        assert_eq!(config.backoff_for_attempt(1), Duration::from_secs(4));
        assert_eq!(config.backoff_for_attempt(2), Duration::from_secs(8));
        assert_eq!(config.backoff_for_attempt(5), Duration::from_secs(60)); // capped
    }

    #[test]
    fn test_error_classification() {
        assert_eq!(classify_error("connection timeout"), ErrorClass::Transient);
        assert_eq!(
            classify_error("account sequence mismatch, expected 42, got 41: incorrect account sequence"),
            ErrorClass::SequenceMismatch
        );
        assert_eq!(
            classify_error("nonce too low: next nonce 7, tx nonce 5"),
            ErrorClass::SequenceMismatch
        );
        assert_eq!(classify_error("nonce too high"), ErrorClass::SequenceMismatch);
        assert_eq!(classify_error("execution reverted"), ErrorClass::Permanent);
        assert_eq!(
            classify_error("insufficient funds for gas * price + value"),
            ErrorClass::Permanent
        );
        assert_eq!(classify_error("some unknown error"), ErrorClass::Unknown);
    }

    #[test]
    fn test_consumed_nonce_wins_over_revert() {
        assert_eq!(
            classify_error("execution reverted: Nonce already used"),
            ErrorClass::AlreadyConsumed
        );
        assert_eq!(
            classify_error("failed to execute message; nonce already used"),
            ErrorClass::AlreadyConsumed
        );
    }

    #[test]
    fn test_parse_expected_sequence() {
        assert_eq!(
            parse_expected_sequence("account sequence mismatch, expected 42, got 41: incorrect account sequence"),
            Some(42)
        );
        assert_eq!(
            parse_expected_sequence("nonce too low: next nonce 7, tx nonce 5"),
            Some(7)
        );
        assert_eq!(parse_expected_sequence("nonce too high"), None);
        assert_eq!(parse_expected_sequence("expected nothing"), None);
    }
}
