//! Exponential backoff for retried jobs.

/// Default base delay between attempts.
pub const DEFAULT_BACKOFF_BASE_MS: u64 = 5_000;

/// Delay before a job that has made `attempts` attempts becomes eligible again.
///
/// `base · 2^(attempts − 1)`, saturating instead of overflowing.
pub fn backoff_delay_ms(base_ms: u64, attempts: u32) -> u64 {
    let exponent = attempts.saturating_sub(1).min(63);
    base_ms.saturating_mul(1u64 << exponent)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles() {
        assert_eq!(backoff_delay_ms(1_000, 1), 1_000);
        assert_eq!(backoff_delay_ms(1_000, 2), 2_000);
        assert_eq!(backoff_delay_ms(1_000, 3), 4_000);
        assert_eq!(backoff_delay_ms(1_000, 5), 16_000);
    }

    #[test]
    fn test_backoff_zero_attempts_treated_as_first() {
        assert_eq!(backoff_delay_ms(250, 0), 250);
    }

    #[test]
    fn test_backoff_saturates() {
        assert_eq!(backoff_delay_ms(u64::MAX / 2, 10), u64::MAX);
        assert_eq!(backoff_delay_ms(1, 200), 1u64 << 63);
    }

    #[test]
    fn test_zero_base_is_immediate() {
        assert_eq!(backoff_delay_ms(0, 7), 0);
    }
}
