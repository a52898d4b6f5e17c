//! Property-based tests for the rate limiter.
//!
//! These verify the admission invariants over arbitrary request sequences:
//! the limiter never admits past a configured limit, and a reserve followed
//! by a rollback is a no-op on the counters.

use modelrelay::core::config::RateLimits;
use modelrelay::core::rate_limiter::{estimate_tokens, RateLimiter};
use proptest::prelude::*;

proptest! {
    /// Admissions gated by check() never exceed the rpm limit.
    #[test]
    fn prop_rpm_never_exceeded(limit in 1u32..50, attempts in 1usize..200) {
        let limiter = RateLimiter::new();
        let limits = RateLimits { rpm: Some(limit), ..Default::default() };

        let mut admitted = 0usize;
        for _ in 0..attempts {
            if limiter.check("p", &limits, None).is_ok() {
                limiter.reserve("p");
                admitted += 1;
            }
        }

        prop_assert!(admitted as u32 <= limit);
        let status = limiter.status("p", &limits);
        prop_assert!(status.rpm_used as u32 <= limit);
    }

    /// Admissions gated by check() never exceed the tpm limit.
    #[test]
    fn prop_tpm_never_exceeded(limit in 1u64..10_000, costs in prop::collection::vec(1u64..500, 1..100)) {
        let limiter = RateLimiter::new();
        let limits = RateLimits { tpm: Some(limit), ..Default::default() };

        for cost in costs {
            if limiter.check("p", &limits, Some(cost)).is_ok() {
                let ticket = limiter.reserve("p");
                limiter.commit(ticket, cost);
            }
        }

        let status = limiter.status("p", &limits);
        prop_assert!(status.tpm_used <= limit);
    }

    /// reserve followed by rollback leaves every counter unchanged.
    #[test]
    fn prop_reserve_rollback_is_identity(prior in 0usize..20) {
        let limiter = RateLimiter::new();
        let limits = RateLimits::default();

        for _ in 0..prior {
            limiter.reserve("p");
        }
        let before = limiter.status("p", &limits);

        let ticket = limiter.reserve("p");
        limiter.rollback(ticket);

        let after = limiter.status("p", &limits);
        prop_assert_eq!(before.rpm_used, after.rpm_used);
        prop_assert_eq!(before.rpd_used, after.rpd_used);
        prop_assert_eq!(before.tpm_used, after.tpm_used);
    }

    /// The chars/4 estimate is exact ceiling division.
    #[test]
    fn prop_estimate_is_ceiling_division(chars in 0usize..1_000_000) {
        let estimate = estimate_tokens(chars);
        prop_assert!(estimate * 4 >= chars as u64);
        prop_assert!(estimate.saturating_sub(1) * 4 < chars.max(1) as u64);
    }

    /// tpr admits exactly up to the ceiling, statelessly.
    #[test]
    fn prop_tpr_boundary(limit in 1u64..100_000, hint in 0u64..200_000) {
        let limiter = RateLimiter::new();
        let limits = RateLimits { tpr: Some(limit), ..Default::default() };

        let allowed = limiter.check("p", &limits, Some(hint)).is_ok();
        prop_assert_eq!(allowed, hint <= limit);
    }
}
