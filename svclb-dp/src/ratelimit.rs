//! Token bucket limiter over a shared table.

use crate::maps::RateLimitMaps;
use svclb_common::{RateLimitKey, RateLimitValue};

pub const NSEC_PER_SEC: u64 = 1_000_000_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateLimitSettings {
    pub bucket_size: u64,
    pub tokens_per_topup: u64,
    pub topup_interval_ns: u64,
}

/// ICMPv6 unreachable replies: 100 per second, bursts up to 1000.
pub const ICMPV6_NO_BACKEND: RateLimitSettings = RateLimitSettings {
    bucket_size: 1000,
    tokens_per_topup: 100,
    topup_interval_ns: NSEC_PER_SEC,
};

/// Takes one token from the bucket of `key`, false if it is empty. A new
/// bucket starts full. Concurrent callers may both take the last token,
/// the limit is approximate.
pub fn check_and_take<M: RateLimitMaps>(
    maps: &M,
    key: &RateLimitKey,
    settings: &RateLimitSettings,
    now: u64,
) -> bool {
    let Some(mut value) = maps.ratelimit_entry(key) else {
        let value = RateLimitValue {
            last_topup: now,
            tokens: settings.bucket_size.saturating_sub(1),
        };
        maps.upsert_ratelimit(key, &value);
        return settings.bucket_size > 0;
    };

    let elapsed = now.saturating_sub(value.last_topup);
    if settings.topup_interval_ns > 0 && elapsed >= settings.topup_interval_ns {
        let topups = elapsed / settings.topup_interval_ns;
        value.tokens = value
            .tokens
            .saturating_add(topups.saturating_mul(settings.tokens_per_topup))
            .min(settings.bucket_size);
        value.last_topup += topups * settings.topup_interval_ns;
    }

    if value.tokens == 0 {
        maps.upsert_ratelimit(key, &value);
        return false;
    }

    value.tokens -= 1;
    maps.upsert_ratelimit(key, &value);
    true
}
