//! Per-source rate limiting and the smart pull-exemption window

mod addr;
mod ratelimit;
mod session;

pub use addr::{extract_ip, normalize_for_limit};
pub use ratelimit::{
    Acquire, IpRateLimiter, RateSettings, SourceEntry, CLEANUP_INTERVAL, MAX_TRACKED_SOURCES,
};
pub use session::{parse_pull_verb, PullSessions, PullVerb, SESSION_SWEEP_INTERVAL};
