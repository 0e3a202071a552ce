//! Per-IP token buckets with CIDR allow/deny lists

use crate::addr::{extract_ip, normalize_for_limit};
use governor::clock::DefaultClock;
use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use ipnet::IpNet;
use std::collections::HashMap;
use std::net::IpAddr;
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// How often idle entries are evicted
pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Entries idle longer than this are dropped
const IDLE_EXPIRY: Duration = Duration::from_secs(3600);

/// Hard cap on tracked sources; the map is wiped beyond this
pub const MAX_TRACKED_SOURCES: usize = 10_000;

type Bucket = RateLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>;

/// Bucket settings derived from the configured request budget
#[derive(Debug, Clone, Copy)]
pub struct RateSettings {
    pub request_limit: u32,
    pub period_hours: f64,
}

impl RateSettings {
    fn quota(&self) -> Quota {
        let limit = self.request_limit.max(1);
        let period_secs = (self.period_hours * 3600.0).max(1.0);
        let per_token = Duration::from_secs_f64(period_secs / f64::from(limit));
        let burst = NonZeroU32::new(limit).unwrap_or(NonZeroU32::MIN);

        Quota::with_period(per_token)
            .unwrap_or_else(|| Quota::per_second(NonZeroU32::MIN))
            .allow_burst(burst)
    }
}

/// One tracked source address
pub struct SourceEntry {
    limiter: Bucket,
    last_access: Mutex<Instant>,
}

impl SourceEntry {
    fn new(quota: Quota) -> Self {
        Self {
            limiter: RateLimiter::direct(quota),
            last_access: Mutex::new(Instant::now()),
        }
    }

    fn touch(&self) {
        *self.last_access.lock().expect("last_access poisoned") = Instant::now();
    }

    fn idle_for(&self, now: Instant) -> Duration {
        now.duration_since(*self.last_access.lock().expect("last_access poisoned"))
    }

    /// Try to consume one token
    pub fn try_consume(&self) -> bool {
        self.limiter.check().is_ok()
    }
}

/// Outcome of looking a source up against the lists and the bucket map
pub enum Acquire {
    /// Source is in a deny CIDR; nothing may be served
    Denied,
    /// Source is in an allow CIDR; no budget applies
    Unlimited,
    /// Source is tracked; consume from this entry
    Limited(Arc<SourceEntry>),
}

/// Per-source rate limiter with allow/deny CIDR lists
pub struct IpRateLimiter {
    entries: RwLock<HashMap<String, Arc<SourceEntry>>>,
    quota: Quota,
    whitelist: Vec<IpNet>,
    blacklist: Vec<IpNet>,
}

impl IpRateLimiter {
    pub fn new(settings: RateSettings, whitelist: &[String], blacklist: &[String]) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            quota: settings.quota(),
            whitelist: parse_cidr_list(whitelist, "whitelist"),
            blacklist: parse_cidr_list(blacklist, "blacklist"),
        }
    }

    /// Resolve a raw source address to a rate-limit decision.
    pub async fn acquire(&self, address: &str) -> Acquire {
        let (ip, clean) = extract_ip(address);

        if let Some(ip) = ip {
            if contains(&self.blacklist, ip) {
                return Acquire::Denied;
            }
            if contains(&self.whitelist, ip) {
                return Acquire::Unlimited;
            }
        }

        let key = ip.map(normalize_for_limit).unwrap_or(clean);
        Acquire::Limited(self.entry(key).await)
    }

    async fn entry(&self, key: String) -> Arc<SourceEntry> {
        {
            let read = self.entries.read().await;
            if let Some(entry) = read.get(&key) {
                entry.touch();
                return Arc::clone(entry);
            }
        }

        let mut write = self.entries.write().await;
        // Double-check: another task may have created it while we waited.
        if let Some(entry) = write.get(&key) {
            entry.touch();
            return Arc::clone(entry);
        }

        let entry = Arc::new(SourceEntry::new(self.quota));
        write.insert(key, Arc::clone(&entry));
        entry
    }

    /// Drop idle entries; wipe the whole map past the size cap.
    pub async fn cleanup(&self) {
        let now = Instant::now();
        let mut write = self.entries.write().await;

        write.retain(|_, entry| entry.idle_for(now) <= IDLE_EXPIRY);
        if write.len() > MAX_TRACKED_SOURCES {
            tracing::warn!(tracked = write.len(), "rate-limit map over cap, wiping");
            write.clear();
        }
    }

    pub async fn tracked(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Spawn the periodic eviction sweeper
    pub fn spawn_sweeper(self: &Arc<Self>, period: Duration) -> tokio::task::JoinHandle<()> {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                limiter.cleanup().await;
            }
        })
    }
}

fn parse_cidr_list(items: &[String], which: &str) -> Vec<IpNet> {
    items
        .iter()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .filter_map(|item| {
            let parsed = if item.contains('/') {
                item.parse::<IpNet>().ok()
            } else {
                item.parse::<IpAddr>().ok().map(IpNet::from)
            };
            match parsed {
                Some(net) => Some(net),
                None => {
                    tracing::warn!(entry = item, list = which, "ignoring invalid CIDR entry");
                    None
                }
            }
        })
        .collect()
}

fn contains(list: &[IpNet], ip: IpAddr) -> bool {
    list.iter().any(|net| net.contains(&ip))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(limit: u32, hours: f64) -> RateSettings {
        RateSettings {
            request_limit: limit,
            period_hours: hours,
        }
    }

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn denied_sources_never_get_a_bucket() {
        let limiter = IpRateLimiter::new(settings(10, 1.0), &[], &strings(&["203.0.113.0/24"]));
        assert!(matches!(
            limiter.acquire("203.0.113.9:1234").await,
            Acquire::Denied
        ));
    }

    #[tokio::test]
    async fn allowlisted_sources_are_unlimited() {
        let limiter = IpRateLimiter::new(settings(1, 1.0), &strings(&["10.0.0.0/8"]), &[]);
        assert!(matches!(
            limiter.acquire("10.1.2.3").await,
            Acquire::Unlimited
        ));
    }

    #[tokio::test]
    async fn bare_addresses_in_lists_get_host_masks() {
        let limiter = IpRateLimiter::new(settings(10, 1.0), &[], &strings(&["198.51.100.7"]));
        assert!(matches!(
            limiter.acquire("198.51.100.7").await,
            Acquire::Denied
        ));
        assert!(matches!(
            limiter.acquire("198.51.100.8").await,
            Acquire::Limited(_)
        ));
    }

    #[tokio::test]
    async fn burst_is_the_request_limit() {
        let limiter = IpRateLimiter::new(settings(3, 1.0), &[], &[]);
        let entry = match limiter.acquire("192.0.2.1").await {
            Acquire::Limited(entry) => entry,
            _ => panic!("expected a tracked entry"),
        };

        assert!(entry.try_consume());
        assert!(entry.try_consume());
        assert!(entry.try_consume());
        assert!(!entry.try_consume());
    }

    #[tokio::test]
    async fn same_ipv6_prefix_shares_one_bucket() {
        let limiter = IpRateLimiter::new(settings(2, 1.0), &[], &[]);

        let a = match limiter.acquire("2001:db8:0:1::aa").await {
            Acquire::Limited(e) => e,
            _ => panic!(),
        };
        let b = match limiter.acquire("2001:db8:0:1::bb").await {
            Acquire::Limited(e) => e,
            _ => panic!(),
        };

        assert!(a.try_consume());
        assert!(b.try_consume());
        assert!(!a.try_consume());
        assert_eq!(limiter.tracked().await, 1);
    }

    #[tokio::test]
    async fn invalid_cidr_entries_are_skipped() {
        let limiter = IpRateLimiter::new(settings(5, 1.0), &[], &strings(&["garbage", ""]));
        assert!(matches!(
            limiter.acquire("192.0.2.1").await,
            Acquire::Limited(_)
        ));
    }

    #[tokio::test]
    async fn zero_limit_still_allows_one() {
        let limiter = IpRateLimiter::new(settings(0, 1.0), &[], &[]);
        let entry = match limiter.acquire("192.0.2.2").await {
            Acquire::Limited(e) => e,
            _ => panic!(),
        };
        assert!(entry.try_consume());
        assert!(!entry.try_consume());
    }
}
