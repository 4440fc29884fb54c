use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::Duration;

use http::HeaderMap;

use crate::request::CachePolicy;
use crate::util::duration_to_millis;

const DEFAULT_TIMEOUT_MS: u64 = 60_000;
const DEFAULT_MAX_ACTIVE_REQUESTS: usize = 4;
const DEFAULT_NETWORK_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_EVENT_CAPACITY: usize = 256;

static DEFAULT_TIMEOUT: AtomicU64 = AtomicU64::new(DEFAULT_TIMEOUT_MS);
static DEFAULT_CACHE_POLICY: AtomicU8 = AtomicU8::new(CachePolicy::UseProtocol as u8);

/// Process-wide fallback timeout, read when a request without its own timeout (and without a
/// session default) is built for dispatch.
pub fn default_timeout() -> Duration {
    Duration::from_millis(DEFAULT_TIMEOUT.load(Ordering::Relaxed))
}

pub fn set_default_timeout(timeout: Duration) {
    DEFAULT_TIMEOUT.store(duration_to_millis(timeout).max(1), Ordering::Relaxed);
}

pub fn default_cache_policy() -> CachePolicy {
    CachePolicy::from_u8(DEFAULT_CACHE_POLICY.load(Ordering::Relaxed))
}

pub fn set_default_cache_policy(cache_policy: CachePolicy) {
    DEFAULT_CACHE_POLICY.store(cache_policy as u8, Ordering::Relaxed);
}

#[derive(Clone, Debug, Default)]
pub struct SessionConfig {
    pub default_headers: HeaderMap,
    pub request_timeout: Option<Duration>,
    pub cache_policy: Option<CachePolicy>,
}

impl SessionConfig {
    pub fn with_default_headers(mut self, default_headers: HeaderMap) -> Self {
        self.default_headers = default_headers;
        self
    }

    /// Applies to requests that did not set their own timeout.
    pub fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = Some(request_timeout);
        self
    }

    pub fn with_cache_policy(mut self, cache_policy: CachePolicy) -> Self {
        self.cache_policy = Some(cache_policy);
        self
    }
}

#[derive(Clone, Debug)]
pub struct RemoteDataConfig {
    pub max_active_requests: usize,
    pub network_timeout: Duration,
    pub event_capacity: usize,
}

impl Default for RemoteDataConfig {
    fn default() -> Self {
        Self {
            max_active_requests: DEFAULT_MAX_ACTIVE_REQUESTS,
            network_timeout: DEFAULT_NETWORK_TIMEOUT,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl RemoteDataConfig {
    pub fn with_max_active_requests(mut self, max_active_requests: usize) -> Self {
        self.max_active_requests = max_active_requests.max(1);
        self
    }

    pub fn with_network_timeout(mut self, network_timeout: Duration) -> Self {
        self.network_timeout = network_timeout;
        self
    }

    pub fn with_event_capacity(mut self, event_capacity: usize) -> Self {
        self.event_capacity = event_capacity.max(1);
        self
    }
}
