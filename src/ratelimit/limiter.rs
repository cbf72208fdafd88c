//! Decision orchestrator: the single entry point for request-handling code.

use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::{debug, trace, warn};

use super::backend::CounterBackend;
use super::clock::{Clock, SystemClock};
use super::counter::{local_key, LocalCounter};
use super::decision::{ActionOutcome, Decision, Rejection};
use super::distributed::RedisCounter;
use super::identifier::{Identifier, RequestContext};
use super::policy::{Category, PolicyRegistry, RateLimitPolicy};
use super::routes;
use crate::config::TollgateConfig;
use crate::error::{Result, TollgateError};

/// Latency budget for the shared store when none is configured.
const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(250);

static GLOBAL: OnceLock<RateLimiter> = OnceLock::new();

/// The rate limiter consulted by every protected request path.
///
/// Each check goes to the shared store first. Any failure or timeout there moves that
/// single check to the in-process counter. The two counters keep independent state, so a
/// process that flaps between them under-counts; they are never reconciled.
pub struct RateLimiter {
    registry: PolicyRegistry,
    distributed: Option<Arc<dyn CounterBackend>>,
    local: Arc<LocalCounter>,
    clock: Arc<dyn Clock>,
    store_timeout: Duration,
    sweep_interval: Option<Duration>,
}

impl RateLimiter {
    /// Create a local-only rate limiter with the standard policy table.
    pub fn new() -> Self {
        Self::with_backends(PolicyRegistry::standard(), None, Arc::new(LocalCounter::new()))
    }

    /// Create a rate limiter from explicit parts.
    pub fn with_backends(
        registry: PolicyRegistry,
        distributed: Option<Arc<dyn CounterBackend>>,
        local: Arc<LocalCounter>,
    ) -> Self {
        Self {
            registry,
            distributed,
            local,
            clock: Arc::new(SystemClock),
            store_timeout: DEFAULT_STORE_TIMEOUT,
            sweep_interval: None,
        }
    }

    /// Create a rate limiter from configuration.
    ///
    /// The shared store is enabled only when both endpoint and credential are present. The
    /// local sweeper is started now if a tokio runtime is available, and otherwise on the
    /// first check that falls back to the local counter.
    pub fn from_config(config: &TollgateConfig) -> Result<Self> {
        let distributed = RedisCounter::from_config(&config.store)?
            .map(|counter| Arc::new(counter) as Arc<dyn CounterBackend>);

        Ok(Self::with_backends(
            PolicyRegistry::standard(),
            distributed,
            Arc::new(LocalCounter::new()),
        )
        .with_store_timeout(config.store.timeout())
        .with_sweep_interval(config.fallback.sweep_interval()))
    }

    /// The process-wide rate limiter, built from the environment on first use.
    pub fn global() -> &'static RateLimiter {
        GLOBAL.get_or_init(|| {
            let config = TollgateConfig::from_env().unwrap_or_else(|e| {
                warn!(error = %e, "Invalid rate limit configuration, using defaults");
                TollgateConfig::default()
            });

            Self::from_config(&config).unwrap_or_else(|e| {
                warn!(error = %e, "Shared counter store disabled");
                Self::with_backends(
                    PolicyRegistry::standard(),
                    None,
                    Arc::new(LocalCounter::new()),
                )
                .with_sweep_interval(config.fallback.sweep_interval())
            })
        })
    }

    /// Replace the clock used for retry-after arithmetic.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Set the latency budget for one shared-store call.
    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    /// Keep the local counter's sweeper running at `interval`.
    ///
    /// The sweeper is started immediately when called inside a tokio runtime. Checks that
    /// fall back to the local counter restart it if it never started or its runtime is gone.
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.local.start_sweeper(interval);
        self.sweep_interval = Some(interval);
        self
    }

    /// Check a live request against its category's policy.
    pub async fn check(&self, context: &RequestContext, category: Category) -> Decision {
        let identifier = context.identifier();
        self.check_identifier(category, &identifier).await
    }

    /// Check an action keyed by an explicit identifier such as an email address or job id.
    pub async fn check_by_key(&self, category: Category, key: &str) -> ActionOutcome {
        let decision = self.check_identifier(category, &Identifier::explicit(key)).await;
        ActionOutcome::from_decision(&decision, self.clock.now())
    }

    /// Classify and check a request path. Excluded paths return `None` without counting.
    pub async fn check_path(&self, path: &str, context: &RequestContext) -> Option<Decision> {
        if routes::is_excluded(path) {
            trace!(path = %path, "Path excluded from rate limiting");
            return None;
        }

        Some(self.check(context, routes::classify(path)).await)
    }

    /// Render the 429 payload for a rejected decision.
    pub fn rejection(&self, decision: &Decision) -> Option<Rejection> {
        decision.rejection(self.clock.now())
    }

    /// Seconds until a decision's window resets.
    pub fn retry_after_secs(&self, decision: &Decision) -> u64 {
        decision.retry_after_secs(self.clock.now())
    }

    /// The policy table.
    pub fn registry(&self) -> &PolicyRegistry {
        &self.registry
    }

    /// The in-process counter.
    pub fn local(&self) -> &Arc<LocalCounter> {
        &self.local
    }

    /// Whether a shared store is configured.
    pub fn has_distributed(&self) -> bool {
        self.distributed.is_some()
    }

    /// Check an already-resolved identifier.
    pub async fn check_identifier(&self, category: Category, identifier: &Identifier) -> Decision {
        let policy = self.registry.resolve(category);

        trace!(
            category = %policy.category,
            identifier = %identifier,
            "Checking rate limit"
        );

        let decision = match self.try_distributed(policy, identifier).await {
            Some(decision) => decision,
            None => {
                if let Some(interval) = self.sweep_interval {
                    self.local.ensure_sweeper(interval);
                }
                let key = local_key(policy.category, identifier);
                self.local.check(&key, policy.limit, policy.window_seconds)
            }
        };

        if !decision.allowed {
            debug!(
                category = %policy.category,
                identifier = %identifier,
                backend = ?decision.backend,
                limit = decision.limit,
                reset_at = %decision.reset_at,
                "Rate limit exceeded"
            );
        }

        decision
    }

    async fn try_distributed(
        &self,
        policy: &RateLimitPolicy,
        identifier: &Identifier,
    ) -> Option<Decision> {
        let backend = self.distributed.as_ref()?;

        let result = tokio::time::timeout(self.store_timeout, backend.hit(policy, identifier))
            .await
            .unwrap_or_else(|_| Err(TollgateError::StoreTimeout(self.store_timeout)));

        match result {
            Ok(decision) => Some(decision),
            Err(e) => {
                warn!(
                    error = %e,
                    category = %policy.category,
                    "Shared counter unavailable, using local counter"
                );
                None
            }
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::ManualClock;
    use crate::ratelimit::decision::{parse_reset_header, BackendKind};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Always fails like a refused connection.
    struct FailingBackend {
        calls: AtomicU64,
    }

    #[async_trait]
    impl CounterBackend for FailingBackend {
        async fn hit(&self, _: &RateLimitPolicy, _: &Identifier) -> Result<Decision> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(redis::RedisError::from((redis::ErrorKind::IoError, "connection refused")).into())
        }

        fn kind(&self) -> BackendKind {
            BackendKind::Distributed
        }
    }

    /// Never answers.
    struct HangingBackend;

    #[async_trait]
    impl CounterBackend for HangingBackend {
        async fn hit(&self, _: &RateLimitPolicy, _: &Identifier) -> Result<Decision> {
            std::future::pending().await
        }

        fn kind(&self) -> BackendKind {
            BackendKind::Distributed
        }
    }

    /// A healthy shared store stand-in: its own map, reported as distributed.
    struct HealthyBackend {
        counter: LocalCounter,
        fail_every_other: bool,
        calls: AtomicU64,
    }

    impl HealthyBackend {
        fn new(clock: &ManualClock, fail_every_other: bool) -> Self {
            Self {
                counter: LocalCounter::with_clock(Arc::new(clock.clone())),
                fail_every_other,
                calls: AtomicU64::new(0),
            }
        }
    }

    #[async_trait]
    impl CounterBackend for HealthyBackend {
        async fn hit(&self, policy: &RateLimitPolicy, identifier: &Identifier) -> Result<Decision> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_every_other && call % 2 == 1 {
                return Err(TollgateError::StoreTimeout(Duration::from_millis(1)));
            }
            let mut decision = self.counter.hit(policy, identifier).await?;
            decision.backend = BackendKind::Distributed;
            Ok(decision)
        }

        fn kind(&self) -> BackendKind {
            BackendKind::Distributed
        }
    }

    fn limiter_with(
        clock: &ManualClock,
        distributed: Option<Arc<dyn CounterBackend>>,
    ) -> RateLimiter {
        let local = Arc::new(LocalCounter::with_clock(Arc::new(clock.clone())));
        RateLimiter::with_backends(PolicyRegistry::standard(), distributed, local)
            .with_clock(Arc::new(clock.clone()))
    }

    fn ip_context(addr: &str) -> RequestContext {
        RequestContext::new().with_forwarded_for(addr)
    }

    #[tokio::test]
    async fn test_auth_scenario() {
        let clock = ManualClock::default();
        let limiter = limiter_with(&clock, None);
        let ctx = ip_context("203.0.113.7");

        for expected_remaining in [4, 3, 2, 1, 0] {
            let decision = limiter.check(&ctx, Category::Auth).await;
            assert!(decision.allowed);
            assert_eq!(decision.limit, 5);
            assert_eq!(decision.remaining, expected_remaining);
        }

        // 6th request in the same window is rejected
        clock.advance(Duration::from_secs(15));
        let decision = limiter.check(&ctx, Category::Auth).await;
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 0);
        assert_eq!(limiter.retry_after_secs(&decision), 45);

        let rejection = limiter.rejection(&decision).unwrap();
        assert_eq!(rejection.retry_after(), 45);
        let reset = parse_reset_header(&rejection.headers).unwrap();
        assert!((reset - decision.reset_at).num_milliseconds().abs() < 1000);
    }

    #[tokio::test]
    async fn test_export_scenario_identifiers_are_independent() {
        let clock = ManualClock::default();
        let limiter = limiter_with(&clock, None);
        let alice = RequestContext::new().with_principal("42");
        let bob = RequestContext::new().with_principal("77");

        for _ in 0..3 {
            assert!(limiter.check(&alice, Category::Export).await.allowed);
            assert!(limiter.check(&bob, Category::Export).await.allowed);
        }

        assert!(!limiter.check(&alice, Category::Export).await.allowed);
        assert_eq!(limiter.local().entry("export:user:77").unwrap().count, 3);

        assert!(!limiter.check(&bob, Category::Export).await.allowed);
    }

    #[tokio::test]
    async fn test_allowed_again_after_window() {
        let clock = ManualClock::default();
        let limiter = limiter_with(&clock, None);
        let ctx = ip_context("198.51.100.1");

        for _ in 0..4 {
            limiter.check(&ctx, Category::Export).await;
        }
        assert!(!limiter.check(&ctx, Category::Export).await.allowed);

        clock.advance(Duration::from_secs(60));

        let decision = limiter.check(&ctx, Category::Export).await;
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 2);
    }

    #[tokio::test]
    async fn test_categories_count_separately() {
        let clock = ManualClock::default();
        let limiter = limiter_with(&clock, None);
        let ctx = ip_context("203.0.113.7");

        for _ in 0..5 {
            limiter.check(&ctx, Category::Auth).await;
        }
        assert!(!limiter.check(&ctx, Category::Auth).await.allowed);

        let decision = limiter.check(&ctx, Category::Checkout).await;
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 9);
    }

    #[tokio::test]
    async fn test_failing_store_falls_back_to_local() {
        let clock = ManualClock::default();
        let failing = Arc::new(FailingBackend {
            calls: AtomicU64::new(0),
        });
        let limiter = limiter_with(&clock, Some(failing.clone()));
        let ctx = ip_context("203.0.113.7");

        let decision = limiter.check(&ctx, Category::Auth).await;
        assert!(decision.allowed);
        assert_eq!(decision.backend, BackendKind::Local);
        assert_eq!(decision.remaining, 4);

        // No inline retries: one store attempt per check
        limiter.check(&ctx, Category::Auth).await;
        assert_eq!(failing.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_store_times_out_to_local() {
        let clock = ManualClock::default();
        let limiter = limiter_with(&clock, Some(Arc::new(HangingBackend)))
            .with_store_timeout(Duration::from_millis(100));

        let decision = limiter.check(&ip_context("203.0.113.7"), Category::Public).await;
        assert!(decision.allowed);
        assert_eq!(decision.backend, BackendKind::Local);
        assert_eq!(decision.remaining, 99);
    }

    #[tokio::test]
    async fn test_healthy_store_is_preferred() {
        let clock = ManualClock::default();
        let limiter = limiter_with(&clock, Some(Arc::new(HealthyBackend::new(&clock, false))));
        let ctx = ip_context("203.0.113.7");

        let decision = limiter.check(&ctx, Category::Auth).await;
        assert_eq!(decision.backend, BackendKind::Distributed);
        assert_eq!(decision.remaining, 4);

        // The local counter is untouched while the store is healthy
        assert!(limiter.local().is_empty());
    }

    #[tokio::test]
    async fn test_flapping_store_undercounts() {
        let clock = ManualClock::default();
        let limiter = limiter_with(&clock, Some(Arc::new(HealthyBackend::new(&clock, true))));
        let ctx = ip_context("203.0.113.7");

        // Alternating backends each see half the traffic, so 8 requests pass a limit of 5
        for _ in 0..8 {
            assert!(limiter.check(&ctx, Category::Auth).await.allowed);
        }
        assert_eq!(limiter.local().entry("auth:ip:203.0.113.7").unwrap().count, 4);
    }

    #[tokio::test]
    async fn test_unconfigured_matches_local_only() {
        let clock = ManualClock::default();
        let limiter = limiter_with(&clock, None);
        let reference = LocalCounter::with_clock(Arc::new(clock.clone()));
        let ctx = ip_context("192.0.2.44");

        for _ in 0..12 {
            let got = limiter.check(&ctx, Category::Checkout).await;
            let expected = reference.check("checkout:ip:192.0.2.44", 10, 60);
            assert_eq!(got, expected);
        }
        assert!(!limiter.has_distributed());
    }

    #[tokio::test]
    async fn test_check_by_key() {
        let clock = ManualClock::default();
        let limiter = limiter_with(&clock, None);

        for _ in 0..5 {
            assert!(limiter.check_by_key(Category::Auth, "chef@example.com").await.success);
        }

        let outcome = limiter.check_by_key(Category::Auth, "chef@example.com").await;
        assert!(!outcome.success);
        assert_eq!(outcome.retry_after, Some(60));
        assert!(outcome.error.unwrap().contains("60 seconds"));

        // A different key is unaffected
        assert!(limiter.check_by_key(Category::Auth, "owner@example.com").await.success);
    }

    #[tokio::test]
    async fn test_check_path() {
        let clock = ManualClock::default();
        let limiter = limiter_with(&clock, None);
        let ctx = ip_context("203.0.113.7");

        assert!(limiter.check_path("/_next/static/app.js", &ctx).await.is_none());
        assert!(limiter.check_path("/api/health", &ctx).await.is_none());
        assert!(limiter.local().is_empty());

        let decision = limiter.check_path("/login", &ctx).await.unwrap();
        assert_eq!(decision.limit, 5);
        assert!(limiter.local().entry("auth:ip:203.0.113.7").is_some());
    }

    #[tokio::test]
    async fn test_unknown_caller_shares_bucket() {
        let clock = ManualClock::default();
        let limiter = limiter_with(&clock, None);

        limiter.check(&RequestContext::new(), Category::Public).await;
        let decision = limiter.check(&RequestContext::new(), Category::Public).await;

        assert_eq!(decision.remaining, 98);
        assert!(limiter.local().entry("public:ip:unknown").is_some());
    }

    #[tokio::test]
    async fn test_from_config_without_store() {
        let limiter = RateLimiter::from_config(&TollgateConfig::default()).unwrap();
        assert!(!limiter.has_distributed());
        assert!(limiter.local().is_sweeping());

        limiter.local().destroy();
        assert!(!limiter.local().is_sweeping());
    }

    #[tokio::test]
    async fn test_unreachable_store_still_admits() {
        let mut config = TollgateConfig::default();
        config.store.url = Some("redis://127.0.0.1:1".to_string());
        config.store.token = Some("token".to_string());
        config.store.timeout_ms = 200;

        let limiter = RateLimiter::from_config(&config).unwrap();
        assert!(limiter.has_distributed());

        let decision = limiter.check(&ip_context("203.0.113.7"), Category::Auth).await;
        assert!(decision.allowed);
        assert_eq!(decision.backend, BackendKind::Local);
        limiter.local().destroy();
    }

    #[test]
    fn test_sweeper_starts_on_first_check_without_runtime() {
        let limiter = RateLimiter::from_config(&TollgateConfig::default()).unwrap();
        assert!(!limiter.local().is_sweeping());

        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async {
            limiter.check(&ip_context("203.0.113.7"), Category::Public).await;
            assert!(limiter.local().is_sweeping());
        });
    }

    #[test]
    fn test_sweeper_restarts_on_a_new_runtime() {
        let first = tokio::runtime::Runtime::new().unwrap();
        let limiter =
            first.block_on(async { RateLimiter::from_config(&TollgateConfig::default()).unwrap() });
        assert!(limiter.local().is_sweeping());

        drop(first);
        assert!(!limiter.local().is_sweeping());

        let second = tokio::runtime::Runtime::new().unwrap();
        second.block_on(async {
            limiter.check(&ip_context("203.0.113.7"), Category::Public).await;
            assert!(limiter.local().is_sweeping());
        });
    }

    #[tokio::test]
    async fn test_refused_store_falls_back_quickly() {
        let mut config = TollgateConfig::default();
        config.store.url = Some("redis://127.0.0.1:1".to_string());
        config.store.token = Some("token".to_string());
        config.store.timeout_ms = 10_000;

        let limiter = RateLimiter::from_config(&config).unwrap();
        for _ in 0..3 {
            let started = std::time::Instant::now();
            let decision = limiter.check(&ip_context("203.0.113.7"), Category::Auth).await;

            assert_eq!(decision.backend, BackendKind::Local);
            assert!(started.elapsed() < Duration::from_secs(2));
        }
        limiter.local().destroy();
    }

    #[tokio::test]
    async fn test_global_is_a_singleton() {
        let a = RateLimiter::global() as *const RateLimiter;
        let b = RateLimiter::global() as *const RateLimiter;
        assert_eq!(a, b);
    }
}
