//! Per-tenant QoS limiting.
//!
//! [`QosMeta`] answers three questions on the request path: may this
//! read proceed, may this write proceed, and how fast may this body
//! stream.  Bucket-to-tenant and tenant-to-limit mappings live in an
//! immutable snapshot behind [`ArcSwap`], republished by one background
//! task; request-path reads never take a lock.  The counters themselves
//! live behind [`RateCounterStore`], so limits can be enforced by a
//! shared store across processes; an in-process token-bucket
//! implementation ships for single-node deployments and tests.
//!
//! Limit checks fail open: when the counter store is unreachable the
//! request is allowed and the failure logged.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use dashmap::DashMap;
use metrics::{counter, histogram};
use tokio::io::{AsyncRead, ReadBuf};
use tokio::task::JoinHandle;

use crate::client::MetaClient;
use crate::config::QosConfig;
use crate::metrics::{QOS_DENIED_TOTAL, QOS_REFRESH_FAILURES_TOTAL, QOS_THROTTLE_WAIT_SECONDS};
use crate::types::UserQos;

// ── Rate counter store ──────────────────────────────────────────────

/// Outcome of a rate check.
#[derive(Debug, Clone, Copy)]
pub struct RateDecision {
    /// Whether the requested tokens were granted.
    pub allowed: bool,
    /// Suggested wait before retrying a denied request.
    pub retry_after: Duration,
}

/// Shared rate-counter capability.
///
/// `key` identifies one counter (tenant and direction), `rate_per_sec`
/// is the sustained rate and also the window capacity, and `n` is the
/// number of tokens the caller wants.  A reservation larger than one
/// second of budget is served by a full window, so an oversized request
/// cannot block forever.
pub trait RateCounterStore: Send + Sync + 'static {
    fn allow_n(
        &self,
        key: &str,
        rate_per_sec: i64,
        n: u64,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<RateDecision>> + Send + '_>>;
}

/// In-process token buckets, one per key.
///
/// Each bucket holds at most one second of budget and starts full.
/// State is sharded per key, so concurrent checks on different tenants
/// do not serialize.
#[derive(Default)]
pub struct MemoryRateStore {
    buckets: DashMap<String, TokenBucket>,
}

struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl MemoryRateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn take(&self, key: &str, rate_per_sec: i64, n: u64) -> RateDecision {
        let rate = rate_per_sec.max(1) as f64;
        let now = Instant::now();
        let mut bucket = self
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| TokenBucket {
                tokens: rate,
                last_refill: now,
            });
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * rate).min(rate);
        bucket.last_refill = now;

        let need = (n as f64).min(rate);
        if bucket.tokens >= need {
            bucket.tokens -= need;
            RateDecision {
                allowed: true,
                retry_after: Duration::ZERO,
            }
        } else {
            let deficit = need - bucket.tokens;
            RateDecision {
                allowed: false,
                retry_after: Duration::from_secs_f64(deficit / rate),
            }
        }
    }
}

impl RateCounterStore for MemoryRateStore {
    fn allow_n(
        &self,
        key: &str,
        rate_per_sec: i64,
        n: u64,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<RateDecision>> + Send + '_>> {
        let decision = self.take(key, rate_per_sec, n);
        Box::pin(async move { Ok(decision) })
    }
}

// ── Snapshot ────────────────────────────────────────────────────────

/// One immutable refresh of the QoS mappings.
#[derive(Debug, Default)]
pub struct QosSnapshot {
    /// Bucket name to owning tenant.
    pub bucket_user: HashMap<String, String>,
    /// Tenant to configured limits.
    pub user_qos: HashMap<String, UserQos>,
}

// ── Limiter ─────────────────────────────────────────────────────────

/// Per-tenant QoS limiter.
pub struct QosMeta {
    client: Arc<dyn MetaClient>,
    store: Arc<dyn RateCounterStore>,
    snapshot: Arc<ArcSwap<QosSnapshot>>,
    config: QosConfig,
    refresher: JoinHandle<()>,
}

impl QosMeta {
    /// Build the limiter and spawn its snapshot refresh task on the
    /// current runtime.  The first refresh runs immediately; until it
    /// lands, checks see an empty snapshot and fall back to default
    /// limits.
    pub fn new(
        client: Arc<dyn MetaClient>,
        store: Arc<dyn RateCounterStore>,
        config: QosConfig,
    ) -> Self {
        let snapshot = Arc::new(ArcSwap::from_pointee(QosSnapshot::default()));
        let refresher = tokio::spawn(refresh_loop(
            Arc::clone(&client),
            Arc::clone(&snapshot),
            config.refresh_interval_secs,
        ));
        QosMeta {
            client,
            store,
            snapshot,
            config,
            refresher,
        }
    }

    /// Run one snapshot refresh now, outside the periodic schedule.
    pub async fn refresh(&self) {
        refresh_once(&self.client, &self.snapshot).await;
    }

    /// Whether a read request against `bucket` may proceed.
    pub async fn allow_read_query(&self, bucket: &str) -> bool {
        let (user, qos) = self.resolve(bucket);
        let rate = positive_or(qos.read_qps, self.config.default_read_qps);
        self.check(&format!("user_rqps_{user}"), rate, "read", bucket)
            .await
    }

    /// Whether a write request against `bucket` may proceed.
    pub async fn allow_write_query(&self, bucket: &str) -> bool {
        let (user, qos) = self.resolve(bucket);
        let rate = positive_or(qos.write_qps, self.config.default_write_qps);
        self.check(&format!("user_wqps_{user}"), rate, "write", bucket)
            .await
    }

    /// Wrap `reader` so its reads draw from the bucket owner's
    /// bandwidth budget.
    pub fn throttle_reader<R>(&self, bucket: &str, reader: R) -> ThrottleReader<R>
    where
        R: AsyncRead + Unpin,
    {
        let (user, qos) = self.resolve(bucket);
        let kbps = positive_or(qos.bandwidth_kbps, self.config.default_bandwidth_kbps);
        ThrottleReader {
            inner: reader,
            store: Arc::clone(&self.store),
            key: format!("user_bandwidth_{user}"),
            bytes_per_sec: kbps.saturating_mul(1024),
            state: ThrottleState::Idle,
        }
    }

    /// Resolve a bucket to its owning tenant and that tenant's limits.
    /// Unknown buckets share the anonymous tenant and default limits.
    fn resolve(&self, bucket: &str) -> (String, UserQos) {
        let snapshot = self.snapshot.load();
        let user = snapshot.bucket_user.get(bucket).cloned().unwrap_or_default();
        let qos = snapshot.user_qos.get(&user).copied().unwrap_or_default();
        (user, qos)
    }

    async fn check(&self, key: &str, rate: i64, direction: &'static str, bucket: &str) -> bool {
        match self.store.allow_n(key, rate, 1).await {
            Ok(decision) => {
                if !decision.allowed {
                    counter!(QOS_DENIED_TOTAL, "direction" => direction).increment(1);
                }
                decision.allowed
            }
            Err(err) => {
                tracing::error!(error = %err, bucket, direction, "rate store check failed, allowing request");
                true
            }
        }
    }
}

impl Drop for QosMeta {
    fn drop(&mut self) {
        self.refresher.abort();
    }
}

async fn refresh_loop(
    client: Arc<dyn MetaClient>,
    snapshot: Arc<ArcSwap<QosSnapshot>>,
    interval_secs: u64,
) {
    let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
    loop {
        ticker.tick().await;
        refresh_once(&client, &snapshot).await;
    }
}

/// Fetch both mappings and publish a full snapshot.  A failed fetch
/// keeps that map from the previous snapshot, so a flaky backend
/// degrades to stale limits rather than no limits.
async fn refresh_once(client: &Arc<dyn MetaClient>, snapshot: &ArcSwap<QosSnapshot>) {
    let previous = snapshot.load_full();
    let bucket_user = match client.get_all_user_buckets().await {
        Ok(map) => map,
        Err(err) => {
            counter!(QOS_REFRESH_FAILURES_TOTAL).increment(1);
            tracing::error!(error = %err, "bucket owner refresh failed, keeping previous map");
            previous.bucket_user.clone()
        }
    };
    let user_qos = match client.get_all_user_qos().await {
        Ok(map) => map,
        Err(err) => {
            counter!(QOS_REFRESH_FAILURES_TOTAL).increment(1);
            tracing::error!(error = %err, "tenant limit refresh failed, keeping previous map");
            previous.user_qos.clone()
        }
    };
    tracing::debug!(
        buckets = bucket_user.len(),
        tenants = user_qos.len(),
        "published QoS snapshot"
    );
    snapshot.store(Arc::new(QosSnapshot {
        bucket_user,
        user_qos,
    }));
}

fn positive_or(value: i64, fallback: i64) -> i64 {
    if value > 0 {
        value
    } else {
        fallback
    }
}

// ── Throttled reader ────────────────────────────────────────────────

/// An [`AsyncRead`] wrapper that acquires bandwidth budget before every
/// read.
///
/// Each read reserves up to `min(wanted, one second of budget)` bytes,
/// sleeping for the store's suggested retry interval until granted, and
/// only then polls the inner reader.  A short read does not refund the
/// reservation.  Dropping the reader drops any in-flight wait, so
/// request cancellation interrupts the loop.
pub struct ThrottleReader<R> {
    inner: R,
    store: Arc<dyn RateCounterStore>,
    key: String,
    bytes_per_sec: i64,
    state: ThrottleState,
}

enum ThrottleState {
    Idle,
    Acquiring(Pin<Box<dyn Future<Output = ()> + Send>>),
    Granted,
}

impl<R: AsyncRead + Unpin> AsyncRead for ThrottleReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            match &mut this.state {
                ThrottleState::Idle => {
                    let want = buf.remaining().min(this.bytes_per_sec.max(1) as usize) as u64;
                    if want == 0 {
                        return Pin::new(&mut this.inner).poll_read(cx, buf);
                    }
                    this.state = ThrottleState::Acquiring(Box::pin(acquire(
                        Arc::clone(&this.store),
                        this.key.clone(),
                        this.bytes_per_sec,
                        want,
                    )));
                }
                ThrottleState::Acquiring(fut) => {
                    ready!(fut.as_mut().poll(cx));
                    this.state = ThrottleState::Granted;
                }
                ThrottleState::Granted => {
                    let result = ready!(Pin::new(&mut this.inner).poll_read(cx, buf));
                    this.state = ThrottleState::Idle;
                    return Poll::Ready(result);
                }
            }
        }
    }
}

/// Sleep-and-retry until `n` tokens are granted.  Store failures grant
/// the read; only the bandwidth limit is lost, not the transfer.
async fn acquire(store: Arc<dyn RateCounterStore>, key: String, rate: i64, n: u64) {
    let started = Instant::now();
    let mut waited = false;
    loop {
        match store.allow_n(&key, rate, n).await {
            Ok(decision) if decision.allowed => break,
            Ok(decision) => {
                waited = true;
                let wait = if decision.retry_after.is_zero() {
                    Duration::from_millis(10)
                } else {
                    decision.retry_after
                };
                tokio::time::sleep(wait).await;
            }
            Err(err) => {
                tracing::error!(error = %err, "bandwidth store check failed, allowing read");
                break;
            }
        }
    }
    if waited {
        histogram!(QOS_THROTTLE_WAIT_SECONDS).record(started.elapsed().as_secs_f64());
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::io::AsyncReadExt;

    use crate::client::MemoryClient;
    use crate::types::{now_utc, Bucket, VersioningMode};

    fn make_bucket(name: &str, owner: &str) -> Bucket {
        Bucket {
            name: name.to_string(),
            owner_id: owner.to_string(),
            versioning: VersioningMode::Disabled,
            usage: 0,
            acl: String::new(),
            created_at: now_utc(),
        }
    }

    fn small_config() -> QosConfig {
        QosConfig {
            refresh_interval_secs: 600,
            default_read_qps: 2,
            default_write_qps: 2,
            default_bandwidth_kbps: 1,
        }
    }

    #[tokio::test]
    async fn test_store_denies_after_budget() {
        let store = MemoryRateStore::new();
        for _ in 0..5 {
            let decision = store.allow_n("user_rqps_alice", 5, 1).await.unwrap();
            assert!(decision.allowed);
        }
        let denied = store.allow_n("user_rqps_alice", 5, 1).await.unwrap();
        assert!(!denied.allowed);
        assert!(denied.retry_after > Duration::ZERO);
    }

    #[tokio::test]
    async fn test_store_keys_are_independent() {
        let store = MemoryRateStore::new();
        assert!(store.allow_n("user_rqps_alice", 1, 1).await.unwrap().allowed);
        assert!(!store.allow_n("user_rqps_alice", 1, 1).await.unwrap().allowed);
        assert!(store.allow_n("user_rqps_bob", 1, 1).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_oversized_reservation_served_by_full_window() {
        let store = MemoryRateStore::new();
        let decision = store.allow_n("user_bandwidth_alice", 8, 1_000).await.unwrap();
        assert!(decision.allowed);
        // The full window is spent now.
        assert!(!store.allow_n("user_bandwidth_alice", 8, 1).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_configured_limit_allows_then_denies() {
        let client = Arc::new(MemoryClient::new());
        client.put_bucket(&make_bucket("photos", "alice")).await.unwrap();
        client
            .put_user_qos(
                "alice",
                &UserQos {
                    read_qps: 5,
                    write_qps: 3,
                    bandwidth_kbps: 0,
                },
            )
            .await
            .unwrap();

        let qos = QosMeta::new(client, Arc::new(MemoryRateStore::new()), small_config());
        qos.refresh().await;

        for _ in 0..5 {
            assert!(qos.allow_read_query("photos").await);
        }
        assert!(!qos.allow_read_query("photos").await);

        // Writes draw from their own counter.
        for _ in 0..3 {
            assert!(qos.allow_write_query("photos").await);
        }
        assert!(!qos.allow_write_query("photos").await);
    }

    #[tokio::test]
    async fn test_unknown_bucket_uses_defaults() {
        let qos = QosMeta::new(
            Arc::new(MemoryClient::new()),
            Arc::new(MemoryRateStore::new()),
            small_config(),
        );
        assert!(qos.allow_read_query("mystery").await);
        assert!(qos.allow_read_query("mystery").await);
        assert!(!qos.allow_read_query("mystery").await);
    }

    #[tokio::test]
    async fn test_nonpositive_limit_falls_back_to_default() {
        let client = Arc::new(MemoryClient::new());
        client.put_bucket(&make_bucket("photos", "alice")).await.unwrap();
        client
            .put_user_qos(
                "alice",
                &UserQos {
                    read_qps: 0,
                    write_qps: -1,
                    bandwidth_kbps: 0,
                },
            )
            .await
            .unwrap();

        let qos = QosMeta::new(client, Arc::new(MemoryRateStore::new()), small_config());
        qos.refresh().await;

        // Default of 2 applies, not the configured 0.
        assert!(qos.allow_read_query("photos").await);
        assert!(qos.allow_read_query("photos").await);
        assert!(!qos.allow_read_query("photos").await);
    }

    struct FailStore;

    impl RateCounterStore for FailStore {
        fn allow_n(
            &self,
            _key: &str,
            _rate_per_sec: i64,
            _n: u64,
        ) -> Pin<Box<dyn Future<Output = anyhow::Result<RateDecision>> + Send + '_>> {
            Box::pin(async { anyhow::bail!("counter store offline") })
        }
    }

    #[tokio::test]
    async fn test_store_failure_fails_open() {
        let qos = QosMeta::new(
            Arc::new(MemoryClient::new()),
            Arc::new(FailStore),
            small_config(),
        );
        assert!(qos.allow_read_query("photos").await);
        assert!(qos.allow_write_query("photos").await);
    }

    #[tokio::test]
    async fn test_throttle_reader_passes_data_through() {
        let qos = QosMeta::new(
            Arc::new(MemoryClient::new()),
            Arc::new(MemoryRateStore::new()),
            QosConfig::default(),
        );
        let payload = b"hello throttled world".to_vec();
        let mut reader = qos.throttle_reader("photos", payload.as_slice());
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, payload);
    }

    /// Denies the first check, grants the second.
    struct DenyOnce {
        calls: AtomicUsize,
    }

    impl RateCounterStore for DenyOnce {
        fn allow_n(
            &self,
            _key: &str,
            _rate_per_sec: i64,
            _n: u64,
        ) -> Pin<Box<dyn Future<Output = anyhow::Result<RateDecision>> + Send + '_>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                Ok(RateDecision {
                    allowed: call > 0,
                    retry_after: Duration::from_millis(5),
                })
            })
        }
    }

    #[tokio::test]
    async fn test_throttle_reader_retries_until_granted() {
        let store = Arc::new(DenyOnce {
            calls: AtomicUsize::new(0),
        });
        let qos = QosMeta::new(
            Arc::new(MemoryClient::new()),
            Arc::clone(&store) as Arc<dyn RateCounterStore>,
            QosConfig::default(),
        );
        let mut reader = qos.throttle_reader("photos", &b"abc"[..]);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"abc");
        assert!(store.calls.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_refresh_replaces_stale_owner() {
        let client = Arc::new(MemoryClient::new());
        client.put_bucket(&make_bucket("photos", "alice")).await.unwrap();

        let qos = QosMeta::new(
            Arc::clone(&client) as Arc<dyn MetaClient>,
            Arc::new(MemoryRateStore::new()),
            small_config(),
        );
        qos.refresh().await;
        let (user, _) = qos.resolve("photos");
        assert_eq!(user, "alice");

        client.put_bucket(&make_bucket("photos", "bob")).await.unwrap();
        qos.refresh().await;
        let (user, _) = qos.resolve("photos");
        assert_eq!(user, "bob");
    }
}
