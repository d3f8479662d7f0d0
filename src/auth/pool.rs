// Runtime token pool.
//
// Caches one refreshed token + probe outcome per stored credential, keyed by
// the credential's refresh token (stable across CRUD index churn). Selection
// returns an active credential with remaining quota, preferring the least
// recently probed. Refresh and probe of a single credential are coalesced:
// concurrent acquirers racing on the same credential share one in-flight
// refresh and all observe its result.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::refresher::TokenRefresher;
use super::store::CredentialStore;
use super::types::{AccountStatus, AuthType, CredentialConfig, TokenInfo};
use super::usage::UsageChecker;

/// How long a probe result stays authoritative before the next acquire
/// re-probes the credential.
pub const TOKEN_CACHE_TTL: Duration = Duration::from_secs(300);

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("no usable credential: all accounts are exhausted, banned, expired or failing")]
    NoUsableCredential,
}

#[derive(Debug, Default)]
struct PoolEntry {
    token: Option<TokenInfo>,
    status: Option<AccountStatus>,
    available: f64,
    total_limit: f64,
    total_used: f64,
    email: Option<String>,
    ban_reason: Option<String>,
    last_error: Option<String>,
    last_probe: Option<Instant>,
    last_probe_at: Option<DateTime<Utc>>,
    refresh_attempts: u64,
}

impl PoolEntry {
    fn is_fresh(&self) -> bool {
        let probe_ok = self.last_error.is_none()
            && self.status.is_some_and(|s| s != AccountStatus::Error)
            && self
                .last_probe
                .is_some_and(|probed| probed.elapsed() < TOKEN_CACHE_TTL);
        // An active entry is only as fresh as the token it would hand out.
        let token_ok = self.status != Some(AccountStatus::Active)
            || self.token.as_ref().is_some_and(|t| !t.is_expiring_soon());
        probe_ok && token_ok
    }
}

/// Opaque reference to the credential behind a leased token.
#[derive(Debug, Clone)]
pub struct CredentialHandle {
    key: String,
}

/// A token handed out by `acquire`, with enough context to report
/// mid-request state changes back to the pool.
#[derive(Debug, Clone)]
pub struct LeasedToken {
    pub token: TokenInfo,
    pub email: Option<String>,
    pub handle: CredentialHandle,
}

/// Point-in-time view of one stored credential for the admin API.
#[derive(Debug, Clone)]
pub struct CredentialView {
    pub index: usize,
    pub auth_type: AuthType,
    pub client_id: Option<String>,
    pub refresh_token: String,
    pub status: AccountStatus,
    pub email: Option<String>,
    pub access_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub available: f64,
    pub total_limit: f64,
    pub total_used: f64,
    pub ban_reason: Option<String>,
    pub error: Option<String>,
    pub last_probe_at: Option<DateTime<Utc>>,
}

pub struct TokenPool {
    store: Arc<CredentialStore>,
    refresher: TokenRefresher,
    checker: UsageChecker,
    entries: Mutex<HashMap<String, PoolEntry>>,
    refresh_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl TokenPool {
    pub fn new(store: Arc<CredentialStore>, client: reqwest::Client) -> Self {
        Self::with_components(
            store,
            TokenRefresher::new(client.clone()),
            UsageChecker::new(client),
        )
    }

    pub fn with_components(
        store: Arc<CredentialStore>,
        refresher: TokenRefresher,
        checker: UsageChecker,
    ) -> Self {
        Self {
            store,
            refresher,
            checker,
            entries: Mutex::new(HashMap::new()),
            refresh_locks: DashMap::new(),
        }
    }

    /// Select a usable credential and hand out its token.
    ///
    /// Walks the store in order, refreshing and probing stale entries, then
    /// picks the least recently probed credential whose derived status is
    /// active with remaining quota.
    pub async fn acquire(&self) -> Result<LeasedToken, PoolError> {
        let creds = self.store.runtime_credentials();
        if creds.is_empty() {
            return Err(PoolError::NoUsableCredential);
        }

        for cred in &creds {
            self.ensure_fresh(cred).await;
        }

        let entries = self.entries.lock().await;
        let mut best: Option<(&PoolEntry, &CredentialConfig)> = None;
        for cred in &creds {
            let Some(entry) = entries.get(&cred.refresh_token) else {
                continue;
            };
            if entry.status != Some(AccountStatus::Active)
                || entry.available <= 0.0
                || entry.token.is_none()
            {
                continue;
            }
            let better = match best {
                None => true,
                Some((current, _)) => entry.last_probe < current.last_probe,
            };
            if better {
                best = Some((entry, cred));
            }
        }

        let Some((entry, cred)) = best else {
            return Err(PoolError::NoUsableCredential);
        };
        debug!(
            email = entry.email.as_deref().unwrap_or("unknown"),
            available = entry.available,
            "credential acquired"
        );
        Ok(LeasedToken {
            token: entry.token.clone().expect("active entry has token"),
            email: entry.email.clone(),
            handle: CredentialHandle {
                key: cred.refresh_token.clone(),
            },
        })
    }

    /// Refresh + probe the credential unless its cached entry is still
    /// authoritative. At most one refresh is in flight per credential;
    /// waiters that arrive during a peer's refresh adopt the peer's result,
    /// successful or not.
    async fn ensure_fresh(&self, cred: &CredentialConfig) {
        let key = cred.refresh_token.as_str();
        {
            let entries = self.entries.lock().await;
            if entries.get(key).is_some_and(PoolEntry::is_fresh) {
                return;
            }
        }

        let wait_started = Instant::now();
        let gate = self
            .refresh_locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = gate.lock().await;

        // A peer that held the gate may have finished the work already.
        let reusable_token = {
            let entries = self.entries.lock().await;
            if let Some(entry) = entries.get(key) {
                if entry.last_probe.is_some_and(|p| p >= wait_started) || entry.is_fresh() {
                    return;
                }
                entry.token.clone().filter(|t| !t.is_expiring_soon())
            } else {
                None
            }
        };

        let token = match reusable_token {
            Some(token) => token,
            None => {
                {
                    let mut entries = self.entries.lock().await;
                    entries.entry(key.to_string()).or_default().refresh_attempts += 1;
                }
                match self.refresher.refresh(cred).await {
                    Ok(token) => {
                        if token.refresh_token != cred.refresh_token {
                            if let Err(e) = self
                                .store
                                .rotate_refresh_token(&cred.refresh_token, &token.refresh_token)
                            {
                                warn!("failed to persist rotated refresh token: {}", e);
                            }
                        }
                        token
                    }
                    Err(e) => {
                        warn!(auth_type = %cred.auth_type, "token refresh failed: {}", e);
                        let mut entries = self.entries.lock().await;
                        let entry = entries.entry(key.to_string()).or_default();
                        entry.status = Some(AccountStatus::Error);
                        entry.last_error = Some(e.to_string());
                        entry.last_probe = Some(Instant::now());
                        entry.last_probe_at = Some(Utc::now());
                        return;
                    }
                }
            }
        };

        let result = self.checker.check(&token.access_token).await;

        let mut entries = self.entries.lock().await;
        let entry = entries.entry(key.to_string()).or_default();
        entry.token = Some(token);
        entry.status = Some(result.status);
        entry.available = result.available;
        entry.total_limit = result.total_limit;
        entry.total_used = result.total_used;
        entry.ban_reason = result.ban_reason;
        entry.last_error = result.error;
        entry.last_probe = Some(Instant::now());
        entry.last_probe_at = Some(Utc::now());
        if let Some(email) = result
            .usage_limits
            .as_ref()
            .map(|l| l.user_info.email.clone())
            .filter(|e| !e.is_empty())
        {
            entry.email = Some(email);
        }
    }

    /// Record a structured upstream rejection discovered mid-request.
    pub async fn mark_banned(&self, handle: &CredentialHandle, reason: &str) {
        let mut entries = self.entries.lock().await;
        let entry = entries.entry(handle.key.clone()).or_default();
        entry.status = Some(AccountStatus::Banned);
        entry.ban_reason = Some(reason.to_string());
        entry.available = 0.0;
        entry.last_probe = Some(Instant::now());
        entry.last_probe_at = Some(Utc::now());
    }

    /// Record quota exhaustion discovered mid-request.
    pub async fn mark_exhausted(&self, handle: &CredentialHandle) {
        let mut entries = self.entries.lock().await;
        let entry = entries.entry(handle.key.clone()).or_default();
        entry.status = Some(AccountStatus::Exhausted);
        entry.available = 0.0;
        entry.last_probe = Some(Instant::now());
        entry.last_probe_at = Some(Utc::now());
    }

    /// Record a transport or protocol failure discovered mid-request.
    /// The entry becomes stale immediately, so the next acquire re-probes.
    pub async fn mark_error(&self, handle: &CredentialHandle, error: &str) {
        let mut entries = self.entries.lock().await;
        let entry = entries.entry(handle.key.clone()).or_default();
        entry.status = Some(AccountStatus::Error);
        entry.last_error = Some(error.to_string());
        entry.last_probe = Some(Instant::now());
        entry.last_probe_at = Some(Utc::now());
    }

    /// Per-credential views for the admin API, covering every stored record
    /// including disabled and incomplete ones.
    pub async fn inspect(&self) -> Vec<CredentialView> {
        let stored = self.store.list();
        let mut views = Vec::with_capacity(stored.len());

        for (index, cred) in stored.iter().enumerate() {
            let mut view = CredentialView {
                index,
                auth_type: cred.auth_type,
                client_id: cred.client_id.clone(),
                refresh_token: cred.refresh_token.clone(),
                status: AccountStatus::Error,
                email: None,
                access_token: None,
                expires_at: None,
                available: 0.0,
                total_limit: 0.0,
                total_used: 0.0,
                ban_reason: None,
                error: None,
                last_probe_at: None,
            };

            if cred.disabled {
                view.status = AccountStatus::Disabled;
                views.push(view);
                continue;
            }
            if !cred.is_runtime_usable() {
                view.error = Some("incomplete credential".to_string());
                views.push(view);
                continue;
            }

            self.ensure_fresh(cred).await;
            let entries = self.entries.lock().await;
            if let Some(entry) = entries.get(&cred.refresh_token) {
                view.status = entry.status.unwrap_or(AccountStatus::Error);
                view.email = entry.email.clone();
                view.access_token = entry.token.as_ref().map(|t| t.access_token.clone());
                view.expires_at = entry.token.as_ref().map(|t| t.expires_at);
                view.available = entry.available;
                view.total_limit = entry.total_limit;
                view.total_used = entry.total_used;
                view.ban_reason = entry.ban_reason.clone();
                view.error = entry.last_error.clone();
                view.last_probe_at = entry.last_probe_at;
                if entry.token.as_ref().is_some_and(|t| t.is_expired()) {
                    view.status = AccountStatus::Expired;
                }
            }
            views.push(view);
        }

        views
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn social(rt: &str) -> CredentialConfig {
        CredentialConfig {
            auth_type: AuthType::Social,
            refresh_token: rt.into(),
            client_id: None,
            client_secret: None,
            disabled: false,
        }
    }

    fn store_with(configs: &[CredentialConfig]) -> (Arc<CredentialStore>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("auth_config.json");
        std::fs::write(&path, serde_json::to_vec_pretty(configs).unwrap()).unwrap();
        (Arc::new(CredentialStore::load(&path)), dir)
    }

    fn fresh_entry(status: AccountStatus, available: f64, probed_ago: Duration) -> PoolEntry {
        PoolEntry {
            token: Some(TokenInfo {
                access_token: format!("at_{}", available),
                refresh_token: "rt".into(),
                expires_at: Utc::now() + ChronoDuration::hours(1),
            }),
            status: Some(status),
            available,
            total_limit: 100.0,
            total_used: 100.0 - available,
            email: Some("user@example.com".into()),
            ban_reason: None,
            last_error: None,
            last_probe: Some(Instant::now() - probed_ago),
            last_probe_at: Some(Utc::now()),
            refresh_attempts: 0,
        }
    }

    async fn seed(pool: &TokenPool, key: &str, entry: PoolEntry) {
        pool.entries.lock().await.insert(key.to_string(), entry);
    }

    #[tokio::test]
    async fn test_acquire_empty_store() {
        let (store, _dir) = store_with(&[]);
        let pool = TokenPool::new(store, reqwest::Client::new());
        assert!(matches!(
            pool.acquire().await,
            Err(PoolError::NoUsableCredential)
        ));
    }

    #[tokio::test]
    async fn test_acquire_skips_non_active_entries() {
        let (store, _dir) = store_with(&[social("rt_a"), social("rt_b")]);
        let pool = TokenPool::new(store, reqwest::Client::new());
        seed(&pool, "rt_a", fresh_entry(AccountStatus::Exhausted, 0.0, Duration::ZERO)).await;
        seed(&pool, "rt_b", fresh_entry(AccountStatus::Active, 12.0, Duration::ZERO)).await;

        let lease = pool.acquire().await.unwrap();
        assert_eq!(lease.handle.key, "rt_b");
        assert_eq!(lease.token.access_token, "at_12");
    }

    #[tokio::test]
    async fn test_acquire_prefers_least_recently_probed() {
        let (store, _dir) = store_with(&[social("rt_a"), social("rt_b")]);
        let pool = TokenPool::new(store, reqwest::Client::new());
        seed(&pool, "rt_a", fresh_entry(AccountStatus::Active, 5.0, Duration::from_secs(1))).await;
        seed(&pool, "rt_b", fresh_entry(AccountStatus::Active, 5.0, Duration::from_secs(90))).await;

        let lease = pool.acquire().await.unwrap();
        assert_eq!(lease.handle.key, "rt_b");
    }

    #[tokio::test]
    async fn test_acquire_all_banned_or_exhausted() {
        let (store, _dir) = store_with(&[social("rt_a"), social("rt_b")]);
        let pool = TokenPool::new(store, reqwest::Client::new());
        seed(&pool, "rt_a", fresh_entry(AccountStatus::Banned, 0.0, Duration::ZERO)).await;
        seed(&pool, "rt_b", fresh_entry(AccountStatus::Exhausted, 0.0, Duration::ZERO)).await;

        assert!(matches!(
            pool.acquire().await,
            Err(PoolError::NoUsableCredential)
        ));
    }

    #[tokio::test]
    async fn test_mark_banned_removes_from_rotation() {
        let (store, _dir) = store_with(&[social("rt_a"), social("rt_b")]);
        let pool = TokenPool::new(store, reqwest::Client::new());
        seed(&pool, "rt_a", fresh_entry(AccountStatus::Active, 5.0, Duration::from_secs(60))).await;
        seed(&pool, "rt_b", fresh_entry(AccountStatus::Active, 5.0, Duration::from_secs(10))).await;

        let lease = pool.acquire().await.unwrap();
        assert_eq!(lease.handle.key, "rt_a");
        pool.mark_banned(&lease.handle, "ACCOUNT_SUSPENDED").await;

        let lease2 = pool.acquire().await.unwrap();
        assert_eq!(lease2.handle.key, "rt_b");

        pool.mark_exhausted(&lease2.handle).await;
        assert!(matches!(
            pool.acquire().await,
            Err(PoolError::NoUsableCredential)
        ));
    }

    #[tokio::test]
    async fn test_mark_error_makes_entry_stale() {
        let (store, _dir) = store_with(&[social("rt_a")]);
        let pool = TokenPool::new(store, reqwest::Client::new());
        seed(&pool, "rt_a", fresh_entry(AccountStatus::Active, 5.0, Duration::ZERO)).await;

        let lease = pool.acquire().await.unwrap();
        pool.mark_error(&lease.handle, "connection reset mid-stream").await;

        let entries = pool.entries.lock().await;
        assert!(!entries.get("rt_a").unwrap().is_fresh());
    }

    /// N tasks racing on the same stale credential must trigger exactly one
    /// refresh attempt; the rest adopt the in-flight result.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_refresh_coalescing_under_contention() {
        // Endpoint that accepts connections and never answers, so the one
        // real refresh attempt is pinned in flight while the others race.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let held = Arc::new(Mutex::new(Vec::new()));
        let held_accept = held.clone();
        tokio::spawn(async move {
            loop {
                if let Ok((sock, _)) = listener.accept().await {
                    held_accept.lock().await.push(sock);
                }
            }
        });

        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(400))
            .build()
            .unwrap();
        let refresher = TokenRefresher::with_endpoints(
            client.clone(),
            format!("http://{}/refreshToken", addr),
            format!("http://{}/token", addr),
        );
        let checker = UsageChecker::with_url(client, format!("http://{}/usage", addr));

        let (store, _dir) = store_with(&[social("rt_contended")]);
        let pool = Arc::new(TokenPool::with_components(store, refresher, checker));

        let barrier = Arc::new(tokio::sync::Barrier::new(8));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let pool = pool.clone();
            let barrier = barrier.clone();
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                pool.acquire().await
            }));
        }

        let failures = AtomicUsize::new(0);
        for handle in handles {
            if handle.await.unwrap().is_err() {
                failures.fetch_add(1, Ordering::SeqCst);
            }
        }
        assert_eq!(failures.load(Ordering::SeqCst), 8);

        let entries = pool.entries.lock().await;
        assert_eq!(entries.get("rt_contended").unwrap().refresh_attempts, 1);
    }

    #[tokio::test]
    async fn test_inspect_covers_disabled_and_incomplete() {
        let mut disabled = social("rt_disabled");
        disabled.disabled = true;
        let incomplete = CredentialConfig {
            auth_type: AuthType::IdC,
            refresh_token: "rt_idc".into(),
            client_id: None,
            client_secret: None,
            disabled: false,
        };
        let (store, _dir) = store_with(&[disabled, incomplete, social("rt_live")]);
        let pool = TokenPool::new(store, reqwest::Client::new());
        seed(&pool, "rt_live", fresh_entry(AccountStatus::Active, 3.0, Duration::ZERO)).await;

        let views = pool.inspect().await;
        assert_eq!(views.len(), 3);
        assert_eq!(views[0].status, AccountStatus::Disabled);
        assert_eq!(views[1].status, AccountStatus::Error);
        assert_eq!(views[1].error.as_deref(), Some("incomplete credential"));
        assert_eq!(views[2].status, AccountStatus::Active);
        assert_eq!(views[2].email.as_deref(), Some("user@example.com"));
    }

    #[tokio::test]
    async fn test_inspect_reports_expired_token() {
        let (store, _dir) = store_with(&[social("rt_a")]);
        let pool = TokenPool::new(store, reqwest::Client::new());
        let mut entry = fresh_entry(AccountStatus::Exhausted, 0.0, Duration::ZERO);
        entry.token.as_mut().unwrap().expires_at = Utc::now() - ChronoDuration::minutes(5);
        seed(&pool, "rt_a", entry).await;

        let views = pool.inspect().await;
        assert_eq!(views[0].status, AccountStatus::Expired);
    }
}
