//! Process-wide cache for the `x-vqd-hash-1` token.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;

use crate::challenge::ChallengeSolver;
use crate::error::Result;

/// How long a solved token is reused.
pub const TOKEN_TTL: Duration = Duration::from_secs(3 * 60);

/// Where fresh challenges come from.
#[async_trait]
pub trait ChallengeSource: Send + Sync {
    async fn fetch_challenge(&self) -> Result<String>;
}

#[derive(Debug, Clone)]
pub struct CachedToken {
    pub token: String,
    pub expire_at: Instant,
}

impl CachedToken {
    fn is_fresh(&self) -> bool {
        Instant::now() < self.expire_at
    }
}

/// Holds the current token. Readers share a read lock; a refresh is
/// serialised by a separate mutex so at most one runs at a time.
pub struct TokenCache {
    current: RwLock<Option<CachedToken>>,
    refresh: Mutex<()>,
    solver: ChallengeSolver,
    ttl: Duration,
}

impl TokenCache {
    pub fn new(solver: ChallengeSolver) -> Self {
        Self::with_ttl(solver, TOKEN_TTL)
    }

    pub fn with_ttl(solver: ChallengeSolver, ttl: Duration) -> Self {
        Self {
            current: RwLock::new(None),
            refresh: Mutex::new(()),
            solver,
            ttl,
        }
    }

    pub fn solver(&self) -> &ChallengeSolver {
        &self.solver
    }

    async fn fresh(&self) -> Option<CachedToken> {
        self.current.read().await.as_ref().filter(|cached| cached.is_fresh()).cloned()
    }

    /// Return a valid token, fetching and solving a new challenge when the
    /// cached one is missing or expired. A failed refresh leaves the
    /// previous state in place.
    pub async fn get(&self, source: &dyn ChallengeSource) -> Result<CachedToken> {
        if let Some(cached) = self.fresh().await {
            return Ok(cached);
        }

        let _refreshing = self.refresh.lock().await;
        // another caller may have refreshed while we waited
        if let Some(cached) = self.fresh().await {
            return Ok(cached);
        }

        tracing::debug!("Refreshing x-vqd-hash-1 token");
        let challenge = source.fetch_challenge().await?;
        let token = self.solver.solve(&challenge).await?;

        let cached = CachedToken {
            token,
            expire_at: Instant::now() + self.ttl,
        };
        *self.current.write().await = Some(cached.clone());
        tracing::info!("Obtained new x-vqd-hash-1 token, valid for {}s", self.ttl.as_secs());

        Ok(cached)
    }

    /// Mark `rejected` as unusable so the next `get` refreshes it. A token
    /// that has already replaced it stays valid.
    pub async fn invalidate(&self, rejected: &str) {
        let mut current = self.current.write().await;
        if let Some(cached) = current.as_mut().filter(|cached| cached.token == rejected) {
            cached.expire_at = Instant::now();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProxyError;
    use crate::js_runtime::JsOracle;
    use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
    use serde_json::{Value, json};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingOracle {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl JsOracle for CountingOracle {
        async fn evaluate(&self, _js: &str) -> Result<Value> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(json!({ "client_hashes": [format!("ua{}", n), "html"], "meta": {} }))
        }
    }

    struct CountingSource {
        calls: AtomicUsize,
        fail: bool,
    }

    impl CountingSource {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail: false,
            }
        }
    }

    #[async_trait]
    impl ChallengeSource for CountingSource {
        async fn fetch_challenge(&self) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            if self.fail {
                return Err(ProxyError::NoChallenge);
            }
            Ok(BASE64.encode("(()=>({}))()"))
        }
    }

    fn cache(ttl: Duration) -> TokenCache {
        let oracle = Arc::new(CountingOracle {
            calls: AtomicUsize::new(0),
        });
        TokenCache::with_ttl(ChallengeSolver::new(oracle), ttl)
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_refresh() {
        let cache = cache(TOKEN_TTL);
        let source = CountingSource::new();

        let results = futures::future::join_all((0..10).map(|_| cache.get(&source))).await;

        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        let tokens: Vec<String> = results.into_iter().map(|r| r.unwrap().token).collect();
        assert!(tokens.iter().all(|t| t == &tokens[0]));
    }

    #[tokio::test]
    async fn concurrent_callers_across_tasks() {
        let cache = Arc::new(cache(TOKEN_TTL));
        let source = Arc::new(CountingSource::new());

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let source = Arc::clone(&source);
                tokio::spawn(async move { cache.get(source.as_ref()).await.map(|t| t.token) })
            })
            .collect();

        let mut tokens = Vec::new();
        for handle in handles {
            tokens.push(handle.await.unwrap().unwrap());
        }
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        tokens.dedup();
        assert_eq!(tokens.len(), 1);
    }

    #[tokio::test]
    async fn valid_token_is_reused_without_io() {
        let cache = cache(TOKEN_TTL);
        let source = CountingSource::new();

        let first = cache.get(&source).await.unwrap();
        let second = cache.get(&source).await.unwrap();
        assert_eq!(first.token, second.token);
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        assert!(second.expire_at > Instant::now());
    }

    #[tokio::test]
    async fn expired_token_is_refreshed() {
        let cache = cache(Duration::from_millis(50));
        let source = CountingSource::new();

        let first = cache.get(&source).await.unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        let second = cache.get(&source).await.unwrap();

        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
        assert_ne!(first.token, second.token);
        assert!(second.expire_at > Instant::now());
    }

    #[tokio::test]
    async fn failed_refresh_keeps_previous_state() {
        let cache = cache(TOKEN_TTL);
        let failing = CountingSource {
            calls: AtomicUsize::new(0),
            fail: true,
        };
        assert!(matches!(cache.get(&failing).await, Err(ProxyError::NoChallenge)));
        assert!(cache.current.read().await.is_none());

        let source = CountingSource::new();
        let token = cache.get(&source).await.unwrap();
        cache.invalidate(&token.token).await;
        assert!(matches!(cache.get(&failing).await, Err(ProxyError::NoChallenge)));
        assert_eq!(cache.current.read().await.as_ref().unwrap().token, token.token);
    }

    #[tokio::test]
    async fn invalidate_forces_refresh() {
        let cache = cache(TOKEN_TTL);
        let source = CountingSource::new();

        let rejected = cache.get(&source).await.unwrap();
        cache.invalidate(&rejected.token).await;
        cache.get(&source).await.unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn late_rejection_of_replaced_token_is_ignored() {
        let cache = cache(TOKEN_TTL);
        let source = CountingSource::new();

        let old = cache.get(&source).await.unwrap();
        cache.invalidate(&old.token).await;
        let fresh = cache.get(&source).await.unwrap();
        assert_ne!(old.token, fresh.token);

        // a second request still holding the old token gets rejected now
        cache.invalidate(&old.token).await;
        let reused = cache.get(&source).await.unwrap();
        assert_eq!(reused.token, fresh.token);
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }
}
