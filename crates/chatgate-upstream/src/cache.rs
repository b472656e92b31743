use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::client::{UpstreamClient, UpstreamConfig, UpstreamCredentials};
use crate::error::UpstreamError;

type CacheKey = (i64, String);

struct CachedClient {
    created_at: Instant,
    client: Arc<UpstreamClient>,
}

/// Time-bounded pool of upstream clients keyed by `(provider_id, csesidx)`.
///
/// A cache hit reuses the bearer token held inside the client; a miss (or
/// an expired entry) builds a fresh client. A racing insert may waste one
/// construction, which is tolerable.
pub struct ClientCache {
    http: wreq::Client,
    config: Arc<UpstreamConfig>,
    inner: RwLock<HashMap<CacheKey, CachedClient>>,
}

impl ClientCache {
    pub fn new(config: UpstreamConfig) -> Result<Self, UpstreamError> {
        let http = wreq::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(5))
            .build()
            .map_err(|err| UpstreamError::Transport(format!("http client build: {err}")))?;
        Ok(Self {
            http,
            config: Arc::new(config),
            inner: RwLock::new(HashMap::new()),
        })
    }

    pub async fn client_for(&self, credentials: UpstreamCredentials) -> Arc<UpstreamClient> {
        let key = (credentials.provider_id, credentials.csesidx.clone());
        {
            let guard = self.inner.read().await;
            if let Some(entry) = guard.get(&key)
                && entry.created_at.elapsed() < self.config.client_ttl
            {
                return entry.client.clone();
            }
        }

        let client = Arc::new(UpstreamClient::new(
            self.http.clone(),
            self.config.clone(),
            credentials,
        ));
        let mut guard = self.inner.write().await;
        guard.insert(
            key,
            CachedClient {
                created_at: Instant::now(),
                client: client.clone(),
            },
        );
        // Expired entries for other providers go opportunistically.
        guard.retain(|_, entry| entry.created_at.elapsed() < self.config.client_ttl);
        client
    }

    #[cfg(test)]
    async fn len(&self) -> usize {
        self.inner.read().await.len()
    }
}
