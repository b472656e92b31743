use std::time::Duration;

use async_trait::async_trait;
use time::OffsetDateTime;

use crate::crypto::CryptoError;

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("db error: {0}")]
    Db(#[from] sea_orm::DbErr),
    #[error("credential cipher error: {0}")]
    Crypto(#[from] CryptoError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderStatus {
    Active,
    Cooling,
    Failed,
    Inactive,
}

impl ProviderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderStatus::Active => "active",
            ProviderStatus::Cooling => "cooling",
            ProviderStatus::Failed => "failed",
            ProviderStatus::Inactive => "inactive",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(ProviderStatus::Active),
            "cooling" => Some(ProviderStatus::Cooling),
            "failed" => Some(ProviderStatus::Failed),
            "inactive" => Some(ProviderStatus::Inactive),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Active,
    Expired,
    Migrated,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Expired => "expired",
            SessionStatus::Migrated => "migrated",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(SessionStatus::Active),
            "expired" => Some(SessionStatus::Expired),
            "migrated" => Some(SessionStatus::Migrated),
            _ => None,
        }
    }
}

/// A provider row with the credential bag already decrypted.
#[derive(Debug, Clone)]
pub struct ProviderRecord {
    pub id: i64,
    pub name: String,
    pub group_id: Option<String>,
    pub csesidx: String,
    pub cookies: String,
    pub max_concurrent: i32,
    pub status: ProviderStatus,
    pub health_score: i32,
    pub current_load: i32,
    pub consecutive_failures: i32,
    pub total_requests: i64,
    pub failed_requests: i64,
    pub last_success_at: Option<OffsetDateTime>,
    pub last_failure_at: Option<OffsetDateTime>,
    pub cooldown_until: Option<OffsetDateTime>,
}

#[derive(Debug, Clone)]
pub struct NewProvider {
    pub name: String,
    pub group_id: Option<String>,
    pub csesidx: String,
    /// Plaintext cookie bag; encrypted before it reaches the row.
    pub cookies: String,
    pub max_concurrent: i32,
}

#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub id: i64,
    pub user_id: i64,
    pub provider_id: i64,
    pub head_hash: String,
    pub tail_hash: String,
    pub upstream_session_id: Option<String>,
    pub message_count: i64,
    pub status: SessionStatus,
    pub expires_at: OffsetDateTime,
    pub last_accessed_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct NewSession {
    pub user_id: i64,
    pub provider_id: i64,
    pub head_hash: String,
    pub tail_hash: String,
    pub ttl: Duration,
}

#[derive(Debug, Clone)]
pub struct ApiKeyRecord {
    pub id: i64,
    pub user_id: i64,
    pub enabled: bool,
    pub daily_limit: i64,
    pub daily_usage: i64,
}

#[derive(Debug, Clone)]
pub struct NewRequestLog {
    pub trace_id: Option<String>,
    pub user_id: i64,
    pub api_key_id: i64,
    pub provider_id: Option<i64>,
    pub session_id: Option<i64>,
    pub model: String,
    pub kind: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub latency_ms: i64,
    pub status_code: i32,
    pub error: Option<String>,
}

/// Repository surface over the persistent store.
///
/// The store is the source of truth for providers and sessions; the two
/// contended mutations (load counters, failure transitions) are expressed
/// as single conditional statements so concurrent writers stay monotone.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Entity-first schema sync plus performance indexes. Run at boot.
    async fn sync(&self) -> StorageResult<()>;

    // Providers
    async fn insert_provider(&self, provider: NewProvider) -> StorageResult<i64>;
    async fn provider_by_id(&self, id: i64) -> StorageResult<Option<ProviderRecord>>;
    /// Selection candidates: active, healthy enough, not fully loaded,
    /// matching the optional group, minus the exclude set. Ordered by
    /// health desc then load ratio asc, at most 20 rows.
    async fn provider_candidates(
        &self,
        min_health: i32,
        group: Option<&str>,
        exclude: &[i64],
    ) -> StorageResult<Vec<ProviderRecord>>;
    /// Guarded load increment; false when the slot was gone by the time
    /// the statement ran.
    async fn try_acquire_provider(&self, id: i64) -> StorageResult<bool>;
    /// Load decrement, saturating at zero.
    async fn release_provider(&self, id: i64) -> StorageResult<()>;
    async fn record_provider_success(&self, id: i64) -> StorageResult<()>;
    async fn record_provider_failure(
        &self,
        id: i64,
        failure_threshold: i32,
        cooldown: Duration,
    ) -> StorageResult<()>;
    /// cooling -> active for rows whose cooldown elapsed. Returns the
    /// number of recovered providers.
    async fn recover_cooled_providers(&self) -> StorageResult<u64>;

    // Sessions
    async fn find_exact_session(
        &self,
        user_id: i64,
        head_hash: &str,
        tail_hash: &str,
    ) -> StorageResult<Option<SessionRecord>>;
    async fn find_head_session(
        &self,
        user_id: i64,
        head_hash: &str,
    ) -> StorageResult<Option<SessionRecord>>;
    async fn update_session_tail(&self, id: i64, tail_hash: &str) -> StorageResult<()>;
    async fn insert_session(&self, session: NewSession) -> StorageResult<SessionRecord>;
    async fn count_active_sessions(&self, user_id: i64) -> StorageResult<u64>;
    async fn delete_oldest_session(&self, user_id: i64) -> StorageResult<()>;
    async fn set_upstream_session(&self, id: i64, upstream_session_id: &str) -> StorageResult<()>;
    /// Successful exchange: bump message_count, refresh last_accessed_at,
    /// push expires_at out by the ttl.
    async fn touch_session(&self, id: i64, ttl: Duration) -> StorageResult<()>;
    async fn mark_session_migrated(&self, id: i64) -> StorageResult<()>;
    /// Delete expired and terminal sessions. Returns rows removed.
    async fn sweep_sessions(&self) -> StorageResult<u64>;

    // Request logs
    async fn append_request_log(&self, log: NewRequestLog) -> StorageResult<()>;
    async fn prune_request_logs(&self, older_than: OffsetDateTime) -> StorageResult<u64>;

    // Users / API keys
    async fn user_count(&self) -> StorageResult<u64>;
    async fn insert_user(&self, name: Option<&str>) -> StorageResult<i64>;
    async fn insert_api_key(
        &self,
        user_id: i64,
        key_value: &str,
        label: Option<&str>,
        daily_limit: i64,
    ) -> StorageResult<i64>;
    async fn api_key_by_value(&self, key_value: &str) -> StorageResult<Option<ApiKeyRecord>>;
    async fn record_key_usage(&self, key_id: i64) -> StorageResult<()>;
    /// Daily counter reset across all keys. Returns rows touched.
    async fn reset_daily_usage(&self) -> StorageResult<u64>;
}
