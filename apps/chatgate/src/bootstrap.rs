use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use rand::Rng;
use rand::distr::Alphanumeric;

use chatgate_common::{CryptoMode, GatewayConfig, GatewayConfigPatch};
use chatgate_core::{ApiKeyAuth, Maintenance, ModelTable, RequestExecutor, SessionMatcher};
use chatgate_router::GatewayContext;
use chatgate_scheduler::{ProviderScheduler, SchedulerConfig};
use chatgate_storage::{CredentialCipher, SeaOrmStorage, Storage};
use chatgate_upstream::{ClientCache, UpstreamConfig};

#[derive(Debug, Clone, Parser)]
#[command(
    name = "chatgate",
    version,
    about = "Multi-tenant gateway for a session-oriented chat upstream"
)]
pub struct CliArgs {
    /// Database DSN.
    #[arg(
        long,
        env = "CHATGATE_DSN",
        default_value = "sqlite://chatgate.db?mode=rwc"
    )]
    pub dsn: String,

    /// Bind host.
    #[arg(long, env = "CHATGATE_HOST")]
    pub host: Option<String>,

    /// Bind port.
    #[arg(long, env = "CHATGATE_PORT")]
    pub port: Option<u16>,

    /// Base URL of the upstream assist backend.
    #[arg(long, env = "CHATGATE_UPSTREAM_BASE_URL")]
    pub upstream_base_url: String,

    /// Credential cipher key: 64 hex chars (32 bytes), or at least 32
    /// raw bytes.
    #[arg(long, env = "CHATGATE_CRYPTO_SECRET_KEY")]
    pub crypto_secret_key: String,

    /// strict | passthrough (legacy plaintext rows readable).
    #[arg(long, env = "CHATGATE_CRYPTO_MODE")]
    pub crypto_mode: Option<String>,

    #[arg(long, env = "CHATGATE_SESSION_TTL_MS")]
    pub session_ttl_ms: Option<u64>,

    #[arg(long, env = "CHATGATE_MAX_SESSIONS_PER_USER")]
    pub max_sessions_per_user: Option<u64>,

    #[arg(long, env = "CHATGATE_SESSION_CLEANUP_INTERVAL_MS")]
    pub session_cleanup_interval_ms: Option<u64>,

    #[arg(long, env = "CHATGATE_PROVIDER_MAX_CONCURRENT_DEFAULT")]
    pub provider_max_concurrent_default: Option<i32>,

    #[arg(long, env = "CHATGATE_PROVIDER_HEALTH_THRESHOLD")]
    pub provider_health_threshold: Option<i32>,

    #[arg(long, env = "CHATGATE_PROVIDER_COOLDOWN_MS")]
    pub provider_cooldown_ms: Option<u64>,

    #[arg(long, env = "CHATGATE_PROVIDER_FAILURE_THRESHOLD")]
    pub provider_failure_threshold: Option<i32>,

    #[arg(long, env = "CHATGATE_MAX_RETRIES")]
    pub max_retries: Option<u32>,

    #[arg(long, env = "CHATGATE_UNARY_TIMEOUT_MS")]
    pub unary_timeout_ms: Option<u64>,

    #[arg(long, env = "CHATGATE_STREAM_TIMEOUT_MS")]
    pub stream_timeout_ms: Option<u64>,

    #[arg(long, env = "CHATGATE_LOG_RETENTION_DAYS")]
    pub log_retention_days: Option<i64>,

    /// Comma-separated keyword substrings that signal media intent.
    #[arg(long, env = "CHATGATE_MEDIA_KEYWORDS")]
    pub media_keywords: Option<String>,
}

pub struct Bootstrap {
    pub config: Arc<GatewayConfig>,
    pub storage: Arc<SeaOrmStorage>,
    pub context: GatewayContext,
    pub maintenance: Arc<Maintenance>,
}

pub async fn bootstrap_from_env() -> anyhow::Result<Bootstrap> {
    let args = CliArgs::parse();
    bootstrap(args).await
}

pub async fn bootstrap(args: CliArgs) -> anyhow::Result<Bootstrap> {
    let crypto_secret_key = decode_secret_key(&args.crypto_secret_key)?;
    let crypto_mode = match args.crypto_mode.as_deref() {
        Some(raw) => Some(
            CryptoMode::parse(raw)
                .with_context(|| format!("invalid crypto mode: {raw}"))?,
        ),
        None => None,
    };

    let mut merged = GatewayConfigPatch::default();
    merged.overlay(GatewayConfigPatch {
        host: args.host.clone(),
        port: args.port,
        dsn: Some(args.dsn.clone()),
        upstream_base_url: Some(args.upstream_base_url.clone()),
        crypto_secret_key: Some(crypto_secret_key),
        crypto_mode,
        session_ttl_ms: args.session_ttl_ms,
        max_sessions_per_user: args.max_sessions_per_user,
        session_cleanup_interval_ms: args.session_cleanup_interval_ms,
        provider_max_concurrent_default: args.provider_max_concurrent_default,
        provider_health_threshold: args.provider_health_threshold,
        provider_cooldown_ms: args.provider_cooldown_ms,
        provider_failure_threshold: args.provider_failure_threshold,
        max_retries: args.max_retries,
        unary_timeout_ms: args.unary_timeout_ms,
        stream_timeout_ms: args.stream_timeout_ms,
        upstream_client_ttl_ms: None,
        log_retention_days: args.log_retention_days,
        media_keywords: args.media_keywords.as_deref().map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|k| !k.is_empty())
                .map(str::to_string)
                .collect()
        }),
    });
    let config = Arc::new(merged.into_config().context("finalize config")?);

    let cipher = CredentialCipher::new(&config.crypto_secret_key, config.crypto_mode)
        .context("build credential cipher")?;
    let storage = Arc::new(
        SeaOrmStorage::connect(&config.dsn, cipher)
            .await
            .context("connect storage")?,
    );
    storage.sync().await.context("schema sync")?;

    // First boot: seed a default user and print its API key once.
    if storage.user_count().await.context("count users")? == 0 {
        let user_id = storage
            .insert_user(Some("user0"))
            .await
            .context("seed user0")?;
        let api_key = generate_api_key();
        storage
            .insert_api_key(user_id, &api_key, Some("default"), 0)
            .await
            .context("seed default api key")?;
        eprintln!("generated api key for user0: {api_key}");
    }

    let storage_dyn: Arc<dyn Storage> = storage.clone();
    let scheduler = Arc::new(ProviderScheduler::new(
        storage_dyn.clone(),
        SchedulerConfig {
            health_threshold: config.provider_health_threshold,
            failure_threshold: config.provider_failure_threshold,
            cooldown: config.provider_cooldown,
            max_retries: config.max_retries,
        },
    ));
    let matcher = Arc::new(SessionMatcher::new(
        storage_dyn.clone(),
        config.session_ttl,
        config.max_sessions_per_user,
    ));
    let clients = Arc::new(
        ClientCache::new(UpstreamConfig::from_gateway(&config))
            .map_err(|err| anyhow::anyhow!("build upstream client cache: {err}"))?,
    );
    let executor = Arc::new(RequestExecutor::new(
        storage_dyn.clone(),
        scheduler.clone(),
        matcher,
        clients,
        Arc::new(ModelTable::new()),
        config.clone(),
    ));
    let auth = Arc::new(ApiKeyAuth::new(storage_dyn.clone()));
    let maintenance = Arc::new(Maintenance::new(storage_dyn, scheduler, config.clone()));

    Ok(Bootstrap {
        config,
        storage,
        context: GatewayContext { executor, auth },
        maintenance,
    })
}

fn decode_secret_key(raw: &str) -> anyhow::Result<Vec<u8>> {
    let trimmed = raw.trim();
    if trimmed.len() == 64
        && let Ok(bytes) = hex::decode(trimmed)
    {
        return Ok(bytes);
    }
    if trimmed.len() >= 32 {
        return Ok(trimmed.as_bytes().to_vec());
    }
    anyhow::bail!("crypto secret key must be 64 hex chars or at least 32 bytes");
}

fn generate_api_key() -> String {
    let suffix: String = rand::rng()
        .sample_iter(Alphanumeric)
        .take(40)
        .map(char::from)
        .collect();
    format!("cg-{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_key_decodes_to_32_bytes() {
        let key = "a".repeat(64);
        assert_eq!(decode_secret_key(&key).unwrap().len(), 32);
    }

    #[test]
    fn raw_key_passes_through() {
        let key = "x".repeat(48);
        assert_eq!(decode_secret_key(&key).unwrap().len(), 48);
    }

    #[test]
    fn short_key_rejected() {
        assert!(decode_secret_key("short").is_err());
    }

    #[test]
    fn api_keys_are_distinct() {
        assert_ne!(generate_api_key(), generate_api_key());
    }
}
