use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum GatewayConfigError {
    #[error("missing required config field: {0}")]
    MissingField(&'static str),
    #[error("invalid config field {field}: {message}")]
    InvalidField {
        field: &'static str,
        message: String,
    },
}

/// How provider credential blobs that fail to decrypt are treated.
///
/// `Passthrough` returns payloads without the ciphertext prefix unchanged,
/// which keeps legacy plaintext rows readable. New writes always encrypt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CryptoMode {
    Strict,
    Passthrough,
}

impl CryptoMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "strict" => Some(CryptoMode::Strict),
            "passthrough" => Some(CryptoMode::Passthrough),
            _ => None,
        }
    }
}

/// Final, merged configuration used by the running process.
///
/// Merge order: CLI > ENV > defaults. The binary builds a patch from clap
/// and overlays it onto `GatewayConfigPatch::default()`.
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    /// Database DSN.
    pub dsn: String,
    /// Base URL of the upstream assist backend.
    pub upstream_base_url: String,
    /// Symmetric key for the credential cipher, at least 32 bytes.
    pub crypto_secret_key: Vec<u8>,
    pub crypto_mode: CryptoMode,

    pub session_ttl: Duration,
    pub max_sessions_per_user: u64,
    pub session_cleanup_interval: Duration,

    pub provider_max_concurrent_default: i32,
    pub provider_health_threshold: i32,
    pub provider_cooldown: Duration,
    pub provider_failure_threshold: i32,
    pub max_retries: u32,

    pub unary_timeout: Duration,
    pub stream_timeout: Duration,
    pub upstream_client_ttl: Duration,

    pub log_retention_days: i64,
    /// Case-insensitive substrings that signal media intent in the last
    /// user message.
    pub media_keywords: Vec<String>,
}

pub fn default_media_keywords() -> Vec<String> {
    ["draw", "sketch", "image of", "picture of", "generate an image", "画", "生成图片"]
        .into_iter()
        .map(str::to_string)
        .collect()
}

/// Optional layer used for merging configuration sources.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GatewayConfigPatch {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub dsn: Option<String>,
    pub upstream_base_url: Option<String>,
    pub crypto_secret_key: Option<Vec<u8>>,
    pub crypto_mode: Option<CryptoMode>,
    pub session_ttl_ms: Option<u64>,
    pub max_sessions_per_user: Option<u64>,
    pub session_cleanup_interval_ms: Option<u64>,
    pub provider_max_concurrent_default: Option<i32>,
    pub provider_health_threshold: Option<i32>,
    pub provider_cooldown_ms: Option<u64>,
    pub provider_failure_threshold: Option<i32>,
    pub max_retries: Option<u32>,
    pub unary_timeout_ms: Option<u64>,
    pub stream_timeout_ms: Option<u64>,
    pub upstream_client_ttl_ms: Option<u64>,
    pub log_retention_days: Option<i64>,
    pub media_keywords: Option<Vec<String>>,
}

impl GatewayConfigPatch {
    pub fn overlay(&mut self, other: GatewayConfigPatch) {
        macro_rules! take {
            ($($field:ident),* $(,)?) => {
                $(if other.$field.is_some() {
                    self.$field = other.$field;
                })*
            };
        }
        take!(
            host,
            port,
            dsn,
            upstream_base_url,
            crypto_secret_key,
            crypto_mode,
            session_ttl_ms,
            max_sessions_per_user,
            session_cleanup_interval_ms,
            provider_max_concurrent_default,
            provider_health_threshold,
            provider_cooldown_ms,
            provider_failure_threshold,
            max_retries,
            unary_timeout_ms,
            stream_timeout_ms,
            upstream_client_ttl_ms,
            log_retention_days,
            media_keywords,
        );
    }

    pub fn into_config(self) -> Result<GatewayConfig, GatewayConfigError> {
        let crypto_secret_key = self
            .crypto_secret_key
            .ok_or(GatewayConfigError::MissingField("crypto_secret_key"))?;
        if crypto_secret_key.len() < 32 {
            return Err(GatewayConfigError::InvalidField {
                field: "crypto_secret_key",
                message: format!(
                    "need at least 32 bytes, got {}",
                    crypto_secret_key.len()
                ),
            });
        }

        Ok(GatewayConfig {
            host: self.host.unwrap_or_else(|| "0.0.0.0".to_string()),
            port: self.port.unwrap_or(8788),
            dsn: self
                .dsn
                .unwrap_or_else(|| "sqlite://chatgate.db?mode=rwc".to_string()),
            upstream_base_url: self
                .upstream_base_url
                .ok_or(GatewayConfigError::MissingField("upstream_base_url"))?,
            crypto_secret_key,
            crypto_mode: self.crypto_mode.unwrap_or(CryptoMode::Passthrough),
            session_ttl: Duration::from_millis(self.session_ttl_ms.unwrap_or(3_600_000)),
            max_sessions_per_user: self.max_sessions_per_user.unwrap_or(100),
            session_cleanup_interval: Duration::from_millis(
                self.session_cleanup_interval_ms.unwrap_or(300_000),
            ),
            provider_max_concurrent_default: self.provider_max_concurrent_default.unwrap_or(10),
            provider_health_threshold: self.provider_health_threshold.unwrap_or(50),
            provider_cooldown: Duration::from_millis(self.provider_cooldown_ms.unwrap_or(300_000)),
            provider_failure_threshold: self.provider_failure_threshold.unwrap_or(5),
            max_retries: self.max_retries.unwrap_or(3),
            unary_timeout: Duration::from_millis(self.unary_timeout_ms.unwrap_or(120_000)),
            stream_timeout: Duration::from_millis(self.stream_timeout_ms.unwrap_or(1_800_000)),
            upstream_client_ttl: Duration::from_millis(
                self.upstream_client_ttl_ms.unwrap_or(300_000),
            ),
            log_retention_days: self.log_retention_days.unwrap_or(30),
            media_keywords: self.media_keywords.unwrap_or_else(default_media_keywords),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_patch() -> GatewayConfigPatch {
        GatewayConfigPatch {
            upstream_base_url: Some("https://assist.example.com".to_string()),
            crypto_secret_key: Some(vec![7u8; 32]),
            ..Default::default()
        }
    }

    #[test]
    fn defaults_fill_in() {
        let config = minimal_patch().into_config().unwrap();
        assert_eq!(config.port, 8788);
        assert_eq!(config.session_ttl, Duration::from_secs(3600));
        assert_eq!(config.max_sessions_per_user, 100);
        assert_eq!(config.provider_failure_threshold, 5);
        assert_eq!(config.crypto_mode, CryptoMode::Passthrough);
        assert!(!config.media_keywords.is_empty());
    }

    #[test]
    fn short_key_rejected() {
        let mut patch = minimal_patch();
        patch.crypto_secret_key = Some(vec![1u8; 16]);
        assert!(patch.into_config().is_err());
    }

    #[test]
    fn overlay_prefers_other() {
        let mut base = minimal_patch();
        base.port = Some(1000);
        let other = GatewayConfigPatch {
            port: Some(2000),
            ..Default::default()
        };
        base.overlay(other);
        assert_eq!(base.port, Some(2000));
        // Fields absent in the overlay keep their value.
        assert!(base.crypto_secret_key.is_some());
    }

    #[test]
    fn crypto_mode_parse() {
        assert_eq!(CryptoMode::parse("strict"), Some(CryptoMode::Strict));
        assert_eq!(
            CryptoMode::parse(" Passthrough "),
            Some(CryptoMode::Passthrough)
        );
        assert_eq!(CryptoMode::parse("other"), None);
    }
}
