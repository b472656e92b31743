use std::sync::Arc;

use chatgate_storage::Storage;

use crate::error::GatewayError;

#[derive(Debug, Clone, Copy)]
pub struct AuthContext {
    pub user_id: i64,
    pub api_key_id: i64,
}

/// API-key validation against the key store, including the per-key daily
/// counter. The counter is bumped on every authenticated request and
/// reset by the maintenance loop at midnight.
pub struct ApiKeyAuth {
    storage: Arc<dyn Storage>,
}

impl ApiKeyAuth {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    pub async fn authenticate(&self, api_key: Option<&str>) -> Result<AuthContext, GatewayError> {
        let api_key =
            api_key.ok_or_else(|| GatewayError::Auth("missing api key".to_string()))?;
        let record = self
            .storage
            .api_key_by_value(api_key)
            .await?
            .ok_or_else(|| GatewayError::Auth("invalid api key".to_string()))?;

        if !record.enabled {
            return Err(GatewayError::Auth("api key disabled".to_string()));
        }
        if record.daily_limit > 0 && record.daily_usage >= record.daily_limit {
            return Err(GatewayError::RateLimit);
        }

        self.storage.record_key_usage(record.id).await?;
        Ok(AuthContext {
            user_id: record.user_id,
            api_key_id: record.id,
        })
    }
}
