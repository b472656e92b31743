use std::time::Duration;

use async_trait::async_trait;
use sea_orm::sea_query::{Expr, ExprTrait, Index};
use sea_orm::{
    ActiveValue, ColumnTrait, Condition, ConnectionTrait, Database, DatabaseBackend,
    DatabaseConnection, EntityTrait, Order, PaginatorTrait, QueryFilter, QueryOrder, QuerySelect,
    Schema,
};
use time::OffsetDateTime;

use crate::crypto::CredentialCipher;
use crate::entities;
use crate::storage::{
    ApiKeyRecord, NewProvider, NewRequestLog, NewSession, ProviderRecord, ProviderStatus,
    SessionRecord, SessionStatus, Storage, StorageResult,
};

pub struct SeaOrmStorage {
    db: DatabaseConnection,
    cipher: CredentialCipher,
}

impl SeaOrmStorage {
    pub async fn connect(dsn: &str, cipher: CredentialCipher) -> StorageResult<Self> {
        let db = Database::connect(dsn).await?;
        // Ensure sqlite enforces foreign keys (required for cascade + integrity).
        if db.get_database_backend() == DatabaseBackend::Sqlite {
            db.execute_unprepared("PRAGMA foreign_keys = ON").await?;
        }
        Ok(Self { db, cipher })
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }

    fn provider_record(&self, model: entities::providers::Model) -> StorageResult<ProviderRecord> {
        let cookies = self.cipher.decrypt(&model.cookies)?;
        Ok(ProviderRecord {
            id: model.id,
            name: model.name,
            group_id: model.group_id,
            csesidx: model.csesidx,
            cookies,
            max_concurrent: model.max_concurrent,
            status: ProviderStatus::parse(&model.status).unwrap_or(ProviderStatus::Inactive),
            health_score: model.health_score,
            current_load: model.current_load,
            consecutive_failures: model.consecutive_failures,
            total_requests: model.total_requests,
            failed_requests: model.failed_requests,
            last_success_at: model.last_success_at,
            last_failure_at: model.last_failure_at,
            cooldown_until: model.cooldown_until,
        })
    }

    async fn ensure_performance_indexes(&self) -> StorageResult<()> {
        use entities::providers::Column as ProviderColumn;
        use entities::request_logs::Column as RequestLogColumn;
        use entities::sessions::Column as SessionColumn;

        let statements = vec![
            Index::create()
                .name("idx_providers_status_health")
                .table(entities::providers::Entity)
                .col(ProviderColumn::Status)
                .col(ProviderColumn::HealthScore)
                .if_not_exists()
                .to_owned(),
            Index::create()
                .name("idx_providers_status_load")
                .table(entities::providers::Entity)
                .col(ProviderColumn::Status)
                .col(ProviderColumn::CurrentLoad)
                .col(ProviderColumn::MaxConcurrent)
                .if_not_exists()
                .to_owned(),
            Index::create()
                .name("idx_sessions_identity")
                .table(entities::sessions::Entity)
                .col(SessionColumn::UserId)
                .col(SessionColumn::HeadHash)
                .col(SessionColumn::TailHash)
                .col(SessionColumn::Status)
                .if_not_exists()
                .to_owned(),
            Index::create()
                .name("idx_sessions_expires_at")
                .table(entities::sessions::Entity)
                .col(SessionColumn::ExpiresAt)
                .if_not_exists()
                .to_owned(),
            Index::create()
                .name("idx_request_logs_at")
                .table(entities::request_logs::Entity)
                .col(RequestLogColumn::At)
                .if_not_exists()
                .to_owned(),
        ];

        for statement in statements {
            self.db.execute(&statement).await?;
        }

        Ok(())
    }
}

fn session_record(model: entities::sessions::Model) -> SessionRecord {
    SessionRecord {
        id: model.id,
        user_id: model.user_id,
        provider_id: model.provider_id,
        head_hash: model.head_hash,
        tail_hash: model.tail_hash,
        upstream_session_id: model.upstream_session_id,
        message_count: model.message_count,
        status: SessionStatus::parse(&model.status).unwrap_or(SessionStatus::Expired),
        expires_at: model.expires_at,
        last_accessed_at: model.last_accessed_at,
    }
}

#[async_trait]
impl Storage for SeaOrmStorage {
    async fn sync(&self) -> StorageResult<()> {
        Schema::new(self.db.get_database_backend())
            .builder()
            .register(entities::Providers)
            .register(entities::Sessions)
            .register(entities::RequestLogs)
            .register(entities::Users)
            .register(entities::ApiKeys)
            .sync(&self.db)
            .await?;
        self.ensure_performance_indexes().await?;
        Ok(())
    }

    async fn insert_provider(&self, provider: NewProvider) -> StorageResult<i64> {
        use entities::providers::ActiveModel as ProviderActive;

        let now = OffsetDateTime::now_utc();
        let active = ProviderActive {
            id: ActiveValue::NotSet,
            name: ActiveValue::Set(provider.name),
            group_id: ActiveValue::Set(provider.group_id),
            csesidx: ActiveValue::Set(provider.csesidx),
            cookies: ActiveValue::Set(self.cipher.encrypt(&provider.cookies)?),
            max_concurrent: ActiveValue::Set(provider.max_concurrent),
            status: ActiveValue::Set(ProviderStatus::Active.as_str().to_string()),
            health_score: ActiveValue::Set(100),
            current_load: ActiveValue::Set(0),
            consecutive_failures: ActiveValue::Set(0),
            total_requests: ActiveValue::Set(0),
            failed_requests: ActiveValue::Set(0),
            last_success_at: ActiveValue::Set(None),
            last_failure_at: ActiveValue::Set(None),
            cooldown_until: ActiveValue::Set(None),
            created_at: ActiveValue::Set(now),
            updated_at: ActiveValue::Set(now),
        };
        let inserted = entities::Providers::insert(active).exec(&self.db).await?;
        Ok(inserted.last_insert_id)
    }

    async fn provider_by_id(&self, id: i64) -> StorageResult<Option<ProviderRecord>> {
        let row = entities::Providers::find_by_id(id).one(&self.db).await?;
        row.map(|model| self.provider_record(model)).transpose()
    }

    async fn provider_candidates(
        &self,
        min_health: i32,
        group: Option<&str>,
        exclude: &[i64],
    ) -> StorageResult<Vec<ProviderRecord>> {
        use entities::providers::Column;

        let mut query = entities::Providers::find()
            .filter(Column::Status.eq(ProviderStatus::Active.as_str()))
            .filter(Column::HealthScore.gte(min_health))
            .filter(Expr::col(Column::CurrentLoad).lt(Expr::col(Column::MaxConcurrent)));

        if let Some(group) = group {
            query = query.filter(Column::GroupId.eq(group));
        }
        if !exclude.is_empty() {
            query = query.filter(Column::Id.is_not_in(exclude.iter().copied()));
        }

        let rows = query
            .order_by_desc(Column::HealthScore)
            // Load ratio ascending; scaled to keep the division integral.
            .order_by(
                Expr::col(Column::CurrentLoad)
                    .mul(1000)
                    .div(Expr::col(Column::MaxConcurrent)),
                Order::Asc,
            )
            .limit(20)
            .all(&self.db)
            .await?;

        rows.into_iter()
            .map(|model| self.provider_record(model))
            .collect()
    }

    async fn try_acquire_provider(&self, id: i64) -> StorageResult<bool> {
        use entities::providers::Column;

        let result = entities::Providers::update_many()
            .col_expr(Column::CurrentLoad, Expr::col(Column::CurrentLoad).add(1))
            .col_expr(Column::UpdatedAt, Expr::value(OffsetDateTime::now_utc()))
            .filter(Column::Id.eq(id))
            .filter(Column::Status.eq(ProviderStatus::Active.as_str()))
            .filter(Expr::col(Column::CurrentLoad).lt(Expr::col(Column::MaxConcurrent)))
            .exec(&self.db)
            .await?;
        Ok(result.rows_affected == 1)
    }

    async fn release_provider(&self, id: i64) -> StorageResult<()> {
        use entities::providers::Column;

        entities::Providers::update_many()
            .col_expr(Column::CurrentLoad, Expr::col(Column::CurrentLoad).sub(1))
            .col_expr(Column::UpdatedAt, Expr::value(OffsetDateTime::now_utc()))
            .filter(Column::Id.eq(id))
            .filter(Column::CurrentLoad.gt(0))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn record_provider_success(&self, id: i64) -> StorageResult<()> {
        use entities::providers::Column;

        let now = OffsetDateTime::now_utc();
        entities::Providers::update_many()
            .col_expr(Column::ConsecutiveFailures, Expr::value(0))
            .col_expr(
                Column::HealthScore,
                Expr::case(
                    Expr::col(Column::HealthScore).lte(99),
                    Expr::col(Column::HealthScore).add(1),
                )
                .finally(Expr::value(100))
                .into(),
            )
            .col_expr(
                Column::TotalRequests,
                Expr::col(Column::TotalRequests).add(1),
            )
            .col_expr(Column::LastSuccessAt, Expr::value(now))
            .col_expr(Column::UpdatedAt, Expr::value(now))
            .filter(Column::Id.eq(id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn record_provider_failure(
        &self,
        id: i64,
        failure_threshold: i32,
        cooldown: Duration,
    ) -> StorageResult<()> {
        use entities::providers::Column;

        let now = OffsetDateTime::now_utc();
        let cooldown_until = now + cooldown;
        let next_failures = Expr::col(Column::ConsecutiveFailures).add(1);

        // One conditional statement: concurrent failures of the same
        // provider each move the row in the same direction, and terminal
        // states are never reverted by an in-flight writer.
        entities::Providers::update_many()
            .col_expr(
                Column::Status,
                Expr::case(
                    next_failures.clone().gte(2 * failure_threshold),
                    Expr::value(ProviderStatus::Failed.as_str()),
                )
                .case(
                    next_failures.clone().gte(failure_threshold),
                    Expr::value(ProviderStatus::Cooling.as_str()),
                )
                .finally(Expr::col(Column::Status))
                .into(),
            )
            .col_expr(
                Column::CooldownUntil,
                Expr::case(
                    next_failures
                        .clone()
                        .gte(failure_threshold)
                        .and(next_failures.clone().lt(2 * failure_threshold)),
                    Expr::value(cooldown_until),
                )
                .finally(Expr::col(Column::CooldownUntil))
                .into(),
            )
            .col_expr(
                Column::HealthScore,
                Expr::case(
                    Expr::col(Column::HealthScore).gte(10),
                    Expr::col(Column::HealthScore).sub(10),
                )
                .finally(Expr::value(0))
                .into(),
            )
            .col_expr(Column::ConsecutiveFailures, next_failures)
            .col_expr(
                Column::FailedRequests,
                Expr::col(Column::FailedRequests).add(1),
            )
            .col_expr(
                Column::TotalRequests,
                Expr::col(Column::TotalRequests).add(1),
            )
            .col_expr(Column::LastFailureAt, Expr::value(now))
            .col_expr(Column::UpdatedAt, Expr::value(now))
            .filter(Column::Id.eq(id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn recover_cooled_providers(&self) -> StorageResult<u64> {
        use entities::providers::Column;

        let now = OffsetDateTime::now_utc();
        let result = entities::Providers::update_many()
            .col_expr(
                Column::Status,
                Expr::value(ProviderStatus::Active.as_str()),
            )
            .col_expr(Column::ConsecutiveFailures, Expr::value(0))
            // Neutral re-entry score.
            .col_expr(Column::HealthScore, Expr::value(50))
            .col_expr(Column::CooldownUntil, Expr::value(None::<OffsetDateTime>))
            .col_expr(Column::UpdatedAt, Expr::value(now))
            .filter(Column::Status.eq(ProviderStatus::Cooling.as_str()))
            .filter(Column::CooldownUntil.lte(now))
            .exec(&self.db)
            .await?;
        Ok(result.rows_affected)
    }

    async fn find_exact_session(
        &self,
        user_id: i64,
        head_hash: &str,
        tail_hash: &str,
    ) -> StorageResult<Option<SessionRecord>> {
        use entities::sessions::Column;

        let rows = entities::Sessions::find()
            .filter(Column::UserId.eq(user_id))
            .filter(Column::HeadHash.eq(head_hash))
            .filter(Column::TailHash.eq(tail_hash))
            .filter(Column::Status.eq(SessionStatus::Active.as_str()))
            .order_by_desc(Column::LastAccessedAt)
            .find_also_related(entities::Providers)
            .all(&self.db)
            .await?;

        Ok(rows
            .into_iter()
            .find(|(_, provider)| provider_is_active(provider.as_ref()))
            .map(|(session, _)| session_record(session)))
    }

    async fn find_head_session(
        &self,
        user_id: i64,
        head_hash: &str,
    ) -> StorageResult<Option<SessionRecord>> {
        use entities::sessions::Column;

        let rows = entities::Sessions::find()
            .filter(Column::UserId.eq(user_id))
            .filter(Column::HeadHash.eq(head_hash))
            .filter(Column::Status.eq(SessionStatus::Active.as_str()))
            .order_by_desc(Column::LastAccessedAt)
            .find_also_related(entities::Providers)
            .all(&self.db)
            .await?;

        Ok(rows
            .into_iter()
            .find(|(_, provider)| provider_is_active(provider.as_ref()))
            .map(|(session, _)| session_record(session)))
    }

    async fn update_session_tail(&self, id: i64, tail_hash: &str) -> StorageResult<()> {
        use entities::sessions::Column;

        entities::Sessions::update_many()
            .col_expr(Column::TailHash, Expr::value(tail_hash))
            .col_expr(
                Column::LastAccessedAt,
                Expr::value(OffsetDateTime::now_utc()),
            )
            .filter(Column::Id.eq(id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn insert_session(&self, session: NewSession) -> StorageResult<SessionRecord> {
        use entities::sessions::ActiveModel as SessionActive;

        let now = OffsetDateTime::now_utc();
        let expires_at = now + session.ttl;
        let active = SessionActive {
            id: ActiveValue::NotSet,
            user_id: ActiveValue::Set(session.user_id),
            provider_id: ActiveValue::Set(session.provider_id),
            head_hash: ActiveValue::Set(session.head_hash.clone()),
            tail_hash: ActiveValue::Set(session.tail_hash.clone()),
            upstream_session_id: ActiveValue::Set(None),
            message_count: ActiveValue::Set(0),
            status: ActiveValue::Set(SessionStatus::Active.as_str().to_string()),
            expires_at: ActiveValue::Set(expires_at),
            last_accessed_at: ActiveValue::Set(now),
            created_at: ActiveValue::Set(now),
        };
        let inserted = entities::Sessions::insert(active).exec(&self.db).await?;

        Ok(SessionRecord {
            id: inserted.last_insert_id,
            user_id: session.user_id,
            provider_id: session.provider_id,
            head_hash: session.head_hash,
            tail_hash: session.tail_hash,
            upstream_session_id: None,
            message_count: 0,
            status: SessionStatus::Active,
            expires_at,
            last_accessed_at: now,
        })
    }

    async fn count_active_sessions(&self, user_id: i64) -> StorageResult<u64> {
        use entities::sessions::Column;

        let count = entities::Sessions::find()
            .filter(Column::UserId.eq(user_id))
            .filter(Column::Status.eq(SessionStatus::Active.as_str()))
            .count(&self.db)
            .await?;
        Ok(count)
    }

    async fn delete_oldest_session(&self, user_id: i64) -> StorageResult<()> {
        use entities::sessions::Column;

        let oldest = entities::Sessions::find()
            .filter(Column::UserId.eq(user_id))
            .filter(Column::Status.eq(SessionStatus::Active.as_str()))
            .order_by_asc(Column::LastAccessedAt)
            .one(&self.db)
            .await?;
        if let Some(model) = oldest {
            entities::Sessions::delete_by_id(model.id)
                .exec(&self.db)
                .await?;
        }
        Ok(())
    }

    async fn set_upstream_session(&self, id: i64, upstream_session_id: &str) -> StorageResult<()> {
        use entities::sessions::Column;

        // Only fill an empty handle; migration inserts a fresh row instead
        // of overwriting.
        entities::Sessions::update_many()
            .col_expr(Column::UpstreamSessionId, Expr::value(upstream_session_id))
            .filter(Column::Id.eq(id))
            .filter(Column::UpstreamSessionId.is_null())
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn touch_session(&self, id: i64, ttl: Duration) -> StorageResult<()> {
        use entities::sessions::Column;

        let now = OffsetDateTime::now_utc();
        entities::Sessions::update_many()
            .col_expr(Column::MessageCount, Expr::col(Column::MessageCount).add(1))
            .col_expr(Column::LastAccessedAt, Expr::value(now))
            .col_expr(Column::ExpiresAt, Expr::value(now + ttl))
            .filter(Column::Id.eq(id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn mark_session_migrated(&self, id: i64) -> StorageResult<()> {
        use entities::sessions::Column;

        entities::Sessions::update_many()
            .col_expr(
                Column::Status,
                Expr::value(SessionStatus::Migrated.as_str()),
            )
            .filter(Column::Id.eq(id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn sweep_sessions(&self) -> StorageResult<u64> {
        use entities::sessions::Column;

        let now = OffsetDateTime::now_utc();
        let result = entities::Sessions::delete_many()
            .filter(
                Condition::any()
                    .add(Column::ExpiresAt.lt(now))
                    .add(Column::Status.eq(SessionStatus::Expired.as_str()))
                    .add(Column::Status.eq(SessionStatus::Migrated.as_str())),
            )
            .exec(&self.db)
            .await?;
        Ok(result.rows_affected)
    }

    async fn append_request_log(&self, log: NewRequestLog) -> StorageResult<()> {
        use entities::request_logs::ActiveModel as RequestLogActive;

        let active = RequestLogActive {
            id: ActiveValue::NotSet,
            trace_id: ActiveValue::Set(log.trace_id),
            at: ActiveValue::Set(OffsetDateTime::now_utc()),
            user_id: ActiveValue::Set(log.user_id),
            api_key_id: ActiveValue::Set(log.api_key_id),
            provider_id: ActiveValue::Set(log.provider_id),
            session_id: ActiveValue::Set(log.session_id),
            model: ActiveValue::Set(log.model),
            kind: ActiveValue::Set(log.kind),
            input_tokens: ActiveValue::Set(log.input_tokens),
            output_tokens: ActiveValue::Set(log.output_tokens),
            latency_ms: ActiveValue::Set(log.latency_ms),
            status_code: ActiveValue::Set(log.status_code),
            error: ActiveValue::Set(log.error),
        };
        entities::RequestLogs::insert(active).exec(&self.db).await?;
        Ok(())
    }

    async fn prune_request_logs(&self, older_than: OffsetDateTime) -> StorageResult<u64> {
        use entities::request_logs::Column;

        let result = entities::RequestLogs::delete_many()
            .filter(Column::At.lt(older_than))
            .exec(&self.db)
            .await?;
        Ok(result.rows_affected)
    }

    async fn user_count(&self) -> StorageResult<u64> {
        Ok(entities::Users::find().count(&self.db).await?)
    }

    async fn insert_user(&self, name: Option<&str>) -> StorageResult<i64> {
        use entities::users::ActiveModel as UserActive;

        let now = OffsetDateTime::now_utc();
        let active = UserActive {
            id: ActiveValue::NotSet,
            name: ActiveValue::Set(name.map(str::to_string)),
            enabled: ActiveValue::Set(true),
            created_at: ActiveValue::Set(now),
            updated_at: ActiveValue::Set(now),
        };
        let inserted = entities::Users::insert(active).exec(&self.db).await?;
        Ok(inserted.last_insert_id)
    }

    async fn insert_api_key(
        &self,
        user_id: i64,
        key_value: &str,
        label: Option<&str>,
        daily_limit: i64,
    ) -> StorageResult<i64> {
        use entities::api_keys::ActiveModel as ApiKeyActive;

        let active = ApiKeyActive {
            id: ActiveValue::NotSet,
            user_id: ActiveValue::Set(user_id),
            key_value: ActiveValue::Set(key_value.to_string()),
            label: ActiveValue::Set(label.map(str::to_string)),
            enabled: ActiveValue::Set(true),
            daily_limit: ActiveValue::Set(daily_limit),
            daily_usage: ActiveValue::Set(0),
            created_at: ActiveValue::Set(OffsetDateTime::now_utc()),
            last_used_at: ActiveValue::Set(None),
        };
        let inserted = entities::ApiKeys::insert(active).exec(&self.db).await?;
        Ok(inserted.last_insert_id)
    }

    async fn api_key_by_value(&self, key_value: &str) -> StorageResult<Option<ApiKeyRecord>> {
        use entities::api_keys::Column;

        let row = entities::ApiKeys::find()
            .filter(Column::KeyValue.eq(key_value))
            .one(&self.db)
            .await?;
        Ok(row.map(|model| ApiKeyRecord {
            id: model.id,
            user_id: model.user_id,
            enabled: model.enabled,
            daily_limit: model.daily_limit,
            daily_usage: model.daily_usage,
        }))
    }

    async fn record_key_usage(&self, key_id: i64) -> StorageResult<()> {
        use entities::api_keys::Column;

        entities::ApiKeys::update_many()
            .col_expr(Column::DailyUsage, Expr::col(Column::DailyUsage).add(1))
            .col_expr(Column::LastUsedAt, Expr::value(OffsetDateTime::now_utc()))
            .filter(Column::Id.eq(key_id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn reset_daily_usage(&self) -> StorageResult<u64> {
        use entities::api_keys::Column;

        let result = entities::ApiKeys::update_many()
            .col_expr(Column::DailyUsage, Expr::value(0))
            .filter(Column::DailyUsage.gt(0))
            .exec(&self.db)
            .await?;
        Ok(result.rows_affected)
    }
}

fn provider_is_active(provider: Option<&entities::providers::Model>) -> bool {
    provider
        .map(|model| model.status == ProviderStatus::Active.as_str())
        .unwrap_or(false)
}
