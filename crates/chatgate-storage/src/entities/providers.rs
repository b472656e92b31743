use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "providers")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    #[sea_orm(unique_key = "provider_name")]
    pub name: String,
    pub group_id: Option<String>,
    /// Opaque session-index token used when deriving the bearer token.
    pub csesidx: String,
    /// Cookie bag, encrypted at rest.
    pub cookies: String,
    pub max_concurrent: i32,
    pub status: String,
    pub health_score: i32,
    pub current_load: i32,
    pub consecutive_failures: i32,
    pub total_requests: i64,
    pub failed_requests: i64,
    pub last_success_at: Option<OffsetDateTime>,
    pub last_failure_at: Option<OffsetDateTime>,
    pub cooldown_until: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    #[sea_orm(has_many)]
    pub sessions: HasMany<super::sessions::Entity>,
}

impl ActiveModelBehavior for ActiveModel {}
