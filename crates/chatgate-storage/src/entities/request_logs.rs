use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "request_logs")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub trace_id: Option<String>,
    pub at: OffsetDateTime,
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

impl ActiveModelBehavior for ActiveModel {}
