use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::Router;
use axum::extract::{Path, State};
use axum::routing::{get, post};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use sea_orm::EntityTrait;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use chatgate_common::{CryptoMode, GatewayConfig, default_media_keywords};
use chatgate_core::{
    ApiKeyAuth, GenerateInput, ModelTable, RequestExecutor, SessionMatcher,
};
use chatgate_protocol::gemini::request::GenerateContentRequestBody;
use chatgate_protocol::gemini::response::ResponsePart;
use chatgate_protocol::gemini::types::{Content, ContentRole, FinishReason, Part};
use chatgate_scheduler::{ProviderScheduler, SchedulerConfig};
use chatgate_storage::{
    CredentialCipher, NewProvider, SeaOrmStorage, SessionStatus, Storage, entities,
};
use chatgate_upstream::{ClientCache, UpstreamConfig};

#[derive(Default)]
struct MockState {
    create_calls: AtomicUsize,
    assist_calls: AtomicUsize,
    /// Fail this many streamAssist calls with a 500 before succeeding.
    fail_assists: AtomicUsize,
}

async fn mock_post(
    State(state): State<Arc<MockState>>,
    Path(rest): Path<String>,
) -> axum::response::Response {
    let body = if rest == "auth/token" {
        let expire = (OffsetDateTime::now_utc() + Duration::from_secs(600))
            .format(&Rfc3339)
            .unwrap();
        format!(
            r#"{{"token":"{}","keyId":"key-1","expireTime":"{}"}}"#,
            URL_SAFE_NO_PAD.encode(b"0123456789abcdef0123456789abcdef"),
            expire
        )
    } else if rest == "sessions" {
        state.create_calls.fetch_add(1, Ordering::SeqCst);
        r#"{"name":"sessions/abc"}"#.to_string()
    } else if rest.ends_with(":streamAssist") {
        state.assist_calls.fetch_add(1, Ordering::SeqCst);
        if state
            .fail_assists
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return axum::response::Response::builder()
                .status(500)
                .body("upstream exploded".into())
                .unwrap();
        }
        concat!(
            r#"[{"streamAssistResponse":{"answer":{"state":"IN_PROGRESS","replies":["#,
            r#"{"groundedContent":{"content":{"text":"pondering","thought":true}}},"#,
            r#"{"groundedContent":{"content":{"text":"Hel"}}}]}}}"#,
            " ,\r\n ",
            r#"{"streamAssistResponse":{"answer":{"state":"SUCCEEDED","replies":["#,
            r#"{"groundedContent":{"content":{"text":"lo!"}}}]},"#,
            r#""sessionInfo":{"session":"sessions/abc"}}}]"#
        )
        .to_string()
    } else {
        return axum::response::Response::builder()
            .status(404)
            .body("unknown".into())
            .unwrap();
    };
    axum::response::Response::builder()
        .status(200)
        .header("content-type", "application/json")
        .body(body.into())
        .unwrap()
}

async fn mock_get(Path(rest): Path<String>) -> axum::response::Response {
    let body = if rest.ends_with("/files") {
        r#"{"files":[{"name":"sessions/abc/files/f1","mimeType":"image/png"}]}"#
    } else if rest.ends_with(":download") {
        r#"{"mimeType":"image/png","data":"QUJD"}"#
    } else {
        return axum::response::Response::builder()
            .status(404)
            .body("unknown".into())
            .unwrap();
    };
    axum::response::Response::builder()
        .status(200)
        .header("content-type", "application/json")
        .body(body.into())
        .unwrap()
}

async fn spawn_mock_upstream(state: Arc<MockState>) -> String {
    let app = Router::new()
        .route("/v1/{*rest}", post(mock_post))
        .route("/v1/{*rest}", get(mock_get))
        .with_state(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

struct Harness {
    storage: Arc<SeaOrmStorage>,
    executor: RequestExecutor,
    mock: Arc<MockState>,
    user_id: i64,
    api_key_id: i64,
    provider_ids: Vec<i64>,
}

fn gateway_config(upstream_base_url: String) -> GatewayConfig {
    GatewayConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        dsn: "sqlite::memory:".to_string(),
        upstream_base_url,
        crypto_secret_key: vec![11u8; 32],
        crypto_mode: CryptoMode::Passthrough,
        session_ttl: Duration::from_secs(3600),
        max_sessions_per_user: 100,
        session_cleanup_interval: Duration::from_secs(300),
        provider_max_concurrent_default: 10,
        provider_health_threshold: 50,
        provider_cooldown: Duration::from_secs(300),
        provider_failure_threshold: 5,
        max_retries: 3,
        unary_timeout: Duration::from_secs(120),
        stream_timeout: Duration::from_secs(1800),
        upstream_client_ttl: Duration::from_secs(300),
        log_retention_days: 30,
        media_keywords: default_media_keywords(),
    }
}

async fn harness(provider_count: usize) -> Harness {
    let mock = Arc::new(MockState::default());
    let base_url = spawn_mock_upstream(mock.clone()).await;

    let cipher = CredentialCipher::new(&[11u8; 32], CryptoMode::Passthrough).unwrap();
    let storage = Arc::new(
        SeaOrmStorage::connect("sqlite::memory:", cipher)
            .await
            .unwrap(),
    );
    storage.sync().await.unwrap();

    let mut provider_ids = Vec::new();
    for i in 0..provider_count {
        let id = storage
            .insert_provider(NewProvider {
                name: format!("p{i}"),
                group_id: None,
                csesidx: format!("csx-{i}"),
                cookies: format!("sid={i}"),
                max_concurrent: 10,
            })
            .await
            .unwrap();
        provider_ids.push(id);
    }
    let user_id = storage.insert_user(Some("alice")).await.unwrap();
    let api_key_id = storage
        .insert_api_key(user_id, "cg-test", None, 0)
        .await
        .unwrap();

    let config = Arc::new(gateway_config(base_url));
    let storage_dyn: Arc<dyn Storage> = storage.clone();
    let scheduler = Arc::new(ProviderScheduler::new(
        storage_dyn.clone(),
        SchedulerConfig::default(),
    ));
    let matcher = Arc::new(SessionMatcher::new(
        storage_dyn.clone(),
        config.session_ttl,
        config.max_sessions_per_user,
    ));
    let clients = Arc::new(ClientCache::new(UpstreamConfig::from_gateway(&config)).unwrap());
    let executor = RequestExecutor::new(
        storage_dyn,
        scheduler,
        matcher,
        clients,
        Arc::new(ModelTable::new()),
        config,
    );

    Harness {
        storage,
        executor,
        mock,
        user_id,
        api_key_id,
        provider_ids,
    }
}

fn input(harness: &Harness, texts: &[&str]) -> GenerateInput {
    let contents = texts
        .iter()
        .enumerate()
        .map(|(i, text)| Content {
            role: Some(if i % 2 == 0 {
                ContentRole::User
            } else {
                ContentRole::Model
            }),
            parts: vec![Part {
                text: Some(text.to_string()),
                ..Part::default()
            }],
        })
        .collect();
    GenerateInput {
        trace_id: "trace-1".to_string(),
        user_id: harness.user_id,
        api_key_id: harness.api_key_id,
        model: "gemini-2.0-flash-exp".to_string(),
        body: GenerateContentRequestBody {
            contents,
            generation_config: None,
            thinking_config: None,
        },
    }
}

fn candidate_text(response: &chatgate_protocol::gemini::response::GenerateContentResponse) -> String {
    response.candidates[0]
        .content
        .parts
        .iter()
        .filter_map(|part| match part {
            ResponsePart::Text { text } => Some(text.clone()),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn fresh_conversation_unary_round_trip() {
    let h = harness(2).await;

    let response = h.executor.generate(input(&h, &["Hello"])).await.unwrap();

    assert_eq!(candidate_text(&response), "Hello!");
    assert_eq!(
        response.candidates[0].finish_reason,
        Some(FinishReason::Stop)
    );
    assert_eq!(response.model_version, "gemini-2.0-flash-exp");
    // Thoughts are omitted unless requested.
    assert!(
        response.candidates[0]
            .content
            .parts
            .iter()
            .all(|part| !matches!(part, ResponsePart::Thought { .. }))
    );
    let usage = response.usage_metadata.unwrap();
    assert!(usage.candidates_token_count > 0);
    assert_eq!(
        usage.total_token_count,
        usage.prompt_token_count + usage.candidates_token_count
    );

    // One upstream session, one assist call.
    assert_eq!(h.mock.create_calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.mock.assist_calls.load(Ordering::SeqCst), 1);

    // Load went back to zero and the success was recorded somewhere.
    let mut successes = 0;
    for id in &h.provider_ids {
        let row = h.storage.provider_by_id(*id).await.unwrap().unwrap();
        assert_eq!(row.current_load, 0);
        successes += row.total_requests;
    }
    assert_eq!(successes, 1);

    // Exactly one request-log row, status 200.
    let logs = entities::RequestLogs::find()
        .all(h.storage.connection())
        .await
        .unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].status_code, 200);
    assert_eq!(logs[0].kind, "generate");
    assert!(logs[0].error.is_none());
}

#[tokio::test]
async fn identical_conversation_reuses_session() {
    let h = harness(1).await;

    h.executor.generate(input(&h, &["Hello"])).await.unwrap();
    h.executor.generate(input(&h, &["Hello"])).await.unwrap();

    // Same fingerprints: the second call reuses the upstream session.
    assert_eq!(h.mock.create_calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.mock.assist_calls.load(Ordering::SeqCst), 2);

    let sessions = entities::Sessions::find()
        .all(h.storage.connection())
        .await
        .unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].message_count, 2);
    assert_eq!(
        sessions[0].upstream_session_id.as_deref(),
        Some("sessions/abc")
    );
}

#[tokio::test]
async fn thoughts_are_included_when_requested() {
    let h = harness(1).await;
    let mut request = input(&h, &["Hello"]);
    request.body.thinking_config =
        Some(chatgate_protocol::gemini::types::ThinkingConfig {
            include_thoughts: true,
        });

    let response = h.executor.generate(request).await.unwrap();
    let thoughts: Vec<_> = response.candidates[0]
        .content
        .parts
        .iter()
        .filter(|part| matches!(part, ResponsePart::Thought { .. }))
        .collect();
    assert_eq!(thoughts.len(), 1);
}

#[tokio::test]
async fn media_keyword_attaches_inline_data() {
    let h = harness(1).await;

    let response = h
        .executor
        .generate(input(&h, &["please draw a cat"]))
        .await
        .unwrap();
    let inline = response.candidates[0]
        .content
        .parts
        .iter()
        .find_map(|part| match part {
            ResponsePart::InlineData { inline_data } => Some(inline_data.clone()),
            _ => None,
        })
        .expect("inline data part");
    assert_eq!(inline.mime_type, "image/png");
    assert_eq!(inline.data, "QUJD");
}

#[tokio::test]
async fn failed_provider_is_substituted_and_session_migrated() {
    let h = harness(2).await;
    h.mock.fail_assists.store(1, Ordering::SeqCst);

    let response = h.executor.generate(input(&h, &["Hello"])).await.unwrap();
    assert_eq!(
        response.candidates[0].finish_reason,
        Some(FinishReason::Stop)
    );
    assert_eq!(h.mock.assist_calls.load(Ordering::SeqCst), 2);

    // One provider took the failure, both are drained.
    let mut failures = 0;
    for id in &h.provider_ids {
        let row = h.storage.provider_by_id(*id).await.unwrap().unwrap();
        assert_eq!(row.current_load, 0);
        failures += row.failed_requests;
    }
    assert_eq!(failures, 1);

    // The session moved providers: one migrated row, one active row with
    // the same fingerprints.
    let sessions = entities::Sessions::find()
        .all(h.storage.connection())
        .await
        .unwrap();
    assert_eq!(sessions.len(), 2);
    let active: Vec<_> = sessions
        .iter()
        .filter(|s| s.status == SessionStatus::Active.as_str())
        .collect();
    let migrated: Vec<_> = sessions
        .iter()
        .filter(|s| s.status == SessionStatus::Migrated.as_str())
        .collect();
    assert_eq!(active.len(), 1);
    assert_eq!(migrated.len(), 1);
    assert_eq!(active[0].head_hash, migrated[0].head_hash);
    assert_ne!(active[0].provider_id, migrated[0].provider_id);
}

#[tokio::test]
async fn exhausted_retries_surface_last_error_and_log_failure() {
    let h = harness(2).await;
    // More failures than providers: every attempt dies.
    h.mock.fail_assists.store(10, Ordering::SeqCst);

    let err = h
        .executor
        .generate(input(&h, &["Hello"]))
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), 502);

    for id in &h.provider_ids {
        let row = h.storage.provider_by_id(*id).await.unwrap().unwrap();
        assert_eq!(row.current_load, 0);
        assert_eq!(row.failed_requests, 1);
    }

    let logs = entities::RequestLogs::find()
        .all(h.storage.connection())
        .await
        .unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].status_code, 502);
    assert!(logs[0].error.is_some());
}

#[tokio::test]
async fn streaming_preserves_order_and_ends_with_usage() {
    let h = harness(1).await;
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

    h.executor
        .stream_generate(input(&h, &["Hello"]), tx)
        .await
        .unwrap();

    let mut chunks = Vec::new();
    while let Ok(chunk) = rx.try_recv() {
        chunks.push(chunk);
    }
    // Two content chunks followed by the synthetic terminal chunk.
    assert_eq!(chunks.len(), 3);
    assert_eq!(candidate_text(&chunks[0]), "Hel");
    assert_eq!(candidate_text(&chunks[1]), "lo!");
    assert_eq!(chunks[0].candidates[0].finish_reason, None);
    assert!(chunks[0].usage_metadata.is_none());

    let terminal = &chunks[2];
    assert_eq!(
        terminal.candidates[0].finish_reason,
        Some(FinishReason::Stop)
    );
    assert_eq!(candidate_text(terminal), "");
    assert!(terminal.usage_metadata.is_some());
}

#[tokio::test]
async fn empty_contents_fail_fast_without_acquire() {
    let h = harness(1).await;
    let mut request = input(&h, &["Hello"]);
    request.body.contents.clear();

    let err = h.executor.generate(request).await.unwrap_err();
    assert_eq!(err.status_code(), 400);

    // No provider was touched.
    let row = h
        .storage
        .provider_by_id(h.provider_ids[0])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.total_requests, 0);
    assert_eq!(h.mock.assist_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn auth_layer_enforces_daily_cap() {
    let h = harness(1).await;
    let storage_dyn: Arc<dyn Storage> = h.storage.clone();
    let auth = ApiKeyAuth::new(storage_dyn);

    h.storage
        .insert_api_key(h.user_id, "cg-capped", None, 2)
        .await
        .unwrap();

    assert!(auth.authenticate(Some("cg-capped")).await.is_ok());
    assert!(auth.authenticate(Some("cg-capped")).await.is_ok());
    let err = auth.authenticate(Some("cg-capped")).await.unwrap_err();
    assert_eq!(err.status_code(), 429);

    assert!(auth.authenticate(None).await.unwrap_err().status_code() == 401);
    assert!(auth.authenticate(Some("nope")).await.unwrap_err().status_code() == 401);
}
