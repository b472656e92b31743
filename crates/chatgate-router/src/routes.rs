use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use axum::body::Body;
use axum::extract::{Extension, Path, Request, State};
use axum::http::{HeaderValue, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use bytes::Bytes;
use http::HeaderMap;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::info;
use uuid::Uuid;

use chatgate_core::{ApiKeyAuth, AuthContext, GatewayError, GenerateInput, RequestExecutor};
use chatgate_protocol::error::ErrorResponse;
use chatgate_protocol::gemini::models::ListModelsResponse;
use chatgate_protocol::gemini::request::GenerateContentRequestBody;
use chatgate_protocol::sse;

const TRACE_HEADER: &str = "x-chatgate-request-id";
const SSE_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Clone)]
pub struct GatewayContext {
    pub executor: Arc<RequestExecutor>,
    pub auth: Arc<ApiKeyAuth>,
}

#[derive(Clone)]
struct RequestTraceId(String);

pub fn public_router(ctx: GatewayContext) -> Router {
    Router::new()
        .route("/v1beta/models", get(models_list))
        .route("/v1beta/models/{*name}", get(models_get))
        .route("/v1beta/models/{*name}", post(models_post))
        .layer(middleware::from_fn_with_state(ctx.clone(), gateway_auth))
        .with_state(ctx)
}

/// API keys arrive via `x-goog-api-key`, bearer auth, or the `key` query
/// parameter.
fn extract_api_key(headers: &HeaderMap, query: Option<&str>) -> Option<String> {
    if let Some(value) = headers.get("x-goog-api-key").and_then(|v| v.to_str().ok()) {
        return Some(value.trim().to_string());
    }
    if let Some(value) = headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok()) {
        let value = value.trim();
        if let Some(token) = value
            .strip_prefix("Bearer ")
            .or_else(|| value.strip_prefix("bearer "))
        {
            return Some(token.trim().to_string());
        }
    }
    let query = query?;
    for pair in query.split('&') {
        let mut parts = pair.splitn(2, '=');
        if parts.next() == Some("key") {
            let value = parts.next().unwrap_or("");
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }
    None
}

async fn gateway_auth(
    State(ctx): State<GatewayContext>,
    mut request: Request,
    next: Next,
) -> Response {
    let trace_id = Uuid::new_v4().to_string();
    let api_key = extract_api_key(request.headers(), request.uri().query());

    match ctx.auth.authenticate(api_key.as_deref()).await {
        Ok(auth) => {
            request.extensions_mut().insert(auth);
            request
                .extensions_mut()
                .insert(RequestTraceId(trace_id.clone()));
            let mut response = next.run(request).await;
            if let Ok(value) = HeaderValue::from_str(&trace_id) {
                response.headers_mut().entry(TRACE_HEADER).or_insert(value);
            }
            response
        }
        Err(err) => error_response(&err, &trace_id),
    }
}

async fn models_list(
    State(ctx): State<GatewayContext>,
    Extension(_auth): Extension<AuthContext>,
    Extension(trace): Extension<RequestTraceId>,
) -> Response {
    let body = ListModelsResponse {
        models: ctx.executor.models().known_models(),
    };
    json_response(StatusCode::OK, &body, &trace.0)
}

async fn models_get(
    State(ctx): State<GatewayContext>,
    Extension(_auth): Extension<AuthContext>,
    Extension(trace): Extension<RequestTraceId>,
    Path(name): Path<String>,
) -> Response {
    match ctx.executor.models().describe(&name) {
        Some(model) => json_response(StatusCode::OK, &model, &trace.0),
        None => error_response(
            &GatewayError::InvalidRequest(format!("unknown model: {name}")),
            &trace.0,
        ),
    }
}

/// POST /v1beta/models/{model}:{action}; the action rides in the last
/// path segment, after the colon.
async fn models_post(
    State(ctx): State<GatewayContext>,
    Extension(auth): Extension<AuthContext>,
    Extension(trace): Extension<RequestTraceId>,
    Path(name): Path<String>,
    body: Bytes,
) -> Response {
    let Some((model, action)) = name.rsplit_once(':') else {
        return error_response(
            &GatewayError::InvalidRequest("missing generate action".to_string()),
            &trace.0,
        );
    };

    let request_body: GenerateContentRequestBody = match serde_json::from_slice(&body) {
        Ok(parsed) => parsed,
        Err(err) => {
            return error_response(
                &GatewayError::InvalidRequest(format!("malformed request body: {err}")),
                &trace.0,
            );
        }
    };
    if request_body.contents.is_empty() {
        return error_response(
            &GatewayError::InvalidRequest("contents must not be empty".to_string()),
            &trace.0,
        );
    }

    let input = GenerateInput {
        trace_id: trace.0.clone(),
        user_id: auth.user_id,
        api_key_id: auth.api_key_id,
        model: model.to_string(),
        body: request_body,
    };

    info!(
        event = "generate_received",
        trace_id = %trace.0,
        model,
        action,
        user_id = auth.user_id,
    );

    match action {
        "generateContent" => {
            let started = Instant::now();
            match ctx.executor.generate(input).await {
                Ok(response) => {
                    info!(
                        event = "generate_responded",
                        trace_id = %trace.0,
                        elapsed_ms = started.elapsed().as_millis(),
                    );
                    json_response(StatusCode::OK, &response, &trace.0)
                }
                Err(err) => error_response(&err, &trace.0),
            }
        }
        "streamGenerateContent" => stream_response(ctx, input, trace.0.clone()),
        _ => error_response(
            &GatewayError::InvalidRequest(format!("unsupported action: {action}")),
            &trace.0,
        ),
    }
}

/// Bridge the executor's chunk channel into an SSE body, with keep-alive
/// comments while the upstream is quiet and `[DONE]` after a clean end.
fn stream_response(ctx: GatewayContext, input: GenerateInput, trace_id: String) -> Response {
    let (chunk_tx, mut chunk_rx) = mpsc::unbounded_channel();
    let (frame_tx, frame_rx) = mpsc::channel::<Result<Bytes, Infallible>>(32);

    let executor = ctx.executor.clone();
    tokio::spawn(async move {
        let work = tokio::spawn(async move { executor.stream_generate(input, chunk_tx).await });

        let mut heartbeat = tokio::time::interval(SSE_HEARTBEAT_INTERVAL);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        heartbeat.tick().await;

        loop {
            tokio::select! {
                chunk = chunk_rx.recv() => match chunk {
                    Some(chunk) => {
                        let Some(frame) = sse::data_frame(&chunk) else {
                            continue;
                        };
                        if frame_tx.send(Ok(frame)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                _ = heartbeat.tick() => {
                    if frame_tx
                        .send(Ok(Bytes::from_static(sse::KEEP_ALIVE_FRAME)))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            }
        }

        // Receiver dropped or stream complete; let the executor observe
        // the closed sink, then report the terminal frame.
        drop(chunk_rx);
        match work.await {
            Ok(Ok(())) => {
                let _ = frame_tx.send(Ok(sse::done_frame())).await;
            }
            Ok(Err(err)) => {
                let payload = ErrorResponse::new(err.status_code(), err.to_string());
                if let Some(frame) = sse::data_frame(&payload) {
                    let _ = frame_tx.send(Ok(frame)).await;
                }
            }
            Err(join_err) => {
                let payload = ErrorResponse::new(500, join_err.to_string());
                if let Some(frame) = sse::data_frame(&payload) {
                    let _ = frame_tx.send(Ok(frame)).await;
                }
            }
        }
    });

    let mut response = Response::new(Body::from_stream(ReceiverStream::new(frame_rx)));
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream"),
    );
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    if let Ok(value) = HeaderValue::from_str(&trace_id) {
        response.headers_mut().insert(TRACE_HEADER, value);
    }
    response
}

fn json_response<T: serde::Serialize>(status: StatusCode, body: &T, trace_id: &str) -> Response {
    let payload = serde_json::to_vec(body).unwrap_or_else(|_| b"{}".to_vec());
    let mut response = Response::new(Body::from(payload));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    if let Ok(value) = HeaderValue::from_str(trace_id) {
        response.headers_mut().insert(TRACE_HEADER, value);
    }
    response
}

fn error_response(err: &GatewayError, trace_id: &str) -> Response {
    let status =
        StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let payload = ErrorResponse::new(err.status_code(), err.to_string());
    json_response(status, &payload, trace_id)
}
