use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use http::HeaderValue;
use http::header::{AUTHORIZATION, CONTENT_TYPE, COOKIE};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use chatgate_common::GatewayConfig;
use chatgate_protocol::assist::{
    ANSWER_STATE_SUCCEEDED, AnswerGenerationSpec, AssistFrame, AssistQuery, StreamAssistRequest,
};
use chatgate_protocol::stream::JsonArrayStream;

use crate::error::UpstreamError;
use crate::token::{BearerToken, ServerToken, derive_bearer};

/// Refresh the bearer token when it is this close to expiry.
const TOKEN_REFRESH_SKEW: Duration = Duration::from_secs(30);

/// Upstream honors this header as its own processing deadline.
const SERVER_TIMEOUT_HEADER: &str = "x-server-timeout";

#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub base_url: String,
    pub unary_timeout: Duration,
    pub stream_timeout: Duration,
    pub client_ttl: Duration,
}

impl UpstreamConfig {
    pub fn from_gateway(config: &GatewayConfig) -> Self {
        Self {
            base_url: config.upstream_base_url.trim_end_matches('/').to_string(),
            unary_timeout: config.unary_timeout,
            stream_timeout: config.stream_timeout,
            client_ttl: config.upstream_client_ttl,
        }
    }
}

/// Decrypted credential material for one provider.
#[derive(Debug, Clone)]
pub struct UpstreamCredentials {
    pub provider_id: i64,
    pub csesidx: String,
    pub cookies: String,
}

/// Terminal information gathered while draining one assist stream.
#[derive(Debug, Clone, Default)]
pub struct AssistOutcome {
    pub state: Option<String>,
    pub session: Option<String>,
}

impl AssistOutcome {
    pub fn is_succeeded(&self) -> bool {
        self.state.as_deref() == Some(ANSWER_STATE_SUCCEEDED)
    }
}

#[derive(Debug, Clone)]
pub struct InlineMedia {
    pub mime_type: String,
    /// Base64-encoded bytes as delivered by upstream.
    pub data: String,
}

pub struct UpstreamClient {
    http: wreq::Client,
    config: Arc<UpstreamConfig>,
    credentials: UpstreamCredentials,
    token: Mutex<Option<BearerToken>>,
}

impl UpstreamClient {
    pub fn new(
        http: wreq::Client,
        config: Arc<UpstreamConfig>,
        credentials: UpstreamCredentials,
    ) -> Self {
        Self {
            http,
            config,
            credentials,
            token: Mutex::new(None),
        }
    }

    pub fn provider_id(&self) -> i64 {
        self.credentials.provider_id
    }

    /// Current bearer token, refreshing when absent or within 30 s of
    /// expiry. The mutex is held across the refresh, so concurrent
    /// callers wait for the single in-flight fetch instead of racing it.
    async fn bearer(&self) -> Result<String, UpstreamError> {
        let mut guard = self.token.lock().await;
        let now = OffsetDateTime::now_utc();
        if let Some(token) = guard.as_ref()
            && token.is_fresh(now, TOKEN_REFRESH_SKEW)
        {
            return Ok(token.value.clone());
        }

        let server = self.fetch_server_token().await?;
        let bearer = derive_bearer(&self.credentials.csesidx, &server, now)?;
        let value = bearer.value.clone();
        *guard = Some(bearer);
        debug!(
            provider_id = self.credentials.provider_id,
            "bearer token refreshed"
        );
        Ok(value)
    }

    async fn fetch_server_token(&self) -> Result<ServerToken, UpstreamError> {
        let url = format!("{}/v1/auth/token", self.config.base_url);
        let payload = serde_json::json!({ "csesidx": self.credentials.csesidx });
        let request = self
            .http
            .post(url)
            .header(COOKIE, self.cookie_header()?)
            .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
            .body(payload.to_string());

        let (status, body) = unary_call(request, self.config.unary_timeout)
            .await
            .map_err(|err| UpstreamError::Auth(format!("token fetch failed: {err}")))?;
        if !status.is_success() {
            return Err(UpstreamError::Auth(format!(
                "token fetch status {status}: {}",
                String::from_utf8_lossy(&body)
            )));
        }

        let raw: serde_json::Value = serde_json::from_slice(&body)
            .map_err(|err| UpstreamError::Auth(format!("token fetch body invalid: {err}")))?;
        let token = raw
            .get("token")
            .and_then(|v| v.as_str())
            .ok_or_else(|| UpstreamError::Auth("token response missing token".to_string()))?
            .to_string();
        let key_id = raw
            .get("keyId")
            .and_then(|v| v.as_str())
            .ok_or_else(|| UpstreamError::Auth("token response missing keyId".to_string()))?
            .to_string();
        let expires_at = raw
            .get("expireTime")
            .and_then(|v| v.as_str())
            .and_then(|v| OffsetDateTime::parse(v, &Rfc3339).ok())
            .ok_or_else(|| UpstreamError::Auth("token response missing expireTime".to_string()))?;

        Ok(ServerToken {
            token,
            key_id,
            expires_at,
        })
    }

    /// Create an upstream session; returns the opaque session name.
    pub async fn create_session(&self) -> Result<String, UpstreamError> {
        let bearer = self.bearer().await?;
        let url = format!("{}/v1/sessions", self.config.base_url);
        let request = self
            .http
            .post(url)
            .header(AUTHORIZATION, self.bearer_header(&bearer)?)
            .header(COOKIE, self.cookie_header()?)
            .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
            .body("{}");

        let (status, body) = unary_call(request, self.config.unary_timeout).await?;
        if !status.is_success() {
            return Err(UpstreamError::from_status(
                status,
                &String::from_utf8_lossy(&body),
            ));
        }

        let raw: serde_json::Value = serde_json::from_slice(&body)
            .map_err(|err| UpstreamError::Protocol(format!("create session body: {err}")))?;
        raw.get("name")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| {
                UpstreamError::Protocol("create session response missing name".to_string())
            })
    }

    /// Issue the streaming assist call, invoking `on_frame` for every
    /// object the incremental parser completes. Per-object parse failures
    /// are logged and skipped; broken top-level framing fails the call.
    /// Returning `false` from the callback abandons the rest of the
    /// stream (caller disconnect).
    pub async fn stream_assist(
        &self,
        session: &str,
        query: &str,
        model_id: Option<&str>,
        timeout: Duration,
        mut on_frame: impl FnMut(AssistFrame) -> bool,
    ) -> Result<AssistOutcome, UpstreamError> {
        let bearer = self.bearer().await?;
        let url = format!("{}/v1/{session}:streamAssist", self.config.base_url);
        let request = StreamAssistRequest {
            query: AssistQuery {
                text: query.to_string(),
            },
            session: session.to_string(),
            assist_skipping_mode: None,
            answer_generation_spec: model_id.map(|model_id| AnswerGenerationSpec {
                model_id: model_id.to_string(),
            }),
        };
        let body = serde_json::to_vec(&request)
            .map_err(|err| UpstreamError::Protocol(format!("request encode: {err}")))?;

        let request = self
            .http
            .post(url)
            .header(AUTHORIZATION, self.bearer_header(&bearer)?)
            .header(COOKIE, self.cookie_header()?)
            .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
            .header(SERVER_TIMEOUT_HEADER, timeout.as_secs().to_string())
            .body(body);

        // The deadline covers the whole exchange, headers through the last
        // body byte.
        let drain = async {
            let response = request.send().await.map_err(transport_error)?;
            let status = response.status();
            if !status.is_success() {
                let text = response.text().await.unwrap_or_default();
                return Err(UpstreamError::from_status(status, &text));
            }

            let mut parser = JsonArrayStream::new();
            let mut outcome = AssistOutcome::default();
            let mut stream = response.bytes_stream();
            let mut abandoned = false;
            'chunks: while let Some(chunk) = stream.next().await {
                let chunk = chunk.map_err(transport_error)?;
                for raw in parser.push_bytes(&chunk) {
                    match serde_json::from_str::<AssistFrame>(&raw) {
                        Ok(frame) => {
                            if let Some(state) = frame.answer_state() {
                                outcome.state = Some(state.to_string());
                            }
                            if let Some(name) = frame.session_name() {
                                outcome.session = Some(name.to_string());
                            }
                            if !on_frame(frame) {
                                // Caller is gone; unread bytes are dropped.
                                abandoned = true;
                                break 'chunks;
                            }
                        }
                        Err(err) => {
                            warn!(error = %err, "skipping unparsable stream object");
                        }
                    }
                }
                if parser.is_finished() {
                    break;
                }
            }

            if !abandoned {
                if !parser.has_started() {
                    return Err(UpstreamError::Protocol(
                        "response is not a JSON array".to_string(),
                    ));
                }
                if !parser.is_finished() {
                    return Err(UpstreamError::Protocol(
                        "stream ended before the array closed".to_string(),
                    ));
                }
            }
            Ok(outcome)
        };

        tokio::time::timeout(timeout, drain)
            .await
            .map_err(|_| timeout_error(timeout))?
    }

    /// Buffered variant of [`UpstreamClient::stream_assist`]: all frames
    /// at once.
    pub async fn send_message(
        &self,
        session: &str,
        query: &str,
        model_id: Option<&str>,
    ) -> Result<(Vec<AssistFrame>, AssistOutcome), UpstreamError> {
        let mut frames = Vec::new();
        let outcome = self
            .stream_assist(
                session,
                query,
                model_id,
                self.config.unary_timeout,
                |frame| {
                    frames.push(frame);
                    true
                },
            )
            .await?;
        Ok((frames, outcome))
    }

    /// Metadata and base64 bytes of the most recently generated file in
    /// the session, if any.
    pub async fn latest_media(&self, session: &str) -> Result<Option<InlineMedia>, UpstreamError> {
        let bearer = self.bearer().await?;
        let url = format!("{}/v1/{session}/files", self.config.base_url);
        let request = self
            .http
            .get(url)
            .header(AUTHORIZATION, self.bearer_header(&bearer)?)
            .header(COOKIE, self.cookie_header()?);

        let (status, body) = unary_call(request, self.config.unary_timeout).await?;
        if !status.is_success() {
            return Err(UpstreamError::from_status(
                status,
                &String::from_utf8_lossy(&body),
            ));
        }

        let raw: serde_json::Value = serde_json::from_slice(&body)
            .map_err(|err| UpstreamError::Protocol(format!("file list body: {err}")))?;
        // Upstream lists newest first.
        let Some(file) = raw
            .get("files")
            .and_then(|v| v.as_array())
            .and_then(|v| v.first())
        else {
            return Ok(None);
        };
        let Some(name) = file.get("name").and_then(|v| v.as_str()) else {
            return Ok(None);
        };
        let mime_type = file
            .get("mimeType")
            .and_then(|v| v.as_str())
            .unwrap_or("image/png")
            .to_string();

        let url = format!("{}/v1/{name}:download?alt=base64", self.config.base_url);
        let request = self
            .http
            .get(url)
            .header(AUTHORIZATION, self.bearer_header(&bearer)?)
            .header(COOKIE, self.cookie_header()?);

        let (status, body) = unary_call(request, self.config.unary_timeout).await?;
        if !status.is_success() {
            return Err(UpstreamError::from_status(
                status,
                &String::from_utf8_lossy(&body),
            ));
        }
        let raw: serde_json::Value = serde_json::from_slice(&body)
            .map_err(|err| UpstreamError::Protocol(format!("file download body: {err}")))?;
        let data = raw
            .get("data")
            .and_then(|v| v.as_str())
            .ok_or_else(|| UpstreamError::Protocol("file download missing data".to_string()))?
            .to_string();

        Ok(Some(InlineMedia { mime_type, data }))
    }

    fn bearer_header(&self, bearer: &str) -> Result<HeaderValue, UpstreamError> {
        HeaderValue::from_str(&format!("Bearer {bearer}"))
            .map_err(|_| UpstreamError::Auth("bearer token is not a valid header".to_string()))
    }

    fn cookie_header(&self) -> Result<HeaderValue, UpstreamError> {
        HeaderValue::from_str(&self.credentials.cookies)
            .map_err(|_| UpstreamError::Auth("cookie bag is not a valid header".to_string()))
    }
}

/// Send a request and read the whole body under one deadline.
async fn unary_call(
    request: wreq::RequestBuilder,
    timeout: Duration,
) -> Result<(http::StatusCode, bytes::Bytes), UpstreamError> {
    let call = async {
        let response = request.send().await.map_err(transport_error)?;
        let status = response.status();
        let body = response.bytes().await.map_err(transport_error)?;
        Ok((status, body))
    };
    tokio::time::timeout(timeout, call)
        .await
        .map_err(|_| timeout_error(timeout))?
}

fn timeout_error(timeout: Duration) -> UpstreamError {
    UpstreamError::Transport(format!("timed out after {}s", timeout.as_secs()))
}

fn transport_error(err: wreq::Error) -> UpstreamError {
    if err.is_timeout() {
        UpstreamError::Transport(format!("timeout: {err}"))
    } else {
        UpstreamError::Transport(err.to_string())
    }
}
