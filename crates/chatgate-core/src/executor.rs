use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, mpsc};
use tracing::{info, warn};

use chatgate_common::GatewayConfig;
use chatgate_protocol::gemini::request::GenerateContentRequestBody;
use chatgate_protocol::gemini::response::{GenerateContentResponse, ResponsePart};
use chatgate_protocol::gemini::types::{FinishReason, Modality, UsageMetadata};
use chatgate_scheduler::{AttemptError, ProviderScheduler};
use chatgate_storage::{NewRequestLog, ProviderRecord, SessionRecord, Storage};
use chatgate_upstream::{AssistOutcome, ClientCache, UpstreamClient, UpstreamCredentials};

use crate::error::GatewayError;
use crate::models::ModelTable;
use crate::session::SessionMatcher;
use crate::tokens::estimate_tokens;

/// Generated files trail the answer slightly; wait this long before
/// fetching media on the streaming path.
const MEDIA_FETCH_GRACE: Duration = Duration::from_secs(2);

pub type ChunkSender = mpsc::UnboundedSender<GenerateContentResponse>;

#[derive(Debug, Clone)]
pub struct GenerateInput {
    pub trace_id: String,
    pub user_id: i64,
    pub api_key_id: i64,
    /// Public model name from the path, `models/` prefix allowed.
    pub model: String,
    pub body: GenerateContentRequestBody,
}

/// State shared across retry attempts of one request.
#[derive(Debug, Default)]
struct AttemptState {
    session: Option<SessionRecord>,
    provider_id: Option<i64>,
    /// Once chunks left the building we cannot substitute providers.
    emitted_any: bool,
}

/// Orchestrates one public-API call: scheduler acquisition, session
/// matching, upstream invocation, response reshaping, and logging.
pub struct RequestExecutor {
    storage: Arc<dyn Storage>,
    scheduler: Arc<ProviderScheduler>,
    matcher: Arc<SessionMatcher>,
    clients: Arc<ClientCache>,
    models: Arc<ModelTable>,
    config: Arc<GatewayConfig>,
}

impl RequestExecutor {
    pub fn new(
        storage: Arc<dyn Storage>,
        scheduler: Arc<ProviderScheduler>,
        matcher: Arc<SessionMatcher>,
        clients: Arc<ClientCache>,
        models: Arc<ModelTable>,
        config: Arc<GatewayConfig>,
    ) -> Self {
        Self {
            storage,
            scheduler,
            matcher,
            clients,
            models,
            config,
        }
    }

    pub fn models(&self) -> &ModelTable {
        &self.models
    }

    /// Unary generation.
    pub async fn generate(
        &self,
        input: GenerateInput,
    ) -> Result<GenerateContentResponse, GatewayError> {
        let started = Instant::now();
        let model = self.models.public_name(&input.model).to_string();
        let state = Arc::new(Mutex::new(AttemptState::default()));

        let result = self.generate_unary(&input, &model, &state).await;

        let (status, output_tokens, error) = match &result {
            Ok((_, output_tokens)) => (200, *output_tokens, None),
            Err(err) => (err.status_code(), 0, Some(err.to_string())),
        };
        self.write_log(&input, &model, "generate", started, &state, status, output_tokens, error)
            .await;
        result.map(|(response, _)| response)
    }

    /// Streaming generation. Chunks go to `sink` in upstream order; the
    /// terminal `[DONE]` framing is the transport's concern.
    pub async fn stream_generate(
        &self,
        input: GenerateInput,
        sink: ChunkSender,
    ) -> Result<(), GatewayError> {
        let started = Instant::now();
        let model = self.models.public_name(&input.model).to_string();
        let state = Arc::new(Mutex::new(AttemptState::default()));

        let result = self.generate_streaming(&input, &model, &state, sink).await;

        let (status, output_tokens, error) = match &result {
            Ok(output_tokens) => (200, *output_tokens, None),
            Err(err) => (err.status_code(), 0, Some(err.to_string())),
        };
        self.write_log(
            &input,
            &model,
            "stream_generate",
            started,
            &state,
            status,
            output_tokens,
            error,
        )
        .await;
        result.map(|_| ())
    }

    async fn generate_unary(
        &self,
        input: &GenerateInput,
        model: &str,
        state: &Arc<Mutex<AttemptState>>,
    ) -> Result<(GenerateContentResponse, u32), GatewayError> {
        let query = validate(&input.body)?;
        let include_thoughts = input.body.include_thoughts();
        let wants_media = self.wants_media(&input.body, &query);
        let upstream_model = self.models.upstream_id(&input.model).to_string();
        let prompt_tokens = estimate_tokens(&prompt_text(&input.body));

        let result = self
            .scheduler
            .with_retry(None, |provider, _attempt| {
                let state = state.clone();
                let query = query.clone();
                let upstream_model = upstream_model.clone();
                let model = model.to_string();
                async move {
                    self.unary_attempt(
                        provider,
                        state,
                        input,
                        query,
                        upstream_model,
                        model,
                        include_thoughts,
                        wants_media,
                        prompt_tokens,
                    )
                    .await
                }
            })
            .await;
        result.map_err(GatewayError::from)
    }

    #[allow(clippy::too_many_arguments)]
    async fn unary_attempt(
        &self,
        provider: ProviderRecord,
        state: Arc<Mutex<AttemptState>>,
        input: &GenerateInput,
        query: String,
        upstream_model: String,
        model: String,
        include_thoughts: bool,
        wants_media: bool,
        prompt_tokens: u32,
    ) -> Result<(GenerateContentResponse, u32), AttemptError<GatewayError>> {
        let session = self
            .resolve_session(&provider, &state, input)
            .await
            .map_err(classify)?;
        let client = self.client_for(&provider).await;
        let upstream_session = self
            .ensure_upstream_session(&client, &session, &state)
            .await?;

        let (frames, outcome) = client
            .send_message(&upstream_session, &query, Some(&upstream_model))
            .await
            .map_err(|err| classify(err.into()))?;

        let mut thoughts: Vec<String> = Vec::new();
        let mut content = String::new();
        for frame in &frames {
            for piece in frame.pieces() {
                if piece.thought {
                    thoughts.push(piece.text);
                } else {
                    content.push_str(&piece.text);
                }
            }
        }

        let mut emitted_text = thoughts.concat();
        emitted_text.push_str(&content);
        let output_tokens = estimate_tokens(&emitted_text);

        let mut parts: Vec<ResponsePart> = Vec::new();
        if include_thoughts {
            parts.extend(thoughts.iter().map(ResponsePart::thought));
        }
        if !content.is_empty() {
            parts.push(ResponsePart::text(content));
        }
        if wants_media {
            match client.latest_media(&upstream_session).await {
                Ok(Some(media)) => {
                    parts.push(ResponsePart::inline_data(media.mime_type, media.data));
                }
                Ok(None) => {}
                Err(err) => {
                    // The answer is intact; a missing image is not worth
                    // failing the request.
                    warn!(error = %err, "media fetch failed");
                }
            }
        }

        self.matcher
            .record_message(session.id)
            .await
            .map_err(AttemptError::Fatal)?;

        let usage = UsageMetadata {
            prompt_token_count: prompt_tokens,
            candidates_token_count: output_tokens,
            total_token_count: prompt_tokens + output_tokens,
        };
        let response = GenerateContentResponse::chunk(
            model,
            parts,
            Some(finish_reason(&outcome)),
            Some(usage),
        );
        Ok((response, output_tokens))
    }

    async fn generate_streaming(
        &self,
        input: &GenerateInput,
        model: &str,
        state: &Arc<Mutex<AttemptState>>,
        sink: ChunkSender,
    ) -> Result<u32, GatewayError> {
        let query = validate(&input.body)?;
        let include_thoughts = input.body.include_thoughts();
        let wants_media = self.wants_media(&input.body, &query);
        let upstream_model = self.models.upstream_id(&input.model).to_string();
        let prompt_tokens = estimate_tokens(&prompt_text(&input.body));

        let result = self
            .scheduler
            .with_retry(None, |provider, _attempt| {
                let state = state.clone();
                let sink = sink.clone();
                let query = query.clone();
                let upstream_model = upstream_model.clone();
                let model = model.to_string();
                async move {
                    self.stream_attempt(
                        provider,
                        state,
                        sink,
                        input,
                        query,
                        upstream_model,
                        model,
                        include_thoughts,
                        wants_media,
                        prompt_tokens,
                    )
                    .await
                }
            })
            .await;
        result.map_err(GatewayError::from)
    }

    #[allow(clippy::too_many_arguments)]
    async fn stream_attempt(
        &self,
        provider: ProviderRecord,
        state: Arc<Mutex<AttemptState>>,
        sink: ChunkSender,
        input: &GenerateInput,
        query: String,
        upstream_model: String,
        model: String,
        include_thoughts: bool,
        wants_media: bool,
        prompt_tokens: u32,
    ) -> Result<u32, AttemptError<GatewayError>> {
        let session = self
            .resolve_session(&provider, &state, input)
            .await
            .map_err(classify)?;
        let client = self.client_for(&provider).await;
        let upstream_session = self
            .ensure_upstream_session(&client, &session, &state)
            .await?;

        let mut emitted = String::new();
        let mut delivered_content = false;
        let mut cancelled = false;

        let stream_result = client
            .stream_assist(
                &upstream_session,
                &query,
                Some(&upstream_model),
                self.config.stream_timeout,
                |frame| {
                    for piece in frame.pieces() {
                        if piece.thought && !include_thoughts {
                            continue;
                        }
                        let part = if piece.thought {
                            ResponsePart::thought(&piece.text)
                        } else {
                            ResponsePart::text(&piece.text)
                        };
                        let chunk =
                            GenerateContentResponse::chunk(model.clone(), vec![part], None, None);
                        if sink.send(chunk).is_err() {
                            cancelled = true;
                            return false;
                        }
                        emitted.push_str(&piece.text);
                        if !piece.thought {
                            delivered_content = true;
                        }
                    }
                    true
                },
            )
            .await;

        if !emitted.is_empty() {
            state.lock().await.emitted_any = true;
        }

        let outcome = match stream_result {
            Ok(outcome) => outcome,
            Err(err) => {
                let err = GatewayError::from(err);
                // Chunks already reached the caller: substituting the
                // provider would replay the answer from the start.
                if state.lock().await.emitted_any {
                    return Err(AttemptError::Fatal(err));
                }
                return Err(classify(err));
            }
        };

        if cancelled {
            if delivered_content {
                self.matcher
                    .record_message(session.id)
                    .await
                    .map_err(AttemptError::Fatal)?;
            }
            return Ok(estimate_tokens(&emitted));
        }

        let output_tokens = estimate_tokens(&emitted);
        let usage = UsageMetadata {
            prompt_token_count: prompt_tokens,
            candidates_token_count: output_tokens,
            total_token_count: prompt_tokens + output_tokens,
        };
        let terminal = GenerateContentResponse::chunk(
            model.clone(),
            vec![ResponsePart::text("")],
            Some(finish_reason(&outcome)),
            Some(usage),
        );
        let _ = sink.send(terminal);

        if wants_media {
            tokio::time::sleep(MEDIA_FETCH_GRACE).await;
            match client.latest_media(&upstream_session).await {
                Ok(Some(media)) => {
                    let chunk = GenerateContentResponse::chunk(
                        model,
                        vec![ResponsePart::inline_data(media.mime_type, media.data)],
                        Some(FinishReason::Stop),
                        None,
                    );
                    let _ = sink.send(chunk);
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(error = %err, "media fetch failed");
                }
            }
        }

        self.matcher
            .record_message(session.id)
            .await
            .map_err(AttemptError::Fatal)?;
        Ok(output_tokens)
    }

    /// Match the conversation to a session for this provider, migrating
    /// the previous attempt's session when the provider changed.
    async fn resolve_session(
        &self,
        provider: &ProviderRecord,
        state: &Arc<Mutex<AttemptState>>,
        input: &GenerateInput,
    ) -> Result<SessionRecord, GatewayError> {
        let previous = state.lock().await.session.take();
        let session = match previous {
            Some(prev) if prev.provider_id != provider.id => {
                self.matcher.migrate_to(&prev, provider.id).await?
            }
            Some(prev) => prev,
            None => {
                self.matcher
                    .match_or_create(input.user_id, provider.id, input.body.contents.as_slice())
                    .await?
                    .session
            }
        };
        let mut guard = state.lock().await;
        guard.session = Some(session.clone());
        guard.provider_id = Some(provider.id);
        Ok(session)
    }

    async fn client_for(&self, provider: &ProviderRecord) -> Arc<UpstreamClient> {
        self.clients
            .client_for(UpstreamCredentials {
                provider_id: provider.id,
                csesidx: provider.csesidx.clone(),
                cookies: provider.cookies.clone(),
            })
            .await
    }

    async fn ensure_upstream_session(
        &self,
        client: &Arc<UpstreamClient>,
        session: &SessionRecord,
        state: &Arc<Mutex<AttemptState>>,
    ) -> Result<String, AttemptError<GatewayError>> {
        if let Some(name) = &session.upstream_session_id {
            return Ok(name.clone());
        }
        let name = client
            .create_session()
            .await
            .map_err(|err| classify(err.into()))?;
        self.matcher
            .set_upstream_session(session.id, &name)
            .await
            .map_err(AttemptError::Fatal)?;
        let mut guard = state.lock().await;
        if let Some(session) = guard.session.as_mut() {
            session.upstream_session_id = Some(name.clone());
        }
        Ok(name)
    }

    fn wants_media(&self, body: &GenerateContentRequestBody, query: &str) -> bool {
        media_requested(body, query, &self.config.media_keywords)
    }

    #[allow(clippy::too_many_arguments)]
    async fn write_log(
        &self,
        input: &GenerateInput,
        model: &str,
        kind: &str,
        started: Instant,
        state: &Arc<Mutex<AttemptState>>,
        status_code: u16,
        output_tokens: u32,
        error: Option<String>,
    ) {
        let (provider_id, session_id) = {
            let guard = state.lock().await;
            (guard.provider_id, guard.session.as_ref().map(|s| s.id))
        };
        let latency_ms = started.elapsed().as_millis() as i64;
        let input_tokens = estimate_tokens(&prompt_text(&input.body));

        info!(
            event = "generate_finished",
            trace_id = %input.trace_id,
            kind,
            model,
            status = status_code,
            provider_id = ?provider_id,
            elapsed_ms = latency_ms,
        );

        let log = NewRequestLog {
            trace_id: Some(input.trace_id.clone()),
            user_id: input.user_id,
            api_key_id: input.api_key_id,
            provider_id,
            session_id,
            model: model.to_string(),
            kind: kind.to_string(),
            input_tokens: i64::from(input_tokens),
            output_tokens: i64::from(output_tokens),
            latency_ms,
            status_code: i32::from(status_code),
            error,
        };
        if let Err(err) = self.storage.append_request_log(log).await {
            warn!(error = %err, "request log append failed");
        }
    }
}

fn validate(body: &GenerateContentRequestBody) -> Result<String, GatewayError> {
    if body.contents.is_empty() {
        return Err(GatewayError::InvalidRequest(
            "contents must not be empty".to_string(),
        ));
    }
    body.last_message_text()
        .ok_or_else(|| GatewayError::InvalidRequest("last message has no text".to_string()))
}

fn prompt_text(body: &GenerateContentRequestBody) -> String {
    body.contents
        .iter()
        .flat_map(|content| content.parts.iter())
        .filter_map(|part| part.text.as_deref())
        .collect::<Vec<_>>()
        .join("\n")
}

fn finish_reason(outcome: &AssistOutcome) -> FinishReason {
    match outcome.state.as_deref() {
        None => FinishReason::Stop,
        Some(state) if state == chatgate_protocol::assist::ANSWER_STATE_SUCCEEDED => {
            FinishReason::Stop
        }
        Some(_) => FinishReason::MaxTokens,
    }
}

/// Media is requested when the generation config lists an IMAGE modality
/// or any configured keyword substring appears in the query.
fn media_requested(body: &GenerateContentRequestBody, query: &str, keywords: &[String]) -> bool {
    if let Some(config) = &body.generation_config
        && let Some(modalities) = &config.response_modalities
        && modalities.contains(&Modality::Image)
    {
        return true;
    }
    let lowered = query.to_lowercase();
    keywords
        .iter()
        .any(|keyword| !keyword.is_empty() && lowered.contains(&keyword.to_lowercase()))
}

fn classify(err: GatewayError) -> AttemptError<GatewayError> {
    if err.is_recoverable() {
        AttemptError::Retry(err)
    } else {
        AttemptError::Fatal(err)
    }
}
