//! The LLM endpoints: chat completions (streaming and not), legacy
//! completions, and embeddings.
//!
//! Shared pipeline per request: parse → alias resolve → allowlist →
//! cost estimate → budget admission → TPM pre-reservation →
//! max-parallel slot → routed dispatch with retries → accounting
//! (usage enqueue, event emit, Prometheus, cached-spend increment).

use axum::Extension;
use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::header;
use axum::response::{IntoResponse, Response};
use pllm_budget::{AdmissionDecision, estimate_cost};
use pllm_core::error::{AdapterError, GatewayError};
use pllm_core::openai::{
    ChatCompletionRequest, ChatCompletionResponse, CompletionRequest, CompletionResponse,
    EmbeddingRequest, EmbeddingResponse, Usage,
};
use pllm_core::principal::Principal;
use pllm_core::usage::{RequestEvent, UsageRecord};
use pllm_routing::Selection;
use serde::de::DeserializeOwned;
use std::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use crate::middleware::{ApiError, RequestId};
use crate::state::SharedState;

/// Everything the accounting tail needs about a request.
struct RequestScope {
    request_id: String,
    principal: Principal,
    /// Logical model as requested (post-alias).
    model: String,
    path: &'static str,
    input_estimate: u32,
    estimated_cost: f64,
    started: Instant,
}

impl RequestScope {
    fn key_type(&self) -> String {
        match self.principal.kind {
            pllm_core::principal::PrincipalKind::Master => "master".into(),
            pllm_core::principal::PrincipalKind::Jwt => "jwt".into(),
            pllm_core::principal::PrincipalKind::System => "system".into(),
            pllm_core::principal::PrincipalKind::Key => "api".into(),
        }
    }
}

fn parse_body<T: DeserializeOwned>(body: &Bytes) -> Result<T, ApiError> {
    serde_json::from_slice(body)
        .map_err(|e| ApiError(GatewayError::InvalidRequest(e.to_string())))
}

/// Admission, allowlist, and per-key concurrency checks shared by every
/// LLM endpoint. Returns the scope handed to the accounting tail.
async fn admit(
    state: &SharedState,
    principal: Principal,
    request_id: String,
    model: String,
    path: &'static str,
    input_estimate: u32,
    max_tokens: Option<u32>,
) -> Result<RequestScope, ApiError> {
    if !principal.is_model_allowed(&model) {
        return Err(ApiError(GatewayError::Forbidden(format!(
            "model '{model}' is not allowed for this key"
        ))));
    }

    let rates = match &state.pricing_mirror {
        Some(mirror) => mirror
            .get(&model)
            .await
            .map(|e| (e.input_cost_per_token, e.output_cost_per_token)),
        None => state.pricing.rates(&model),
    };
    let estimated_cost = estimate_cost(input_estimate, max_tokens, rates);

    // Budget admission: master skips entirely; missing Redis fails open.
    if !principal.is_master() {
        if let Some(budget) = &state.budget {
            let entities = principal.budget_entities();
            let (decision, denied_entity) = budget.check_entities(&entities, estimated_cost).await;
            match decision {
                AdmissionDecision::Deny => {
                    let (entity_type, entity_id) = denied_entity
                        .unwrap_or_else(|| ("unknown".to_string(), "unknown".to_string()));
                    return Err(ApiError(GatewayError::BudgetExceeded(format!(
                        "{entity_type} {entity_id}"
                    ))));
                }
                AdmissionDecision::Throttle => {
                    // Deterministic throttle: a second debit halves the
                    // effective request rate for the entity.
                    if let Some(key_id) = principal.rate_limit_key() {
                        if !state
                            .rate_limiter
                            .allow(&format!("key:{key_id}"), principal.limits.rpm)
                        {
                            return Err(ApiError(GatewayError::RateLimited {
                                retry_after: Some(state.config.rate_limit.window_secs),
                            }));
                        }
                    }
                }
                AdmissionDecision::Allow => {}
            }
        }

        // TPM pre-reservation: input estimate plus the output ceiling.
        if let (Some(tpm), Some(key_id)) = (principal.limits.tpm, principal.rate_limit_key()) {
            let reserve = input_estimate + max_tokens.unwrap_or(0);
            if !state
                .rate_limiter
                .allow_n(&format!("tokens:{key_id}"), reserve, Some(tpm))
            {
                return Err(ApiError(GatewayError::RateLimited {
                    retry_after: Some(state.config.rate_limit.window_secs),
                }));
            }
        }
    }

    // max_parallel slot, released by the accounting tail.
    if let (Some(max_parallel), Some(key_id)) =
        (principal.limits.max_parallel, principal.key_id.as_deref())
    {
        if !state.try_begin_key_request(key_id, max_parallel) {
            return Err(ApiError(GatewayError::RateLimited { retry_after: Some(1) }));
        }
    }

    Ok(RequestScope {
        request_id,
        principal,
        model,
        path,
        input_estimate,
        estimated_cost,
        started: Instant::now(),
    })
}

/// The accounting tail, shared by success and failure paths.
///
/// Releases the per-key slot, records the routed outcome, enqueues the
/// usage record, emits the metrics event, and bumps the cached spend.
fn finish(
    state: &SharedState,
    scope: RequestScope,
    selection: Option<&Selection>,
    usage: Usage,
    status: u16,
    retries: u32,
    error: Option<&AdapterError>,
) {
    let latency = scope.started.elapsed();

    if let (Some(_), Some(key_id)) =
        (scope.principal.limits.max_parallel, scope.principal.key_id.as_deref())
    {
        state.end_key_request(key_id);
    }

    let total_tokens = usage.prompt_tokens + usage.completion_tokens;

    if let Some(selection) = selection {
        let outcome = match error {
            None => Ok(total_tokens),
            Some(err) => Err(err),
        };
        state.router.record_outcome(selection, outcome, latency);
    }

    let (provider, instance_id, provider_model, resolved_model) = match selection {
        Some(s) => (
            s.instance.spec.provider,
            s.instance.spec.id.clone(),
            s.instance.spec.upstream_model.clone(),
            s.resolved_model.clone(),
        ),
        None => (
            pllm_core::instance::ProviderType::Openai,
            String::new(),
            scope.model.clone(),
            scope.model.clone(),
        ),
    };

    let cost = state
        .pricing
        .calculate_cost(&resolved_model, usage.prompt_tokens, usage.completion_tokens)
        .map(|c| c.total)
        .unwrap_or(0.0);

    state.metrics.request_finished(
        &resolved_model,
        &provider.to_string(),
        status,
        usage.prompt_tokens,
        usage.completion_tokens,
        cost,
        latency.as_secs_f64(),
    );

    let event = RequestEvent {
        request_id: scope.request_id.clone(),
        timestamp: chrono::Utc::now(),
        model: resolved_model.clone(),
        provider,
        user_id: scope.principal.user_id.clone(),
        team_id: scope.principal.team_id.clone(),
        input_tokens: usage.prompt_tokens,
        output_tokens: usage.completion_tokens,
        cost,
        latency_ms: latency.as_millis() as u64,
        success: error.is_none() && status < 400,
        cache_hit: false,
        error_type: error.map(|e| e.to_string()),
    };
    if let Some(events) = &state.events {
        events.emit_detached(event);
    }

    // Usage rows are only written for requests that reached an instance.
    if selection.is_none() {
        return;
    }

    let key_type = scope.key_type();
    let record = UsageRecord {
        request_id: scope.request_id,
        timestamp: chrono::Utc::now(),
        model: resolved_model,
        provider,
        instance_id,
        route_slug: None,
        provider_model,
        key_id: scope.principal.key_id.clone(),
        key_type,
        user_id: scope.principal.user_id.clone(),
        actual_user_id: scope.principal.user_id.clone(),
        team_id: scope.principal.team_id.clone(),
        method: "POST".into(),
        path: scope.path.to_string(),
        status_code: status,
        input_tokens: usage.prompt_tokens,
        output_tokens: usage.completion_tokens,
        total_tokens,
        cost,
        estimated_cost: scope.estimated_cost,
        latency_ms: latency.as_millis() as u64,
        retries,
    };

    let entities: Vec<(String, String)> = scope
        .principal
        .budget_entities()
        .into_iter()
        .map(|(t, id)| (t.to_string(), id.to_string()))
        .collect();

    let usage_queue = state.usage_queue.clone();
    let budget = state.budget.clone();
    tokio::spawn(async move {
        if let Some(queue) = usage_queue {
            if let Err(e) = queue.enqueue(record).await {
                warn!(error = %e, "usage enqueue failed");
            }
        }
        if let (Some(budget), true) = (budget, cost > 0.0) {
            for (entity_type, entity_id) in entities {
                if let Err(e) = budget.increment_spent(&entity_type, &entity_id, cost).await {
                    debug!(error = %e, "cached spend increment failed");
                }
            }
        }
    });
}

/// `POST /v1/chat/completions`
pub async fn chat_completions(
    State(state): State<SharedState>,
    Extension(principal): Extension<Principal>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let request: ChatCompletionRequest = parse_body(&body)?;
    if request.messages.is_empty() {
        return Err(ApiError(GatewayError::InvalidRequest("messages must not be empty".into())));
    }

    let model = state.config.resolve_alias(&request.model).to_string();
    let input_estimate = request.estimate_input_tokens();
    state.metrics.request_started();

    let scope = match admit(
        &state,
        principal,
        request_id,
        model.clone(),
        "/v1/chat/completions",
        input_estimate,
        request.max_tokens,
    )
    .await
    {
        Ok(scope) => scope,
        Err(err) => {
            state.metrics.request_finished(&model, "none", err.0.status(), 0, 0, 0.0, 0.0);
            return Err(err);
        }
    };

    if request.stream {
        chat_stream(state, scope, request).await
    } else {
        chat_blocking(state, scope, request).await
    }
}

async fn chat_blocking(
    state: SharedState,
    scope: RequestScope,
    request: ChatCompletionRequest,
) -> Result<Response, ApiError> {
    let result = state
        .router
        .execute(&scope.model, |selection| {
            let request = request.clone();
            let adapter = selection.instance.adapter.clone();
            let semaphore = state.provider_semaphore(selection.instance.spec.provider);
            Box::pin(async move {
                let _permit = semaphore
                    .acquire()
                    .await
                    .map_err(|_| AdapterError::Network("server shutting down".into()))?;
                adapter.chat_completion(&request).await
            })
        })
        .await;

    match result {
        Ok((response, selection, retries)) => {
            let usage = response.usage.unwrap_or(Usage {
                prompt_tokens: scope.input_estimate,
                completion_tokens: estimate_output(&response),
                total_tokens: 0,
            });
            finish(&state, scope, Some(&selection), usage, 200, retries, None);
            Ok(axum::Json(response).into_response())
        }
        Err(route_err) => {
            finish(&state, scope, None, Usage::default(), 502, 0, None);
            Err(ApiError(route_err.into()))
        }
    }
}

fn estimate_output(response: &ChatCompletionResponse) -> u32 {
    let chars: usize = response
        .choices
        .iter()
        .filter_map(|c| c.message.content.as_deref())
        .map(str::len)
        .sum();
    (chars / 4) as u32
}

async fn chat_stream(
    state: SharedState,
    scope: RequestScope,
    request: ChatCompletionRequest,
) -> Result<Response, ApiError> {
    // Retries only before the first byte: once the receiver exists the
    // response status is committed.
    let result = state
        .router
        .execute(&scope.model, |selection| {
            let request = request.clone();
            let adapter = selection.instance.adapter.clone();
            let semaphore = state.provider_semaphore(selection.instance.spec.provider);
            Box::pin(async move {
                // Streams hold their permit only for connection setup;
                // concurrency during the stream is bounded per key.
                let _permit = semaphore
                    .acquire()
                    .await
                    .map_err(|_| AdapterError::Network("server shutting down".into()))?;
                adapter.chat_completion_stream(&request).await
            })
        })
        .await;

    let (mut chunks, selection, retries) = match result {
        Ok(ok) => ok,
        Err(route_err) => {
            finish(&state, scope, None, Usage::default(), 502, 0, None);
            return Err(ApiError(route_err.into()));
        }
    };

    let (tx, body_rx) = tokio::sync::mpsc::channel::<Result<Bytes, std::convert::Infallible>>(64);
    let input_estimate = scope.input_estimate;

    tokio::spawn(async move {
        let mut usage: Option<Usage> = None;
        let mut output_chars = 0usize;
        let mut stream_error: Option<AdapterError> = None;
        let mut client_gone = false;

        while let Some(item) = chunks.recv().await {
            match item {
                Ok(chunk) => {
                    if let Some(u) = chunk.usage {
                        usage = Some(u);
                    }
                    for choice in &chunk.choices {
                        if let Some(content) = &choice.delta.content {
                            output_chars += content.len();
                        }
                    }
                    let json = match serde_json::to_string(&chunk) {
                        Ok(json) => json,
                        Err(_) => continue,
                    };
                    if tx.send(Ok(Bytes::from(format!("data: {json}\n\n")))).await.is_err() {
                        // Client disconnected: dropping `chunks` below
                        // cancels the upstream read.
                        client_gone = true;
                        break;
                    }
                }
                Err(err) => {
                    // Mid-stream failure becomes a trailing error record;
                    // the 200 status is already on the wire.
                    let body = serde_json::json!({
                        "error": {
                            "message": err.to_string(),
                            "type": "api_error",
                            "code": "upstream_error",
                        }
                    });
                    let _ = tx.send(Ok(Bytes::from(format!("data: {body}\n\n")))).await;
                    stream_error = Some(err);
                    break;
                }
            }
        }
        drop(chunks);

        if stream_error.is_none() && !client_gone {
            let _ = tx.send(Ok(Bytes::from("data: [DONE]\n\n"))).await;
        }

        let usage = usage.unwrap_or(Usage {
            prompt_tokens: input_estimate,
            completion_tokens: (output_chars / 4) as u32,
            total_tokens: 0,
        });
        let canceled = AdapterError::Canceled;
        let error = match (&stream_error, client_gone) {
            (Some(err), _) => Some(err.clone()),
            (None, true) => Some(canceled),
            (None, false) => None,
        };
        finish(&state, scope, Some(&selection), usage, 200, retries, error.as_ref());
    });

    let body = Body::from_stream(ReceiverStream::new(body_rx));
    Ok(Response::builder()
        .status(200)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .body(body)
        .expect("static header set is valid"))
}

/// `POST /v1/completions`
pub async fn completions(
    State(state): State<SharedState>,
    Extension(principal): Extension<Principal>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let request: CompletionRequest = parse_body(&body)?;
    let model = state.config.resolve_alias(&request.model).to_string();

    let prompt_chars = match &request.prompt {
        pllm_core::openai::StringOrList::One(s) => s.len(),
        pllm_core::openai::StringOrList::Many(v) => v.iter().map(String::len).sum(),
    };
    let input_estimate = ((prompt_chars / 4).max(1)) as u32;

    state.metrics.request_started();
    let scope = match admit(
        &state,
        principal,
        request_id,
        model.clone(),
        "/v1/completions",
        input_estimate,
        request.max_tokens,
    )
    .await
    {
        Ok(scope) => scope,
        Err(err) => {
            state.metrics.request_finished(&model, "none", err.0.status(), 0, 0, 0.0, 0.0);
            return Err(err);
        }
    };

    let result = state
        .router
        .execute(&scope.model, |selection| {
            let request = request.clone();
            let adapter = selection.instance.adapter.clone();
            let semaphore = state.provider_semaphore(selection.instance.spec.provider);
            Box::pin(async move {
                let _permit = semaphore
                    .acquire()
                    .await
                    .map_err(|_| AdapterError::Network("server shutting down".into()))?;
                adapter.completion(&request).await
            })
        })
        .await;

    match result {
        Ok((response, selection, retries)) => {
            let usage = response.usage.unwrap_or(Usage {
                prompt_tokens: scope.input_estimate,
                completion_tokens: completion_output_estimate(&response),
                total_tokens: 0,
            });
            finish(&state, scope, Some(&selection), usage, 200, retries, None);
            Ok(axum::Json(response).into_response())
        }
        Err(route_err) => {
            finish(&state, scope, None, Usage::default(), 502, 0, None);
            Err(ApiError(route_err.into()))
        }
    }
}

fn completion_output_estimate(response: &CompletionResponse) -> u32 {
    let chars: usize = response.choices.iter().map(|c| c.text.len()).sum();
    (chars / 4) as u32
}

/// `POST /v1/embeddings`
pub async fn embeddings(
    State(state): State<SharedState>,
    Extension(principal): Extension<Principal>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let request: EmbeddingRequest = parse_body(&body)?;
    let model = state.config.resolve_alias(&request.model).to_string();

    let input_chars = match &request.input {
        pllm_core::openai::StringOrList::One(s) => s.len(),
        pllm_core::openai::StringOrList::Many(v) => v.iter().map(String::len).sum(),
    };
    let input_estimate = ((input_chars / 4).max(1)) as u32;

    state.metrics.request_started();
    let scope = match admit(
        &state,
        principal,
        request_id,
        model.clone(),
        "/v1/embeddings",
        input_estimate,
        // Embeddings produce no output tokens; reserve nothing extra.
        Some(0),
    )
    .await
    {
        Ok(scope) => scope,
        Err(err) => {
            state.metrics.request_finished(&model, "none", err.0.status(), 0, 0, 0.0, 0.0);
            return Err(err);
        }
    };

    let result = state
        .router
        .execute(&scope.model, |selection| {
            let request = request.clone();
            let adapter = selection.instance.adapter.clone();
            let semaphore = state.provider_semaphore(selection.instance.spec.provider);
            Box::pin(async move {
                let _permit = semaphore
                    .acquire()
                    .await
                    .map_err(|_| AdapterError::Network("server shutting down".into()))?;
                adapter.embeddings(&request).await
            })
        })
        .await;

    match result {
        Ok((response, selection, retries)) => {
            let usage = response.usage.unwrap_or(Usage {
                prompt_tokens: scope.input_estimate,
                completion_tokens: 0,
                total_tokens: 0,
            });
            finish(&state, scope, Some(&selection), usage, 200, retries, None);
            Ok(axum::Json(response).into_response())
        }
        Err(route_err) => {
            finish(&state, scope, None, Usage::default(), 502, 0, None);
            Err(ApiError(route_err.into()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pllm_core::principal::{EffectiveLimits, PrincipalKind};

    fn key_principal(allowed: &[&str]) -> Principal {
        Principal {
            kind: PrincipalKind::Key,
            user_id: Some("u1".into()),
            team_id: None,
            key_id: Some("k1".into()),
            allowed_models: allowed.iter().map(|s| s.to_string()).collect(),
            blocked_models: Vec::new(),
            limits: EffectiveLimits::default(),
            is_admin: false,
        }
    }

    #[tokio::test]
    async fn model_outside_allowlist_is_forbidden() {
        let state = crate::test_support::test_state();
        let err = admit(
            &state,
            key_principal(&["gpt-3.5-turbo"]),
            "req-1".into(),
            "gpt-4".into(),
            "/v1/chat/completions",
            10,
            Some(5),
        )
        .await
        .err()
        .expect("allowlist must reject");
        assert_eq!(err.0.code(), "forbidden");
        assert_eq!(err.0.status(), 403);
    }

    #[tokio::test]
    async fn max_parallel_slots_enforced_at_admission() {
        let state = crate::test_support::test_state();
        let mut principal = key_principal(&[]);
        principal.limits.max_parallel = Some(1);

        let first = admit(
            &state,
            principal.clone(),
            "req-1".into(),
            "gpt-4".into(),
            "/v1/chat/completions",
            10,
            Some(5),
        )
        .await;
        assert!(first.is_ok());

        let second = admit(
            &state,
            principal,
            "req-2".into(),
            "gpt-4".into(),
            "/v1/chat/completions",
            10,
            Some(5),
        )
        .await;
        assert_eq!(second.err().unwrap().0.status(), 429);
    }

    #[test]
    fn parse_body_rejects_malformed_json() {
        let err = parse_body::<ChatCompletionRequest>(&Bytes::from_static(b"{not json"))
            .err()
            .unwrap();
        assert_eq!(err.0.code(), "invalid_request");
    }

    #[test]
    fn output_estimate_counts_choice_content() {
        let response = ChatCompletionResponse {
            id: "x".into(),
            object: "chat.completion".into(),
            created: 0,
            model: "m".into(),
            choices: vec![pllm_core::openai::Choice {
                index: 0,
                message: pllm_core::openai::ChatMessage::assistant("a".repeat(40)),
                finish_reason: None,
            }],
            usage: None,
        };
        assert_eq!(estimate_output(&response), 10);
    }
}
