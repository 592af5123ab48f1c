use crate::catalog::{self, Catalog};
use axum::{
    Json, Router,
    body::Body,
    extract::{Path, Request, State},
    http::{StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use bytes::Bytes;
use futures::StreamExt;
use rotator::{
    BackgroundRefresher, CredentialManager, CredentialStore, ReauthCoordinator, RotatingClient,
    RotatorConfig, RotatorError,
};
use serde::Serialize;
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;

pub const DEFAULT_CREDENTIAL_DIR: &str = "./oauth_creds";

// ---------------------------------------------------------------------------
// App state
// ---------------------------------------------------------------------------

pub struct AppState {
    pub client: Arc<RotatingClient>,
    pub config: RotatorConfig,
    pub catalog: Catalog,
    pub providers: Vec<String>,
}

impl AppState {
    pub async fn new() -> anyhow::Result<Self> {
        let config = RotatorConfig::from_env();
        let store = Arc::new(CredentialStore::new(DEFAULT_CREDENTIAL_DIR));
        let reauth = Arc::new(ReauthCoordinator::new());

        let manager = CredentialManager::new(store, reauth);
        let registry = manager.discover_and_initialize().await;

        let mut builder = RotatingClient::builder().with_config(config.clone());
        for entry in &registry {
            tracing::info!(
                provider = %entry.provider,
                credentials = entry.credentials.len(),
                "provider registered"
            );
        }
        for entry in registry {
            builder = builder.with_provider(&entry.provider, entry.credentials);
        }
        let client = Arc::new(builder.build());

        if client.providers().is_empty() {
            tracing::warn!(
                "no provider credentials configured; the proxy is running but cannot serve LLM requests"
            );
        }

        let catalog = Catalog::new(&config);
        let providers = client.providers();

        Ok(Self {
            client,
            config,
            catalog,
            providers,
        })
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

pub async fn run_server(host: &str, port: u16) -> anyhow::Result<()> {
    let state = Arc::new(AppState::new().await?);

    if state.config.proxy_api_key.is_none() {
        tracing::warn!("PROXY_API_KEY is not set; proxy auth is disabled");
    }

    let refresher = BackgroundRefresher::new(Duration::from_secs(60));
    refresher.start(Arc::clone(&state.client));

    let app = Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/embeddings", post(embeddings))
        .route("/v1/models", get(list_models))
        .route("/v1/models-enriched", get(list_models_enriched))
        .route("/v1/model-info/{*id}", get(model_info))
        .route("/v1/token-count", post(token_count))
        .route("/v1/cost-estimate", post(cost_estimate))
        .route("/v1/providers", get(list_providers))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            verify_proxy_key,
        ))
        .layer(CorsLayer::permissive())
        .with_state(Arc::clone(&state));

    let addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(addr = %addr, "credential-rotating proxy listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    refresher.stop().await;
    state.client.shutdown();
    tracing::info!("proxy stopped");
    Ok(())
}

// ---------------------------------------------------------------------------
// Bearer auth (skipped when PROXY_API_KEY is unset)
// ---------------------------------------------------------------------------

async fn verify_proxy_key(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    if let Some(expected) = &state.config.proxy_api_key {
        let authorized = req
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(|v| v == format!("Bearer {expected}"))
            .unwrap_or(false);
        if !authorized {
            return (
                StatusCode::UNAUTHORIZED,
                Json(json!({"error": {"message": "Invalid or missing API key"}})),
            )
                .into_response();
        }
    }
    next.run(req).await
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

fn error_response(err: RotatorError) -> Response {
    match err {
        RotatorError::NoAvailableCredential(provider) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"error": {
                "message": format!("no available credential for provider '{provider}'"),
                "type": "no_available_credential",
            }})),
        )
            .into_response(),
        RotatorError::Upstream { status, body, .. } => {
            let provider_body = serde_json::from_str::<serde_json::Value>(&body)
                .unwrap_or_else(|_| json!(body));
            (
                StatusCode::BAD_GATEWAY,
                Json(json!({"error": {
                    "message": "provider error",
                    "type": "upstream_error",
                    "provider_status": status,
                    "provider_body": provider_body,
                }})),
            )
                .into_response()
        }
        RotatorError::Config(msg) => (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": {"message": msg, "type": "invalid_request_error"}})),
        )
            .into_response(),
        other => {
            tracing::error!(error = %other, "request failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": {"message": other.to_string(), "type": "proxy_internal_error"}})),
            )
                .into_response()
        }
    }
}

// ---------------------------------------------------------------------------
// POST /v1/chat/completions
// ---------------------------------------------------------------------------

async fn chat_completions(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<serde_json::Value>,
) -> Response {
    let stream = payload
        .get("stream")
        .and_then(|s| s.as_bool())
        .unwrap_or(false);

    if stream {
        match state.client.stream_chat_completion(&payload).await {
            Ok(frames) => {
                let body = Body::from_stream(
                    frames.map(|chunk| Ok::<_, Infallible>(Bytes::from(chunk))),
                );
                (
                    [
                        (header::CONTENT_TYPE, "text/event-stream"),
                        (header::CACHE_CONTROL, "no-cache"),
                    ],
                    body,
                )
                    .into_response()
            }
            Err(e) => error_response(e),
        }
    } else {
        match state.client.chat_completion(&payload).await {
            Ok(response) => Json(response).into_response(),
            Err(e) => error_response(e),
        }
    }
}

// ---------------------------------------------------------------------------
// POST /v1/embeddings
// ---------------------------------------------------------------------------

async fn embeddings(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<serde_json::Value>,
) -> Response {
    match state.client.embeddings(&payload).await {
        Ok(response) => Json(response).into_response(),
        Err(e) => error_response(e),
    }
}

// ---------------------------------------------------------------------------
// Model catalog endpoints
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct ModelsResponse {
    object: String,
    data: Vec<ModelCard>,
}

#[derive(Serialize)]
struct ModelCard {
    id: String,
    object: String,
    created: i64,
    owned_by: String,
}

fn model_card(full_id: &str) -> ModelCard {
    let owned_by = full_id.split('/').next().unwrap_or("unknown").to_string();
    ModelCard {
        id: full_id.to_string(),
        object: "model".into(),
        created: chrono::Utc::now().timestamp(),
        owned_by,
    }
}

async fn list_models(State(state): State<Arc<AppState>>) -> Json<ModelsResponse> {
    let data = state
        .catalog
        .list(&state.providers)
        .iter()
        .map(|id| model_card(id))
        .collect();
    Json(ModelsResponse {
        object: "list".into(),
        data,
    })
}

fn enriched_card(state: &AppState, full_id: &str) -> serde_json::Value {
    let mut card = json!({
        "id": full_id,
        "object": "model",
        "created": chrono::Utc::now().timestamp(),
        "owned_by": full_id.split('/').next().unwrap_or("unknown"),
        "mode": "chat",
    });
    if let Some(entry) = state.catalog.lookup(full_id) {
        card["context_window"] = json!(entry.context_window);
        card["max_input_tokens"] = json!(entry.context_window);
        card["max_output_tokens"] = json!(entry.max_output_tokens);
        card["input_cost_per_token"] = json!(entry.input_cost_per_token);
        card["output_cost_per_token"] = json!(entry.output_cost_per_token);
        card["capabilities"] = json!({
            "function_calling": entry.supports_tools,
            "tool_choice": entry.supports_tools,
            "vision": entry.supports_vision,
            "system_messages": true,
        });
    }
    card
}

async fn list_models_enriched(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let data: Vec<serde_json::Value> = state
        .catalog
        .list(&state.providers)
        .iter()
        .map(|id| enriched_card(&state, id))
        .collect();
    Json(json!({"object": "list", "data": data}))
}

async fn model_info(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Json<serde_json::Value> {
    Json(enriched_card(&state, &id))
}

async fn list_providers(State(state): State<Arc<AppState>>) -> Json<Vec<String>> {
    Json(state.providers.clone())
}

// ---------------------------------------------------------------------------
// POST /v1/token-count, POST /v1/cost-estimate
// ---------------------------------------------------------------------------

async fn token_count(
    State(_state): State<Arc<AppState>>,
    Json(payload): Json<serde_json::Value>,
) -> Response {
    let model = payload.get("model").and_then(|m| m.as_str());
    let messages = payload.get("messages").and_then(|m| m.as_array());
    let (Some(_model), Some(messages)) = (model, messages) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": {"message": "'model' and 'messages' are required"}})),
        )
            .into_response();
    };
    Json(json!({"token_count": catalog::estimate_tokens(messages)})).into_response()
}

async fn cost_estimate(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<serde_json::Value>,
) -> Response {
    let Some(model) = payload.get("model").and_then(|m| m.as_str()) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": {"message": "'model' is required"}})),
        )
            .into_response();
    };
    let prompt_tokens = payload
        .get("prompt_tokens")
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let completion_tokens = payload
        .get("completion_tokens")
        .and_then(|v| v.as_u64())
        .unwrap_or(0);

    match state.catalog.lookup(model) {
        Some(entry) => Json(json!({
            "model": model,
            "cost": catalog::estimate_cost(entry, prompt_tokens, completion_tokens),
            "currency": "USD",
            "pricing": {
                "input_cost_per_token": entry.input_cost_per_token,
                "output_cost_per_token": entry.output_cost_per_token,
            },
            "source": "catalog",
        }))
        .into_response(),
        None => Json(json!({
            "model": model,
            "cost": null,
            "currency": "USD",
            "pricing": {},
            "source": "unknown",
            "error": "pricing data not available for this model",
        }))
        .into_response(),
    }
}
