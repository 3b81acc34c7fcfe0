//! Axum HTTP server

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::{Instrument, info, info_span, warn};
use uuid::Uuid;

use assessor_core::{
    AssessorError, DispatchOutcome, DispatchSettings, Dispatcher, ProviderFactory, Services, resolve_session,
};

use crate::auth;
use crate::protocol::{ChatInput, ChatQuery, HealthResponse, error_response};

/// Shared state for all requests
#[derive(Clone)]
pub struct GatewayState {
    pub factory: Arc<dyn ProviderFactory>,
    pub services: Services,
    pub settings: DispatchSettings,
    pub auth_token: String,
}

/// The HTTP server
pub struct GatewayServer {
    state: GatewayState,
    bind: SocketAddr,
    allowed_origins: Vec<String>,
}

impl GatewayServer {
    pub fn new(bind: SocketAddr, state: GatewayState, allowed_origins: Vec<String>) -> Self {
        Self {
            state,
            bind,
            allowed_origins,
        }
    }

    /// Build the Axum router
    pub fn router(&self) -> Router {
        Router::new()
            .route("/chat", post(chat_handler))
            .route("/health", get(health_handler))
            .layer(cors_layer(&self.allowed_origins))
            .with_state(self.state.clone())
    }

    /// Serve until `shutdown` resolves
    pub async fn run(self, shutdown: impl Future<Output = ()> + Send + 'static) -> anyhow::Result<()> {
        let router = self.router();
        let listener = tokio::net::TcpListener::bind(self.bind).await?;
        info!("Gateway listening on {}", self.bind);

        axum::serve(listener, router).with_graceful_shutdown(shutdown).await?;

        info!("Gateway stopped");
        Ok(())
    }
}

/// `*` allows any origin; otherwise only the listed ones
pub fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    if allowed_origins.iter().any(|o| o.trim() == "*") {
        return CorsLayer::permissive();
    }
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|o| match o.trim().parse::<HeaderValue>() {
            Ok(v) => Some(v),
            Err(_) => {
                warn!("Ignoring invalid CORS origin '{}'", o);
                None
            }
        })
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
}

// ── HTTP Handlers ──

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}

async fn chat_handler(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Query(query): Query<ChatQuery>,
    body: Bytes,
) -> Response {
    let request_id = Uuid::new_v4();
    let span = info_span!("chat", request_id = %request_id);
    handle_chat(state, headers, query, body).instrument(span).await
}

async fn handle_chat(state: GatewayState, headers: HeaderMap, query: ChatQuery, body: Bytes) -> Response {
    // Auth and input checks run before any backend work
    if !auth::check_auth(&state.auth_token, &headers) {
        return auth::unauthorized(Json(DispatchOutcome::error_payload(&AssessorError::AuthFailure)));
    }

    let input: ChatInput = match serde_json::from_slice(&body) {
        Ok(input) => input,
        Err(e) => return error_response(&AssessorError::InvalidInput(format!("invalid JSON body: {}", e))),
    };
    let Some(email) = query.email.filter(|e| !e.trim().is_empty()) else {
        return error_response(&AssessorError::InvalidInput("email is required".to_string()));
    };
    if input.user_message.trim().is_empty() {
        return error_response(&AssessorError::InvalidInput("user_message is empty".to_string()));
    }

    let backends = match state.factory.build(&input.api_key) {
        Ok(backends) => backends,
        Err(e) => return error_response(&e),
    };

    let session_id = match resolve_session(&state.services.ledger, &email, state.settings.call_timeout()).await {
        Ok(id) => id,
        Err(e) => {
            warn!("Session resolution failed: {}", e);
            return error_response(&e);
        }
    };

    info!("Dispatching message for session {}", session_id);
    let dispatcher = Dispatcher::new(backends, state.services.clone(), state.settings.clone());
    match dispatcher.handle(&session_id, &input.user_message).await {
        Ok(outcome) => {
            info!("Answered with origin {}", outcome.origin);
            (StatusCode::OK, Json(outcome)).into_response()
        }
        Err(e) => {
            warn!("Dispatch failed for session {}: {}", session_id, e);
            error_response(&e)
        }
    }
}
