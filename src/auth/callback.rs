/// Single-shot local HTTP listener for the OAuth redirect
///
/// Serves `GET /auth` (redirect to the provider) and `GET /callback`
/// (code exchange), then shuts itself down after the first callback.
use axum::{
    body::Body,
    extract::{Query, State},
    http::{header, Request, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::get,
    Router,
};
use serde::Deserialize;
use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::{net::TcpListener, sync::oneshot, task::JoinHandle};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn, Span};

use super::TokenManager;
use crate::error::{AuthError, AuthResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Idle,
    Starting,
    Listening,
    Handling,
    Stopped,
}

impl ListenerState {
    /// A listener exists (or is about to) and a new flow must not start
    pub fn is_active(self) -> bool {
        matches!(
            self,
            ListenerState::Starting | ListenerState::Listening | ListenerState::Handling
        )
    }
}

/// How an authorization round-trip ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackOutcome {
    /// Code exchanged, token stored
    Authorized,
    /// Redirect carried no code; `error` holds the provider's reason if any
    MissingCode { error: Option<String> },
    ExchangeFailed(String),
    TimedOut,
    Aborted,
}

/// Handle to a running authorization flow
#[derive(Debug)]
pub struct AuthorizationFlow {
    authorization_url: String,
    local_addr: SocketAddr,
    task: JoinHandle<CallbackOutcome>,
}

impl AuthorizationFlow {
    pub fn authorization_url(&self) -> &str {
        &self.authorization_url
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Resolves once the listener has handled its callback (or timed out) and shut down
    pub async fn wait(self) -> CallbackOutcome {
        self.task.await.unwrap_or_else(|e| {
            error!("Callback listener task failed: {}", e);
            CallbackOutcome::Aborted
        })
    }
}

#[derive(Clone)]
struct CallbackState {
    manager: Arc<TokenManager>,
    authorization_url: Arc<str>,
    outcome_tx: Arc<Mutex<Option<oneshot::Sender<CallbackOutcome>>>>,
}

impl CallbackState {
    /// Only the first callback gets the sender
    fn claim(&self) -> Option<oneshot::Sender<CallbackOutcome>> {
        self.outcome_tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }
}

#[derive(Debug, Deserialize)]
struct CallbackParams {
    code: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

/// Bind `bind_addr` and serve until one callback is handled.
///
/// The caller must already have marked the listener `Starting`; on bind
/// failure the state is left for the caller to reset.
pub(crate) async fn spawn(
    manager: Arc<TokenManager>,
    bind_addr: &str,
    authorization_url: String,
    timeout: Option<Duration>,
) -> AuthResult<AuthorizationFlow> {
    let bind_error = |e: std::io::Error| AuthError::ListenerBind {
        addr: bind_addr.to_string(),
        message: e.to_string(),
    };

    let listener = TcpListener::bind(bind_addr).await.map_err(bind_error)?;
    let local_addr = listener.local_addr().map_err(bind_error)?;

    let (outcome_tx, outcome_rx) = oneshot::channel();
    let state = CallbackState {
        manager: Arc::clone(&manager),
        authorization_url: Arc::from(authorization_url.as_str()),
        outcome_tx: Arc::new(Mutex::new(Some(outcome_tx))),
    };
    let app = build_router(state);

    manager.set_listener_state(ListenerState::Listening);
    info!("✓ OAuth callback listener on http://{}", local_addr);

    let task = tokio::spawn(async move {
        let (done_tx, done_rx) = oneshot::channel();
        let shutdown = async move {
            let _ = done_tx.send(wait_for_outcome(outcome_rx, timeout).await);
        };

        if let Err(e) = axum::serve(listener, app).with_graceful_shutdown(shutdown).await {
            error!("Callback listener error: {}", e);
        }

        let outcome = done_rx.await.unwrap_or(CallbackOutcome::Aborted);
        manager.set_listener_state(ListenerState::Stopped);
        info!("OAuth callback listener stopped ({:?})", outcome);
        outcome
    });

    Ok(AuthorizationFlow {
        authorization_url,
        local_addr,
        task,
    })
}

async fn wait_for_outcome(
    rx: oneshot::Receiver<CallbackOutcome>,
    timeout: Option<Duration>,
) -> CallbackOutcome {
    let received = match timeout {
        Some(limit) => match tokio::time::timeout(limit, rx).await {
            Ok(received) => received,
            Err(_) => {
                warn!("No authorization callback within {:?}, shutting down listener", limit);
                return CallbackOutcome::TimedOut;
            }
        },
        None => rx.await,
    };

    received.unwrap_or(CallbackOutcome::Aborted)
}

fn build_router(state: CallbackState) -> Router {
    Router::new()
        .route("/auth", get(auth_handler))
        .route("/callback", get(callback_handler))
        .layer(TraceLayer::new_for_http().make_span_with(request_span))
        .with_state(state)
}

/// Method and path only; the query carries the authorization code
fn request_span(request: &Request<Body>) -> Span {
    tracing::debug_span!(
        "callback_request",
        method = %request.method(),
        path = %request.uri().path()
    )
}

/// GET /auth
async fn auth_handler(State(state): State<CallbackState>) -> Response {
    (
        StatusCode::FOUND,
        [(header::LOCATION, state.authorization_url.to_string())],
    )
        .into_response()
}

/// GET /callback?code=...
async fn callback_handler(
    State(state): State<CallbackState>,
    Query(params): Query<CallbackParams>,
) -> (StatusCode, Html<String>) {
    let Some(outcome_tx) = state.claim() else {
        return (
            StatusCode::CONFLICT,
            Html(render_page(
                "Authorization already handled",
                "This authorization request has already been processed.",
            )),
        );
    };

    state.manager.set_listener_state(ListenerState::Handling);

    let Some(code) = params.code.filter(|c| !c.is_empty()) else {
        let reason = params.error_description.or(params.error);
        warn!(
            "OAuth callback without authorization code: {}",
            reason.as_deref().unwrap_or("no error given")
        );
        let detail = match &reason {
            Some(reason) => format!("No authorization code received: {}", escape_html(reason)),
            None => "No authorization code received.".to_string(),
        };
        let _ = outcome_tx.send(CallbackOutcome::MissingCode { error: reason });
        return (
            StatusCode::BAD_REQUEST,
            Html(render_page("Authorization failed", &detail)),
        );
    };

    // The code is single-use: once it reaches Fitbit the exchange must finish
    // and report its outcome even if the browser hangs up on this request.
    let manager = Arc::clone(&state.manager);
    let exchange = tokio::spawn(async move {
        let result = manager.complete_authorization(&code).await;
        let outcome = match &result {
            Ok(()) => CallbackOutcome::Authorized,
            Err(e) => CallbackOutcome::ExchangeFailed(e.to_string()),
        };
        let _ = outcome_tx.send(outcome);
        result
    });

    match exchange.await {
        Ok(Ok(())) => (
            StatusCode::OK,
            Html(render_page(
                "Authorization successful",
                "Fitbit access has been granted. You can close this window.",
            )),
        ),
        Ok(Err(e)) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Html(render_page(
                "Authorization failed",
                &format!("Token exchange failed: {}", escape_html(&e.to_string())),
            )),
        ),
        Err(e) => {
            error!("Authorization code exchange task failed: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Html(render_page("Authorization failed", "Token exchange did not complete.")),
            )
        }
    }
}

fn render_page(title: &str, detail: &str) -> String {
    format!(
        "<!DOCTYPE html>\n<html><head><meta charset=\"utf-8\"><title>{title}</title></head>\
         <body><h1>{title}</h1><p>{detail}</p></body></html>"
    )
}

fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}
