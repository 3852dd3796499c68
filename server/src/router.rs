use std::sync::Arc;
use std::time::Duration;

use axum::Json;
use axum::Router;
use axum::extract::Path;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::response::sse::Sse;
use axum::routing::get;
use axum::routing::post;
use runbridge_core::SessionError;
use runbridge_core::SessionRegistry;
use runbridge_protocol::ApiFailure;
use runbridge_protocol::ApiOk;
use runbridge_protocol::ExecuteParams;
use runbridge_protocol::HealthResponse;
use runbridge_protocol::InputParams;
use runbridge_protocol::KillParams;
use runbridge_protocol::SessionId;
use tower_http::trace::TraceLayer;

use crate::guard::AccessGuard;
use crate::guard::CallerIdentity;
use crate::guard::GuardVerdict;
use crate::guard::GuardedAction;
use crate::stream::StreamGuard;
use crate::stream::session_stream;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub keepalive_interval: Duration,
    /// Kill the job when its stream's client disconnects. Off by default so
    /// a flaky browser connection does not abort a long run.
    pub kill_on_disconnect: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            keepalive_interval: Duration::from_secs(15),
            kill_on_disconnect: false,
        }
    }
}

pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub guard: Arc<dyn AccessGuard>,
    pub config: ServerConfig,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(get_health))
        .route("/api/execute", post(post_execute))
        .route("/api/stream/{session_id}", get(get_stream))
        .route("/api/input", post(post_input))
        .route("/api/kill", post(post_kill))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn get_health() -> Json<HealthResponse> {
    Json(HealthResponse::ok())
}

async fn post_execute(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(params): Json<ExecuteParams>,
) -> Response {
    if let Err(denied) = check_guard(&state, &headers, GuardedAction::Execute) {
        return denied;
    }
    let session = match state.registry.execute(&params).await {
        Ok(session) => session,
        Err(err) => return error_response(&err),
    };
    let lease = match session.attach_reader() {
        Ok(lease) => lease,
        Err(err) => return error_response(&err),
    };
    let guard = StreamGuard::new(
        Arc::clone(&state.registry),
        params.session_id.clone(),
        state.config.kill_on_disconnect,
    );
    Sse::new(session_stream(lease, guard, state.config.keepalive_interval)).into_response()
}

/// Reconnect endpoint: re-attaches a reader to a live or recently terminated
/// session and replays whatever is still buffered.
async fn get_stream(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    if let Err(denied) = check_guard(&state, &headers, GuardedAction::Stream) {
        return denied;
    }
    let session_id = SessionId::new(session_id);
    let lease = match state.registry.attach_reader(&session_id) {
        Ok(lease) => lease,
        Err(err) => return error_response(&err),
    };
    let guard = StreamGuard::new(
        Arc::clone(&state.registry),
        session_id,
        state.config.kill_on_disconnect,
    );
    Sse::new(session_stream(lease, guard, state.config.keepalive_interval)).into_response()
}

async fn post_input(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(params): Json<InputParams>,
) -> Response {
    if let Err(denied) = check_guard(&state, &headers, GuardedAction::Input) {
        return denied;
    }
    match state
        .registry
        .send_input(&params.session_id, &params.input)
        .await
    {
        Ok(()) => Json(ApiOk::new()).into_response(),
        Err(err) => error_response(&err),
    }
}

async fn post_kill(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(params): Json<KillParams>,
) -> Response {
    if let Err(denied) = check_guard(&state, &headers, GuardedAction::Kill) {
        return denied;
    }
    match state.registry.kill(&params.session_id).await {
        Ok(()) => Json(ApiOk::with_message("Process terminated")).into_response(),
        Err(err) => error_response(&err),
    }
}

fn check_guard(
    state: &AppState,
    headers: &HeaderMap,
    action: GuardedAction,
) -> Result<(), Response> {
    let caller = CallerIdentity::from_headers(headers);
    match state.guard.check(&caller, action) {
        GuardVerdict::Allow => Ok(()),
        GuardVerdict::Deny { reason } => Err((
            StatusCode::FORBIDDEN,
            Json(ApiFailure::new(reason)),
        )
            .into_response()),
        GuardVerdict::Throttle { reason } => Err((
            StatusCode::TOO_MANY_REQUESTS,
            Json(ApiFailure::new(reason)),
        )
            .into_response()),
    }
}

/// Maps the session error taxonomy onto the documented statuses and bodies.
/// Validation and lookup failures always land here before a stream starts;
/// after that only in-band exit records carry failure.
fn error_response(err: &SessionError) -> Response {
    let (status, message) = match err {
        SessionError::Validation { message } => (StatusCode::BAD_REQUEST, message.clone()),
        SessionError::AlreadyRunning { .. } => (StatusCode::CONFLICT, err.to_string()),
        SessionError::NoSuchSession { .. } => {
            (StatusCode::NOT_FOUND, "No active process".to_string())
        }
        SessionError::NotRunning { .. } => {
            (StatusCode::BAD_REQUEST, "Process not running".to_string())
        }
        SessionError::StreamBusy { .. } => (StatusCode::CONFLICT, err.to_string()),
        SessionError::Spawn { .. } | SessionError::InputClosed => {
            (StatusCode::INTERNAL_SERVER_ERROR, "Execution error".to_string())
        }
    };
    (status, Json(ApiFailure::new(message))).into_response()
}
