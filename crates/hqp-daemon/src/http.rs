use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use hqp_control::{Controller, Direction, ProfileEntry, SwitchOutcome, SwitchPhase};
use hqp_proto::{ControlError, ErrorKind, PlaybackStatus, VolumeDb};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

#[derive(Clone)]
struct HttpState {
    controller: Arc<Controller>,
}

#[derive(Serialize)]
struct ApiInfo {
    name: &'static str,
    version: &'static str,
    hqplayer_host: String,
}

#[derive(Serialize)]
struct StatusResponse {
    status: PlaybackStatus,
    current_profile: Option<String>,
}

#[derive(Serialize)]
struct ProfilesResponse {
    profiles: Vec<ProfileEntry>,
    current: Option<String>,
}

#[derive(Serialize)]
struct SwitchPhaseResponse {
    host: String,
    phase: SwitchPhase,
}

#[derive(Deserialize)]
struct SwitchQuery {
    #[serde(default = "default_wait")]
    wait: bool,
    budget_ms: Option<u64>,
}

#[derive(Deserialize)]
struct VolumeRequest {
    value: f64,
}

#[derive(Deserialize)]
struct VolumeStepRequest {
    #[serde(default = "default_step")]
    step: f64,
}

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorKind,
    message: String,
}

fn default_wait() -> bool {
    true
}

fn default_step() -> f64 {
    1.0
}

/// Maps a [`ControlError`] onto an HTTP status and a JSON body.
struct ApiError(ControlError);

impl From<ControlError> for ApiError {
    fn from(err: ControlError) -> Self {
        Self(err)
    }
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::InvalidArgument => StatusCode::BAD_REQUEST,
        ErrorKind::ProfileNotFound => StatusCode::NOT_FOUND,
        ErrorKind::SwitchInProgress => StatusCode::CONFLICT,
        ErrorKind::TransportUnavailable | ErrorKind::StoreUnavailable => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        ErrorKind::ProtocolError | ErrorKind::Rejected => StatusCode::BAD_GATEWAY,
        ErrorKind::ActivationFailed | ErrorKind::RestartFailed => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.0.kind();
        let body = ErrorBody {
            error: kind,
            message: self.0.to_string(),
        };
        (status_for(kind), Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

pub fn router(controller: Arc<Controller>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(api_info))
        .route("/status", get(get_status))
        .route("/profiles", get(list_profiles))
        .route("/profiles/switch", get(switch_phase))
        .route("/profiles/:name", post(switch_profile))
        .route("/volume", post(set_volume))
        .route("/volume/up", post(volume_up))
        .route("/volume/down", post(volume_down))
        .route("/transport/play", post(play))
        .route("/transport/pause", post(pause))
        .route("/transport/stop", post(stop))
        .route("/transport/next", post(next))
        .route("/transport/prev", post(previous))
        .layer(cors)
        .with_state(HttpState { controller })
}

pub fn start_server(
    bind_address: String,
    port: u16,
    controller: Arc<Controller>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let app = router(controller);

        let addr = format!("{}:{}", bind_address, port);
        let listener = match TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                error!("Failed to bind HTTP server to {}: {}", addr, e);
                return;
            }
        };

        info!("HTTP API server listening on http://{}", addr);

        if let Err(e) = axum::serve(listener, app).await {
            error!("HTTP server error: {}", e);
        }
    })
}

async fn api_info(State(state): State<HttpState>) -> Json<ApiInfo> {
    Json(ApiInfo {
        name: "HQPlayer Control API",
        version: env!("CARGO_PKG_VERSION"),
        hqplayer_host: state.controller.host().to_string(),
    })
}

async fn get_status(State(state): State<HttpState>) -> ApiResult<StatusResponse> {
    let status = state.controller.get_status().await?;
    let current_profile = state
        .controller
        .current_profile_lenient()
        .await
        .map(|p| p.id);
    Ok(Json(StatusResponse {
        status,
        current_profile,
    }))
}

async fn list_profiles(State(state): State<HttpState>) -> ApiResult<ProfilesResponse> {
    let profiles = state.controller.list_profiles().await?;
    let current = profiles
        .iter()
        .find(|p| p.current)
        .map(|p| p.profile.id.clone());
    Ok(Json(ProfilesResponse { profiles, current }))
}

async fn switch_phase(State(state): State<HttpState>) -> Json<SwitchPhaseResponse> {
    Json(SwitchPhaseResponse {
        host: state.controller.host().to_string(),
        phase: state.controller.switch_phase(),
    })
}

async fn switch_profile(
    State(state): State<HttpState>,
    Path(name): Path<String>,
    Query(query): Query<SwitchQuery>,
) -> Result<Response, ApiError> {
    info!("HTTP API: switch to profile '{}' (wait={})", name, query.wait);
    let budget = query.budget_ms.map(Duration::from_millis);
    let result = state
        .controller
        .switch_profile(&name, query.wait, budget)
        .await?;
    let code = match result.outcome {
        SwitchOutcome::Ready | SwitchOutcome::Started => StatusCode::OK,
        SwitchOutcome::TimedOut => StatusCode::ACCEPTED,
        SwitchOutcome::Failed => result
            .error
            .map(status_for)
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
    };
    Ok((code, Json(result)).into_response())
}

fn volume_arg(value: f64) -> Result<VolumeDb, ControlError> {
    VolumeDb::from_f64(value)
        .ok_or_else(|| ControlError::invalid_argument(format!("invalid volume {value}")))
}

async fn set_volume(
    State(state): State<HttpState>,
    Json(request): Json<VolumeRequest>,
) -> ApiResult<PlaybackStatus> {
    let value = volume_arg(request.value)?;
    Ok(Json(state.controller.set_volume(value).await?))
}

async fn adjust(
    state: HttpState,
    request: Option<Json<VolumeStepRequest>>,
    direction: Direction,
) -> ApiResult<PlaybackStatus> {
    let step = request.map(|Json(r)| r.step).unwrap_or_else(default_step);
    let step = volume_arg(step)?;
    Ok(Json(state.controller.adjust_volume(step, direction).await?))
}

async fn volume_up(
    State(state): State<HttpState>,
    request: Option<Json<VolumeStepRequest>>,
) -> ApiResult<PlaybackStatus> {
    adjust(state, request, Direction::Up).await
}

async fn volume_down(
    State(state): State<HttpState>,
    request: Option<Json<VolumeStepRequest>>,
) -> ApiResult<PlaybackStatus> {
    adjust(state, request, Direction::Down).await
}

async fn play(State(state): State<HttpState>) -> ApiResult<PlaybackStatus> {
    Ok(Json(state.controller.play().await?))
}

async fn pause(State(state): State<HttpState>) -> ApiResult<PlaybackStatus> {
    Ok(Json(state.controller.pause().await?))
}

async fn stop(State(state): State<HttpState>) -> ApiResult<PlaybackStatus> {
    Ok(Json(state.controller.stop().await?))
}

async fn next(State(state): State<HttpState>) -> ApiResult<PlaybackStatus> {
    Ok(Json(state.controller.next().await?))
}

async fn previous(State(state): State<HttpState>) -> ApiResult<PlaybackStatus> {
    Ok(Json(state.controller.previous().await?))
}
