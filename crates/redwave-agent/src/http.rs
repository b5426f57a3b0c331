use axum::{
    Json, Router,
    extract::{
        Path, Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use futures_util::{SinkExt, StreamExt};
use redwave_process::{InstanceId, InstanceSnapshot, LogLine, TemplateRef};
use serde::{Deserialize, Serialize};

use crate::error::{ErrorPayload, PanelError};
use crate::event_bus::{LogSubscription, status_stream};
use crate::log_buffer::render_line;
use crate::manager::InstanceManager;

const DEFAULT_TAIL_LIMIT: usize = 100;
const MAX_TAIL_LIMIT: usize = 2000;

#[derive(Clone)]
pub struct AppState {
    pub manager: InstanceManager,
}

pub struct ApiError(PanelError);

impl From<PanelError> for ApiError {
    fn from(value: PanelError) -> Self {
        Self(value)
    }
}

pub fn status_code(err: &PanelError) -> StatusCode {
    match err {
        PanelError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        PanelError::NotFound(_) => StatusCode::NOT_FOUND,
        PanelError::AlreadyRunning { .. } | PanelError::NotRunning(_) => StatusCode::CONFLICT,
        PanelError::ProvisionFailed(_) | PanelError::LaunchFailed(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (status_code(&self.0), Json(ErrorPayload::from(&self.0))).into_response()
    }
}

#[derive(Debug, Serialize)]
struct HealthzResponse {
    status: &'static str,
    version: &'static str,
    instances: usize,
}

async fn healthz(State(state): State<AppState>) -> Json<HealthzResponse> {
    Json(HealthzResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        instances: state.manager.instance_count().await,
    })
}

async fn list_templates(State(state): State<AppState>) -> Json<Vec<TemplateRef>> {
    Json(state.manager.templates())
}

async fn list_instances(State(state): State<AppState>) -> Json<Vec<InstanceSnapshot>> {
    Json(state.manager.list_instances().await)
}

#[derive(Debug, Deserialize)]
struct CreateInstanceRequest {
    name: String,
    #[serde(default)]
    template: Option<String>,
}

#[derive(Debug, Serialize)]
struct CreateInstanceResponse {
    id: InstanceId,
}

async fn create_instance(
    State(state): State<AppState>,
    Json(req): Json<CreateInstanceRequest>,
) -> Result<(StatusCode, Json<CreateInstanceResponse>), ApiError> {
    let id = state
        .manager
        .create_instance(&req.name, req.template.as_deref())
        .await?;
    Ok((StatusCode::ACCEPTED, Json(CreateInstanceResponse { id })))
}

async fn get_instance(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<InstanceSnapshot>, ApiError> {
    Ok(Json(state.manager.get_instance(&InstanceId(id)).await?))
}

async fn start_instance(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.manager.start_instance(&InstanceId(id)).await?;
    Ok(StatusCode::ACCEPTED)
}

async fn stop_instance(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.manager.stop_instance(&InstanceId(id)).await?;
    Ok(StatusCode::ACCEPTED)
}

#[derive(Debug, Deserialize)]
struct CommandRequest {
    command: String,
}

async fn send_command(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<CommandRequest>,
) -> Result<StatusCode, ApiError> {
    state
        .manager
        .send_command(&InstanceId(id), &req.command)
        .await?;
    Ok(StatusCode::ACCEPTED)
}

#[derive(Debug, Default, Deserialize)]
struct TailQuery {
    #[serde(default)]
    cursor: Option<String>,
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
struct TailResponse {
    lines: Vec<LogLine>,
    rendered: Vec<String>,
    next_cursor: String,
}

async fn tail_logs(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<TailQuery>,
) -> Result<Json<TailResponse>, ApiError> {
    let cursor = match q.cursor.as_deref().map(str::trim).filter(|c| !c.is_empty()) {
        None => 0,
        Some(raw) => raw
            .parse::<u64>()
            .map_err(|_| PanelError::InvalidInput(format!("invalid cursor: {raw}")))?,
    };
    let limit = match q.limit {
        None | Some(0) => DEFAULT_TAIL_LIMIT,
        Some(v) => v.min(MAX_TAIL_LIMIT),
    };

    let (lines, next) = state
        .manager
        .tail_logs(&InstanceId(id), cursor, limit)
        .await?;
    Ok(Json(TailResponse {
        rendered: lines.iter().map(render_line).collect(),
        lines,
        next_cursor: next.to_string(),
    }))
}

async fn logs_ws(
    State(state): State<AppState>,
    Path(id): Path<String>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let id = InstanceId(id);
    // Subscribe before the upgrade so the history snapshot is taken now.
    let sub = state.manager.subscribe_logs(&id).await?;
    Ok(ws.on_upgrade(move |socket| stream_logs(socket, state.manager, id, sub)))
}

/// History then live lines out; inbound text frames are console commands.
/// Rejections go back to this socket only.
async fn stream_logs(
    socket: WebSocket,
    manager: InstanceManager,
    id: InstanceId,
    sub: LogSubscription,
) {
    let (mut tx, mut rx) = socket.split();
    let mut lines = Box::pin(sub.into_stream());

    loop {
        tokio::select! {
            line = lines.next() => {
                let Some(line) = line else { break };
                let Ok(json) = serde_json::to_string(&line) else { continue };
                if tx.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }
            msg = rx.next() => match msg {
                Some(Ok(Message::Text(command))) => {
                    if let Err(err) = manager.send_command(&id, &command).await {
                        let body = serde_json::json!({ "error": ErrorPayload::from(&err) });
                        if tx.send(Message::Text(body.to_string())).await.is_err() {
                            break;
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
    tracing::debug!(instance = %id, "log stream closed");
}

async fn events_ws(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    let rx = state.manager.subscribe_status();
    ws.on_upgrade(move |mut socket| async move {
        let mut changes = Box::pin(status_stream(rx));
        loop {
            tokio::select! {
                change = changes.next() => {
                    let Some(change) = change else { break };
                    let Ok(json) = serde_json::to_string(&change) else { continue };
                    if socket.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                msg = socket.recv() => match msg {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                },
            }
        }
    })
}

pub fn router(manager: InstanceManager) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/templates", get(list_templates))
        .route("/instances", get(list_instances).post(create_instance))
        .route("/instances/:id", get(get_instance))
        .route("/instances/:id/start", post(start_instance))
        .route("/instances/:id/stop", post(stop_instance))
        .route("/instances/:id/command", post(send_command))
        .route("/instances/:id/logs", get(tail_logs))
        .route("/instances/:id/logs/ws", get(logs_ws))
        .route("/events/ws", get(events_ws))
        .with_state(AppState { manager })
}
