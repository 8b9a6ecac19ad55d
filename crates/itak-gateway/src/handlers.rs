//! Route handlers.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures::Stream;
use itak_core::{Classify, ErrorKind, MemoryId, RoomType, SessionKey, Task, TaskId, TaskStatus};
use itak_limits::WindowKind;
use itak_memory::RememberOptions;
use itak_store::TaskStore;
use itak_runtime::{InboundMessage, ProgressEvent};
use serde::Deserialize;
use serde_json::json;
use tracing::warn;
use uuid::Uuid;

use crate::state::AppState;

type ApiError = (StatusCode, String);

fn bad_request(message: impl Into<String>) -> ApiError {
    (StatusCode::BAD_REQUEST, message.into())
}

fn internal(message: impl std::fmt::Display) -> ApiError {
    (StatusCode::INTERNAL_SERVER_ERROR, message.to_string())
}

fn parse_key(raw: &str) -> Result<SessionKey, ApiError> {
    raw.parse()
        .map_err(|e| bad_request(format!("bad session key: {e}")))
}

// ---------------------------------------------------------------------------
// Chat
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub(crate) struct ChatBody {
    #[serde(default)]
    session_key: Option<String>,
    message: String,
}

/// `POST /chat`: stream the monologue's progress as SSE events
/// (`plan`, `step_start`, `step_end`, `presence`, `final`, `error`).
pub(crate) async fn chat(
    State(state): State<AppState>,
    Json(body): Json<ChatBody>,
) -> Result<Sse<impl Stream<Item = Result<Event, std::convert::Infallible>>>, ApiError> {
    let principal = state
        .registry
        .owner()
        .ok_or_else(|| internal("no owner principal configured"))?;
    let key = match body.session_key {
        Some(raw) => parse_key(&raw)?,
        None => SessionKey::new("http", RoomType::Direct, principal.id.to_string()),
    };

    let events = state.runtime.subscribe();
    state
        .runtime
        .enqueue_message(InboundMessage {
            session_key: key.clone(),
            principal,
            content: body.message,
        })
        .map_err(|e| (StatusCode::TOO_MANY_REQUESTS, e.to_string()))?;

    let stream = session_event_stream(key, events);
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

/// Convert the progress bus into a terminating SSE stream for one
/// session: events stop after `final` or `error`.
fn session_event_stream(
    key: SessionKey,
    events: tokio::sync::broadcast::Receiver<ProgressEvent>,
) -> impl Stream<Item = Result<Event, std::convert::Infallible>> {
    futures::stream::unfold((key, events, false), |(key, mut events, done)| async move {
        if done {
            return None;
        }
        loop {
            match events.recv().await {
                Ok(event) if event.session() == &key => {
                    let terminal = matches!(
                        event,
                        ProgressEvent::Final { .. } | ProgressEvent::Error { .. }
                    );
                    let name = match &event {
                        ProgressEvent::Plan { .. } => "plan",
                        ProgressEvent::StepStart { .. } => "step_start",
                        ProgressEvent::StepEnd { .. } => "step_end",
                        ProgressEvent::Presence { .. } => "presence",
                        ProgressEvent::Final { .. } => "final",
                        ProgressEvent::Error { .. } => "error",
                    };
                    let sse = Event::default()
                        .event(name)
                        .json_data(&event)
                        .unwrap_or_else(|_| Event::default().event("error"));
                    return Some((Ok(sse), (key, events, terminal)));
                },
                Ok(_) => {},
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {},
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

/// `GET /sessions`.
pub(crate) async fn list_sessions(State(state): State<AppState>) -> Json<serde_json::Value> {
    let sessions = state.runtime.services().sessions.list().await;
    Json(json!({ "sessions": sessions }))
}

/// `GET /sessions/{key}/transcript`.
pub(crate) async fn transcript(
    State(state): State<AppState>,
    Path(raw): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let key = parse_key(&raw)?;
    let Some(session) = state.runtime.services().sessions.get(&key) else {
        return Err((StatusCode::NOT_FOUND, "unknown session".into()));
    };
    let session = session.lock().await;
    Ok(Json(json!({
        "session": key,
        "turns": session.transcript,
    })))
}

/// `DELETE /sessions/{key}`.
pub(crate) async fn archive_session(
    State(state): State<AppState>,
    Path(raw): Path<String>,
) -> Result<StatusCode, ApiError> {
    let key = parse_key(&raw)?;
    state.runtime.cancel(&key);
    state
        .runtime
        .services()
        .sessions
        .archive(&key)
        .await
        .map_err(internal)?;
    state
        .runtime
        .services()
        .checkpoints
        .remove(&key)
        .await
        .map_err(internal)?;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /sessions/{key}/cancel`.
pub(crate) async fn cancel_session(
    State(state): State<AppState>,
    Path(raw): Path<String>,
) -> Result<StatusCode, ApiError> {
    let key = parse_key(&raw)?;
    state.runtime.cancel(&key);
    Ok(StatusCode::ACCEPTED)
}

// ---------------------------------------------------------------------------
// Memory
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub(crate) struct SearchQuery {
    q: String,
    #[serde(default)]
    k: Option<usize>,
}

/// `GET /memory/search?q=...&k=...` (scoped to the owner principal).
pub(crate) async fn memory_search(
    State(state): State<AppState>,
    Query(query): Query<SearchQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let principal = state
        .registry
        .owner()
        .ok_or_else(|| internal("no owner principal configured"))?;
    let hits = state
        .runtime
        .services()
        .fabric
        .search(principal.id, &query.q, query.k.unwrap_or(10).clamp(1, 50))
        .await
        .map_err(internal)?;
    Ok(Json(json!({ "hits": hits })))
}

#[derive(Debug, Deserialize)]
pub(crate) struct RememberBody {
    content: String,
    #[serde(default)]
    tags: Vec<String>,
}

/// `POST /memory`.
pub(crate) async fn memory_save(
    State(state): State<AppState>,
    Json(body): Json<RememberBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let principal = state
        .registry
        .owner()
        .ok_or_else(|| internal("no owner principal configured"))?;
    let id = state
        .runtime
        .services()
        .fabric
        .remember(
            principal.id,
            &body.content,
            RememberOptions {
                tags: body.tags,
                ..RememberOptions::default()
            },
        )
        .await
        .map_err(internal)?;
    Ok(Json(json!({ "id": id })))
}

#[derive(Debug, Deserialize)]
pub(crate) struct ForgetQuery {
    /// Confirmation token: must repeat the id being deleted.
    confirm: String,
}

/// `DELETE /memory/{id}?confirm={id}`.
pub(crate) async fn memory_forget(
    State(state): State<AppState>,
    Path(raw): Path<String>,
    Query(query): Query<ForgetQuery>,
) -> Result<StatusCode, ApiError> {
    let id: Uuid = raw
        .parse()
        .map_err(|e| bad_request(format!("bad memory id: {e}")))?;
    if query.confirm != raw {
        return Err(bad_request("confirmation token does not match the id"));
    }
    state
        .runtime
        .services()
        .fabric
        .forget(MemoryId(id))
        .await
        .map_err(internal)?;
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

/// `GET /tasks`.
pub(crate) async fn list_tasks(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let tasks = state
        .runtime
        .services()
        .tasks
        .list_tasks(None)
        .await
        .map_err(internal)?;
    Ok(Json(json!({ "tasks": tasks })))
}

#[derive(Debug, Deserialize)]
pub(crate) struct CreateTaskBody {
    title: String,
    description: String,
}

/// `POST /tasks`.
pub(crate) async fn create_task(
    State(state): State<AppState>,
    Json(body): Json<CreateTaskBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let principal = state
        .registry
        .owner()
        .ok_or_else(|| internal("no owner principal configured"))?;
    let session = SessionKey::new("http", RoomType::Direct, principal.id.to_string());
    let task = Task::new(body.title, body.description, session);
    state
        .runtime
        .services()
        .tasks
        .upsert_task(&task)
        .await
        .map_err(internal)?;
    Ok(Json(json!({ "id": task.id, "status": task.status })))
}

#[derive(Debug, Deserialize)]
pub(crate) struct PatchTaskBody {
    status: TaskStatus,
}

/// `PATCH /tasks/{id}` with server-side transition enforcement.
pub(crate) async fn patch_task(
    State(state): State<AppState>,
    Path(raw): Path<String>,
    Json(body): Json<PatchTaskBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let id: Uuid = raw
        .parse()
        .map_err(|e| bad_request(format!("bad task id: {e}")))?;
    let store = &state.runtime.services().tasks;
    let Some(mut task) = store.get_task(TaskId(id)).await.map_err(internal)? else {
        return Err((StatusCode::NOT_FOUND, "unknown task".into()));
    };
    task.transition(body.status).map_err(|(from, to)| {
        (
            StatusCode::CONFLICT,
            format!("transition {from} -> {to} is not allowed"),
        )
    })?;
    store.upsert_task(&task).await.map_err(internal)?;
    Ok(Json(json!({ "id": task.id, "status": task.status })))
}

// ---------------------------------------------------------------------------
// Costs, health, admin, webhook
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub(crate) struct CostsQuery {
    #[serde(default)]
    window: Option<String>,
}

/// `GET /costs?window=daily|weekly|monthly`.
pub(crate) async fn costs(
    State(state): State<AppState>,
    Query(query): Query<CostsQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let windows: Vec<WindowKind> = match query.window.as_deref() {
        None => WindowKind::ALL.to_vec(),
        Some("daily") => vec![WindowKind::Daily],
        Some("weekly") => vec![WindowKind::Weekly],
        Some("monthly") => vec![WindowKind::Monthly],
        Some(other) => return Err(bad_request(format!("unknown window '{other}'"))),
    };
    let snapshot: Vec<serde_json::Value> = windows
        .into_iter()
        .map(|kind| json!({ "window": kind, "usage": state.limiter.usage(kind) }))
        .collect();
    Ok(Json(json!({ "costs": snapshot })))
}

/// `GET /health`: store health, derivation backlog, session count.
pub(crate) async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let fabric = state.runtime.services().fabric.health().await;
    let sessions = state.runtime.services().sessions.list().await;
    Json(json!({
        "status": "ok",
        "memory": fabric,
        "sessions": sessions.len(),
        "active": sessions.iter().filter(|s| s.active).count(),
    }))
}

/// `POST /admin/reload-config`.
pub(crate) async fn reload_config(State(state): State<AppState>) -> Result<StatusCode, ApiError> {
    state
        .reload
        .reload()
        .map_err(|reason| (StatusCode::UNPROCESSABLE_ENTITY, reason))?;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /webhook/inbound/{route}`: signature-verified task submission.
pub(crate) async fn webhook_inbound(
    State(state): State<AppState>,
    Path(route): Path<String>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Response {
    let Some(signature) = headers
        .get("x-itak-signature")
        .and_then(|v| v.to_str().ok())
    else {
        return (StatusCode::UNAUTHORIZED, "missing signature").into_response();
    };
    if let Err(e) = state.webhook.verify(&route, &body, signature) {
        warn!(route, error = %e, "Webhook signature rejected");
        return (StatusCode::UNAUTHORIZED, "bad signature").into_response();
    }
    let request: itak_channels::WebhookRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    };

    match state.webhook.handle(&route, request).await {
        Ok(deliverable) => Json(json!({ "deliverable": deliverable })).into_response(),
        // A blocked callback target is the caller's fault, not a relay
        // failure.
        Err(e) if e.kind() == ErrorKind::PolicyViolation => {
            (StatusCode::FORBIDDEN, e.to_string()).into_response()
        },
        Err(e) => (StatusCode::BAD_GATEWAY, e.to_string()).into_response(),
    }
}
