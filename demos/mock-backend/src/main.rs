//! In-memory backend for trying the livecrud client end to end.
//!
//! Run with: cargo run -p livecrud-mock-backend
//!
//! Serves the auth endpoints under `/api/accounts/`, a `shapes` resource
//! under `/api/shapes/`, and pushes change notifications on `/ws/shapes/`.
//! Log in as `admin` / `secret` (override with `MOCK_USERNAME` and
//! `MOCK_PASSWORD`).

use std::{
    collections::{BTreeMap, HashMap},
    net::SocketAddr,
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use axum::{
    Json, Router,
    extract::{
        Path, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::{HeaderMap, StatusCode, header},
    response::{AppendHeaders, IntoResponse, Response},
    routing::{get, patch, post},
};
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use futures::{SinkExt, StreamExt};
use livecrud_core::{ChangeNotification, Record, RecordId, credential::unix_now};
use livecrud_transport::protocol;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use tokio::sync::{RwLock, broadcast};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

const SHAPE_KINDS: [&str; 3] = ["circle", "square", "triangle"];

#[derive(Default)]
struct Tokens {
    /// Access token -> expiry (Unix seconds).
    access: HashMap<String, i64>,
    /// Refresh token -> CSRF token bound to it.
    refresh: HashMap<String, String>,
}

#[derive(Default)]
struct Shapes {
    next_id: i64,
    records: BTreeMap<i64, Record>,
}

/// Application state shared across handlers.
#[derive(Clone)]
struct AppState {
    username: Arc<str>,
    password: Arc<str>,
    access_ttl: Duration,
    tokens: Arc<RwLock<Tokens>>,
    shapes: Arc<RwLock<Shapes>>,
    changes: broadcast::Sender<ChangeNotification>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=debug".into()),
        )
        .init();

    let access_ttl = std::env::var("MOCK_ACCESS_TTL_SECS")
        .ok()
        .and_then(|s| s.parse().ok())
        .map_or(Duration::from_secs(15 * 60), Duration::from_secs);
    let addr: SocketAddr = std::env::var("MOCK_ADDR")
        .unwrap_or_else(|_| "127.0.0.1:8000".to_string())
        .parse()
        .context("MOCK_ADDR must be host:port")?;

    let (changes, _) = broadcast::channel(256);
    let state = AppState {
        username: std::env::var("MOCK_USERNAME").unwrap_or_else(|_| "admin".into()).into(),
        password: std::env::var("MOCK_PASSWORD").unwrap_or_else(|_| "secret".into()).into(),
        access_ttl,
        tokens: Arc::default(),
        shapes: Arc::default(),
        changes,
    };
    seed(&state).await;

    let app = Router::new()
        .route("/api/accounts/login/", post(login))
        .route("/api/accounts/logout/", post(logout))
        .route("/api/accounts/token/refresh/", post(refresh))
        .route("/api/accounts/token/verify/", post(verify))
        .route("/api/shapes/", get(list_shapes).post(create_shape))
        .route("/api/shapes/{id}/", patch(update_shape).delete(delete_shape))
        .route("/ws/shapes/", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    tracing::info!(?access_ttl, "Mock backend listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    axum::serve(listener, app).await.context("Server error")?;
    Ok(())
}

async fn seed(state: &AppState) {
    let mut shapes = state.shapes.write().await;
    for (name, kind, color) in [
        ("Sun", "circle", "#f5c542"),
        ("Window", "square", "#4287f5"),
    ] {
        shapes.next_id += 1;
        let id = shapes.next_id;
        let record = Record::new(id)
            .with_field("name", name)
            .with_field("shape", kind)
            .with_field("color", color);
        shapes.records.insert(id, record);
    }
}

// ---------------------------------------------------------------------------
// Auth
// ---------------------------------------------------------------------------

/// An unsigned JWT-shaped token whose payload carries `exp`.
fn issue_access(username: &str, ttl: Duration) -> (String, i64) {
    let exp = unix_now() + i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX / 2);
    let header = URL_SAFE_NO_PAD.encode(r#"{"alg":"none","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(
        json!({"sub": username, "exp": exp, "jti": Uuid::new_v4()}).to_string(),
    );
    (format!("{header}.{payload}.unsigned"), exp)
}

fn cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    let cookies = headers.get(header::COOKIE)?.to_str().ok()?;
    cookies.split(';').find_map(|pair| {
        let (key, value) = pair.trim().split_once('=')?;
        (key == name).then(|| value.to_string())
    })
}

fn bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

fn unauthorized(detail: &str) -> Response {
    (StatusCode::UNAUTHORIZED, Json(json!({ "detail": detail }))).into_response()
}

async fn authorized(state: &AppState, headers: &HeaderMap) -> bool {
    let Some(token) = bearer(headers) else {
        return false;
    };
    state
        .tokens
        .read()
        .await
        .access
        .get(token)
        .is_some_and(|exp| *exp > unix_now())
}

fn csrf_ok(headers: &HeaderMap, expected: &str) -> bool {
    headers.get("x-csrftoken").and_then(|v| v.to_str().ok()) == Some(expected)
}

#[derive(Deserialize)]
struct LoginBody {
    username: String,
    password: String,
}

async fn login(State(state): State<AppState>, Json(body): Json<LoginBody>) -> Response {
    if body.username != *state.username || body.password != *state.password {
        tracing::info!(username = %body.username, "Rejected login");
        return unauthorized("No active account found with the given credentials");
    }

    let (access, exp) = issue_access(&body.username, state.access_ttl);
    let refresh = Uuid::new_v4().to_string();
    let csrf = Uuid::new_v4().simple().to_string();
    {
        let mut tokens = state.tokens.write().await;
        tokens.access.insert(access.clone(), exp);
        tokens.refresh.insert(refresh.clone(), csrf.clone());
    }
    tracing::info!(username = %body.username, "Logged in");

    (
        AppendHeaders([
            (
                header::SET_COOKIE,
                format!("refresh_token={refresh}; Path=/; HttpOnly; SameSite=Lax"),
            ),
            (header::SET_COOKIE, format!("csrftoken={csrf}; Path=/; SameSite=Lax")),
        ]),
        Json(json!({
            "access": access,
            "user": {"id": 1, "username": body.username, "email": "admin@example.com"},
        })),
    )
        .into_response()
}

async fn logout(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let mut tokens = state.tokens.write().await;
    if let Some(token) = bearer(&headers) {
        tokens.access.remove(token);
    }
    if let Some(refresh) = cookie(&headers, "refresh_token") {
        tokens.refresh.remove(&refresh);
    }
    tracing::info!("Logged out");
    (
        StatusCode::NO_CONTENT,
        AppendHeaders([(
            header::SET_COOKIE,
            "refresh_token=; Path=/; Max-Age=0".to_string(),
        )]),
    )
        .into_response()
}

async fn refresh(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let Some(refresh) = cookie(&headers, "refresh_token") else {
        return unauthorized("Refresh token missing");
    };
    let mut tokens = state.tokens.write().await;
    let Some(csrf) = tokens.refresh.get(&refresh) else {
        return unauthorized("Refresh token invalid");
    };
    if !csrf_ok(&headers, csrf) {
        return (StatusCode::FORBIDDEN, Json(json!({"detail": "CSRF Failed"}))).into_response();
    }

    let (access, exp) = issue_access(&state.username, state.access_ttl);
    tokens.access.insert(access.clone(), exp);
    tracing::info!("Issued refreshed access token");
    Json(json!({ "access": access })).into_response()
}

#[derive(Deserialize)]
struct VerifyBody {
    token: String,
}

async fn verify(State(state): State<AppState>, Json(body): Json<VerifyBody>) -> Response {
    let valid = state
        .tokens
        .read()
        .await
        .access
        .get(&body.token)
        .is_some_and(|exp| *exp > unix_now());
    if valid {
        Json(json!({})).into_response()
    } else {
        unauthorized("Token is invalid or expired")
    }
}

// ---------------------------------------------------------------------------
// Shapes
// ---------------------------------------------------------------------------

/// Check the writable fields, returning DRF-style field errors.
fn validate(body: &Map<String, Value>, partial: bool) -> Result<(), Value> {
    let mut errors = Map::new();
    for field in ["name", "shape", "color"] {
        match body.get(field) {
            None if !partial => {
                errors.insert(field.into(), json!(["This field is required."]));
            }
            Some(value) if value.as_str().is_none_or(str::is_empty) => {
                errors.insert(field.into(), json!(["This field may not be blank."]));
            }
            _ => {}
        }
    }
    if let Some(kind) = body.get("shape").and_then(Value::as_str) {
        if !SHAPE_KINDS.contains(&kind) {
            errors.insert(
                "shape".into(),
                json!([format!("\"{kind}\" is not a valid choice.")]),
            );
        }
    }
    if errors.is_empty() {
        Ok(())
    } else {
        Err(Value::Object(errors))
    }
}

fn announce(state: &AppState, notification: ChangeNotification) {
    let receivers = state.changes.send(notification).unwrap_or(0);
    tracing::debug!(receivers, "Broadcast change");
}

async fn list_shapes(State(state): State<AppState>) -> Json<Vec<Record>> {
    let shapes = state.shapes.read().await;
    // Newest first.
    Json(shapes.records.values().rev().cloned().collect())
}

async fn create_shape(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Map<String, Value>>,
) -> Response {
    if !authorized(&state, &headers).await {
        return unauthorized("Authentication credentials were not provided or are invalid");
    }
    if let Err(errors) = validate(&body, false) {
        return (StatusCode::BAD_REQUEST, Json(errors)).into_response();
    }

    let record = {
        let mut shapes = state.shapes.write().await;
        shapes.next_id += 1;
        let id = shapes.next_id;
        let mut record = Record::new(id);
        record.fields = body;
        record.fields.remove("id");
        shapes.records.insert(id, record.clone());
        record
    };
    tracing::info!(id = %record.id, "Created shape");
    announce(&state, ChangeNotification::Created(record.clone()));
    (StatusCode::CREATED, Json(record)).into_response()
}

async fn update_shape(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
    Json(body): Json<Map<String, Value>>,
) -> Response {
    if !authorized(&state, &headers).await {
        return unauthorized("Authentication credentials were not provided or are invalid");
    }
    if let Err(errors) = validate(&body, true) {
        return (StatusCode::BAD_REQUEST, Json(errors)).into_response();
    }

    let record = {
        let mut shapes = state.shapes.write().await;
        let Some(record) = shapes.records.get_mut(&id) else {
            return (StatusCode::NOT_FOUND, Json(json!({"detail": "Not found."}))).into_response();
        };
        for (key, value) in body {
            if key != "id" {
                record.fields.insert(key, value);
            }
        }
        record.clone()
    };
    tracing::info!(id, "Updated shape");
    announce(&state, ChangeNotification::Updated(record.clone()));
    Json(record).into_response()
}

async fn delete_shape(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
) -> Response {
    if !authorized(&state, &headers).await {
        return unauthorized("Authentication credentials were not provided or are invalid");
    }
    let csrf_valid = match cookie(&headers, "refresh_token") {
        Some(refresh) => state
            .tokens
            .read()
            .await
            .refresh
            .get(&refresh)
            .is_some_and(|csrf| csrf_ok(&headers, csrf)),
        None => false,
    };
    if !csrf_valid {
        return (StatusCode::FORBIDDEN, Json(json!({"detail": "CSRF Failed"}))).into_response();
    }

    if state.shapes.write().await.records.remove(&id).is_none() {
        return (StatusCode::NOT_FOUND, Json(json!({"detail": "Not found."}))).into_response();
    }
    tracing::info!(id, "Deleted shape");
    announce(&state, ChangeNotification::Deleted(RecordId::Int(id)));
    StatusCode::NO_CONTENT.into_response()
}

// ---------------------------------------------------------------------------
// Realtime
// ---------------------------------------------------------------------------

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let ws_id = Uuid::new_v4();
    let mut changes = state.changes.subscribe();
    tracing::info!(%ws_id, "Realtime client connected");

    // Forward every change to this client.
    let send_task = tokio::spawn(async move {
        loop {
            let notification = match changes.recv().await {
                Ok(notification) => notification,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(%ws_id, skipped, "Realtime client lagging");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            let text = protocol::encode(&notification);
            if ws_sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    // Receive-only protocol: just wait for the client to go away.
    while let Some(msg) = ws_receiver.next().await {
        match msg {
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(%ws_id, "WebSocket error: {e}");
                break;
            }
        }
    }

    send_task.abort();
    tracing::info!(%ws_id, "Realtime client disconnected");
}
