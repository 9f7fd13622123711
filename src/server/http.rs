//! HTTP surface: embedded client shell, token-guarded JSON endpoints, and
//! the WebSocket upgrade.

use std::net::Ipv4Addr;
use std::net::SocketAddr;
use std::net::TcpStream;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::Json;
use axum::extract::Query;
use axum::extract::State;
use axum::extract::ws::WebSocketUpgrade;
use axum::http::HeaderMap;
use axum::http::StatusCode;
use axum::http::header;
use axum::response::Html;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::routing::get;
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::Any;
use tower_http::cors::CorsLayer;

use crate::infra::paths::expand_home;

use super::AppState;
use super::ws;

const UI_INDEX_HTML: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/assets/web/index.html"
));
const UI_APP_JS: &str = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/assets/web/app.js"));
const UI_STYLES_CSS: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/assets/web/styles.css"
));

/// Ports worth probing for the dev-server listing.
const SCAN_PORTS: [u16; 12] = [
    3000, 3001, 4000, 4200, 5000, 5173, 5174, 8000, 8080, 8081, 8888, 9000,
];
const SCAN_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

#[derive(Deserialize)]
struct DirsQuery {
    token: Option<String>,
    path: Option<String>,
}

pub fn build_router(state: Arc<AppState>) -> axum::Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    axum::Router::new()
        .route("/", get(index_handler))
        .route("/app.js", get(app_js_handler))
        .route("/styles.css", get(styles_handler))
        .route("/ws", get(ws_handler))
        .route("/api/health", get(health_handler))
        .route("/api/sessions", get(sessions_handler))
        .route("/api/dirs", get(dirs_handler))
        .route("/api/ports", get(ports_handler))
        .layer(cors)
        .with_state(state)
}

/// Check the request against the shared token: query parameter, bearer
/// header, or the cookie a previous query-token success planted. A query
/// token win sets a fresh 24-hour cookie so nested sub-resource requests
/// authenticate without carrying the token in each URL.
fn require_auth(
    state: &AppState,
    headers: &HeaderMap,
    query_token: Option<&str>,
) -> Result<Option<String>, Response> {
    if let Some(token) = query_token {
        if state.auth.verify(token) {
            return Ok(Some(state.auth.cookie_value()));
        }
    }

    if let Some(bearer) = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
    {
        if state.auth.verify(bearer.trim()) {
            return Ok(None);
        }
    }

    if let Some(cookies) = headers
        .get(header::COOKIE)
        .and_then(|value| value.to_str().ok())
    {
        if state.auth.verify_cookie_header(cookies) {
            return Ok(None);
        }
    }

    Err((
        StatusCode::UNAUTHORIZED,
        Json(json!({ "error": "Unauthorized" })),
    )
        .into_response())
}

fn with_cookie(mut response: Response, cookie: Option<String>) -> Response {
    if let Some(cookie) = cookie {
        if let Ok(value) = cookie.parse() {
            response.headers_mut().insert(header::SET_COOKIE, value);
        }
    }
    response
}

fn asset_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("assets/web")
}

fn serve_asset(state: &AppState, file: &str, embedded: &'static str, content_type: &str) -> Response {
    // DEV_MODE re-reads assets from disk on every request.
    let body = if state.dev_mode {
        std::fs::read_to_string(asset_dir().join(file)).unwrap_or_else(|_| embedded.to_string())
    } else {
        embedded.to_string()
    };
    ([(header::CONTENT_TYPE, content_type.to_string())], body).into_response()
}

async fn index_handler(State(state): State<Arc<AppState>>) -> Response {
    if state.dev_mode {
        return serve_asset(&state, "index.html", UI_INDEX_HTML, "text/html; charset=utf-8");
    }
    Html(UI_INDEX_HTML).into_response()
}

async fn app_js_handler(State(state): State<Arc<AppState>>) -> Response {
    serve_asset(
        &state,
        "app.js",
        UI_APP_JS,
        "application/javascript; charset=utf-8",
    )
}

async fn styles_handler(State(state): State<Arc<AppState>>) -> Response {
    serve_asset(&state, "styles.css", UI_STYLES_CSS, "text/css; charset=utf-8")
}

/// The upgrade itself is unauthenticated; the in-band `auth` command gates
/// every other control frame. Only the connection cap is enforced here.
async fn ws_handler(State(state): State<Arc<AppState>>, ws: WebSocketUpgrade) -> Response {
    let permit = match Arc::clone(&state.ws_limits).try_acquire_owned() {
        Ok(permit) => permit,
        Err(_) => {
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "error": "too many connections" })),
            )
                .into_response();
        }
    };

    ws.on_upgrade(move |socket| async move {
        let _permit = permit;
        ws::handle_socket(socket, state).await;
    })
}

async fn health_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<TokenQuery>,
) -> Response {
    let cookie = match require_auth(&state, &headers, query.token.as_deref()) {
        Ok(cookie) => cookie,
        Err(response) => return response,
    };
    let response = Json(json!({
        "status": "healthy",
        "pid": std::process::id(),
        "uptime_ms": state.started_at.elapsed().as_millis() as u64,
        "session_count": state.manager.session_count(),
        "lock_poison_recoveries": crate::common::poison_recovery_count(),
    }))
    .into_response();
    with_cookie(response, cookie)
}

async fn sessions_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<TokenQuery>,
) -> Response {
    let cookie = match require_auth(&state, &headers, query.token.as_deref()) {
        Ok(cookie) => cookie,
        Err(response) => return response,
    };
    let sessions = state.manager.list();
    with_cookie(Json(json!({ "sessions": sessions })).into_response(), cookie)
}

/// Directory-listing autocomplete for the new-session dialog.
async fn dirs_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<DirsQuery>,
) -> Response {
    let cookie = match require_auth(&state, &headers, query.token.as_deref()) {
        Ok(cookie) => cookie,
        Err(response) => return response,
    };

    let raw = query.path.unwrap_or_else(|| "~".to_string());
    let base = expand_home(&raw);
    let dirs = list_subdirectories(&base);
    with_cookie(
        Json(json!({ "path": base.to_string_lossy(), "dirs": dirs })).into_response(),
        cookie,
    )
}

fn list_subdirectories(base: &Path) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(base) else {
        return Vec::new();
    };
    let mut dirs: Vec<String> = entries
        .flatten()
        .filter(|entry| entry.path().is_dir())
        .filter_map(|entry| {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') { None } else { Some(name) }
        })
        .collect();
    dirs.sort();
    dirs
}

async fn ports_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<TokenQuery>,
) -> Response {
    let cookie = match require_auth(&state, &headers, query.token.as_deref()) {
        Ok(cookie) => cookie,
        Err(response) => return response,
    };
    let ports = tokio::task::spawn_blocking(scan_listening_ports)
        .await
        .unwrap_or_default();
    with_cookie(Json(json!({ "ports": ports })).into_response(), cookie)
}

fn scan_listening_ports() -> Vec<u16> {
    SCAN_PORTS
        .iter()
        .copied()
        .filter(|&port| {
            let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
            TcpStream::connect_timeout(&addr, SCAN_TIMEOUT).is_ok()
        })
        .collect()
}
