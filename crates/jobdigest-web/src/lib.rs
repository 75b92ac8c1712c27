//! HTML digest of consolidated matches, plus a small read-only viewer.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use askama::Template;
use axum::{
    extract::State,
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::get,
    Json, Router,
};
use jobdigest_core::MatchRecord;
use jobdigest_storage::replace_atomically;
use tokio::net::TcpListener;
use tracing::info;

pub const CRATE_NAME: &str = "jobdigest-web";

pub const DIGEST_FILE: &str = "email_body.html";
const MATCHES_FILE: &str = "matches.json";

/// One digest entry with placeholders already applied.
#[derive(Debug, Clone, PartialEq)]
pub struct DigestRow {
    pub title: String,
    pub employer: String,
    pub link: String,
    pub reason: String,
}

impl From<&MatchRecord> for DigestRow {
    fn from(record: &MatchRecord) -> Self {
        Self {
            title: record.title().unwrap_or_else(|| "Sin título".to_string()),
            employer: record.employer().unwrap_or_else(|| "Sin empresa".to_string()),
            link: record.link_offer().unwrap_or_else(|| "#".to_string()),
            reason: record.reason().unwrap_or_default(),
        }
    }
}

#[derive(Template)]
#[template(path = "digest.html")]
struct DigestTemplate {
    rows: Vec<DigestRow>,
}

pub fn render_digest(matches: &[MatchRecord]) -> anyhow::Result<String> {
    let rows = matches.iter().map(DigestRow::from).collect();
    DigestTemplate { rows }
        .render()
        .context("rendering digest template")
}

pub async fn write_digest(path: &Path, matches: &[MatchRecord]) -> anyhow::Result<()> {
    let html = render_digest(matches)?;
    replace_atomically(path, html.as_bytes()).await?;
    info!(path = %path.display(), entries = matches.len(), "digest written");
    Ok(())
}

/// Reads a consolidated match list; a missing file is an empty list.
pub async fn load_matches(path: &Path) -> anyhow::Result<Vec<MatchRecord>> {
    let text = match tokio::fs::read_to_string(path).await {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => {
            return Err(err).with_context(|| format!("reading {}", path.display()));
        }
    };
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

#[derive(Clone)]
pub struct AppState {
    pub data_dir: PathBuf,
}

impl AppState {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    fn matches_path(&self) -> PathBuf {
        self.data_dir.join(MATCHES_FILE)
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(digest_handler))
        .route("/matches.json", get(matches_json_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("JOBDIGEST_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let data_dir = std::env::var("JOBDIGEST_DATA_DIR").unwrap_or_else(|_| "data".to_string());
    let state = AppState::new(data_dir);
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, data_dir = %state.data_dir.display(), "digest viewer listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn digest_handler(State(state): State<Arc<AppState>>) -> Response {
    match load_matches(&state.matches_path()).await {
        Ok(matches) => render_html(DigestTemplate {
            rows: matches.iter().map(DigestRow::from).collect(),
        }),
        Err(err) => server_error(err),
    }
}

async fn matches_json_handler(State(state): State<Arc<AppState>>) -> Response {
    match load_matches(&state.matches_path()).await {
        Ok(matches) => Json(matches).into_response(),
        Err(err) => server_error(err),
    }
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => server_error(anyhow::anyhow!(err.to_string())),
    }
}

fn server_error(err: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Html(format!("Server error: {:#}", err)),
    )
        .into_response()
}
