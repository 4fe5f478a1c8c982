use std::{collections::BTreeMap, sync::Arc};

use anyhow::Result;
use axum::{
    extract::State,
    http::StatusCode,
    response::{
        sse::{Event, Sse},
        IntoResponse,
    },
    routing::{get, post},
    Json, Router,
};
use futures_util::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::{
    orchestrator::{LaunchError, RunOrchestrator, StatusSnapshot},
    preview::PreviewStatus,
};

#[derive(Clone)]
pub struct AppState {
    orch: Arc<RunOrchestrator>,
}

pub fn router(orch: Arc<RunOrchestrator>) -> Router {
    Router::new()
        .route("/api/launch", post(launch))
        .route("/api/runs/current", get(current_run))
        .route("/api/runs/current/stream", get(stream_run))
        .route("/api/runs/current/summary", get(summary))
        .route("/api/runs/current/plans", get(plans))
        .route("/api/runs/current/preview-status", get(preview_status))
        .route("/api/runs/current/start-preview", post(start_preview))
        .layer(CorsLayer::permissive())
        .with_state(AppState { orch })
}

pub async fn serve(bind: String, orch: Arc<RunOrchestrator>) -> Result<()> {
    orch.resume_preview().await;

    let app = router(orch);
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    info!("appgen API listening on http://{bind}");
    axum::serve(listener, app).await?;
    Ok(())
}

#[derive(Deserialize)]
struct LaunchReq {
    vision: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LaunchResp {
    run_id: String,
}

async fn launch(State(st): State<AppState>, Json(req): Json<LaunchReq>) -> Result<Json<LaunchResp>, ApiErr> {
    match st.orch.clone().launch(req.vision.as_deref().unwrap_or_default()).await {
        Ok(()) => Ok(Json(LaunchResp { run_id: "current".into() })),
        Err(LaunchError::InvalidInput) => Err(ApiErr::bad_request("vision is required")),
        Err(e) => Err(ApiErr::internal(e)),
    }
}

async fn current_run(State(st): State<AppState>) -> Json<StatusSnapshot> {
    Json(st.orch.current_status().await)
}

async fn stream_run(
    State(st): State<AppState>,
) -> Result<Sse<impl futures_util::Stream<Item = Result<Event, std::convert::Infallible>>>, ApiErr> {
    let Some((backlog, rx)) = st.orch.subscribe() else {
        return Err(ApiErr::not_found("No active run"));
    };

    // Backlog first, then live events; the channel ends right after `done`.
    let stream = stream::iter(backlog).chain(UnboundedReceiverStream::new(rx)).map(|event| {
        let json = serde_json::to_string(&event).unwrap();
        Ok(Event::default().data(json))
    });
    Ok(Sse::new(stream))
}

async fn summary(State(st): State<AppState>) -> Json<serde_json::Value> {
    let path = st.orch.config().summary_file();
    match tokio::fs::read(&path).await {
        Ok(raw) => match serde_json::from_slice::<serde_json::Value>(&raw) {
            Ok(summary) => Json(json!({ "exists": true, "summary": summary })),
            Err(_) => Json(json!({ "exists": false })),
        },
        Err(_) => Json(json!({ "exists": false })),
    }
}

async fn plans(State(st): State<AppState>) -> Json<serde_json::Value> {
    let dir = st.orch.config().plans_dir();
    let mut plans = BTreeMap::new();
    if let Ok(mut rd) = tokio::fs::read_dir(&dir).await {
        while let Ok(Some(ent)) = rd.next_entry().await {
            let path = ent.path();
            if path.extension().and_then(|s| s.to_str()) != Some("md") {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else { continue };
            if let Ok(content) = tokio::fs::read_to_string(&path).await {
                plans.insert(name.to_string(), content);
            }
        }
    }
    Json(json!({ "plans": plans }))
}

async fn preview_status(State(st): State<AppState>) -> Json<PreviewStatus> {
    Json(st.orch.preview().status().await)
}

async fn start_preview(State(st): State<AppState>) -> Result<Json<serde_json::Value>, ApiErr> {
    match st.orch.preview().start().await {
        Ok(true) => Ok(Json(json!({ "ok": true, "port": st.orch.config().preview_port }))),
        Ok(false) => Err(ApiErr::bad_request("No project to preview")),
        Err(e) => Err(ApiErr::internal(e)),
    }
}

#[derive(Debug)]
struct ApiErr {
    status: StatusCode,
    code: String,
    message: String,
}

impl ApiErr {
    fn internal(e: impl std::fmt::Display) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "internal_error".to_string(),
            message: format!("Internal error: {}", e),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "bad_request".to_string(),
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            code: "not_found".to_string(),
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiErr {
    fn into_response(self) -> axum::response::Response {
        #[derive(Serialize)]
        struct ErrorResponse {
            error: String,
            code: String,
        }
        (
            self.status,
            Json(ErrorResponse { error: self.message, code: self.code }),
        )
            .into_response()
    }
}
