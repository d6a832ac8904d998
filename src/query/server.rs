use axum::{
    extract::{Query, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::core::Project;
use crate::error::IndexError;
use crate::event::EventPipeline;
use crate::index::{FileBasedIndex, ValueHit};
use crate::stats::{EngineReport, EventPipelineStats};

#[derive(Deserialize)]
pub struct LookupParams {
    pub index: String,
    /// JSON 文本或裸字符串
    pub key: String,
    pub project: Option<String>,
}

#[derive(Serialize, Debug, PartialEq, Eq)]
pub struct FileResult {
    pub id: u32,
    pub path: String,
}

#[derive(Serialize)]
pub struct StatusResponse {
    pub engine: EngineReport,
    pub pipeline: Option<EventPipelineStats>,
}

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<FileBasedIndex>,
    pub pipeline: Option<Arc<EventPipeline>>,
}

type ApiError = (StatusCode, String);

fn api_error(e: IndexError) -> ApiError {
    let status = match &e {
        IndexError::UnknownIndex(_) | IndexError::UnknownProject(_) => StatusCode::NOT_FOUND,
        IndexError::BadKey { .. } | IndexError::TypeMismatch(_) => StatusCode::BAD_REQUEST,
        IndexError::Unavailable(_) | IndexError::Closed => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, e.to_string())
}

pub struct QueryServer {
    state: AppState,
}

impl QueryServer {
    pub fn new(engine: Arc<FileBasedIndex>, pipeline: Option<Arc<EventPipeline>>) -> Self {
        Self {
            state: AppState { engine, pipeline },
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/data", get(data_handler))
            .route("/files", get(files_handler))
            .route("/status", get(status_handler))
            .with_state(self.state.clone())
    }

    pub async fn run(self, port: u16) -> anyhow::Result<()> {
        let app = self.router();
        let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;
        tracing::info!("HTTP Query Server listening on port {}", port);
        axum::serve(listener, app).await?;
        Ok(())
    }
}

fn resolve_project(engine: &FileBasedIndex, name: Option<&str>) -> Result<Option<Project>, ApiError> {
    name.map(|n| engine.project(n)).transpose().map_err(api_error)
}

pub async fn data_handler(
    Query(params): Query<LookupParams>,
    State(state): State<AppState>,
) -> Result<Json<Vec<ValueHit>>, ApiError> {
    let project = resolve_project(&state.engine, params.project.as_deref())?;
    let hits = state
        .engine
        .lookup(&params.index, &params.key, project.as_ref())
        .map_err(api_error)?;
    Ok(Json(hits))
}

pub async fn files_handler(
    Query(params): Query<LookupParams>,
    State(state): State<AppState>,
) -> Result<Json<Vec<FileResult>>, ApiError> {
    let project = resolve_project(&state.engine, params.project.as_deref())?;
    let hits = state
        .engine
        .lookup(&params.index, &params.key, project.as_ref())
        .map_err(api_error)?;

    let ids: BTreeSet<u32> = hits.iter().flat_map(|h| h.input_ids.iter().copied()).collect();
    let files = ids
        .into_iter()
        .filter_map(|id| state.engine.file_ids().handle(id))
        .map(|h| FileResult {
            id: h.id,
            path: h.path.to_string_lossy().into_owned(),
        })
        .collect();
    Ok(Json(files))
}

pub async fn status_handler(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        engine: state.engine.report(),
        pipeline: state.pipeline.as_ref().map(|p| p.stats()),
    })
}
