use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tower::limit::ConcurrencyLimitLayer;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::info;

use super::error::ApiError;
use crate::core::CloudInit;
use crate::errors::FleetError;
use crate::fleet::{ClassFleet, ClassRequest, DiskMode, FleetOrchestrator};
use crate::hypervisor::VmRef;
use crate::scheduler::{rank, NodeScore, PlacementEstimate};

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: FleetOrchestrator,
}

/// Body of a deploy call; the class id comes from the path.
#[derive(Debug, Clone, Deserialize)]
pub struct DeployRequest {
    pub source: VmRef,
    pub student_count: usize,
    #[serde(default)]
    pub create_teacher: Option<bool>,
    #[serde(default)]
    pub create_base: Option<bool>,
    #[serde(default)]
    pub disk_mode: DiskMode,
    #[serde(default)]
    pub name_prefix: Option<String>,
    #[serde(default)]
    pub estimate: Option<PlacementEstimate>,
    #[serde(default)]
    pub storage: Option<String>,
    #[serde(default)]
    pub cloud_init: Option<CloudInit>,
    #[serde(default)]
    pub start_after_create: bool,
}

impl DeployRequest {
    fn into_class_request(self, class_id: String) -> ClassRequest {
        let mut request = ClassRequest::new(class_id, self.source, self.student_count);
        request.create_teacher = self.create_teacher.unwrap_or(true);
        request.create_base = self.create_base.unwrap_or(true);
        request.disk_mode = self.disk_mode;
        request.name_prefix = self.name_prefix;
        request.estimate = self.estimate;
        request.storage = self.storage;
        request.cloud_init = self.cloud_init;
        request.start_after_create = self.start_after_create;
        request
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct DeleteParams {
    #[serde(default)]
    pub force_skip_hypervisor: bool,
}

#[derive(Debug, Serialize)]
pub struct JobAccepted {
    pub job_id: String,
}

fn accepted(job_id: String) -> (StatusCode, Json<JobAccepted>) {
    (StatusCode::ACCEPTED, Json(JobAccepted { job_id }))
}

pub fn create_router(state: AppState, api_prefix: &str, max_concurrent_requests: usize) -> Router {
    let routes = Router::new()
        .route("/health", get(health))
        .route("/nodes", get(list_nodes))
        .route("/classes", get(list_classes))
        .route("/classes/{class_id}", get(get_class).delete(delete_class))
        .route("/classes/{class_id}/deploy", post(deploy_class))
        .route("/classes/{class_id}/save", post(save_template))
        .route("/classes/{class_id}/push", post(push_template))
        .route("/classes/{class_id}/vms/{vmid}/reimage", post(reimage_vm))
        .route("/classes/{class_id}/vms/{vmid}/revert", post(revert_vm))
        .route("/jobs/{job_id}", get(get_job));

    let prefix = api_prefix.trim_matches('/');
    let router = if prefix.is_empty() {
        Router::new().merge(routes)
    } else {
        Router::new().nest(&format!("/{}", prefix), routes)
    };

    router
        .fallback(fallback_handler)
        .with_state(Arc::new(state))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(ConcurrencyLimitLayer::new(max_concurrent_requests.max(1))),
        )
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn list_nodes(State(state): State<Arc<AppState>>) -> Result<Json<Vec<NodeScore>>, ApiError> {
    let nodes = state.orchestrator.list_nodes().await?;
    Ok(Json(rank(&nodes)))
}

async fn list_classes(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<ClassFleet>>, ApiError> {
    Ok(Json(state.orchestrator.list_classes().await?))
}

async fn get_class(
    State(state): State<Arc<AppState>>,
    Path(class_id): Path<String>,
) -> Result<Json<ClassFleet>, ApiError> {
    state
        .orchestrator
        .class(&class_id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError(FleetError::ClassNotFound { class_id }))
}

async fn deploy_class(
    State(state): State<Arc<AppState>>,
    Path(class_id): Path<String>,
    Json(body): Json<DeployRequest>,
) -> Result<impl IntoResponse, ApiError> {
    info!(class_id = class_id.as_str(), students = body.student_count, "Deploy requested");
    let job_id = state
        .orchestrator
        .start_fleet_job(body.into_class_request(class_id))
        .await?;
    Ok(accepted(job_id))
}

async fn save_template(
    State(state): State<Arc<AppState>>,
    Path(class_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let job_id = state.orchestrator.save_teacher_edits_to_template(&class_id).await?;
    Ok(accepted(job_id))
}

async fn push_template(
    State(state): State<Arc<AppState>>,
    Path(class_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let job_id = state.orchestrator.push_template_to_students(&class_id).await?;
    Ok(accepted(job_id))
}

async fn reimage_vm(
    State(state): State<Arc<AppState>>,
    Path((class_id, vmid)): Path<(String, u32)>,
) -> Result<impl IntoResponse, ApiError> {
    let job_id = state.orchestrator.reimage_vm(&class_id, vmid).await?;
    Ok(accepted(job_id))
}

async fn revert_vm(
    State(state): State<Arc<AppState>>,
    Path((class_id, vmid)): Path<(String, u32)>,
) -> Result<impl IntoResponse, ApiError> {
    let job_id = state.orchestrator.revert_vm_to_baseline(&class_id, vmid).await?;
    Ok(accepted(job_id))
}

async fn delete_class(
    State(state): State<Arc<AppState>>,
    Path(class_id): Path<String>,
    Query(params): Query<DeleteParams>,
) -> Result<impl IntoResponse, ApiError> {
    let job_id = state
        .orchestrator
        .delete_class_fleet(&class_id, params.force_skip_hypervisor)
        .await?;
    Ok(accepted(job_id))
}

async fn get_job(State(state): State<Arc<AppState>>, Path(job_id): Path<String>) -> Response {
    match state.orchestrator.get_job_progress(&job_id) {
        Some(progress) => Json(progress).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "status": "not_found", "job_id": job_id })),
        )
            .into_response(),
    }
}

async fn fallback_handler() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "status": "error", "message": "no such route" })),
    )
}
