// HTTP front tests, driven through the router without a socket.

use anyhow::Result;
use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

use fleet_vm_manager::config::Settings;
use fleet_vm_manager::core::SimulatedDiskImages;
use fleet_vm_manager::hypervisor::SimulatedHypervisor;
use fleet_vm_manager::{
    create_router, AppState, FleetOrchestrator, InMemoryFleetStore, ProgressTracker,
};

fn router() -> Router {
    let sim = SimulatedHypervisor::demo();
    sim.set_task_polls(0);
    let orchestrator = FleetOrchestrator::new(
        Arc::new(sim),
        Arc::new(SimulatedDiskImages::new()),
        Arc::new(InMemoryFleetStore::new()),
        Arc::new(ProgressTracker::default()),
        &Settings::default(),
    );
    create_router(AppState { orchestrator }, "/api/v1", 8)
}

async fn send(
    router: &Router,
    method: Method,
    uri: &str,
    body: Option<Value>,
) -> Result<(StatusCode, Value)> {
    let mut request = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(value) => {
            request = request.header(header::CONTENT_TYPE, "application/json");
            Body::from(serde_json::to_vec(&value)?)
        }
        None => Body::empty(),
    };
    let response = router.clone().oneshot(request.body(body)?).await?;
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await?;
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes)?
    };
    Ok((status, value))
}

#[tokio::test]
async fn test_health() -> Result<()> {
    let router = router();
    let (status, body) = send(&router, Method::GET, "/api/v1/health", None).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    Ok(())
}

#[tokio::test]
async fn test_unknown_job_is_404() -> Result<()> {
    let router = router();
    let (status, body) = send(&router, Method::GET, "/api/v1/jobs/does-not-exist", None).await?;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["status"], "not_found");
    assert_eq!(body["job_id"], "does-not-exist");
    Ok(())
}

#[tokio::test]
async fn test_unknown_class_is_404() -> Result<()> {
    let router = router();
    let (status, body) = send(&router, Method::GET, "/api/v1/classes/ghost", None).await?;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["status"], "error");

    let (status, _) = send(&router, Method::POST, "/api/v1/classes/ghost/push", None).await?;
    assert_eq!(status, StatusCode::NOT_FOUND);
    Ok(())
}

#[tokio::test]
async fn test_deploy_is_accepted_and_tracked() -> Result<()> {
    let router = router();
    let request = json!({
        "source": { "vmid": 9000, "node": "pve1" },
        "student_count": 2
    });
    let uri = "/api/v1/classes/lab-1/deploy";
    let (status, body) = send(&router, Method::POST, uri, Some(request)).await?;
    assert_eq!(status, StatusCode::ACCEPTED);
    let job_id = body["job_id"].as_str().expect("job id").to_string();

    let uri = format!("/api/v1/jobs/{}", job_id);
    let (status, progress) = send(&router, Method::GET, &uri, None).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(progress["job_id"], job_id.as_str());
    assert_eq!(progress["class_id"], "lab-1");
    Ok(())
}

#[tokio::test]
async fn test_invalid_deploy_is_400() -> Result<()> {
    let router = router();
    let request = json!({
        "source": { "vmid": 9000, "node": "pve1" },
        "student_count": 10_000
    });
    let uri = "/api/v1/classes/lab-2/deploy";
    let (status, body) = send(&router, Method::POST, uri, Some(request)).await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["status"], "error");
    Ok(())
}

#[tokio::test]
async fn test_nodes_are_ranked() -> Result<()> {
    let router = router();
    let (status, body) = send(&router, Method::GET, "/api/v1/nodes", None).await?;
    assert_eq!(status, StatusCode::OK);
    let nodes = body.as_array().expect("node list");
    assert_eq!(nodes.len(), 3);
    assert_eq!(nodes[0]["score"], 100.0);
    Ok(())
}

#[tokio::test]
async fn test_unrouted_path_is_404() -> Result<()> {
    let router = router();
    let (status, _) = send(&router, Method::GET, "/nope", None).await?;
    assert_eq!(status, StatusCode::NOT_FOUND);
    Ok(())
}
