//! API integration tests for manifest reads, status polling and deletion.
//!
//! Tests verify:
//! - Manifest document shape and headers
//! - Error cases (missing resource, private resource, not ready)
//! - Status endpoint progress reporting
//! - Owner-only deletion and ledger release

use std::path::PathBuf;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::Value;
use tower::ServiceExt;

use iiif_depot::model::{Image, ImageStatus, Job, JobStatus, Resource, ResourceStatus, User};
use iiif_depot::store::{MemoryStore, Store};
use iiif_depot::{
    create_router, ManifestConfig, QuotaLedger, ResourceService, RouterConfig, Visibility,
};

use super::test_utils::{BASE_URL, IMAGE_SERVICE_URL, OWNER};

// =============================================================================
// Fixtures
// =============================================================================

struct Api {
    router: Router,
    store: Arc<MemoryStore>,
    ledger: Arc<QuotaLedger>,
}

fn ready_image(id: &str, resource_id: &str, order_index: i64, width: u32, height: u32) -> Image {
    let mut image = Image::uploaded(
        id,
        resource_id,
        OWNER,
        format!("{}.jpg", id),
        format!("/nonexistent/upload/{}.jpg", id),
        100,
        order_index,
    );
    image.status = ImageStatus::Ready;
    image.width = Some(width);
    image.height = Some(height);
    image.output_path = Some(PathBuf::from(format!("/nonexistent/ptiff/{}.tif", id)));
    image.output_size = Some(1000);
    image
}

async fn api_with(config: RouterConfig) -> Api {
    let store = Arc::new(MemoryStore::new());
    store.insert_user(&User::new(OWNER, 1 << 20)).await.unwrap();
    store.insert_user(&User::new("bob", 1 << 20)).await.unwrap();

    // Ready, public, two pages stored out of order
    let mut ready = Resource::new("ready", OWNER, "Scroll")
        .with_attribution("City Library")
        .with_metadata(r#"[{"label":"Date","value":"1701"}]"#);
    ready.status = ResourceStatus::Ready;
    store.insert_resource(&ready).await.unwrap();
    store
        .insert_image(&ready_image("p2", "ready", 1, 640, 480))
        .await
        .unwrap();
    store
        .insert_image(&ready_image("p1", "ready", 0, 1024, 768))
        .await
        .unwrap();

    let mut private = Resource::new("private", OWNER, "Diary").with_visibility(Visibility::Private);
    private.status = ResourceStatus::Ready;
    store.insert_resource(&private).await.unwrap();
    store
        .insert_image(&ready_image("d1", "private", 0, 300, 200))
        .await
        .unwrap();

    // Still converting: one page done, one in flight
    store
        .insert_resource(&Resource::new("busy", OWNER, "Atlas"))
        .await
        .unwrap();
    store
        .insert_image(&ready_image("b1", "busy", 0, 500, 500))
        .await
        .unwrap();
    let mut in_flight = Image::uploaded("b2", "busy", OWNER, "b2.png", "/nonexistent/b2.png", 50, 1);
    in_flight.status = ImageStatus::Processing;
    in_flight.job_id = Some("process-b2".to_string());
    store.insert_image(&in_flight).await.unwrap();
    let mut job = Job::waiting("process-b2", "b2");
    job.status = JobStatus::Active;
    job.progress = 30;
    store.insert_job(&job).await.unwrap();

    let ledger = Arc::new(QuotaLedger::new(store.clone()));
    // Uploads plus outputs of every seeded image
    ledger.credit(OWNER, 4 * 1100 + 50).await.unwrap();

    let service = Arc::new(ResourceService::new(
        store.clone(),
        Arc::clone(&ledger),
        ManifestConfig::new(BASE_URL, IMAGE_SERVICE_URL),
    ));
    let router = create_router(service, config);

    Api {
        router,
        store,
        ledger,
    }
}

async fn api() -> Api {
    api_with(RouterConfig::new().with_tracing(false)).await
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, http::HeaderMap, Vec<u8>) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, headers, body.to_vec())
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn get_as(uri: &str, user: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header("X-Depot-User", user)
        .body(Body::empty())
        .unwrap()
}

fn json(body: &[u8]) -> Value {
    serde_json::from_slice(body).unwrap()
}

// =============================================================================
// Manifest
// =============================================================================

#[tokio::test]
async fn test_manifest_success() {
    let api = api().await;
    let request = Request::builder()
        .uri("/iiif/manifests/ready/manifest.json")
        .header("Origin", "https://viewer.example")
        .body(Body::empty())
        .unwrap();

    let (status, headers, body) = send(&api.router, request).await;
    assert_eq!(status, StatusCode::OK);

    let content_type = headers.get("content-type").unwrap().to_str().unwrap();
    assert!(content_type.starts_with("application/ld+json"));
    assert_eq!(headers.get("cache-control").unwrap(), "public, max-age=3600");
    assert_eq!(headers.get("access-control-allow-origin").unwrap(), "*");

    let manifest = json(&body);
    assert_eq!(
        manifest["@context"],
        "http://iiif.io/api/presentation/3/context.json"
    );
    assert_eq!(manifest["type"], "Manifest");
    assert_eq!(
        manifest["id"],
        format!("{}/iiif/manifests/ready/manifest.json", BASE_URL)
    );
    assert_eq!(manifest["label"]["none"][0], "Scroll");
    assert_eq!(manifest["label"]["ja"][0], "Scroll");
    assert_eq!(manifest["requiredStatement"]["value"]["ja"][0], "City Library");
    assert_eq!(manifest["metadata"][0]["label"]["ja"][0], "Date");
    assert!(manifest.get("summary").is_none());

    // Canvases follow order_index, not insertion order
    let items = manifest["items"].as_array().unwrap();
    assert_eq!(items.len(), 2);
    assert_eq!(
        items[0]["id"],
        format!("{}/iiif/manifests/ready/canvas/0", BASE_URL)
    );
    assert_eq!(items[0]["width"], 1024);
    assert_eq!(items[1]["width"], 640);

    let annotation = &items[0]["items"][0]["items"][0];
    assert_eq!(annotation["motivation"], "painting");
    assert_eq!(
        annotation["body"]["id"],
        format!("{}/p1/full/max/0/default.jpg", IMAGE_SERVICE_URL)
    );
    assert_eq!(annotation["body"]["service"][0]["type"], "ImageService2");
}

#[tokio::test]
async fn test_manifest_not_found() {
    let api = api().await;
    let (status, _, body) = send(&api.router, get("/iiif/manifests/nope/manifest.json")).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    let error = json(&body);
    assert_eq!(error["error"], "not_found");
    assert_eq!(error["status"], 404);
}

#[tokio::test]
async fn test_private_manifest_access() {
    let api = api().await;
    let uri = "/iiif/manifests/private/manifest.json";

    let (status, _, body) = send(&api.router, get(uri)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(json(&body)["error"], "access_denied");

    let (status, _, _) = send(&api.router, get_as(uri, "bob")).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, headers, _) = send(&api.router, get_as(uri, OWNER)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers.get("cache-control").unwrap(), "private, no-store");
}

#[tokio::test]
async fn test_manifest_not_ready() {
    let api = api().await;
    let (status, headers, body) =
        send(&api.router, get("/iiif/manifests/busy/manifest.json")).await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(headers.get("retry-after").unwrap(), "5");
    let error = json(&body);
    assert_eq!(error["error"], "not_ready");
    assert!(error["message"].as_str().unwrap().contains("processing"));
}

// =============================================================================
// Status
// =============================================================================

#[tokio::test]
async fn test_status_reports_progress() {
    let api = api().await;
    let (status, headers, body) = send(&api.router, get("/api/resources/busy/status")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers.get("cache-control").unwrap(), "no-store");

    let report = json(&body);
    assert_eq!(report["resource_id"], "busy");
    assert_eq!(report["status"], "processing");
    assert_eq!(report["all_terminal"], false);

    let images = report["images"].as_array().unwrap();
    assert_eq!(images.len(), 2);
    assert_eq!(images[0]["status"], "ready");
    // No Job row for b1, so progress falls back to 0
    assert_eq!(images[0]["progress"], 0);
    assert_eq!(images[1]["status"], "processing");
    assert_eq!(images[1]["progress"], 30);
    assert!(images[1].get("error").is_none());
}

#[tokio::test]
async fn test_status_not_found() {
    let api = api().await;
    let (status, _, _) = send(&api.router, get("/api/resources/nope/status")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

// =============================================================================
// Deletion
// =============================================================================

fn delete_as(uri: &str, user: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method("DELETE").uri(uri);
    if let Some(user) = user {
        builder = builder.header("X-Depot-User", user);
    }
    builder.body(Body::empty()).unwrap()
}

#[tokio::test]
async fn test_delete_requires_owner() {
    let api = api().await;

    let (status, _, _) = send(&api.router, delete_as("/api/resources/ready", None)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _, _) = send(&api.router, delete_as("/api/resources/ready", Some("bob"))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    assert!(api.store.get_resource("ready").await.unwrap().is_some());
}

#[tokio::test]
async fn test_delete_releases_ledger() {
    let api = api().await;
    let before = api.ledger.usage(OWNER).await.unwrap().used;

    let (status, _, body) =
        send(&api.router, delete_as("/api/resources/ready", Some(OWNER))).await;
    assert_eq!(status, StatusCode::OK);

    let report = json(&body);
    assert_eq!(report["images_removed"], 2);
    assert_eq!(report["bytes_released"], 2 * 1100);

    assert_eq!(api.ledger.usage(OWNER).await.unwrap().used, before - 2200);
    assert!(api.store.get_image("p1").await.unwrap().is_none());

    let (status, _, _) = send(&api.router, get("/iiif/manifests/ready/manifest.json")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

// =============================================================================
// Health and CORS
// =============================================================================

#[tokio::test]
async fn test_health() {
    let api = api().await;
    let (status, _, body) = send(&api.router, get("/health")).await;

    assert_eq!(status, StatusCode::OK);
    let health = json(&body);
    assert_eq!(health["status"], "healthy");
    assert!(health["version"].is_string());
}

#[tokio::test]
async fn test_api_cors_follows_configured_origins() {
    let api = api_with(
        RouterConfig::new()
            .with_tracing(false)
            .with_cors_origins(vec!["https://app.example".to_string()]),
    )
    .await;

    let request = |origin: &str| {
        Request::builder()
            .uri("/api/resources/busy/status")
            .header("Origin", origin)
            .body(Body::empty())
            .unwrap()
    };

    let (_, headers, _) = send(&api.router, request("https://app.example")).await;
    assert_eq!(
        headers.get("access-control-allow-origin").unwrap(),
        "https://app.example"
    );

    let (_, headers, _) = send(&api.router, request("https://evil.example")).await;
    assert!(headers.get("access-control-allow-origin").is_none());

    // Manifests stay open to every origin
    let request = Request::builder()
        .uri("/iiif/manifests/ready/manifest.json")
        .header("Origin", "https://evil.example")
        .body(Body::empty())
        .unwrap();
    let (_, headers, _) = send(&api.router, request).await;
    assert_eq!(headers.get("access-control-allow-origin").unwrap(), "*");
}
