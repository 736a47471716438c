use postrelay_api::app::{build_app, AppConfig, AppParts};
use postrelay_api::middleware::TENANT_HEADER;
use postrelay_core::{DeviceId, TenantId};
use postrelay_infra::directory::DeviceRecord;
use reqwest::StatusCode;
use serde_json::json;
use uuid::Uuid;

struct TestServer {
    base_url: String,
    parts: AppParts,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn spawn() -> Self {
        // Build the app (same router as prod, in-memory store), but bind
        // to an ephemeral port.
        let parts = build_app(AppConfig::default())
            .await
            .expect("failed to build app");
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{addr}");

        let router = parts.router.clone();
        let handle = tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        Self {
            base_url,
            parts,
            handle,
        }
    }

    fn device(&self, tenant_id: TenantId) -> DeviceId {
        let device_id = DeviceId::new();
        self.parts.directory.register(DeviceRecord {
            device_id,
            tenant_id,
            affinity_group: None,
        });
        device_id
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[tokio::test]
async fn full_publish_round_trip_over_http() {
    let server = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let tenant = TenantId::new();
    let device = server.device(tenant);

    // Schedule one content item on two platforms.
    let response = client
        .post(format!("{}/api/jobs", server.base_url))
        .header(TENANT_HEADER, tenant.to_string())
        .json(&json!({
            "content_id": Uuid::now_v7(),
            "group_id": Uuid::now_v7(),
            "scheduled_at": chrono::Utc::now(),
            "target_platforms": ["linkedin", "x"],
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["jobs"].as_array().unwrap().len(), 2);
    assert_eq!(body["jobs"][0]["outcome"], "created");

    // The device claims both.
    let response = client
        .post(format!("{}/device/claims", server.base_url))
        .header(TENANT_HEADER, tenant.to_string())
        .json(&json!({ "device_id": device, "limit": 10 }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: serde_json::Value = response.json().await.unwrap();
    let claimed = body["jobs"].as_array().unwrap();
    assert_eq!(claimed.len(), 2);
    assert!(claimed[0]["content_ref"].is_string());
    let job_id = claimed[0]["id"].as_str().unwrap().to_string();

    // Start the first one.
    let response = client
        .post(format!("{}/device/jobs/{job_id}/start", server.base_url))
        .header(TENANT_HEADER, tenant.to_string())
        .json(&json!({ "device_id": device }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: serde_json::Value = response.json().await.unwrap();
    assert!(body["run_id"].is_string());

    // Report success.
    let complete = json!({
        "device_id": device,
        "status": "succeeded",
        "artifact_ref": "post-123",
        "published_url": "https://example.com/post-123",
    });
    let response = client
        .post(format!("{}/device/jobs/{job_id}/complete", server.base_url))
        .header(TENANT_HEADER, tenant.to_string())
        .json(&complete)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["success"], true);
    assert_eq!(body["idempotent"], false);
    assert_eq!(body["job"]["status"], "succeeded");

    // A duplicate network retry is absorbed.
    let response = client
        .post(format!("{}/device/jobs/{job_id}/complete", server.base_url))
        .header(TENANT_HEADER, tenant.to_string())
        .json(&complete)
        .send()
        .await
        .unwrap();
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["idempotent"], true);

    // Fetch shows the job with its single run.
    let response = client
        .get(format!("{}/api/jobs/{job_id}", server.base_url))
        .header(TENANT_HEADER, tenant.to_string())
        .send()
        .await
        .unwrap();
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["job"]["status"], "succeeded");
    let runs = body["runs"].as_array().unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0]["artifact_ref"], "post-123");

    // Stats reflect one succeeded, one still claimed.
    let response = client
        .get(format!("{}/api/jobs/stats", server.base_url))
        .header(TENANT_HEADER, tenant.to_string())
        .send()
        .await
        .unwrap();
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["succeeded"], 1);
    assert_eq!(body["claimed"], 1);
}

#[tokio::test]
async fn requests_without_a_tenant_are_unauthorized() {
    let server = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let response = client
        .get(format!("{}/api/jobs", server.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // Health stays open.
    let response = client
        .get(format!("{}/healthz", server.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn jobs_are_invisible_across_tenants() {
    let server = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let tenant = TenantId::new();
    let stranger = TenantId::new();

    let response = client
        .post(format!("{}/api/jobs", server.base_url))
        .header(TENANT_HEADER, tenant.to_string())
        .json(&json!({
            "content_id": Uuid::now_v7(),
            "group_id": Uuid::now_v7(),
            "scheduled_at": chrono::Utc::now(),
            "target_platforms": ["linkedin"],
        }))
        .send()
        .await
        .unwrap();
    let body: serde_json::Value = response.json().await.unwrap();
    let job_id = body["jobs"][0]["job"]["id"].as_str().unwrap().to_string();

    let response = client
        .get(format!("{}/api/jobs/{job_id}", server.base_url))
        .header(TENANT_HEADER, stranger.to_string())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = client
        .post(format!("{}/device/claims", server.base_url))
        .header(TENANT_HEADER, stranger.to_string())
        .json(&json!({ "device_id": Uuid::now_v7() }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn cancel_all_empties_the_queue() {
    let server = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let tenant = TenantId::new();

    for _ in 0..3 {
        client
            .post(format!("{}/api/jobs", server.base_url))
            .header(TENANT_HEADER, tenant.to_string())
            .json(&json!({
                "content_id": Uuid::now_v7(),
                "group_id": Uuid::now_v7(),
                "scheduled_at": chrono::Utc::now(),
                "target_platforms": ["linkedin"],
            }))
            .send()
            .await
            .unwrap();
    }

    let response = client
        .post(format!("{}/api/jobs/cancel", server.base_url))
        .header(TENANT_HEADER, tenant.to_string())
        .json(&json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["cancelled"], 3);

    let response = client
        .get(format!("{}/api/jobs?status=queued", server.base_url))
        .header(TENANT_HEADER, tenant.to_string())
        .send()
        .await
        .unwrap();
    let body: serde_json::Value = response.json().await.unwrap();
    assert!(body["jobs"].as_array().unwrap().is_empty());
}
