//! Shared helpers for gitspace-api tests: an app wired to the in-memory
//! harness, and thin request builders.

#![allow(dead_code)]

use axum::{
    body::Body,
    http::{Request, Response},
    Router,
};
use gitspace_api::{create_app, AppState};
use gitspace_orchestrator::test_utils::{create_request, TestHarness};
use gitspace_orchestrator::{CreateConfigRequest, IdeType};
use tower::ServiceExt; // for `oneshot`

pub struct TestClient {
    pub app: Router,
    pub harness: TestHarness,
}

impl TestClient {
    pub async fn new() -> Self {
        let harness = TestHarness::new().await;
        let app = create_app(AppState::new(harness.service.clone()));
        Self { app, harness }
    }

    pub async fn send_request(&self, request: Request<Body>) -> Response<Body> {
        self.app.clone().oneshot(request).await.unwrap()
    }

    pub async fn post<T: serde::Serialize>(&self, uri: &str, body: &T) -> Response<Body> {
        self.send_json("POST", uri, body).await
    }

    pub async fn patch<T: serde::Serialize>(&self, uri: &str, body: &T) -> Response<Body> {
        self.send_json("PATCH", uri, body).await
    }

    pub async fn post_empty(&self, uri: &str) -> Response<Body> {
        self.send_empty("POST", uri).await
    }

    pub async fn get(&self, uri: &str) -> Response<Body> {
        self.send_empty("GET", uri).await
    }

    pub async fn delete(&self, uri: &str) -> Response<Body> {
        self.send_empty("DELETE", uri).await
    }

    async fn send_json<T: serde::Serialize>(
        &self,
        method: &str,
        uri: &str,
        body: &T,
    ) -> Response<Body> {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_string(body).unwrap()))
            .unwrap();
        self.send_request(request).await
    }

    async fn send_empty(&self, method: &str, uri: &str) -> Response<Body> {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        self.send_request(request).await
    }
}

pub fn gitspace_request(id: &str) -> CreateConfigRequest {
    create_request(id, IdeType::VsCodeWeb)
}

/// Helper to extract JSON body from axum response
pub async fn extract_json_body<T>(response: Response<Body>) -> T
where
    T: serde::de::DeserializeOwned,
{
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("Failed to read response body");

    serde_json::from_slice(&body).expect("Failed to deserialize JSON")
}
