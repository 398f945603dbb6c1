use axum::body::{to_bytes, Body};
use axum::http::Response;
use serde::de::DeserializeOwned;
use std::time::Duration;

/// Poll `condition` every few milliseconds until it holds. Panics after
/// `timeout` so a broken test fails instead of hanging.
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + timeout;
    while !condition() {
        if tokio::time::Instant::now() >= deadline {
            panic!("condition not met within {:?}", timeout);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub async fn json_body<T: DeserializeOwned>(response: Response<Body>) -> T {
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("Failed to read response body");
    serde_json::from_slice(&bytes).expect("Response body is not the expected JSON")
}
