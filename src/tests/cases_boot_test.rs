// Boot-and-serve scenarios: a config document becomes a live HTTP
// surface.

use serde_json::json;

use crate::tests::support::{client, harness};

/// Test that a minimal config serves 204 with an empty body.
#[tokio::test]
async fn test_boot_and_serve() {
    let h = harness::start(json!({
        "apps": {"http": {"servers": {"s": {
            "listen": [":0"],
            "routes": [
                {"handle": [{"handler": "static_response", "status_code": 204}]}
            ]
        }}}}
    }))
    .await;

    let (status, _, body) = client::get(&format!("http://{}/", h.http_addr("s")))
        .await
        .unwrap();
    assert_eq!(status, 204);
    assert!(body.is_empty());

    h.stop().await;
}

/// Test request placeholders: the response body sees the request host.
#[tokio::test]
async fn test_placeholder_evaluation() {
    let h = harness::start(json!({
        "apps": {"http": {"servers": {"s": {
            "listen": [":0"],
            "routes": [
                {"handle": [{"handler": "static_response", "body": "h={http.request.host}"}]}
            ]
        }}}}
    }))
    .await;

    let url = format!("http://{}/", h.http_addr("s"));
    let (status, _, body) = client::request("GET", &url, &[("host", "example.com")], None)
        .await
        .unwrap();
    assert_eq!(status, 200);
    assert_eq!(body, b"h=example.com");

    h.stop().await;
}

/// Test the elapsed-time placeholder renders a Go-style duration.
#[tokio::test]
async fn test_duration_placeholder() {
    let h = harness::start(json!({
        "apps": {"http": {"servers": {"s": {
            "listen": [":0"],
            "routes": [
                {"handle": [{"handler": "static_response", "body": "t={http.request.duration}"}]}
            ]
        }}}}
    }))
    .await;

    let (_, _, body) = client::get(&format!("http://{}/", h.http_addr("s")))
        .await
        .unwrap();
    let text = String::from_utf8(body).unwrap();
    let value = text.strip_prefix("t=").expect("placeholder resolved");
    assert!(!value.is_empty());
    assert!(
        value.ends_with('s'),
        "duration renders Go-style: {value:?}"
    );

    h.stop().await;
}

/// Test ordered route evaluation with path matchers; a route with no
/// matchers catches everything left over.
#[tokio::test]
async fn test_route_selection() {
    let h = harness::start(json!({
        "apps": {"http": {"servers": {"s": {
            "listen": [":0"],
            "routes": [
                {
                    "match": [{"path": ["/a"]}],
                    "handle": [{"handler": "static_response", "body": "route-a"}],
                    "terminal": true
                },
                {
                    "match": [{"path": ["/b"]}],
                    "handle": [{"handler": "static_response", "body": "route-b"}],
                    "terminal": true
                },
                {"handle": [{"handler": "static_response", "body": "fallback"}]}
            ]
        }}}}
    }))
    .await;

    let base = format!("http://{}", h.http_addr("s"));
    let (_, _, body) = client::get(&format!("{base}/a")).await.unwrap();
    assert_eq!(body, b"route-a");
    let (_, _, body) = client::get(&format!("{base}/b")).await.unwrap();
    assert_eq!(body, b"route-b");
    let (_, _, body) = client::get(&format!("{base}/other")).await.unwrap();
    assert_eq!(body, b"fallback");

    h.stop().await;
}

/// Test that a request matching no route falls through to an empty 200.
#[tokio::test]
async fn test_unmatched_request_defaults() {
    let h = harness::start(json!({
        "apps": {"http": {"servers": {"s": {
            "listen": [":0"],
            "routes": [
                {
                    "match": [{"path": ["/only-this"]}],
                    "handle": [{"handler": "static_response", "body": "narrow"}],
                    "terminal": true
                }
            ]
        }}}}
    }))
    .await;

    let (status, _, body) = client::get(&format!("http://{}/elsewhere", h.http_addr("s")))
        .await
        .unwrap();
    assert_eq!(status, 200);
    assert!(body.is_empty());

    h.stop().await;
}

/// Test vars set upstream are visible to placeholder expansion
/// downstream.
#[tokio::test]
async fn test_vars_flow() {
    let h = harness::start(json!({
        "apps": {"http": {"servers": {"s": {
            "listen": [":0"],
            "routes": [
                {"handle": [
                    {"handler": "vars", "flavor": "plum"},
                    {"handler": "static_response", "body": "got {http.vars.flavor}"}
                ]}
            ]
        }}}}
    }))
    .await;

    let (_, _, body) = client::get(&format!("http://{}/", h.http_addr("s")))
        .await
        .unwrap();
    assert_eq!(body, b"got plum");

    h.stop().await;
}
