// Middleware semantics end to end: chain ordering, error routes,
// rehandle, deferred headers and subroutes.

use serde_json::json;

use crate::tests::support::{client, harness};

/// Test declared-order execution down the chain and reverse order back
/// up: two marks around a terminal yield `1,2,2,1`.
#[tokio::test]
async fn test_middleware_ordering() {
    let h = harness::start(json!({
        "apps": {"http": {"servers": {"s": {
            "listen": [":0"],
            "routes": [
                {"handle": [
                    {"handler": "test_mark", "tag": "1"},
                    {"handler": "test_mark", "tag": "2"},
                    {"handler": "static_response", "status_code": 200}
                ]}
            ]
        }}}}
    }))
    .await;

    let (_, headers, _) = client::get(&format!("http://{}/", h.http_addr("s")))
        .await
        .unwrap();
    assert_eq!(
        headers.get("x-trace").and_then(|v| v.to_str().ok()),
        Some("1,2,2,1")
    );

    h.stop().await;
}

/// Test error routing: a failing handler is routed through the server's
/// error routes, which see `http.error.*` placeholders.
#[tokio::test]
async fn test_error_routes() {
    let h = harness::start(json!({
        "apps": {"http": {"servers": {"s": {
            "listen": [":0"],
            "routes": [
                {"handle": [{"handler": "error", "status_code": 404, "message": "nope"}]}
            ],
            "errors": {"routes": [
                {"handle": [{
                    "handler": "static_response",
                    "status_code": "{http.error.status_code}",
                    "body": "{http.error.status_code}: {http.error.message}"
                }]}
            ]}
        }}}}
    }))
    .await;

    let (status, _, body) = client::get(&format!("http://{}/", h.http_addr("s")))
        .await
        .unwrap();
    assert_eq!(status, 404);
    assert_eq!(body, b"404: nope");

    h.stop().await;
}

/// Test the default error writer: no error routes means the status hint
/// with a minimal body.
#[tokio::test]
async fn test_default_error_writer() {
    let h = harness::start(json!({
        "apps": {"http": {"servers": {"s": {
            "listen": [":0"],
            "routes": [
                {"handle": [{"handler": "error", "status_code": 503, "message": "down"}]}
            ]
        }}}}
    }))
    .await;

    let (status, _, body) = client::get(&format!("http://{}/", h.http_addr("s")))
        .await
        .unwrap();
    assert_eq!(status, 503);
    assert!(body.is_empty());

    h.stop().await;
}

/// Test one rehandle pass: a rewrite restarts routing and the rewritten
/// path matches a different route.
#[tokio::test]
async fn test_rehandle_rewrite() {
    let h = harness::start(json!({
        "apps": {"http": {"servers": {"s": {
            "listen": [":0"],
            "routes": [
                {
                    "match": [{"path": ["/old"]}],
                    "handle": [{"handler": "rewrite", "uri": "/new", "rehandle": true}],
                    "terminal": true
                },
                {
                    "match": [{"path": ["/new"]}],
                    "handle": [{"handler": "static_response", "body": "rewritten"}],
                    "terminal": true
                }
            ]
        }}}}
    }))
    .await;

    let (status, _, body) = client::get(&format!("http://{}/old", h.http_addr("s")))
        .await
        .unwrap();
    assert_eq!(status, 200);
    assert_eq!(body, b"rewritten");

    h.stop().await;
}

/// Test that a rehandle loop aborts with a 500 once the bound is hit.
#[tokio::test]
async fn test_rehandle_loop_aborts() {
    let h = harness::start(json!({
        "apps": {"http": {"servers": {"s": {
            "listen": [":0"],
            "routes": [
                {"handle": [{"handler": "rewrite", "uri": "/again", "rehandle": true}]}
            ]
        }}}}
    }))
    .await;

    let (status, _, _) = client::get(&format!("http://{}/", h.http_addr("s")))
        .await
        .unwrap();
    assert_eq!(status, 500);

    h.stop().await;
}

/// Test deferred response headers: applied when the response matches
/// the gate, skipped otherwise.
#[tokio::test]
async fn test_deferred_headers() {
    let h = harness::start(json!({
        "apps": {"http": {"servers": {"s": {
            "listen": [":0"],
            "routes": [
                {"handle": [
                    {
                        "handler": "headers",
                        "response": {
                            "deferred": true,
                            "require": {"status_code": [200]},
                            "set": {"X-Deferred": ["applied"]}
                        }
                    },
                    {
                        "handler": "headers",
                        "response": {
                            "require": {"status_code": [404]},
                            "set": {"X-Never": ["skipped"]}
                        }
                    },
                    {"handler": "static_response", "status_code": 200, "body": "ok"}
                ]}
            ]
        }}}}
    }))
    .await;

    let (status, headers, _) = client::get(&format!("http://{}/", h.http_addr("s")))
        .await
        .unwrap();
    assert_eq!(status, 200);
    assert_eq!(
        headers.get("x-deferred").and_then(|v| v.to_str().ok()),
        Some("applied")
    );
    assert!(headers.get("x-never").is_none());

    h.stop().await;
}

/// Test request header ops are visible to downstream placeholders.
#[tokio::test]
async fn test_request_header_ops() {
    let h = harness::start(json!({
        "apps": {"http": {"servers": {"s": {
            "listen": [":0"],
            "routes": [
                {"handle": [
                    {
                        "handler": "headers",
                        "request": {"set": {"X-Injected": ["from-config"]}}
                    },
                    {"handler": "static_response", "body": "{http.request.header.X-Injected}"}
                ]}
            ]
        }}}}
    }))
    .await;

    let (_, _, body) = client::get(&format!("http://{}/", h.http_addr("s")))
        .await
        .unwrap();
    assert_eq!(body, b"from-config");

    h.stop().await;
}

/// Test subroute composition: terminal inside a subroute stays inside
/// it, and unmatched requests fall through to the outer routes.
#[tokio::test]
async fn test_subroute() {
    let h = harness::start(json!({
        "apps": {"http": {"servers": {"s": {
            "listen": [":0"],
            "routes": [
                {
                    "match": [{"path": ["/api/*"]}],
                    "handle": [{
                        "handler": "subroute",
                        "routes": [
                            {
                                "match": [{"path": ["/api/users"]}],
                                "handle": [{"handler": "static_response", "body": "users"}],
                                "terminal": true
                            }
                        ]
                    }]
                },
                {"handle": [{"handler": "static_response", "body": "outer"}]}
            ]
        }}}}
    }))
    .await;

    let base = format!("http://{}", h.http_addr("s"));
    let (_, _, body) = client::get(&format!("{base}/api/users")).await.unwrap();
    assert_eq!(body, b"users");

    // Inside the matched subroute but matching none of its routes:
    // falls through to the outer route list.
    let (_, _, body) = client::get(&format!("{base}/api/other")).await.unwrap();
    assert_eq!(body, b"outer");

    // Outside the subroute entirely.
    let (_, _, body) = client::get(&format!("{base}/plain")).await.unwrap();
    assert_eq!(body, b"outer");

    h.stop().await;
}
