// Config lifecycle over the admin endpoint: atomic reload and rollback.

use serde_json::json;

use crate::tests::support::{client, harness};

fn config_with_body(body: &str) -> serde_json::Value {
    json!({
        "admin": {"listen": ":0"},
        "apps": {"http": {"servers": {"s": {
            "listen": [":0"],
            "grace_period": "5s",
            "routes": [
                {"handle": [{"handler": "static_response", "body": body}]}
            ]
        }}}}
    })
}

/// Test an atomic swap: clients hammering the server across a reload
/// observe only the old or the new body, never an error.
#[tokio::test]
async fn test_atomic_reload() {
    let h = harness::start(config_with_body("A")).await;
    let base = format!("http://{}", h.http_addr("s"));
    let admin = format!("http://{}", h.admin_addr());

    let stop_flag = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
    let mut clients = Vec::new();
    for _ in 0..4 {
        let base = base.clone();
        let stop_flag = stop_flag.clone();
        clients.push(tokio::spawn(async move {
            let mut seen = std::collections::HashSet::new();
            while !stop_flag.load(std::sync::atomic::Ordering::Relaxed) {
                let (status, _, body) = client::get(&format!("{base}/")).await.unwrap();
                assert_eq!(status, 200);
                seen.insert(String::from_utf8(body).unwrap());
            }
            seen
        }));
    }

    // Let the clients warm up, swap the config, let them observe it.
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    let (status, _, _) = client::post_json(&format!("{admin}/load"), &config_with_body("B"))
        .await
        .unwrap();
    assert_eq!(status, 200);
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    stop_flag.store(true, std::sync::atomic::Ordering::Relaxed);

    let mut all_seen = std::collections::HashSet::new();
    for task in clients {
        all_seen.extend(task.await.unwrap());
    }
    assert!(
        all_seen.iter().all(|b| b == "A" || b == "B"),
        "responses outside A/B: {all_seen:?}"
    );

    // The swap is visible once the load call returned.
    let (_, _, body) = client::get(&format!("{base}/")).await.unwrap();
    assert_eq!(body, b"B");

    h.stop().await;
}

/// Test rollback: a config naming an unknown handler module is rejected
/// with a 400 error body and the old config keeps serving.
#[tokio::test]
async fn test_rollback_on_bad_config() {
    let h = harness::start(config_with_body("A")).await;
    let base = format!("http://{}", h.http_addr("s"));
    let admin = format!("http://{}", h.admin_addr());

    let before = crate::orchestrator::current_config().unwrap();

    let bad = json!({
        "admin": {"listen": ":0"},
        "apps": {"http": {"servers": {"s": {
            "listen": [":0"],
            "routes": [
                {"handle": [{"handler": "nonexistent"}]}
            ]
        }}}}
    });
    let (status, _, body) = client::post_json(&format!("{admin}/load"), &bad).await.unwrap();
    assert_eq!(status, 400);
    let error: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert!(
        error["error"].as_str().unwrap().contains("nonexistent"),
        "error names the unknown module: {error}"
    );

    assert_eq!(crate::orchestrator::current_config().unwrap(), before);
    let (_, _, body) = client::get(&format!("{base}/")).await.unwrap();
    assert_eq!(body, b"A", "old config keeps serving after rollback");

    h.stop().await;
}

/// Test that a reload keeps a retained listener open: the data port
/// survives the swap.
#[tokio::test]
async fn test_listener_survives_reload() {
    let h = harness::start(config_with_body("A")).await;
    let addr_before = h.http_addr("s");
    let admin = format!("http://{}", h.admin_addr());

    let (status, _, _) = client::post_json(&format!("{admin}/load"), &config_with_body("B"))
        .await
        .unwrap();
    assert_eq!(status, 200);

    // Same socket, new pipeline.
    let (_, _, body) = client::get(&format!("http://{addr_before}/")).await.unwrap();
    assert_eq!(body, b"B");

    h.stop().await;
}
