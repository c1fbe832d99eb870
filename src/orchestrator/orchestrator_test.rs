#[cfg(test)]
mod tests {
    use crate::orchestrator;
    use crate::tests::support::lock;

    fn isolate_autosave() {
        let dir = std::env::temp_dir().join(format!("trellis-autosave-{}", std::process::id()));
        std::env::set_var("TRELLIS_CONFIG_DIR", &dir);
    }

    /// Test that a successful load is observable byte-for-byte (after
    /// canonicalization) and that unload clears it.
    #[tokio::test]
    async fn test_load_current_unload() {
        let _guard = lock::acquire().await;
        isolate_autosave();

        let cfg = br#"{ "admin" : { "disabled" : true } }"#;
        orchestrator::load(cfg, false).await.unwrap();

        let current = orchestrator::current_config().unwrap();
        assert_eq!(current, br#"{"admin":{"disabled":true}}"#.to_vec());

        assert!(!orchestrator::changed(cfg));
        assert!(orchestrator::changed(br#"{"admin":{"disabled":false}}"#));

        // Identical bytes are a no-op load.
        orchestrator::load(cfg, false).await.unwrap();

        orchestrator::unload().await.unwrap();
        assert!(orchestrator::current_config().is_none());
    }

    /// Test that malformed JSON is rejected without touching state.
    #[tokio::test]
    async fn test_load_invalid_json() {
        let _guard = lock::acquire().await;
        isolate_autosave();

        assert!(orchestrator::load(b"{ not json", false).await.is_err());
        assert!(orchestrator::current_config().is_none());
    }

    /// Test rollback: a config naming an unknown app leaves the running
    /// one untouched.
    #[tokio::test]
    async fn test_rollback_on_unknown_module() {
        let _guard = lock::acquire().await;
        isolate_autosave();

        let good = br#"{"admin":{"disabled":true},"apps":{"http":{"servers":{"s":{"listen":[":0"]}}}}}"#;
        orchestrator::load(good, false).await.unwrap();
        let before = orchestrator::current_config().unwrap();

        let bad = br#"{"admin":{"disabled":true},"apps":{"bogus":{}}}"#;
        let err = orchestrator::load(bad, false).await.unwrap_err();
        assert!(err.to_string().contains("bogus"));

        assert_eq!(orchestrator::current_config().unwrap(), before);

        orchestrator::unload().await.unwrap();
    }

    /// Test that the last good config lands in the autosave file.
    #[tokio::test]
    async fn test_autosave() {
        let _guard = lock::acquire().await;
        isolate_autosave();

        let path = orchestrator::autosave_path();
        let _ = std::fs::remove_file(&path);

        let cfg = br#"{"admin":{"disabled":true}}"#;
        orchestrator::load(cfg, true).await.unwrap();

        let mut saved = None;
        for _ in 0..40 {
            if let Ok(bytes) = tokio::fs::read(&path).await {
                saved = Some(bytes);
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        assert_eq!(saved.expect("autosave written"), br#"{"admin":{"disabled":true}}"#.to_vec());

        orchestrator::unload().await.unwrap();
    }
}
