#[cfg(test)]
mod tests {
    use crate::config::{canonicalize, Config, DEFAULT_ADMIN_LISTEN};

    /// Test that a minimal document decodes and the admin listen address
    /// falls back to the default.
    #[test]
    fn test_minimal_document() {
        let raw = serde_json::json!({"apps": {"http": {"servers": {}}}});
        let cfg = Config::from_value(&raw).unwrap();
        assert_eq!(cfg.admin_listen(), DEFAULT_ADMIN_LISTEN);
        assert!(cfg.apps.contains_key("http"));
    }

    /// Test that unknown top-level fields are rejected.
    #[test]
    fn test_strict_decode() {
        let raw = serde_json::json!({"bogus": 1});
        assert!(Config::from_value(&raw).is_err());
    }

    /// Test canonicalization is whitespace-insensitive.
    #[test]
    fn test_canonicalize() {
        let (_, a) = canonicalize(br#"{ "apps" : { } }"#).unwrap();
        let (_, b) = canonicalize(br#"{"apps":{}}"#).unwrap();
        assert_eq!(a, b);

        assert!(canonicalize(b"not json").is_err());
    }

    /// Test the admin section round-trips its fields.
    #[test]
    fn test_admin_section() {
        let raw = serde_json::json!({
            "admin": {"listen": "localhost:3019", "enforce_origin": true}
        });
        let cfg = Config::from_value(&raw).unwrap();
        let admin = cfg.admin.unwrap();
        assert_eq!(admin.listen.as_deref(), Some("localhost:3019"));
        assert!(admin.enforce_origin);
        assert!(!admin.disabled);
    }
}
