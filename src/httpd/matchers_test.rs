#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use crate::context::Context;
    use crate::httpd::scope::{RequestInfo, RequestScope};
    use crate::httpd::{empty_request_body, Request, RequestMatcher};

    fn test_request(method: &str, uri: &str, headers: &[(&str, &str)]) -> Request {
        let mut builder = hyper::Request::builder().method(method).uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let mut req = builder.body(empty_request_body()).unwrap();
        let scope = RequestScope::new(RequestInfo::capture(&req, None));
        req.extensions_mut().insert(scope);
        req
    }

    fn load_matcher(set: serde_json::Value) -> Arc<dyn RequestMatcher> {
        let ctx = Context::new();
        let loaded = ctx.load_module_map("http.matchers", &set).unwrap();
        loaded.into_iter().next().unwrap().1.as_matcher().unwrap()
    }

    /// Test host matching is case-insensitive with per-label wildcards.
    #[test]
    fn test_host_matcher() {
        let m = load_matcher(json!({"host": ["example.com", "*.example.org"]}));

        let req = test_request("GET", "/", &[("Host", "EXAMPLE.com")]);
        assert!(m.matches(&req));

        let req = test_request("GET", "/", &[("Host", "api.example.org")]);
        assert!(m.matches(&req));

        let req = test_request("GET", "/", &[("Host", "deep.api.example.org")]);
        assert!(!m.matches(&req), "wildcard covers exactly one label");

        let req = test_request("GET", "/", &[("Host", "other.com")]);
        assert!(!m.matches(&req));
    }

    /// Test path patterns: exact, prefix, suffix, substring; decoded and
    /// slash-collapsed comparison.
    #[test]
    fn test_path_matcher() {
        let m = load_matcher(json!({"path": ["/exact", "/api/*", "*.jpg", "*secret*"]}));

        assert!(m.matches(&test_request("GET", "/exact", &[])));
        assert!(m.matches(&test_request("GET", "/api/users", &[])));
        assert!(m.matches(&test_request("GET", "/images/cat.jpg", &[])));
        assert!(m.matches(&test_request("GET", "/has/secret/inside", &[])));
        assert!(!m.matches(&test_request("GET", "/other", &[])));

        // Percent-decoding and duplicate slash collapsing apply first.
        assert!(m.matches(&test_request("GET", "/%65xact", &[])));
        assert!(m.matches(&test_request("GET", "//api///users", &[])));
    }

    /// Test the method matcher is an exact uppercase set.
    #[test]
    fn test_method_matcher() {
        let m = load_matcher(json!({"method": ["GET", "POST"]}));
        assert!(m.matches(&test_request("GET", "/", &[])));
        assert!(m.matches(&test_request("POST", "/", &[])));
        assert!(!m.matches(&test_request("DELETE", "/", &[])));
    }

    /// Test header matching: presence, OR values, negation.
    #[test]
    fn test_header_matcher() {
        let present = load_matcher(json!({"header": {"X-Token": []}}));
        assert!(present.matches(&test_request("GET", "/", &[("X-Token", "anything")])));
        assert!(!present.matches(&test_request("GET", "/", &[])));

        let values = load_matcher(json!({"header": {"Accept": ["text/html", "application/json"]}}));
        assert!(values.matches(&test_request("GET", "/", &[("Accept", "application/json")])));
        assert!(!values.matches(&test_request("GET", "/", &[("Accept", "text/plain")])));

        let negated = load_matcher(json!({"header": {"X-Env": ["!prod"]}}));
        assert!(negated.matches(&test_request("GET", "/", &[("X-Env", "dev")])));
        assert!(negated.matches(&test_request("GET", "/", &[])));
        assert!(!negated.matches(&test_request("GET", "/", &[("X-Env", "prod")])));
    }

    /// Test query matching with decoding.
    #[test]
    fn test_query_matcher() {
        let m = load_matcher(json!({"query": {"mode": ["fast"], "debug": []}}));
        assert!(m.matches(&test_request("GET", "/?mode=fast&debug=1", &[])));
        assert!(m.matches(&test_request("GET", "/?debug&mode=f%61st", &[])));
        assert!(!m.matches(&test_request("GET", "/?mode=slow&debug=1", &[])));
        assert!(!m.matches(&test_request("GET", "/?mode=fast", &[])));
    }

    /// Test remote IP CIDR matching.
    #[test]
    fn test_remote_ip_matcher() {
        let m = load_matcher(json!({"remote_ip": {"ranges": ["10.0.0.0/8", "127.0.0.1"]}}));

        let mut req = test_request("GET", "/", &[]);
        let scope = RequestScope::new(RequestInfo::capture(
            &req,
            Some("10.1.2.3:5555".parse().unwrap()),
        ));
        req.extensions_mut().insert(scope);
        assert!(m.matches(&req));

        let mut req = test_request("GET", "/", &[]);
        let scope = RequestScope::new(RequestInfo::capture(
            &req,
            Some("192.168.1.1:5555".parse().unwrap()),
        ));
        req.extensions_mut().insert(scope);
        assert!(!m.matches(&req));
    }

    /// Test that not(not(X)) behaves exactly like X.
    #[test]
    fn test_not_involution() {
        let plain = load_matcher(json!({"path": ["/admin/*"]}));
        let double = load_matcher(json!({
            "not": [{"not": [{"path": ["/admin/*"]}]}]
        }));

        for uri in ["/admin/users", "/admin/", "/public", "/"] {
            let req = test_request("GET", uri, &[]);
            assert_eq!(
                plain.matches(&req),
                double.matches(&req),
                "not(not(x)) diverged on {uri}"
            );
        }
    }

    /// Test single-set form of the not matcher.
    #[test]
    fn test_not_single_set() {
        let m = load_matcher(json!({"not": {"method": ["POST"]}}));
        assert!(m.matches(&test_request("GET", "/", &[])));
        assert!(!m.matches(&test_request("POST", "/", &[])));
    }
}
