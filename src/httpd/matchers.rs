// The standard request matchers.

use std::net::IpAddr;
use std::sync::Arc;

use serde::Deserialize;
use tracing::warn;

use crate::context::Context;
use crate::httpd::routes::{compile_matcher_sets, RawMatcherSet};
use crate::httpd::scope::scope_of;
use crate::httpd::{Request, RequestMatcher};
use crate::module::{ConfigError, Module};
use crate::register_module;

/// Case-insensitive host match; `*` matches any single label.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MatchHost(pub Vec<String>);

impl Module for MatchHost {
    fn as_matcher(self: Arc<Self>) -> Option<Arc<dyn RequestMatcher>> {
        Some(self)
    }
}

impl RequestMatcher for MatchHost {
    fn matches(&self, req: &Request) -> bool {
        let host = match scope_of(req) {
            Some(scope) => scope.info().host,
            None => return false,
        };
        let host = host.to_ascii_lowercase();
        self.0.iter().any(|pattern| host_matches(&host, pattern))
    }
}

fn host_matches(host: &str, pattern: &str) -> bool {
    let pattern = pattern.to_ascii_lowercase();
    if !pattern.contains('*') {
        return host == pattern;
    }
    let host_labels: Vec<&str> = host.split('.').collect();
    let pattern_labels: Vec<&str> = pattern.split('.').collect();
    if host_labels.len() != pattern_labels.len() {
        return false;
    }
    host_labels
        .iter()
        .zip(&pattern_labels)
        .all(|(h, p)| *p == "*" || h == p)
}

/// Path match over the decoded path with consecutive slashes collapsed.
/// Patterns: exact, prefix (`/foo*`), suffix (`*.jpg`), substring
/// (`*foo*`), and `*` for everything.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MatchPath(pub Vec<String>);

impl Module for MatchPath {
    fn as_matcher(self: Arc<Self>) -> Option<Arc<dyn RequestMatcher>> {
        Some(self)
    }
}

impl RequestMatcher for MatchPath {
    fn matches(&self, req: &Request) -> bool {
        let path = normalize_path(req.uri().path());
        self.0.iter().any(|pattern| path_matches(&path, pattern))
    }
}

pub(crate) fn normalize_path(raw: &str) -> String {
    let decoded = urlencoding::decode(raw)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| raw.to_string());
    let mut out = String::with_capacity(decoded.len());
    let mut prev_slash = false;
    for c in decoded.chars() {
        if c == '/' {
            if prev_slash {
                continue;
            }
            prev_slash = true;
        } else {
            prev_slash = false;
        }
        out.push(c);
    }
    out
}

fn path_matches(path: &str, pattern: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    match (pattern.strip_prefix('*'), pattern.strip_suffix('*')) {
        (Some(inner), Some(_)) if pattern.len() >= 2 => {
            let needle = &inner[..inner.len().saturating_sub(1)];
            needle.is_empty() || path.contains(needle)
        }
        (Some(suffix), None) => path.ends_with(suffix),
        (None, Some(prefix)) => path.starts_with(prefix),
        _ => path == pattern,
    }
}

/// Case-sensitive uppercase method set.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MatchMethod(pub Vec<String>);

impl Module for MatchMethod {
    fn as_matcher(self: Arc<Self>) -> Option<Arc<dyn RequestMatcher>> {
        Some(self)
    }
}

impl RequestMatcher for MatchMethod {
    fn matches(&self, req: &Request) -> bool {
        self.0.iter().any(|m| m == req.method().as_str())
    }
}

/// Header match: a field mapped to an empty list requires presence with
/// any value; `!value` means the field must not equal `value`; multiple
/// values OR together; fields AND together.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MatchHeader(pub std::collections::BTreeMap<String, Vec<String>>);

impl Module for MatchHeader {
    fn as_matcher(self: Arc<Self>) -> Option<Arc<dyn RequestMatcher>> {
        Some(self)
    }
}

impl RequestMatcher for MatchHeader {
    fn matches(&self, req: &Request) -> bool {
        self.0.iter().all(|(field, expected)| {
            let actual: Vec<String> = req
                .headers()
                .get_all(field.as_str())
                .iter()
                .filter_map(|v| v.to_str().ok())
                .map(str::to_string)
                .collect();
            values_match(&actual, expected)
        })
    }
}

pub(crate) fn values_match(actual: &[String], expected: &[String]) -> bool {
    if expected.is_empty() {
        return !actual.is_empty();
    }
    expected.iter().any(|e| match e.strip_prefix('!') {
        Some(neg) => !actual.iter().any(|a| a == neg),
        None => actual.iter().any(|a| a == e),
    })
}

/// Query match with the same value semantics as headers.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MatchQuery(pub std::collections::BTreeMap<String, Vec<String>>);

impl Module for MatchQuery {
    fn as_matcher(self: Arc<Self>) -> Option<Arc<dyn RequestMatcher>> {
        Some(self)
    }
}

impl RequestMatcher for MatchQuery {
    fn matches(&self, req: &Request) -> bool {
        let pairs: Vec<(String, String)> = req
            .uri()
            .query()
            .unwrap_or_default()
            .split('&')
            .filter(|p| !p.is_empty())
            .map(|pair| {
                let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
                (
                    urlencoding::decode(k).map(|s| s.into_owned()).unwrap_or_else(|_| k.to_string()),
                    urlencoding::decode(v).map(|s| s.into_owned()).unwrap_or_else(|_| v.to_string()),
                )
            })
            .collect();

        self.0.iter().all(|(param, expected)| {
            let actual: Vec<String> = pairs
                .iter()
                .filter(|(k, _)| k == param)
                .map(|(_, v)| v.clone())
                .collect();
            values_match(&actual, expected)
        })
    }
}

/// Protocol match: `http`, `https` or `grpc`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MatchProtocol(pub String);

impl Module for MatchProtocol {
    fn as_matcher(self: Arc<Self>) -> Option<Arc<dyn RequestMatcher>> {
        Some(self)
    }
}

impl RequestMatcher for MatchProtocol {
    fn matches(&self, req: &Request) -> bool {
        match self.0.as_str() {
            "grpc" => req
                .headers()
                .get(hyper::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(|ct| ct.starts_with("application/grpc"))
                .unwrap_or(false),
            proto @ ("http" | "https") => scope_of(req)
                .map(|s| s.info().scheme == proto)
                .unwrap_or(proto == "http"),
            _ => false,
        }
    }
}

/// Remote address match against a list of IPs or CIDR ranges.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MatchRemoteIp {
    #[serde(default)]
    pub ranges: Vec<String>,

    #[serde(skip)]
    parsed: Vec<(IpAddr, u8)>,
}

impl Module for MatchRemoteIp {
    fn provision(&mut self, _ctx: &Context) -> Result<(), ConfigError> {
        self.parsed = self
            .ranges
            .iter()
            .map(|r| parse_cidr(r))
            .collect::<Result<_, _>>()
            .map_err(|reason| ConfigError::Validate {
                module: "http.matchers.remote_ip".to_string(),
                reason,
            })?;
        Ok(())
    }

    fn as_matcher(self: Arc<Self>) -> Option<Arc<dyn RequestMatcher>> {
        Some(self)
    }
}

impl RequestMatcher for MatchRemoteIp {
    fn matches(&self, req: &Request) -> bool {
        let Some(remote) = scope_of(req).and_then(|s| s.info().remote) else {
            return false;
        };
        let ip = remote.ip();
        self.parsed
            .iter()
            .any(|(net, prefix)| ip_in_range(ip, *net, *prefix))
    }
}

fn parse_cidr(s: &str) -> Result<(IpAddr, u8), String> {
    let (addr, prefix) = match s.split_once('/') {
        Some((a, p)) => {
            let prefix: u8 = p.parse().map_err(|_| format!("invalid prefix in {s:?}"))?;
            (a, Some(prefix))
        }
        None => (s, None),
    };
    let ip: IpAddr = addr.parse().map_err(|_| format!("invalid address in {s:?}"))?;
    let max = if ip.is_ipv4() { 32 } else { 128 };
    let prefix = prefix.unwrap_or(max);
    if prefix > max {
        return Err(format!("prefix out of range in {s:?}"));
    }
    Ok((ip, prefix))
}

fn ip_in_range(ip: IpAddr, net: IpAddr, prefix: u8) -> bool {
    fn to_bits(ip: IpAddr) -> Option<(u128, u8)> {
        match ip {
            IpAddr::V4(v4) => Some((u32::from(v4) as u128, 32)),
            IpAddr::V6(v6) => Some((u128::from(v6), 128)),
        }
    }
    let (Some((ip_bits, ip_width)), Some((net_bits, net_width))) = (to_bits(ip), to_bits(net))
    else {
        return false;
    };
    if ip_width != net_width {
        return false;
    }
    if prefix == 0 {
        return true;
    }
    let shift = ip_width - prefix.min(ip_width);
    (ip_bits >> shift) == (net_bits >> shift)
}

/// Inverts the wrapped matcher sets (OR of ANDs).
#[derive(Default)]
pub struct MatchNot {
    raw: Vec<RawMatcherSet>,
    compiled: Vec<Vec<Arc<dyn RequestMatcher>>>,
}

impl<'de> Deserialize<'de> for MatchNot {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = serde_json::Value::deserialize(deserializer)?;
        let raw = match value {
            serde_json::Value::Array(items) => items
                .into_iter()
                .map(|item| match item {
                    serde_json::Value::Object(set) => Ok(set),
                    _ => Err(serde::de::Error::custom(
                        "not matcher expects matcher-set objects",
                    )),
                })
                .collect::<Result<Vec<_>, _>>()?,
            serde_json::Value::Object(set) => vec![set],
            _ => {
                return Err(serde::de::Error::custom(
                    "not matcher expects a matcher set or a list of them",
                ))
            }
        };
        Ok(Self {
            raw,
            compiled: Vec::new(),
        })
    }
}

impl Module for MatchNot {
    fn provision(&mut self, ctx: &Context) -> Result<(), ConfigError> {
        self.compiled = compile_matcher_sets(ctx, &self.raw)?;
        Ok(())
    }

    fn as_matcher(self: Arc<Self>) -> Option<Arc<dyn RequestMatcher>> {
        Some(self)
    }
}

impl RequestMatcher for MatchNot {
    fn matches(&self, req: &Request) -> bool {
        if self.compiled.is_empty() && !self.raw.is_empty() {
            warn!(
                component = "httpd",
                event = "matcher_not_provisioned",
                "not matcher evaluated before provisioning"
            );
            return false;
        }
        !self
            .compiled
            .iter()
            .any(|set| set.iter().all(|m| m.matches(req)))
    }
}

register_module!("http.matchers.host", MatchHost);
register_module!("http.matchers.path", MatchPath);
register_module!("http.matchers.method", MatchMethod);
register_module!("http.matchers.header", MatchHeader);
register_module!("http.matchers.query", MatchQuery);
register_module!("http.matchers.protocol", MatchProtocol);
register_module!("http.matchers.remote_ip", MatchRemoteIp);
register_module!("http.matchers.not", MatchNot);
