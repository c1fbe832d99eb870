// Package replacer provides context-bound late-binding string substitution.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;

mod globals;

/// A value provider: resolves a placeholder key, first hit wins.
pub type Provider = Arc<dyn Fn(&str) -> Option<Value> + Send + Sync>;

/// Late-binding `{key}` substitution over an ordered provider chain plus a
/// map of explicit overrides. Overrides are consulted before providers.
///
/// Syntax: `{key}` or `{key:default}` (literal default); `\{` escapes an
/// opening brace; nesting is not supported and resolved values are never
/// re-scanned.
pub struct Replacer {
    providers: Vec<Provider>,
    overrides: Mutex<HashMap<String, Value>>,
}

impl Replacer {
    /// An empty replacer with no providers.
    pub fn new() -> Self {
        Self {
            providers: Vec::new(),
            overrides: Mutex::new(HashMap::new()),
        }
    }

    /// A replacer preloaded with the global providers: `system.*`,
    /// `time.now.*` and `env.*`.
    pub fn with_globals() -> Self {
        let mut r = Self::new();
        globals::install(&mut r);
        r
    }

    /// Appends a provider; providers are consulted in registration order.
    pub fn add_provider<F>(&mut self, f: F)
    where
        F: Fn(&str) -> Option<Value> + Send + Sync + 'static,
    {
        self.providers.push(Arc::new(f));
    }

    pub fn set(&self, key: impl Into<String>, value: Value) {
        self.overrides.lock().insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        if let Some(v) = self.overrides.lock().get(key) {
            return Some(v.clone());
        }
        self.providers.iter().find_map(|p| p(key))
    }

    pub fn delete(&self, key: &str) {
        self.overrides.lock().remove(key);
    }

    /// Substitutes every placeholder; unresolved keys become `empty`.
    pub fn replace_all(&self, input: &str, empty: &str) -> String {
        self.replace(input, empty, true)
    }

    /// Substitutes known placeholders; unresolved ones are left intact.
    pub fn replace_known(&self, input: &str, empty: &str) -> String {
        self.replace(input, empty, false)
    }

    fn replace(&self, input: &str, empty: &str, replace_unknown: bool) -> String {
        let mut out = String::with_capacity(input.len());
        let mut rest = input;

        while let Some(open) = rest.find('{') {
            // A backslash escapes the opening brace.
            if open > 0 && rest.as_bytes()[open - 1] == b'\\' {
                out.push_str(&rest[..open - 1]);
                out.push('{');
                rest = &rest[open + 1..];
                continue;
            }

            out.push_str(&rest[..open]);
            let after = &rest[open + 1..];
            let Some(close) = after.find('}') else {
                // Unterminated placeholder: emit the remainder verbatim.
                out.push_str(&rest[open..]);
                return out;
            };

            let token = &after[..close];
            let (key, default) = match token.split_once(':') {
                Some((k, d)) => (k, Some(d)),
                None => (token, None),
            };

            match self.get(key) {
                Some(v) => out.push_str(&stringify(&v)),
                None => match default {
                    Some(d) => out.push_str(d),
                    None if replace_unknown => out.push_str(empty),
                    None => {
                        out.push('{');
                        out.push_str(token);
                        out.push('}');
                    }
                },
            }

            rest = &after[close + 1..];
        }

        out.push_str(rest);
        out
    }
}

impl Default for Replacer {
    fn default() -> Self {
        Self::new()
    }
}

/// Stringification rule for resolved values: strings as-is, scalars via
/// Display, null and missing as empty, composites as compact JSON.
/// JSON carries no duration type, so duration-valued placeholders (such
/// as `http.request.duration`) arrive here already rendered by
/// [`format_duration`].
pub fn stringify(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Formats a duration in the Go style used by config durations and
/// duration-valued placeholders: `3m10s`, `1h0m0.5s`, `250ms`.
pub fn format_duration(d: Duration) -> String {
    let nanos = d.as_nanos();
    if nanos == 0 {
        return "0s".to_string();
    }
    if nanos < 1_000 {
        return format!("{}ns", nanos);
    }
    if nanos < 1_000_000 {
        return format!("{}µs", nanos as f64 / 1_000.0);
    }
    if nanos < 1_000_000_000 {
        return format!("{}ms", nanos as f64 / 1_000_000.0);
    }

    let total_secs = d.as_secs_f64();
    let hours = (total_secs / 3600.0) as u64;
    let minutes = ((total_secs % 3600.0) / 60.0) as u64;
    let seconds = total_secs % 60.0;

    let mut out = String::new();
    if hours > 0 {
        out.push_str(&format!("{}h", hours));
    }
    if minutes > 0 || hours > 0 {
        out.push_str(&format!("{}m", minutes));
    }
    if seconds == seconds.trunc() {
        out.push_str(&format!("{}s", seconds as u64));
    } else {
        out.push_str(&format!("{}s", seconds));
    }
    out
}
