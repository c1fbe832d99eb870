// Global placeholder providers available to every replacer.

use serde_json::Value;

use super::Replacer;

/// Installs the process-wide providers: `system.*`, `time.now.*`, `env.*`.
/// Values are resolved at replace time, not at install time.
pub fn install(r: &mut Replacer) {
    r.add_provider(system);
    r.add_provider(time_now);
    r.add_provider(env);
}

fn system(key: &str) -> Option<Value> {
    let v = match key {
        "system.os" => std::env::consts::OS.to_string(),
        "system.arch" => std::env::consts::ARCH.to_string(),
        "system.pid" => std::process::id().to_string(),
        "system.wd" => std::env::current_dir()
            .map(|p| p.display().to_string())
            .unwrap_or_default(),
        "system.hostname" => std::env::var("HOSTNAME").unwrap_or_default(),
        _ => return None,
    };
    Some(Value::String(v))
}

fn time_now(key: &str) -> Option<Value> {
    let now = chrono::Utc::now();
    let v = match key {
        "time.now.unix" => now.timestamp().to_string(),
        "time.now.unix_ms" => now.timestamp_millis().to_string(),
        "time.now.unix_nano" => now.timestamp_nanos_opt().unwrap_or_default().to_string(),
        "time.now.year" => now.format("%Y").to_string(),
        "time.now.common" => now.format("%Y-%m-%d %H:%M:%S").to_string(),
        "time.now.iso" => now.to_rfc3339(),
        _ => return None,
    };
    Some(Value::String(v))
}

fn env(key: &str) -> Option<Value> {
    let name = key.strip_prefix("env.")?;
    Some(Value::String(std::env::var(name).unwrap_or_default()))
}
