// Package metrics provides platform counters and their Prometheus text
// rendering, served by the admin endpoint.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

static REQUESTS_TOTAL: AtomicU64 = AtomicU64::new(0);
static HANDLER_ERRORS: AtomicU64 = AtomicU64::new(0);
static PANICKED_REQUESTS: AtomicU64 = AtomicU64::new(0);
static REHANDLE_ABORTS: AtomicU64 = AtomicU64::new(0);
static RELOADS_TOTAL: AtomicU64 = AtomicU64::new(0);
static RELOAD_FAILURES: AtomicU64 = AtomicU64::new(0);
static ACTIVE_REQUESTS: AtomicI64 = AtomicI64::new(0);

pub fn inc_requests() {
    REQUESTS_TOTAL.fetch_add(1, Ordering::Relaxed);
}

pub fn inc_handler_errors() {
    HANDLER_ERRORS.fetch_add(1, Ordering::Relaxed);
}

pub fn inc_panics() {
    PANICKED_REQUESTS.fetch_add(1, Ordering::Relaxed);
}

pub fn inc_rehandle_aborts() {
    REHANDLE_ABORTS.fetch_add(1, Ordering::Relaxed);
}

pub fn inc_reloads() {
    RELOADS_TOTAL.fetch_add(1, Ordering::Relaxed);
}

pub fn inc_reload_failures() {
    RELOAD_FAILURES.fetch_add(1, Ordering::Relaxed);
}

pub fn request_started() {
    ACTIVE_REQUESTS.fetch_add(1, Ordering::Relaxed);
}

pub fn request_finished() {
    ACTIVE_REQUESTS.fetch_sub(1, Ordering::Relaxed);
}

/// Formats all counters in Prometheus exposition format.
pub fn render_prometheus() -> String {
    let mut output = String::with_capacity(1024);

    let counters: [(&str, &str, u64); 6] = [
        ("requests_total", "Total number of requests served", REQUESTS_TOTAL.load(Ordering::Relaxed)),
        ("handler_errors_total", "Total number of handler chain errors", HANDLER_ERRORS.load(Ordering::Relaxed)),
        ("panics_total", "Total number of recovered handler panics", PANICKED_REQUESTS.load(Ordering::Relaxed)),
        ("rehandle_aborts_total", "Total number of aborted rehandle loops", REHANDLE_ABORTS.load(Ordering::Relaxed)),
        ("config_reloads_total", "Total number of successful config loads", RELOADS_TOTAL.load(Ordering::Relaxed)),
        ("config_reload_failures_total", "Total number of failed config loads", RELOAD_FAILURES.load(Ordering::Relaxed)),
    ];

    for (name, help, value) in counters {
        output.push_str("# HELP trellis_");
        output.push_str(name);
        output.push(' ');
        output.push_str(help);
        output.push_str("\n# TYPE trellis_");
        output.push_str(name);
        output.push_str(" counter\ntrellis_");
        output.push_str(name);
        output.push(' ');
        output.push_str(&value.to_string());
        output.push('\n');
    }

    output.push_str("# HELP trellis_active_requests Requests currently in flight\n");
    output.push_str("# TYPE trellis_active_requests gauge\n");
    output.push_str("trellis_active_requests ");
    output.push_str(&ACTIVE_REQUESTS.load(Ordering::Relaxed).to_string());
    output.push('\n');

    output
}
