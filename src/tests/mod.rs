//! Integration tests for the Trellis platform.
//!
//! These boot whole configurations through the orchestrator on ephemeral
//! ports and exercise the served HTTP surface and the admin API.

mod cases_boot_test;
mod cases_middleware_test;
mod cases_reload_test;

pub mod support;
