//! Utils Module
pub mod hardening;
pub mod otel;

pub use hardening::StartupChecks;
pub use otel::init_telemetry;
