//! Narrow forwarding trait a host can implement to redirect `Queue`
//! lifecycle logs elsewhere (§6 expansion). The crate's own internal
//! logging always goes through `tracing` regardless of what a host
//! `Logger` does with these calls.

use serde_json::Value;

pub trait Logger: Send + Sync {
    fn debug(&self, message: &str, fields: &Value) {
        let _ = (message, fields);
    }
    fn info(&self, message: &str, fields: &Value) {
        let _ = (message, fields);
    }
    fn warn(&self, message: &str, fields: &Value) {
        let _ = (message, fields);
    }
    fn error(&self, message: &str, fields: &Value) {
        let _ = (message, fields);
    }
}

/// Default `Logger`: forwards every call into `tracing`.
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn debug(&self, message: &str, fields: &Value) {
        tracing::debug!(%fields, "{message}");
    }
    fn info(&self, message: &str, fields: &Value) {
        tracing::info!(%fields, "{message}");
    }
    fn warn(&self, message: &str, fields: &Value) {
        tracing::warn!(%fields, "{message}");
    }
    fn error(&self, message: &str, fields: &Value) {
        tracing::error!(%fields, "{message}");
    }
}
