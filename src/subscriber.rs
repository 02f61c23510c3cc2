// src/subscriber.rs
//
// Single-method capabilities used to wire components together without
// circular ownership: Discovery holds a list of `BackendSetListener`s,
// HealthChecker holds one `TransitionListener`. Neither Proxy nor
// HealthChecker knows about Discovery, and Discovery/HealthChecker don't
// know about Metrics — Metrics only reads read-only snapshots.

use crate::backend::Backend;
use async_trait::async_trait;

/// Notified with the full, freshly-normalized backend list whenever
/// Discovery's view of the cluster changes (including the initial load).
#[async_trait]
pub trait BackendSetListener: Send + Sync {
    async fn update_backends(&self, backends: &[Backend]);
}

/// Notified on every HealthChecker state transition for a single backend.
#[async_trait]
pub trait TransitionListener: Send + Sync {
    async fn on_notify(&self, backend: &Backend, healthy: bool);
}
