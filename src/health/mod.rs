// src/health/mod.rs
//
// Active `/readyz` probing with hysteresis. New backends start healthy
// (optimistic: try-and-fail-fast beats waiting a full cycle). A backend
// flips to unhealthy only after `unhealthy_count_threshold` consecutive
// probe failures, and flips back to healthy on a single success.

use crate::backend::Backend;
use crate::subscriber::{BackendSetListener, TransitionListener};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};

const READYZ_PATH: &str = "/readyz";
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

struct HealthState {
    backends: Vec<Backend>,
    healthy: HashMap<Backend, bool>,
    consecutive_failures: HashMap<Backend, u32>,
    in_flight: HashSet<Backend>,
}

pub struct HealthChecker {
    client: reqwest::Client,
    check_interval: Duration,
    unhealthy_count_threshold: u32,
    state: RwLock<HealthState>,
    listener: Arc<dyn TransitionListener>,
}

impl HealthChecker {
    pub fn new(
        check_interval: Duration,
        unhealthy_count_threshold: u32,
        listener: Arc<dyn TransitionListener>,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(PROBE_TIMEOUT)
            .danger_accept_invalid_certs(true)
            .build()?;

        Ok(Self {
            client,
            check_interval,
            unhealthy_count_threshold,
            state: RwLock::new(HealthState {
                backends: Vec::new(),
                healthy: HashMap::new(),
                consecutive_failures: HashMap::new(),
                in_flight: HashSet::new(),
            }),
            listener,
        })
    }

    /// Snapshot of every known backend's health, for the metrics endpoint.
    pub fn snapshot(&self) -> HashMap<Backend, bool> {
        self.state.read().unwrap().healthy.clone()
    }

    /// Runs the probe loop until `shutdown` resolves.
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.check_interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.probe_all().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("health checker shutting down");
                        break;
                    }
                }
            }
        }
    }

    async fn probe_all(&self) {
        let backends = self.state.read().unwrap().backends.clone();
        let probes = backends.into_iter().map(|b| self.probe_one(b));
        futures::future::join_all(probes).await;
    }

    async fn probe_one(&self, backend: Backend) {
        {
            let mut state = self.state.write().unwrap();
            if !state.in_flight.insert(backend.clone()) {
                return; // already checking this backend; coalesce, don't queue
            }
        }

        let success = self.probe(&backend).await;
        let transition = self.apply_result(&backend, success);

        if let Some(now_healthy) = transition {
            if now_healthy {
                info!(%backend, "backend is now healthy");
            } else {
                warn!(%backend, threshold = self.unhealthy_count_threshold, "backend is now unhealthy");
            }
            self.listener.on_notify(&backend, now_healthy).await;
        }
    }

    async fn probe(&self, backend: &Backend) -> bool {
        let url = format!("https://{backend}{READYZ_PATH}");
        match self.client.get(&url).send().await {
            Ok(resp) => resp.status() == reqwest::StatusCode::OK,
            Err(e) => {
                debug!(%backend, error = %e, "probe failed");
                false
            }
        }
    }

    /// Applies the probe state machine; returns `Some(new_healthy)` only when
    /// the backend actually transitioned.
    fn apply_result(&self, backend: &Backend, success: bool) -> Option<bool> {
        let mut state = self.state.write().unwrap();
        state.in_flight.remove(backend);

        // Backend may have been removed mid-probe.
        if !state.healthy.contains_key(backend) {
            return None;
        }

        if success {
            state.consecutive_failures.insert(backend.clone(), 0);
            let was_healthy = *state.healthy.get(backend).unwrap_or(&true);
            if !was_healthy {
                state.healthy.insert(backend.clone(), true);
                return Some(true);
            }
            None
        } else {
            let failures = state.consecutive_failures.entry(backend.clone()).or_insert(0);
            *failures += 1;
            let failures = *failures;
            let was_healthy = *state.healthy.get(backend).unwrap_or(&true);
            if was_healthy && failures >= self.unhealthy_count_threshold {
                state.healthy.insert(backend.clone(), false);
                return Some(false);
            }
            None
        }
    }
}

#[async_trait]
impl BackendSetListener for HealthChecker {
    /// Seeds newly added backends as healthy and notifies the subscriber so
    /// they become selectable immediately; deletes and notifies unhealthy for
    /// any backend no longer present. No-op if the list is unchanged.
    async fn update_backends(&self, backends: &[Backend]) {
        let (added, removed) = {
            let mut state = self.state.write().unwrap();
            if state.backends == backends {
                return;
            }
            let old: HashSet<Backend> = state.backends.iter().cloned().collect();
            let new: HashSet<Backend> = backends.iter().cloned().collect();

            let added: Vec<Backend> = backends.iter().filter(|b| !old.contains(*b)).cloned().collect();
            let removed: Vec<Backend> = state.backends.iter().filter(|b| !new.contains(*b)).cloned().collect();

            state.backends = backends.to_vec();
            for b in &added {
                state.healthy.insert(b.clone(), true);
                state.consecutive_failures.insert(b.clone(), 0);
            }
            for b in &removed {
                state.healthy.remove(b);
                state.consecutive_failures.remove(b);
                state.in_flight.remove(b);
            }
            (added, removed)
        };

        if !added.is_empty() {
            debug!(count = added.len(), "health checker seeded new backends as healthy");
        }
        for b in &added {
            self.listener.on_notify(b, true).await;
        }
        for b in &removed {
            self.listener.on_notify(b, false).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct RecordingListener {
        events: StdMutex<Vec<(Backend, bool)>>,
    }

    impl RecordingListener {
        fn new() -> Arc<Self> {
            Arc::new(Self { events: StdMutex::new(Vec::new()) })
        }

        fn events(&self) -> Vec<(Backend, bool)> {
            self.events.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl TransitionListener for RecordingListener {
        async fn on_notify(&self, backend: &Backend, healthy: bool) {
            self.events.lock().unwrap().push((backend.clone(), healthy));
        }
    }

    fn checker(threshold: u32, listener: Arc<dyn TransitionListener>) -> HealthChecker {
        HealthChecker::new(Duration::from_secs(1), threshold, listener).unwrap()
    }

    #[tokio::test]
    async fn new_backend_seeds_healthy_without_notification() {
        let listener = RecordingListener::new();
        let hc = checker(3, listener.clone());
        hc.update_backends(&["a:1".to_string()]).await;
        let snap = hc.snapshot();
        assert_eq!(snap.get("a:1"), Some(&true));
        assert!(listener.events().is_empty());
    }

    #[tokio::test]
    async fn removed_backend_is_deleted_and_notified_unhealthy() {
        let listener = RecordingListener::new();
        let hc = checker(3, listener.clone());
        hc.update_backends(&["a:1".to_string()]).await;
        hc.update_backends(&[]).await;
        assert!(hc.snapshot().is_empty());
        assert_eq!(listener.events(), vec![("a:1".to_string(), false)]);
    }

    #[tokio::test]
    async fn identical_update_is_a_no_op() {
        let listener = RecordingListener::new();
        let hc = checker(3, listener.clone());
        hc.update_backends(&["a:1".to_string()]).await;
        hc.update_backends(&["a:1".to_string()]).await;
        assert!(listener.events().is_empty());
    }

    #[tokio::test]
    async fn unhealthy_transition_requires_reaching_threshold() {
        let listener = RecordingListener::new();
        let hc = checker(3, listener.clone());
        hc.update_backends(&["a:1".to_string()]).await;

        assert_eq!(hc.apply_result(&"a:1".to_string(), false), None);
        assert_eq!(hc.apply_result(&"a:1".to_string(), false), None);
        assert_eq!(hc.apply_result(&"a:1".to_string(), false), Some(false));
    }

    #[tokio::test]
    async fn single_success_restores_healthy() {
        let listener = RecordingListener::new();
        let hc = checker(3, listener.clone());
        hc.update_backends(&["a:1".to_string()]).await;
        hc.apply_result(&"a:1".to_string(), false);
        hc.apply_result(&"a:1".to_string(), false);
        hc.apply_result(&"a:1".to_string(), false); // now unhealthy
        assert_eq!(hc.snapshot().get("a:1"), Some(&false));

        let transition = hc.apply_result(&"a:1".to_string(), true);
        assert_eq!(transition, Some(true));
        assert_eq!(hc.snapshot().get("a:1"), Some(&true));
    }
}
