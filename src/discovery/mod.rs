// src/discovery/mod.rs
//
// Keeps the canonical BackendSet current by periodically rediscovering
// control-plane endpoints through the cluster itself, persists it, and
// notifies subscribers (Proxy, then HealthChecker, in registration order).

pub mod auth;
pub mod cluster;
pub mod persist;

use crate::backend::{normalized, with_port};
use crate::subscriber::BackendSetListener;
use anyhow::Result;
use rand::seq::SliceRandom;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use auth::KubeconfigWatch;

/// Distinguishes why a single refresh attempt failed, so the refresh loop
/// can log at the right level without string-matching an `anyhow::Error`.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("kubeconfig unreadable: {0}")]
    KubeconfigUnreadable(#[source] anyhow::Error),
    #[error("all {candidates} discovery candidates failed")]
    AllCandidatesFailed { candidates: usize },
    #[error("discovery returned an empty set; refusing to wipe the bootstrap list")]
    EmptyResult,
}

struct DiscoveryState {
    /// Bootstrap/discovered hosts, bare (no backend port), sorted+deduped.
    hosts: Vec<String>,
    /// A permutation of `[0, hosts.len())`, regenerated when length changes.
    shuffle: Vec<usize>,
}

pub struct Discovery {
    servers_config: PathBuf,
    backend_port: u16,
    refresh_interval: Duration,
    state: RwLock<DiscoveryState>,
    kubeconfig: tokio::sync::Mutex<KubeconfigWatch>,
    listeners: Vec<Arc<dyn BackendSetListener>>,
}

impl Discovery {
    /// Loads the bootstrap list from `servers_config`, failing startup if
    /// it's missing, unparseable, or empty. Does not yet notify listeners —
    /// call `announce_initial` once listeners are registered.
    pub async fn bootstrap(
        servers_config: PathBuf,
        kubeconfig_path: PathBuf,
        backend_port: u16,
        refresh_interval: Duration,
    ) -> Result<Self> {
        let hosts = persist::load(&servers_config).await?;
        let shuffle = fresh_shuffle(hosts.len());

        Ok(Self {
            servers_config,
            backend_port,
            refresh_interval,
            state: RwLock::new(DiscoveryState { hosts, shuffle }),
            kubeconfig: tokio::sync::Mutex::new(KubeconfigWatch::new(kubeconfig_path)),
            listeners: Vec::new(),
        })
    }

    pub fn add_listener(&mut self, listener: Arc<dyn BackendSetListener>) {
        self.listeners.push(listener);
    }

    /// The current backend list with the configured port appended, in
    /// `host:port` form.
    pub async fn current_backends(&self) -> Vec<String> {
        let state = self.state.read().await;
        state.hosts.iter().map(|h| with_port(h, self.backend_port)).collect()
    }

    /// Emits the bootstrap list to all subscribers. Must be called once,
    /// before the refresh loop starts.
    pub async fn announce_initial(&self) {
        let backends = self.current_backends().await;
        for listener in &self.listeners {
            listener.update_backends(&backends).await;
        }
    }

    /// Runs the refresh loop until `shutdown` resolves.
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.refresh_interval);
        interval.tick().await; // first tick fires immediately; skip it, bootstrap already announced

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.refresh_once().await {
                        match &e {
                            DiscoveryError::KubeconfigUnreadable(_) => {
                                warn!(error = %e, "discovery refresh failed: kubeconfig unreadable, keeping existing backend set");
                            }
                            DiscoveryError::AllCandidatesFailed { candidates } => {
                                warn!(error = %e, candidates, "discovery refresh failed: no candidate reached the cluster, keeping existing backend set");
                            }
                            DiscoveryError::EmptyResult => {
                                warn!(error = %e, "discovery refresh failed: cluster returned no endpoints, keeping existing backend set");
                            }
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("discovery loop shutting down");
                        break;
                    }
                }
            }
        }
    }

    async fn refresh_once(&self) -> std::result::Result<(), DiscoveryError> {
        let material = {
            let mut kubeconfig = self.kubeconfig.lock().await;
            kubeconfig
                .refresh()
                .await
                .map_err(DiscoveryError::KubeconfigUnreadable)?
                .clone()
        };

        let candidates = {
            let state = self.state.read().await;
            state.shuffle.iter().map(|&i| state.hosts[i].clone()).collect::<Vec<_>>()
        };

        let mut discovered = None;
        for candidate in &candidates {
            match cluster::fetch_from_candidate(candidate, self.backend_port, &material).await {
                Ok(hosts) => {
                    discovered = Some(hosts);
                    break;
                }
                Err(e) => {
                    debug!(%candidate, error = %e, "discovery candidate failed, trying next");
                }
            }
        }

        let Some(new_hosts) = discovered else {
            return Err(DiscoveryError::AllCandidatesFailed { candidates: candidates.len() });
        };

        let new_hosts = normalized(&new_hosts);
        if new_hosts.is_empty() {
            return Err(DiscoveryError::EmptyResult);
        }

        let changed = {
            let mut state = self.state.write().await;
            if state.hosts == new_hosts {
                false
            } else {
                let length_changed = state.hosts.len() != new_hosts.len();
                state.hosts = new_hosts.clone();
                if length_changed {
                    state.shuffle = fresh_shuffle(state.hosts.len());
                }
                true
            }
        };

        if !changed {
            debug!("discovery refresh stable, no change");
            return Ok(());
        }

        if let Err(e) = persist::save(&self.servers_config, &new_hosts).await {
            warn!(error = %e, "failed to persist servers-config; next successful refresh will retry");
        }

        let backends: Vec<String> = new_hosts.iter().map(|h| with_port(h, self.backend_port)).collect();
        info!(count = backends.len(), "discovery refreshed backend set");
        for listener in &self.listeners {
            listener.update_backends(&backends).await;
        }

        Ok(())
    }
}

fn fresh_shuffle(len: usize) -> Vec<usize> {
    let mut indices: Vec<usize> = (0..len).collect();
    indices.shuffle(&mut rand::thread_rng());
    indices
}
