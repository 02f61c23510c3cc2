// src/proxy/mod.rs
//
// Accepts client connections on every configured listen address and forwards
// each to a backend picked by the load balancer from the currently active
// (healthy) set. A backend is only ever added to that set by a health
// transition notification, never merely by appearing in a discovery update;
// removal happens on either a backend-set update or an unhealthy transition,
// and always force-closes every connection already open to that backend —
// there is no graceful drain and no retry against a different backend on
// dial failure.

mod socket;

use crate::backend::{normalized, Backend};
use crate::load_balancer::LoadBalancer;
use crate::subscriber::{BackendSetListener, TransitionListener};
use arc_swap::ArcSwap;
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

// `None` marks a reserved slot: the connection has been accepted and dialed
// (and so already counts toward `hacox_clients_count`) but its forwarding
// task hasn't been spawned yet, so there's no handle to abort on retirement.
type ConnectionMap = HashMap<Backend, HashMap<u64, Option<JoinHandle<()>>>>;

pub struct Proxy {
    load_balancer: Arc<dyn LoadBalancer>,
    /// Every backend currently known to the proxy (from the last backend-set
    /// update), regardless of health.
    known: RwLock<Vec<Backend>>,
    /// The subset of `known` currently healthy and eligible for new
    /// connections. Read on every accepted connection, so it's a lock-free
    /// snapshot rather than something guarded by a lock.
    active: ArcSwap<Vec<Backend>>,
    /// Serializes active-set read-modify-write sequences; reads of `active`
    /// itself stay lock-free.
    active_mutation: Mutex<()>,
    connections: RwLock<ConnectionMap>,
    next_conn_id: AtomicU64,
}

impl Proxy {
    pub fn new(load_balancer: Arc<dyn LoadBalancer>) -> Self {
        Self {
            load_balancer,
            known: RwLock::new(Vec::new()),
            active: ArcSwap::from_pointee(Vec::new()),
            active_mutation: Mutex::new(()),
            connections: RwLock::new(HashMap::new()),
            next_conn_id: AtomicU64::new(0),
        }
    }

    /// Backends currently eligible to receive new connections.
    pub fn active_backends(&self) -> Arc<Vec<Backend>> {
        self.active.load_full()
    }

    /// Open connection counts per backend, for the metrics endpoint.
    pub fn connection_counts(&self) -> HashMap<Backend, usize> {
        self.connections
            .read()
            .unwrap()
            .iter()
            .map(|(backend, conns)| (backend.clone(), conns.len()))
            .collect()
    }

    /// Every backend the proxy currently knows about, healthy or not.
    pub fn known_backends(&self) -> Vec<Backend> {
        self.known.read().unwrap().clone()
    }

    /// Binds every configured address and forwards connections until
    /// `shutdown` resolves.
    pub async fn run(self: Arc<Self>, addrs: &[SocketAddr], mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let mut listeners = Vec::with_capacity(addrs.len());
        for addr in addrs {
            let listener = TcpListener::bind(addr).await?;
            info!(%addr, "proxy listening");
            listeners.push(listener);
        }

        let mut tasks = Vec::with_capacity(listeners.len());
        for listener in listeners {
            let proxy = self.clone();
            let mut shutdown = shutdown.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        accepted = listener.accept() => {
                            match accepted {
                                Ok((stream, peer)) => proxy.clone().handle_accept(stream, peer),
                                Err(e) => warn!(error = %e, "accept failed"),
                            }
                        }
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                break;
                            }
                        }
                    }
                }
            }));
        }

        shutdown.changed().await.ok();
        for task in tasks {
            task.abort();
        }
        Ok(())
    }

    fn handle_accept(self: Arc<Self>, client: TcpStream, peer: SocketAddr) {
        tokio::spawn(async move {
            if let Err(e) = socket::set_keepalive(&client) {
                debug!(error = %e, "failed to set client keepalive");
            }

            let active = self.active.load();
            if active.is_empty() {
                debug!(%peer, "no active backends, dropping connection");
                return;
            }
            let backend = self.load_balancer.select(&active).clone();
            drop(active);

            self.forward(client, peer, backend).await;
        });
    }

    async fn forward(self: Arc<Self>, mut client: TcpStream, peer: SocketAddr, backend: Backend) {
        let dial = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(&backend)).await;
        let mut upstream = match dial {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                warn!(%peer, %backend, error = %e, "dial failed, dropping connection");
                return;
            }
            Err(_) => {
                warn!(%peer, %backend, "dial timed out, dropping connection");
                return;
            }
        };

        if let Err(e) = socket::set_keepalive(&upstream) {
            debug!(error = %e, "failed to set upstream keepalive");
        }

        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        // Reserve the slot before spawning: the copy task can finish and call
        // `remove_connection` before this function gets a chance to store its
        // `JoinHandle`, and on the multi-threaded runtime it can run on
        // another worker immediately. Registering first means `remove_connection`
        // can never race ahead of registration.
        self.reserve_connection(backend.clone(), conn_id);

        let proxy = self.clone();
        let task_backend = backend.clone();

        let handle = tokio::spawn(async move {
            match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
                Ok((to_upstream, to_client)) => {
                    debug!(%peer, backend = %task_backend, to_upstream, to_client, "connection closed");
                }
                Err(e) => {
                    debug!(%peer, backend = %task_backend, error = %e, "connection forwarding error");
                }
            }
            proxy.remove_connection(&task_backend, conn_id);
        });

        self.set_connection_handle(&backend, conn_id, handle);
    }

    fn reserve_connection(&self, backend: Backend, conn_id: u64) {
        self.connections.write().unwrap().entry(backend).or_default().insert(conn_id, None);
    }

    /// Stores the forwarding task's handle in its reserved slot. If the task
    /// already finished and removed the slot, the handle is dropped via abort
    /// (a no-op on an already-completed task) rather than re-inserted.
    fn set_connection_handle(&self, backend: &Backend, conn_id: u64, handle: JoinHandle<()>) {
        let mut connections = self.connections.write().unwrap();
        if let Some(slot) = connections.get_mut(backend).and_then(|conns| conns.get_mut(&conn_id)) {
            *slot = Some(handle);
        } else {
            handle.abort();
        }
    }

    fn remove_connection(&self, backend: &Backend, conn_id: u64) {
        let mut connections = self.connections.write().unwrap();
        if let Some(conns) = connections.get_mut(backend) {
            conns.remove(&conn_id);
            if conns.is_empty() {
                connections.remove(backend);
            }
        }
    }

    /// Force-closes every connection currently open to `backend`. No
    /// graceful drain: in-flight bytes are simply dropped.
    fn retire_backend(&self, backend: &Backend) {
        if let Some(conns) = self.connections.write().unwrap().remove(backend) {
            let count = conns.len();
            for (_, handle) in conns {
                if let Some(handle) = handle {
                    handle.abort();
                }
            }
            if count > 0 {
                debug!(%backend, count, "retired connections for backend");
            }
        }
    }

    fn activate(&self, backend: &Backend) {
        let _guard = self.active_mutation.lock().unwrap();
        if !self.known.read().unwrap().iter().any(|b| b == backend) {
            return; // backend was removed from the known set before this notification landed
        }
        let mut next = (**self.active.load()).clone();
        if !next.iter().any(|b| b == backend) {
            next.push(backend.clone());
            next.sort();
            self.active.store(Arc::new(next));
        }
    }

    fn deactivate(&self, backend: &Backend) {
        let _guard = self.active_mutation.lock().unwrap();
        let mut next = (**self.active.load()).clone();
        if let Some(pos) = next.iter().position(|b| b == backend) {
            next.remove(pos);
            self.active.store(Arc::new(next));
        }
    }
}

#[async_trait]
impl BackendSetListener for Proxy {
    async fn update_backends(&self, backends: &[Backend]) {
        let new_known = normalized(backends);
        let removed = {
            let mut known = self.known.write().unwrap();
            if *known == new_known {
                return;
            }
            let removed: Vec<Backend> = known.iter().filter(|b| !new_known.contains(*b)).cloned().collect();
            *known = new_known;
            removed
        };

        for backend in &removed {
            self.deactivate(backend);
            self.retire_backend(backend);
        }
    }
}

#[async_trait]
impl TransitionListener for Proxy {
    async fn on_notify(&self, backend: &Backend, healthy: bool) {
        if healthy {
            self.activate(backend);
        } else {
            self.deactivate(backend);
            self.retire_backend(backend);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load_balancer::RandomBalancer;

    fn proxy() -> Proxy {
        Proxy::new(Arc::new(RandomBalancer::new()))
    }

    #[tokio::test]
    async fn new_backend_is_known_but_not_active_until_notified_healthy() {
        let p = proxy();
        p.update_backends(&["a:1".to_string()]).await;
        assert!(p.active_backends().is_empty());

        p.on_notify(&"a:1".to_string(), true).await;
        assert_eq!(*p.active_backends(), vec!["a:1".to_string()]);
    }

    #[tokio::test]
    async fn unhealthy_notification_removes_from_active() {
        let p = proxy();
        p.update_backends(&["a:1".to_string()]).await;
        p.on_notify(&"a:1".to_string(), true).await;
        p.on_notify(&"a:1".to_string(), false).await;
        assert!(p.active_backends().is_empty());
    }

    #[tokio::test]
    async fn removed_backend_is_deactivated_even_without_prior_unhealthy_notification() {
        let p = proxy();
        p.update_backends(&["a:1".to_string(), "b:1".to_string()]).await;
        p.on_notify(&"a:1".to_string(), true).await;
        p.on_notify(&"b:1".to_string(), true).await;

        p.update_backends(&["b:1".to_string()]).await;
        assert_eq!(*p.active_backends(), vec!["b:1".to_string()]);
    }

    #[tokio::test]
    async fn stale_healthy_notification_for_removed_backend_is_ignored() {
        let p = proxy();
        p.update_backends(&["a:1".to_string()]).await;
        p.update_backends(&[]).await;
        p.on_notify(&"a:1".to_string(), true).await;
        assert!(p.active_backends().is_empty());
    }
}
