// src/config/mod.rs
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

/// `hacox` — an HA reverse proxy that fronts a Kubernetes API server control
/// plane, rediscovering endpoints through the cluster itself.
#[derive(Debug, Parser, Clone)]
#[command(name = "hacox", version, about)]
pub struct Cli {
    /// Listen address. Repeatable.
    #[arg(long = "address", default_values_t = default_listen_addrs())]
    pub address: Vec<String>,

    /// Port appended to every discovered host.
    #[arg(long = "backend-port", default_value_t = 6443)]
    pub backend_port: u16,

    /// Health probe period.
    #[arg(long = "check-interval", default_value = "2s")]
    pub check_interval: humantime::Duration,

    /// Discovery period.
    #[arg(long = "refresh-interval", default_value = "2m")]
    pub refresh_interval: humantime::Duration,

    /// Consecutive failures before a backend is marked unhealthy.
    #[arg(long = "unhealthy-count-threshold", default_value_t = 3)]
    pub unhealthy_count_threshold: u32,

    /// Kubeconfig used to authenticate discovery requests against the cluster.
    #[arg(long = "kubeconfig", env = "KUBECONFIG", default_value_os_t = default_kubeconfig_path())]
    pub kubeconfig: PathBuf,

    /// Bootstrap/persisted backend list.
    #[arg(long = "servers-config", default_value = "servers.yaml")]
    pub servers_config: PathBuf,

    /// Metrics listen address.
    #[arg(long = "metrics-addr", default_value = ":5444")]
    pub metrics_addr: String,
}

fn default_kubeconfig_path() -> PathBuf {
    let home = std::env::var_os("HOME").unwrap_or_default();
    PathBuf::from(home).join(".kube").join("config")
}

fn default_listen_addrs() -> Vec<String> {
    vec!["127.0.0.1:5443".to_string(), "[::1]:5443".to_string()]
}

impl Cli {
    pub fn check_interval(&self) -> Duration {
        self.check_interval.into()
    }

    pub fn refresh_interval(&self) -> Duration {
        self.refresh_interval.into()
    }

    /// The metrics address as configured, coercing a bare `:port` form (the
    /// conventional Go-style "listen on all interfaces" shorthand) into a
    /// `SocketAddr`-parseable `0.0.0.0:port` form.
    pub fn metrics_socket_addr(&self) -> anyhow::Result<std::net::SocketAddr> {
        let addr = if let Some(port) = self.metrics_addr.strip_prefix(':') {
            format!("0.0.0.0:{port}")
        } else {
            self.metrics_addr.clone()
        };
        Ok(addr.parse()?)
    }

    /// Parses every `--address` flag into a `SocketAddr`, failing fast (a
    /// fatal startup error) if any is malformed.
    pub fn listen_addrs(&self) -> anyhow::Result<Vec<std::net::SocketAddr>> {
        self.address
            .iter()
            .map(|a| a.parse().map_err(|e| anyhow::anyhow!("invalid --address {a}: {e}")))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_defaults() {
        let cli = Cli::parse_from(["hacox"]);
        assert_eq!(cli.backend_port, 6443);
        assert_eq!(cli.unhealthy_count_threshold, 3);
        assert_eq!(cli.check_interval(), Duration::from_secs(2));
        assert_eq!(cli.refresh_interval(), Duration::from_secs(120));
        assert_eq!(cli.address, vec!["127.0.0.1:5443", "[::1]:5443"]);
    }

    #[test]
    fn metrics_addr_coerces_bare_port() {
        let cli = Cli::parse_from(["hacox", "--metrics-addr", ":5444"]);
        assert_eq!(
            cli.metrics_socket_addr().unwrap(),
            "0.0.0.0:5444".parse().unwrap()
        );
    }

    #[test]
    fn listen_addrs_parses_each_flag() {
        let cli = Cli::parse_from(["hacox", "--address", "127.0.0.1:9000", "--address", "[::1]:9000"]);
        let addrs = cli.listen_addrs().unwrap();
        assert_eq!(addrs.len(), 2);
    }
}
