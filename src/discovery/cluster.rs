// src/discovery/cluster.rs
//
// One discovery attempt against a single candidate backend: build a
// TLS-unverified client carrying the derived auth material, list nodes
// (control-plane, then master label) and kube-system kube-apiserver pods,
// and extract host addresses from the results.

use crate::backend::normalize;
use crate::discovery::auth::AuthMaterial;
use crate::ipv6::wrap_host;
use anyhow::{Context, Result};
use serde::Deserialize;

const LABEL_NODE_ROLE_CONTROL_PLANE: &str = "node-role.kubernetes.io/control-plane";
const LABEL_NODE_ROLE_MASTER: &str = "node-role.kubernetes.io/master";
const LABEL_POD_COMPONENT_KUBE_APISERVER: &str = "component=kube-apiserver";

#[derive(Debug, Deserialize)]
struct NodeList {
    items: Vec<Node>,
}

#[derive(Debug, Deserialize)]
struct Node {
    status: NodeStatus,
}

#[derive(Debug, Deserialize, Default)]
struct NodeStatus {
    #[serde(default)]
    addresses: Vec<NodeAddress>,
}

#[derive(Debug, Deserialize)]
struct NodeAddress {
    #[serde(rename = "type")]
    kind: String,
    address: String,
}

#[derive(Debug, Deserialize)]
struct PodList {
    items: Vec<Pod>,
}

#[derive(Debug, Deserialize)]
struct Pod {
    status: PodStatus,
}

#[derive(Debug, Deserialize, Default)]
struct PodStatus {
    #[serde(rename = "podIP", default)]
    pod_ip: Option<String>,
    #[serde(rename = "hostIPs", default)]
    host_ips: Vec<HostIp>,
}

#[derive(Debug, Deserialize)]
struct HostIp {
    ip: String,
}

/// Builds a reqwest client for a single discovery candidate: server TLS
/// verification disabled (the proxy bootstraps itself from a potentially
/// unverifiable local endpoint), plus a client cert identity if the auth
/// material calls for one.
fn build_client(auth: &AuthMaterial) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder().danger_accept_invalid_certs(true);
    if let Some(identity) = auth.identity()? {
        builder = builder.identity(identity);
    }
    builder.build().context("building discovery HTTP client")
}

/// Attempts one discovery round-trip against `candidate:port`, returning the
/// union of node/pod addresses, sorted and deduplicated. Any HTTP failure at
/// any of the three requests fails the whole attempt so the caller can move
/// on to the next candidate.
pub async fn fetch_from_candidate(
    candidate: &str,
    backend_port: u16,
    auth: &AuthMaterial,
) -> Result<Vec<String>> {
    let client = build_client(auth)?;
    let base = format!("https://{}:{}", wrap_host(candidate), backend_port);

    let mut hosts = Vec::new();

    for label in [LABEL_NODE_ROLE_CONTROL_PLANE, LABEL_NODE_ROLE_MASTER] {
        let url = format!("{base}/api/v1/nodes?labelSelector={label}");
        let nodes: NodeList = auth
            .apply(client.get(&url).header("Accept", "application/json"))
            .send()
            .await
            .with_context(|| format!("listing nodes via {candidate} with label {label}"))?
            .error_for_status()
            .with_context(|| format!("listing nodes via {candidate} with label {label}"))?
            .json()
            .await
            .context("decoding node list JSON")?;

        for node in &nodes.items {
            addresses_from_node(&mut hosts, node);
        }
    }

    let pods_url = format!(
        "{base}/api/v1/namespaces/kube-system/pods?labelSelector={LABEL_POD_COMPONENT_KUBE_APISERVER}"
    );
    let pods: PodList = auth
        .apply(client.get(&pods_url).header("Accept", "application/json"))
        .send()
        .await
        .with_context(|| format!("listing kube-apiserver pods via {candidate}"))?
        .error_for_status()
        .with_context(|| format!("listing kube-apiserver pods via {candidate}"))?
        .json()
        .await
        .context("decoding pod list JSON")?;

    for pod in &pods.items {
        addresses_from_pod(&mut hosts, pod);
    }

    normalize(&mut hosts);
    Ok(hosts)
}

/// Every `InternalIP` address on the node; if it has none, fall back to its
/// `HostName` entries. (See SPEC_FULL.md §10.5: one retained source variant
/// drops the address in that fallback branch — that's a bug, not behavior to
/// preserve.)
fn addresses_from_node(out: &mut Vec<String>, node: &Node) {
    let mut has_internal_ip = false;
    for addr in &node.status.addresses {
        if addr.kind == "InternalIP" {
            out.push(addr.address.clone());
            has_internal_ip = true;
        }
    }
    if !has_internal_ip {
        for addr in &node.status.addresses {
            if addr.kind == "HostName" {
                out.push(addr.address.clone());
            }
        }
    }
}

fn addresses_from_pod(out: &mut Vec<String>, pod: &Pod) {
    if let Some(ip) = &pod.status.pod_ip {
        out.push(ip.clone());
    }
    for host_ip in &pod.status.host_ips {
        out.push(host_ip.ip.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn node_with(addresses: Vec<(&str, &str)>) -> Node {
        let addresses = addresses
            .into_iter()
            .map(|(kind, address)| NodeAddress {
                kind: kind.to_string(),
                address: address.to_string(),
            })
            .collect();
        Node {
            status: NodeStatus { addresses },
        }
    }

    #[test]
    fn prefers_internal_ip_over_hostname() {
        let node = node_with(vec![
            ("HostName", "node-a"),
            ("InternalIP", "10.0.0.1"),
            ("InternalIP", "10.0.0.2"),
        ]);
        let mut out = Vec::new();
        addresses_from_node(&mut out, &node);
        assert_eq!(out, vec!["10.0.0.1", "10.0.0.2"]);
    }

    #[test]
    fn falls_back_to_hostname_without_internal_ip() {
        let node = node_with(vec![("HostName", "node-a"), ("ExternalIP", "1.2.3.4")]);
        let mut out = Vec::new();
        addresses_from_node(&mut out, &node);
        assert_eq!(out, vec!["node-a"]);
    }

    #[test]
    fn pod_addresses_include_pod_ip_and_host_ips() {
        let pod = Pod {
            status: PodStatus {
                pod_ip: Some("10.1.0.5".to_string()),
                host_ips: vec![
                    HostIp { ip: "10.0.0.1".to_string() },
                    HostIp { ip: "10.0.0.2".to_string() },
                ],
            },
        };
        let mut out = Vec::new();
        addresses_from_pod(&mut out, &pod);
        assert_eq!(out, vec!["10.1.0.5", "10.0.0.1", "10.0.0.2"]);
    }

    #[test]
    fn node_list_response_deserializes() {
        let body = json!({
            "items": [
                {"status": {"addresses": [{"type": "InternalIP", "address": "10.0.0.1"}]}}
            ]
        });
        let parsed: NodeList = serde_json::from_value(body).unwrap();
        assert_eq!(parsed.items.len(), 1);
    }
}
