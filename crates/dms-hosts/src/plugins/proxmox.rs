use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use super::{
    ApiPlugin, ConnectionTest, ShutdownResult, ShutdownStatus, base_url, connection_error,
    shutdown_error,
};
use crate::types::ApiTarget;

const DEFAULT_PORT: u16 = 8006;

/// Hyperviseur Proxmox VE, authentifié par jeton d'API
/// (`user@realm!tokenid=secret`).
pub struct ProxmoxPlugin {
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct PveResponse<T> {
    data: T,
}

#[derive(Deserialize)]
struct PveNode {
    node: String,
    #[serde(default)]
    status: Option<String>,
}

impl ProxmoxPlugin {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn auth_header(target: &ApiTarget<'_>) -> String {
        format!("PVEAPIToken={}", target.api_key)
    }

    async fn list_nodes(&self, base: &str, target: &ApiTarget<'_>) -> Result<Vec<PveNode>, reqwest::Error> {
        let resp: PveResponse<Vec<PveNode>> = self
            .client
            .get(format!("{base}/api2/json/nodes"))
            .header("Authorization", Self::auth_header(target))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(resp.data)
    }
}

#[async_trait]
impl ApiPlugin for ProxmoxPlugin {
    fn api_type(&self) -> &'static str {
        "proxmox"
    }

    async fn test_connection(&self, target: ApiTarget<'_>) -> ConnectionTest {
        let base = base_url(&target, Some(DEFAULT_PORT));
        let resp = self
            .client
            .get(format!("{base}/api2/json/version"))
            .header("Authorization", Self::auth_header(&target))
            .send()
            .await;
        match resp {
            Ok(r) if r.status().is_success() => ConnectionTest::ok(),
            Ok(r) => ConnectionTest::failed(format!("Proxmox API returned {}", r.status())),
            Err(e) => connection_error(e),
        }
    }

    async fn shutdown(&self, target: ApiTarget<'_>) -> ShutdownResult {
        let base = base_url(&target, Some(DEFAULT_PORT));
        let nodes = match self.list_nodes(&base, &target).await {
            Ok(nodes) => nodes,
            Err(e) => return shutdown_error(e),
        };

        let online: Vec<&PveNode> = nodes
            .iter()
            .filter(|n| n.status.as_deref().unwrap_or("online") == "online")
            .collect();
        if online.is_empty() {
            return ShutdownResult::failed("No online node reported by the cluster");
        }

        let mut accepted = 0usize;
        let mut errors = Vec::new();
        for node in &online {
            let resp = self
                .client
                .post(format!("{base}/api2/json/nodes/{}/status", node.node))
                .header("Authorization", Self::auth_header(&target))
                .form(&[("command", "shutdown")])
                .send()
                .await;
            match resp {
                Ok(r) if r.status().is_success() => {
                    debug!(host = target.host, node = %node.node, "Proxmox node shutdown accepted");
                    accepted += 1;
                }
                Ok(r) => errors.push(format!("{}: HTTP {}", node.node, r.status())),
                // Le nœud qui porte l'API peut couper avant de répondre
                Err(e) if e.is_timeout() => accepted += 1,
                Err(e) => errors.push(format!("{}: {e}", node.node)),
            }
        }

        if !errors.is_empty() {
            warn!(host = target.host, "Proxmox shutdown errors: {}", errors.join("; "));
        }
        node_summary(accepted, online.len(), &errors)
    }
}

/// Un nœud qui refuse l'arrêt fait échouer l'hôte, même si les autres s'arrêtent
fn node_summary(accepted: usize, total: usize, errors: &[String]) -> ShutdownResult {
    if errors.is_empty() {
        ShutdownResult::new(
            ShutdownStatus::Initiated,
            format!("{accepted} node(s) shutting down"),
        )
    } else {
        ShutdownResult::failed(format!(
            "{accepted}/{total} node(s) shutting down, failed: {}",
            errors.join("; ")
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_node_failure_is_reported() {
        let all = node_summary(3, 3, &[]);
        assert_eq!(all.status, ShutdownStatus::Initiated);
        assert_eq!(all.detail.as_deref(), Some("3 node(s) shutting down"));

        let partial = node_summary(2, 3, &["pve3: HTTP 403 Forbidden".to_string()]);
        assert_eq!(partial.status, ShutdownStatus::Failed);
        assert_eq!(
            partial.detail.as_deref(),
            Some("2/3 node(s) shutting down, failed: pve3: HTTP 403 Forbidden")
        );
    }

    #[test]
    fn test_auth_header() {
        let target = ApiTarget {
            host: "pve1",
            api_key: "root@pam!deadman=uuid",
            api_endpoint: "",
        };
        assert_eq!(
            ProxmoxPlugin::auth_header(&target),
            "PVEAPIToken=root@pam!deadman=uuid"
        );
    }

    #[test]
    fn test_node_list_decoding() {
        let body = r#"{"data":[{"node":"pve1","status":"online","cpu":0.1},{"node":"pve2","status":"offline"}]}"#;
        let resp: PveResponse<Vec<PveNode>> = serde_json::from_str(body).unwrap();
        assert_eq!(resp.data.len(), 2);
        assert_eq!(resp.data[0].node, "pve1");
        assert_eq!(resp.data[1].status.as_deref(), Some("offline"));
    }
}
