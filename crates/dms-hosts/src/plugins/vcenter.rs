use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use super::{
    ApiPlugin, ConnectionTest, ShutdownResult, ShutdownStatus, base_url, connection_error,
    shutdown_error,
};
use crate::types::ApiTarget;

const SESSION_HEADER: &str = "vmware-api-session-id";

/// vCenter (API REST `/api`).
///
/// Identifiants : `api_key` porte le compte (`admin@vsphere.local`),
/// `api_endpoint` le mot de passe ; l'URL est toujours `https://host`.
pub struct VcenterPlugin {
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct VmSummary {
    vm: String,
    #[serde(default)]
    name: String,
}

impl VcenterPlugin {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn base(target: &ApiTarget<'_>) -> String {
        // Le champ endpoint est occupé par le mot de passe
        base_url(
            &ApiTarget {
                host: target.host,
                api_key: target.api_key,
                api_endpoint: "",
            },
            None,
        )
    }

    async fn open_session(&self, base: &str, target: &ApiTarget<'_>) -> Result<String, SessionError> {
        if target.api_key.is_empty() {
            return Err(SessionError::Rejected("Missing vCenter username".into()));
        }
        let resp = self
            .client
            .post(format!("{base}/api/session"))
            .basic_auth(target.api_key, Some(target.api_endpoint))
            .send()
            .await
            .map_err(SessionError::Http)?;
        if !resp.status().is_success() {
            return Err(SessionError::Rejected(format!(
                "vCenter session refused: {}",
                resp.status()
            )));
        }
        // Le jeton est renvoyé comme une chaîne JSON
        resp.json::<String>().await.map_err(SessionError::Http)
    }

    async fn close_session(&self, base: &str, token: &str) {
        if let Err(e) = self
            .client
            .delete(format!("{base}/api/session"))
            .header(SESSION_HEADER, token)
            .send()
            .await
        {
            debug!("Failed to close vCenter session: {}", e);
        }
    }

    async fn power_off_all(&self, base: &str, token: &str) -> ShutdownResult {
        let vms: Vec<VmSummary> = match self
            .client
            .get(format!("{base}/api/vcenter/vm"))
            .query(&[("power_states", "POWERED_ON")])
            .header(SESSION_HEADER, token)
            .send()
            .await
            .and_then(|r| r.error_for_status())
        {
            Ok(r) => match r.json().await {
                Ok(vms) => vms,
                Err(e) => return ShutdownResult::failed(format!("Invalid VM list: {e}")),
            },
            Err(e) => return shutdown_error(e),
        };

        if vms.is_empty() {
            return ShutdownResult::new(ShutdownStatus::Executed, "no powered-on VM");
        }

        let mut stopped = 0usize;
        let mut failed = Vec::new();
        for vm in &vms {
            let resp = self
                .client
                .post(format!("{base}/api/vcenter/vm/{}/power", vm.vm))
                .query(&[("action", "stop")])
                .header(SESSION_HEADER, token)
                .send()
                .await;
            match resp {
                Ok(r) if r.status().is_success() => stopped += 1,
                Ok(r) => failed.push(format!("{} ({})", vm.name, r.status())),
                Err(e) => failed.push(format!("{} ({e})", vm.name)),
            }
        }

        if !failed.is_empty() {
            warn!("vCenter VMs not stopped: {}", failed.join(", "));
        }
        vm_summary(stopped, vms.len(), &failed)
    }
}

/// Une VM restée allumée fait échouer l'hôte et apparaît dans le détail
fn vm_summary(stopped: usize, total: usize, failed: &[String]) -> ShutdownResult {
    if failed.is_empty() {
        ShutdownResult::new(ShutdownStatus::Executed, format!("{stopped} VM(s) stopped"))
    } else {
        ShutdownResult::failed(format!(
            "{stopped}/{total} VM(s) stopped, still running: {}",
            failed.join(", ")
        ))
    }
}

enum SessionError {
    Http(reqwest::Error),
    Rejected(String),
}

#[async_trait]
impl ApiPlugin for VcenterPlugin {
    fn api_type(&self) -> &'static str {
        "vcenter"
    }

    async fn test_connection(&self, target: ApiTarget<'_>) -> ConnectionTest {
        let base = Self::base(&target);
        match self.open_session(&base, &target).await {
            Ok(token) => {
                self.close_session(&base, &token).await;
                ConnectionTest::ok()
            }
            Err(SessionError::Http(e)) => connection_error(e),
            Err(SessionError::Rejected(msg)) => ConnectionTest::failed(msg),
        }
    }

    async fn shutdown(&self, target: ApiTarget<'_>) -> ShutdownResult {
        let base = Self::base(&target);
        let token = match self.open_session(&base, &target).await {
            Ok(token) => token,
            Err(SessionError::Http(e)) => return shutdown_error(e),
            Err(SessionError::Rejected(msg)) => return ShutdownResult::failed(msg),
        };
        let result = self.power_off_all(&base, &token).await;
        self.close_session(&base, &token).await;
        result
    }
}
