use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use super::{
    ApiPlugin, ConnectionTest, ShutdownResult, ShutdownStatus, base_url, connection_error,
    shutdown_error, split_credentials,
};
use crate::types::ApiTarget;

/// Contrôleur de gestion (BMC) exposant Redfish ; `api_key` vaut `user:password`.
pub struct RedfishPlugin {
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct Collection {
    #[serde(rename = "Members", default)]
    members: Vec<Member>,
}

#[derive(Deserialize)]
struct Member {
    #[serde(rename = "@odata.id")]
    odata_id: String,
}

impl RedfishPlugin {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn get(&self, url: String, target: &ApiTarget<'_>) -> Option<reqwest::RequestBuilder> {
        let (user, password) = split_credentials(target.api_key)?;
        Some(self.client.get(url).basic_auth(user, Some(password)))
    }

    fn post(&self, url: String, target: &ApiTarget<'_>) -> Option<reqwest::RequestBuilder> {
        let (user, password) = split_credentials(target.api_key)?;
        Some(self.client.post(url).basic_auth(user, Some(password)))
    }
}

/// Les membres sont des chemins absolus (`/redfish/v1/Systems/1`)
fn member_url(base: &str, member: &str) -> String {
    if member.starts_with("http://") || member.starts_with("https://") {
        member.to_string()
    } else {
        format!("{base}{member}")
    }
}

#[async_trait]
impl ApiPlugin for RedfishPlugin {
    fn api_type(&self) -> &'static str {
        "redfish"
    }

    async fn test_connection(&self, target: ApiTarget<'_>) -> ConnectionTest {
        let base = base_url(&target, None);
        let Some(req) = self.get(format!("{base}/redfish/v1/Systems"), &target) else {
            return ConnectionTest::failed("Credentials must be formatted as user:password");
        };
        match req.send().await {
            Ok(r) if r.status().is_success() => ConnectionTest::ok(),
            Ok(r) => ConnectionTest::failed(format!("Redfish returned {}", r.status())),
            Err(e) => connection_error(e),
        }
    }

    async fn shutdown(&self, target: ApiTarget<'_>) -> ShutdownResult {
        let base = base_url(&target, None);
        let Some(req) = self.get(format!("{base}/redfish/v1/Systems"), &target) else {
            return ShutdownResult::failed("Credentials must be formatted as user:password");
        };

        let systems: Collection = match req.send().await.and_then(|r| r.error_for_status()) {
            Ok(r) => match r.json().await {
                Ok(c) => c,
                Err(e) => return ShutdownResult::failed(format!("Invalid systems collection: {e}")),
            },
            Err(e) => return shutdown_error(e),
        };
        let Some(system) = systems.members.first() else {
            return ShutdownResult::failed("No computer system exposed by the controller");
        };

        let url = format!(
            "{}/Actions/ComputerSystem.Reset",
            member_url(&base, &system.odata_id)
        );
        let Some(req) = self.post(url, &target) else {
            return ShutdownResult::failed("Credentials must be formatted as user:password");
        };
        match req.json(&json!({ "ResetType": "ForceOff" })).send().await {
            Ok(r) if r.status().is_success() => {
                debug!(host = target.host, system = %system.odata_id, "Redfish ForceOff accepted");
                ShutdownResult::new(ShutdownStatus::Executed, "ForceOff accepted")
            }
            Ok(r) => ShutdownResult::failed(format!("Redfish reset returned {}", r.status())),
            Err(e) => shutdown_error(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_member_url() {
        assert_eq!(
            member_url("https://bmc", "/redfish/v1/Systems/1"),
            "https://bmc/redfish/v1/Systems/1"
        );
        assert_eq!(
            member_url("https://bmc", "https://other/redfish/v1/Systems/1"),
            "https://other/redfish/v1/Systems/1"
        );
    }

    #[test]
    fn test_collection_decoding() {
        let body = r#"{"Members":[{"@odata.id":"/redfish/v1/Systems/System.Embedded.1"}],"Members@odata.count":1}"#;
        let collection: Collection = serde_json::from_str(body).unwrap();
        assert_eq!(collection.members[0].odata_id, "/redfish/v1/Systems/System.Embedded.1");
    }

    #[tokio::test]
    async fn test_malformed_credentials_fail_without_network() {
        let plugin = RedfishPlugin::new(reqwest::Client::new());
        let target = ApiTarget {
            host: "bmc.invalid",
            api_key: "no-colon",
            api_endpoint: "",
        };
        let test = plugin.test_connection(target).await;
        assert!(!test.success);
        let result = plugin.shutdown(target).await;
        assert_eq!(result.status, ShutdownStatus::Failed);
    }
}
