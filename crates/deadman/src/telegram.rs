//! Adaptateur Telegram : long-poll `getUpdates`, routage vers le service de
//! contrôle, réponses texte et livraison des notifications.

use async_trait::async_trait;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use dms_control::{ControlService, NotificationSink};

use crate::render;

const API_BASE: &str = "https://api.telegram.org";
const POLL_TIMEOUT_SECS: u64 = 30;
/// Limite de taille d'un message Telegram
const MAX_MESSAGE_CHARS: usize = 4096;

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct Update {
    update_id: i64,
    message: Option<Message>,
}

#[derive(Debug, Deserialize)]
pub struct Message {
    message_id: i64,
    from: Option<User>,
    chat: Chat,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct User {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct Chat {
    id: i64,
}

/// Client minimal de l'API Bot
#[derive(Clone)]
pub struct TelegramClient {
    http: reqwest::Client,
    token: String,
}

impl TelegramClient {
    pub fn new(token: String) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(POLL_TIMEOUT_SECS + 10))
            .build()?;
        Ok(Self { http, token })
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, body: serde_json::Value) -> anyhow::Result<T> {
        let url = format!("{}/bot{}/{}", API_BASE, self.token, method);
        let resp: ApiResponse<T> = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            // L'URL contient le jeton : il ne doit pas finir dans les logs
            .map_err(|e| anyhow::anyhow!("{method} request failed: {}", e.without_url()))?
            .json()
            .await
            .map_err(|e| anyhow::anyhow!("{method} response invalid: {}", e.without_url()))?;

        if !resp.ok {
            anyhow::bail!(
                "{method} rejected: {}",
                resp.description.unwrap_or_else(|| "unknown error".into())
            );
        }
        resp.result
            .ok_or_else(|| anyhow::anyhow!("{method} returned no result"))
    }

    pub async fn get_updates(&self, offset: i64) -> anyhow::Result<Vec<Update>> {
        self.call(
            "getUpdates",
            json!({
                "offset": offset,
                "timeout": POLL_TIMEOUT_SECS,
                "allowed_updates": ["message"],
            }),
        )
        .await
    }

    pub async fn send_message(&self, chat_id: &str, text: &str) -> anyhow::Result<()> {
        let text = dms_common::truncate_chars(text, MAX_MESSAGE_CHARS);
        let _: serde_json::Value = self
            .call("sendMessage", json!({ "chat_id": chat_id, "text": text }))
            .await?;
        Ok(())
    }

    pub async fn delete_message(&self, chat_id: i64, message_id: i64) -> anyhow::Result<()> {
        let _: bool = self
            .call(
                "deleteMessage",
                json!({ "chat_id": chat_id, "message_id": message_id }),
            )
            .await?;
        Ok(())
    }
}

/// Notifications envoyées au chat de l'opérateur
pub struct TelegramNotifier {
    client: TelegramClient,
    chat_id: String,
}

impl TelegramNotifier {
    pub fn new(client: TelegramClient, chat_id: String) -> Self {
        Self { client, chat_id }
    }
}

#[async_trait]
impl NotificationSink for TelegramNotifier {
    async fn deliver(&self, text: &str) -> anyhow::Result<()> {
        self.client.send_message(&self.chat_id, text).await
    }
}

/// Boucle de long-poll. Les messages sont traités un par un, dans l'ordre
/// des updates : une réponse n'est jamais appliquée avant la commande qui
/// l'a précédée.
pub async fn run_adapter(client: TelegramClient, control: Arc<ControlService>) -> anyhow::Result<()> {
    info!("Telegram adapter started");
    let mut offset: i64 = 0;

    loop {
        let updates = match client.get_updates(offset).await {
            Ok(updates) => updates,
            Err(e) => {
                warn!("getUpdates failed: {:#}", e);
                tokio::time::sleep(Duration::from_secs(5)).await;
                continue;
            }
        };

        for update in updates {
            offset = offset.max(update.update_id + 1);
            let Some(message) = update.message else {
                continue;
            };
            handle_message(&client, &control, message).await;
        }
    }
}

async fn handle_message(client: &TelegramClient, control: &ControlService, message: Message) {
    let (Some(from), Some(text)) = (message.from.as_ref(), message.text.as_deref()) else {
        return;
    };
    let identity = from.id.to_string();
    let chat_id = message.chat.id;

    debug!(identity = %identity, "Message received");
    let reply = control.handle_text(&identity, text).await;
    let reply_text = render::render(&reply.result);

    if reply.sensitive {
        if let Err(e) = client.delete_message(chat_id, message.message_id).await {
            warn!("Failed to delete sensitive message: {:#}", e);
        }
    }
    if let Err(e) = client.send_message(&chat_id.to_string(), &reply_text).await {
        warn!("Failed to send reply: {:#}", e);
    }
}
