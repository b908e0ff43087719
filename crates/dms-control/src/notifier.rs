use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use dms_common::events::{EventBus, Notification};

/// Puits de notifications (message texte vers l'opérateur)
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver(&self, text: &str) -> anyhow::Result<()>;
}

/// Relaie les notifications du bus vers le puits.
///
/// Les échecs de livraison sont journalisés et jamais remontés aux
/// opérations qui ont émis l'événement.
pub async fn run_notifier(events: Arc<EventBus>, sink: Arc<dyn NotificationSink>) {
    let mut rx = events.notifications.subscribe();
    info!("Notifier started");

    loop {
        match rx.recv().await {
            Ok(notification) => dispatch(sink.as_ref(), &notification).await,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("Notifier lagged, {} notifications dropped", n);
            }
            Err(broadcast::error::RecvError::Closed) => {
                debug!("Notification bus closed");
                break;
            }
        }
    }
}

async fn dispatch(sink: &dyn NotificationSink, notification: &Notification) {
    if let Err(e) = sink.deliver(&notification.message()).await {
        warn!("Failed to deliver notification: {:#}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dms_common::events::ShutdownScope;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        messages: Mutex<Vec<String>>,
        fail: bool,
    }

    #[async_trait]
    impl NotificationSink for Recorder {
        async fn deliver(&self, text: &str) -> anyhow::Result<()> {
            self.messages.lock().unwrap().push(text.to_string());
            if self.fail {
                anyhow::bail!("sink unavailable");
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_notifications_are_relayed() {
        let events = Arc::new(EventBus::new());
        let sink = Arc::new(Recorder::default());
        let task = tokio::spawn(run_notifier(Arc::clone(&events), sink.clone()));
        tokio::time::sleep(Duration::from_millis(20)).await;

        events.notify(Notification::ShutdownInitiated {
            scope: ShutdownScope::Full,
            hosts: 2,
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let messages = sink.messages.lock().unwrap().clone();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].starts_with("CRITICAL"));
        task.abort();
    }

    #[tokio::test]
    async fn test_delivery_failure_keeps_notifier_alive() {
        let events = Arc::new(EventBus::new());
        let sink = Arc::new(Recorder {
            fail: true,
            ..Recorder::default()
        });
        let task = tokio::spawn(run_notifier(Arc::clone(&events), sink.clone()));
        tokio::time::sleep(Duration::from_millis(20)).await;

        for host in ["a", "b"] {
            events.notify(Notification::HostAdded {
                host: host.into(),
                kind: "ssh".into(),
            });
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(sink.messages.lock().unwrap().len(), 2);
        assert!(!task.is_finished());
        task.abort();
    }
}
