mod render;
mod supervisor;
mod telegram;

use dms_auth::AuthService;
use dms_common::config::EnvConfig;
use dms_common::error::AppError;
use dms_common::events::EventBus;
use dms_control::{ControlService, run_notifier};
use dms_hosts::plugins::ssh::SshTransport;
use dms_hosts::{Executors, HostRegistry, Monitor, Orchestrator, PluginRegistry};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook_tokio::Signals;
use std::sync::Arc;
use std::time::Duration;
use supervisor::{ServiceExit, ServicePriority, spawn_supervised};
use telegram::{TelegramClient, TelegramNotifier};
use tokio_stream::StreamExt;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const FLOW_PURGE_INTERVAL: Duration = Duration::from_secs(60);
const SESSION_CLEANUP_INTERVAL: Duration = Duration::from_secs(3600);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,deadman=debug")),
        )
        .init();

    info!("Dead man's switch starting...");

    let env = EnvConfig::load(None);
    info!("Configuration: {:?}", env);

    std::fs::create_dir_all(&env.data_dir).map_err(AppError::Io)?;

    let events = Arc::new(EventBus::new());

    let auth = AuthService::new(&env).map_err(|e| AppError::Database(format!("{e:#}")))?;
    if !auth.verifier.is_configured() {
        warn!("Static token or TOTP seed missing, login is disabled");
    }
    info!("Auth service initialized");

    let registry = Arc::new(
        HostRegistry::new(&env.db_path()).map_err(|e| AppError::Database(format!("{e:#}")))?,
    );
    info!("Host registry loaded from {}", env.db_path().display());

    let shell = Arc::new(SshTransport::new(env.ssh_key_path.clone(), env.connect_timeout()));
    let plugins = PluginRegistry::with_builtin(env.connect_timeout());
    info!("API plugins: {}", plugins.types().join(", "));
    let executors = Executors::new(shell, plugins);

    let orchestrator = Arc::new(Orchestrator::new(
        Arc::clone(&registry),
        executors.clone(),
        env.shutdown_timeout(),
    ));
    let monitor = Arc::new(Monitor::new(
        Arc::clone(&registry),
        executors.clone(),
        env.connect_timeout(),
        Arc::clone(&events),
    ));

    // Expired session cleanup
    {
        let auth = Arc::clone(&auth);
        let handle = spawn_supervised("session-cleanup", ServicePriority::Background, move || {
            let auth = Arc::clone(&auth);
            async move { auth.run_cleanup(SESSION_CLEANUP_INTERVAL).await }
        });
        watch_exit("session-cleanup", handle);
    }

    let control = Arc::new(
        ControlService::new(
            &env,
            auth,
            registry,
            executors,
            orchestrator,
            Arc::clone(&monitor),
            Arc::clone(&events),
        )
        .with_channel("telegram"),
    );

    // Host monitoring
    {
        let monitor = Arc::clone(&monitor);
        let interval = env.monitor_interval();
        let handle = spawn_supervised("monitor", ServicePriority::Important, move || {
            let monitor = Arc::clone(&monitor);
            async move {
                monitor.run(interval).await;
                Ok(())
            }
        });
        watch_exit("monitor", handle);
    }

    // Host status changes
    {
        let events = Arc::clone(&events);
        let handle = spawn_supervised("status-log", ServicePriority::Background, move || {
            log_status_changes(Arc::clone(&events))
        });
        watch_exit("status-log", handle);
    }

    // Pending flow purge
    {
        let control = Arc::clone(&control);
        let handle = spawn_supervised("flow-purge", ServicePriority::Background, move || {
            let control = Arc::clone(&control);
            async move {
                let mut interval = tokio::time::interval(FLOW_PURGE_INTERVAL);
                loop {
                    interval.tick().await;
                    let purged = control.purge_expired_flows();
                    if purged > 0 {
                        debug!("Purged {} expired flows", purged);
                    }
                }
            }
        });
        watch_exit("flow-purge", handle);
    }

    // Telegram adapter + notifications
    match (env.bot_token.clone(), env.operator_id.clone()) {
        (Some(token), Some(operator_id)) => {
            let client = TelegramClient::new(token).map_err(|e| AppError::Config(format!("{e:#}")))?;

            let notifier = Arc::new(TelegramNotifier::new(client.clone(), operator_id));
            {
                let events = Arc::clone(&events);
                let handle = spawn_supervised("notifier", ServicePriority::Critical, move || {
                    let events = Arc::clone(&events);
                    let sink = Arc::clone(&notifier) as Arc<dyn dms_control::NotificationSink>;
                    async move {
                        run_notifier(events, sink).await;
                        Ok(())
                    }
                });
                watch_exit("notifier", handle);
            }

            let control = Arc::clone(&control);
            let handle = spawn_supervised("telegram", ServicePriority::Critical, move || {
                let client = client.clone();
                let control = Arc::clone(&control);
                async move { telegram::run_adapter(client, control).await }
            });
            watch_exit("telegram", handle);
        }
        _ => warn!("TELEGRAM_BOT_TOKEN or TELEGRAM_CHAT_ID missing, control channel disabled"),
    }

    info!("Dead man's switch running");
    wait_for_stop_signal().await?;
    info!("Stop signal received, exiting");
    Ok(())
}

/// Journalise les transitions de statut relevées par la surveillance
async fn log_status_changes(events: Arc<EventBus>) -> anyhow::Result<()> {
    let mut rx = events.host_status.subscribe();
    loop {
        match rx.recv().await {
            Ok(event) => match &event.error {
                Some(reason) => warn!(host = %event.host_id, status = %event.status, "Host status changed: {}", reason),
                None => info!(host = %event.host_id, status = %event.status, "Host status changed"),
            },
            Err(RecvError::Lagged(n)) => warn!("Status log lagged, {} events skipped", n),
            Err(RecvError::Closed) => return Ok(()),
        }
    }
}

/// Signale un service abandonné par le superviseur
fn watch_exit(name: &'static str, handle: JoinHandle<ServiceExit>) {
    tokio::spawn(async move {
        if let Ok(ServiceExit::GaveUp { failures }) = handle.await {
            error!(service = name, failures, "Service is down until the next restart");
        }
    });
}

async fn wait_for_stop_signal() -> anyhow::Result<()> {
    let mut signals = Signals::new([SIGINT, SIGTERM])?;
    let handle = signals.handle();
    if let Some(signal) = signals.next().await {
        info!("Received signal {}", signal);
    }
    handle.close();
    Ok(())
}
