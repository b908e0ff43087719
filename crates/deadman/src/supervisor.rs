use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Durée de fonctionnement au-delà de laquelle le compteur d'échecs repart à zéro
const HEALTHY_AFTER: Duration = Duration::from_secs(60);

/// Priorité d'un service, détermine le comportement de restart
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServicePriority {
    /// Canal de contrôle et notifications : jamais abandonnés
    Critical,
    /// Surveillance des hôtes
    Important,
    /// Purges périodiques
    Background,
}

/// Politique de redémarrage dérivée de la priorité
#[derive(Debug, Clone, Copy)]
struct RestartPolicy {
    max_attempts: Option<u32>,
    base: Duration,
    cap: Duration,
}

impl RestartPolicy {
    fn for_priority(priority: ServicePriority) -> Self {
        match priority {
            ServicePriority::Critical => Self {
                max_attempts: None,
                base: Duration::from_millis(500),
                cap: Duration::from_secs(30),
            },
            ServicePriority::Important => Self {
                max_attempts: Some(10),
                base: Duration::from_secs(1),
                cap: Duration::from_secs(60),
            },
            ServicePriority::Background => Self {
                max_attempts: Some(3),
                base: Duration::from_secs(5),
                cap: Duration::from_secs(120),
            },
        }
    }

    /// Backoff exponentiel plafonné (attempt >= 1)
    fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.base.saturating_mul(factor).min(self.cap)
    }

    fn exhausted(&self, attempt: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempt > max)
    }
}

/// Fin d'un service supervisé
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceExit {
    Completed,
    GaveUp { failures: u32 },
}

/// Lance un service dans une tâche tokio et le relance après une erreur ou un
/// panic, selon sa priorité.
pub fn spawn_supervised<F, Fut>(
    name: &'static str,
    priority: ServicePriority,
    factory: F,
) -> JoinHandle<ServiceExit>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let factory = Arc::new(factory);
    let policy = RestartPolicy::for_priority(priority);

    tokio::spawn(async move {
        let mut failures: u32 = 0;

        loop {
            info!(service = name, ?priority, "Service starting");
            let started = Instant::now();

            let run = Arc::clone(&factory);
            let reason = match tokio::spawn(async move { run().await }).await {
                Ok(Ok(())) => {
                    info!(service = name, "Service stopped");
                    return ServiceExit::Completed;
                }
                Ok(Err(e)) => format!("{e:#}"),
                Err(join_error) => format!("panicked: {join_error}"),
            };

            if started.elapsed() > HEALTHY_AFTER {
                failures = 0;
            }
            failures = failures.saturating_add(1);
            error!(service = name, failures, "Service failed: {reason}");

            if policy.exhausted(failures) {
                error!(service = name, "Service abandoned after {failures} failures");
                return ServiceExit::GaveUp { failures };
            }

            let delay = policy.delay(failures);
            warn!(service = name, "Restarting in {delay:?}");
            tokio::time::sleep(delay).await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_failing_service_is_restarted_until_it_succeeds() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);
        let handle = spawn_supervised("flaky", ServicePriority::Critical, move || {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    anyhow::bail!("boom");
                }
                Ok(())
            }
        });

        let exit = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(exit, ServiceExit::Completed);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RestartPolicy::for_priority(ServicePriority::Critical);
        assert_eq!(policy.delay(1), Duration::from_millis(500));
        assert_eq!(policy.delay(2), Duration::from_secs(1));
        assert_eq!(policy.delay(40), Duration::from_secs(30));
        assert!(!policy.exhausted(u32::MAX));
        assert!(RestartPolicy::for_priority(ServicePriority::Important).exhausted(11));
        let background = RestartPolicy::for_priority(ServicePriority::Background);
        assert!(!background.exhausted(3));
        assert!(background.exhausted(4));
    }
}
