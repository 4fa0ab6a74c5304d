// Background scheduler.
//
// Drives the two proactive maintenance jobs: connectivity probes for
// integrations whose re-check interval elapsed, and the periodic
// expiring-token sweep. The loop is cooperative and shuts down cleanly
// on the cancellation token; one failing cycle never stops it.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{debug, error, info};
use rand::Rng;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::health::{HealthMonitor, CHECK_JITTER_MS};
use crate::providers::AdapterRegistry;
use crate::store::IntegrationStore;
use crate::token::TokenService;
use crate::utils::RateLimitedLogger;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How often the loop wakes to look for due work.
    pub tick_interval: Duration,
    /// How often the expiring-token sweep runs.
    pub sweep_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(600),
        }
    }
}

pub struct Scheduler {
    store: Arc<dyn IntegrationStore>,
    token_service: Arc<TokenService>,
    registry: Arc<AdapterRegistry>,
    monitor: Arc<HealthMonitor>,
    config: SchedulerConfig,
    // Probe failures repeat every cycle while an integration is broken;
    // one warning per minute is plenty.
    probe_log: Arc<RateLimitedLogger>,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn IntegrationStore>,
        token_service: Arc<TokenService>,
        registry: Arc<AdapterRegistry>,
        monitor: Arc<HealthMonitor>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            token_service,
            registry,
            monitor,
            config,
            probe_log: Arc::new(RateLimitedLogger::per_minute()),
        }
    }

    /// Run until the shutdown token fires.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!("Starting integration maintenance loop");
        let mut last_sweep = Utc::now();

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            if let Err(e) = self.cycle(&mut last_sweep).await {
                error!("Error in maintenance cycle: {}", e);
            }

            tokio::select! {
                _ = sleep(self.config.tick_interval) => {}
                _ = shutdown.cancelled() => break,
            }
        }

        info!("Integration maintenance loop stopped");
    }

    async fn cycle(&self, last_sweep: &mut chrono::DateTime<Utc>) -> anyhow::Result<()> {
        let now = Utc::now();

        // Probe whatever the health monitor says is due, each with a
        // random stagger so recovering integrations do not re-check in
        // lockstep.
        for (provider, integration_id) in self.monitor.due_integrations(now).await {
            let integration = match self.store.get(integration_id).await {
                Ok(integration) => integration,
                Err(e) => {
                    debug!(
                        "Skipping probe of {}/{}: {}",
                        provider.as_str(),
                        integration_id,
                        e
                    );
                    continue;
                }
            };
            if !integration.is_active {
                continue;
            }

            let stagger =
                Duration::from_millis(rand::thread_rng().gen_range(0..=CHECK_JITTER_MS) as u64);
            let monitor = self.monitor.clone();
            let registry = self.registry.clone();
            let probe_log = self.probe_log.clone();
            tokio::spawn(async move {
                sleep(stagger).await;
                if let Err(e) = monitor.probe(&registry, &integration).await {
                    probe_log.warn(&format!("Probe did not run: {}", e));
                }
            });
        }

        if now - *last_sweep
            >= chrono::Duration::from_std(self.config.sweep_interval)
                .unwrap_or_else(|_| chrono::Duration::seconds(600))
        {
            *last_sweep = now;
            self.token_service.refresh_expiring_tokens(None).await?;
        }

        Ok(())
    }
}
