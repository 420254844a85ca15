//! Global emergency stop across all routes.
//!
//! Sums daily losses over every live worker on a fixed cadence and, at
//! the configured global limit, halts every worker. The stop latches:
//! clearing it requires an operator restart.

use copy_core::notifier::Notifier;
use copy_engine::WorkerHandle;
use dashmap::DashMap;
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::{interval, Duration};
use tracing::{error, info, warn};

#[derive(Debug, Clone)]
pub struct EmergencyStopConfig {
    pub enabled: bool,
    /// Summed daily loss across routes that trips the stop.
    pub daily_loss_limit: Decimal,
    pub check_interval_secs: u64,
}

impl Default for EmergencyStopConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            daily_loss_limit: Decimal::new(5000, 0),
            check_interval_secs: 60,
        }
    }
}

pub struct GlobalLossSupervisor {
    workers: Arc<DashMap<String, Arc<WorkerHandle>>>,
    config: EmergencyStopConfig,
    notifier: Arc<Notifier>,
    tripped: AtomicBool,
    active: RwLock<bool>,
}

impl GlobalLossSupervisor {
    pub fn new(
        workers: Arc<DashMap<String, Arc<WorkerHandle>>>,
        config: EmergencyStopConfig,
        notifier: Arc<Notifier>,
    ) -> Arc<Self> {
        Arc::new(Self {
            workers,
            config,
            notifier,
            tripped: AtomicBool::new(false),
            active: RwLock::new(false),
        })
    }

    pub fn is_tripped(&self) -> bool {
        self.tripped.load(Ordering::SeqCst)
    }

    /// One supervisor pass. Returns true when the stop is (or already
    /// was) latched.
    pub async fn check_once(&self) -> bool {
        if self.is_tripped() {
            return true;
        }
        if !self.config.enabled {
            return false;
        }

        let mut total_loss = Decimal::ZERO;
        for entry in self.workers.iter() {
            let stats = entry.value().stats().await;
            total_loss += stats.daily.daily_loss;
        }

        if total_loss < self.config.daily_loss_limit {
            return false;
        }

        self.tripped.store(true, Ordering::SeqCst);
        error!(
            total_loss = %total_loss,
            limit = %self.config.daily_loss_limit,
            "GLOBAL EMERGENCY STOP: halting all routes"
        );
        self.notifier
            .critical(&format!(
                "Global daily loss {} reached the {} limit. All routes halted; operator restart required.",
                total_loss, self.config.daily_loss_limit
            ))
            .await;

        for entry in self.workers.iter() {
            entry.value().stop().await;
        }
        true
    }

    pub async fn start(self: &Arc<Self>) {
        {
            let mut active = self.active.write().await;
            if *active {
                return;
            }
            *active = true;
        }

        info!(
            enabled = self.config.enabled,
            limit = %self.config.daily_loss_limit,
            "Starting global loss supervisor"
        );

        let supervisor = self.clone();
        tokio::spawn(async move {
            let mut tick = interval(Duration::from_secs(supervisor.config.check_interval_secs));
            tick.tick().await;
            loop {
                tick.tick().await;
                if !*supervisor.active.read().await {
                    break;
                }
                if supervisor.check_once().await && supervisor.is_tripped() {
                    warn!("Supervisor latched; no further checks until restart");
                    break;
                }
            }
            info!("Global loss supervisor stopped");
        });
    }

    pub async fn stop(&self) {
        *self.active.write().await = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use copy_core::notifier::Notifier as CoreNotifier;

    fn empty_workers() -> Arc<DashMap<String, Arc<WorkerHandle>>> {
        Arc::new(DashMap::new())
    }

    #[tokio::test]
    async fn test_disabled_supervisor_never_trips() {
        let supervisor = GlobalLossSupervisor::new(
            empty_workers(),
            EmergencyStopConfig {
                enabled: false,
                daily_loss_limit: Decimal::ZERO,
                check_interval_secs: 60,
            },
            Arc::new(CoreNotifier::disabled()),
        );

        assert!(!supervisor.check_once().await);
        assert!(!supervisor.is_tripped());
    }

    #[tokio::test]
    async fn test_trip_latches() {
        // Zero limit with zero workers: total loss 0 >= 0 trips.
        let supervisor = GlobalLossSupervisor::new(
            empty_workers(),
            EmergencyStopConfig {
                enabled: true,
                daily_loss_limit: Decimal::ZERO,
                check_interval_secs: 60,
            },
            Arc::new(CoreNotifier::disabled()),
        );

        assert!(supervisor.check_once().await);
        assert!(supervisor.is_tripped());
        // Still tripped on the next pass.
        assert!(supervisor.check_once().await);
    }
}
