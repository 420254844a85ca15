//! Per-source-account event source facade.

use copy_core::pool::BrokerPool;
use copy_core::types::{AccountDescriptor, Position};
use copy_core::Result;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::info;

use crate::events::{PositionEvent, DEFAULT_PROFIT_NOISE};
use crate::{polling, streaming};

/// Which pool API feeds the event stream. Subscribers see the same
/// event shape either way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorBackend {
    Polling,
    Streaming,
}

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub backend: MonitorBackend,
    pub poll_interval_ms: u64,
    /// Profit changes below this do not produce `Updated` events.
    pub profit_noise: Decimal,
    pub reconnect_delay_secs: u64,
    pub channel_capacity: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            backend: MonitorBackend::Polling,
            poll_interval_ms: 1_000,
            profit_noise: DEFAULT_PROFIT_NOISE,
            reconnect_delay_secs: 30,
            channel_capacity: 1_024,
        }
    }
}

/// Produces an ordered stream of position lifecycle events for one
/// source account. One consumer per account is sufficient.
pub struct PositionMonitor {
    pool: Arc<dyn BrokerPool>,
    account: AccountDescriptor,
    config: MonitorConfig,
    event_tx: mpsc::Sender<PositionEvent>,
    event_rx: Option<mpsc::Receiver<PositionEvent>>,
    active: Arc<RwLock<bool>>,
}

impl PositionMonitor {
    pub fn new(pool: Arc<dyn BrokerPool>, account: AccountDescriptor, config: MonitorConfig) -> Self {
        let (event_tx, event_rx) = mpsc::channel(config.channel_capacity);
        Self {
            pool,
            account,
            config,
            event_tx,
            event_rx: Some(event_rx),
            active: Arc::new(RwLock::new(false)),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_receiver(&mut self) -> Option<mpsc::Receiver<PositionEvent>> {
        self.event_rx.take()
    }

    /// Start the backend task. `baseline` is the caller's startup
    /// snapshot: positions already in it produce no `Opened` events,
    /// anything diverging from it later does.
    pub async fn start(&self, baseline: Vec<Position>) -> Result<()> {
        {
            let mut active = self.active.write().await;
            if *active {
                return Ok(());
            }
            *active = true;
        }

        let mut tracked: HashMap<String, Position> = HashMap::with_capacity(baseline.len());
        for position in baseline {
            tracked.insert(position.id.clone(), position);
        }

        info!(
            account = %self.account.id,
            backend = ?self.config.backend,
            baseline = tracked.len(),
            "Starting position monitor"
        );

        let pool = self.pool.clone();
        let account = self.account.clone();
        let config = self.config.clone();
        let event_tx = self.event_tx.clone();
        let active = self.active.clone();

        tokio::spawn(async move {
            match config.backend {
                MonitorBackend::Polling => {
                    polling::run(pool, account, config, tracked, event_tx, active).await;
                }
                MonitorBackend::Streaming => {
                    streaming::run(pool, account, config, tracked, event_tx, active).await;
                }
            }
        });

        Ok(())
    }

    pub async fn stop(&self) {
        let mut active = self.active.write().await;
        *active = false;
        info!(account = %self.account.id, "Stopping position monitor");
    }

    pub async fn is_active(&self) -> bool {
        *self.active.read().await
    }
}
