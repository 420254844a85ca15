//! Polling backend: fetch-and-diff on a fixed interval.

use copy_core::pool::BrokerPool;
use copy_core::types::{AccountDescriptor, Position};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio::time::{interval, Duration};
use tracing::{debug, info, warn};

use crate::events::{diff_snapshots, PositionEvent};
use crate::monitor::MonitorConfig;

pub(crate) async fn run(
    pool: Arc<dyn BrokerPool>,
    account: AccountDescriptor,
    config: MonitorConfig,
    mut tracked: HashMap<String, Position>,
    event_tx: mpsc::Sender<PositionEvent>,
    active: Arc<RwLock<bool>>,
) {
    let mut tick = interval(Duration::from_millis(config.poll_interval_ms));

    loop {
        tick.tick().await;

        if !*active.read().await {
            break;
        }

        let fetched = match pool.get_positions(&account.id, &account.region).await {
            Ok(positions) => positions,
            Err(e) => {
                warn!(account = %account.id, error = %e, "Position poll failed");
                continue;
            }
        };

        let events = diff_snapshots(&mut tracked, fetched, config.profit_noise);
        if !events.is_empty() {
            debug!(
                account = %account.id,
                count = events.len(),
                "Emitting position events from poll"
            );
        }

        for event in events {
            if event_tx.send(event).await.is_err() {
                info!(account = %account.id, "Event receiver dropped, stopping poller");
                return;
            }
        }
    }

    info!(account = %account.id, "Position poller stopped");
}
