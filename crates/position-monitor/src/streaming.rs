//! Streaming backend: translate the pool's push frames into position
//! events, with a fixed-cadence reconnect loop.
//!
//! A dropped stream never loses events: after every reconnect the
//! backend refetches the position list and synthesises `Closed` events
//! for ids that vanished and `Opened` events for ids that appeared
//! while the stream was down.

use copy_core::pool::BrokerPool;
use copy_core::types::{AccountDescriptor, CloseInfo, Position};
use futures_util::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio::time::Duration;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::events::{diff_snapshots, materially_changed, PositionEvent};
use crate::monitor::MonitorConfig;

/// Upper bound on remembered close deals for not-yet-removed positions.
const DEAL_CACHE_LIMIT: usize = 256;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamFrame {
    PositionUpdated {
        position: Position,
    },
    PositionRemoved {
        #[serde(rename = "positionId")]
        position_id: String,
        #[serde(default)]
        deal: Option<DealFrame>,
    },
    DealAdded {
        deal: DealFrame,
    },
    PositionsSynchronized {
        positions: Vec<Position>,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DealFrame {
    #[serde(default)]
    position_id: Option<String>,
    #[serde(default)]
    comment: Option<String>,
    #[serde(default)]
    profit: Decimal,
}

impl DealFrame {
    fn close_info(&self) -> CloseInfo {
        match &self.comment {
            Some(comment) => CloseInfo::from_deal(comment, self.profit),
            None => CloseInfo {
                profit: self.profit,
                ..CloseInfo::opaque()
            },
        }
    }
}

pub(crate) async fn run(
    pool: Arc<dyn BrokerPool>,
    account: AccountDescriptor,
    config: MonitorConfig,
    mut tracked: HashMap<String, Position>,
    event_tx: mpsc::Sender<PositionEvent>,
    active: Arc<RwLock<bool>>,
) {
    let mut first_connection = true;

    loop {
        if !*active.read().await {
            break;
        }

        if !first_connection {
            tokio::time::sleep(Duration::from_secs(config.reconnect_delay_secs)).await;
            if !*active.read().await {
                break;
            }
            // Gap repair: anything that changed while the stream was
            // down shows up as a synthetic event from this diff.
            match pool.get_positions(&account.id, &account.region).await {
                Ok(fetched) => {
                    let events = diff_snapshots(&mut tracked, fetched, config.profit_noise);
                    if !events.is_empty() {
                        info!(
                            account = %account.id,
                            count = events.len(),
                            "Synthesised events after stream reconnect"
                        );
                    }
                    for event in events {
                        if event_tx.send(event).await.is_err() {
                            return;
                        }
                    }
                }
                Err(e) => {
                    warn!(account = %account.id, error = %e, "Post-reconnect refetch failed");
                    continue;
                }
            }
        }
        first_connection = false;

        let session = match pool.initialize_streaming(&account.id, &account.region).await {
            Ok(session) => session,
            Err(e) => {
                warn!(account = %account.id, error = %e, "Failed to initialize streaming");
                continue;
            }
        };

        match stream_session(
            &pool,
            &account,
            &config,
            &session.ws_url,
            &mut tracked,
            &event_tx,
            &active,
        )
        .await
        {
            SessionEnd::ReceiverDropped => return,
            SessionEnd::StreamClosed => {
                warn!(account = %account.id, "Stream closed, entering reconnect loop");
            }
        }
    }

    info!(account = %account.id, "Streaming monitor stopped");
}

enum SessionEnd {
    StreamClosed,
    ReceiverDropped,
}

async fn stream_session(
    pool: &Arc<dyn BrokerPool>,
    account: &AccountDescriptor,
    config: &MonitorConfig,
    ws_url: &str,
    tracked: &mut HashMap<String, Position>,
    event_tx: &mpsc::Sender<PositionEvent>,
    active: &Arc<RwLock<bool>>,
) -> SessionEnd {
    let (ws_stream, _) = match connect_async(ws_url).await {
        Ok(conn) => conn,
        Err(e) => {
            warn!(account = %account.id, error = %e, "Streaming connect failed");
            return SessionEnd::StreamClosed;
        }
    };
    info!(account = %account.id, "Streaming connection established");

    let (mut write, mut read) = ws_stream.split();
    let mut recent_deals: HashMap<String, DealFrame> = HashMap::new();
    let mut subscribed_symbols: HashSet<String> = HashSet::new();

    while let Some(msg) = read.next().await {
        if !*active.read().await {
            return SessionEnd::StreamClosed;
        }

        match msg {
            Ok(Message::Text(text)) => {
                let frame: StreamFrame = match serde_json::from_str(&text) {
                    Ok(frame) => frame,
                    Err(e) => {
                        debug!(error = %e, "Skipping unparseable stream frame");
                        continue;
                    }
                };

                let events = translate_frame(
                    frame,
                    tracked,
                    &mut recent_deals,
                    config.profit_noise,
                );

                for event in &events {
                    if let PositionEvent::Opened(position) = event {
                        if subscribed_symbols.insert(position.symbol.clone()) {
                            if let Err(e) = pool
                                .subscribe_symbol(&account.id, &account.region, &position.symbol)
                                .await
                            {
                                debug!(symbol = %position.symbol, error = %e, "Symbol subscribe failed");
                            }
                        }
                    }
                }

                for event in events {
                    if event_tx.send(event).await.is_err() {
                        return SessionEnd::ReceiverDropped;
                    }
                }
            }
            Ok(Message::Ping(data)) => {
                if write.send(Message::Pong(data)).await.is_err() {
                    return SessionEnd::StreamClosed;
                }
            }
            Ok(Message::Close(_)) | Err(_) => return SessionEnd::StreamClosed,
            Ok(_) => {}
        }
    }

    SessionEnd::StreamClosed
}

fn translate_frame(
    frame: StreamFrame,
    tracked: &mut HashMap<String, Position>,
    recent_deals: &mut HashMap<String, DealFrame>,
    profit_noise: Decimal,
) -> Vec<PositionEvent> {
    match frame {
        StreamFrame::PositionUpdated { position } => match tracked.get(&position.id) {
            None => {
                tracked.insert(position.id.clone(), position.clone());
                vec![PositionEvent::Opened(position)]
            }
            Some(previous) => {
                if materially_changed(previous, &position, profit_noise) {
                    let previous = previous.clone();
                    tracked.insert(position.id.clone(), position.clone());
                    vec![PositionEvent::Updated {
                        previous,
                        current: position,
                    }]
                } else {
                    Vec::new()
                }
            }
        },
        StreamFrame::PositionRemoved { position_id, deal } => {
            let Some(position) = tracked.remove(&position_id) else {
                recent_deals.remove(&position_id);
                return Vec::new();
            };
            let close_info = deal
                .or_else(|| recent_deals.remove(&position_id))
                .map(|d| d.close_info())
                .unwrap_or_else(CloseInfo::opaque);
            vec![PositionEvent::Closed {
                position,
                close_info,
            }]
        }
        StreamFrame::DealAdded { deal } => {
            if let Some(position_id) = deal.position_id.clone() {
                if recent_deals.len() >= DEAL_CACHE_LIMIT {
                    recent_deals.clear();
                }
                recent_deals.insert(position_id, deal);
            }
            Vec::new()
        }
        StreamFrame::PositionsSynchronized { positions } => {
            diff_snapshots(tracked, positions, profit_noise)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use copy_core::types::{CloseReason, Side};

    fn position(id: &str, volume: Decimal) -> Position {
        Position {
            id: id.to_string(),
            symbol: "GBPUSD".to_string(),
            side: Side::Sell,
            volume,
            open_price: Decimal::new(12500, 4),
            current_price: Decimal::new(12490, 4),
            stop_loss: None,
            take_profit: None,
            profit: Decimal::ZERO,
            open_time: Utc::now(),
            update_time: Utc::now(),
            comment: None,
        }
    }

    #[test]
    fn test_position_updated_for_unknown_id_is_opened() {
        let mut tracked = HashMap::new();
        let mut deals = HashMap::new();

        let events = translate_frame(
            StreamFrame::PositionUpdated {
                position: position("5", Decimal::new(20, 2)),
            },
            &mut tracked,
            &mut deals,
            Decimal::ONE,
        );

        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], PositionEvent::Opened(p) if p.id == "5"));
    }

    #[test]
    fn test_position_removed_uses_latest_deal_for_close_info() {
        let mut tracked = HashMap::new();
        tracked.insert("5".to_string(), position("5", Decimal::new(20, 2)));
        let mut deals = HashMap::new();

        translate_frame(
            StreamFrame::DealAdded {
                deal: DealFrame {
                    position_id: Some("5".to_string()),
                    comment: Some("[tp]".to_string()),
                    profit: Decimal::new(120, 0),
                },
            },
            &mut tracked,
            &mut deals,
            Decimal::ONE,
        );

        let events = translate_frame(
            StreamFrame::PositionRemoved {
                position_id: "5".to_string(),
                deal: None,
            },
            &mut tracked,
            &mut deals,
            Decimal::ONE,
        );

        assert_eq!(events.len(), 1);
        match &events[0] {
            PositionEvent::Closed { close_info, .. } => {
                assert_eq!(close_info.reason, CloseReason::TakeProfit);
                assert_eq!(close_info.profit, Decimal::new(120, 0));
            }
            other => panic!("expected Closed, got {other:?}"),
        }
    }

    #[test]
    fn test_position_removed_without_deal_is_opaque() {
        let mut tracked = HashMap::new();
        tracked.insert("5".to_string(), position("5", Decimal::new(20, 2)));
        let mut deals = HashMap::new();

        let events = translate_frame(
            StreamFrame::PositionRemoved {
                position_id: "5".to_string(),
                deal: None,
            },
            &mut tracked,
            &mut deals,
            Decimal::ONE,
        );

        match &events[0] {
            PositionEvent::Closed { close_info, .. } => {
                assert_eq!(close_info.reason, CloseReason::Closed);
                assert_eq!(close_info.profit, Decimal::ZERO);
            }
            other => panic!("expected Closed, got {other:?}"),
        }
    }

    #[test]
    fn test_synchronized_frame_diffs_against_tracked() {
        let mut tracked = HashMap::new();
        tracked.insert("1".to_string(), position("1", Decimal::new(20, 2)));
        let mut deals = HashMap::new();

        // "1" is gone, "2" is new.
        let events = translate_frame(
            StreamFrame::PositionsSynchronized {
                positions: vec![position("2", Decimal::new(10, 2))],
            },
            &mut tracked,
            &mut deals,
            Decimal::ONE,
        );

        assert_eq!(events.len(), 2);
        assert!(events
            .iter()
            .any(|e| matches!(e, PositionEvent::Opened(p) if p.id == "2")));
        assert!(events
            .iter()
            .any(|e| matches!(e, PositionEvent::Closed { position, .. } if position.id == "1")));
    }
}
