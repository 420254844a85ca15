//! Per-route copy worker: mirrors source opens and exits onto the
//! destination account with at-most-once semantics.
//!
//! Event handling within a worker is single-threaded: events arrive in
//! order from the position monitor and each handler runs to completion
//! before the next one starts. Crash-safe dedup rides on the
//! correlation comment written into every destination trade.

use chrono::{DateTime, Utc};
use copy_core::notifier::Notifier;
use copy_core::pool::{
    correlation_comment, correlation_prefix, BrokerPool, ExecuteRequest,
};
use copy_core::store::StateStore;
use copy_core::types::{
    pip_size, BrokerLimits, CloseInfo, PendingExit, Position, PositionMapping, Route,
    RouteContext, RuleSet, Side, WorkerStats,
};
use copy_core::Error;
use position_monitor::{MonitorConfig, PositionMonitor};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration};
use tracing::{debug, error, info, warn};

use crate::filters::{FilterInput, FilterParams, FilterPipeline};
use crate::sizing::{compute_volume, snap_to_step};
use crate::state::RouteState;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Pending-exit retry cadence.
    pub retry_interval_secs: u64,
    /// Event backlog depth that triggers a lag warning.
    pub queue_high_water: usize,
    pub broker_limits: BrokerLimits,
    pub monitor: MonitorConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            retry_interval_secs: 60,
            queue_high_water: 256,
            broker_limits: BrokerLimits::default(),
            monitor: MonitorConfig::default(),
        }
    }
}

/// Handle the router keeps per running worker. Stats reads are
/// lock-free from the worker's perspective: the worker publishes
/// snapshots, readers clone them.
pub struct WorkerHandle {
    route_id: String,
    stats: Arc<RwLock<WorkerStats>>,
    shutdown_tx: watch::Sender<bool>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerHandle {
    pub fn route_id(&self) -> &str {
        &self.route_id
    }

    pub async fn stats(&self) -> WorkerStats {
        self.stats.read().await.clone()
    }

    /// Ask the worker to drain its current handler and exit.
    pub fn signal_stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Signal and wait for the worker task to finish.
    pub async fn stop(&self) {
        self.signal_stop();
        if let Some(join) = self.join.lock().await.take() {
            let _ = join.await;
        }
    }
}

/// The per-route mirroring state machine.
pub struct CopyWorker {
    route: Route,
    rule: RuleSet,
    ctx: RouteContext,
    pool: Arc<dyn BrokerPool>,
    store: Arc<dyn StateStore>,
    notifier: Arc<Notifier>,
    pipeline: FilterPipeline,
    config: WorkerConfig,
    state: RouteState,
    stats: Arc<RwLock<WorkerStats>>,
    open_mappings: usize,
    wins: u32,
    losses: u32,
    gross_profit: Decimal,
    gross_loss: Decimal,
    consecutive_losses: u32,
    last_trade_at: Option<DateTime<Utc>>,
    last_slippage_pips: Option<Decimal>,
    /// Source closes we could not act on while the store was down.
    offline_closes: Vec<(String, CloseInfo)>,
}

impl CopyWorker {
    fn new(
        route: Route,
        rule: RuleSet,
        filter_definitions: &HashMap<String, FilterParams>,
        pool: Arc<dyn BrokerPool>,
        store: Arc<dyn StateStore>,
        notifier: Arc<Notifier>,
        config: WorkerConfig,
        stats: Arc<RwLock<WorkerStats>>,
    ) -> Self {
        let pipeline = FilterPipeline::new(&rule.filters, filter_definitions);
        let ctx = RouteContext::for_route(&route);
        let now = Utc::now();
        Self {
            route,
            rule,
            ctx,
            pool,
            store,
            notifier,
            pipeline,
            config,
            state: RouteState::new(now),
            stats,
            open_mappings: 0,
            wins: 0,
            losses: 0,
            gross_profit: Decimal::ZERO,
            gross_loss: Decimal::ZERO,
            consecutive_losses: 0,
            last_trade_at: None,
            last_slippage_pips: None,
            offline_closes: Vec::new(),
        }
    }

    /// Spawn the worker task for an enabled route.
    pub fn spawn(
        route: Route,
        rule: RuleSet,
        filter_definitions: &HashMap<String, FilterParams>,
        pool: Arc<dyn BrokerPool>,
        store: Arc<dyn StateStore>,
        notifier: Arc<Notifier>,
        config: WorkerConfig,
    ) -> Arc<WorkerHandle> {
        let route_id = route.id.clone();
        let stats = Arc::new(RwLock::new(WorkerStats::new(&route_id, Utc::now())));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let worker = CopyWorker::new(
            route,
            rule,
            filter_definitions,
            pool,
            store,
            notifier,
            config,
            stats.clone(),
        );

        let join = tokio::spawn(async move {
            worker.run(shutdown_rx).await;
        });

        Arc::new(WorkerHandle {
            route_id,
            stats,
            shutdown_tx,
            join: Mutex::new(Some(join)),
        })
    }

    async fn run(mut self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            route_id = %self.route.id,
            source = %self.route.source.nickname,
            destination = %self.route.destination.nickname,
            rule = %self.rule.name,
            "Starting copy worker"
        );

        let baseline = match self.startup().await {
            Ok(baseline) => baseline,
            Err(e) => {
                error!(route_id = %self.route.id, error = %e, "Worker startup failed");
                self.publish_stats(false).await;
                return;
            }
        };

        let mut monitor = PositionMonitor::new(
            self.pool.clone(),
            self.route.source.clone(),
            self.config.monitor.clone(),
        );
        let Some(mut events) = monitor.take_event_receiver() else {
            error!(route_id = %self.route.id, "Monitor receiver already taken");
            self.publish_stats(false).await;
            return;
        };
        if let Err(e) = monitor.start(baseline).await {
            error!(route_id = %self.route.id, error = %e, "Failed to start position monitor");
            self.publish_stats(false).await;
            return;
        }

        let mut retry_tick = interval(Duration::from_secs(self.config.retry_interval_secs));
        retry_tick.tick().await; // skip the immediate tick

        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
                maybe_event = events.recv() => {
                    match maybe_event {
                        Some(event) => {
                            let backlog = events.len();
                            if backlog > self.config.queue_high_water {
                                warn!(
                                    route_id = %self.route.id,
                                    backlog,
                                    "Event queue depth above high-water mark"
                                );
                            }
                            self.handle_event(event).await;
                        }
                        None => {
                            warn!(route_id = %self.route.id, "Event stream ended");
                            break;
                        }
                    }
                }
                _ = retry_tick.tick() => {
                    self.retry_pending_exits().await;
                    self.publish_stats(true).await;
                }
            }
        }

        monitor.stop().await;
        self.publish_stats(false).await;
        info!(route_id = %self.route.id, "Copy worker stopped");
    }

    /// Seed route state from the source account and restore the open
    /// mapping count from the store.
    async fn startup(&mut self) -> copy_core::Result<Vec<Position>> {
        let (src, src_region) = (
            self.route.source.id.clone(),
            self.route.source.region.clone(),
        );
        let baseline = self.pool.get_positions(&src, &src_region).await?;

        match self.pool.get_account_info(&src, &src_region).await {
            Ok(info) => info!(
                route_id = %self.route.id,
                balance = %info.balance,
                equity = %info.equity,
                "Source account snapshot"
            ),
            Err(e) => warn!(route_id = %self.route.id, error = %e, "Account info unavailable"),
        }

        for position in &baseline {
            self.state.track_source_position(position.clone());
            if !self.route.copy_existing_positions {
                // Pre-existing positions are never retroactively copied.
                self.state.processed_trade_ids.insert(position.id.clone());
            }
        }

        match self.store.list_mappings(&src).await {
            Ok(mappings) => {
                self.open_mappings = mappings
                    .iter()
                    .filter(|m| m.dest_account_id == self.route.destination.id)
                    .count();
            }
            Err(e) => warn!(route_id = %self.route.id, error = %e, "Could not restore mapping count"),
        }

        if self.route.copy_existing_positions {
            info!(
                route_id = %self.route.id,
                count = baseline.len(),
                "Copying pre-existing source positions"
            );
            for position in baseline.clone() {
                self.handle_opened(position).await;
            }
        }

        self.publish_stats(true).await;
        Ok(baseline)
    }

    async fn handle_event(&mut self, event: position_monitor::PositionEvent) {
        use position_monitor::PositionEvent::*;
        match event {
            Opened(position) => self.handle_opened(position).await,
            Updated { previous, current } => self.handle_updated(previous, current).await,
            Closed {
                position,
                close_info,
            } => self.handle_closed(position, close_info).await,
        }
        self.publish_stats(true).await;
    }

    async fn handle_opened(&mut self, position: Position) {
        let now = Utc::now();
        self.state.track_source_position(position.clone());

        if self.state.processed_trade_ids.contains(&position.id) {
            debug!(route_id = %self.route.id, position_id = %position.id, "Already processed");
            return;
        }

        // Day-roll must land before any filter sees the event.
        self.state.rotate_daily_stats_if_needed(now);

        if self.state.daily_stats.daily_loss >= self.rule.max_daily_loss {
            warn!(
                route_id = %self.route.id,
                daily_loss = %self.state.daily_stats.daily_loss,
                "Daily loss limit reached, not copying"
            );
            self.state.processed_trade_ids.insert(position.id.clone());
            return;
        }

        let input = FilterInput {
            candidate: &position,
            state: &self.state,
            rule: &self.rule,
            now,
        };
        let decision = self.pipeline.evaluate(&input);
        if !decision.accepted {
            let trace = self.pipeline.evaluate_traced(&input);
            info!(
                route_id = %self.route.id,
                position_id = %position.id,
                rejections = ?trace.rejections,
                "Copy rejected by filters"
            );
            self.notifier
                .filter_rejection(&self.ctx, &position, &trace.rejections)
                .await;
            return;
        }

        if self.open_mappings >= self.rule.max_open_positions {
            info!(
                route_id = %self.route.id,
                open = self.open_mappings,
                "Destination position cap reached"
            );
            self.notifier
                .filter_rejection(
                    &self.ctx,
                    &position,
                    &[(
                        "max-open-positions".to_string(),
                        format!("{} mapped positions open", self.open_mappings),
                    )],
                )
                .await;
            return;
        }

        // A store we cannot read might hold a live mapping for this id;
        // skipping is safer than double-copying.
        match self
            .store
            .get_mapping(&self.route.source.id, &position.id)
            .await
        {
            Ok(Some(_)) => {
                debug!(route_id = %self.route.id, position_id = %position.id, "Mapping already exists");
                self.state.processed_trade_ids.insert(position.id.clone());
                return;
            }
            Ok(None) => {}
            Err(e) => {
                warn!(
                    route_id = %self.route.id,
                    position_id = %position.id,
                    error = %e,
                    "Store unreadable, skipping copy"
                );
                return;
            }
        }

        // Crash recovery: a destination position may already carry this
        // source id in its correlation comment.
        let (dst, dst_region) = (
            self.route.destination.id.clone(),
            self.route.destination.region.clone(),
        );
        let dest_positions = match self.pool.get_positions(&dst, &dst_region).await {
            Ok(positions) => positions,
            Err(e) => {
                warn!(route_id = %self.route.id, error = %e, "Destination list unavailable, skipping copy");
                self.notifier
                    .copy_failure(&self.ctx, &position, &e.to_string())
                    .await;
                return;
            }
        };

        let prefix = correlation_prefix(&position.id);
        if dest_positions
            .iter()
            .any(|p| p.comment.as_deref().is_some_and(|c| c.contains(&prefix)))
        {
            info!(
                route_id = %self.route.id,
                position_id = %position.id,
                "Duplicate copy detected via correlation comment"
            );
            self.state.processed_trade_ids.insert(position.id.clone());
            self.notifier
                .copy_failure(&self.ctx, &position, "duplicate")
                .await;
            return;
        }

        let dest_volume = compute_volume(
            position.volume,
            &self.rule,
            self.state.daily_stats.daily_loss,
            &self.config.broker_limits,
        );
        if dest_volume.is_zero() {
            self.notifier
                .filter_rejection(
                    &self.ctx,
                    &position,
                    &[("sizing".to_string(), "invalid-size".to_string())],
                )
                .await;
            return;
        }

        let (stop_loss, take_profit) = entry_stops(
            &position,
            self.route.stop_loss_buffer_pips,
            self.route.take_profit_buffer_pips,
        );
        let request = ExecuteRequest {
            symbol: position.symbol.clone(),
            side: position.side,
            volume: dest_volume,
            stop_loss,
            take_profit,
            comment: correlation_comment(&position.id, position.volume),
        };

        match self.pool.execute_trade(&dst, &dst_region, &request).await {
            Ok(result) if result.success => {
                // Some platforms omit the fill price from the execute
                // response; fall back to the live quote for slippage.
                let dest_open_price = match result.open_price {
                    Some(price) => price,
                    None => match self.pool.get_price(&position.symbol).await {
                        Ok(quote) => match position.side {
                            Side::Buy => quote.ask,
                            Side::Sell => quote.bid,
                        },
                        Err(_) => position.open_price,
                    },
                };
                let order_id = result.order_id.unwrap_or_default();
                let mapping = PositionMapping {
                    source_account_id: self.route.source.id.clone(),
                    source_position_id: position.id.clone(),
                    dest_account_id: dst.clone(),
                    dest_position_id: order_id.clone(),
                    symbol: position.symbol.clone(),
                    source_volume: position.volume,
                    dest_volume,
                    opened_at: now,
                    source_open_price: position.open_price,
                    dest_open_price,
                };
                if let Err(e) = self.store.put_mapping(&mapping).await {
                    // The correlation comment still guards dedup; the
                    // exit path will treat this as an orphan.
                    error!(route_id = %self.route.id, error = %e, "Failed to persist mapping");
                }

                self.state.processed_trade_ids.insert(position.id.clone());
                self.state.record_trade(now);
                self.open_mappings += 1;
                self.last_trade_at = Some(now);
                self.last_slippage_pips = Some(
                    (dest_open_price - position.open_price).abs() / pip_size(&position.symbol),
                );

                info!(
                    route_id = %self.route.id,
                    position_id = %position.id,
                    dest_order = %order_id,
                    volume = %dest_volume,
                    "Copy executed"
                );
                self.notifier
                    .copy_success(&self.ctx, &position, dest_volume, &order_id)
                    .await;
            }
            Ok(result) => {
                let reason = result.error.unwrap_or_else(|| "rejected by pool".to_string());
                warn!(
                    route_id = %self.route.id,
                    position_id = %position.id,
                    reason = %reason,
                    "Copy rejected"
                );
                // Business rejection: mark processed so one bad trade
                // cannot loop.
                self.state.processed_trade_ids.insert(position.id.clone());
                self.notifier
                    .copy_failure(&self.ctx, &position, &reason)
                    .await;
            }
            Err(e) => {
                warn!(
                    route_id = %self.route.id,
                    position_id = %position.id,
                    error = %e,
                    "Trade execution error"
                );
                if let Error::PoolPermanent { .. } = e {
                    self.state.processed_trade_ids.insert(position.id.clone());
                }
                // Transient errors are never retried here; the
                // correlation-comment scan protects the next attempt.
                self.notifier
                    .copy_failure(&self.ctx, &position, &e.to_string())
                    .await;
            }
        }
    }

    async fn handle_updated(&mut self, previous: Position, current: Position) {
        self.state.track_source_position(current.clone());

        let mapping = match self
            .store
            .get_mapping(&self.route.source.id, &current.id)
            .await
        {
            Ok(Some(mapping)) => mapping,
            Ok(None) => return,
            Err(e) => {
                debug!(route_id = %self.route.id, error = %e, "Store unreadable during update");
                return;
            }
        };

        let had_partial_close = previous.volume > current.volume;
        if had_partial_close {
            self.mirror_partial_close(&previous, &current, mapping.clone())
                .await;
        }

        if previous.stop_loss != current.stop_loss || previous.take_profit != current.take_profit {
            let (stop_loss, take_profit) = modify_stops(
                &current,
                self.route.stop_loss_buffer_pips,
                self.route.take_profit_buffer_pips,
            );
            match self
                .pool
                .modify_position(
                    &self.route.destination.id,
                    &self.route.destination.region,
                    &mapping.dest_position_id,
                    stop_loss,
                    take_profit,
                )
                .await
            {
                Ok(true) => {
                    debug!(
                        route_id = %self.route.id,
                        position_id = %current.id,
                        "Propagated SL/TP change"
                    );
                    // Rewrite the mapping to extend its TTL alongside
                    // the touched position. A partial close already
                    // rewrote it with fresh volumes.
                    if !had_partial_close {
                        if let Err(e) = self.store.put_mapping(&mapping).await {
                            debug!(route_id = %self.route.id, error = %e, "Mapping TTL refresh failed");
                        }
                    }
                }
                Ok(false) => warn!(
                    route_id = %self.route.id,
                    position_id = %current.id,
                    "Destination refused SL/TP modify"
                ),
                Err(e) => warn!(
                    route_id = %self.route.id,
                    position_id = %current.id,
                    error = %e,
                    "SL/TP modify failed"
                ),
            }
        }
    }

    /// Scale the destination down proportionally to a source partial
    /// close, once the reduction clears one lot step.
    async fn mirror_partial_close(
        &mut self,
        previous: &Position,
        current: &Position,
        mut mapping: PositionMapping,
    ) {
        let step = self.config.broker_limits.lot_step;
        let ratio = current.volume / previous.volume;
        let target = snap_to_step(mapping.dest_volume * ratio, step);
        let reduction = mapping.dest_volume - target;
        if reduction < step {
            return;
        }

        let (dst, dst_region) = (
            self.route.destination.id.clone(),
            self.route.destination.region.clone(),
        );

        if target < self.config.broker_limits.min_lot {
            // A residual below the broker minimum could never be
            // closed later; clip to a full close.
            info!(
                route_id = %self.route.id,
                position_id = %current.id,
                "Partial close would leave sub-minimum residual, closing fully"
            );
            self.close_destination(mapping, CloseInfo::opaque(), true)
                .await;
            return;
        }

        match self
            .pool
            .close_position_partial(&dst, &dst_region, &mapping.dest_position_id, reduction)
            .await
        {
            Ok(result) if result.success => {
                mapping.source_volume = current.volume;
                mapping.dest_volume = target;
                if let Err(e) = self.store.put_mapping(&mapping).await {
                    warn!(route_id = %self.route.id, error = %e, "Failed to persist partial close");
                }
                info!(
                    route_id = %self.route.id,
                    position_id = %current.id,
                    reduced_by = %reduction,
                    remaining = %target,
                    "Mirrored partial close"
                );
            }
            Ok(result) => warn!(
                route_id = %self.route.id,
                position_id = %current.id,
                error = ?result.error,
                "Partial close rejected"
            ),
            Err(e) => warn!(
                route_id = %self.route.id,
                position_id = %current.id,
                error = %e,
                "Partial close failed"
            ),
        }
    }

    async fn handle_closed(&mut self, position: Position, close_info: CloseInfo) {
        let now = Utc::now();
        self.state.rotate_daily_stats_if_needed(now);
        self.state.untrack_source_position(&position.id);

        let source_id = self.route.source.id.clone();
        let mapping = match self.store.get_mapping(&source_id, &position.id).await {
            Ok(Some(mapping)) => mapping,
            Ok(None) => {
                // Replayed close (post-reconnect synthesis) or a
                // position we never copied.
                match self.store.was_recently_closed(&source_id, &position.id).await {
                    Ok(true) => return,
                    Ok(false) => {}
                    Err(_) => return,
                }
                let notified = self
                    .store
                    .was_orphan_notified(&source_id, &position.id)
                    .await
                    .unwrap_or(true);
                if !notified {
                    self.notifier
                        .orphan_close(&self.ctx, &source_id, &position.id)
                        .await;
                    if let Err(e) = self
                        .store
                        .mark_orphan_notified(&source_id, &position.id)
                        .await
                    {
                        debug!(route_id = %self.route.id, error = %e, "Orphan marker write failed");
                    }
                }
                return;
            }
            Err(e) => {
                // Store is down: remember the close in memory and retry
                // on the next tick. Never drop a Closed event.
                warn!(
                    route_id = %self.route.id,
                    position_id = %position.id,
                    error = %e,
                    "Store unavailable, queueing exit in memory"
                );
                self.offline_closes.push((position.id.clone(), close_info));
                return;
            }
        };

        self.close_destination(mapping, close_info, true).await;
    }

    /// Close the destination side of a mapping. `queue_on_failure`
    /// controls whether a failed close lands in the pending-exit queue
    /// (first attempt) or stays there (retry attempt).
    async fn close_destination(
        &mut self,
        mapping: PositionMapping,
        close_info: CloseInfo,
        queue_on_failure: bool,
    ) {
        let (dst, dst_region) = (
            self.route.destination.id.clone(),
            self.route.destination.region.clone(),
        );

        // The destination list is authoritative; the position may have
        // hit its own TP/SL or been closed manually already.
        let dest_positions = match self.pool.get_positions(&dst, &dst_region).await {
            Ok(positions) => positions,
            Err(e) => {
                warn!(route_id = %self.route.id, error = %e, "Destination list unavailable for exit");
                if queue_on_failure {
                    self.queue_exit(mapping, &e.to_string()).await;
                }
                return;
            }
        };

        let still_open = dest_positions
            .iter()
            .any(|p| p.id == mapping.dest_position_id);
        if !still_open {
            debug!(
                route_id = %self.route.id,
                dest_position = %mapping.dest_position_id,
                "Destination already flat, cleaning up mapping"
            );
            self.finish_exit(&mapping, None).await;
            return;
        }

        match self
            .pool
            .close_position(&dst, &dst_region, &mapping.dest_position_id)
            .await
        {
            Ok(result) if result.success => {
                let profit = result.profit;
                self.finish_exit(&mapping, profit).await;
                self.record_close_result(profit.unwrap_or(close_info.profit));
                info!(
                    route_id = %self.route.id,
                    dest_position = %mapping.dest_position_id,
                    profit = ?profit,
                    "Exit copied"
                );
                self.notifier
                    .exit_copied(&self.ctx, &mapping, &close_info, profit)
                    .await;
            }
            Ok(result) => {
                let reason = result.error.unwrap_or_else(|| "close rejected".to_string());
                if queue_on_failure {
                    self.queue_exit(mapping, &reason).await;
                }
            }
            Err(e) => {
                if queue_on_failure {
                    self.queue_exit(mapping, &e.to_string()).await;
                }
            }
        }
    }

    /// Record markers and drop the mapping once the destination is flat.
    async fn finish_exit(&mut self, mapping: &PositionMapping, _dest_profit: Option<Decimal>) {
        if let Err(e) = self
            .store
            .mark_closed(&mapping.dest_account_id, &mapping.dest_position_id)
            .await
        {
            warn!(route_id = %self.route.id, error = %e, "Closed marker write failed");
        }
        // Source-side marker makes replayed Closed events no-ops.
        if let Err(e) = self
            .store
            .mark_closed(&mapping.source_account_id, &mapping.source_position_id)
            .await
        {
            warn!(route_id = %self.route.id, error = %e, "Source closed marker write failed");
        }
        if let Err(e) = self
            .store
            .delete_mapping(&mapping.source_account_id, &mapping.source_position_id)
            .await
        {
            warn!(route_id = %self.route.id, error = %e, "Mapping delete failed");
        }
        if let Err(e) = self
            .store
            .remove_pending_exit(&mapping.source_account_id, &mapping.source_position_id)
            .await
        {
            debug!(route_id = %self.route.id, error = %e, "Pending exit cleanup failed");
        }
        self.open_mappings = self.open_mappings.saturating_sub(1);
    }

    async fn queue_exit(&mut self, mapping: PositionMapping, reason: &str) {
        warn!(
            route_id = %self.route.id,
            dest_position = %mapping.dest_position_id,
            reason = %reason,
            "Queueing pending exit"
        );
        let exit = PendingExit::new(mapping.clone());
        if let Err(e) = self.store.queue_pending_exit(&exit).await {
            warn!(route_id = %self.route.id, error = %e, "Pending exit unpersistable, keeping in memory");
            self.offline_closes
                .push((mapping.source_position_id.clone(), CloseInfo::opaque()));
        }
        self.notifier
            .exit_failure(&self.ctx, &mapping, reason)
            .await;
    }

    fn record_close_result(&mut self, profit: Decimal) {
        self.state.daily_stats.record_result(profit);
        if profit >= Decimal::ZERO {
            self.wins += 1;
            self.gross_profit += profit;
            self.consecutive_losses = 0;
        } else {
            self.losses += 1;
            self.gross_loss += -profit;
            self.consecutive_losses += 1;
        }
    }

    /// Retry loop body: first replay closes held in memory through a
    /// store outage, then work the persisted pending-exit queue.
    async fn retry_pending_exits(&mut self) {
        let source_id = self.route.source.id.clone();

        let offline = std::mem::take(&mut self.offline_closes);
        for (position_id, close_info) in offline {
            match self.store.get_mapping(&source_id, &position_id).await {
                Ok(Some(mapping)) => {
                    self.close_destination(mapping, close_info, true).await;
                }
                Ok(None) => {
                    debug!(
                        route_id = %self.route.id,
                        position_id = %position_id,
                        "Offline close had no mapping after store recovery"
                    );
                }
                Err(_) => {
                    // Still down; keep it for the next tick.
                    self.offline_closes.push((position_id, close_info));
                }
            }
        }

        let exits = match self.store.list_pending_exits(&source_id).await {
            Ok(exits) => exits,
            Err(e) => {
                debug!(route_id = %self.route.id, error = %e, "Pending exit listing failed");
                return;
            }
        };

        for exit in exits {
            debug!(
                route_id = %self.route.id,
                dest_position = %exit.mapping.dest_position_id,
                retry = exit.retry_count,
                "Retrying pending exit"
            );
            self.close_destination(exit.mapping, CloseInfo::opaque(), false)
                .await;
        }
    }

    async fn publish_stats(&self, running: bool) {
        let mut stats = self.stats.write().await;
        stats.daily = self.state.daily_stats.clone();
        stats.daily_loss_limit = self.rule.max_daily_loss;
        stats.open_mappings = self.open_mappings;
        stats.wins = self.wins;
        stats.losses = self.losses;
        stats.gross_profit = self.gross_profit;
        stats.gross_loss = self.gross_loss;
        stats.consecutive_losses = self.consecutive_losses;
        stats.last_trade_at = self.last_trade_at;
        stats.last_slippage_pips = self.last_slippage_pips;
        stats.heartbeat = Utc::now();
        stats.running = running;
    }
}

/// Default protective distances, in pips, for sources that carry no
/// SL/TP of their own.
fn default_distances(symbol: &str) -> (Decimal, Decimal) {
    if symbol.to_uppercase().contains("XAU") {
        (Decimal::new(50, 0), Decimal::new(100, 0))
    } else {
        (Decimal::new(40, 0), Decimal::new(80, 0))
    }
}

/// SL/TP for a fresh destination open: source levels loosened by the
/// route buffers, or symbol-default distances from the open price.
pub(crate) fn entry_stops(
    position: &Position,
    sl_buffer_pips: Decimal,
    tp_buffer_pips: Decimal,
) -> (Option<Decimal>, Option<Decimal>) {
    let pip = pip_size(&position.symbol);
    let (default_sl_pips, default_tp_pips) = default_distances(&position.symbol);

    let stop_loss = match position.stop_loss {
        Some(sl) => Some(loosen_stop_loss(sl, position.side, sl_buffer_pips * pip)),
        None => Some(match position.side {
            Side::Buy => position.open_price - default_sl_pips * pip,
            Side::Sell => position.open_price + default_sl_pips * pip,
        }),
    };
    let take_profit = match position.take_profit {
        Some(tp) => Some(loosen_take_profit(tp, position.side, tp_buffer_pips * pip)),
        None => Some(match position.side {
            Side::Buy => position.open_price + default_tp_pips * pip,
            Side::Sell => position.open_price - default_tp_pips * pip,
        }),
    };
    (stop_loss, take_profit)
}

/// SL/TP for a modify: buffered where present, absent values pass
/// through so a cleared source stop clears the mirror too.
pub(crate) fn modify_stops(
    position: &Position,
    sl_buffer_pips: Decimal,
    tp_buffer_pips: Decimal,
) -> (Option<Decimal>, Option<Decimal>) {
    let pip = pip_size(&position.symbol);
    (
        position
            .stop_loss
            .map(|sl| loosen_stop_loss(sl, position.side, sl_buffer_pips * pip)),
        position
            .take_profit
            .map(|tp| loosen_take_profit(tp, position.side, tp_buffer_pips * pip)),
    )
}

fn loosen_stop_loss(stop_loss: Decimal, side: Side, delta: Decimal) -> Decimal {
    match side {
        Side::Buy => stop_loss - delta,
        Side::Sell => stop_loss + delta,
    }
}

fn loosen_take_profit(take_profit: Decimal, side: Side, delta: Decimal) -> Decimal {
    match side {
        Side::Buy => take_profit + delta,
        Side::Sell => take_profit - delta,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_stops_loosen_for_buy() {
        let position = Position {
            id: "1".to_string(),
            symbol: "EURUSD".to_string(),
            side: Side::Buy,
            volume: Decimal::new(10, 2),
            open_price: Decimal::new(11000, 4),
            current_price: Decimal::new(11000, 4),
            stop_loss: Some(Decimal::new(10950, 4)),
            take_profit: Some(Decimal::new(11100, 4)),
            profit: Decimal::ZERO,
            open_time: Utc::now(),
            update_time: Utc::now(),
            comment: None,
        };

        // 5-pip buffers on a 0.0001-pip symbol.
        let (sl, tp) = entry_stops(&position, Decimal::new(5, 0), Decimal::new(5, 0));
        assert_eq!(sl, Some(Decimal::new(10945, 4)));
        assert_eq!(tp, Some(Decimal::new(11105, 4)));
    }

    #[test]
    fn test_entry_stops_mirror_for_sell() {
        let position = Position {
            id: "1".to_string(),
            symbol: "EURUSD".to_string(),
            side: Side::Sell,
            volume: Decimal::new(10, 2),
            open_price: Decimal::new(11000, 4),
            current_price: Decimal::new(11000, 4),
            stop_loss: Some(Decimal::new(11050, 4)),
            take_profit: Some(Decimal::new(10900, 4)),
            profit: Decimal::ZERO,
            open_time: Utc::now(),
            update_time: Utc::now(),
            comment: None,
        };

        let (sl, tp) = entry_stops(&position, Decimal::new(5, 0), Decimal::new(5, 0));
        assert_eq!(sl, Some(Decimal::new(11055, 4)));
        assert_eq!(tp, Some(Decimal::new(10895, 4)));
    }

    #[test]
    fn test_entry_stops_default_distances_for_gold() {
        let position = Position {
            id: "1".to_string(),
            symbol: "XAUUSD".to_string(),
            side: Side::Buy,
            volume: Decimal::new(10, 2),
            open_price: Decimal::new(24000, 1), // 2400.0
            current_price: Decimal::new(24000, 1),
            stop_loss: None,
            take_profit: None,
            profit: Decimal::ZERO,
            open_time: Utc::now(),
            update_time: Utc::now(),
            comment: None,
        };

        let (sl, tp) = entry_stops(&position, Decimal::ZERO, Decimal::ZERO);
        // 50 pips at 0.1/pip = 5.0; 100 pips = 10.0.
        assert_eq!(sl, Some(Decimal::new(23950, 1)));
        assert_eq!(tp, Some(Decimal::new(24100, 1)));
    }

    #[test]
    fn test_modify_stops_pass_cleared_levels_through() {
        let position = Position {
            id: "1".to_string(),
            symbol: "EURUSD".to_string(),
            side: Side::Buy,
            volume: Decimal::new(10, 2),
            open_price: Decimal::new(11000, 4),
            current_price: Decimal::new(11000, 4),
            stop_loss: None,
            take_profit: Some(Decimal::new(11100, 4)),
            profit: Decimal::ZERO,
            open_time: Utc::now(),
            update_time: Utc::now(),
            comment: None,
        };

        let (sl, tp) = modify_stops(&position, Decimal::new(5, 0), Decimal::new(5, 0));
        assert_eq!(sl, None);
        assert_eq!(tp, Some(Decimal::new(11105, 4)));
    }
}
