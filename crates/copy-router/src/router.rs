//! Router: owns the lifecycle of every copy worker plus the global
//! supervisor and performance monitor.

use chrono::{DateTime, Utc};
use copy_core::notifier::Notifier;
use copy_core::pool::BrokerPool;
use copy_core::store::StateStore;
use copy_core::{Error, Result};
use copy_engine::{CopyWorker, WorkerConfig, WorkerHandle};
use dashmap::DashMap;
use risk_monitor::{GlobalLossSupervisor, PerfMonitor};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::config::{RouteConfig, RoutingConfig};

/// Shared collaborators every worker receives. Explicit dependencies,
/// no process-wide singletons; tests substitute fakes.
#[derive(Clone)]
pub struct RouterDeps {
    pub pool: Arc<dyn BrokerPool>,
    pub store: Arc<dyn StateStore>,
    pub notifier: Arc<Notifier>,
}

pub struct AdvancedRouter {
    deps: RouterDeps,
    config: RwLock<RoutingConfig>,
    config_path: PathBuf,
    worker_config: WorkerConfig,
    workers: Arc<DashMap<String, Arc<WorkerHandle>>>,
    supervisor: RwLock<Option<Arc<GlobalLossSupervisor>>>,
    perf: RwLock<Option<Arc<PerfMonitor>>>,
    start_time: RwLock<Option<DateTime<Utc>>>,
}

impl AdvancedRouter {
    pub fn new(
        config: RoutingConfig,
        config_path: PathBuf,
        deps: RouterDeps,
        worker_config: WorkerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            deps,
            config: RwLock::new(config),
            config_path,
            worker_config,
            workers: Arc::new(DashMap::new()),
            supervisor: RwLock::new(None),
            perf: RwLock::new(None),
            start_time: RwLock::new(None),
        })
    }

    /// Validate the config, spawn one worker per enabled route, and
    /// start the supervisor and performance monitor.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let config = self.config.read().await.clone();
        config.validate()?;

        match self.deps.pool.health().await {
            Ok(true) => info!("Pool health check passed"),
            Ok(false) => warn!("Pool reports unhealthy, starting anyway"),
            Err(e) => warn!(error = %e, "Pool health check failed, starting anyway"),
        }

        let enabled: Vec<RouteConfig> = config
            .routes
            .iter()
            .filter(|r| r.enabled)
            .cloned()
            .collect();
        info!(
            routes = config.routes.len(),
            enabled = enabled.len(),
            "Starting router"
        );

        for route in &enabled {
            self.spawn_worker(&config, route)?;
        }

        let supervisor = GlobalLossSupervisor::new(
            self.workers.clone(),
            config.emergency_stop_config(),
            self.deps.notifier.clone(),
        );
        supervisor.start().await;
        *self.supervisor.write().await = Some(supervisor);

        let perf = PerfMonitor::new(
            self.workers.clone(),
            self.deps.store.clone(),
            self.deps.notifier.clone(),
            config.alert_settings(),
            config.perf_config(),
        );
        perf.start().await;
        *self.perf.write().await = Some(perf);

        *self.start_time.write().await = Some(Utc::now());
        Ok(())
    }

    fn spawn_worker(&self, config: &RoutingConfig, route_config: &RouteConfig) -> Result<()> {
        let route = config.build_route(route_config)?;
        let rule = config.build_rule_set(&route_config.rule_set)?;
        let handle = CopyWorker::spawn(
            route,
            rule,
            &config.filters,
            self.deps.pool.clone(),
            self.deps.store.clone(),
            self.deps.notifier.clone(),
            self.worker_config.clone(),
        );
        self.workers.insert(route_config.id.clone(), handle);
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        !self.workers.is_empty()
    }

    pub async fn is_emergency_stopped(&self) -> bool {
        match self.supervisor.read().await.as_ref() {
            Some(supervisor) => supervisor.is_tripped(),
            None => false,
        }
    }

    /// Enable or disable one route, persisting the change. A running
    /// router starts or stops the matching worker without touching the
    /// others.
    pub async fn toggle_route(self: &Arc<Self>, route_id: &str, enabled: bool) -> Result<()> {
        let updated = {
            let mut config = self.config.write().await;
            let route = config
                .routes
                .iter_mut()
                .find(|r| r.id == route_id)
                .ok_or_else(|| Error::Config(format!("unknown route '{route_id}'")))?;
            route.enabled = enabled;
            config.clone()
        };
        updated.save(&self.config_path)?;
        info!(route_id = %route_id, enabled, "Route toggled");

        if self.start_time.read().await.is_none() {
            return Ok(());
        }

        if enabled {
            if !self.workers.contains_key(route_id) {
                let route = updated
                    .route(route_id)
                    .cloned()
                    .ok_or_else(|| Error::Config(format!("unknown route '{route_id}'")))?;
                self.spawn_worker(&updated, &route)?;
            }
        } else if let Some((_, handle)) = self.workers.remove(route_id) {
            handle.stop().await;
        }
        Ok(())
    }

    /// Re-read the config file: stop workers whose route disappeared
    /// or was disabled, start newly enabled ones.
    pub async fn reload_config(self: &Arc<Self>) -> Result<()> {
        let fresh = RoutingConfig::load(&self.config_path)?;
        fresh.validate()?;

        let desired: Vec<String> = fresh
            .routes
            .iter()
            .filter(|r| r.enabled)
            .map(|r| r.id.clone())
            .collect();

        let running: Vec<String> = self.workers.iter().map(|e| e.key().clone()).collect();
        for route_id in &running {
            if !desired.contains(route_id) {
                if let Some((_, handle)) = self.workers.remove(route_id) {
                    info!(route_id = %route_id, "Stopping worker removed by reload");
                    handle.stop().await;
                }
            }
        }

        for route in fresh.routes.iter().filter(|r| r.enabled) {
            if !self.workers.contains_key(&route.id) {
                info!(route_id = %route.id, "Starting worker added by reload");
                self.spawn_worker(&fresh, route)?;
            }
        }

        *self.config.write().await = fresh;
        info!("Routing config reloaded");
        Ok(())
    }

    /// Cooperative shutdown of everything the router owns.
    pub async fn stop(&self) {
        info!("Stopping router");
        if let Some(perf) = self.perf.write().await.take() {
            perf.stop().await;
        }
        if let Some(supervisor) = self.supervisor.write().await.take() {
            supervisor.stop().await;
        }

        let route_ids: Vec<String> = self.workers.iter().map(|e| e.key().clone()).collect();
        for route_id in route_ids {
            if let Some((_, handle)) = self.workers.remove(&route_id) {
                handle.stop().await;
            }
        }
        info!("Router stopped");
    }

    /// JSON snapshot for the control bus and operators.
    pub async fn stats_snapshot(&self) -> serde_json::Value {
        let mut routes = Vec::new();
        for entry in self.workers.iter() {
            routes.push(serde_json::to_value(entry.value().stats().await).unwrap_or_default());
        }
        serde_json::json!({
            "startedAt": self.start_time.read().await.map(|t| t.to_rfc3339()),
            "emergencyStopped": self.is_emergency_stopped().await,
            "workerCount": routes.len(),
            "routes": routes,
        })
    }

    pub fn worker(&self, route_id: &str) -> Option<Arc<WorkerHandle>> {
        self.workers.get(route_id).map(|e| e.value().clone())
    }
}
