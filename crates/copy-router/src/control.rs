//! Control bus: Redis pub/sub commands for a running router.
//!
//! Subscribes to `routing:commands` and applies toggle/reload/stats
//! commands. Reconnects on a fixed delay; a dead control bus never
//! takes the router down.

use copy_core::store::StateStore;
use futures_util::StreamExt;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::router::AdvancedRouter;

pub const COMMANDS_CHANNEL: &str = "routing:commands";

#[derive(Debug, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ControlCommand {
    ToggleRoute {
        #[serde(rename = "routeId")]
        route_id: String,
        enabled: bool,
    },
    ReloadConfig,
    GetStats,
}

pub struct ControlBus {
    redis_url: String,
    router: Arc<AdvancedRouter>,
    store: Arc<dyn StateStore>,
    reconnect_delay_secs: u64,
}

impl ControlBus {
    pub fn new(redis_url: String, router: Arc<AdvancedRouter>, store: Arc<dyn StateStore>) -> Self {
        Self {
            redis_url,
            router,
            store,
            reconnect_delay_secs: 5,
        }
    }

    /// Run until the process exits, reconnecting as needed.
    pub async fn run(&self) {
        loop {
            match self.run_inner().await {
                Ok(()) => info!("Control bus connection closed"),
                Err(e) => error!(error = %e, "Control bus error, reconnecting"),
            }
            tokio::time::sleep(tokio::time::Duration::from_secs(self.reconnect_delay_secs)).await;
        }
    }

    async fn run_inner(&self) -> anyhow::Result<()> {
        let client = redis::Client::open(self.redis_url.as_str())?;
        let mut pubsub = client.get_async_pubsub().await?;
        pubsub.subscribe(COMMANDS_CHANNEL).await?;
        info!(channel = COMMANDS_CHANNEL, "Control bus listening");

        let mut stream = pubsub.on_message();
        while let Some(msg) = stream.next().await {
            let payload: String = match msg.get_payload() {
                Ok(p) => p,
                Err(e) => {
                    warn!(error = %e, "Unreadable control message");
                    continue;
                }
            };
            self.handle_payload(&payload).await;
        }
        Ok(())
    }

    pub async fn handle_payload(&self, payload: &str) {
        let command: ControlCommand = match serde_json::from_str(payload) {
            Ok(command) => command,
            Err(e) => {
                warn!(error = %e, payload = %payload, "Unparseable control command");
                return;
            }
        };
        debug!(command = ?command, "Handling control command");

        match command {
            ControlCommand::ToggleRoute { route_id, enabled } => {
                if let Err(e) = self.router.toggle_route(&route_id, enabled).await {
                    warn!(route_id = %route_id, error = %e, "Toggle failed");
                }
            }
            ControlCommand::ReloadConfig => {
                if let Err(e) = self.router.reload_config().await {
                    warn!(error = %e, "Config reload failed");
                }
            }
            ControlCommand::GetStats => {
                let snapshot = self.router.stats_snapshot().await;
                if let Err(e) = self.store.put_stats_snapshot(&snapshot.to_string()).await {
                    warn!(error = %e, "Stats snapshot write failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_parsing() {
        let toggle: ControlCommand = serde_json::from_str(
            r#"{"command": "toggle_route", "routeId": "r1", "enabled": false}"#,
        )
        .unwrap();
        assert!(matches!(
            toggle,
            ControlCommand::ToggleRoute { ref route_id, enabled: false } if route_id == "r1"
        ));

        let reload: ControlCommand =
            serde_json::from_str(r#"{"command": "reload_config"}"#).unwrap();
        assert!(matches!(reload, ControlCommand::ReloadConfig));

        let stats: ControlCommand = serde_json::from_str(r#"{"command": "get_stats"}"#).unwrap();
        assert!(matches!(stats, ControlCommand::GetStats));
    }

    #[test]
    fn test_unknown_command_is_rejected() {
        let result: Result<ControlCommand, _> =
            serde_json::from_str(r#"{"command": "self_destruct"}"#);
        assert!(result.is_err());
    }
}
