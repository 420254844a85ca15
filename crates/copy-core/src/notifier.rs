//! Outbound notifications with fingerprint-based spam suppression.
//!
//! Sends are fire-and-forget: delivery errors are logged and swallowed,
//! never surfaced to the calling worker. A message whose normalised
//! fingerprint was successfully delivered within the last 60 s is
//! suppressed.

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::AlertsConfig;
use crate::types::{CloseInfo, Position, PositionMapping, RouteContext};

/// Identical-fingerprint suppression window.
pub const SPAM_WINDOW: Duration = Duration::from_secs(60);

/// Result of a send attempt. Callers ignore everything but tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    /// Suppressed by the spam window.
    SpamBlocked,
    /// Notifier has no sink (credentials absent).
    Disabled,
    /// Route notification flag turned this event class off.
    Skipped,
    /// Delivery failed; logged and swallowed.
    Failed,
}

/// Delivery backend. Telegram in production, a recording fake in tests.
#[async_trait]
pub trait NotifySink: Send + Sync {
    async fn deliver(&self, text: &str) -> anyhow::Result<()>;
}

/// Telegram bot sink.
pub struct TelegramSink {
    token: String,
    chat_id: String,
    http_client: reqwest::Client,
}

impl TelegramSink {
    pub fn new(token: String, chat_id: String) -> Self {
        Self {
            token,
            chat_id,
            http_client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl NotifySink for TelegramSink {
    async fn deliver(&self, text: &str) -> anyhow::Result<()> {
        let url = format!("https://api.telegram.org/bot{}/sendMessage", self.token);
        self.http_client
            .post(&url)
            .json(&serde_json::json!({
                "chat_id": self.chat_id,
                "text": text,
                "parse_mode": "HTML"
            }))
            .send()
            .await?
            .error_for_status()?;
        debug!("Sent Telegram notification");
        Ok(())
    }
}

/// Collapse digit runs so timestamps and numeric literals do not defeat
/// deduplication.
fn fingerprint(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_number = false;
    for c in text.chars() {
        if c.is_ascii_digit() || (in_number && (c == '.' || c == ':' || c == ',')) {
            if !in_number {
                out.push('#');
                in_number = true;
            }
        } else {
            in_number = false;
            out.push(c);
        }
    }
    out
}

/// Deduplicating notifier over an optional sink.
pub struct Notifier {
    sink: Option<Arc<dyn NotifySink>>,
    recent: Mutex<HashMap<String, Instant>>,
}

impl Notifier {
    pub fn new(sink: Arc<dyn NotifySink>) -> Self {
        Self {
            sink: Some(sink),
            recent: Mutex::new(HashMap::new()),
        }
    }

    /// Notifier without a sink; every send is a no-op.
    pub fn disabled() -> Self {
        Self {
            sink: None,
            recent: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(alerts: &AlertsConfig) -> Self {
        match (&alerts.telegram_bot_token, &alerts.telegram_chat_id) {
            (Some(token), Some(chat_id)) => {
                Self::new(Arc::new(TelegramSink::new(token.clone(), chat_id.clone())))
            }
            _ => {
                info!("Notifier credentials absent, notifications disabled");
                Self::disabled()
            }
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.sink.is_some()
    }

    /// Send raw text through the spam filter.
    pub async fn send(&self, text: &str) -> SendOutcome {
        let Some(sink) = &self.sink else {
            return SendOutcome::Disabled;
        };

        let fp = fingerprint(text);
        {
            let mut recent = self.recent.lock().await;
            let now = Instant::now();
            recent.retain(|_, at| now.duration_since(*at) < SPAM_WINDOW);
            if recent.contains_key(&fp) {
                debug!("Notification suppressed by spam window");
                return SendOutcome::SpamBlocked;
            }
        }

        match sink.deliver(text).await {
            Ok(()) => {
                self.recent.lock().await.insert(fp, Instant::now());
                SendOutcome::Sent
            }
            Err(e) => {
                warn!(error = %e, "Failed to deliver notification");
                SendOutcome::Failed
            }
        }
    }

    pub async fn copy_success(
        &self,
        ctx: &RouteContext,
        source: &Position,
        dest_volume: Decimal,
        dest_order_id: &str,
    ) -> SendOutcome {
        if !ctx.notifications.on_copy {
            return SendOutcome::Skipped;
        }
        self.send(&format!(
            "COPY OK [{}] {} -> {} | {} {:?} {} -> {} lots | order {}",
            ctx.rule_name,
            ctx.source_nickname,
            ctx.dest_nickname,
            source.symbol,
            source.side,
            source.volume,
            dest_volume,
            dest_order_id,
        ))
        .await
    }

    pub async fn copy_failure(
        &self,
        ctx: &RouteContext,
        source: &Position,
        error: &str,
    ) -> SendOutcome {
        if !ctx.notifications.on_error {
            return SendOutcome::Skipped;
        }
        self.send(&format!(
            "COPY FAILED [{}] {} -> {} | {} {:?} {} lots | {}",
            ctx.rule_name,
            ctx.source_nickname,
            ctx.dest_nickname,
            source.symbol,
            source.side,
            source.volume,
            error,
        ))
        .await
    }

    pub async fn filter_rejection(
        &self,
        ctx: &RouteContext,
        source: &Position,
        rejections: &[(String, String)],
    ) -> SendOutcome {
        if !ctx.notifications.on_filter {
            return SendOutcome::Skipped;
        }
        let reasons: Vec<String> = rejections
            .iter()
            .map(|(name, reason)| format!("{name}: {reason}"))
            .collect();
        self.send(&format!(
            "FILTERED [{}] {} | {} {:?} {} lots | {}",
            ctx.rule_name,
            ctx.source_nickname,
            source.symbol,
            source.side,
            source.volume,
            reasons.join("; "),
        ))
        .await
    }

    pub async fn exit_copied(
        &self,
        ctx: &RouteContext,
        mapping: &PositionMapping,
        close_info: &CloseInfo,
        dest_profit: Option<Decimal>,
    ) -> SendOutcome {
        if !ctx.notifications.on_copy {
            return SendOutcome::Skipped;
        }
        let profit = dest_profit
            .map(|p| p.to_string())
            .unwrap_or_else(|| "?".to_string());
        self.send(&format!(
            "EXIT OK [{}] {} -> {} | {} closed ({}) | source P/L {} | dest P/L {}",
            ctx.rule_name,
            ctx.source_nickname,
            ctx.dest_nickname,
            mapping.symbol,
            close_info.reason.as_str(),
            close_info.profit,
            profit,
        ))
        .await
    }

    pub async fn exit_failure(
        &self,
        ctx: &RouteContext,
        mapping: &PositionMapping,
        error: &str,
    ) -> SendOutcome {
        if !ctx.notifications.on_error {
            return SendOutcome::Skipped;
        }
        self.send(&format!(
            "EXIT FAILED [{}] {} -> {} | {} position {} | {} (queued for retry)",
            ctx.rule_name,
            ctx.source_nickname,
            ctx.dest_nickname,
            mapping.symbol,
            mapping.dest_position_id,
            error,
        ))
        .await
    }

    pub async fn orphan_close(
        &self,
        ctx: &RouteContext,
        source_account: &str,
        position_id: &str,
    ) -> SendOutcome {
        if !ctx.notifications.on_error {
            return SendOutcome::Skipped;
        }
        self.send(&format!(
            "ORPHAN CLOSE [{}] account {} position {} closed with no known mapping",
            ctx.rule_name, source_account, position_id,
        ))
        .await
    }

    /// Supervisor-level message, never gated by route flags.
    pub async fn critical(&self, text: &str) -> SendOutcome {
        self.send(&format!("CRITICAL: {text}")).await
    }

    /// Monitoring warning, never gated by route flags.
    pub async fn warning(&self, text: &str) -> SendOutcome {
        self.send(&format!("WARNING: {text}")).await
    }

    /// Periodic summary from the performance monitor.
    pub async fn summary(&self, text: &str) -> SendOutcome {
        self.send(text).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct RecordingSink {
        delivered: Mutex<Vec<String>>,
        fail: AtomicUsize,
    }

    impl RecordingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                delivered: Mutex::new(Vec::new()),
                fail: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl NotifySink for RecordingSink {
        async fn deliver(&self, text: &str) -> anyhow::Result<()> {
            if self.fail.load(Ordering::SeqCst) > 0 {
                self.fail.fetch_sub(1, Ordering::SeqCst);
                anyhow::bail!("sink down");
            }
            self.delivered.lock().await.push(text.to_string());
            Ok(())
        }
    }

    #[test]
    fn test_fingerprint_normalises_numbers() {
        assert_eq!(
            fingerprint("profit 120.50 at 14:03:22"),
            fingerprint("profit 99.01 at 09:15:40")
        );
        assert_ne!(fingerprint("COPY OK EURUSD"), fingerprint("COPY OK GBPUSD"));
    }

    #[tokio::test]
    async fn test_identical_burst_delivers_once() {
        let sink = RecordingSink::new();
        let notifier = Notifier::new(sink.clone());

        let mut outcomes = Vec::new();
        for i in 0..5 {
            outcomes.push(notifier.send(&format!("copy failed, attempt {i}")).await);
        }

        assert_eq!(outcomes[0], SendOutcome::Sent);
        assert!(outcomes[1..]
            .iter()
            .all(|o| *o == SendOutcome::SpamBlocked));
        assert_eq!(sink.delivered.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_delivery_is_not_fingerprinted() {
        let sink = RecordingSink::new();
        sink.fail.store(1, Ordering::SeqCst);
        let notifier = Notifier::new(sink.clone());

        assert_eq!(notifier.send("exit failed 7").await, SendOutcome::Failed);
        // A failed send must not suppress the retry.
        assert_eq!(notifier.send("exit failed 7").await, SendOutcome::Sent);
        assert_eq!(sink.delivered.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn test_disabled_notifier_is_a_noop() {
        let notifier = Notifier::disabled();
        assert_eq!(notifier.send("anything").await, SendOutcome::Disabled);
    }

    #[tokio::test]
    async fn test_route_flags_gate_event_classes() {
        use crate::types::NotificationFlags;

        let sink = RecordingSink::new();
        let notifier = Notifier::new(sink.clone());
        let ctx = RouteContext {
            route_id: "r1".to_string(),
            source_nickname: "src".to_string(),
            dest_nickname: "dst".to_string(),
            rule_name: "conservative".to_string(),
            notifications: NotificationFlags {
                on_copy: true,
                on_filter: false,
                on_error: true,
            },
        };
        let position = Position {
            id: "1".to_string(),
            symbol: "EURUSD".to_string(),
            side: crate::types::Side::Buy,
            volume: Decimal::new(10, 2),
            open_price: Decimal::ONE,
            current_price: Decimal::ONE,
            stop_loss: None,
            take_profit: None,
            profit: Decimal::ZERO,
            open_time: chrono::Utc::now(),
            update_time: chrono::Utc::now(),
            comment: None,
        };

        let outcome = notifier
            .filter_rejection(&ctx, &position, &[("min-interval".to_string(), "too soon".to_string())])
            .await;
        assert_eq!(outcome, SendOutcome::Skipped);
        assert!(sink.delivered.lock().await.is_empty());
    }
}
