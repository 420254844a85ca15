//! Typed client for the external broker connection-pool HTTP API.
//!
//! The pool abstracts broker connectivity; this client only shapes
//! requests and classifies failures. Idempotent GETs are retried,
//! trade execution is never retried; crash-safe dedup rides on the
//! correlation comment instead.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use crate::types::{volume_centi, Position, Side};
use crate::{Error, Result};

const IDEMPOTENT_GET_RETRIES: usize = 3;

/// Balance snapshot for an account.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountInfo {
    pub balance: Decimal,
    pub equity: Decimal,
    #[serde(default)]
    pub margin: Decimal,
    #[serde(default)]
    pub free_margin: Decimal,
    #[serde(default)]
    pub currency: Option<String>,
}

/// Trade request forwarded to the pool.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteRequest {
    pub symbol: String,
    pub side: Side,
    pub volume: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_loss: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub take_profit: Option<Decimal>,
    /// Carries the correlation id used for crash-safe dedup.
    pub comment: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeResult {
    pub success: bool,
    #[serde(default)]
    pub order_id: Option<String>,
    #[serde(default)]
    pub open_price: Option<Decimal>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseResult {
    pub success: bool,
    #[serde(default)]
    pub profit: Option<Decimal>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceQuote {
    pub symbol: String,
    pub bid: Decimal,
    pub ask: Decimal,
}

/// Handle to the pool's push connection for one account.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamingSession {
    pub ws_url: String,
}

/// Build the correlation comment placed on every destination trade:
/// `copy_{sourcePositionId}_v{sourceVolumeCenti}`.
pub fn correlation_comment(source_position_id: &str, source_volume: Decimal) -> String {
    format!("copy_{}_v{}", source_position_id, volume_centi(source_volume))
}

/// Prefix that identifies any copy of the given source position,
/// regardless of the volume it was opened with.
pub fn correlation_prefix(source_position_id: &str) -> String {
    format!("copy_{source_position_id}_")
}

/// Parse a correlation comment back into `(source_position_id, centi_lots)`.
pub fn parse_correlation(comment: &str) -> Option<(String, i64)> {
    let rest = comment.strip_prefix("copy_")?;
    let (position_id, volume) = rest.rsplit_once("_v")?;
    if position_id.is_empty() {
        return None;
    }
    Some((position_id.to_string(), volume.parse().ok()?))
}

/// Broker operations the engine depends on. Implemented by
/// [`PoolClient`] in production and by fakes in tests.
#[async_trait]
pub trait BrokerPool: Send + Sync {
    async fn get_account_info(&self, account: &str, region: &str) -> Result<AccountInfo>;

    async fn get_positions(&self, account: &str, region: &str) -> Result<Vec<Position>>;

    async fn execute_trade(
        &self,
        account: &str,
        region: &str,
        request: &ExecuteRequest,
    ) -> Result<TradeResult>;

    async fn modify_position(
        &self,
        account: &str,
        region: &str,
        position_id: &str,
        stop_loss: Option<Decimal>,
        take_profit: Option<Decimal>,
    ) -> Result<bool>;

    async fn close_position(
        &self,
        account: &str,
        region: &str,
        position_id: &str,
    ) -> Result<CloseResult>;

    /// Close part of a position. `volume` is the amount to close.
    async fn close_position_partial(
        &self,
        account: &str,
        region: &str,
        position_id: &str,
        volume: Decimal,
    ) -> Result<CloseResult>;

    async fn get_price(&self, symbol: &str) -> Result<PriceQuote>;

    async fn initialize_streaming(&self, account: &str, region: &str)
        -> Result<StreamingSession>;

    async fn subscribe_symbol(&self, account: &str, region: &str, symbol: &str) -> Result<()>;

    async fn health(&self) -> Result<bool>;
}

/// HTTP client for the pool service.
pub struct PoolClient {
    base_url: String,
    http_client: reqwest::Client,
}

impl PoolClient {
    pub fn new(base_url: &str, request_timeout: Duration) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| Error::Config(format!("failed to build pool HTTP client: {e}")))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http_client,
        })
    }

    fn classify(e: reqwest::Error) -> Error {
        if let Some(status) = e.status() {
            if status.is_client_error() {
                return Error::PoolPermanent {
                    message: e.to_string(),
                    status: Some(status.as_u16()),
                };
            }
        }
        Error::PoolTransient(e.to_string())
    }

    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        if status.is_client_error() {
            Err(Error::PoolPermanent {
                message: format!("pool returned {status}: {body}"),
                status: Some(status.as_u16()),
            })
        } else {
            Err(Error::PoolTransient(format!("pool returned {status}: {body}")))
        }
    }

    /// GET with bounded retries. Only used for idempotent reads.
    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let mut last_err = None;
        for attempt in 0..IDEMPOTENT_GET_RETRIES {
            let result = async {
                let response = self
                    .http_client
                    .get(&url)
                    .send()
                    .await
                    .map_err(Self::classify)?;
                let response = Self::check_status(response).await?;
                response.json::<T>().await.map_err(Self::classify)
            }
            .await;

            match result {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt + 1 < IDEMPOTENT_GET_RETRIES => {
                    warn!(url = %url, attempt = attempt + 1, error = %e, "Retrying pool GET");
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or_else(|| Error::PoolTransient("pool GET failed".to_string())))
    }

    /// POST without retries; non-idempotent operations rely on the
    /// caller's dedup instead.
    async fn post_json<B: Serialize, T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .http_client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(Self::classify)?;
        let response = Self::check_status(response).await?;
        response.json::<T>().await.map_err(Self::classify)
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AccountScopedRequest<'a, B: Serialize> {
    account_id: &'a str,
    region: &'a str,
    #[serde(flatten)]
    body: B,
}

#[derive(Debug, Deserialize)]
struct ModifyResponse {
    success: bool,
}

#[derive(Debug, Deserialize)]
struct HealthResponse {
    #[serde(default)]
    healthy: bool,
}

#[async_trait]
impl BrokerPool for PoolClient {
    async fn get_account_info(&self, account: &str, region: &str) -> Result<AccountInfo> {
        self.get_json(&format!("/account/{account}?region={region}"))
            .await
    }

    async fn get_positions(&self, account: &str, region: &str) -> Result<Vec<Position>> {
        self.get_json(&format!("/positions/{account}?region={region}"))
            .await
    }

    async fn execute_trade(
        &self,
        account: &str,
        region: &str,
        request: &ExecuteRequest,
    ) -> Result<TradeResult> {
        debug!(
            account = %account,
            symbol = %request.symbol,
            volume = %request.volume,
            comment = %request.comment,
            "Submitting trade to pool"
        );
        self.post_json(
            "/trade/execute",
            &AccountScopedRequest {
                account_id: account,
                region,
                body: request,
            },
        )
        .await
    }

    async fn modify_position(
        &self,
        account: &str,
        region: &str,
        position_id: &str,
        stop_loss: Option<Decimal>,
        take_profit: Option<Decimal>,
    ) -> Result<bool> {
        let response: ModifyResponse = self
            .post_json(
                "/position/modify",
                &AccountScopedRequest {
                    account_id: account,
                    region,
                    body: serde_json::json!({
                        "positionId": position_id,
                        "stopLoss": stop_loss,
                        "takeProfit": take_profit,
                    }),
                },
            )
            .await?;
        Ok(response.success)
    }

    async fn close_position(
        &self,
        account: &str,
        region: &str,
        position_id: &str,
    ) -> Result<CloseResult> {
        self.post_json(
            "/position/close",
            &AccountScopedRequest {
                account_id: account,
                region,
                body: serde_json::json!({ "positionId": position_id }),
            },
        )
        .await
    }

    async fn close_position_partial(
        &self,
        account: &str,
        region: &str,
        position_id: &str,
        volume: Decimal,
    ) -> Result<CloseResult> {
        self.post_json(
            "/position/close",
            &AccountScopedRequest {
                account_id: account,
                region,
                body: serde_json::json!({
                    "positionId": position_id,
                    "volume": volume,
                }),
            },
        )
        .await
    }

    async fn get_price(&self, symbol: &str) -> Result<PriceQuote> {
        self.get_json(&format!("/prices/{symbol}")).await
    }

    async fn initialize_streaming(
        &self,
        account: &str,
        region: &str,
    ) -> Result<StreamingSession> {
        self.post_json(
            "/streaming/initialize",
            &AccountScopedRequest {
                account_id: account,
                region,
                body: serde_json::json!({}),
            },
        )
        .await
    }

    async fn subscribe_symbol(&self, account: &str, region: &str, symbol: &str) -> Result<()> {
        let _: serde_json::Value = self
            .post_json(
                "/streaming/subscribe",
                &AccountScopedRequest {
                    account_id: account,
                    region,
                    body: serde_json::json!({ "symbol": symbol }),
                },
            )
            .await?;
        Ok(())
    }

    async fn health(&self) -> Result<bool> {
        let response: HealthResponse = self.get_json("/health").await?;
        Ok(response.healthy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_correlation_comment_format() {
        assert_eq!(correlation_comment("48213", Decimal::new(50, 2)), "copy_48213_v50");
        assert_eq!(correlation_comment("7", Decimal::new(1, 0)), "copy_7_v100");
    }

    #[test]
    fn test_correlation_roundtrip() {
        let comment = correlation_comment("abc-9", Decimal::new(133, 2));
        assert_eq!(parse_correlation(&comment), Some(("abc-9".to_string(), 133)));
    }

    #[test]
    fn test_parse_correlation_rejects_foreign_comments() {
        assert_eq!(parse_correlation("manual entry"), None);
        assert_eq!(parse_correlation("copy__v10"), None);
        assert_eq!(parse_correlation("copy_12"), None);
    }

    #[test]
    fn test_trade_result_parses_pool_payload() {
        let json = r#"{"success": true, "orderId": "990", "openPrice": "2400.15"}"#;
        let result: TradeResult = serde_json::from_str(json).unwrap();
        assert!(result.success);
        assert_eq!(result.order_id.as_deref(), Some("990"));
        assert_eq!(result.open_price, Some(Decimal::new(240015, 2)));
    }

    #[test]
    fn test_execute_request_omits_absent_stops() {
        let request = ExecuteRequest {
            symbol: "EURUSD".to_string(),
            side: Side::Sell,
            volume: Decimal::new(25, 2),
            stop_loss: None,
            take_profit: None,
            comment: "copy_1_v25".to_string(),
        };
        let json = serde_json::to_string(&request).unwrap();
        assert!(!json.contains("stopLoss"));
        assert!(!json.contains("takeProfit"));
    }
}
