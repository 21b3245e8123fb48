use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::StatusCode;
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::debug;

use auth::ApiCredentials;
use common::BinanceEnvironment;
use exchange_core::{ExchangeClient, ExchangeError};
use model::{Fill, Order, OrderKind, OrderSide, Position, TradingMode};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Binance error code for an insufficient account balance.
const CODE_INSUFFICIENT_BALANCE: i64 = -2010;

/// REST client for order placement and account inspection.
///
/// Submissions are never retried here; the upstream policy is that a
/// transport failure surfaces as a failed order rather than risking a
/// double fill.
pub struct BinanceRestClient {
    http: reqwest::Client,
    credentials: ApiCredentials,
    base_url: String,
}

impl BinanceRestClient {
    pub fn new(
        credentials: ApiCredentials,
        environment: BinanceEnvironment,
    ) -> Result<Self, ExchangeError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ExchangeError::Transport {
                retryable: false,
                detail: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            http,
            credentials,
            base_url: environment.rest_base_url().to_string(),
        })
    }

    fn timestamp_ms() -> i64 {
        Utc::now().timestamp_millis()
    }

    async fn signed_post(&self, path: &str, params: &str) -> Result<String, ExchangeError> {
        let body = self.credentials.signed_query(params, Self::timestamp_ms());
        let url = format!("{}{}", self.base_url, path);

        let response = self
            .http
            .post(&url)
            .header("X-MBX-APIKEY", self.credentials.api_key())
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body(body)
            .send()
            .await
            .map_err(|e| ExchangeError::Transport {
                retryable: true,
                detail: e.to_string(),
            })?;

        Self::read_response(response).await
    }

    async fn signed_get(&self, path: &str, params: &str) -> Result<String, ExchangeError> {
        let query = self.credentials.signed_query(params, Self::timestamp_ms());
        let url = format!("{}{}?{}", self.base_url, path, query);

        let response = self
            .http
            .get(&url)
            .header("X-MBX-APIKEY", self.credentials.api_key())
            .send()
            .await
            .map_err(|e| ExchangeError::Transport {
                retryable: true,
                detail: e.to_string(),
            })?;

        Self::read_response(response).await
    }

    async fn read_response(response: reqwest::Response) -> Result<String, ExchangeError> {
        let status = response.status();
        let body = response.text().await.map_err(|e| ExchangeError::Transport {
            retryable: true,
            detail: e.to_string(),
        })?;

        if status.is_success() {
            return Ok(body);
        }
        Err(classify_api_error(status, &body))
    }
}

/// Map an HTTP error response onto the submission error taxonomy.
fn classify_api_error(status: StatusCode, body: &str) -> ExchangeError {
    if status.is_server_error() {
        return ExchangeError::Transport {
            retryable: true,
            detail: format!("HTTP {status}: {body}"),
        };
    }
    if status == StatusCode::TOO_MANY_REQUESTS {
        return ExchangeError::Transport {
            retryable: true,
            detail: format!("rate limited: {body}"),
        };
    }

    let api_error: Option<ApiErrorBody> = serde_json::from_str(body).ok();
    match api_error {
        Some(err) if err.code == CODE_INSUFFICIENT_BALANCE => ExchangeError::InsufficientFunds,
        Some(err) => ExchangeError::Rejected { reason: err.msg },
        None => ExchangeError::Rejected {
            reason: format!("HTTP {status}: {body}"),
        },
    }
}

#[async_trait]
impl ExchangeClient for BinanceRestClient {
    async fn submit_order(&self, order: &Order) -> Result<Fill, ExchangeError> {
        let mut params = format!(
            "symbol={}&side={}&type={}&quantity={}&newClientOrderId={}",
            order.pair,
            order.side,
            match order.kind {
                OrderKind::Market => "MARKET",
                OrderKind::Limit => "LIMIT",
            },
            order.quantity,
            order.id,
        );
        if order.kind == OrderKind::Limit {
            params.push_str(&format!(
                "&price={}&timeInForce=GTC",
                order.reference_price
            ));
        }

        debug!(pair = %order.pair, side = %order.side, qty = %order.quantity, "submitting order");
        let body = self.signed_post("/api/v3/order", &params).await?;

        let response: OrderResponse =
            serde_json::from_str(&body).map_err(|e| ExchangeError::Transport {
                retryable: false,
                detail: format!("malformed order response: {e}"),
            })?;

        // Market responses list the constituent fills; fall back to the
        // reference price when the venue omits them.
        let executed_price = response
            .fills
            .first()
            .map(|f| f.price)
            .unwrap_or(order.reference_price);
        let executed_quantity = if response.executed_qty > Decimal::ZERO {
            response.executed_qty
        } else {
            order.quantity
        };

        Ok(Fill {
            order_id: order.id.clone(),
            pair: order.pair.clone(),
            side: order.side,
            executed_price,
            executed_quantity,
            executed_at: Utc::now(),
            exchange_id: Some(response.order_id.to_string()),
        })
    }

    async fn open_positions(&self) -> Result<Vec<Position>, ExchangeError> {
        let body = self.signed_get("/api/v3/account", "").await?;
        let account: AccountResponse =
            serde_json::from_str(&body).map_err(|e| ExchangeError::Transport {
                retryable: false,
                detail: format!("malformed account response: {e}"),
            })?;

        // Spot balances in non-quote assets are treated as long exposure.
        // Entry prices are unknown without trade history and stay zero
        // until the ledger's own record takes precedence.
        let positions = account
            .balances
            .into_iter()
            .filter(|b| b.asset != "USDT" && b.asset != "BNB")
            .filter(|b| b.total() > Decimal::ZERO)
            .map(|b| Position {
                id: uuid::Uuid::new_v4().to_string(),
                pair: format!("{}USDT", b.asset),
                side: OrderSide::Buy,
                entry_price: Decimal::ZERO,
                quantity: b.total(),
                mode: TradingMode::Live,
                opened_at: Utc::now(),
            })
            .collect();

        Ok(positions)
    }
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    code: i64,
    msg: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderResponse {
    order_id: u64,
    #[serde(default)]
    executed_qty: Decimal,
    #[serde(default)]
    fills: Vec<FillDetail>,
}

#[derive(Debug, Deserialize)]
struct FillDetail {
    price: Decimal,
}

#[derive(Debug, Deserialize)]
struct AccountResponse {
    balances: Vec<Balance>,
}

#[derive(Debug, Deserialize)]
struct Balance {
    asset: String,
    free: Decimal,
    locked: Decimal,
}

impl Balance {
    fn total(&self) -> Decimal {
        self.free + self.locked
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_insufficient_balance_code_maps_to_funds_error() {
        let err = classify_api_error(
            StatusCode::BAD_REQUEST,
            r#"{"code":-2010,"msg":"Account has insufficient balance for requested action."}"#,
        );
        assert!(matches!(err, ExchangeError::InsufficientFunds));
    }

    #[test]
    fn test_api_rejection_carries_exchange_message() {
        let err = classify_api_error(
            StatusCode::BAD_REQUEST,
            r#"{"code":-1013,"msg":"Filter failure: LOT_SIZE"}"#,
        );
        match err {
            ExchangeError::Rejected { reason } => assert!(reason.contains("LOT_SIZE")),
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[test]
    fn test_server_errors_are_retryable_transport() {
        let err = classify_api_error(StatusCode::BAD_GATEWAY, "upstream unavailable");
        assert!(matches!(
            err,
            ExchangeError::Transport { retryable: true, .. }
        ));
    }

    #[test]
    fn test_order_response_parses_fills() {
        let body = r#"{
            "symbol": "BTCUSDT",
            "orderId": 28,
            "executedQty": "0.04",
            "fills": [{"price": "20020.00", "qty": "0.04", "commission": "0", "commissionAsset": "USDT"}]
        }"#;
        let response: OrderResponse = serde_json::from_str(body).unwrap();
        assert_eq!(response.order_id, 28);
        assert_eq!(response.executed_qty, dec!(0.04));
        assert_eq!(response.fills[0].price, dec!(20020));
    }

    #[test]
    fn test_balance_total_sums_free_and_locked() {
        let balance = Balance {
            asset: "BTC".into(),
            free: dec!(0.5),
            locked: dec!(0.25),
        };
        assert_eq!(balance.total(), dec!(0.75));
    }
}
