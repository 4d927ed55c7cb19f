use crate::{
    client::{AccountBalance, ExchangePosition, ExecutionClient, OrderSnapshot},
    error::ExchangeError,
    secret::SecretProvider,
};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::Method;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use smol_str::SmolStr;
use std::{fmt::Debug, time::Duration};
use stratus_model::{
    exchange::ExchangeId,
    instrument::Symbol,
    market::{Candle, CandlePeriod},
    order::{ClientOrderId, ExchangeOrderId, OrderKind, OrderRequest, TradeStatus},
    Side,
};
use tracing::debug;

pub(crate) mod model;
mod signer;

/// Production REST endpoint.
pub const HTTP_BASE_URL: &str = "https://api.binance.com";

/// Sandbox REST endpoint, selected by `exchange.<name>.testnet`.
pub const HTTP_BASE_URL_TESTNET: &str = "https://testnet.binance.vision";

/// Production market data websocket endpoint.
pub const WS_BASE_URL: &str = "wss://stream.binance.com:9443";

const SECRET_API_KEY: &str = "binance_spot_api_key";
const SECRET_API_SECRET: &str = "binance_spot_api_secret";

/// Holdings below this threshold are dust, not positions.
const POSITION_DUST: Decimal = Decimal::from_parts(1, 0, 0, false, 9); // 1e-9

/// Binance-style spot venue client. Signed REST for account state and order
/// lifecycle; market data streams live in [`crate::stream`].
#[derive(Clone)]
pub struct BinanceSpot {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    secret: Vec<u8>,
    call_timeout: Duration,
}

impl Debug for BinanceSpot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Credentials stay out of Debug output.
        f.debug_struct("BinanceSpot")
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl BinanceSpot {
    pub fn new(
        base_url: &str,
        secrets: &dyn SecretProvider,
        call_timeout: Duration,
    ) -> Result<Self, ExchangeError> {
        let api_key = String::from_utf8(secrets.get_secret(SECRET_API_KEY)?)
            .map_err(|_| ExchangeError::SecretMissing(SECRET_API_KEY.to_string()))?;
        let secret = secrets.get_secret(SECRET_API_SECRET)?;
        let http = reqwest::Client::builder()
            .timeout(call_timeout)
            .build()
            .map_err(|error| ExchangeError::Transient(error.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            secret,
            call_timeout,
        })
    }

    /// Issue a signed request: urlencode params, append timestamp and
    /// signature, attach the API-key header.
    async fn signed<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<T, ExchangeError> {
        let mut params: Vec<(&str, String)> = params.to_vec();
        params.push(("timestamp", Utc::now().timestamp_millis().to_string()));
        params.push(("recvWindow", "5000".to_string()));
        let query = serde_urlencoded::to_string(&params)
            .map_err(|error| ExchangeError::Permanent(error.to_string()))?;
        let signature = signer::sign(&query, &self.secret);
        let url = format!("{}{}?{}&signature={}", self.base_url, path, query, signature);

        let request = self
            .http
            .request(method, url)
            .header("X-MBX-APIKEY", &self.api_key);
        self.send(request).await
    }

    /// Issue a public (unsigned) request.
    async fn public<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<T, ExchangeError> {
        let query = serde_urlencoded::to_string(params)
            .map_err(|error| ExchangeError::Permanent(error.to_string()))?;
        let url = format!("{}{}?{}", self.base_url, path, query);
        self.send(self.http.get(url)).await
    }

    async fn send<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T, ExchangeError> {
        let response = tokio::time::timeout(self.call_timeout, request.send())
            .await
            .map_err(|_| ExchangeError::Timeout(self.call_timeout))??;

        let status = response.status();
        let body = response.text().await?;
        if status.is_success() {
            return serde_json::from_str(&body).map_err(|error| {
                ExchangeError::Permanent(format!("undecodable response: {error}"))
            });
        }

        // Prefer the venue's structured error body over raw HTTP status.
        match serde_json::from_str::<model::ErrorResponse>(&body) {
            Ok(error) => Err(error.classify(status.as_u16())),
            Err(_) if status.as_u16() == 429 || status.as_u16() == 418 => {
                Err(ExchangeError::RateLimited(status.to_string()))
            }
            Err(_) if status.is_server_error() => {
                Err(ExchangeError::Transient(status.to_string()))
            }
            Err(_) => Err(ExchangeError::Permanent(format!("{status}: {body}"))),
        }
    }

    fn snapshot_from_order(
        &self,
        response: model::OrderResponse,
    ) -> Result<OrderSnapshot, ExchangeError> {
        let symbol = model::from_exchange_symbol(&response.symbol).ok_or_else(|| {
            ExchangeError::Permanent(format!("unmappable symbol {}", response.symbol))
        })?;
        Ok(OrderSnapshot {
            exchange: ExchangeId::BinanceSpot,
            symbol,
            client_order_id: ClientOrderId::new(&response.client_order_id),
            exchange_order_id: ExchangeOrderId::new(response.order_id.to_string()),
            side: response.trade_side()?,
            status: response.trade_status()?,
            amount: response.orig_qty,
            filled_amount: response.executed_qty,
            avg_fill_price: response.avg_fill_price(),
            fee: response.total_fee(),
            time: Utc::now(),
        })
    }
}

fn millis(timestamp: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(timestamp)
        .single()
        .unwrap_or_default()
}

#[async_trait]
impl ExecutionClient for BinanceSpot {
    fn exchange(&self) -> ExchangeId {
        ExchangeId::BinanceSpot
    }

    async fn place_order(
        &self,
        request: &OrderRequest,
        client_order_id: &ClientOrderId,
    ) -> Result<OrderSnapshot, ExchangeError> {
        let mut params = vec![
            ("symbol", model::to_exchange_symbol(&request.symbol)),
            (
                "side",
                match request.side {
                    Side::Buy => "BUY".to_string(),
                    Side::Sell => "SELL".to_string(),
                },
            ),
            ("quantity", request.amount.to_string()),
            ("newClientOrderId", client_order_id.0.to_string()),
            ("newOrderRespType", "FULL".to_string()),
        ];
        match request.kind {
            OrderKind::Market => params.push(("type", "MARKET".to_string())),
            OrderKind::Limit => {
                params.push(("type", "LIMIT".to_string()));
                params.push(("timeInForce", "GTC".to_string()));
                let price = request.price.ok_or_else(|| {
                    ExchangeError::Permanent("limit order without price".to_string())
                })?;
                params.push(("price", price.to_string()));
            }
        }

        debug!(symbol = %request.symbol, side = %request.side, "submitting order");
        let response: model::OrderResponse =
            self.signed(Method::POST, "/api/v3/order", &params).await?;
        self.snapshot_from_order(response)
    }

    async fn cancel_order(
        &self,
        symbol: &Symbol,
        client_order_id: &ClientOrderId,
    ) -> Result<OrderSnapshot, ExchangeError> {
        let params = vec![
            ("symbol", model::to_exchange_symbol(symbol)),
            ("origClientOrderId", client_order_id.0.to_string()),
        ];
        let response: model::OrderResponse = self
            .signed(Method::DELETE, "/api/v3/order", &params)
            .await?;
        self.snapshot_from_order(response)
    }

    async fn fetch_order(
        &self,
        symbol: &Symbol,
        client_order_id: &ClientOrderId,
    ) -> Result<Option<OrderSnapshot>, ExchangeError> {
        let params = vec![
            ("symbol", model::to_exchange_symbol(symbol)),
            ("origClientOrderId", client_order_id.0.to_string()),
        ];
        match self
            .signed::<model::OrderResponse>(Method::GET, "/api/v3/order", &params)
            .await
        {
            Ok(response) => self.snapshot_from_order(response).map(Some),
            // "Order does not exist."
            Err(ExchangeError::Permanent(message)) if message.starts_with("-2013") => Ok(None),
            Err(error) => Err(error),
        }
    }

    async fn open_orders(&self) -> Result<Vec<OrderSnapshot>, ExchangeError> {
        let responses: Vec<model::OrderResponse> = self
            .signed(Method::GET, "/api/v3/openOrders", &[])
            .await?;
        responses
            .into_iter()
            .map(|response| self.snapshot_from_order(response))
            .collect()
    }

    async fn balances(&self) -> Result<Vec<AccountBalance>, ExchangeError> {
        let account: model::AccountResponse =
            self.signed(Method::GET, "/api/v3/account", &[]).await?;
        Ok(account
            .balances
            .into_iter()
            .filter(|balance| !balance.free.is_zero() || !balance.locked.is_zero())
            .map(|balance| {
                AccountBalance::new(SmolStr::new(balance.asset), balance.free, balance.locked)
            })
            .collect())
    }

    async fn positions(&self) -> Result<Vec<ExchangePosition>, ExchangeError> {
        // Spot holdings double as positions: every non-dust, non-quote asset
        // balance is an open position against USDT.
        let balances = self.balances().await?;
        Ok(balances
            .into_iter()
            .filter(|balance| {
                balance.total() > POSITION_DUST
                    && !matches!(balance.asset.as_str(), "USDT" | "USDC" | "FDUSD" | "BUSD")
            })
            .map(|balance| {
                ExchangePosition::new(
                    Symbol::new(format!("{}/USDT", balance.asset)),
                    balance.total(),
                    None,
                )
            })
            .collect())
    }

    async fn candles(
        &self,
        symbol: &Symbol,
        period: CandlePeriod,
        limit: usize,
    ) -> Result<Vec<Candle>, ExchangeError> {
        let params = vec![
            ("symbol", model::to_exchange_symbol(symbol)),
            ("interval", period.as_str().to_string()),
            ("limit", limit.to_string()),
        ];
        let rows: Vec<model::KlineRow> = self.public("/api/v3/klines", &params).await?;
        let now = Utc::now();
        Ok(rows
            .into_iter()
            .map(|(open_time, open, high, low, close, volume, close_time, ..)| {
                let close_time = millis(close_time);
                Candle {
                    period,
                    open_time: millis(open_time),
                    close_time,
                    open,
                    high,
                    low,
                    close,
                    volume,
                    closed: close_time <= now,
                }
            })
            .collect())
    }
}
