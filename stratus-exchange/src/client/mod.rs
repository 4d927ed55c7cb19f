use crate::error::ExchangeError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use smol_str::SmolStr;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use stratus_model::{
    exchange::ExchangeId,
    instrument::Symbol,
    market::{Candle, CandlePeriod},
    order::{ClientOrderId, ExchangeOrderId, OrderRequest, TradeStatus},
    Side,
};

pub mod binance;
pub mod mock;

/// Translate an exchange-native spot symbol ("BTCUSDT") into internal
/// notation. Shared by the REST client and the websocket normaliser.
pub(crate) fn binance_symbol(name: &str) -> Option<Symbol> {
    binance::model::from_exchange_symbol(name)
}

/// An order as the exchange reports it, normalised to the internal
/// vocabulary.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct OrderSnapshot {
    pub exchange: ExchangeId,
    pub symbol: Symbol,
    pub client_order_id: ClientOrderId,
    pub exchange_order_id: ExchangeOrderId,
    pub side: Side,
    pub status: TradeStatus,
    pub amount: Decimal,
    pub filled_amount: Decimal,
    pub avg_fill_price: Option<Decimal>,
    pub fee: Option<Decimal>,
    pub time: DateTime<Utc>,
}

impl OrderSnapshot {
    /// Fill details in journal form.
    pub fn fill_info(&self) -> stratus_model::order::FillInfo {
        stratus_model::order::FillInfo {
            filled_amount: self.filled_amount,
            avg_fill_price: self.avg_fill_price,
            fee: self.fee,
        }
    }
}

/// Free and locked balance of one asset.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, derive_more::Constructor)]
pub struct AccountBalance {
    pub asset: SmolStr,
    pub free: Decimal,
    pub locked: Decimal,
}

impl AccountBalance {
    pub fn total(&self) -> Decimal {
        self.free + self.locked
    }
}

/// Net holding the exchange reports for a symbol. On spot venues this is
/// derived from base-asset balances.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, derive_more::Constructor)]
pub struct ExchangePosition {
    pub symbol: Symbol,
    pub amount: Decimal,
    pub entry_price: Option<Decimal>,
}

/// The internal contract every venue implements. Additional exchanges plug in
/// here; nothing outside this crate sees a venue's wire format.
///
/// Every method call carries a mandatory deadline enforced by the caller -
/// a hung call becomes [`ExchangeError::Timeout`], never a silent stall.
#[async_trait]
pub trait ExecutionClient: Send + Sync + Debug {
    fn exchange(&self) -> ExchangeId;

    /// Submit an order, attaching `client_order_id` for idempotent retries.
    async fn place_order(
        &self,
        request: &OrderRequest,
        client_order_id: &ClientOrderId,
    ) -> Result<OrderSnapshot, ExchangeError>;

    async fn cancel_order(
        &self,
        symbol: &Symbol,
        client_order_id: &ClientOrderId,
    ) -> Result<OrderSnapshot, ExchangeError>;

    /// Current state of an order, or `None` if the venue has never seen it.
    async fn fetch_order(
        &self,
        symbol: &Symbol,
        client_order_id: &ClientOrderId,
    ) -> Result<Option<OrderSnapshot>, ExchangeError>;

    async fn open_orders(&self) -> Result<Vec<OrderSnapshot>, ExchangeError>;

    async fn balances(&self) -> Result<Vec<AccountBalance>, ExchangeError>;

    /// Net holdings as the exchange sees them. Reconciliation ground truth.
    async fn positions(&self) -> Result<Vec<ExchangePosition>, ExchangeError>;

    /// Most recent closed candles, oldest first.
    async fn candles(
        &self,
        symbol: &Symbol,
        period: CandlePeriod,
        limit: usize,
    ) -> Result<Vec<Candle>, ExchangeError>;
}
