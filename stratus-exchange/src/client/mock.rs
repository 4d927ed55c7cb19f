use crate::{
    client::{AccountBalance, ExchangePosition, ExecutionClient, OrderSnapshot},
    error::ExchangeError,
};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use smol_str::SmolStr;
use std::{collections::HashMap, fmt::Debug, sync::Arc, time::Duration};
use stratus_model::{
    exchange::ExchangeId,
    instrument::Symbol,
    market::{Candle, CandlePeriod},
    order::{ClientOrderId, ExchangeOrderId, OrderKind, OrderRequest, TradeStatus},
    Side,
};
use tracing::info;

/// Configuration for a [`MockExchange`].
#[derive(Debug, Clone)]
pub struct MockExchangeConfig {
    pub latency: Duration,
    /// Fee charged on fills, as a fraction of notional.
    pub fee_pct: Decimal,
    /// Market orders fill this fraction away from the reference price.
    pub slippage_pct: Decimal,
    /// When set, market orders rest `open` instead of filling immediately -
    /// for exercising timeout and reconciliation paths.
    pub rest_orders_open: bool,
}

impl Default for MockExchangeConfig {
    fn default() -> Self {
        Self {
            latency: Duration::from_millis(0),
            fee_pct: Decimal::ZERO,
            slippage_pct: Decimal::ZERO,
            rest_orders_open: false,
        }
    }
}

#[derive(Debug, Default)]
struct MockState {
    prices: HashMap<Symbol, Decimal>,
    orders: HashMap<ClientOrderId, OrderSnapshot>,
    positions: HashMap<Symbol, Decimal>,
    balances: HashMap<SmolStr, Decimal>,
    fail_next_place: Option<ExchangeError>,
    next_order_id: u64,
}

/// In-process venue with deterministic fills. Backs `dry_run` deployments
/// (synthetic fills, real pipeline) and the test suite; doubles as the
/// scriptable ground truth for reconciliation scenarios.
#[derive(Debug, Clone)]
pub struct MockExchange {
    config: MockExchangeConfig,
    state: Arc<Mutex<MockState>>,
}

impl Default for MockExchange {
    fn default() -> Self {
        Self::new(MockExchangeConfig::default())
    }
}

impl MockExchange {
    pub fn new(config: MockExchangeConfig) -> Self {
        Self {
            config,
            state: Arc::new(Mutex::new(MockState::default())),
        }
    }

    /// Set the reference price market orders fill against.
    pub fn set_price(&self, symbol: &Symbol, price: Decimal) {
        self.state.lock().prices.insert(symbol.clone(), price);
    }

    /// Seed a holding, as if acquired outside the system - an orphan from the
    /// journal's point of view.
    pub fn seed_position(&self, symbol: &Symbol, amount: Decimal) {
        self.state.lock().positions.insert(symbol.clone(), amount);
    }

    pub fn seed_balance(&self, asset: &str, amount: Decimal) {
        self.state
            .lock()
            .balances
            .insert(SmolStr::new(asset), amount);
    }

    /// Script the next `place_order` call to fail.
    pub fn fail_next_place(&self, error: ExchangeError) {
        self.state.lock().fail_next_place = Some(error);
    }

    /// Drive a resting order to a terminal status, as the exchange would.
    pub fn complete_order(
        &self,
        client_order_id: &ClientOrderId,
        status: TradeStatus,
        fill_price: Option<Decimal>,
    ) {
        let mut state = self.state.lock();
        let Some(order) = state.orders.get_mut(client_order_id) else {
            return;
        };
        order.status = status;
        order.time = Utc::now();
        if status == TradeStatus::Filled {
            order.filled_amount = order.amount;
            let price = fill_price.or(order.avg_fill_price).unwrap_or_default();
            order.avg_fill_price = Some(price);
            order.fee = Some(order.amount * price * self.config.fee_pct);
            let (symbol, signed) = (order.symbol.clone(), order.side.sign() * order.amount);
            *state.positions.entry(symbol).or_default() += signed;
        }
    }

    fn fill_price(&self, reference: Decimal, side: Side) -> Decimal {
        match side {
            Side::Buy => reference * (Decimal::ONE + self.config.slippage_pct),
            Side::Sell => reference * (Decimal::ONE - self.config.slippage_pct),
        }
    }
}

#[async_trait]
impl ExecutionClient for MockExchange {
    fn exchange(&self) -> ExchangeId {
        ExchangeId::Mock
    }

    async fn place_order(
        &self,
        request: &OrderRequest,
        client_order_id: &ClientOrderId,
    ) -> Result<OrderSnapshot, ExchangeError> {
        tokio::time::sleep(self.config.latency).await;

        let mut state = self.state.lock();
        if let Some(error) = state.fail_next_place.take() {
            return Err(error);
        }
        // Idempotency mirrors real venues: a duplicate client order id
        // returns the existing order instead of double-executing.
        if let Some(existing) = state.orders.get(client_order_id) {
            return Ok(existing.clone());
        }

        let reference = request
            .price
            .or_else(|| state.prices.get(&request.symbol).copied())
            .ok_or_else(|| {
                ExchangeError::Permanent(format!("no price for {}", request.symbol))
            })?;

        state.next_order_id += 1;
        let exchange_order_id = ExchangeOrderId::new(format!("mock-{}", state.next_order_id));

        let fills_now = request.kind == OrderKind::Market && !self.config.rest_orders_open;
        let snapshot = if fills_now {
            let price = self.fill_price(reference, request.side);
            let fee = request.amount * price * self.config.fee_pct;
            *state.positions.entry(request.symbol.clone()).or_default() +=
                request.side.sign() * request.amount;
            OrderSnapshot {
                exchange: ExchangeId::Mock,
                symbol: request.symbol.clone(),
                client_order_id: client_order_id.clone(),
                exchange_order_id,
                side: request.side,
                status: TradeStatus::Filled,
                amount: request.amount,
                filled_amount: request.amount,
                avg_fill_price: Some(price),
                fee: Some(fee),
                time: Utc::now(),
            }
        } else {
            OrderSnapshot {
                exchange: ExchangeId::Mock,
                symbol: request.symbol.clone(),
                client_order_id: client_order_id.clone(),
                exchange_order_id,
                side: request.side,
                status: TradeStatus::Open,
                amount: request.amount,
                filled_amount: Decimal::ZERO,
                avg_fill_price: request.price,
                fee: None,
                time: Utc::now(),
            }
        };

        info!(
            symbol = %snapshot.symbol,
            side = %snapshot.side,
            status = %snapshot.status,
            "mock exchange accepted order"
        );
        state
            .orders
            .insert(client_order_id.clone(), snapshot.clone());
        Ok(snapshot)
    }

    async fn cancel_order(
        &self,
        _symbol: &Symbol,
        client_order_id: &ClientOrderId,
    ) -> Result<OrderSnapshot, ExchangeError> {
        let mut state = self.state.lock();
        let order = state
            .orders
            .get_mut(client_order_id)
            .ok_or_else(|| ExchangeError::Permanent("unknown order".to_string()))?;
        if !order.status.is_terminal() {
            order.status = TradeStatus::Canceled;
            order.time = Utc::now();
        }
        Ok(order.clone())
    }

    async fn fetch_order(
        &self,
        _symbol: &Symbol,
        client_order_id: &ClientOrderId,
    ) -> Result<Option<OrderSnapshot>, ExchangeError> {
        Ok(self.state.lock().orders.get(client_order_id).cloned())
    }

    async fn open_orders(&self) -> Result<Vec<OrderSnapshot>, ExchangeError> {
        Ok(self
            .state
            .lock()
            .orders
            .values()
            .filter(|order| !order.status.is_terminal())
            .cloned()
            .collect())
    }

    async fn balances(&self) -> Result<Vec<AccountBalance>, ExchangeError> {
        Ok(self
            .state
            .lock()
            .balances
            .iter()
            .map(|(asset, amount)| AccountBalance::new(asset.clone(), *amount, Decimal::ZERO))
            .collect())
    }

    async fn positions(&self) -> Result<Vec<ExchangePosition>, ExchangeError> {
        let state = self.state.lock();
        Ok(state
            .positions
            .iter()
            .filter(|(_, amount)| !amount.is_zero())
            .map(|(symbol, amount)| {
                ExchangePosition::new(
                    symbol.clone(),
                    *amount,
                    state.prices.get(symbol).copied(),
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
        // Flat synthetic bars at the current reference price.
        let price = self
            .state
            .lock()
            .prices
            .get(symbol)
            .copied()
            .unwrap_or_default();
        let now = Utc::now();
        Ok((0..limit)
            .map(|offset| {
                let close_time = now - period.duration() * (limit - offset - 1) as i32;
                Candle {
                    period,
                    open_time: close_time - period.duration(),
                    close_time,
                    open: price,
                    high: price,
                    low: price,
                    close: price,
                    volume: Decimal::ZERO,
                    closed: true,
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use stratus_model::proposal::ProposalId;

    fn request(side: Side, kind: OrderKind) -> OrderRequest {
        OrderRequest {
            strategy_id: stratus_model::strategy::StrategyId(1),
            exchange: ExchangeId::Mock,
            symbol: Symbol::new("BTC/USDT"),
            side,
            kind,
            amount: dec!(0.02),
            price: None,
            stop_loss_price: None,
            take_profit_price: None,
        }
    }

    #[tokio::test]
    async fn test_market_order_fills_at_reference_price() {
        let exchange = MockExchange::default();
        exchange.set_price(&Symbol::new("BTC/USDT"), dec!(50010));

        let cid = ClientOrderId::from(ProposalId::random());
        let snapshot = exchange
            .place_order(&request(Side::Buy, OrderKind::Market), &cid)
            .await
            .unwrap();

        assert_eq!(snapshot.status, TradeStatus::Filled);
        assert_eq!(snapshot.avg_fill_price, Some(dec!(50010)));
        assert_eq!(
            exchange.positions().await.unwrap(),
            vec![ExchangePosition::new(
                Symbol::new("BTC/USDT"),
                dec!(0.02),
                Some(dec!(50010))
            )]
        );
    }

    #[tokio::test]
    async fn test_duplicate_client_order_id_is_idempotent() {
        let exchange = MockExchange::default();
        exchange.set_price(&Symbol::new("BTC/USDT"), dec!(100));

        let cid = ClientOrderId::from(ProposalId::random());
        let first = exchange
            .place_order(&request(Side::Buy, OrderKind::Market), &cid)
            .await
            .unwrap();
        let second = exchange
            .place_order(&request(Side::Buy, OrderKind::Market), &cid)
            .await
            .unwrap();

        assert_eq!(first.exchange_order_id, second.exchange_order_id);
        // Position applied once, not twice.
        assert_eq!(exchange.positions().await.unwrap()[0].amount, dec!(0.02));
    }

    #[tokio::test]
    async fn test_resting_order_lifecycle() {
        let exchange = MockExchange::new(MockExchangeConfig {
            rest_orders_open: true,
            ..MockExchangeConfig::default()
        });
        exchange.set_price(&Symbol::new("BTC/USDT"), dec!(100));

        let cid = ClientOrderId::from(ProposalId::random());
        let snapshot = exchange
            .place_order(&request(Side::Buy, OrderKind::Market), &cid)
            .await
            .unwrap();
        assert_eq!(snapshot.status, TradeStatus::Open);
        assert_eq!(exchange.open_orders().await.unwrap().len(), 1);

        exchange.complete_order(&cid, TradeStatus::Filled, Some(dec!(101)));
        let fetched = exchange
            .fetch_order(&Symbol::new("BTC/USDT"), &cid)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fetched.status, TradeStatus::Filled);
        assert_eq!(fetched.avg_fill_price, Some(dec!(101)));
        assert!(exchange.open_orders().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_scripted_failure_fires_once() {
        let exchange = MockExchange::default();
        exchange.set_price(&Symbol::new("BTC/USDT"), dec!(100));
        exchange.fail_next_place(ExchangeError::Transient("boom".to_string()));

        let cid = ClientOrderId::from(ProposalId::random());
        assert!(exchange
            .place_order(&request(Side::Buy, OrderKind::Market), &cid)
            .await
            .is_err());
        assert!(exchange
            .place_order(&request(Side::Buy, OrderKind::Market), &cid)
            .await
            .is_ok());
    }
}
