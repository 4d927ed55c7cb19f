use crate::{
    exchange::ExchangeId,
    instrument::Symbol,
    portfolio::ReservationId,
    proposal::ProposalId,
    strategy::StrategyId,
    Side,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

/// Primary key of a row in the `trades` journal.
#[derive(
    Debug,
    Copy,
    Clone,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    Deserialize,
    Serialize,
    derive_more::Display,
    derive_more::From,
    derive_more::Constructor,
)]
pub struct TradeId(pub i64);

/// Exchange assigned order id, unique once known.
#[derive(
    Debug,
    Clone,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    Deserialize,
    Serialize,
    derive_more::Display,
    derive_more::From,
)]
pub struct ExchangeOrderId(pub SmolStr);

impl ExchangeOrderId {
    pub fn new<S: AsRef<str>>(id: S) -> Self {
        Self(SmolStr::new(id))
    }
}

/// Client-side order id attached to exchange requests for idempotency.
///
/// Derived from the [`ProposalId`] so a retried submission can be recognised
/// by the exchange and by reconciliation.
#[derive(
    Debug,
    Clone,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    Deserialize,
    Serialize,
    derive_more::Display,
    derive_more::From,
)]
pub struct ClientOrderId(pub SmolStr);

impl ClientOrderId {
    pub fn new<S: AsRef<str>>(id: S) -> Self {
        Self(SmolStr::new(id))
    }
}

impl From<ProposalId> for ClientOrderId {
    fn from(value: ProposalId) -> Self {
        Self(SmolStr::new(value.0.simple().to_string()))
    }
}

/// Order flavour sent to the exchange.
#[derive(
    Debug,
    Copy,
    Clone,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    Deserialize,
    Serialize,
    derive_more::Display,
)]
#[serde(rename_all = "snake_case")]
pub enum OrderKind {
    Market,
    Limit,
}

/// A fully specified order, as approved by the Capital Manager.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, derive_more::Constructor)]
pub struct OrderRequest {
    pub strategy_id: StrategyId,
    pub exchange: ExchangeId,
    pub symbol: Symbol,
    pub side: Side,
    pub kind: OrderKind,
    pub amount: Decimal,
    /// Limit price; `None` for market orders.
    pub price: Option<Decimal>,
    pub stop_loss_price: Option<Decimal>,
    pub take_profit_price: Option<Decimal>,
}

impl OrderRequest {
    /// Quote-denominated notional of this order at the given reference price.
    pub fn notional(&self, reference_price: Decimal) -> Decimal {
        self.amount * self.price.unwrap_or(reference_price)
    }
}

/// The approved order command published on `commands.execute_trade`.
///
/// Carries the reservation so the connector's terminal event lets the Capital
/// Manager release or settle the earmarked capital.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, derive_more::Constructor)]
pub struct ExecuteTrade {
    pub proposal_id: ProposalId,
    pub reservation_id: ReservationId,
    pub order: OrderRequest,
    pub time: DateTime<Utc>,
}

/// Trade journal status machine, as observed by the connector:
///
/// ```text
/// pending -> submitted -> open -> {partial* -> filled | canceled | rejected | failed}
/// ```
///
/// Transitions are strictly forward; `partial` may repeat as fills accumulate.
/// Terminal statuses are write-once.
#[derive(
    Debug,
    Copy,
    Clone,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    Deserialize,
    Serialize,
    derive_more::Display,
)]
#[serde(rename_all = "snake_case")]
pub enum TradeStatus {
    Pending,
    Submitted,
    Open,
    Partial,
    Filled,
    Canceled,
    Rejected,
    Failed,
}

impl TradeStatus {
    /// True once no further transition is permitted.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TradeStatus::Filled | TradeStatus::Canceled | TradeStatus::Rejected | TradeStatus::Failed
        )
    }

    /// True while the order may still fill (reconciliation treats these as
    /// "open in DB").
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            TradeStatus::Pending | TradeStatus::Submitted | TradeStatus::Open | TradeStatus::Partial
        )
    }

    fn rank(&self) -> u8 {
        match self {
            TradeStatus::Pending => 0,
            TradeStatus::Submitted => 1,
            TradeStatus::Open => 2,
            TradeStatus::Partial => 3,
            TradeStatus::Filled
            | TradeStatus::Canceled
            | TradeStatus::Rejected
            | TradeStatus::Failed => 4,
        }
    }

    /// Whether the journal may move from `self` to `next`.
    ///
    /// Forward-only: a terminal status accepts nothing, and the only repeat
    /// allowed is `partial -> partial` while fills accumulate.
    pub fn can_transition_to(&self, next: TradeStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        if *self == TradeStatus::Partial && next == TradeStatus::Partial {
            return true;
        }
        next.rank() > self.rank()
    }
}

/// A row of the append-only `trades` journal.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct TradeRecord {
    pub id: TradeId,
    pub strategy_id: StrategyId,
    pub exchange: ExchangeId,
    pub symbol: Symbol,
    pub exchange_order_id: Option<ExchangeOrderId>,
    pub client_order_id: ClientOrderId,
    /// Capital reservation backing this order, while one exists.
    pub reservation_id: Option<ReservationId>,
    pub kind: OrderKind,
    pub side: Side,
    pub amount: Decimal,
    pub price: Option<Decimal>,
    pub filled_amount: Decimal,
    pub avg_fill_price: Option<Decimal>,
    pub fee: Option<Decimal>,
    /// PnL realised by this trade at settlement, when it reduced a position.
    pub realized_pnl: Option<Decimal>,
    pub status: TradeStatus,
    /// When the Capital Manager settled this trade into positions and the
    /// capital ledger. The write-once guard making event replay idempotent.
    pub settled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TradeRecord {
    /// Signed base quantity this trade contributes to a position.
    pub fn signed_fill(&self) -> Decimal {
        self.side.sign() * self.filled_amount
    }

    /// Quote-denominated realised value of the filled amount.
    pub fn fill_value(&self) -> Decimal {
        self.filled_amount * self.avg_fill_price.unwrap_or_default()
    }
}

/// Fill details carried by status updates and terminal events.
#[derive(Debug, Clone, Copy, PartialEq, Default, Deserialize, Serialize)]
pub struct FillInfo {
    pub filled_amount: Decimal,
    pub avg_fill_price: Option<Decimal>,
    pub fee: Option<Decimal>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_transitions_allowed() {
        use TradeStatus::*;
        assert!(Pending.can_transition_to(Submitted));
        assert!(Submitted.can_transition_to(Open));
        assert!(Open.can_transition_to(Partial));
        assert!(Partial.can_transition_to(Partial));
        assert!(Partial.can_transition_to(Filled));
        assert!(Pending.can_transition_to(Failed));
        assert!(Submitted.can_transition_to(Canceled));
    }

    #[test]
    fn test_backward_transitions_rejected() {
        use TradeStatus::*;
        assert!(!Open.can_transition_to(Submitted));
        assert!(!Partial.can_transition_to(Open));
        assert!(!Submitted.can_transition_to(Pending));
        assert!(!Submitted.can_transition_to(Submitted));
    }

    #[test]
    fn test_terminal_statuses_write_once() {
        use TradeStatus::*;
        for terminal in [Filled, Canceled, Rejected, Failed] {
            assert!(terminal.is_terminal());
            for next in [Pending, Submitted, Open, Partial, Filled, Canceled, Rejected, Failed] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_client_order_id_from_proposal_is_stable() {
        let proposal_id = ProposalId::random();
        assert_eq!(
            ClientOrderId::from(proposal_id),
            ClientOrderId::from(proposal_id)
        );
    }
}
