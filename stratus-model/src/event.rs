use crate::{
    error::ErrorKind,
    exchange::ExchangeId,
    instrument::Symbol,
    order::{ClientOrderId, ExchangeOrderId, FillInfo, TradeStatus},
    portfolio::ReservationId,
    proposal::ProposalId,
    strategy::StrategyId,
    Side,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

/// Terminal outcome published on `events.trade_executed` once an order reaches
/// `filled` or `canceled` on the exchange.
///
/// Consumers must be idempotent keyed by `exchange_order_id`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct TradeExecuted {
    pub proposal_id: ProposalId,
    pub reservation_id: Option<ReservationId>,
    pub strategy_id: StrategyId,
    pub exchange: ExchangeId,
    pub symbol: Symbol,
    pub side: Side,
    pub exchange_order_id: ExchangeOrderId,
    pub client_order_id: ClientOrderId,
    /// `Filled` or `Canceled`.
    pub status: TradeStatus,
    pub fill: FillInfo,
    pub time: DateTime<Utc>,
}

/// Terminal failure published on `events.trade_failed`. Exactly one is emitted
/// per failed order, with a stable [`ErrorKind`] and a human readable reason.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct TradeFailed {
    pub proposal_id: ProposalId,
    pub reservation_id: Option<ReservationId>,
    pub strategy_id: StrategyId,
    pub exchange: ExchangeId,
    pub symbol: Symbol,
    pub side: Side,
    pub kind: ErrorKind,
    pub reason: String,
    pub time: DateTime<Utc>,
}

/// Capital Manager refusal published on `events.capital.denied.<strategy_id>`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct CapitalDenied {
    pub proposal_id: ProposalId,
    pub strategy_id: StrategyId,
    /// Stable reason code: a rule name, `validation_failed` detail, or
    /// `insufficient_capital`.
    pub reason: SmolStr,
    pub detail: String,
    pub time: DateTime<Utc>,
}

/// Severity of an operator-facing [`Alert`].
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
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

/// Operator-facing notification published on `alerts.<code>`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, derive_more::Constructor)]
pub struct Alert {
    pub severity: AlertSeverity,
    /// Dotted code doubling as the routing-key suffix, eg/ `reconcile.orphan`.
    pub code: SmolStr,
    pub message: String,
    pub time: DateTime<Utc>,
}

impl Alert {
    pub fn warning(code: &str, message: impl Into<String>) -> Self {
        Self::new(AlertSeverity::Warning, SmolStr::new(code), message.into(), Utc::now())
    }

    pub fn critical(code: &str, message: impl Into<String>) -> Self {
        Self::new(AlertSeverity::Critical, SmolStr::new(code), message.into(), Utc::now())
    }
}

/// Liveness signal published periodically by every component on
/// `system.health.<component>`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, derive_more::Constructor)]
pub struct Heartbeat {
    pub component: SmolStr,
    pub time: DateTime<Utc>,
}

/// Published once on `system.ready` after reconciliation completes; the
/// connector refuses `commands.execute_trade` until it has observed this (or
/// the persisted ready flag).
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, derive_more::Constructor)]
pub struct SystemReady {
    pub time: DateTime<Utc>,
}

/// Operator command routed to the Core Engine on `commands.control.<op>`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum OperatorCommand {
    StartStrategy { id: StrategyId },
    StopStrategy { id: StrategyId },
    EmergencyHalt { reason: Option<String> },
    PortfolioStatus,
    StrategyList,
    ReconcileNow { orphan_policy: Option<OrphanPolicy> },
}

impl OperatorCommand {
    /// Routing-key suffix for `commands.control.<op>`.
    pub fn op(&self) -> &'static str {
        match self {
            OperatorCommand::StartStrategy { .. } => "start_strategy",
            OperatorCommand::StopStrategy { .. } => "stop_strategy",
            OperatorCommand::EmergencyHalt { .. } => "emergency_halt",
            OperatorCommand::PortfolioStatus => "portfolio_status",
            OperatorCommand::StrategyList => "strategy_list",
            OperatorCommand::ReconcileNow { .. } => "reconcile_now",
        }
    }
}

/// What reconciliation does with a position found on the exchange that the
/// journal knows nothing about.
#[derive(
    Debug,
    Copy,
    Clone,
    Eq,
    PartialEq,
    Deserialize,
    Serialize,
    derive_more::Display,
)]
#[serde(rename_all = "snake_case")]
pub enum OrphanPolicy {
    /// Synthesize a journal record attributed to the `manual` pseudo-strategy.
    Adopt,
    /// Refuse to trade until an operator issues `reconcile_now` with an
    /// explicit override.
    Freeze,
}

/// Graceful stop signal sent to a worker on `commands.worker.<strategy_id>`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum WorkerControl {
    Stop,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operator_command_serde() {
        let command = OperatorCommand::StartStrategy { id: StrategyId(7) };
        let json = serde_json::to_value(&command).unwrap();
        assert_eq!(json["op"], "start_strategy");
        assert_eq!(
            serde_json::from_value::<OperatorCommand>(json).unwrap(),
            command
        );
    }

    #[test]
    fn test_unknown_fields_ignored() {
        // Forward evolution: consumers must tolerate fields they do not know.
        let json = serde_json::json!({
            "component": "connector",
            "time": Utc::now(),
            "build": "v2.1.0"
        });
        assert!(serde_json::from_value::<Heartbeat>(json).is_ok());
    }
}
