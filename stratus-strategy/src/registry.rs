use crate::{
    strategies::{Dca, RsiReversion, SmaCross},
    Strategy, StrategyError,
};
use stratus_model::strategy::StrategyRecord;

/// Construct the compiled-in strategy selected by the record's
/// `strategy_type` tag.
///
/// Strategies ship as a statically registered set - there is no runtime
/// plugin loading. Unknown tags fail construction, which the supervising
/// engine surfaces as a halted strategy rather than a crash loop.
pub fn build(record: &StrategyRecord) -> Result<Box<dyn Strategy>, StrategyError> {
    match record.strategy_type.as_str() {
        SmaCross::TYPE => Ok(Box::new(SmaCross::new(record)?)),
        RsiReversion::TYPE => Ok(Box::new(RsiReversion::new(record)?)),
        Dca::TYPE => Ok(Box::new(Dca::new(record)?)),
        other => Err(StrategyError::UnknownType(other.to_string())),
    }
}

/// The registered `strategy_type` tags, for operator listings.
pub fn registered_types() -> &'static [&'static str] {
    &[SmaCross::TYPE, RsiReversion::TYPE, Dca::TYPE]
}
