// =============================================================================
// Consolidated state — model, events, and the single-writer aggregator
// =============================================================================

pub mod aggregator;
pub mod events;
pub mod model;

pub use aggregator::{Aggregator, ChangeNotice};
pub use events::{EmergencyNotice, EngineEvent};
pub use model::{
    AccountSummary, ConsolidatedState, MarketTicker, OrderRecord, PositionRecord, StrategyRunState,
    StrategyStatus,
};
