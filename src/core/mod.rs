mod aggregate;
mod annuity;
mod cola;
mod engine;
mod error;
mod mortality;
mod returns;
mod stacked;
mod tax;
mod types;
mod validation;

pub use aggregate::{confidence_table, confidence_thresholds, is_success};
pub use annuity::{AnnuityPayout, annuity_income};
pub use cola::InflationFactors;
pub use engine::{EngineContext, SimulationBatch};
pub use error::{Result, SimError};
pub use mortality::{Gender, MortalityImprovement, MortalityTable};
pub use returns::{ReturnGenerator, ReturnMatrix};
pub use stacked::{simulate, simulate_spending_level, simulate_with_inflation};
pub use tax::{
    FilingStatus, FlatRateTaxModel, TaxBatch, TaxBatchResult, TaxError, TaxOracle, UsState,
};
pub use types::{
    Annuity, CashflowYearResult, ConfidenceRow, ConfidenceThreshold, ConsumptionMode,
    HouseholdParams, MarketParams, Percentiles, RunOptions, Scenario, ScenarioResult,
    SimulationRequest, SpouseParams, YearlyFlowRecord,
};
pub use validation::validate_request;
