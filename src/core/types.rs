use serde::Serialize;

use super::annuity::AnnuityPayout;
use super::mortality::{Gender, MortalityImprovement};
use super::tax::FilingStatus;

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Annuity {
    pub payout: AnnuityPayout,
    pub annual_amount: f64,
    pub guarantee_years: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Scenario {
    pub name: String,
    pub initial_portfolio: f64,
    pub annuity: Option<Annuity>,
}

impl Scenario {
    pub fn new(name: impl Into<String>, initial_portfolio: f64) -> Self {
        Self {
            name: name.into(),
            initial_portfolio,
            annuity: None,
        }
    }

    pub fn with_annuity(mut self, annuity: Annuity) -> Self {
        self.annuity = Some(annuity);
        self
    }

    pub fn has_annuity(&self) -> bool {
        self.annuity.is_some()
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct MarketParams {
    pub expected_return: f64,
    pub volatility: f64,
    pub dividend_yield: f64,
    pub fat_tail_probability: f64,
}

impl Default for MarketParams {
    fn default() -> Self {
        Self {
            expected_return: 0.07,
            volatility: 0.18,
            dividend_yield: 0.018,
            fat_tail_probability: 0.02,
        }
    }
}

/// How a spending level is interpreted when sizing withdrawals.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ConsumptionMode {
    /// Total consumption; guaranteed income is netted out each year.
    Gross,
    /// Already net of guaranteed income.
    Net,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct SpouseParams {
    pub age: u32,
    pub gender: Gender,
    pub social_security: f64,
    pub pension: f64,
    pub employment_income: f64,
    pub retirement_age: u32,
    pub employment_growth_rate: f64,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct HouseholdParams {
    pub current_age: u32,
    pub gender: Gender,
    pub social_security: f64,
    pub pension: f64,
    pub employment_income: f64,
    pub employment_growth_rate: f64,
    pub retirement_age: u32,
    pub include_mortality: bool,
    pub mortality_improvement: Option<MortalityImprovement>,
    pub consumption_mode: ConsumptionMode,
    pub spouse: Option<SpouseParams>,
}

impl Default for HouseholdParams {
    fn default() -> Self {
        Self {
            current_age: 65,
            gender: Gender::Male,
            social_security: 24_000.0,
            pension: 0.0,
            employment_income: 0.0,
            employment_growth_rate: 0.0,
            retirement_age: 65,
            include_mortality: true,
            mortality_improvement: None,
            consumption_mode: ConsumptionMode::Gross,
            spouse: None,
        }
    }
}

impl HouseholdParams {
    pub fn filing_status(&self) -> FilingStatus {
        if self.spouse.is_some() {
            FilingStatus::Joint
        } else {
            FilingStatus::Single
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct RunOptions {
    pub record_cashflows: bool,
    pub parallel: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            record_cashflows: false,
            parallel: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SimulationRequest {
    pub scenarios: Vec<Scenario>,
    pub spending_levels: Vec<f64>,
    pub n_years: u32,
    pub n_paths_per_scenario: u32,
    pub start_year: i32,
    pub market: MarketParams,
    pub household: HouseholdParams,
    pub random_seed: u64,
    pub options: RunOptions,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Percentiles {
    pub p5: f64,
    pub p10: f64,
    pub p25: f64,
    pub p50: f64,
    pub p75: f64,
    pub p90: f64,
    pub p95: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct YearlyFlowRecord {
    pub dividends: f64,
    pub annuity_income: f64,
    pub gross_withdrawal: f64,
    pub realized_gains: f64,
    pub tax_owed: f64,
    pub net_withdrawal: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CashflowYearResult {
    pub year: u32,
    pub age: u32,
    pub median_portfolio_end: f64,
    pub median_dividends: f64,
    pub median_annuity_income: f64,
    pub median_gross_withdrawal: f64,
    pub median_realized_gains: f64,
    pub median_tax_owed: f64,
    pub median_net_withdrawal: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioResult {
    pub scenario: String,
    pub spending: f64,
    pub success_rate: f64,
    pub percentiles: Percentiles,
    pub median_final: f64,
    pub mean_final: f64,
    pub alive_at_horizon_rate: f64,
    pub median_estate_at_death: Option<f64>,
    pub failure_year_counts: Vec<u32>,
    pub tax_calls: u32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub cashflow_years: Vec<CashflowYearResult>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfidenceThreshold {
    pub confidence: f64,
    pub spending: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfidenceRow {
    pub scenario: String,
    pub thresholds: Vec<ConfidenceThreshold>,
}
