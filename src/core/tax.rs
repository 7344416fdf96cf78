use std::str::FromStr;

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum TaxError {
    #[error("tax service unavailable: {0}")]
    Unavailable(String),
    #[error("tax batch length mismatch: expected {expected}, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },
    #[error("tax oracle returned a non-finite value at row {index}")]
    NonFinite { index: usize },
    #[error("invalid filing status '{0}'")]
    InvalidFilingStatus(String),
    #[error("invalid state code '{0}'")]
    InvalidState(String),
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FilingStatus {
    Single,
    Joint,
    Separate,
    HeadOfHousehold,
    Widow,
}

impl FromStr for FilingStatus {
    type Err = TaxError;

    fn from_str(s: &str) -> Result<Self, TaxError> {
        match s.trim().to_ascii_uppercase().replace(['-', ' '], "_").as_str() {
            "SINGLE" => Ok(FilingStatus::Single),
            "JOINT" => Ok(FilingStatus::Joint),
            "SEPARATE" => Ok(FilingStatus::Separate),
            "HEAD_OF_HOUSEHOLD" => Ok(FilingStatus::HeadOfHousehold),
            "WIDOW" => Ok(FilingStatus::Widow),
            _ => Err(TaxError::InvalidFilingStatus(s.to_string())),
        }
    }
}

const STATE_CODES: [&str; 51] = [
    "AL", "AK", "AZ", "AR", "CA", "CO", "CT", "DE", "FL", "GA", "HI", "ID", "IL", "IN", "IA",
    "KS", "KY", "LA", "ME", "MD", "MA", "MI", "MN", "MS", "MO", "MT", "NE", "NV", "NH", "NJ",
    "NM", "NY", "NC", "ND", "OH", "OK", "OR", "PA", "RI", "SC", "SD", "TN", "TX", "UT", "VT",
    "VA", "WA", "WV", "WI", "WY", "DC",
];

/// Validated two-letter US state code (50 states plus DC).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct UsState(&'static str);

impl UsState {
    pub fn code(&self) -> &'static str {
        self.0
    }
}

impl FromStr for UsState {
    type Err = TaxError;

    fn from_str(s: &str) -> Result<Self, TaxError> {
        let upper = s.trim().to_ascii_uppercase();
        STATE_CODES
            .iter()
            .copied()
            .find(|code| *code == upper)
            .map(UsState)
            .ok_or_else(|| TaxError::InvalidState(s.to_string()))
    }
}

/// One year's tax inputs for every row of a stacked batch. All slices share a length.
#[derive(Debug, Clone, Copy)]
pub struct TaxBatch<'a> {
    pub capital_gains: &'a [f64],
    pub guaranteed_income: &'a [f64],
    pub dividends: &'a [f64],
    pub employment_income: &'a [f64],
    pub ages: &'a [u32],
    pub filing_status: FilingStatus,
}

impl TaxBatch<'_> {
    pub fn len(&self) -> usize {
        self.capital_gains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.capital_gains.is_empty()
    }

    pub fn check_lengths(&self) -> Result<(), TaxError> {
        let expected = self.len();
        for actual in [
            self.guaranteed_income.len(),
            self.dividends.len(),
            self.employment_income.len(),
            self.ages.len(),
        ] {
            if actual != expected {
                return Err(TaxError::LengthMismatch { expected, actual });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaxBatchResult {
    pub total_tax: Vec<f64>,
    pub federal_tax: Vec<f64>,
    pub state_tax: Vec<f64>,
}

/// Batch tax calculator. Implementations must be pure per call and accept any batch size.
pub trait TaxOracle: Sync {
    fn compute_batch_tax(&self, batch: &TaxBatch<'_>) -> Result<TaxBatchResult, TaxError>;
}

impl<T: TaxOracle + ?Sized> TaxOracle for &T {
    fn compute_batch_tax(&self, batch: &TaxBatch<'_>) -> Result<TaxBatchResult, TaxError> {
        (**self).compute_batch_tax(batch)
    }
}

/// Simplified flat-rate stand-in for an external tax service. It does not model the
/// tax code: ordinary income is employment plus a fixed share of guaranteed income,
/// less a standard deduction; gains and dividends are taxed at one preferential rate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FlatRateTaxModel {
    pub state: UsState,
    pub ordinary_rate: f64,
    pub preferential_rate: f64,
    pub state_rate: f64,
    pub taxable_guaranteed_share: f64,
    pub single_deduction: f64,
    pub senior_addition: f64,
}

impl FlatRateTaxModel {
    pub fn new(state: UsState) -> Self {
        Self {
            state,
            ordinary_rate: 0.12,
            preferential_rate: 0.15,
            state_rate: 0.0,
            taxable_guaranteed_share: 0.85,
            single_deduction: 15_000.0,
            senior_addition: 2_000.0,
        }
    }

    pub fn with_state_rate(mut self, rate: f64) -> Self {
        self.state_rate = rate;
        self
    }

    fn standard_deduction(&self, status: FilingStatus, age: u32) -> f64 {
        let base = match status {
            FilingStatus::Joint | FilingStatus::Widow => self.single_deduction * 2.0,
            FilingStatus::HeadOfHousehold => self.single_deduction * 1.5,
            FilingStatus::Single | FilingStatus::Separate => self.single_deduction,
        };
        if age >= 65 {
            base + self.senior_addition
        } else {
            base
        }
    }
}

impl TaxOracle for FlatRateTaxModel {
    fn compute_batch_tax(&self, batch: &TaxBatch<'_>) -> Result<TaxBatchResult, TaxError> {
        batch.check_lengths()?;
        let n = batch.len();
        let mut result = TaxBatchResult {
            total_tax: Vec::with_capacity(n),
            federal_tax: Vec::with_capacity(n),
            state_tax: Vec::with_capacity(n),
        };

        for i in 0..n {
            let deduction = self.standard_deduction(batch.filing_status, batch.ages[i]);
            let ordinary = batch.employment_income[i]
                + batch.guaranteed_income[i] * self.taxable_guaranteed_share;
            let preferential = batch.capital_gains[i] + batch.dividends[i];

            let ordinary_taxable = (ordinary - deduction).max(0.0);
            let leftover_deduction = (deduction - ordinary).max(0.0);
            let preferential_taxable = (preferential - leftover_deduction).max(0.0);

            let federal =
                ordinary_taxable * self.ordinary_rate + preferential_taxable * self.preferential_rate;
            let state = (ordinary_taxable + preferential_taxable) * self.state_rate;
            if !federal.is_finite() || !state.is_finite() {
                return Err(TaxError::NonFinite { index: i });
            }

            result.federal_tax.push(federal);
            result.state_tax.push(state);
            result.total_tax.push(federal + state);
        }

        Ok(result)
    }
}
