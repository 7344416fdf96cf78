use std::collections::HashSet;

use super::cola::InflationFactors;
use super::error::{Result, SimError};
use super::types::SimulationRequest;

const MAX_PATHS: u32 = 100_000;
const MAX_YEARS: u32 = 100;
const MAX_SPENDING: f64 = 10_000_000.0;
const MAX_PORTFOLIO: f64 = 1e10;
const MAX_SOCIAL_SECURITY: f64 = 200_000.0;
const MAX_PENSION: f64 = 1_000_000.0;
const MAX_EMPLOYMENT: f64 = 10_000_000.0;
const MAX_ANNUITY: f64 = 1_000_000.0;
const MAX_GUARANTEE_YEARS: u32 = 50;
const MIN_AGE: u32 = 18;
const MAX_AGE: u32 = 120;
const MAX_RETIREMENT_AGE: u32 = 100;

fn check_range(name: &str, value: f64, min: f64, max: f64) -> Result<()> {
    if !value.is_finite() || value < min || value > max {
        return Err(SimError::config(format!(
            "{name} must be between {min} and {max}, got {value}"
        )));
    }
    Ok(())
}

fn check_age(name: &str, value: u32) -> Result<()> {
    if !(MIN_AGE..=MAX_AGE).contains(&value) {
        return Err(SimError::config(format!(
            "{name} must be between {MIN_AGE} and {MAX_AGE}, got {value}"
        )));
    }
    Ok(())
}

fn check_retirement_age(name: &str, retirement_age: u32, current_age: u32) -> Result<()> {
    if retirement_age < current_age {
        return Err(SimError::config(format!(
            "{name} must be >= current age {current_age}, got {retirement_age}"
        )));
    }
    if retirement_age > MAX_RETIREMENT_AGE {
        return Err(SimError::config(format!(
            "{name} must be <= {MAX_RETIREMENT_AGE}, got {retirement_age}"
        )));
    }
    Ok(())
}

/// Rejects a request before any random draws or oracle calls are made.
pub fn validate_request(request: &SimulationRequest) -> Result<()> {
    if !(1..=MAX_PATHS).contains(&request.n_paths_per_scenario) {
        return Err(SimError::config(format!(
            "n_paths_per_scenario must be between 1 and {MAX_PATHS}, got {}",
            request.n_paths_per_scenario
        )));
    }
    if !(1..=MAX_YEARS).contains(&request.n_years) {
        return Err(SimError::config(format!(
            "n_years must be between 1 and {MAX_YEARS}, got {}",
            request.n_years
        )));
    }

    if request.spending_levels.is_empty() {
        return Err(SimError::EmptySweep);
    }
    for spending in &request.spending_levels {
        check_range("spending level", *spending, 0.0, MAX_SPENDING)?;
    }

    if request.scenarios.is_empty() {
        return Err(SimError::config("at least one scenario is required"));
    }
    let mut names = HashSet::new();
    for scenario in &request.scenarios {
        if scenario.name.trim().is_empty() {
            return Err(SimError::config("scenario name cannot be empty"));
        }
        if !names.insert(scenario.name.as_str()) {
            return Err(SimError::config(format!(
                "duplicate scenario name '{}'",
                scenario.name
            )));
        }
        check_range(
            "initial_portfolio",
            scenario.initial_portfolio,
            0.0,
            MAX_PORTFOLIO,
        )?;
        if let Some(annuity) = &scenario.annuity {
            check_range("annuity amount", annuity.annual_amount, 0.0, MAX_ANNUITY)?;
            if annuity.guarantee_years > MAX_GUARANTEE_YEARS {
                return Err(SimError::config(format!(
                    "annuity guarantee years must be <= {MAX_GUARANTEE_YEARS}, got {}",
                    annuity.guarantee_years
                )));
            }
        }
    }

    let household = &request.household;
    check_age("current_age", household.current_age)?;
    check_retirement_age(
        "retirement_age",
        household.retirement_age,
        household.current_age,
    )?;
    check_range(
        "social_security",
        household.social_security,
        0.0,
        MAX_SOCIAL_SECURITY,
    )?;
    check_range("pension", household.pension, 0.0, MAX_PENSION)?;
    check_range(
        "employment_income",
        household.employment_income,
        0.0,
        MAX_EMPLOYMENT,
    )?;
    check_range(
        "employment_growth_rate",
        household.employment_growth_rate,
        -0.5,
        0.5,
    )?;

    if let Some(spouse) = &household.spouse {
        check_age("spouse age", spouse.age)?;
        check_retirement_age("spouse retirement age", spouse.retirement_age, spouse.age)?;
        check_range(
            "spouse social_security",
            spouse.social_security,
            0.0,
            MAX_SOCIAL_SECURITY,
        )?;
        check_range("spouse pension", spouse.pension, 0.0, MAX_PENSION)?;
        check_range(
            "spouse employment_income",
            spouse.employment_income,
            0.0,
            MAX_EMPLOYMENT,
        )?;
        check_range(
            "spouse employment_growth_rate",
            spouse.employment_growth_rate,
            -0.5,
            0.5,
        )?;
    }

    let market = &request.market;
    check_range("expected_return", market.expected_return, -0.5, 0.5)?;
    if market.volatility < 0.0 {
        return Err(SimError::config(format!(
            "volatility cannot be negative, got {}",
            market.volatility
        )));
    }
    check_range("volatility", market.volatility, 0.0, 1.0)?;
    check_range("dividend_yield", market.dividend_yield, 0.0, 0.2)?;
    check_range(
        "fat_tail_probability",
        market.fat_tail_probability,
        0.0,
        1.0,
    )?;

    InflationFactors::from_schedule(request.start_year, request.n_years)?;

    Ok(())
}
