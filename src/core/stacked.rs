use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use tracing::info;

use super::aggregate::{YearlyAccumulator, summarize_scenario};
use super::cola::InflationFactors;
use super::engine::{EngineContext, SimulationBatch};
use super::error::Result;
use super::mortality::MortalityTable;
use super::returns::ReturnGenerator;
use super::tax::TaxOracle;
use super::types::{ScenarioResult, SimulationRequest};
use super::validation::validate_request;

/// Runs every scenario stacked into one batch at a single spending level.
/// The oracle is called at most once per simulated year.
pub fn simulate_spending_level<T: TaxOracle + ?Sized>(
    request: &SimulationRequest,
    inflation: &InflationFactors,
    spending: f64,
    oracle: &T,
) -> Result<Vec<ScenarioResult>> {
    let n_years = request.n_years as usize;
    let paths_per_scenario = request.n_paths_per_scenario as usize;
    let household = &request.household;

    let mut batch = SimulationBatch::new(&request.scenarios, paths_per_scenario, n_years);
    info!(
        spending,
        scenarios = request.scenarios.len(),
        paths = batch.n_paths(),
        years = n_years,
        "starting spending level"
    );

    let mut rng = ChaCha8Rng::seed_from_u64(request.random_seed);
    let returns = ReturnGenerator::new(&request.market)?.generate(&mut rng, batch.n_paths(), n_years);

    let primary_mortality = MortalityTable::ssa(household.gender);
    let spouse_mortality = household
        .spouse
        .as_ref()
        .map(|spouse| MortalityTable::ssa(spouse.gender));

    let ctx = EngineContext {
        scenarios: &request.scenarios,
        market: &request.market,
        household,
        spending,
        start_year: request.start_year,
        inflation,
        primary_mortality: &primary_mortality,
        spouse_mortality: spouse_mortality.as_ref(),
        returns: &returns,
    };

    let mut accumulators: Vec<YearlyAccumulator> = if request.options.record_cashflows {
        let ages: Vec<u32> = (1..=request.n_years)
            .map(|year| household.current_age + year)
            .collect();
        request
            .scenarios
            .iter()
            .map(|_| YearlyAccumulator::new(ages.clone(), paths_per_scenario))
            .collect()
    } else {
        Vec::new()
    };

    let mut tax_calls = 0u32;
    for _ in 0..n_years {
        if batch.step_year(&ctx, &mut rng, oracle)? {
            tax_calls += 1;
        }
        for (scenario, accumulator) in accumulators.iter_mut().enumerate() {
            accumulator.record(&batch, scenario);
        }
    }

    let mut results: Vec<ScenarioResult> = request
        .scenarios
        .iter()
        .enumerate()
        .map(|(index, scenario)| {
            summarize_scenario(&batch, index, &scenario.name, spending, tax_calls)
        })
        .collect();
    for (result, accumulator) in results.iter_mut().zip(accumulators) {
        result.cashflow_years = accumulator.finish();
    }

    info!(spending, tax_calls, "finished spending level");
    Ok(results)
}

/// Full sweep using the built-in COLA and price-index schedules.
pub fn simulate<T: TaxOracle + ?Sized>(
    request: &SimulationRequest,
    oracle: &T,
) -> Result<Vec<ScenarioResult>> {
    validate_request(request)?;
    let inflation = InflationFactors::from_schedule(request.start_year, request.n_years)?;
    run_sweep(request, &inflation, oracle)
}

/// Full sweep with caller-supplied inflation factors.
pub fn simulate_with_inflation<T: TaxOracle + ?Sized>(
    request: &SimulationRequest,
    inflation: &InflationFactors,
    oracle: &T,
) -> Result<Vec<ScenarioResult>> {
    validate_request(request)?;
    run_sweep(request, inflation, oracle)
}

// Results are ordered by spending level, then scenario, whatever the thread schedule.
fn run_sweep<T: TaxOracle + ?Sized>(
    request: &SimulationRequest,
    inflation: &InflationFactors,
    oracle: &T,
) -> Result<Vec<ScenarioResult>> {
    let per_level: Vec<Vec<ScenarioResult>> = if request.options.parallel {
        request
            .spending_levels
            .par_iter()
            .map(|spending| simulate_spending_level(request, inflation, *spending, oracle))
            .collect::<Result<_>>()?
    } else {
        request
            .spending_levels
            .iter()
            .map(|spending| simulate_spending_level(request, inflation, *spending, oracle))
            .collect::<Result<_>>()?
    };
    Ok(per_level.into_iter().flatten().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::annuity::AnnuityPayout;
    use crate::core::error::SimError;
    use crate::core::tax::{FlatRateTaxModel, TaxBatch, TaxBatchResult, TaxError};
    use crate::core::types::{
        Annuity, HouseholdParams, MarketParams, RunOptions, Scenario,
    };
    use std::sync::atomic::{AtomicU32, Ordering};

    fn assert_approx(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() <= 1e-6,
            "expected {expected}, got {actual}"
        );
    }

    fn oracle() -> FlatRateTaxModel {
        FlatRateTaxModel::new("TX".parse().expect("valid state"))
    }

    fn sample_request() -> SimulationRequest {
        SimulationRequest {
            scenarios: vec![
                Scenario::new("portfolio only", 800_000.0),
                Scenario::new("with annuity", 600_000.0).with_annuity(Annuity {
                    payout: AnnuityPayout::LifeContingentWithGuarantee,
                    annual_amount: 15_000.0,
                    guarantee_years: 10,
                }),
            ],
            spending_levels: vec![40_000.0, 60_000.0, 80_000.0],
            n_years: 25,
            n_paths_per_scenario: 200,
            start_year: 2025,
            market: MarketParams::default(),
            household: HouseholdParams::default(),
            random_seed: 42,
            options: RunOptions::default(),
        }
    }

    struct CountingTax {
        calls: AtomicU32,
    }

    impl TaxOracle for CountingTax {
        fn compute_batch_tax(
            &self,
            batch: &TaxBatch<'_>,
        ) -> std::result::Result<TaxBatchResult, TaxError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(TaxBatchResult {
                total_tax: vec![0.0; batch.len()],
                federal_tax: vec![0.0; batch.len()],
                state_tax: vec![0.0; batch.len()],
            })
        }
    }

    struct DownTax;

    impl TaxOracle for DownTax {
        fn compute_batch_tax(
            &self,
            _batch: &TaxBatch<'_>,
        ) -> std::result::Result<TaxBatchResult, TaxError> {
            Err(TaxError::Unavailable("connection refused".to_string()))
        }
    }

    #[test]
    fn results_are_ordered_by_spending_then_scenario() {
        let results = simulate(&sample_request(), &oracle()).expect("valid run");
        assert_eq!(results.len(), 6);
        let keys: Vec<(f64, &str)> = results
            .iter()
            .map(|r| (r.spending, r.scenario.as_str()))
            .collect();
        assert_eq!(keys[0], (40_000.0, "portfolio only"));
        assert_eq!(keys[1], (40_000.0, "with annuity"));
        assert_eq!(keys[5], (80_000.0, "with annuity"));
    }

    #[test]
    fn parallel_and_sequential_runs_are_identical() {
        let mut request = sample_request();
        let parallel = simulate(&request, &oracle()).expect("valid run");
        request.options.parallel = false;
        let sequential = simulate(&request, &oracle()).expect("valid run");
        for (a, b) in parallel.iter().zip(&sequential) {
            assert_eq!(a.success_rate, b.success_rate);
            assert_eq!(a.percentiles, b.percentiles);
            assert_eq!(a.failure_year_counts, b.failure_year_counts);
        }
    }

    #[test]
    fn success_rate_falls_as_spending_rises() {
        let results = simulate(&sample_request(), &oracle()).expect("valid run");
        let base: Vec<f64> = results
            .iter()
            .filter(|r| r.scenario == "portfolio only")
            .map(|r| r.success_rate)
            .collect();
        assert!(base[0] >= base[1] && base[1] >= base[2], "{base:?}");
    }

    #[test]
    fn one_tax_call_per_year_per_spending_level() {
        let mut request = sample_request();
        request.household.include_mortality = false;
        let counter = CountingTax {
            calls: AtomicU32::new(0),
        };
        let results = simulate(&request, &counter).expect("valid run");
        let levels = request.spending_levels.len() as u32;
        assert!(counter.calls.load(Ordering::SeqCst) <= request.n_years * levels);
        assert!(results.iter().all(|r| r.tax_calls <= request.n_years));
        assert_eq!(
            counter.calls.load(Ordering::SeqCst),
            results
                .iter()
                .step_by(request.scenarios.len())
                .map(|r| r.tax_calls)
                .sum::<u32>()
        );
    }

    #[test]
    fn oracle_failure_aborts_the_run() {
        let err = simulate(&sample_request(), &DownTax).expect_err("must fail");
        assert!(matches!(err, SimError::Tax(TaxError::Unavailable(_))));
    }

    #[test]
    fn invalid_request_fails_before_any_tax_call() {
        let mut request = sample_request();
        request.market.volatility = -0.2;
        let counter = CountingTax {
            calls: AtomicU32::new(0),
        };
        let err = simulate(&request, &counter).expect_err("must fail");
        assert!(err.to_string().contains("volatility"));
        assert_eq!(counter.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn cashflow_trace_is_recorded_on_request() {
        let mut request = sample_request();
        request.spending_levels = vec![50_000.0];
        request.options.record_cashflows = true;
        let results = simulate(&request, &oracle()).expect("valid run");
        for result in &results {
            assert_eq!(result.cashflow_years.len(), 25);
            assert_eq!(result.cashflow_years[0].year, 1);
            assert_eq!(result.cashflow_years[0].age, 66);
        }
        assert_approx(results[1].cashflow_years[0].median_annuity_income, 15_000.0);
        assert_approx(results[0].cashflow_years[0].median_annuity_income, 0.0);
    }

    #[test]
    fn flat_inflation_keeps_depletion_deterministic() {
        let request = SimulationRequest {
            scenarios: vec![Scenario::new("small", 10_000.0)],
            spending_levels: vec![70_000.0],
            n_years: 5,
            n_paths_per_scenario: 100,
            start_year: 2025,
            market: MarketParams::default(),
            household: HouseholdParams {
                include_mortality: false,
                ..HouseholdParams::default()
            },
            random_seed: 3,
            options: RunOptions::default(),
        };
        let inflation = InflationFactors::flat(0.0, 0.0, 5);
        let results = simulate_with_inflation(&request, &inflation, &oracle()).expect("valid");
        assert_eq!(results[0].success_rate, 0.0);
        assert_eq!(results[0].failure_year_counts[0], 100);
    }
}
