use super::engine::{SimulationBatch, percentile};
use super::error::{Result, SimError};
use super::types::{
    CashflowYearResult, ConfidenceRow, ConfidenceThreshold, Percentiles, ScenarioResult,
};

/// A path succeeds when money remains at the horizon, whether or not the household survived.
pub fn is_success(final_portfolio: f64) -> bool {
    final_portfolio > 0.0
}

fn percentiles_of(values: &mut [f64]) -> Percentiles {
    Percentiles {
        p5: percentile(values, 5.0),
        p10: percentile(values, 10.0),
        p25: percentile(values, 25.0),
        p50: percentile(values, 50.0),
        p75: percentile(values, 75.0),
        p90: percentile(values, 90.0),
        p95: percentile(values, 95.0),
    }
}

/// Reduces one scenario's rows of a finished batch to summary statistics.
pub fn summarize_scenario(
    batch: &SimulationBatch,
    scenario: usize,
    name: &str,
    spending: f64,
    tax_calls: u32,
) -> ScenarioResult {
    let rows = batch.scenario_rows(scenario);
    let n = rows.len().max(1) as f64;

    let mut finals: Vec<f64> = rows.clone().map(|p| batch.portfolio(p)).collect();
    let successes = finals.iter().filter(|v| is_success(**v)).count();
    let alive = rows.clone().filter(|p| batch.is_alive(*p)).count();
    let mean_final = finals.iter().sum::<f64>() / n;

    let mut failure_year_counts = vec![0u32; batch.n_years()];
    for year in rows.clone().filter_map(|p| batch.failure_year(p)) {
        if let Some(count) = failure_year_counts.get_mut(year as usize - 1) {
            *count += 1;
        }
    }

    let mut estates: Vec<f64> = rows.filter_map(|p| batch.estate_at_death(p)).collect();
    let median_estate_at_death = if estates.is_empty() {
        None
    } else {
        Some(percentile(&mut estates, 50.0))
    };

    let percentiles = percentiles_of(&mut finals);

    ScenarioResult {
        scenario: name.to_string(),
        spending,
        success_rate: successes as f64 / n,
        median_final: percentiles.p50,
        percentiles,
        mean_final,
        alive_at_horizon_rate: alive as f64 / n,
        median_estate_at_death,
        failure_year_counts,
        tax_calls,
        cashflow_years: Vec::new(),
    }
}

/// Per-year samples of every recorded flow, one accumulator per scenario.
#[derive(Debug)]
pub struct YearlyAccumulator {
    ages: Vec<u32>,
    portfolio_end: Vec<Vec<f64>>,
    dividends: Vec<Vec<f64>>,
    annuity_income: Vec<Vec<f64>>,
    gross_withdrawal: Vec<Vec<f64>>,
    realized_gains: Vec<Vec<f64>>,
    tax_owed: Vec<Vec<f64>>,
    net_withdrawal: Vec<Vec<f64>>,
}

impl YearlyAccumulator {
    pub fn new(ages: Vec<u32>, expected_samples: usize) -> Self {
        let year_count = ages.len();
        let make = || {
            (0..year_count)
                .map(|_| Vec::with_capacity(expected_samples))
                .collect::<Vec<_>>()
        };

        Self {
            ages,
            portfolio_end: make(),
            dividends: make(),
            annuity_income: make(),
            gross_withdrawal: make(),
            realized_gains: make(),
            tax_owed: make(),
            net_withdrawal: make(),
        }
    }

    /// Records the rows of `scenario` for the year the batch just finished.
    pub fn record(&mut self, batch: &SimulationBatch, scenario: usize) {
        let index = batch.years_simulated() as usize;
        if index == 0 || index > self.ages.len() {
            return;
        }
        let index = index - 1;
        let flows = batch.last_flows();
        for path in batch.scenario_rows(scenario) {
            let flow = &flows[path];
            self.portfolio_end[index].push(batch.portfolio(path));
            self.dividends[index].push(flow.dividends);
            self.annuity_income[index].push(flow.annuity_income);
            self.gross_withdrawal[index].push(flow.gross_withdrawal);
            self.realized_gains[index].push(flow.realized_gains);
            self.tax_owed[index].push(flow.tax_owed);
            self.net_withdrawal[index].push(flow.net_withdrawal);
        }
    }

    pub fn finish(mut self) -> Vec<CashflowYearResult> {
        let median = |values: &mut Vec<f64>| percentile(values, 50.0);
        (0..self.ages.len())
            .map(|i| CashflowYearResult {
                year: i as u32 + 1,
                age: self.ages[i],
                median_portfolio_end: median(&mut self.portfolio_end[i]),
                median_dividends: median(&mut self.dividends[i]),
                median_annuity_income: median(&mut self.annuity_income[i]),
                median_gross_withdrawal: median(&mut self.gross_withdrawal[i]),
                median_realized_gains: median(&mut self.realized_gains[i]),
                median_tax_owed: median(&mut self.tax_owed[i]),
                median_net_withdrawal: median(&mut self.net_withdrawal[i]),
            })
            .collect()
    }
}

fn spending_at_confidence(points: &[(f64, f64)], target: f64) -> f64 {
    let mut best = 0;
    for (i, point) in points.iter().enumerate() {
        if point.1 > points[best].1 {
            best = i;
        }
    }
    if target > points[best].1 {
        return points[best].0;
    }

    let Some(i) = points.iter().rposition(|(_, rate)| *rate >= target) else {
        return points[best].0;
    };
    if i + 1 == points.len() {
        return points[i].0;
    }

    let (s_lo, r_lo) = points[i];
    let (s_hi, r_hi) = points[i + 1];
    s_lo + (r_lo - target) / (r_lo - r_hi) * (s_hi - s_lo)
}

/// Spending that achieves each target success rate (fractions, e.g. `0.9`), interpolated
/// over the sweep. Success is assumed non-increasing in spending.
pub fn confidence_thresholds(
    results: &[ScenarioResult],
    scenario: &str,
    levels: &[f64],
) -> Result<Vec<ConfidenceThreshold>> {
    let mut points: Vec<(f64, f64)> = results
        .iter()
        .filter(|r| r.scenario == scenario)
        .map(|r| (r.spending, r.success_rate))
        .collect();
    if points.is_empty() {
        return Err(SimError::UnknownScenario(scenario.to_string()));
    }
    points.sort_by(|a, b| a.0.total_cmp(&b.0));

    levels
        .iter()
        .map(|level| {
            if !(0.0..=1.0).contains(level) {
                return Err(SimError::config(format!(
                    "confidence level must be between 0 and 1, got {level}"
                )));
            }
            Ok(ConfidenceThreshold {
                confidence: *level,
                spending: spending_at_confidence(&points, *level),
            })
        })
        .collect()
}

/// Thresholds for every scenario, in order of first appearance in `results`.
pub fn confidence_table(results: &[ScenarioResult], levels: &[f64]) -> Result<Vec<ConfidenceRow>> {
    let mut names: Vec<&str> = Vec::new();
    for result in results {
        if !names.contains(&result.scenario.as_str()) {
            names.push(&result.scenario);
        }
    }
    names
        .into_iter()
        .map(|name| {
            Ok(ConfidenceRow {
                scenario: name.to_string(),
                thresholds: confidence_thresholds(results, name, levels)?,
            })
        })
        .collect()
}
