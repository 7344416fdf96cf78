use super::error::{Result, SimError};

// SSA uprating index (CPI-W based, CBO projections from 2025).
const SSA_UPRATING: &[(i32, f64)] = &[
    (2022, 268.421),
    (2023, 291.901),
    (2024, 301.236),
    (2025, 310.866),
    (2026, 318.155),
    (2027, 326.149),
    (2028, 332.241),
    (2029, 339.431),
    (2030, 346.917),
    (2031, 354.6),
    (2032, 362.579),
    (2033, 370.656),
    (2034, 379.028),
    (2035, 387.598),
];

// Chained CPI-U.
const C_CPI_U: &[(i32, f64)] = &[
    (2024, 171.910),
    (2025, 176.7),
    (2026, 180.5),
    (2027, 184.1),
    (2028, 187.8),
    (2029, 191.5),
    (2030, 195.3),
    (2031, 199.1),
    (2032, 203.1),
    (2033, 207.1),
    (2034, 211.2),
    (2035, 215.4),
];

const COLA_LONG_RUN_GROWTH: f64 = 0.022;
const CPI_LONG_RUN_GROWTH: f64 = 0.020;

/// Cumulative multipliers per simulation year; year 1 is always 1.0.
#[derive(Debug, Clone, PartialEq)]
pub struct InflationFactors {
    consumption: Vec<f64>,
    social_security: Vec<f64>,
}

impl InflationFactors {
    pub fn from_schedule(start_year: i32, n_years: u32) -> Result<Self> {
        Ok(Self {
            consumption: cumulative_factors(C_CPI_U, CPI_LONG_RUN_GROWTH, start_year, n_years)
                .map_err(|first| {
                    SimError::config(format!(
                        "start_year {start_year} precedes the consumption price index (first year {first})"
                    ))
                })?,
            social_security: cumulative_factors(
                SSA_UPRATING,
                COLA_LONG_RUN_GROWTH,
                start_year,
                n_years,
            )
            .map_err(|first| {
                SimError::config(format!(
                    "start_year {start_year} precedes the SSA uprating schedule (first year {first})"
                ))
            })?,
        })
    }

    pub fn flat(consumption_rate: f64, cola_rate: f64, n_years: u32) -> Self {
        let compound = |rate: f64| {
            (0..n_years)
                .map(|i| (1.0 + rate).powi(i as i32))
                .collect::<Vec<_>>()
        };
        Self {
            consumption: compound(consumption_rate),
            social_security: compound(cola_rate),
        }
    }

    pub fn n_years(&self) -> usize {
        self.consumption.len()
    }

    pub fn consumption(&self, year: u32) -> f64 {
        lookup(&self.consumption, year)
    }

    pub fn social_security(&self, year: u32) -> f64 {
        lookup(&self.social_security, year)
    }
}

fn lookup(factors: &[f64], year: u32) -> f64 {
    let idx = (year.max(1) - 1) as usize;
    factors
        .get(idx)
        .or_else(|| factors.last())
        .copied()
        .unwrap_or(1.0)
}

fn index_level(schedule: &[(i32, f64)], growth: f64, year: i32) -> Option<f64> {
    let (first_year, _) = schedule[0];
    let (last_year, last_value) = schedule[schedule.len() - 1];
    if year < first_year {
        return None;
    }
    if year > last_year {
        return Some(last_value * (1.0 + growth).powi(year - last_year));
    }
    schedule
        .iter()
        .find(|(y, _)| *y == year)
        .map(|(_, v)| *v)
}

fn cumulative_factors(
    schedule: &[(i32, f64)],
    growth: f64,
    start_year: i32,
    n_years: u32,
) -> std::result::Result<Vec<f64>, i32> {
    let first_year = schedule[0].0;
    let base = index_level(schedule, growth, start_year).ok_or(first_year)?;
    (0..n_years as i32)
        .map(|offset| {
            index_level(schedule, growth, start_year + offset)
                .map(|level| level / base)
                .ok_or(first_year)
        })
        .collect()
}
