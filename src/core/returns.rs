use rand::Rng;
use rand_distr::{StandardNormal, Uniform};
use tracing::warn;

use super::error::{Result, SimError};
use super::types::MarketParams;

const FAT_TAIL_MIN_SIGMA: f64 = 2.5;
const FAT_TAIL_MAX_SIGMA: f64 = 3.5;
const Z_CLAMP: f64 = 4.0;
const MIN_DISTINCT_FRACTION: f64 = 0.8;
const DEGENERATE_VOLATILITY: f64 = 1e-6;

/// Dense `[n_paths x n_years]` matrix of multiplicative growth factors, row-major by path.
#[derive(Debug, Clone, PartialEq)]
pub struct ReturnMatrix {
    n_paths: usize,
    n_years: usize,
    data: Vec<f64>,
}

impl ReturnMatrix {
    pub fn n_paths(&self) -> usize {
        self.n_paths
    }

    pub fn n_years(&self) -> usize {
        self.n_years
    }

    /// `year` is 1-based, matching the simulation year counter.
    pub fn factor(&self, path: usize, year: u32) -> f64 {
        self.data[path * self.n_years + (year as usize - 1)]
    }

    pub fn path(&self, path: usize) -> &[f64] {
        let start = path * self.n_years;
        &self.data[start..start + self.n_years]
    }

    fn path_mut(&mut self, path: usize) -> &mut [f64] {
        let start = path * self.n_years;
        &mut self.data[start..start + self.n_years]
    }
}

/// Geometric Brownian Motion price returns with injected fat-tail moves.
#[derive(Debug, Clone, Copy)]
pub struct ReturnGenerator {
    expected_return: f64,
    volatility: f64,
    fat_tail_probability: f64,
}

impl ReturnGenerator {
    pub fn new(market: &MarketParams) -> Result<Self> {
        if !market.volatility.is_finite() || market.volatility < 0.0 {
            return Err(SimError::config(format!(
                "volatility cannot be negative, got {}",
                market.volatility
            )));
        }
        if !market.expected_return.is_finite() {
            return Err(SimError::config("expected_return must be finite"));
        }
        if !(0.0..=1.0).contains(&market.fat_tail_probability) {
            return Err(SimError::config(format!(
                "fat_tail_probability must be between 0 and 1, got {}",
                market.fat_tail_probability
            )));
        }
        Ok(Self {
            expected_return: market.expected_return,
            volatility: market.volatility,
            fat_tail_probability: market.fat_tail_probability,
        })
    }

    fn drift(&self) -> f64 {
        self.expected_return - 0.5 * self.volatility * self.volatility
    }

    fn growth_factor(&self, z: f64) -> f64 {
        (self.drift() + self.volatility * z.clamp(-Z_CLAMP, Z_CLAMP)).exp()
    }

    pub fn generate<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        n_paths: usize,
        n_years: usize,
    ) -> ReturnMatrix {
        let cells = n_paths * n_years;

        let mut z: Vec<f64> = (0..cells).map(|_| rng.sample(StandardNormal)).collect();
        let fat_tail: Vec<bool> = (0..cells)
            .map(|_| rng.r#gen::<f64>() < self.fat_tail_probability)
            .collect();

        let magnitude = Uniform::new_inclusive(FAT_TAIL_MIN_SIGMA, FAT_TAIL_MAX_SIGMA);
        for (value, _) in z.iter_mut().zip(&fat_tail).filter(|(_, flagged)| **flagged) {
            let sign = if *value > 0.0 {
                1.0
            } else if *value < 0.0 {
                -1.0
            } else if rng.r#gen::<bool>() {
                1.0
            } else {
                -1.0
            };
            *value = sign * rng.sample(magnitude);
        }

        let mut matrix = ReturnMatrix {
            n_paths,
            n_years,
            data: z.into_iter().map(|v| self.growth_factor(v)).collect(),
        };

        if self.volatility > DEGENERATE_VOLATILITY {
            for path in 0..n_paths {
                if has_collapsed_values(matrix.path(path)) {
                    warn!(path, "return path had repeated values, regenerating");
                    self.regenerate_path(rng, matrix.path_mut(path));
                }
            }
        }

        matrix
    }

    fn regenerate_path<R: Rng + ?Sized>(&self, rng: &mut R, row: &mut [f64]) {
        for cell in row.iter_mut() {
            *cell = self.growth_factor(rng.sample(StandardNormal));
        }
    }
}

fn has_collapsed_values(row: &[f64]) -> bool {
    let mut rounded = row
        .iter()
        .map(|g| (g * 1e8).round() as i64)
        .collect::<Vec<_>>();
    rounded.sort_unstable();
    rounded.dedup();
    (rounded.len() as f64) < row.len() as f64 * MIN_DISTINCT_FRACTION
}
