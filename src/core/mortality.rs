use std::str::FromStr;

use super::error::{Result, SimError};

pub const CEILING_AGE: u32 = 120;

// 2021 SSA period life table, qx by exact age.
#[rustfmt::skip]
const SSA_MALE_2021: &[(u32, f64)] = &[
    (18, 0.00082), (19, 0.00093), (20, 0.00104), (21, 0.00115), (22, 0.00126), (23, 0.00135),
    (24, 0.00143), (25, 0.00150), (26, 0.00157), (27, 0.00164), (28, 0.00171), (29, 0.00179),
    (30, 0.00187), (31, 0.00196), (32, 0.00206), (33, 0.00217), (34, 0.00229), (35, 0.00241),
    (36, 0.00255), (37, 0.00270), (38, 0.00286), (39, 0.00303), (40, 0.00322), (41, 0.00342),
    (42, 0.00365), (43, 0.00389), (44, 0.00416), (45, 0.00446), (46, 0.00478), (47, 0.00513),
    (48, 0.00552), (49, 0.00594), (50, 0.00533), (51, 0.00581), (52, 0.00632), (53, 0.00686),
    (54, 0.00743), (55, 0.00803), (56, 0.00867), (57, 0.00934), (58, 0.01005), (59, 0.01079),
    (60, 0.01158), (61, 0.01241), (62, 0.01328), (63, 0.01421), (64, 0.01519), (65, 0.01604),
    (66, 0.01753), (67, 0.01912), (68, 0.02084), (69, 0.02271), (70, 0.02476), (71, 0.02700),
    (72, 0.02946), (73, 0.03217), (74, 0.03515), (75, 0.03843), (76, 0.04204), (77, 0.04603),
    (78, 0.05043), (79, 0.05530), (80, 0.06069), (81, 0.06665), (82, 0.07326), (83, 0.08058),
    (84, 0.08868), (85, 0.09764), (86, 0.10753), (87, 0.11845), (88, 0.13048), (89, 0.14373),
    (90, 0.15829), (91, 0.17427), (92, 0.19178), (93, 0.21093), (94, 0.23182), (95, 0.25457),
    (96, 0.27930), (97, 0.30612), (98, 0.33515), (99, 0.36651), (100, 0.40032), (101, 0.43672),
    (102, 0.47572), (103, 0.51737), (104, 0.56168), (105, 0.60868), (106, 0.65839),
    (107, 0.71084), (108, 0.76606), (109, 0.82407), (110, 0.88489), (111, 0.94855),
    (112, 1.00000), (113, 1.00000), (114, 1.00000), (115, 1.00000), (116, 1.00000),
    (117, 1.00000), (118, 1.00000), (119, 1.00000), (120, 1.00000),
];

#[rustfmt::skip]
const SSA_FEMALE_2021: &[(u32, f64)] = &[
    (18, 0.00033), (19, 0.00034), (20, 0.00036), (21, 0.00038), (22, 0.00040), (23, 0.00042),
    (24, 0.00044), (25, 0.00046), (26, 0.00049), (27, 0.00052), (28, 0.00055), (29, 0.00059),
    (30, 0.00063), (31, 0.00067), (32, 0.00072), (33, 0.00077), (34, 0.00082), (35, 0.00088),
    (36, 0.00095), (37, 0.00102), (38, 0.00110), (39, 0.00119), (40, 0.00128), (41, 0.00139),
    (42, 0.00150), (43, 0.00163), (44, 0.00177), (45, 0.00192), (46, 0.00208), (47, 0.00226),
    (48, 0.00246), (49, 0.00267), (50, 0.00324), (51, 0.00352), (52, 0.00383), (53, 0.00417),
    (54, 0.00454), (55, 0.00494), (56, 0.00537), (57, 0.00584), (58, 0.00634), (59, 0.00689),
    (60, 0.00748), (61, 0.00812), (62, 0.00881), (63, 0.00955), (64, 0.01035), (65, 0.01052),
    (66, 0.01146), (67, 0.01251), (68, 0.01368), (69, 0.01498), (70, 0.01642), (71, 0.01803),
    (72, 0.01983), (73, 0.02183), (74, 0.02406), (75, 0.02653), (76, 0.02927), (77, 0.03232),
    (78, 0.03570), (79, 0.03947), (80, 0.04365), (81, 0.04830), (82, 0.05345), (83, 0.05916),
    (84, 0.06548), (85, 0.07247), (86, 0.08019), (87, 0.08872), (88, 0.09812), (89, 0.10849),
    (90, 0.11991), (91, 0.13247), (92, 0.14627), (93, 0.16142), (94, 0.17802), (95, 0.19620),
    (96, 0.21605), (97, 0.23770), (98, 0.26127), (99, 0.28689), (100, 0.31467), (101, 0.34475),
    (102, 0.37715), (103, 0.41190), (104, 0.44903), (105, 0.48856), (106, 0.53051),
    (107, 0.57491), (108, 0.62177), (109, 0.67113), (110, 0.72299), (111, 0.77738),
    (112, 0.83432), (113, 0.89384), (114, 0.95595), (115, 1.00000), (116, 1.00000),
    (117, 1.00000), (118, 1.00000), (119, 1.00000), (120, 1.00000),
];

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Gender {
    Male,
    Female,
}

impl FromStr for Gender {
    type Err = SimError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "male" | "m" => Ok(Gender::Male),
            "female" | "f" => Ok(Gender::Female),
            other => Err(SimError::config(format!(
                "invalid gender '{other}', must be 'Male' or 'Female'"
            ))),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct MortalityImprovement {
    pub base_year: i32,
    pub annual_improvement: f64,
    pub max_improvement_age: u32,
    pub socioeconomic_multiplier: f64,
}

impl Default for MortalityImprovement {
    fn default() -> Self {
        Self {
            base_year: 2021,
            annual_improvement: 0.01,
            max_improvement_age: 85,
            socioeconomic_multiplier: 1.0,
        }
    }
}

impl MortalityImprovement {
    fn improvement_rate(&self, age: u32) -> f64 {
        if age <= self.max_improvement_age {
            return self.annual_improvement;
        }
        let span = CEILING_AGE.saturating_sub(self.max_improvement_age);
        if span == 0 {
            return 0.0;
        }
        let remaining = CEILING_AGE.saturating_sub(age) as f64;
        self.annual_improvement * (remaining / span as f64).max(0.0)
    }

    /// Multiplier applied to a base rate for `age` observed in `year`.
    pub fn multiplier(&self, age: u32, year: i32) -> f64 {
        let years_in_future = year - self.base_year;
        let factor = (1.0 - self.improvement_rate(age)).powi(years_in_future);
        factor * self.socioeconomic_multiplier
    }
}

/// Sparse age -> annual death probability table with linear interpolation.
#[derive(Debug, Clone, PartialEq)]
pub struct MortalityTable {
    points: Vec<(u32, f64)>,
}

impl MortalityTable {
    pub fn ssa(gender: Gender) -> Self {
        let points = match gender {
            Gender::Male => SSA_MALE_2021,
            Gender::Female => SSA_FEMALE_2021,
        };
        Self {
            points: points.to_vec(),
        }
    }

    pub fn from_points(mut points: Vec<(u32, f64)>) -> Result<Self> {
        if points.is_empty() {
            return Err(SimError::config("mortality table must not be empty"));
        }
        points.sort_by_key(|(age, _)| *age);
        for pair in points.windows(2) {
            if pair[0].0 == pair[1].0 {
                return Err(SimError::config(format!(
                    "mortality table has duplicate age {}",
                    pair[0].0
                )));
            }
        }
        if let Some((age, rate)) = points
            .iter()
            .find(|(_, rate)| !rate.is_finite() || !(0.0..=1.0).contains(rate))
        {
            return Err(SimError::config(format!(
                "mortality rate for age {age} must be between 0 and 1, got {rate}"
            )));
        }
        Ok(Self { points })
    }

    pub fn min_age(&self) -> u32 {
        self.points[0].0
    }

    pub fn max_age(&self) -> u32 {
        self.points[self.points.len() - 1].0
    }

    pub fn rate(&self, age: u32) -> f64 {
        if age > CEILING_AGE {
            return 1.0;
        }
        if age < self.min_age() {
            return 0.0;
        }
        if age >= self.max_age() {
            return self.points[self.points.len() - 1].1;
        }

        let upper = self.points.partition_point(|(a, _)| *a < age);
        let (hi_age, hi_rate) = self.points[upper];
        if hi_age == age || upper == 0 {
            return hi_rate;
        }
        let (lo_age, lo_rate) = self.points[upper - 1];
        let w = (age - lo_age) as f64 / (hi_age - lo_age) as f64;
        lo_rate * (1.0 - w) + hi_rate * w
    }

    pub fn projected_rate(&self, age: u32, year: i32, improvement: &MortalityImprovement) -> f64 {
        if age > CEILING_AGE {
            return 1.0;
        }
        (self.rate(age) * improvement.multiplier(age, year)).clamp(0.0, 1.0)
    }

    /// Cumulative probability of being alive at each age in `start_age..=end_age`.
    pub fn survival_curve(&self, start_age: u32, end_age: u32) -> Vec<f64> {
        let mut curve = Vec::with_capacity(end_age.saturating_sub(start_age) as usize + 1);
        let mut survival = 1.0;
        for age in start_age..=end_age {
            if age > start_age {
                survival *= 1.0 - self.rate(age - 1);
            }
            curve.push(survival);
        }
        curve
    }

    pub fn life_expectancy(&self, age: u32) -> f64 {
        if age >= CEILING_AGE {
            return 0.0;
        }
        self.survival_curve(age, CEILING_AGE).iter().skip(1).sum()
    }
}
