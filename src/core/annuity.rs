use std::str::FromStr;

use super::error::{Result, SimError};
use super::types::Annuity;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AnnuityPayout {
    FixedPeriod,
    LifeOnly,
    LifeContingentWithGuarantee,
}

impl FromStr for AnnuityPayout {
    type Err = SimError;

    fn from_str(s: &str) -> Result<Self> {
        let key = s
            .trim()
            .to_ascii_lowercase()
            .replace([' ', '_'], "-");
        match key.as_str() {
            "fixed-period" | "fixed" => Ok(AnnuityPayout::FixedPeriod),
            "life-only" | "life" => Ok(AnnuityPayout::LifeOnly),
            "life-contingent-with-guarantee" | "life-with-guarantee" | "guaranteed" => {
                Ok(AnnuityPayout::LifeContingentWithGuarantee)
            }
            _ => Err(SimError::config(format!(
                "invalid annuity type '{s}', must be one of: Life Only, \
                 Life Contingent with Guarantee, Fixed Period"
            ))),
        }
    }
}

/// Annuity payment for simulation `year` (1-based). `alive_start_of_year` is the
/// annuitant's survival state entering the year, not after this year's mortality draw.
pub fn annuity_income(
    year: u32,
    alive_start_of_year: bool,
    guarantee_years: u32,
    annual_amount: f64,
    payout: AnnuityPayout,
) -> f64 {
    let in_guarantee = year <= guarantee_years;
    let pays = match payout {
        AnnuityPayout::FixedPeriod => in_guarantee,
        AnnuityPayout::LifeOnly => alive_start_of_year,
        AnnuityPayout::LifeContingentWithGuarantee => alive_start_of_year || in_guarantee,
    };
    if pays { annual_amount } else { 0.0 }
}

impl Annuity {
    pub fn income(&self, year: u32, alive_start_of_year: bool) -> f64 {
        annuity_income(
            year,
            alive_start_of_year,
            self.guarantee_years,
            self.annual_amount,
            self.payout,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_period_ignores_survival() {
        for year in 1..=5 {
            assert_eq!(
                annuity_income(year, false, 5, 20_000.0, AnnuityPayout::FixedPeriod),
                20_000.0
            );
        }
        assert_eq!(
            annuity_income(6, true, 5, 20_000.0, AnnuityPayout::FixedPeriod),
            0.0
        );
    }

    #[test]
    fn life_only_pays_while_alive() {
        assert_eq!(
            annuity_income(1, true, 10, 12_000.0, AnnuityPayout::LifeOnly),
            12_000.0
        );
        assert_eq!(
            annuity_income(1, false, 10, 12_000.0, AnnuityPayout::LifeOnly),
            0.0
        );
        assert_eq!(
            annuity_income(30, true, 0, 12_000.0, AnnuityPayout::LifeOnly),
            12_000.0
        );
    }

    #[test]
    fn guarantee_overrides_mortality() {
        let payout = AnnuityPayout::LifeContingentWithGuarantee;
        assert_eq!(annuity_income(3, false, 10, 8_000.0, payout), 8_000.0);
        assert_eq!(annuity_income(11, false, 10, 8_000.0, payout), 0.0);
        assert_eq!(annuity_income(11, true, 10, 8_000.0, payout), 8_000.0);
    }

    #[test]
    fn zero_guarantee_degenerates_to_life_only() {
        for year in 1..=20 {
            for alive in [true, false] {
                assert_eq!(
                    annuity_income(
                        year,
                        alive,
                        0,
                        5_000.0,
                        AnnuityPayout::LifeContingentWithGuarantee
                    ),
                    annuity_income(year, alive, 0, 5_000.0, AnnuityPayout::LifeOnly)
                );
            }
        }
    }

    #[test]
    fn payout_parses_display_names() {
        assert_eq!(
            "Life Only".parse::<AnnuityPayout>().expect("valid"),
            AnnuityPayout::LifeOnly
        );
        assert_eq!(
            "Life Contingent with Guarantee"
                .parse::<AnnuityPayout>()
                .expect("valid"),
            AnnuityPayout::LifeContingentWithGuarantee
        );
        assert_eq!(
            "fixed_period".parse::<AnnuityPayout>().expect("valid"),
            AnnuityPayout::FixedPeriod
        );
        let err = "Variable".parse::<AnnuityPayout>().expect_err("must reject");
        assert!(err.to_string().contains("invalid annuity type"));
    }
}
