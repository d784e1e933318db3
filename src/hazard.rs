//! Hazard and detection functions of pathogen load.
//!
//! Loads are on the log scale. Detection treats a load as a count of independent units,
//! each detected with probability `r`, so `detect(load) = 1 - (1 - r)^load`.

use crate::{error::ParameterRejection, matrix::SquareMatrix};

#[inline]
#[must_use]
pub fn expit(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

#[inline]
#[must_use]
pub fn logit(p: f64) -> f64 {
    (p / (1.0 - p)).ln()
}

/// Probability of detecting at least one of `load` independent units. Negative loads count
/// as zero units.
#[inline]
#[must_use]
pub fn detect(r: f64, load: f64) -> f64 {
    1.0 - (1.0 - r).powf(load.max(0.0))
}

/// The detection function of one observation layer (sampling or diagnostic).
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct DetectionFunction {
    /// Per-unit-load detection increment.
    pub r: f64,
    /// Probability of a positive result when the pathogen is truly absent.
    pub false_positive: f64,
}

impl DetectionFunction {
    /// Validates `0 < r < 1`, `0 <= false_positive < r`. Requiring the false-positive rate to
    /// stay below the unit detection rate keeps "rare but always detected" and "common but
    /// rarely detected" from describing the same data.
    pub fn new(
        r_name: &str,
        r: f64,
        fp_name: &str,
        false_positive: f64,
    ) -> Result<Self, ParameterRejection> {
        if !(r.is_finite() && r > 0.0 && r < 1.0) {
            return Err(ParameterRejection::new(r_name, format!("0 < {r_name} < 1")));
        }
        if !(false_positive.is_finite() && false_positive >= 0.0) {
            return Err(ParameterRejection::new(fp_name, format!("{fp_name} >= 0")));
        }
        if false_positive >= r {
            return Err(ParameterRejection::new(fp_name, format!("{fp_name} < {r_name}")));
        }
        Ok(DetectionFunction { r, false_positive })
    }

    #[inline]
    #[must_use]
    pub fn true_positive(&self, load: f64) -> f64 {
        detect(self.r, load)
    }

    /// Probability of a positive result given whether the pathogen is present and, if so,
    /// its load.
    #[inline]
    #[must_use]
    pub fn positive(&self, load: Option<f64>) -> f64 {
        match load {
            Some(load) => self.true_positive(load),
            None => self.false_positive,
        }
    }
}

/// Load-dependent mortality hazard `exp(log(alpha) + beta·load)` (continuous time).
#[inline]
#[must_use]
pub fn mortality_hazard(alpha: f64, beta: f64, load: f64) -> f64 {
    (alpha.ln() + beta * load).exp()
}

/// Load-dependent mortality probability `expit(logit(alpha) + beta·load)` (discrete time).
#[inline]
#[must_use]
pub fn mortality_probability(alpha: f64, beta: f64, load: f64) -> f64 {
    expit(logit(alpha) + beta * load)
}

/// Instantaneous transition hazards between uninfected (0), infected (1) and dead (2).
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Hazards {
    pub infection: f64,
    pub recovery: f64,
    pub mortality_uninfected: f64,
    pub mortality_infected: f64,
}

impl Hazards {
    /// The generator matrix. Rows sum to zero; the dead row is identically zero.
    ///
    /// A hazard or exit rate that overflows to infinity is rejected against the parameter
    /// that drives it.
    ///
    /// # Panics
    /// On a negative or NaN hazard, which only a bug upstream of parameter validation can
    /// produce.
    pub fn generator(&self) -> Result<SquareMatrix<3>, ParameterRejection> {
        for (parameter, rate) in [
            ("psi12", self.infection),
            ("psi21", self.recovery),
            ("phi1", self.mortality_uninfected),
            ("beta_phi", self.mortality_infected),
        ] {
            assert!(rate >= 0.0, "invalid {parameter} hazard: {rate}");
            if rate.is_infinite() {
                return Err(ParameterRejection::new(parameter, "a finite hazard"));
            }
        }

        let exit_uninfected = self.infection + self.mortality_uninfected;
        if exit_uninfected.is_infinite() {
            return Err(ParameterRejection::new("phi1", "psi12 + phi1 finite"));
        }
        let exit_infected = self.recovery + self.mortality_infected;
        if exit_infected.is_infinite() {
            return Err(ParameterRejection::new("beta_phi", "a finite infected exit rate"));
        }

        Ok(SquareMatrix::from_rows([
            [-exit_uninfected, self.infection, self.mortality_uninfected],
            [self.recovery, -exit_infected, self.mortality_infected],
            [0.0, 0.0, 0.0],
        ]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detect_reference_value() {
        assert!((detect(0.4, 4.0) - 0.8704).abs() < 1e-6);
    }

    #[test]
    fn detect_boundaries() {
        assert_eq!(detect(0.4, 0.0), 0.0);
        assert!((detect(0.4, 1.0) - 0.4).abs() < 1e-15);
        assert!(detect(0.4, 200.0) > 1.0 - 1e-12);
        assert_eq!(detect(0.4, -2.0), 0.0);
    }

    #[test]
    fn detect_is_monotone_in_load() {
        for r in [0.01, 0.2, 0.5, 0.9] {
            let mut previous = 0.0;
            for step in 0..200 {
                let value = detect(r, f64::from(step) * 0.1);
                assert!(value >= previous);
                previous = value;
            }
        }
    }

    #[test]
    fn detection_function_uses_false_positive_without_pathogen() {
        let function = DetectionFunction::new("r_diag", 0.4, "fp_diag", 0.05).unwrap();
        assert_eq!(function.positive(None), 0.05);
        assert!((function.positive(Some(4.0)) - 0.8704).abs() < 1e-6);
    }

    #[test]
    fn detection_function_rejects_label_switching() {
        let rejection = DetectionFunction::new("r_diag", 0.3, "fp_diag", 0.3).unwrap_err();
        assert_eq!(rejection.parameter, "fp_diag");
        assert!(DetectionFunction::new("r_diag", 1.0, "fp_diag", 0.0).is_err());
        assert!(DetectionFunction::new("r_diag", 0.3, "fp_diag", -0.1).is_err());
    }

    #[test]
    fn mortality_links_reduce_to_alpha_without_slope() {
        assert!((mortality_hazard(0.4, 0.0, 5.0) - 0.4).abs() < 1e-15);
        assert!((mortality_probability(0.2, 0.0, 5.0) - 0.2).abs() < 1e-15);
        assert!(mortality_hazard(0.4, 0.5, 2.0) > 0.4);
        assert!(mortality_probability(0.2, 0.5, 2.0) > 0.2);
        assert!(mortality_probability(0.2, 0.5, 2.0) < 1.0);
    }

    #[test]
    fn generator_rows_sum_to_zero() {
        let hazards = Hazards {
            infection: 0.5,
            recovery: 0.3,
            mortality_uninfected: 0.4,
            mortality_infected: 0.4,
        };
        let q = hazards.generator().unwrap();
        assert_eq!(
            q,
            SquareMatrix::from_rows([[-0.9, 0.5, 0.4], [0.3, -0.7, 0.4], [0.0, 0.0, 0.0]])
        );
        for sum in q.row_sums() {
            assert!(sum.abs() < 1e-15);
        }
    }

    #[test]
    fn overflowing_hazards_are_rejected() {
        let heavy = Hazards {
            infection: 0.5,
            recovery: 0.3,
            mortality_uninfected: 0.4,
            mortality_infected: mortality_hazard(0.4, 300.0, 3.0),
        };
        assert_eq!(heavy.generator().unwrap_err().parameter, "beta_phi");

        let crowded = Hazards {
            infection: 1e308,
            recovery: 0.3,
            mortality_uninfected: 1e308,
            mortality_infected: 0.4,
        };
        assert_eq!(crowded.generator().unwrap_err().parameter, "phi1");
    }
}
