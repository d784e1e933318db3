/*!

The sampling design: which surveys and diagnostic runs were conducted for each individual,
the time between primary occasions, and where each individual was first captured.

Designs are sparse per individual. A secondary survey is `Some(runs)` when it was conducted
(with `runs` diagnostic runs per collected sample) and `None` when it was not, so a missing
survey is never confused with a survey that caught nothing.

*/

use crate::error::{ModelError, Result};
use crate::params::Variant;
use serde::{Deserialize, Serialize};

/// A (primary, secondary) survey coordinate.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Occasion {
    pub primary: usize,
    pub secondary: usize,
}

impl Occasion {
    #[must_use]
    pub fn new(primary: usize, secondary: usize) -> Self {
        Occasion { primary, secondary }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PrimaryDesign {
    /// One entry per secondary survey: the number of diagnostic runs if surveyed.
    pub secondaries: Vec<Option<usize>>,
}

impl PrimaryDesign {
    #[must_use]
    pub fn surveyed(n_secondary: usize, n_runs: usize) -> Self {
        PrimaryDesign {
            secondaries: vec![Some(n_runs); n_secondary],
        }
    }

    #[must_use]
    pub fn unsurveyed(n_secondary: usize) -> Self {
        PrimaryDesign {
            secondaries: vec![None; n_secondary],
        }
    }

    #[must_use]
    pub fn runs(&self, secondary: usize) -> Option<usize> {
        self.secondaries.get(secondary).copied().flatten()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IndividualDesign {
    /// Required by the variants that condition on first capture.
    pub first_capture: Option<Occasion>,
    pub primaries: Vec<PrimaryDesign>,
    /// Overrides [`Design::intervals`] for this individual.
    #[serde(default)]
    pub intervals: Option<Vec<f64>>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Design {
    pub n_primary: usize,
    /// `intervals[t]` is the time from primary `t` to `t + 1`.
    pub intervals: Vec<f64>,
    pub individuals: Vec<IndividualDesign>,
}

impl Design {
    /// Every individual surveyed on every secondary with the same number of runs, unit
    /// intervals and no first captures.
    #[must_use]
    pub fn balanced(n_individuals: usize, n_primary: usize, n_secondary: usize, n_runs: usize) -> Self {
        let individual = IndividualDesign {
            first_capture: None,
            primaries: vec![PrimaryDesign::surveyed(n_secondary, n_runs); n_primary],
            intervals: None,
        };
        Design {
            n_primary,
            intervals: vec![1.0; n_primary.saturating_sub(1)],
            individuals: vec![individual; n_individuals],
        }
    }

    #[must_use]
    pub fn with_intervals(mut self, intervals: Vec<f64>) -> Self {
        self.intervals = intervals;
        self
    }

    /// Sets every individual's first capture.
    #[must_use]
    pub fn with_first_captures(mut self, first_captures: &[Option<Occasion>]) -> Self {
        for (individual, first) in self.individuals.iter_mut().zip(first_captures) {
            individual.first_capture = *first;
        }
        self
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    #[must_use]
    pub fn n_individuals(&self) -> usize {
        self.individuals.len()
    }

    /// The interval from primary `t` to `t + 1` for individual `i`.
    #[inline]
    #[must_use]
    pub fn interval(&self, i: usize, t: usize) -> f64 {
        match &self.individuals[i].intervals {
            Some(intervals) => intervals[t],
            None => self.intervals[t],
        }
    }

    /// Checks the design's internal consistency for `variant`.
    pub fn validate(&self, variant: Variant) -> Result<()> {
        if self.n_primary == 0 {
            return Err(ModelError::Design("no primary occasions".into()));
        }
        check_intervals("design", &self.intervals, self.n_primary)?;

        for (i, individual) in self.individuals.iter().enumerate() {
            if individual.primaries.len() != self.n_primary {
                return Err(ModelError::Design(format!(
                    "individual {i} has {} primary occasions, expected {}",
                    individual.primaries.len(),
                    self.n_primary
                )));
            }
            if let Some(intervals) = &individual.intervals {
                check_intervals(&format!("individual {i}"), intervals, self.n_primary)?;
            }

            match (individual.first_capture, variant.conditions_on_first_capture()) {
                (Some(first), _) => {
                    let surveyed = individual
                        .primaries
                        .get(first.primary)
                        .and_then(|primary| primary.secondaries.get(first.secondary))
                        .is_some_and(Option::is_some);
                    if !surveyed {
                        return Err(ModelError::Design(format!(
                            "individual {i} is first captured at {first:?}, which was not surveyed"
                        )));
                    }
                }
                (None, true) => {
                    return Err(ModelError::Design(format!(
                        "individual {i} has no first capture, required by {variant:?}"
                    )));
                }
                (None, false) => {}
            }
        }
        Ok(())
    }
}

fn check_intervals(owner: &str, intervals: &[f64], n_primary: usize) -> Result<()> {
    if intervals.len() != n_primary - 1 {
        return Err(ModelError::Design(format!(
            "{owner} has {} intervals for {n_primary} primary occasions",
            intervals.len()
        )));
    }
    if let Some(bad) = intervals.iter().find(|tau| !(tau.is_finite() && **tau > 0.0)) {
        return Err(ModelError::Design(format!(
            "{owner} has a non-positive interval {bad}"
        )));
    }
    Ok(())
}
