/*!

Realised trajectories: the nested per-individual record of every layer of the hierarchy.

The nesting mirrors the design. `None` always means "structurally absent" (the chain has not
started yet, or the survey was not conducted), never "unknown". Loads are present exactly
when the state at their level carries the pathogen:

| level      | present iff                                 |
|------------|---------------------------------------------|
| individual | ecological state is `Infected`              |
| sample     | sample state is `Infected`                  |
| diagnostic | diagnostic state is `Infected`              |

*/

use crate::{
    design::{Design, Occasion},
    error::{ModelError, Result},
    params::{ModelSpec, SamplingLayer},
    state::{DiagnosticState, EcologicalState, ObservedState, SampleState},
};
use serde::{Deserialize, Serialize};

#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticRun {
    pub state: DiagnosticState,
    pub load: Option<f64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SecondaryRecord {
    pub observed: ObservedState,
    /// `None` when sampling is merged into capture.
    pub sample: Option<SampleState>,
    pub sample_load: Option<f64>,
    pub runs: Vec<DiagnosticRun>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PrimaryRecord {
    pub ecological: EcologicalState,
    pub load: Option<f64>,
    /// `None` for secondary surveys that were not conducted.
    pub secondaries: Vec<Option<SecondaryRecord>>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IndividualTrajectory {
    pub individual: usize,
    pub first_capture: Option<Occasion>,
    /// `None` before the individual's chain starts (before first capture in the variants
    /// conditioned on it).
    pub primaries: Vec<Option<PrimaryRecord>>,
}

impl IndividualTrajectory {
    /// Ecological states by primary occasion.
    #[must_use]
    pub fn ecological_states(&self) -> Vec<Option<EcologicalState>> {
        self.primaries
            .iter()
            .map(|primary| primary.as_ref().map(|record| record.ecological))
            .collect()
    }

    /// The first primary occasion at which the individual is dead, if any.
    #[must_use]
    pub fn death_occasion(&self) -> Option<usize> {
        self.ecological_states()
            .iter()
            .position(|state| *state == Some(EcologicalState::Dead))
    }

    /// Checks that the record's shape matches the individual's design and that loads are
    /// present exactly where their state carries the pathogen.
    pub fn check_structure(&self, design: &Design, spec: ModelSpec) -> Result<()> {
        let i = self.individual;
        let plan = design
            .individuals
            .get(i)
            .ok_or_else(|| ModelError::Design(format!("individual {i} is not in the design")))?;
        if self.primaries.len() != design.n_primary {
            return Err(ModelError::Design(format!(
                "individual {i} has {} primary records, expected {}",
                self.primaries.len(),
                design.n_primary
            )));
        }

        for (t, (record, primary_plan)) in self.primaries.iter().zip(&plan.primaries).enumerate() {
            let Some(record) = record else { continue };
            check_load(i, "individual", record.ecological == EcologicalState::Infected, record.load)?;
            if record.secondaries.len() != primary_plan.secondaries.len() {
                return Err(ModelError::Design(format!(
                    "individual {i}, primary {t}: {} secondary records, expected {}",
                    record.secondaries.len(),
                    primary_plan.secondaries.len()
                )));
            }

            for (k, (secondary, runs)) in record.secondaries.iter().zip(&primary_plan.secondaries).enumerate() {
                let secondary = match (secondary, runs) {
                    (None, None) => continue,
                    (Some(secondary), Some(runs)) if secondary.runs.len() == *runs => secondary,
                    _ => {
                        return Err(ModelError::Design(format!(
                            "individual {i}, occasion ({t}, {k}) does not match the design"
                        )));
                    }
                };

                match (spec.sampling, secondary.sample) {
                    (SamplingLayer::Separate, Some(sample)) => {
                        check_load(i, "sample", sample == SampleState::Infected, secondary.sample_load)?;
                    }
                    (SamplingLayer::Merged, None) => {
                        if secondary.sample_load.is_some() {
                            return Err(ModelError::structural(
                                i,
                                format!("sample load at ({t}, {k}) without a sampling layer"),
                            ));
                        }
                    }
                    (sampling, _) => {
                        return Err(ModelError::structural(
                            i,
                            format!("sample state at ({t}, {k}) inconsistent with {sampling:?} sampling"),
                        ));
                    }
                }

                for run in &secondary.runs {
                    check_load(i, "diagnostic", run.state == DiagnosticState::Infected, run.load)?;
                }
            }
        }
        Ok(())
    }

    /// What a field study records for this individual: capture flags, diagnostic outcomes
    /// and run loads. Latent layers are dropped.
    #[must_use]
    pub fn observations(&self) -> ObservationHistory {
        let primaries = self
            .primaries
            .iter()
            .map(|primary| {
                primary.as_ref().map_or_else(Vec::new, |record| {
                    record
                        .secondaries
                        .iter()
                        .map(|secondary| {
                            secondary.as_ref().map(|secondary| SecondaryObservation {
                                captured: secondary.observed.is_seen(),
                                runs: secondary.runs.clone(),
                            })
                        })
                        .collect()
                })
            })
            .collect();
        ObservationHistory {
            individual: self.individual,
            primaries,
        }
    }
}

fn check_load(individual: usize, level: &str, carries_pathogen: bool, load: Option<f64>) -> Result<()> {
    match (carries_pathogen, load) {
        (true, Some(load)) if load.is_finite() => Ok(()),
        (true, Some(load)) => Err(ModelError::structural(
            individual,
            format!("non-finite {level} load {load}"),
        )),
        (true, None) => Err(ModelError::structural(
            individual,
            format!("infected {level} state without a load"),
        )),
        (false, Some(_)) => Err(ModelError::structural(
            individual,
            format!("{level} load present without an infected {level} state"),
        )),
        (false, None) => Ok(()),
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub spec: ModelSpec,
    pub trajectories: Vec<IndividualTrajectory>,
}

impl Dataset {
    pub fn check_structure(&self, design: &Design) -> Result<()> {
        if self.trajectories.len() != design.n_individuals() {
            return Err(ModelError::Design(format!(
                "{} trajectories for {} individuals in the design",
                self.trajectories.len(),
                design.n_individuals()
            )));
        }
        for (i, trajectory) in self.trajectories.iter().enumerate() {
            if trajectory.individual != i {
                return Err(ModelError::Design(format!(
                    "trajectory {i} belongs to individual {}",
                    trajectory.individual
                )));
            }
            trajectory.check_structure(design, self.spec)?;
        }
        Ok(())
    }

    #[must_use]
    pub fn observations(&self) -> Vec<ObservationHistory> {
        self.trajectories
            .iter()
            .map(IndividualTrajectory::observations)
            .collect()
    }
}

/// One conducted secondary survey as recorded in the field.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SecondaryObservation {
    pub captured: bool,
    /// Diagnostic outcomes; all `NoRun` when the individual was not captured.
    pub runs: Vec<DiagnosticRun>,
}

/// The observed capture history of one individual: per primary, per secondary, the
/// survey outcome if the survey was conducted. Primaries before the chain starts are empty.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ObservationHistory {
    pub individual: usize,
    pub primaries: Vec<Vec<Option<SecondaryObservation>>>,
}

impl ObservationHistory {
    /// Whether the individual was captured at any secondary of primary `t`.
    #[must_use]
    pub fn captured_at(&self, t: usize) -> bool {
        self.primaries[t]
            .iter()
            .flatten()
            .any(|secondary| secondary.captured)
    }

    /// Whether any diagnostic run at primary `t` came back positive.
    #[must_use]
    pub fn detected_at(&self, t: usize) -> bool {
        self.primaries[t]
            .iter()
            .flatten()
            .flat_map(|secondary| &secondary.runs)
            .any(|run| run.state == DiagnosticState::Infected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::Variant;

    fn spec() -> ModelSpec {
        ModelSpec::new(Variant::ContinuousTime, SamplingLayer::Separate)
    }

    fn secondary(observed: ObservedState, sample: SampleState, runs: Vec<DiagnosticRun>) -> SecondaryRecord {
        SecondaryRecord {
            observed,
            sample: Some(sample),
            sample_load: (sample == SampleState::Infected).then_some(2.5),
            runs,
        }
    }

    fn positive(load: f64) -> DiagnosticRun {
        DiagnosticRun { state: DiagnosticState::Infected, load: Some(load) }
    }

    fn negative() -> DiagnosticRun {
        DiagnosticRun { state: DiagnosticState::Uninfected, load: None }
    }

    fn trajectory() -> (Design, IndividualTrajectory) {
        let design = Design::balanced(1, 2, 1, 2).with_first_captures(&[Some(Occasion::new(0, 0))]);
        let trajectory = IndividualTrajectory {
            individual: 0,
            first_capture: Some(Occasion::new(0, 0)),
            primaries: vec![
                Some(PrimaryRecord {
                    ecological: EcologicalState::Infected,
                    load: Some(3.0),
                    secondaries: vec![Some(secondary(
                        ObservedState::SeenInfected,
                        SampleState::Infected,
                        vec![positive(2.4), negative()],
                    ))],
                }),
                Some(PrimaryRecord {
                    ecological: EcologicalState::Dead,
                    load: None,
                    secondaries: vec![Some(SecondaryRecord {
                        observed: ObservedState::NotSeen,
                        sample: Some(SampleState::NoSample),
                        sample_load: None,
                        runs: vec![DiagnosticRun { state: DiagnosticState::NoRun, load: None }; 2],
                    })],
                }),
            ],
        };
        (design, trajectory)
    }

    #[test]
    fn well_formed_trajectory_passes() {
        let (design, trajectory) = trajectory();
        assert!(trajectory.check_structure(&design, spec()).is_ok());
        assert_eq!(trajectory.death_occasion(), Some(1));
    }

    #[test]
    fn positive_run_without_load_is_corrupt() {
        let (design, mut trajectory) = trajectory();
        let record = trajectory.primaries[0].as_mut().unwrap();
        record.secondaries[0].as_mut().unwrap().runs[0].load = None;
        assert!(matches!(
            trajectory.check_structure(&design, spec()),
            Err(ModelError::StructuralData { individual: 0, .. })
        ));
    }

    #[test]
    fn load_on_no_run_is_corrupt() {
        let (design, mut trajectory) = trajectory();
        let record = trajectory.primaries[1].as_mut().unwrap();
        record.secondaries[0].as_mut().unwrap().runs[1].load = Some(1.0);
        assert!(matches!(
            trajectory.check_structure(&design, spec()),
            Err(ModelError::StructuralData { .. })
        ));
    }

    #[test]
    fn sampling_layer_must_match_spec() {
        let (design, trajectory) = trajectory();
        let merged = ModelSpec::new(Variant::ContinuousTime, SamplingLayer::Merged);
        assert!(matches!(
            trajectory.check_structure(&design, merged),
            Err(ModelError::StructuralData { .. })
        ));
    }

    #[test]
    fn run_count_must_match_design() {
        let (design, mut trajectory) = trajectory();
        let record = trajectory.primaries[0].as_mut().unwrap();
        record.secondaries[0].as_mut().unwrap().runs.pop();
        assert!(matches!(
            trajectory.check_structure(&design, spec()),
            Err(ModelError::Design(_))
        ));
    }

    #[test]
    fn observations_drop_latent_layers() {
        let (_, trajectory) = trajectory();
        let history = trajectory.observations();
        assert!(history.captured_at(0));
        assert!(history.detected_at(0));
        assert!(!history.captured_at(1));
        assert!(!history.detected_at(1));
        let survey = history.primaries[0][0].as_ref().unwrap();
        assert_eq!(survey.runs[0], positive(2.4));
    }
}
