/*!

Capture-history assembly: the bridge between field records and the cascade.

Diagnostic-run loads exist only for runs that came back positive. [`long_records`] flattens
them into one [`LoadRecord`] per such run, and [`attach_loads`] puts them back, so
nested → long → nested is lossless.

[`initial_values`] completes observed histories into full trajectories that can start a
sampler of the latent layers. Per primary occasion the ecological guess is
 - the highest state seen that occasion (infected if any run was positive, uninfected if
   captured with no positive run),
 - otherwise an alive state chosen uniformly between the first and last capture,
 - dead after the last capture, and not yet entered before the first one in the
   recruitment variant.

*/

use crate::{
    dataset::{DiagnosticRun, IndividualTrajectory, ObservationHistory, PrimaryRecord, SecondaryRecord},
    design::{Design, Occasion},
    error::{ModelError, Result},
    params::{ModelSpec, SamplingLayer},
    random::{ContextRandomExt, RandomStreams},
    state::{DiagnosticState, EcologicalState, ObservedState, SampleState},
};
use log::debug;
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};

crate::define_rng!(InitialValueRng);

/// The load measured by one positive diagnostic run.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LoadRecord {
    pub individual: usize,
    pub primary: usize,
    pub secondary: usize,
    pub run: usize,
    pub load: f64,
}

/// One record per positive diagnostic run, ordered by individual then occasion then run.
#[must_use]
pub fn long_records(histories: &[ObservationHistory]) -> Vec<LoadRecord> {
    let mut records = Vec::new();
    for history in histories {
        for (primary, secondaries) in history.primaries.iter().enumerate() {
            for (secondary, survey) in secondaries.iter().enumerate() {
                let Some(survey) = survey else { continue };
                for (run, outcome) in survey.runs.iter().enumerate() {
                    if let Some(load) = outcome.load {
                        records.push(LoadRecord {
                            individual: history.individual,
                            primary,
                            secondary,
                            run,
                            load,
                        });
                    }
                }
            }
        }
    }
    records
}

/// Writes `records` into the matching runs of `histories`.
///
/// Every record must point at a positive run of a conducted survey, each run can receive one
/// load, and afterwards every positive run must have one.
pub fn attach_loads(histories: &mut [ObservationHistory], records: &[LoadRecord]) -> Result<()> {
    let mut seen = FxHashSet::default();
    for record in records {
        let individual = record.individual;
        let run = histories
            .get_mut(individual)
            .filter(|history| history.individual == individual)
            .and_then(|history| history.primaries.get_mut(record.primary))
            .and_then(|secondaries| secondaries.get_mut(record.secondary))
            .and_then(Option::as_mut)
            .and_then(|survey| survey.runs.get_mut(record.run))
            .ok_or_else(|| ModelError::structural(individual, format!("load record {record:?} has no diagnostic run")))?;

        if run.state != DiagnosticState::Infected {
            return Err(ModelError::structural(
                individual,
                format!("load record {record:?} for a {:?} run", run.state),
            ));
        }
        if !seen.insert((individual, record.primary, record.secondary, record.run)) {
            return Err(ModelError::structural(individual, format!("duplicate load record {record:?}")));
        }
        run.load = Some(record.load);
    }

    for history in histories.iter() {
        let unloaded = history
            .primaries
            .iter()
            .flatten()
            .flatten()
            .flat_map(|survey| &survey.runs)
            .any(|run| run.state == DiagnosticState::Infected && run.load.is_none());
        if unloaded {
            return Err(ModelError::structural(history.individual, "positive diagnostic run without a load"));
        }
    }
    Ok(())
}

/// Checks that `history` has the shape of its individual's design.
fn check_history(history: &ObservationHistory, design: &Design) -> Result<()> {
    let i = history.individual;
    let plan = design
        .individuals
        .get(i)
        .ok_or_else(|| ModelError::Design(format!("individual {i} is not in the design")))?;
    if history.primaries.len() != design.n_primary {
        return Err(ModelError::Design(format!(
            "individual {i} has {} primary occasions of history, expected {}",
            history.primaries.len(),
            design.n_primary
        )));
    }
    for (t, (secondaries, primary_plan)) in history.primaries.iter().zip(&plan.primaries).enumerate() {
        if secondaries.is_empty() {
            continue;
        }
        let matches = secondaries.len() == primary_plan.secondaries.len()
            && secondaries
                .iter()
                .zip(&primary_plan.secondaries)
                .all(|(survey, runs)| match (survey, runs) {
                    (Some(survey), Some(runs)) => survey.runs.len() == *runs,
                    (None, None) => true,
                    _ => false,
                });
        if !matches {
            return Err(ModelError::Design(format!(
                "individual {i}: history at primary {t} does not match the design"
            )));
        }
    }
    Ok(())
}

/// Completes every history into a trajectory with guessed latent states and loads.
///
/// Unknown individual loads start at the mean of the positive run loads at that occasion,
/// falling back to the mean over all positive runs in `histories`. Guessed loads are always
/// positive, since a load of zero or less makes a pathogen undetectable: a mean at or below
/// zero gives way to the next fallback, and finally to [`DEFAULT_LOAD_GUESS`]. Uniform
/// choices are seeded by `seed` and the individual, so the result is reproducible.
pub fn initial_values(
    histories: &[ObservationHistory],
    design: &Design,
    spec: ModelSpec,
    seed: u64,
) -> Result<Vec<IndividualTrajectory>> {
    let loads: Vec<f64> = long_records(histories).iter().map(|record| record.load).collect();
    let fallback_load = positive_or(mean(loads.iter().copied()), DEFAULT_LOAD_GUESS);
    debug!(
        "guessing initial values for {} individuals from {} load records",
        histories.len(),
        loads.len()
    );

    histories
        .iter()
        .map(|history| {
            check_history(history, design)?;
            Ok(initial_trajectory(history, design, spec, fallback_load, seed))
        })
        .collect()
}

/// Load guess when no positive run in the data carries a positive load.
pub const DEFAULT_LOAD_GUESS: f64 = 1.0;

fn positive_or(load: Option<f64>, fallback: f64) -> f64 {
    load.filter(|load| *load > 0.0).unwrap_or(fallback)
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, count) = values.fold((0.0, 0usize), |(sum, count), value| (sum + value, count + 1));
    (count > 0).then(|| sum / count as f64)
}

fn positive_loads<'a>(runs: impl IntoIterator<Item = &'a DiagnosticRun>) -> impl Iterator<Item = f64> {
    runs.into_iter()
        .filter(|run| run.state == DiagnosticState::Infected)
        .filter_map(|run| run.load)
}

fn initial_trajectory(
    history: &ObservationHistory,
    design: &Design,
    spec: ModelSpec,
    fallback_load: f64,
    seed: u64,
) -> IndividualTrajectory {
    let i = history.individual;
    let plan = &design.individuals[i];
    let conditioned = spec.variant.conditions_on_first_capture();
    let captures: Vec<usize> = (0..design.n_primary)
        .filter(|&t| history.captured_at(t))
        .collect();
    let (first, last) = match (captures.first(), captures.last()) {
        (Some(&first), Some(&last)) => (Some(first), Some(last)),
        _ => (None, None),
    };
    let start = if conditioned {
        plan.first_capture.map_or(design.n_primary, |occasion| occasion.primary)
    } else {
        0
    };
    let mut streams = RandomStreams::new(seed, i);

    let primaries = (0..design.n_primary)
        .map(|t| {
            if t < start {
                return None;
            }
            let ecological = if captures.contains(&t) {
                EcologicalState::alive(history.detected_at(t))
            } else {
                match (first, last) {
                    (Some(first), _) if t < first => EcologicalState::NotEntered,
                    (_, Some(last)) if t > last => EcologicalState::Dead,
                    (Some(_), Some(_)) => {
                        EcologicalState::alive(streams.sample_bool::<InitialValueRng>(0.5))
                    }
                    // A conditioned chain must start alive even if the capture went unrecorded.
                    _ if conditioned => EcologicalState::Uninfected,
                    _ => EcologicalState::NotEntered,
                }
            };
            Some(initial_primary(history, &plan.primaries[t].secondaries, spec, t, ecological, fallback_load))
        })
        .collect();

    let first_capture = if conditioned {
        plan.first_capture
    } else {
        first.and_then(|t| {
            history.primaries[t]
                .iter()
                .position(|survey| survey.as_ref().is_some_and(|survey| survey.captured))
                .map(|k| Occasion::new(t, k))
        })
    };
    IndividualTrajectory {
        individual: i,
        first_capture,
        primaries,
    }
}

fn initial_primary(
    history: &ObservationHistory,
    surveys: &[Option<usize>],
    spec: ModelSpec,
    t: usize,
    ecological: EcologicalState,
    fallback_load: f64,
) -> PrimaryRecord {
    let observed_surveys = &history.primaries[t];
    let load = (ecological == EcologicalState::Infected).then(|| {
        let occasion_mean = mean(positive_loads(
            observed_surveys.iter().flatten().flat_map(|survey| &survey.runs),
        ));
        positive_or(occasion_mean, fallback_load)
    });

    let secondaries = surveys
        .iter()
        .enumerate()
        .map(|(k, runs)| {
            let n_runs = (*runs)?;
            let survey = observed_surveys.get(k).and_then(Option::as_ref);
            let captured = survey.is_some_and(|survey| survey.captured);
            let runs = survey.map_or_else(
                || vec![DiagnosticRun { state: DiagnosticState::NoRun, load: None }; n_runs],
                |survey| survey.runs.clone(),
            );
            let observed = if captured {
                ObservedState::seen_as(ecological).unwrap_or(ObservedState::NotSeen)
            } else {
                ObservedState::NotSeen
            };

            let (sample, sample_load) = match spec.sampling {
                SamplingLayer::Separate if captured => {
                    match mean(positive_loads(&runs)) {
                        Some(survey_mean) => (
                            Some(SampleState::Infected),
                            Some(positive_or(Some(survey_mean), load.unwrap_or(fallback_load))),
                        ),
                        None => (Some(SampleState::Uninfected), None),
                    }
                }
                SamplingLayer::Separate => (Some(SampleState::NoSample), None),
                SamplingLayer::Merged => (None, None),
            };
            Some(SecondaryRecord {
                observed,
                sample,
                sample_load,
                runs,
            })
        })
        .collect();

    PrimaryRecord {
        ecological,
        load,
        secondaries,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cascade::{evaluate_individual, simulate_individual, LogLikelihood},
        dataset::SecondaryObservation,
        params::{tests::params_for, Variant},
    };

    fn simulated(spec: ModelSpec, n_individuals: usize) -> (Design, Vec<ObservationHistory>) {
        let params = params_for(spec);
        let mut design = Design::balanced(n_individuals, 6, 2, 3);
        if spec.variant.conditions_on_first_capture() {
            let firsts: Vec<_> = (0..n_individuals).map(|i| Some(Occasion::new(i % 2, 0))).collect();
            design = design.with_first_captures(&firsts);
        }
        let histories = (0..n_individuals)
            .map(|i| simulate_individual(&params, &design, i, 31).unwrap().observations())
            .collect();
        (design, histories)
    }

    fn strip_loads(histories: &[ObservationHistory]) -> Vec<ObservationHistory> {
        let mut stripped = histories.to_vec();
        for survey in stripped.iter_mut().flat_map(|h| h.primaries.iter_mut()).flatten().flatten() {
            for run in &mut survey.runs {
                run.load = None;
            }
        }
        stripped
    }

    fn survey(captured: bool, states: &[DiagnosticState], loads: &[Option<f64>]) -> Option<SecondaryObservation> {
        Some(SecondaryObservation {
            captured,
            runs: states
                .iter()
                .zip(loads)
                .map(|(&state, &load)| DiagnosticRun { state, load })
                .collect(),
        })
    }

    #[test]
    fn long_records_round_trip() {
        let spec = ModelSpec::new(Variant::ContinuousTime, SamplingLayer::Separate);
        let (_, histories) = simulated(spec, 20);
        let records = long_records(&histories);
        assert!(!records.is_empty());
        assert!(records.iter().all(|record| record.load.is_finite()));

        let mut rebuilt = strip_loads(&histories);
        attach_loads(&mut rebuilt, &records).unwrap();
        assert_eq!(rebuilt, histories);
        assert_eq!(long_records(&rebuilt), records);
    }

    #[test]
    fn attach_rejects_misplaced_records() {
        let spec = ModelSpec::new(Variant::ArnasonSchwarz, SamplingLayer::Merged);
        let (_, histories) = simulated(spec, 20);
        let records = long_records(&histories);
        let first = records[0];

        let mut stripped = strip_loads(&histories);
        let mut duplicated = records.clone();
        duplicated.push(first);
        assert!(matches!(
            attach_loads(&mut stripped, &duplicated),
            Err(ModelError::StructuralData { .. })
        ));

        let mut stripped = strip_loads(&histories);
        let missing = &records[1..];
        assert!(matches!(
            attach_loads(&mut stripped, missing),
            Err(ModelError::StructuralData { individual, .. }) if individual == first.individual
        ));

        let mut stripped = strip_loads(&histories);
        let nowhere = LoadRecord { run: 99, ..first };
        assert!(attach_loads(&mut stripped, &[nowhere]).is_err());
    }

    #[test]
    fn attach_rejects_load_on_negative_run() {
        let mut histories = vec![ObservationHistory {
            individual: 0,
            primaries: vec![vec![survey(
                true,
                &[DiagnosticState::Uninfected, DiagnosticState::Infected],
                &[None, None],
            )]],
        }];
        let record = LoadRecord { individual: 0, primary: 0, secondary: 0, run: 0, load: 1.5 };
        assert!(attach_loads(&mut histories, &[record]).is_err());
        let record = LoadRecord { run: 1, ..record };
        attach_loads(&mut histories, &[record]).unwrap();
        assert_eq!(histories[0].primaries[0][0].as_ref().unwrap().runs[1].load, Some(1.5));
    }

    #[test]
    fn initial_guess_rules() {
        use DiagnosticState::{Infected as Pos, NoRun, Uninfected as Neg};
        let design = Design::balanced(1, 5, 1, 1);
        let history = ObservationHistory {
            individual: 0,
            primaries: vec![
                vec![survey(false, &[NoRun], &[None])],
                vec![survey(true, &[Neg], &[None])],
                vec![survey(false, &[NoRun], &[None])],
                vec![survey(true, &[Pos], &[Some(2.0)])],
                vec![survey(false, &[NoRun], &[None])],
            ],
        };
        let spec = ModelSpec::new(Variant::JollySeber, SamplingLayer::Separate);
        let trajectories = initial_values(&[history], &design, spec, 5).unwrap();
        let states = trajectories[0].ecological_states();
        assert_eq!(states[0], Some(EcologicalState::NotEntered));
        assert_eq!(states[1], Some(EcologicalState::Uninfected));
        assert!(states[2].is_some_and(EcologicalState::is_alive));
        assert_eq!(states[3], Some(EcologicalState::Infected));
        assert_eq!(states[4], Some(EcologicalState::Dead));
        assert_eq!(trajectories[0].first_capture, Some(Occasion::new(1, 0)));

        let infected = trajectories[0].primaries[3].as_ref().unwrap();
        assert_eq!(infected.load, Some(2.0));
        let secondary = infected.secondaries[0].as_ref().unwrap();
        assert_eq!(secondary.observed, ObservedState::SeenInfected);
        assert_eq!(secondary.sample, Some(SampleState::Infected));
        assert_eq!(secondary.sample_load, Some(2.0));
    }

    #[test]
    fn negative_run_loads_give_positive_guesses() {
        use DiagnosticState::{Infected as Pos, NoRun, Uninfected as Neg};
        let design = Design::balanced(2, 2, 1, 2).with_first_captures(&[
            Some(Occasion::new(0, 0)),
            Some(Occasion::new(0, 0)),
        ]);
        let histories = vec![
            ObservationHistory {
                individual: 0,
                primaries: vec![
                    vec![survey(true, &[Pos, Neg], &[Some(-0.75), None])],
                    vec![survey(false, &[NoRun, NoRun], &[None, None])],
                ],
            },
            ObservationHistory {
                individual: 1,
                primaries: vec![
                    vec![survey(true, &[Pos, Pos], &[Some(-0.5), Some(-1.5)])],
                    vec![survey(true, &[Pos, Neg], &[Some(2.75), None])],
                ],
            },
        ];
        let spec = ModelSpec::new(Variant::ContinuousTime, SamplingLayer::Separate);
        let params = params_for(spec);
        let guesses = initial_values(&histories, &design, spec, 2).unwrap();

        for guess in &guesses {
            for primary in guess.primaries.iter().flatten() {
                assert!(primary.load.is_none_or(|load| load > 0.0));
                for secondary in primary.secondaries.iter().flatten() {
                    assert!(secondary.sample_load.is_none_or(|load| load > 0.0));
                }
            }
            let mut total = LogLikelihood::default();
            evaluate_individual(&params, &design, guess, &mut total).unwrap();
            assert!(total.0.is_finite(), "individual {}: {}", guess.individual, total.0);
        }

        // Every load in the data averages to zero, so the last resort applies.
        let first = guesses[0].primaries[0].as_ref().unwrap();
        assert_eq!(first.load, Some(DEFAULT_LOAD_GUESS));
        let sample_load = first.secondaries[0].as_ref().unwrap().sample_load;
        assert_eq!(sample_load, Some(DEFAULT_LOAD_GUESS));
        let second = guesses[1].primaries[1].as_ref().unwrap();
        assert_eq!(second.load, Some(2.75));
    }

    #[test]
    fn initial_values_are_reproducible_and_evaluable() {
        for spec in [
            ModelSpec::new(Variant::ContinuousTime, SamplingLayer::Separate),
            ModelSpec::new(Variant::ArnasonSchwarz, SamplingLayer::Merged),
            ModelSpec::new(Variant::JollySeber, SamplingLayer::Separate),
        ] {
            let params = params_for(spec);
            let (design, histories) = simulated(spec, 15);
            let guesses = initial_values(&histories, &design, spec, 8).unwrap();
            assert_eq!(guesses, initial_values(&histories, &design, spec, 8).unwrap());

            for guess in &guesses {
                assert_eq!(guess.observations(), histories[guess.individual]);
                let mut total = LogLikelihood::default();
                evaluate_individual(&params, &design, guess, &mut total).unwrap();
                assert!(total.0.is_finite(), "{spec:?} individual {}", guess.individual);
            }
        }
    }

    #[test]
    fn history_must_match_design() {
        let spec = ModelSpec::new(Variant::ContinuousTime, SamplingLayer::Separate);
        let (design, mut histories) = simulated(spec, 3);
        histories[1].primaries.pop();
        assert!(matches!(
            initial_values(&histories, &design, spec, 1),
            Err(ModelError::Design(_))
        ));
    }
}
