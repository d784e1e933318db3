/*!

The hierarchical state cascade, run for one individual at a time.

Per primary occasion the cascade visits, strictly in this order:
 1. the ecological state, from the previous occasion's state (or the entry distribution),
 2. the individual load, if infected,
 3. per conducted secondary survey: the observed state, the sample state (separate
    sampling only), the sample load, then per diagnostic run its outcome and load.

[`simulate_individual`] draws every step; [`evaluate_individual`] walks a recorded trajectory
and hands each step's probability term to a [`TermVisitor`]. Both share the same matrices,
so the two modes cannot disagree about the model.

The ecological state is fixed across the secondaries of a primary occasion, and unsurveyed
secondaries contribute nothing without breaking the ecological chain.

*/

use crate::{
    dataset::{DiagnosticRun, IndividualTrajectory, PrimaryRecord, SecondaryRecord},
    design::{Design, Occasion},
    error::{ModelError, Result},
    params::Parameters,
    random::{ContextRandomExt, RandomStreams, RngId},
    state::{DiagnosticState, EcologicalState, ObservedState, SampleState},
    transition::{diagnostic_tpm, ecological_tpm, initial_distribution, observation_tpm, sample_tpm},
};
use log::trace;
use rand_distr::StandardNormal;
use serde::Serialize;

crate::define_rng!(EcologyRng);
crate::define_rng!(IndividualLoadRng);
crate::define_rng!(CaptureRng);
crate::define_rng!(SampleRng);
crate::define_rng!(SampleLoadRng);
crate::define_rng!(DiagnosticRng);
crate::define_rng!(RunLoadRng);

/// Which categorical layer a term belongs to.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Layer {
    /// The infection status drawn at first capture.
    Entry,
    Ecological,
    Observed,
    Sample,
    Diagnostic,
}

/// Which level of the load hierarchy a normal term belongs to.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadLevel {
    Individual,
    Sample,
    Diagnostic,
}

/// Where in the design a term sits.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct Coordinates {
    pub individual: usize,
    pub primary: usize,
    pub secondary: Option<usize>,
    pub run: Option<usize>,
}

impl Coordinates {
    fn primary(individual: usize, primary: usize) -> Self {
        Coordinates {
            individual,
            primary,
            secondary: None,
            run: None,
        }
    }

    fn secondary(self, secondary: usize) -> Self {
        Coordinates {
            secondary: Some(secondary),
            ..self
        }
    }

    fn run(self, run: usize) -> Self {
        Coordinates {
            run: Some(run),
            ..self
        }
    }
}

/// A realised categorical outcome and the distribution it was drawn from.
#[derive(Copy, Clone, Debug, PartialEq, Serialize)]
pub struct CategoricalTerm {
    pub at: Coordinates,
    pub layer: Layer,
    probabilities: [f64; EcologicalState::COUNT],
    categories: usize,
    pub outcome: usize,
}

impl CategoricalTerm {
    fn new(at: Coordinates, layer: Layer, probabilities: &[f64], outcome: usize) -> Self {
        let mut padded = [0.0; EcologicalState::COUNT];
        padded[..probabilities.len()].copy_from_slice(probabilities);
        CategoricalTerm {
            at,
            layer,
            probabilities: padded,
            categories: probabilities.len(),
            outcome,
        }
    }

    #[must_use]
    pub fn probabilities(&self) -> &[f64] {
        &self.probabilities[..self.categories]
    }

    #[must_use]
    pub fn log_probability(&self) -> f64 {
        self.probabilities[self.outcome].ln()
    }
}

/// An observed load and the normal distribution it was drawn from.
#[derive(Copy, Clone, Debug, PartialEq, Serialize)]
pub struct NormalTerm {
    pub at: Coordinates,
    pub level: LoadLevel,
    pub mean: f64,
    pub sd: f64,
    pub value: f64,
}

impl NormalTerm {
    /// Normal log density. A zero `sd` is a point mass at the mean.
    #[must_use]
    pub fn log_density(&self) -> f64 {
        let deviation = self.value - self.mean;
        if self.sd == 0.0 {
            return if deviation == 0.0 { 0.0 } else { f64::NEG_INFINITY };
        }
        let z = deviation / self.sd;
        -0.5 * (2.0 * std::f64::consts::PI).ln() - self.sd.ln() - 0.5 * z * z
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Term {
    Categorical(CategoricalTerm),
    Normal(NormalTerm),
}

impl Term {
    #[must_use]
    pub fn log_density(&self) -> f64 {
        match self {
            Term::Categorical(term) => term.log_probability(),
            Term::Normal(term) => term.log_density(),
        }
    }
}

/// Receives the likelihood terms of a trajectory in cascade order.
pub trait TermVisitor {
    fn visit(&mut self, term: Term);
}

/// Sums the log densities of every visited term.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct LogLikelihood(pub f64);

impl TermVisitor for LogLikelihood {
    fn visit(&mut self, term: Term) {
        self.0 += term.log_density();
    }
}

impl TermVisitor for Vec<Term> {
    fn visit(&mut self, term: Term) {
        self.push(term);
    }
}

/// The distribution of the ecological state at `t` given the previous occasion, if any.
fn ecological_distribution(
    params: &Parameters,
    design: &Design,
    individual: usize,
    t: usize,
    previous: Option<(EcologicalState, Option<f64>)>,
) -> Result<([f64; EcologicalState::COUNT], Layer)> {
    Ok(match previous {
        None if params.spec.variant.conditions_on_first_capture() => {
            (initial_distribution(params), Layer::Entry)
        }
        // Before the first occasion everyone is not yet entered; the interval is unused
        // by the discrete recruitment matrix.
        None => (
            *ecological_tpm(params, t, None, 1.0)?.row(EcologicalState::NotEntered.index()),
            Layer::Ecological,
        ),
        Some((state, load)) => {
            let tau = design.interval(individual, t - 1);
            (
                *ecological_tpm(params, t, load, tau)?.row(state.index()),
                Layer::Ecological,
            )
        }
    })
}

/// The primary occasion at which an individual's chain starts.
fn chain_start(params: &Parameters, first_capture: Option<Occasion>) -> Option<usize> {
    if params.spec.variant.conditions_on_first_capture() {
        first_capture.map(|occasion| occasion.primary)
    } else {
        Some(0)
    }
}

/// Parent of a diagnostic run: its row in the diagnostic matrix and its load.
fn diagnostic_parent(
    observed: ObservedState,
    sample: Option<SampleState>,
    sample_load: Option<f64>,
    load: Option<f64>,
) -> (usize, Option<f64>) {
    match sample {
        Some(sample) => (sample.index(), sample_load),
        None => (observed.index(), load),
    }
}

fn draw_normal<R: RngId>(streams: &mut RandomStreams, mean: f64, sd: f64) -> f64 {
    mean + sd * streams.sample_distr::<R, f64>(StandardNormal)
}

/// Simulates the trajectory of `individual` under `params` and `design`.
///
/// Each layer draws from its own stream seeded by `seed` and the individual's index, so the
/// result depends on neither the order individuals are simulated in nor on any other
/// individual. In the variants conditioned on first capture the design must give one; the
/// chain starts at that primary occasion with capture certain at that survey.
///
/// Fails with a rejection if the hazards along the simulated path overflow.
pub fn simulate_individual(
    params: &Parameters,
    design: &Design,
    individual: usize,
    seed: u64,
) -> Result<IndividualTrajectory> {
    let plan = &design.individuals[individual];
    let start = chain_start(params, plan.first_capture).unwrap_or(design.n_primary);
    let conditioned = params.spec.variant.conditions_on_first_capture();
    let mut streams = RandomStreams::new(seed, individual);

    let mut primaries: Vec<Option<PrimaryRecord>> = vec![None; start];
    let mut previous = None;
    for t in start..design.n_primary {
        let (distribution, _) = ecological_distribution(params, design, individual, t, previous)?;
        let ecological = EcologicalState::ALL[streams.sample_weighted::<EcologyRng>(&distribution)];
        let load = (ecological == EcologicalState::Infected).then(|| {
            draw_normal::<IndividualLoadRng>(&mut streams, params.loads.mu, params.loads.sigma_individual)
        });

        let secondaries = plan.primaries[t]
            .secondaries
            .iter()
            .enumerate()
            .map(|(k, runs)| {
                runs.map(|n_runs| {
                    let certain = conditioned && plan.first_capture == Some(Occasion::new(t, k));
                    simulate_secondary(&mut streams, params, t, certain, n_runs, ecological, load)
                })
            })
            .collect();

        primaries.push(Some(PrimaryRecord {
            ecological,
            load,
            secondaries,
        }));
        previous = Some((ecological, load));
    }

    let first_capture = if conditioned {
        plan.first_capture
    } else {
        first_sighting(&primaries)
    };
    trace!("simulated individual {individual}, first captured at {first_capture:?}");
    Ok(IndividualTrajectory {
        individual,
        first_capture,
        primaries,
    })
}

fn simulate_secondary(
    streams: &mut RandomStreams,
    params: &Parameters,
    t: usize,
    certain: bool,
    n_runs: usize,
    ecological: EcologicalState,
    load: Option<f64>,
) -> SecondaryRecord {
    let capture = observation_tpm(params.p1.at(t), params.p2.at(t), certain);
    let observed = ObservedState::ALL[streams.sample_weighted::<CaptureRng>(capture.row(ecological.index()))];

    let (sample, sample_load) = match &params.sample {
        Some(detection) => {
            let tpm = sample_tpm(detection, load);
            let sample = SampleState::ALL[streams.sample_weighted::<SampleRng>(tpm.row(observed.index()))];
            let sample_load = (sample == SampleState::Infected).then(|| {
                draw_normal::<SampleLoadRng>(streams, load.unwrap_or(0.0), params.loads.sigma_sample)
            });
            (Some(sample), sample_load)
        }
        None => (None, None),
    };

    let (parent, parent_load) = diagnostic_parent(observed, sample, sample_load, load);
    let diagnostic = diagnostic_tpm(&params.diagnostic, parent_load);
    let runs = (0..n_runs)
        .map(|_| {
            let state = DiagnosticState::ALL[streams.sample_weighted::<DiagnosticRng>(diagnostic.row(parent))];
            let load = (state == DiagnosticState::Infected).then(|| {
                draw_normal::<RunLoadRng>(streams, parent_load.unwrap_or(0.0), params.loads.sigma_diagnostic)
            });
            DiagnosticRun { state, load }
        })
        .collect();

    SecondaryRecord {
        observed,
        sample,
        sample_load,
        runs,
    }
}

fn first_sighting(primaries: &[Option<PrimaryRecord>]) -> Option<Occasion> {
    primaries.iter().enumerate().find_map(|(t, primary)| {
        primary.as_ref()?.secondaries.iter().enumerate().find_map(|(k, secondary)| {
            secondary
                .as_ref()
                .filter(|secondary| secondary.observed.is_seen())
                .map(|_| Occasion::new(t, k))
        })
    })
}

/// Visits every likelihood term of `trajectory` under `params`.
///
/// Fails on a trajectory that does not fit the design or whose loads do not match their
/// states; an outcome that is merely impossible under `params` yields a zero-probability
/// term instead.
pub fn evaluate_individual(
    params: &Parameters,
    design: &Design,
    trajectory: &IndividualTrajectory,
    visitor: &mut impl TermVisitor,
) -> Result<()> {
    trajectory.check_structure(design, params.spec)?;
    let individual = trajectory.individual;
    let plan = &design.individuals[individual];
    let conditioned = params.spec.variant.conditions_on_first_capture();
    if conditioned && trajectory.first_capture != plan.first_capture {
        return Err(ModelError::Design(format!(
            "individual {individual} is first captured at {:?} in the data but {:?} in the design",
            trajectory.first_capture, plan.first_capture
        )));
    }
    let start = chain_start(params, plan.first_capture).ok_or_else(|| {
        ModelError::Design(format!("individual {individual} has no first capture"))
    })?;

    let mut previous = None;
    for (t, record) in trajectory.primaries.iter().enumerate() {
        let record = match (record, t < start) {
            (None, true) => continue,
            (Some(record), false) => record,
            (Some(_), true) => {
                return Err(ModelError::structural(
                    individual,
                    format!("record at primary {t} before the chain starts at {start}"),
                ));
            }
            (None, false) => {
                return Err(ModelError::structural(
                    individual,
                    format!("no ecological state at primary {t}"),
                ));
            }
        };

        let at = Coordinates::primary(individual, t);
        let (distribution, layer) = ecological_distribution(params, design, individual, t, previous)?;
        visitor.visit(Term::Categorical(CategoricalTerm::new(
            at,
            layer,
            &distribution,
            record.ecological.index(),
        )));
        if let Some(value) = record.load {
            visitor.visit(Term::Normal(NormalTerm {
                at,
                level: LoadLevel::Individual,
                mean: params.loads.mu,
                sd: params.loads.sigma_individual,
                value,
            }));
        }

        for (k, secondary) in record.secondaries.iter().enumerate() {
            let Some(secondary) = secondary else { continue };
            let certain = conditioned && plan.first_capture == Some(Occasion::new(t, k));
            evaluate_secondary(params, at.secondary(k), certain, record, secondary, visitor)?;
        }
        previous = Some((record.ecological, record.load));
    }
    Ok(())
}

fn evaluate_secondary(
    params: &Parameters,
    at: Coordinates,
    certain: bool,
    primary: &PrimaryRecord,
    secondary: &SecondaryRecord,
    visitor: &mut impl TermVisitor,
) -> Result<()> {
    let t = at.primary;
    let capture = observation_tpm(params.p1.at(t), params.p2.at(t), certain);
    visitor.visit(Term::Categorical(CategoricalTerm::new(
        at,
        Layer::Observed,
        capture.row(primary.ecological.index()),
        secondary.observed.index(),
    )));

    match (&params.sample, secondary.sample) {
        (Some(detection), Some(sample)) => {
            let tpm = sample_tpm(detection, primary.load);
            visitor.visit(Term::Categorical(CategoricalTerm::new(
                at,
                Layer::Sample,
                tpm.row(secondary.observed.index()),
                sample.index(),
            )));
            if let Some(value) = secondary.sample_load {
                visitor.visit(Term::Normal(NormalTerm {
                    at,
                    level: LoadLevel::Sample,
                    mean: primary.load.unwrap_or(0.0),
                    sd: params.loads.sigma_sample,
                    value,
                }));
            }
        }
        (None, None) => {}
        _ => {
            return Err(ModelError::structural(
                at.individual,
                format!("sample layer at {at:?} does not match the model"),
            ));
        }
    }

    let (parent, parent_load) =
        diagnostic_parent(secondary.observed, secondary.sample, secondary.sample_load, primary.load);
    let diagnostic = diagnostic_tpm(&params.diagnostic, parent_load);
    for (run_index, run) in secondary.runs.iter().enumerate() {
        let at = at.run(run_index);
        visitor.visit(Term::Categorical(CategoricalTerm::new(
            at,
            Layer::Diagnostic,
            diagnostic.row(parent),
            run.state.index(),
        )));
        if let Some(value) = run.load {
            visitor.visit(Term::Normal(NormalTerm {
                at,
                level: LoadLevel::Diagnostic,
                mean: parent_load.unwrap_or(0.0),
                sd: params.loads.sigma_diagnostic,
                value,
            }));
        }
    }
    Ok(())
}
