/*!

Transition probability matrices for every layer of the hierarchy.

The ecological matrix is always 4×4 over [`EcologicalState`], whatever the variant:
 - continuous time: `exp(Qτ)` over {uninfected, infected, dead}, embedded with an inert
   not-yet-entered row,
 - Arnason-Schwarz: assembled directly from survival and switching probabilities,
 - Jolly-Seber: as Arnason-Schwarz plus recruitment out of not-yet-entered.

Observation layers (robust design: one capture draw per secondary survey, one sample per
capture, one diagnostic outcome per run) are rectangular matrices whose rows are the
parent layer's states.

*/

use crate::{
    error::ParameterRejection,
    expm::{self, ExpMethod},
    hazard::{mortality_hazard, mortality_probability, DetectionFunction, Hazards},
    matrix::{Matrix, SquareMatrix},
    params::{Parameters, Variant},
    state::{DiagnosticState, EcologicalState, ObservedState, SampleState},
};

pub type EcologicalTpm = SquareMatrix<{ EcologicalState::COUNT }>;
/// Rows: ecological state. Columns: observed state.
pub type ObservationTpm = Matrix<{ EcologicalState::COUNT }, { ObservedState::COUNT }>;
/// Rows: observed state. Columns: sample state.
pub type SampleTpm = Matrix<{ ObservedState::COUNT }, { SampleState::COUNT }>;
/// Rows: parent state (sample, or observed when sampling is merged). Columns: diagnostic state.
pub type DiagnosticTpm = Matrix<3, { DiagnosticState::COUNT }>;

const NE: usize = 0;
const U: usize = 1;
const I: usize = 2;
const D: usize = 3;

/// The ecological transition matrix into primary occasion `t`.
///
/// `load` is the individual's load at the previous occasion if infected there; `tau` is the
/// interval between the two occasions (continuous time only). Recruitment into `t` uses
/// `gamma[t]`, so entry before the first occasion uses `gamma[0]`.
pub fn ecological_tpm(
    params: &Parameters,
    t: usize,
    load: Option<f64>,
    tau: f64,
) -> Result<EcologicalTpm, ParameterRejection> {
    Ok(match params.spec.variant {
        Variant::ContinuousTime => continuous_ecological_tpm(params, load, tau)?.0,
        Variant::ArnasonSchwarz => discrete_ecological_tpm(params, load, None),
        Variant::JollySeber => discrete_ecological_tpm(params, load, Some(params.recruitment(t))),
    })
}

/// Continuous-time ecological matrix over an interval `tau`, and the method that
/// produced it.
///
/// Rejects parameters whose hazards, at this load, overflow over the interval.
pub fn continuous_ecological_tpm(
    params: &Parameters,
    load: Option<f64>,
    tau: f64,
) -> Result<(EcologicalTpm, ExpMethod), ParameterRejection> {
    let hazards = Hazards {
        infection: params.psi12,
        recovery: params.psi21,
        mortality_uninfected: params.phi1,
        mortality_infected: mortality_hazard(params.phi2, params.beta_phi, load.unwrap_or(0.0)),
    };
    let q = hazards.generator()?;
    let exponential = is_finite(&q.scale(tau))
        .then(|| expm::transition_probabilities(&q, tau))
        .filter(|exponential| is_finite(&exponential.matrix))
        .ok_or_else(|| {
            ParameterRejection::new("phi1", format!("hazards finite over an interval of {tau}"))
        })?;

    let mut tpm = EcologicalTpm::zeros();
    tpm[(NE, NE)] = 1.0;
    for i in 0..3 {
        for j in 0..3 {
            tpm[(i + 1, j + 1)] = exponential.matrix[(i, j)];
        }
    }
    Ok((tpm, exponential.method))
}

fn is_finite<const N: usize>(m: &SquareMatrix<N>) -> bool {
    m.0.iter().flatten().all(|x| x.is_finite())
}

/// Discrete-time ecological matrix. With `recruitment = Some(gamma)` the not-yet-entered
/// row recruits with probability `gamma`, entering infected with probability `pi`.
#[must_use]
pub fn discrete_ecological_tpm(
    params: &Parameters,
    load: Option<f64>,
    recruitment: Option<f64>,
) -> EcologicalTpm {
    let phi1 = params.phi1;
    // phi2 is the infected survival probability at zero load; the load effect acts on the
    // mortality probability.
    let phi2 = 1.0 - mortality_probability(1.0 - params.phi2, params.beta_phi, load.unwrap_or(0.0));
    let (psi12, psi21) = (params.psi12, params.psi21);

    let mut tpm = EcologicalTpm::zeros();
    match recruitment {
        Some(gamma) => {
            tpm[(NE, NE)] = 1.0 - gamma;
            tpm[(NE, U)] = gamma * (1.0 - params.pi);
            tpm[(NE, I)] = gamma * params.pi;
        }
        None => tpm[(NE, NE)] = 1.0,
    }
    tpm[(U, U)] = phi1 * (1.0 - psi12);
    tpm[(U, I)] = phi1 * psi12;
    tpm[(U, D)] = 1.0 - phi1;
    tpm[(I, U)] = phi2 * psi21;
    tpm[(I, I)] = phi2 * (1.0 - psi21);
    tpm[(I, D)] = 1.0 - phi2;
    tpm[(D, D)] = 1.0;
    tpm
}

/// Distribution of the ecological state at the start of an individual's chain in the
/// variants conditioned on first capture.
#[must_use]
pub fn initial_distribution(params: &Parameters) -> [f64; EcologicalState::COUNT] {
    let mut probs = [0.0; EcologicalState::COUNT];
    probs[U] = 1.0 - params.pi;
    probs[I] = params.pi;
    probs
}

/// Capture matrix for one secondary survey. On the survey where an individual is first
/// captured (and the model conditions on it) capture is certain.
#[must_use]
pub fn observation_tpm(p_uninfected: f64, p_infected: f64, first_capture: bool) -> ObservationTpm {
    let (p1, p2) = if first_capture { (1.0, 1.0) } else { (p_uninfected, p_infected) };
    let seen_u = ObservedState::SeenUninfected.index();
    let seen_i = ObservedState::SeenInfected.index();
    let not_seen = ObservedState::NotSeen.index();

    let mut tpm = ObservationTpm::zeros();
    tpm[(NE, not_seen)] = 1.0;
    tpm[(U, seen_u)] = p1;
    tpm[(U, not_seen)] = 1.0 - p1;
    tpm[(I, seen_i)] = p2;
    tpm[(I, not_seen)] = 1.0 - p2;
    tpm[(D, not_seen)] = 1.0;
    tpm
}

/// Sample matrix: a captured individual is swabbed, the swab testing positive with the
/// false-positive rate if uninfected or `detect(load)` if infected.
#[must_use]
pub fn sample_tpm(detection: &DetectionFunction, individual_load: Option<f64>) -> SampleTpm {
    let uninfected_positive = detection.positive(None);
    let infected_positive = detection.positive(individual_load);

    let (s_u, s_i, s_none) = (
        SampleState::Uninfected.index(),
        SampleState::Infected.index(),
        SampleState::NoSample.index(),
    );
    let mut tpm = SampleTpm::zeros();
    tpm[(ObservedState::SeenUninfected.index(), s_u)] = 1.0 - uninfected_positive;
    tpm[(ObservedState::SeenUninfected.index(), s_i)] = uninfected_positive;
    tpm[(ObservedState::SeenInfected.index(), s_u)] = 1.0 - infected_positive;
    tpm[(ObservedState::SeenInfected.index(), s_i)] = infected_positive;
    tpm[(ObservedState::NotSeen.index(), s_none)] = 1.0;
    tpm
}

/// Diagnostic matrix given the parent's pathogen status. Row 0 is the pathogen-free parent,
/// row 1 the pathogen-carrying parent with `parent_load`, row 2 the absent parent (no
/// capture or no sample), which can only produce `NoRun`.
///
/// The same shape serves both the separate sampling layer (rows are [`SampleState`]) and the
/// merged one (rows are [`ObservedState`]); their indices coincide.
#[must_use]
pub fn diagnostic_tpm(detection: &DetectionFunction, parent_load: Option<f64>) -> DiagnosticTpm {
    let free_positive = detection.positive(None);
    let carrying_positive = detection.positive(parent_load);

    let (d_u, d_i, d_none) = (
        DiagnosticState::Uninfected.index(),
        DiagnosticState::Infected.index(),
        DiagnosticState::NoRun.index(),
    );
    let mut tpm = DiagnosticTpm::zeros();
    tpm[(0, d_u)] = 1.0 - free_positive;
    tpm[(0, d_i)] = free_positive;
    tpm[(1, d_u)] = 1.0 - carrying_positive;
    tpm[(1, d_i)] = carrying_positive;
    tpm[(2, d_none)] = 1.0;
    tpm
}
