//! The categorical states of each layer of the hierarchy.
//!
//! Each enum has a fixed index used to address rows and columns of transition matrices
//! and entries of categorical probability vectors.

use serde::{Deserialize, Serialize};

/// Latent ecological state of an individual at a primary occasion.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EcologicalState {
    /// Not yet recruited (recruitment variant only).
    NotEntered,
    Uninfected,
    Infected,
    Dead,
}

impl EcologicalState {
    pub const COUNT: usize = 4;
    pub const ALL: [EcologicalState; 4] = [
        EcologicalState::NotEntered,
        EcologicalState::Uninfected,
        EcologicalState::Infected,
        EcologicalState::Dead,
    ];

    #[inline]
    #[must_use]
    pub fn index(self) -> usize {
        self as usize
    }

    #[must_use]
    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    #[must_use]
    pub fn is_alive(self) -> bool {
        matches!(self, EcologicalState::Uninfected | EcologicalState::Infected)
    }

    /// The alive state with the given infection status.
    #[must_use]
    pub fn alive(infected: bool) -> Self {
        if infected {
            EcologicalState::Infected
        } else {
            EcologicalState::Uninfected
        }
    }
}

/// Capture outcome of a secondary survey, carrying the true infection status when caught.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObservedState {
    SeenUninfected,
    SeenInfected,
    NotSeen,
}

impl ObservedState {
    pub const COUNT: usize = 3;
    pub const ALL: [ObservedState; 3] = [
        ObservedState::SeenUninfected,
        ObservedState::SeenInfected,
        ObservedState::NotSeen,
    ];

    #[inline]
    #[must_use]
    pub fn index(self) -> usize {
        self as usize
    }

    #[must_use]
    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    #[must_use]
    pub fn is_seen(self) -> bool {
        self != ObservedState::NotSeen
    }

    /// The seen state matching an alive ecological state, `None` otherwise.
    #[must_use]
    pub fn seen_as(state: EcologicalState) -> Option<Self> {
        match state {
            EcologicalState::Uninfected => Some(ObservedState::SeenUninfected),
            EcologicalState::Infected => Some(ObservedState::SeenInfected),
            _ => None,
        }
    }
}

/// Pathogen status of the sample (swab) collected at a capture.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SampleState {
    Uninfected,
    Infected,
    NoSample,
}

impl SampleState {
    pub const COUNT: usize = 3;
    pub const ALL: [SampleState; 3] = [
        SampleState::Uninfected,
        SampleState::Infected,
        SampleState::NoSample,
    ];

    #[inline]
    #[must_use]
    pub fn index(self) -> usize {
        self as usize
    }

    #[must_use]
    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }
}

/// Outcome of one diagnostic run on a sample.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DiagnosticState {
    Uninfected,
    Infected,
    NoRun,
}

impl DiagnosticState {
    pub const COUNT: usize = 3;
    pub const ALL: [DiagnosticState; 3] = [
        DiagnosticState::Uninfected,
        DiagnosticState::Infected,
        DiagnosticState::NoRun,
    ];

    #[inline]
    #[must_use]
    pub fn index(self) -> usize {
        self as usize
    }

    #[must_use]
    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }
}
