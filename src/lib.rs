pub mod cascade;
pub mod dataset;
pub mod design;
mod error;
pub mod expm;
mod hashing;
pub mod hazard;
pub mod history;
pub mod log;
pub mod matrix;
pub mod model;
pub mod params;
pub mod random;
pub mod state;
pub mod transition;

// Streams declared with `define_rng!` name their generator through the crate.
pub use rand;
pub use rand_distr;

pub use cascade::{CategoricalTerm, LoadLevel, NormalTerm, Term, TermVisitor};
pub use dataset::{Dataset, IndividualTrajectory, ObservationHistory};
pub use design::{Design, Occasion};
pub use error::{ModelError, ParameterRejection, Result};
pub use history::LoadRecord;
pub use model::Model;
pub use params::{ModelSpec, ParamValue, ParameterMap, Parameters, SamplingLayer, Variant};
pub use state::{DiagnosticState, EcologicalState, ObservedState, SampleState};
