/*!

The parameter vector: a flat mapping from parameter names to values, validated against the
model variant before any simulation or likelihood work happens.

Parameters arrive as a [`ParameterMap`], typically deserialised from JSON:

```json
{
  "pi": 0.3, "phi1": 0.4, "phi2": 0.4, "beta_phi": 0.1,
  "psi12": 0.5, "psi21": 0.3, "p1": [0.6, 0.5, 0.7], "p2": 0.6,
  "r_sample": 0.5, "fp_sample": 0.02, "r_diag": 0.4, "fp_diag": 0.05,
  "mu_load": 3.0, "sigma_load": 1.0, "sigma_sample": 0.5, "sigma_diag": 0.3
}
```

[`Parameters::from_map`] turns that into a typed [`Parameters`], rejecting values outside
their domain with a [`ParameterRejection`]. Names the variant does not use are ignored only
if they are known; unknown names are a configuration error.

*/

use crate::{
    error::{ModelError, ParameterRejection, Result},
    hazard::DetectionFunction,
};
use log::debug;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::{fs::File, io::BufReader, path::Path};

/// A scalar, or one value per primary occasion.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Scalar(f64),
    Vector(Vec<f64>),
}

impl ParamValue {
    /// The value at primary occasion `t`. Vector lengths are checked against the design
    /// before use, see [`Parameters::check_occasions`].
    #[inline]
    #[must_use]
    pub fn at(&self, t: usize) -> f64 {
        match self {
            ParamValue::Scalar(value) => *value,
            ParamValue::Vector(values) => values[t],
        }
    }

    fn values(&self) -> &[f64] {
        match self {
            ParamValue::Scalar(value) => std::slice::from_ref(value),
            ParamValue::Vector(values) => values,
        }
    }
}

impl From<f64> for ParamValue {
    fn from(value: f64) -> Self {
        ParamValue::Scalar(value)
    }
}

impl From<Vec<f64>> for ParamValue {
    fn from(values: Vec<f64>) -> Self {
        ParamValue::Vector(values)
    }
}

pub type ParameterMap = FxHashMap<String, ParamValue>;

/// Builds a [`ParameterMap`] from `(name, value)` pairs.
pub fn parameter_map<'a, V, I>(pairs: I) -> ParameterMap
where
    V: Into<ParamValue>,
    I: IntoIterator<Item = (&'a str, V)>,
{
    pairs
        .into_iter()
        .map(|(name, value)| (name.to_string(), value.into()))
        .collect()
}

/// Every parameter name the engine understands.
pub const PARAMETER_NAMES: [&str; 17] = [
    "pi",
    "phi1",
    "phi2",
    "beta_phi",
    "psi12",
    "psi21",
    "p1",
    "p2",
    "gamma",
    "r_sample",
    "fp_sample",
    "r_diag",
    "fp_diag",
    "mu_load",
    "sigma_load",
    "sigma_sample",
    "sigma_diag",
];

/// Which ecological process generates the latent chain.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Variant {
    /// Hazards over unequal continuous intervals, conditioned on first capture.
    ContinuousTime,
    /// Discrete-time multistate Arnason-Schwarz, conditioned on first capture.
    ArnasonSchwarz,
    /// Discrete-time with recruitment from a not-yet-entered state.
    JollySeber,
}

impl Variant {
    #[must_use]
    pub fn conditions_on_first_capture(self) -> bool {
        !matches!(self, Variant::JollySeber)
    }
}

/// Whether pathogen sampling is a separate layer between capture and diagnostics.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplingLayer {
    Separate,
    Merged,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelSpec {
    pub variant: Variant,
    pub sampling: SamplingLayer,
}

impl ModelSpec {
    #[must_use]
    pub fn new(variant: Variant, sampling: SamplingLayer) -> Self {
        ModelSpec { variant, sampling }
    }
}

/// Dispersions and location of the three load levels (log scale).
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct LoadParams {
    pub mu: f64,
    pub sigma_individual: f64,
    pub sigma_sample: f64,
    pub sigma_diagnostic: f64,
}

/// A validated parameter vector for one [`ModelSpec`].
#[derive(Clone, Debug, PartialEq)]
pub struct Parameters {
    pub spec: ModelSpec,
    /// Probability that an individual enters (or is first captured) infected.
    pub pi: f64,
    /// Mortality hazard (continuous time) or survival probability (discrete time).
    pub phi1: f64,
    pub phi2: f64,
    /// Load dependence of infected mortality.
    pub beta_phi: f64,
    /// Infection gain and loss, as rates or probabilities.
    pub psi12: f64,
    pub psi21: f64,
    pub p1: ParamValue,
    pub p2: ParamValue,
    pub gamma: Option<ParamValue>,
    pub sample: Option<DetectionFunction>,
    pub diagnostic: DetectionFunction,
    pub loads: LoadParams,
}

struct Reader<'a> {
    map: &'a ParameterMap,
}

impl Reader<'_> {
    fn value(&self, name: &str) -> std::result::Result<&ParamValue, ParameterRejection> {
        self.map
            .get(name)
            .ok_or_else(|| ParameterRejection::new(name, "a required value (missing)"))
    }

    fn scalar(&self, name: &str) -> std::result::Result<f64, ParameterRejection> {
        match self.value(name)? {
            ParamValue::Scalar(value) => Ok(*value),
            ParamValue::Vector(_) => Err(ParameterRejection::new(name, "a scalar value")),
        }
    }

    fn scalar_or(&self, name: &str, default: f64) -> std::result::Result<f64, ParameterRejection> {
        if self.map.contains_key(name) {
            self.scalar(name)
        } else {
            Ok(default)
        }
    }
}

fn check(
    name: &str,
    value: &ParamValue,
    constraint: &str,
    ok: impl Fn(f64) -> bool,
) -> std::result::Result<(), ParameterRejection> {
    if value.values().iter().all(|&x| x.is_finite() && ok(x)) {
        Ok(())
    } else {
        Err(ParameterRejection::new(name, constraint))
    }
}

fn open_unit(x: f64) -> bool {
    x > 0.0 && x < 1.0
}

fn closed_unit(x: f64) -> bool {
    (0.0..=1.0).contains(&x)
}

impl Parameters {
    /// Validates `map` for `spec`.
    ///
    /// Unknown names are a [`ModelError::Config`]; missing or out-of-domain values are a
    /// [`ModelError::Rejected`].
    pub fn from_map(map: &ParameterMap, spec: ModelSpec) -> Result<Parameters> {
        if let Some(unknown) = map.keys().find(|k| !PARAMETER_NAMES.contains(&k.as_str())) {
            return Err(ModelError::Config(format!("unknown parameter `{unknown}`")));
        }
        Self::validate(map, spec).map_err(|rejection| {
            debug!("rejecting parameters: {rejection}");
            ModelError::Rejected(rejection)
        })
    }

    pub fn from_json_str(json: &str, spec: ModelSpec) -> Result<Parameters> {
        let map: ParameterMap = serde_json::from_str(json)?;
        Self::from_map(&map, spec)
    }

    pub fn from_json_file(path: impl AsRef<Path>, spec: ModelSpec) -> Result<Parameters> {
        let reader = BufReader::new(File::open(path)?);
        let map: ParameterMap = serde_json::from_reader(reader)?;
        Self::from_map(&map, spec)
    }

    fn validate(
        map: &ParameterMap,
        spec: ModelSpec,
    ) -> std::result::Result<Parameters, ParameterRejection> {
        let reader = Reader { map };
        let scalar = |name: &str, constraint: &str, ok: fn(f64) -> bool| {
            let value = reader.scalar(name)?;
            check(name, &ParamValue::Scalar(value), constraint, ok)?;
            Ok::<f64, ParameterRejection>(value)
        };

        let pi = scalar("pi", "0 <= pi <= 1", closed_unit)?;
        let (phi1, phi2, psi12, psi21) = match spec.variant {
            Variant::ContinuousTime => (
                scalar("phi1", "a positive hazard", |x| x > 0.0)?,
                scalar("phi2", "a positive hazard", |x| x > 0.0)?,
                scalar("psi12", "a positive rate", |x| x > 0.0)?,
                scalar("psi21", "a positive rate", |x| x > 0.0)?,
            ),
            Variant::ArnasonSchwarz | Variant::JollySeber => (
                scalar("phi1", "0 < phi1 < 1", open_unit)?,
                scalar("phi2", "0 < phi2 < 1", open_unit)?,
                scalar("psi12", "0 < psi12 < 1", open_unit)?,
                scalar("psi21", "0 < psi21 < 1", open_unit)?,
            ),
        };
        let beta_phi = reader.scalar_or("beta_phi", 0.0)?;
        if !beta_phi.is_finite() {
            return Err(ParameterRejection::new("beta_phi", "a finite slope"));
        }

        let p1 = reader.value("p1")?.clone();
        check("p1", &p1, "0 < p1 < 1", open_unit)?;
        let p2 = reader.value("p2")?.clone();
        check("p2", &p2, "0 < p2 < 1", open_unit)?;

        let gamma = match spec.variant {
            Variant::JollySeber => {
                let gamma = reader.value("gamma")?.clone();
                check("gamma", &gamma, "0 <= gamma <= 1", closed_unit)?;
                Some(gamma)
            }
            _ => None,
        };

        let diagnostic =
            DetectionFunction::new("r_diag", reader.scalar("r_diag")?, "fp_diag", reader.scalar("fp_diag")?)?;
        let non_negative = |x: f64| x >= 0.0;
        let (sample, sigma_sample) = match spec.sampling {
            SamplingLayer::Separate => (
                Some(DetectionFunction::new(
                    "r_sample",
                    reader.scalar("r_sample")?,
                    "fp_sample",
                    reader.scalar("fp_sample")?,
                )?),
                scalar("sigma_sample", "sigma_sample >= 0", non_negative)?,
            ),
            SamplingLayer::Merged => (None, 0.0),
        };

        let loads = LoadParams {
            mu: scalar("mu_load", "a finite mean", |_| true)?,
            sigma_individual: scalar("sigma_load", "sigma_load >= 0", non_negative)?,
            sigma_sample,
            sigma_diagnostic: scalar("sigma_diag", "sigma_diag >= 0", non_negative)?,
        };

        Ok(Parameters {
            spec,
            pi,
            phi1,
            phi2,
            beta_phi,
            psi12,
            psi21,
            p1,
            p2,
            gamma,
            sample,
            diagnostic,
            loads,
        })
    }

    /// Checks that every per-occasion vector has one entry per primary occasion.
    pub fn check_occasions(&self, n_primary: usize) -> Result<()> {
        let vectors = [("p1", Some(&self.p1)), ("p2", Some(&self.p2)), ("gamma", self.gamma.as_ref())];
        for (name, value) in vectors {
            if let Some(ParamValue::Vector(values)) = value {
                if values.len() != n_primary {
                    return Err(ModelError::Design(format!(
                        "`{name}` has {} values for {n_primary} primary occasions",
                        values.len()
                    )));
                }
            }
        }
        Ok(())
    }

    /// Capture probability at primary occasion `t` for an alive individual.
    #[inline]
    #[must_use]
    pub fn capture_probability(&self, infected: bool, t: usize) -> f64 {
        if infected { self.p2.at(t) } else { self.p1.at(t) }
    }

    /// Recruitment probability at primary occasion `t` (recruitment variant only).
    #[must_use]
    pub fn recruitment(&self, t: usize) -> f64 {
        self.gamma.as_ref().map_or(0.0, |gamma| gamma.at(t))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;

    pub(crate) fn base_map() -> ParameterMap {
        parameter_map([
            ("pi", 0.3),
            ("phi1", 0.4),
            ("phi2", 0.4),
            ("beta_phi", 0.1),
            ("psi12", 0.5),
            ("psi21", 0.3),
            ("p1", 0.6),
            ("p2", 0.7),
            ("gamma", 0.3),
            ("r_sample", 0.5),
            ("fp_sample", 0.02),
            ("r_diag", 0.4),
            ("fp_diag", 0.05),
            ("mu_load", 3.0),
            ("sigma_load", 1.0),
            ("sigma_sample", 0.5),
            ("sigma_diag", 0.3),
        ])
    }

    pub(crate) fn params_for(spec: ModelSpec) -> Parameters {
        let mut map = base_map();
        if spec.variant != Variant::ContinuousTime {
            map.insert("phi1".into(), 0.9.into());
            map.insert("phi2".into(), 0.8.into());
        }
        Parameters::from_map(&map, spec).unwrap()
    }

    #[test]
    fn valid_map_is_accepted() {
        let spec = ModelSpec::new(Variant::ContinuousTime, SamplingLayer::Separate);
        let params = Parameters::from_map(&base_map(), spec).unwrap();
        assert_eq!(params.psi12, 0.5);
        assert!(params.gamma.is_none());
        assert_eq!(params.sample.unwrap().r, 0.5);
        assert_eq!(params.loads.sigma_sample, 0.5);
    }

    #[test]
    fn unknown_name_is_a_config_error() {
        let mut map = base_map();
        map.insert("rho".into(), 0.1.into());
        let spec = ModelSpec::new(Variant::ArnasonSchwarz, SamplingLayer::Merged);
        assert!(matches!(Parameters::from_map(&map, spec), Err(ModelError::Config(_))));
    }

    #[test]
    fn missing_required_value_is_rejected() {
        let mut map = base_map();
        map.remove("gamma");
        let spec = ModelSpec::new(Variant::JollySeber, SamplingLayer::Merged);
        let error = Parameters::from_map(&map, spec).unwrap_err();
        assert!(error.is_rejection());

        // Merged sampling does not need the sample-layer parameters.
        let mut map = base_map();
        for name in ["r_sample", "fp_sample", "sigma_sample"] {
            map.remove(name);
        }
        map.insert("phi1".into(), 0.9.into());
        map.insert("phi2".into(), 0.8.into());
        let spec = ModelSpec::new(Variant::ArnasonSchwarz, SamplingLayer::Merged);
        assert!(Parameters::from_map(&map, spec).is_ok());
    }

    #[test]
    fn false_positive_must_stay_below_detection_increment() {
        let mut map = base_map();
        map.insert("fp_diag".into(), 0.4.into());
        let spec = ModelSpec::new(Variant::ContinuousTime, SamplingLayer::Merged);
        match Parameters::from_map(&map, spec) {
            Err(ModelError::Rejected(rejection)) => assert_eq!(rejection.parameter, "fp_diag"),
            other => panic!("expected a rejection, got {other:?}"),
        }
    }

    #[test]
    fn discrete_variants_need_probabilities() {
        // phi1 = 0.4 is fine as a probability, but 1.5 is not.
        let mut map = base_map();
        map.insert("phi1".into(), 1.5.into());
        let spec = ModelSpec::new(Variant::ArnasonSchwarz, SamplingLayer::Merged);
        assert!(Parameters::from_map(&map, spec).unwrap_err().is_rejection());

        // The same value is a valid hazard.
        let spec = ModelSpec::new(Variant::ContinuousTime, SamplingLayer::Merged);
        assert!(Parameters::from_map(&map, spec).is_ok());
    }

    #[test]
    fn negative_dispersion_is_rejected() {
        let mut map = base_map();
        map.insert("sigma_load".into(), (-0.1).into());
        let spec = ModelSpec::new(Variant::ContinuousTime, SamplingLayer::Merged);
        assert!(Parameters::from_map(&map, spec).unwrap_err().is_rejection());
    }

    #[test]
    fn per_occasion_vectors() {
        let mut map = base_map();
        map.insert("p1".into(), vec![0.2, 0.4, 0.6].into());
        let spec = ModelSpec::new(Variant::ContinuousTime, SamplingLayer::Separate);
        let params = Parameters::from_map(&map, spec).unwrap();
        assert_eq!(params.capture_probability(false, 2), 0.6);
        assert_eq!(params.capture_probability(true, 2), 0.7);
        assert!(params.check_occasions(3).is_ok());
        assert!(matches!(params.check_occasions(4), Err(ModelError::Design(_))));

        map.insert("p1".into(), vec![0.2, 1.0].into());
        assert!(Parameters::from_map(&map, spec).unwrap_err().is_rejection());
    }

    #[test]
    fn vector_where_scalar_expected_is_rejected() {
        let mut map = base_map();
        map.insert("pi".into(), vec![0.1, 0.2].into());
        let spec = ModelSpec::new(Variant::ContinuousTime, SamplingLayer::Merged);
        assert!(Parameters::from_map(&map, spec).unwrap_err().is_rejection());
    }

    #[test]
    fn loads_from_json() {
        let json = serde_json::to_string(&base_map()).unwrap();
        let spec = ModelSpec::new(Variant::ContinuousTime, SamplingLayer::Separate);
        let from_str = Parameters::from_json_str(&json, spec).unwrap();

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(json.as_bytes()).unwrap();
        let from_file = Parameters::from_json_file(file.path(), spec).unwrap();
        assert_eq!(from_str, from_file);

        assert!(matches!(
            Parameters::from_json_str("{\"pi\": \"high\"}", spec),
            Err(ModelError::Config(_))
        ));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let spec = ModelSpec::new(Variant::ContinuousTime, SamplingLayer::Separate);
        let dir = tempfile::tempdir().unwrap();
        let result = Parameters::from_json_file(dir.path().join("absent.json"), spec);
        assert!(matches!(result, Err(ModelError::Io(_))));
    }
}
