/*!

The narrow interface an external inference engine drives.

A [`Model`] fixes the model variant and the design. Every call takes a fresh parameter map,
validates it, and works individual by individual in parallel; nothing is retained between
calls, so the same `Model` can score any number of proposals.

```ignore
let model = Model::new(spec, design)?;
let dataset = model.simulate(&params, 42)?;
let value = model.log_density(&params, &dataset)?;
```

*/

use crate::{
    cascade::{evaluate_individual, simulate_individual, LogLikelihood, Term},
    dataset::{Dataset, IndividualTrajectory, ObservationHistory},
    design::Design,
    error::{ModelError, Result},
    history,
    params::{ModelSpec, ParameterMap, Parameters},
};
use log::{debug, info};
use rayon::prelude::*;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

pub struct Model {
    spec: ModelSpec,
    design: Design,
    cancel: Option<Arc<AtomicBool>>,
}

impl Model {
    /// Validates `design` for `spec`'s variant.
    pub fn new(spec: ModelSpec, design: Design) -> Result<Self> {
        design.validate(spec.variant)?;
        Ok(Model {
            spec,
            design,
            cancel: None,
        })
    }

    /// Stops simulation and evaluation between individuals once `flag` is set.
    #[must_use]
    pub fn with_cancel(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    #[must_use]
    pub fn spec(&self) -> ModelSpec {
        self.spec
    }

    #[must_use]
    pub fn design(&self) -> &Design {
        &self.design
    }

    /// Validates `map` against the model's variant and the design's occasions.
    pub fn parameters(&self, map: &ParameterMap) -> Result<Parameters> {
        let params = Parameters::from_map(map, self.spec)?;
        params.check_occasions(self.design.n_primary)?;
        Ok(params)
    }

    fn check_cancelled(&self) -> Result<()> {
        match &self.cancel {
            Some(flag) if flag.load(Ordering::Relaxed) => Err(ModelError::Cancelled),
            _ => Ok(()),
        }
    }

    fn log_cancellation<T>(&self, what: &str, result: Result<T>) -> Result<T> {
        if let Err(ModelError::Cancelled) = &result {
            info!("{what} cancelled");
        }
        result
    }

    /// Simulates one trajectory per individual in the design.
    pub fn simulate(&self, map: &ParameterMap, seed: u64) -> Result<Dataset> {
        let params = self.parameters(map)?;
        info!(
            "simulating {} individuals over {} primary occasions (seed {seed})",
            self.design.n_individuals(),
            self.design.n_primary
        );
        let trajectories = (0..self.design.n_individuals())
            .into_par_iter()
            .map(|i| {
                self.check_cancelled()?;
                simulate_individual(&params, &self.design, i, seed)
            })
            .collect::<Result<Vec<_>>>();
        let trajectories = self.log_cancellation("simulation", trajectories)?;
        Ok(Dataset {
            spec: self.spec,
            trajectories,
        })
    }

    fn check_dataset(&self, dataset: &Dataset) -> Result<()> {
        if dataset.spec != self.spec {
            return Err(ModelError::Config(format!(
                "dataset recorded under {:?}, model is {:?}",
                dataset.spec, self.spec
            )));
        }
        if dataset.trajectories.len() != self.design.n_individuals() {
            return Err(ModelError::Design(format!(
                "{} trajectories for {} individuals in the design",
                dataset.trajectories.len(),
                self.design.n_individuals()
            )));
        }
        Ok(())
    }

    fn evaluate<T, F>(&self, map: &ParameterMap, dataset: &Dataset, per_individual: F) -> Result<Vec<T>>
    where
        T: Send,
        F: Fn(&Parameters, &IndividualTrajectory) -> Result<T> + Sync,
    {
        let params = self.parameters(map)?;
        self.check_dataset(dataset)?;
        let result = dataset
            .trajectories
            .par_iter()
            .map(|trajectory| {
                self.check_cancelled()?;
                per_individual(&params, trajectory)
            })
            .collect::<Result<Vec<T>>>();
        self.log_cancellation("evaluation", result)
    }

    /// Log-likelihood contribution of each individual, in dataset order.
    pub fn log_likelihood_by_individual(&self, map: &ParameterMap, dataset: &Dataset) -> Result<Vec<f64>> {
        self.evaluate(map, dataset, |params, trajectory| {
            let mut total = LogLikelihood::default();
            evaluate_individual(params, &self.design, trajectory, &mut total)?;
            Ok(total.0)
        })
    }

    /// The complete-data log-likelihood of `dataset`: categorical terms of every layer plus
    /// normal terms of every load.
    pub fn log_likelihood(&self, map: &ParameterMap, dataset: &Dataset) -> Result<f64> {
        let contributions = self.log_likelihood_by_individual(map, dataset)?;
        let total: f64 = contributions.iter().sum();
        debug!("log-likelihood {total} over {} individuals", contributions.len());
        Ok(total)
    }

    /// As [`Model::log_likelihood`], but parameters outside the support score negative
    /// infinity instead of failing.
    pub fn log_density(&self, map: &ParameterMap, dataset: &Dataset) -> Result<f64> {
        match self.log_likelihood(map, dataset) {
            Err(ModelError::Rejected(_)) => Ok(f64::NEG_INFINITY),
            result => result,
        }
    }

    /// Every likelihood term of `dataset`, grouped by individual in cascade order.
    pub fn terms(&self, map: &ParameterMap, dataset: &Dataset) -> Result<Vec<Term>> {
        let per_individual = self.evaluate(map, dataset, |params, trajectory| {
            let mut terms = Vec::new();
            evaluate_individual(params, &self.design, trajectory, &mut terms)?;
            Ok(terms)
        })?;
        Ok(per_individual.into_iter().flatten().collect())
    }

    /// Starting trajectories for the latent layers given observed histories.
    pub fn initial_values(&self, histories: &[ObservationHistory], seed: u64) -> Result<Dataset> {
        Ok(Dataset {
            spec: self.spec,
            trajectories: history::initial_values(histories, &self.design, self.spec, seed)?,
        })
    }
}
