/*!

Named, independently seeded random streams.

Every source of randomness is declared with [`define_rng!`], and every individual gets its
own instance of each stream. The seed of stream `R` for individual `i` is derived from the
base seed, the stream's name and `i`, so:
 - results do not depend on how individuals are scheduled across threads,
 - changing how one layer consumes randomness (say, adding a diagnostic run) leaves the
   draws of every other layer untouched.

*/

use crate::hashing::{hash_str, mix_index};
use rand::{
    distr::{
        uniform::{SampleRange, SampleUniform},
        weighted::WeightedIndex,
    },
    prelude::Distribution,
    Rng, SeedableRng,
};
use rustc_hash::FxHashMap;
use std::any::{Any, TypeId};

pub trait RngId: Any + Send + Sized {
    #![allow(non_upper_case_globals)]
    const new: &'static dyn Fn(u64) -> Self;
    const name: &'static str;
    type RngType: SeedableRng + Rng;
    fn rng(&mut self) -> &mut Self::RngType;
}

/// The random streams of a single individual. Streams are created lazily on first use.
pub struct RandomStreams {
    base_seed: u64,
    individual: u64,
    rng_map: FxHashMap<TypeId, Box<dyn Any + Send>>,
}

impl RandomStreams {
    #[must_use]
    pub fn new(base_seed: u64, individual: usize) -> Self {
        RandomStreams {
            base_seed,
            individual: individual as u64,
            rng_map: FxHashMap::default(),
        }
    }

    pub fn get_rng<R: RngId>(&mut self) -> &mut R::RngType {
        let (base_seed, individual) = (self.base_seed, self.individual);
        self.rng_map
            .entry(TypeId::of::<R>())
            .or_insert_with(|| {
                let seed = mix_index(base_seed.wrapping_add(hash_str(R::name)), individual);
                Box::new((R::new)(seed))
            })
            .downcast_mut::<R>()
            // Only an `R` is ever stored under `TypeId::of::<R>()`.
            .map(|stream| stream.rng())
            .unwrap_or_else(|| unreachable!("stream {} stored under a foreign TypeId", R::name))
    }
}

pub trait ContextRandomExt {
    fn rng_streams(&mut self) -> &mut RandomStreams;

    /// Applies `sampler` to the stream `R`.
    fn sample<R: RngId, T>(&mut self, sampler: impl FnOnce(&mut R::RngType) -> T) -> T {
        sampler(self.rng_streams().get_rng::<R>())
    }

    /// Draws from `distribution` using the stream `R`.
    fn sample_distr<R: RngId, T>(&mut self, distribution: impl Distribution<T>) -> T {
        distribution.sample(self.rng_streams().get_rng::<R>())
    }

    /// Draws uniformly from `range` using the stream `R`.
    fn sample_range<R: RngId, S, T>(&mut self, range: S) -> T
    where
        S: SampleRange<T>,
        T: SampleUniform,
    {
        self.sample::<R, T>(|rng| rng.random_range(range))
    }

    /// Returns `true` with probability `p` using the stream `R`.
    fn sample_bool<R: RngId>(&mut self, p: f64) -> bool {
        self.sample::<R, bool>(|rng| rng.random_bool(p.clamp(0.0, 1.0)))
    }

    /// Draws an index with probability proportional to `weights` using the stream `R`.
    ///
    /// # Panics
    /// If the weights are all zero, negative or non-finite. Weights here are rows of
    /// transition matrices, which are validated to be stochastic.
    fn sample_weighted<R: RngId>(&mut self, weights: &[f64]) -> usize {
        let index = WeightedIndex::new(weights)
            .unwrap_or_else(|error| panic!("invalid categorical weights {weights:?}: {error}"));
        index.sample(self.rng_streams().get_rng::<R>())
    }
}

impl ContextRandomExt for RandomStreams {
    fn rng_streams(&mut self) -> &mut RandomStreams {
        self
    }
}

#[macro_export]
macro_rules! define_rng {
    ($random_id:ident) => {
        $crate::define_rng!($random_id, $crate::rand::rngs::StdRng);
    };
    ($random_id:ident, $rng_type:ty) => {
        pub struct $random_id {
            rng: $rng_type,
        }

        impl $crate::random::RngId for $random_id {
            #![allow(non_upper_case_globals)]
            type RngType = $rng_type;
            const name: &'static str = stringify!($random_id);
            const new: &'static dyn Fn(u64) -> Self = &|seed| {
                use $crate::rand::SeedableRng;
                Self {
                    rng: <$rng_type>::seed_from_u64(seed),
                }
            };

            fn rng(&mut self) -> &mut Self::RngType {
                &mut self.rng
            }
        }
    };
}
pub use define_rng;
