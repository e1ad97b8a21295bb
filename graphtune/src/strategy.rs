//! Search strategies propose the next batch of configurations to measure.
//!
//! No strategy proposes a configuration that [History] already holds, and none proposes the same
//! configuration twice in one batch. When fewer unmeasured configurations remain than were asked
//! for, a strategy returns what remains.

use crate::common::CostSecs;
use crate::cost_model::{BoostedStumps, CostModel, CostModelKind, NullModel};
use crate::measure::MeasureResult;
use crate::space::{ConfigIdx, Configuration, ConfigurationSpace};

use enum_dispatch::enum_dispatch;
use itertools::Itertools;
use rand::distributions::WeightedIndex;
use rand::prelude::*;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt::{self, Display};

/// Spaces at most this large are enumerated when sampling; larger ones are sampled by rejection.
const ENUMERATION_LIMIT: u64 = 1 << 20;
/// Candidates ranked by the model per proposal, for spaces too large to rank in full.
const MODEL_POOL_SIZE: usize = 4096;
const DEFAULT_EPSILON: f64 = 0.05;
const DEFAULT_POPULATION: usize = 50;
const DEFAULT_MUTATION_PROB: f64 = 0.1;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[serde(rename_all = "kebab-case")]
pub enum StrategyKind {
    /// Rank unmeasured configurations with a learned cost model.
    #[default]
    #[serde(alias = "xgb")]
    #[cfg_attr(feature = "clap", value(alias = "xgb"))]
    ModelGuided,
    #[serde(alias = "ga")]
    #[cfg_attr(feature = "clap", value(alias = "ga"))]
    Genetic,
    Random,
    /// Every configuration in index order.
    #[serde(alias = "gridsearch")]
    #[cfg_attr(feature = "clap", value(alias = "gridsearch"))]
    Exhaustive,
}

/// What a session has observed so far.
#[derive(Debug, Clone, Default)]
pub struct History {
    measured: HashSet<ConfigIdx>,
    /// Lowest observed cost of each configuration that succeeded at least once.
    costs: HashMap<ConfigIdx, CostSecs>,
    best: Option<(ConfigIdx, CostSecs)>,
}

#[enum_dispatch]
pub trait SearchStrategy {
    /// Up to `batch_size` distinct, unmeasured configurations of `space`.
    fn propose(
        &mut self,
        space: &ConfigurationSpace,
        model: &CostModelKind,
        history: &History,
        batch_size: usize,
    ) -> Vec<Configuration>;
}

#[derive(Debug, Clone)]
#[enum_dispatch(SearchStrategy)]
pub enum Strategy {
    ModelGuided(ModelGuided),
    Genetic(Genetic),
    RandomSearch(RandomSearch),
    Exhaustive(Exhaustive),
}

/// Takes the configurations the model scores best, swapping in a random candidate for each slot
/// with probability `epsilon`.
#[derive(Debug, Clone)]
pub struct ModelGuided {
    rng: StdRng,
    epsilon: f64,
}

/// Breeds new configurations from the best measured ones by uniform crossover over knob digits
/// and per-knob mutation. Parents are drawn with probability proportional to their cost rank.
#[derive(Debug, Clone)]
pub struct Genetic {
    rng: StdRng,
    population: usize,
    mutation_prob: f64,
}

#[derive(Debug, Clone)]
pub struct RandomSearch {
    rng: StdRng,
}

#[derive(Debug, Clone, Default)]
pub struct Exhaustive {
    next: ConfigIdx,
}

impl StrategyKind {
    /// The cost model this strategy should be paired with.
    pub fn cost_model(&self, space: &ConfigurationSpace) -> CostModelKind {
        match self {
            StrategyKind::ModelGuided => BoostedStumps::new(space.clone()).into(),
            StrategyKind::Genetic | StrategyKind::Random | StrategyKind::Exhaustive => {
                NullModel.into()
            }
        }
    }
}

impl Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StrategyKind::ModelGuided => write!(f, "model-guided"),
            StrategyKind::Genetic => write!(f, "genetic"),
            StrategyKind::Random => write!(f, "random"),
            StrategyKind::Exhaustive => write!(f, "exhaustive"),
        }
    }
}

impl Strategy {
    pub fn new(kind: StrategyKind, seed: u64) -> Self {
        let rng = StdRng::seed_from_u64(seed);
        match kind {
            StrategyKind::ModelGuided => ModelGuided {
                rng,
                epsilon: DEFAULT_EPSILON,
            }
            .into(),
            StrategyKind::Genetic => Genetic {
                rng,
                population: DEFAULT_POPULATION,
                mutation_prob: DEFAULT_MUTATION_PROB,
            }
            .into(),
            StrategyKind::Random => RandomSearch { rng }.into(),
            StrategyKind::Exhaustive => Exhaustive::default().into(),
        }
    }
}

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, config: ConfigIdx, result: &MeasureResult) {
        self.measured.insert(config);
        if let Some(cost) = result.cost() {
            let entry = self.costs.entry(config).or_insert(cost);
            *entry = entry.min(cost);
            if self.best.map_or(true, |(_, best)| cost < best) {
                self.best = Some((config, cost));
            }
        }
    }

    pub fn is_measured(&self, config: ConfigIdx) -> bool {
        self.measured.contains(&config)
    }

    pub fn measured_count(&self) -> u64 {
        self.measured.len() as u64
    }

    pub fn cost(&self, config: ConfigIdx) -> Option<CostSecs> {
        self.costs.get(&config).copied()
    }

    /// The lowest cost observed so far, and the configuration that achieved it first.
    pub fn best(&self) -> Option<(ConfigIdx, CostSecs)> {
        self.best
    }

    /// Successful configurations ordered by cost, then index.
    pub fn ranked(&self) -> Vec<(ConfigIdx, CostSecs)> {
        self.costs
            .iter()
            .map(|(&i, &c)| (i, c))
            .sorted_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)))
            .collect()
    }

    pub fn is_exhausted(&self, space: &ConfigurationSpace) -> bool {
        self.measured_count() >= space.size()
    }
}

impl SearchStrategy for ModelGuided {
    fn propose(
        &mut self,
        space: &ConfigurationSpace,
        model: &CostModelKind,
        history: &History,
        batch_size: usize,
    ) -> Vec<Configuration> {
        // Until something succeeds the model has nothing to rank by.
        if history.best().is_none() {
            return decode_all(
                space,
                sample_unmeasured(space, history, &HashSet::new(), batch_size, &mut self.rng),
            );
        }

        let pool = if space.size() <= MODEL_POOL_SIZE as u64 {
            (0..space.size())
                .filter(|&i| !history.is_measured(i))
                .collect()
        } else {
            sample_unmeasured(space, history, &HashSet::new(), MODEL_POOL_SIZE, &mut self.rng)
        };
        let pool = decode_all(space, pool);
        let scores = model.predict(&pool);
        let mut ranked = pool
            .into_iter()
            .zip(scores)
            .sorted_by(|(a, sa), (b, sb)| sa.total_cmp(sb).then(a.index().cmp(&b.index())))
            .map(|(c, _)| c)
            .collect::<Vec<_>>();

        let mut batch = Vec::with_capacity(batch_size.min(ranked.len()));
        while batch.len() < batch_size && !ranked.is_empty() {
            let pick = if self.rng.gen_bool(self.epsilon) {
                self.rng.gen_range(0..ranked.len())
            } else {
                0
            };
            batch.push(ranked.remove(pick));
        }
        batch
    }
}

impl SearchStrategy for Genetic {
    fn propose(
        &mut self,
        space: &ConfigurationSpace,
        _model: &CostModelKind,
        history: &History,
        batch_size: usize,
    ) -> Vec<Configuration> {
        let parents = history
            .ranked()
            .into_iter()
            .take(self.population)
            .filter_map(|(i, _)| space.digits(i).ok())
            .collect::<Vec<_>>();

        let mut chosen = HashSet::new();
        if parents.len() >= 2 {
            // Rank-proportional: the best parent weighs `parents.len()`, the worst 1.
            let weights = (1..=parents.len()).rev();
            if let Ok(selection) = WeightedIndex::new(weights) {
                let radices = space.radices().collect::<Vec<_>>();
                let attempts = batch_size.saturating_mul(20);
                for _ in 0..attempts {
                    if chosen.len() >= batch_size {
                        break;
                    }
                    let a = &parents[selection.sample(&mut self.rng)];
                    let b = &parents[selection.sample(&mut self.rng)];
                    let child = a
                        .iter()
                        .zip(b)
                        .zip(&radices)
                        .map(|((&da, &db), &radix)| {
                            if self.rng.gen_bool(self.mutation_prob) {
                                self.rng.gen_range(0..radix)
                            } else if self.rng.gen_bool(0.5) {
                                da
                            } else {
                                db
                            }
                        })
                        .collect::<Vec<_>>();
                    if let Ok(index) = space.encode(&child) {
                        if !history.is_measured(index) {
                            chosen.insert(index);
                        }
                    }
                }
            }
        }

        let mut batch = chosen.iter().copied().sorted().collect::<Vec<_>>();
        if batch.len() < batch_size {
            let fill = sample_unmeasured(
                space,
                history,
                &chosen,
                batch_size - batch.len(),
                &mut self.rng,
            );
            batch.extend(fill);
        }
        decode_all(space, batch)
    }
}

impl SearchStrategy for RandomSearch {
    fn propose(
        &mut self,
        space: &ConfigurationSpace,
        _model: &CostModelKind,
        history: &History,
        batch_size: usize,
    ) -> Vec<Configuration> {
        decode_all(
            space,
            sample_unmeasured(space, history, &HashSet::new(), batch_size, &mut self.rng),
        )
    }
}

impl SearchStrategy for Exhaustive {
    fn propose(
        &mut self,
        space: &ConfigurationSpace,
        _model: &CostModelKind,
        history: &History,
        batch_size: usize,
    ) -> Vec<Configuration> {
        let mut batch = Vec::with_capacity(batch_size);
        while batch.len() < batch_size && self.next < space.size() {
            if !history.is_measured(self.next) {
                batch.push(self.next);
            }
            self.next += 1;
        }
        decode_all(space, batch)
    }
}

/// Up to `n` distinct indices drawn uniformly from those neither measured nor in `exclude`.
fn sample_unmeasured<R: Rng>(
    space: &ConfigurationSpace,
    history: &History,
    exclude: &HashSet<ConfigIdx>,
    n: usize,
    rng: &mut R,
) -> Vec<ConfigIdx> {
    let available = |i: &ConfigIdx| !history.is_measured(*i) && !exclude.contains(i);
    if space.size() <= ENUMERATION_LIMIT {
        let candidates = (0..space.size()).filter(available).collect::<Vec<_>>();
        return candidates.choose_multiple(rng, n).copied().collect();
    }

    // Large spaces are almost entirely unmeasured, so rejection sampling finishes quickly.
    let mut picked = Vec::with_capacity(n);
    let mut seen = HashSet::new();
    for _ in 0..n.saturating_mul(64) {
        if picked.len() >= n {
            break;
        }
        let i = rng.gen_range(0..space.size());
        if available(&i) && seen.insert(i) {
            picked.push(i);
        }
    }
    picked
}

fn decode_all(space: &ConfigurationSpace, indices: Vec<ConfigIdx>) -> Vec<Configuration> {
    indices
        .into_iter()
        .filter_map(|i| space.decode(i).ok())
        .collect()
}
