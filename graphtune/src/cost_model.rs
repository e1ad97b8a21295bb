//! Cost models rank configurations before they are measured.
//!
//! Scores are only meaningful relative to each other: lower means the model expects a faster
//! kernel. Each tuning session owns its model; nothing here is shared between tasks.

use crate::records::TuningRecord;
use crate::space::{Configuration, ConfigurationSpace, KnobValue};

use enum_dispatch::enum_dispatch;
use log::debug;

const DEFAULT_ROUNDS: usize = 64;
const DEFAULT_LEARNING_RATE: f64 = 0.3;
/// Added to the worst observed log-cost to get the training target of a failed configuration.
const FAILURE_PENALTY: f64 = 1.0;

#[enum_dispatch]
pub trait CostModel {
    /// Learn from newly completed measurements. Earlier observations are kept.
    fn update(&mut self, records: &[TuningRecord]);

    /// One score per configuration, in order.
    fn predict(&self, configs: &[Configuration]) -> Vec<f64>;
}

#[derive(Debug, Clone)]
#[enum_dispatch(CostModel)]
pub enum CostModelKind {
    NullModel(NullModel),
    BoostedStumps(BoostedStumps),
}

/// Scores everything the same. Used by strategies that ignore the model.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullModel;

/// Gradient-boosted regression stumps over knob values, fit to log-cost with squared loss.
///
/// Every update refits from scratch on all observations so far.
#[derive(Debug, Clone)]
pub struct BoostedStumps {
    space: ConfigurationSpace,
    rounds: usize,
    learning_rate: f64,
    features: Vec<Vec<f64>>,
    /// Log-cost of each observation, or `None` for a failure.
    outcomes: Vec<Option<f64>>,
    base: f64,
    stumps: Vec<Stump>,
}

#[derive(Debug, Clone, Copy)]
struct Stump {
    feature: usize,
    threshold: f64,
    left: f64,
    right: f64,
}

impl CostModel for NullModel {
    fn update(&mut self, _records: &[TuningRecord]) {}

    fn predict(&self, configs: &[Configuration]) -> Vec<f64> {
        vec![0.0; configs.len()]
    }
}

impl BoostedStumps {
    pub fn new(space: ConfigurationSpace) -> Self {
        BoostedStumps::with_rounds(space, DEFAULT_ROUNDS, DEFAULT_LEARNING_RATE)
    }

    pub fn with_rounds(space: ConfigurationSpace, rounds: usize, learning_rate: f64) -> Self {
        BoostedStumps {
            space,
            rounds,
            learning_rate,
            features: vec![],
            outcomes: vec![],
            base: 0.0,
            stumps: vec![],
        }
    }

    pub fn observations(&self) -> usize {
        self.outcomes.len()
    }

    fn featurize(config: &Configuration) -> Vec<f64> {
        config
            .values()
            .iter()
            .zip(config.digits())
            .map(|((_, value), &digit)| match value {
                KnobValue::Int(v) => *v as f64,
                KnobValue::Bool(b) => f64::from(u8::from(*b)),
                KnobValue::Str(_) => digit as f64,
            })
            .collect()
    }

    fn score(&self, features: &[f64]) -> f64 {
        self.base
            + self.learning_rate
                * self
                    .stumps
                    .iter()
                    .map(|s| {
                        if features[s.feature] <= s.threshold {
                            s.left
                        } else {
                            s.right
                        }
                    })
                    .sum::<f64>()
    }

    fn refit(&mut self) {
        self.stumps.clear();
        let Some(worst) = self.outcomes.iter().flatten().copied().reduce(f64::max) else {
            self.base = 0.0;
            return;
        };
        let targets = self
            .outcomes
            .iter()
            .map(|o| o.unwrap_or(worst + FAILURE_PENALTY))
            .collect::<Vec<_>>();
        let n = targets.len();
        self.base = targets.iter().sum::<f64>() / n as f64;

        let feature_count = self.space.knobs().len();
        let orders = (0..feature_count)
            .map(|f| {
                let mut order = (0..n).collect::<Vec<_>>();
                order.sort_by(|&a, &b| self.features[a][f].total_cmp(&self.features[b][f]));
                order
            })
            .collect::<Vec<_>>();

        let mut predictions = vec![self.base; n];
        for _ in 0..self.rounds {
            let residuals = targets
                .iter()
                .zip(&predictions)
                .map(|(t, p)| t - p)
                .collect::<Vec<_>>();
            let Some(stump) = self.best_stump(&orders, &residuals) else {
                break;
            };
            for (i, p) in predictions.iter_mut().enumerate() {
                let leaf = if self.features[i][stump.feature] <= stump.threshold {
                    stump.left
                } else {
                    stump.right
                };
                *p += self.learning_rate * leaf;
            }
            self.stumps.push(stump);
        }
        debug!(
            "Fit {} stumps to {} observations",
            self.stumps.len(),
            self.outcomes.len()
        );
    }

    /// The split that most reduces squared error of `residuals`, if any split reduces it.
    fn best_stump(&self, orders: &[Vec<usize>], residuals: &[f64]) -> Option<Stump> {
        let n = residuals.len();
        let total: f64 = residuals.iter().sum();
        let mut best_gain = total * total / n as f64 + 1e-12;
        let mut best = None;
        for (feature, order) in orders.iter().enumerate() {
            let mut left_sum = 0.0;
            for (i, pair) in order.windows(2).enumerate() {
                left_sum += residuals[pair[0]];
                let (lo, hi) = (self.features[pair[0]][feature], self.features[pair[1]][feature]);
                if lo == hi {
                    continue;
                }
                let left_n = (i + 1) as f64;
                let right_n = (n - i - 1) as f64;
                let right_sum = total - left_sum;
                let gain = left_sum * left_sum / left_n + right_sum * right_sum / right_n;
                if gain > best_gain {
                    best_gain = gain;
                    best = Some(Stump {
                        feature,
                        threshold: (lo + hi) / 2.0,
                        left: left_sum / left_n,
                        right: right_sum / right_n,
                    });
                }
            }
        }
        best
    }
}

impl CostModel for BoostedStumps {
    fn update(&mut self, records: &[TuningRecord]) {
        for record in records {
            let config = match self.space.decode(record.config) {
                Ok(config) => config,
                Err(e) => {
                    debug!("Ignoring record for config {}: {e}", record.config);
                    continue;
                }
            };
            self.features.push(Self::featurize(&config));
            // Costs can be 0 for trivially cheap kernels; keep the log finite.
            self.outcomes
                .push(record.cost().map(|c| c.max(f64::MIN_POSITIVE).ln()));
        }
        self.refit();
    }

    fn predict(&self, configs: &[Configuration]) -> Vec<f64> {
        configs
            .iter()
            .map(|c| self.score(&Self::featurize(c)))
            .collect()
    }
}
