use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use std::time::{SystemTime, UNIX_EPOCH};

/// A measured or predicted cost in seconds. Lower is better.
pub type CostSecs = f64;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[serde(rename_all = "lowercase")]
pub enum TargetId {
    #[default]
    X86,
    Arm,
}

/// A data-arrangement choice for a node's tensors, such as `NCHW` or `NCHW8c`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(transparent)]
pub struct Layout(String);

/// How repeated observations of the same quantity are reduced to one number.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
#[serde(rename_all = "snake_case")]
pub enum Aggregation {
    #[default]
    Min,
    Mean,
    /// Mean after discarding the lowest and highest fifth of the samples.
    TrimmedMean,
}

impl Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetId::X86 => write!(f, "x86"),
            TargetId::Arm => write!(f, "arm"),
        }
    }
}

impl Display for Aggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Aggregation::Min => write!(f, "min"),
            Aggregation::Mean => write!(f, "mean"),
            Aggregation::TrimmedMean => write!(f, "trimmed-mean"),
        }
    }
}

impl Layout {
    pub fn new(name: impl Into<String>) -> Self {
        Layout(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Layout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Layout {
    fn from(name: &str) -> Self {
        Layout::new(name)
    }
}

pub fn nchw() -> Layout {
    Layout::new("NCHW")
}

pub fn nhwc() -> Layout {
    Layout::new("NHWC")
}

impl Aggregation {
    /// Reduce `samples` to one value. Returns `None` for an empty slice.
    pub fn apply(&self, samples: &[f64]) -> Option<f64> {
        if samples.is_empty() {
            return None;
        }
        match self {
            Aggregation::Min => samples.iter().copied().reduce(f64::min),
            Aggregation::Mean => Some(samples.iter().sum::<f64>() / samples.len() as f64),
            Aggregation::TrimmedMean => {
                let mut sorted = samples.to_vec();
                sorted.sort_by(f64::total_cmp);
                let trim = sorted.len() / 5;
                let kept = &sorted[trim..sorted.len() - trim];
                Some(kept.iter().sum::<f64>() / kept.len() as f64)
            }
        }
    }
}

/// Seconds since the Unix epoch, as stored in log records.
pub fn unix_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_trimmed_mean_drops_outliers() {
        let samples = [1.0, 2.0, 2.0, 2.0, 100.0];
        assert_eq!(Aggregation::TrimmedMean.apply(&samples), Some(2.0));
        assert_eq!(Aggregation::Min.apply(&samples), Some(1.0));
        assert_eq!(Aggregation::Mean.apply(&samples), Some(21.4));
    }

    #[test]
    fn test_aggregation_of_nothing_is_none() {
        assert_eq!(Aggregation::Min.apply(&[]), None);
        assert_eq!(Aggregation::TrimmedMean.apply(&[]), None);
    }

    proptest! {
        #[test]
        fn test_aggregate_is_within_sample_bounds(
            aggregation in any::<Aggregation>(),
            samples in prop::collection::vec(0.0f64..1e3, 1..32)
        ) {
            let lo = samples.iter().copied().fold(f64::INFINITY, f64::min);
            let hi = samples.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            let v = aggregation.apply(&samples).unwrap();
            prop_assert!(v >= lo - 1e-9 && v <= hi + 1e-9);
        }
    }
}
