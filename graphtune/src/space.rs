//! Discrete, index-addressable configuration spaces.
//!
//! A [ConfigurationSpace] is the Cartesian product of its [Knob]s' value lists. Every point is
//! addressed by a single [ConfigIdx] using a mixed-radix encoding in which the first knob varies
//! fastest, so that a record holding only an index can always be decoded again.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use std::hash::{Hash, Hasher};

pub type ConfigIdx = u64;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(untagged)]
pub enum KnobValue {
    Int(i64),
    Bool(bool),
    Str(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct Knob {
    pub name: String,
    pub values: Vec<KnobValue>,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct ConfigurationSpace {
    knobs: Vec<Knob>,
    #[serde(skip)]
    size: u64,
}

/// One point of a [ConfigurationSpace].
///
/// Equality and hashing consider only the index; comparing [Configuration]s from different
/// spaces is meaningless.
#[derive(Clone, Debug)]
pub struct Configuration {
    index: ConfigIdx,
    digits: Vec<usize>,
    values: Vec<(String, KnobValue)>,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SpaceError {
    #[error("Configuration index {index} is out of range for a space of size {size}")]
    IndexOutOfRange { index: ConfigIdx, size: u64 },
    #[error("Knob '{0}' has no values")]
    EmptyKnob(String),
    #[error("Knob {knob} has {len} values; digit {digit} is out of range")]
    DigitOutOfRange { knob: usize, digit: usize, len: usize },
    #[error("Expected {expected} knob digits, got {got}")]
    WrongArity { expected: usize, got: usize },
    #[error("Configuration space is too large to index")]
    Overflow,
}

impl ConfigurationSpace {
    pub fn new(knobs: Vec<Knob>) -> Result<Self, SpaceError> {
        let mut size: u64 = 1;
        for knob in &knobs {
            if knob.values.is_empty() {
                return Err(SpaceError::EmptyKnob(knob.name.clone()));
            }
            size = size
                .checked_mul(knob.values.len() as u64)
                .ok_or(SpaceError::Overflow)?;
        }
        Ok(ConfigurationSpace { knobs, size })
    }

    /// The number of configurations. A space without knobs has exactly one.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn knobs(&self) -> &[Knob] {
        &self.knobs
    }

    /// The number of values of each knob, in knob order.
    pub fn radices(&self) -> impl DoubleEndedIterator<Item = usize> + ExactSizeIterator + '_ {
        self.knobs.iter().map(|k| k.values.len())
    }

    /// Split `index` into one digit per knob.
    pub fn digits(&self, index: ConfigIdx) -> Result<Vec<usize>, SpaceError> {
        if index >= self.size {
            return Err(SpaceError::IndexOutOfRange {
                index,
                size: self.size,
            });
        }
        let mut rest = index;
        Ok(self
            .radices()
            .map(|radix| {
                let radix = radix as u64;
                let digit = rest % radix;
                rest /= radix;
                digit as usize
            })
            .collect())
    }

    /// Inverse of [Self::digits].
    pub fn encode(&self, digits: &[usize]) -> Result<ConfigIdx, SpaceError> {
        if digits.len() != self.knobs.len() {
            return Err(SpaceError::WrongArity {
                expected: self.knobs.len(),
                got: digits.len(),
            });
        }
        let mut index: u64 = 0;
        for (knob, (&digit, radix)) in digits.iter().zip(self.radices()).enumerate().rev() {
            if digit >= radix {
                return Err(SpaceError::DigitOutOfRange {
                    knob,
                    digit,
                    len: radix,
                });
            }
            // Cannot overflow: the product of all radices fits in a u64.
            index = index * radix as u64 + digit as u64;
        }
        Ok(index)
    }

    pub fn decode(&self, index: ConfigIdx) -> Result<Configuration, SpaceError> {
        let digits = self.digits(index)?;
        let values = self
            .knobs
            .iter()
            .zip(&digits)
            .map(|(knob, &d)| (knob.name.clone(), knob.values[d].clone()))
            .collect();
        Ok(Configuration {
            index,
            digits,
            values,
        })
    }

    /// Iterate over every configuration in index order.
    pub fn iter(&self) -> impl Iterator<Item = Configuration> + '_ {
        (0..self.size).filter_map(|i| self.decode(i).ok())
    }
}

impl<'de> Deserialize<'de> for ConfigurationSpace {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Raw {
            knobs: Vec<Knob>,
        }
        let raw = Raw::deserialize(deserializer)?;
        ConfigurationSpace::new(raw.knobs).map_err(serde::de::Error::custom)
    }
}

impl Configuration {
    pub fn index(&self) -> ConfigIdx {
        self.index
    }

    pub fn digits(&self) -> &[usize] {
        &self.digits
    }

    pub fn values(&self) -> &[(String, KnobValue)] {
        &self.values
    }

    pub fn get(&self, knob: &str) -> Option<&KnobValue> {
        self.values.iter().find(|(n, _)| n == knob).map(|(_, v)| v)
    }
}

impl PartialEq for Configuration {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index
    }
}

impl Eq for Configuration {}

impl Hash for Configuration {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.index.hash(state);
    }
}

impl Display for Configuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} [", self.index)?;
        for (i, (name, value)) in self.values.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{name}={value}")?;
        }
        write!(f, "]")
    }
}

impl Display for KnobValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KnobValue::Int(v) => write!(f, "{v}"),
            KnobValue::Bool(v) => write!(f, "{v}"),
            KnobValue::Str(v) => f.write_str(v),
        }
    }
}

impl Knob {
    pub fn ints(name: impl Into<String>, values: impl IntoIterator<Item = i64>) -> Self {
        Knob {
            name: name.into(),
            values: values.into_iter().map(KnobValue::Int).collect(),
        }
    }
}

#[cfg(test)]
pub(crate) fn arb_space() -> impl proptest::strategy::Strategy<Value = ConfigurationSpace> {
    use proptest::prelude::*;

    prop::collection::vec(1..6usize, 0..4).prop_map(|radices| {
        let knobs = radices
            .into_iter()
            .enumerate()
            .map(|(i, r)| Knob::ints(format!("k{i}"), 0..r as i64))
            .collect();
        ConfigurationSpace::new(knobs).unwrap()
    })
}
