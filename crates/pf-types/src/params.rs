//! Parameter sets: named assignments of values to every free variable.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};

use crate::errors::{EvaluationError, PfResult};

/// An immutable mapping from variable name to value.
///
/// Equality and hashing compare values bit-for-bit, so a set can key the
/// pending-job lookup of a strategy. `-0.0` is folded into `0.0` on
/// construction so the two never hash apart.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParameterSet {
    values: BTreeMap<String, f64>,
}

impl ParameterSet {
    pub fn new() -> Self {
        Self {
            values: BTreeMap::new(),
        }
    }

    pub fn from_pairs<I, S>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (S, f64)>,
        S: Into<String>,
    {
        Self {
            values: pairs
                .into_iter()
                .map(|(name, value)| (name.into(), normalize(value)))
                .collect(),
        }
    }

    /// Value of `name`, if declared.
    pub fn get(&self, name: &str) -> Option<f64> {
        self.values.get(name).copied()
    }

    /// Value of `name`, or an error naming the missing variable.
    pub fn value(&self, name: &str) -> PfResult<f64> {
        self.get(name).ok_or_else(|| {
            EvaluationError::MissingVariable {
                name: name.to_string(),
            }
            .into()
        })
    }

    /// A copy of this set with `name` replaced by `value`.
    pub fn with_value(&self, name: &str, value: f64) -> Self {
        let mut values = self.values.clone();
        values.insert(name.to_string(), normalize(value));
        Self { values }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.values.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }
}

fn normalize(value: f64) -> f64 {
    if value == 0.0 {
        0.0
    } else {
        value
    }
}

impl PartialEq for ParameterSet {
    fn eq(&self, other: &Self) -> bool {
        self.values.len() == other.values.len()
            && self
                .values
                .iter()
                .zip(other.values.iter())
                .all(|((ka, va), (kb, vb))| ka == kb && va.to_bits() == vb.to_bits())
    }
}

impl Eq for ParameterSet {}

impl Hash for ParameterSet {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_usize(self.values.len());
        for (name, value) in &self.values {
            name.hash(state);
            value.to_bits().hash(state);
        }
    }
}

impl fmt::Display for ParameterSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (name, value)) in self.values.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{name}: {value}")?;
        }
        write!(f, "}}")
    }
}

impl FromIterator<(String, f64)> for ParameterSet {
    fn from_iter<T: IntoIterator<Item = (String, f64)>>(iter: T) -> Self {
        Self::from_pairs(iter)
    }
}
