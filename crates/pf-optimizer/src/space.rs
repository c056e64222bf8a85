//! Parameter space: the coordinate system and box constraints of every free
//! variable, plus random initialisation from the declared distributions.

use pf_types::{
    internal_error, ConfigError, Distribution, EvaluationError, ParameterSet, PfResult, VariableSpec,
};
use rand::Rng;
use rand_distr::StandardNormal;
use std::collections::HashSet;

/// The space a variable moves in.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Coordinate {
    /// Additive moves, clamped to [low, high].
    Linear { low: f64, high: f64 },
    /// Moves are added to log10 of the value, clamped to [low, high].
    Log { low: f64, high: f64 },
    /// Never moved.
    Fixed,
}

impl Coordinate {
    fn for_distribution(distribution: &Distribution) -> Self {
        match distribution {
            Distribution::Uniform { low, high } => Self::Linear {
                low: *low,
                high: *high,
            },
            Distribution::LogUniform { low, high } | Distribution::LogNormal { low, high, .. } => {
                Self::Log {
                    low: *low,
                    high: *high,
                }
            }
            Distribution::Choice { .. } => Self::Fixed,
        }
    }
}

/// One free variable.
#[derive(Debug, Clone, PartialEq)]
pub struct SpaceEntry {
    pub name: String,
    pub distribution: Distribution,
    pub coordinate: Coordinate,
}

impl SpaceEntry {
    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        match &self.distribution {
            Distribution::Uniform { low, high } => rng.random_range(*low..=*high),
            Distribution::LogUniform { low, high } => {
                let exp = rng.random_range(low.log10()..=high.log10());
                10f64.powf(exp).clamp(*low, *high)
            }
            Distribution::LogNormal {
                mean,
                std_dev,
                low,
                high,
            } => {
                let exp = mean + std_dev * rng.sample::<f64, _>(StandardNormal);
                10f64.powf(exp).clamp(*low, *high)
            }
            Distribution::Choice { values } => values[rng.random_range(0..values.len())],
        }
    }

    /// Number of distinct values the variable can take, `None` if unbounded.
    fn distinct_values(&self) -> Option<usize> {
        match (&self.coordinate, &self.distribution) {
            (Coordinate::Linear { low, high }, _) | (Coordinate::Log { low, high }, _) => {
                (low == high).then_some(1)
            }
            (Coordinate::Fixed, Distribution::Choice { values }) => {
                let mut distinct = values.clone();
                distinct.sort_by(f64::total_cmp);
                distinct.dedup_by(|a, b| a == b);
                Some(distinct.len())
            }
            (Coordinate::Fixed, _) => Some(1),
        }
    }

    fn contains(&self, value: f64) -> bool {
        match (&self.coordinate, &self.distribution) {
            (Coordinate::Linear { low, high }, _) | (Coordinate::Log { low, high }, _) => {
                value >= *low && value <= *high
            }
            (Coordinate::Fixed, Distribution::Choice { values }) => values.contains(&value),
            (Coordinate::Fixed, _) => true,
        }
    }
}

/// Per-variable metadata for a run, built once from the configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterSpace {
    entries: Vec<SpaceEntry>,
}

impl ParameterSpace {
    pub fn from_specs(specs: &[VariableSpec]) -> PfResult<Self> {
        if specs.is_empty() {
            return Err(ConfigError::NoVariables.into());
        }

        let mut seen = HashSet::new();
        let mut entries = Vec::with_capacity(specs.len());
        for spec in specs {
            if !seen.insert(spec.name.as_str()) {
                return Err(ConfigError::DuplicateVariable {
                    name: spec.name.clone(),
                }
                .into());
            }
            spec.validate()?;
            entries.push(SpaceEntry {
                name: spec.name.clone(),
                coordinate: Coordinate::for_distribution(&spec.distribution),
                distribution: spec.distribution.clone(),
            });
        }
        Ok(Self { entries })
    }

    /// Variable names in declaration order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.name.as_str())
    }

    pub fn entries(&self) -> &[SpaceEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of distinct parameter sets in the space, `None` when any
    /// variable is continuous.
    pub fn distinct_points(&self) -> Option<usize> {
        self.entries
            .iter()
            .try_fold(1usize, |acc, e| Some(acc.saturating_mul(e.distinct_values()?)))
    }

    pub fn entry(&self, name: &str) -> PfResult<&SpaceEntry> {
        self.entries.iter().find(|e| e.name == name).ok_or_else(|| {
            EvaluationError::MissingVariable {
                name: name.to_string(),
            }
            .into()
        })
    }

    /// `set[name]` moved by `delta` in the variable's own coordinate system,
    /// clamped to its bounds. Fixed variables ignore `delta`.
    pub fn add(&self, set: &ParameterSet, name: &str, delta: f64) -> PfResult<f64> {
        let value = set.value(name)?;
        let moved = match self.entry(name)?.coordinate {
            Coordinate::Linear { low, high } => (value + delta).clamp(low, high),
            Coordinate::Log { low, high } => 10f64.powf(value.log10() + delta).clamp(low, high),
            Coordinate::Fixed => value,
        };
        Ok(moved)
    }

    /// `a[name] - b[name]` measured in the variable's coordinate system.
    pub fn difference(&self, a: &ParameterSet, b: &ParameterSet, name: &str) -> PfResult<f64> {
        let (va, vb) = (a.value(name)?, b.value(name)?);
        let diff = match self.entry(name)?.coordinate {
            Coordinate::Linear { .. } => va - vb,
            Coordinate::Log { .. } => (va / vb).log10(),
            Coordinate::Fixed => 0.0,
        };
        Ok(diff)
    }

    /// Apply `add` to every variable, taking each delta from `delta`,
    /// producing a new set.
    pub fn step<F>(&self, set: &ParameterSet, mut delta: F) -> PfResult<ParameterSet>
    where
        F: FnMut(&str) -> PfResult<f64>,
    {
        let mut moved = Vec::with_capacity(self.entries.len());
        for entry in &self.entries {
            let d = delta(&entry.name)?;
            moved.push((entry.name.clone(), self.add(set, &entry.name, d)?));
        }
        Ok(ParameterSet::from_pairs(moved))
    }

    /// Move `set` by one delta per variable, in declaration order.
    pub fn translate(&self, set: &ParameterSet, deltas: &[f64]) -> PfResult<ParameterSet> {
        let mut deltas = deltas.iter().copied();
        self.step(set, |name| {
            deltas
                .next()
                .ok_or_else(|| internal_error!("no delta supplied for variable {name}"))
        })
    }

    /// A fresh set drawn from every variable's distribution.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> ParameterSet {
        ParameterSet::from_pairs(
            self.entries
                .iter()
                .map(|e| (e.name.clone(), e.sample(rng))),
        )
    }

    /// Whether `set` declares exactly this space's variables, each within
    /// its bounds.
    pub fn contains(&self, set: &ParameterSet) -> bool {
        set.len() == self.entries.len()
            && self
                .entries
                .iter()
                .all(|e| set.get(&e.name).is_some_and(|v| e.contains(v)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn space() -> ParameterSpace {
        ParameterSpace::from_specs(&[
            VariableSpec::uniform("lin", 0.0, 10.0),
            VariableSpec::log_uniform("log", 0.01, 1e5),
            VariableSpec::log_normal("lnorm", 0.0, 1.0, 1e-3, 1e3),
            VariableSpec::choice("fixed", vec![1.0, 2.0, 4.0]),
        ])
        .unwrap()
    }

    fn pset(lin: f64, log: f64) -> ParameterSet {
        ParameterSet::from_pairs([("lin", lin), ("log", log), ("lnorm", 1.0), ("fixed", 2.0)])
    }

    #[test]
    fn coordinates_follow_distributions() {
        let s = space();
        assert_eq!(s.entry("lin").unwrap().coordinate, Coordinate::Linear { low: 0.0, high: 10.0 });
        assert_eq!(s.entry("log").unwrap().coordinate, Coordinate::Log { low: 0.01, high: 1e5 });
        assert_eq!(s.entry("lnorm").unwrap().coordinate, Coordinate::Log { low: 1e-3, high: 1e3 });
        assert_eq!(s.entry("fixed").unwrap().coordinate, Coordinate::Fixed);
        assert_eq!(s.names().collect::<Vec<_>>(), vec!["lin", "log", "lnorm", "fixed"]);
    }

    #[test]
    fn linear_add_clamps_to_bounds() {
        let s = space();
        let p = pset(9.0, 1.0);
        assert_eq!(s.add(&p, "lin", 0.5).unwrap(), 9.5);
        assert_eq!(s.add(&p, "lin", 5.0).unwrap(), 10.0);
        assert_eq!(s.add(&p, "lin", -50.0).unwrap(), 0.0);
    }

    #[test]
    fn log_add_moves_in_decades() {
        let s = space();
        let p = pset(1.0, 10.0);
        assert!((s.add(&p, "log", 1.0).unwrap() - 100.0).abs() < 1e-9);
        assert!((s.add(&p, "log", -2.0).unwrap() - 0.1).abs() < 1e-12);
        assert_eq!(s.add(&p, "log", 10.0).unwrap(), 1e5);
        assert_eq!(s.add(&p, "log", -10.0).unwrap(), 0.01);
    }

    #[test]
    fn fixed_add_is_a_no_op() {
        let s = space();
        let p = pset(1.0, 1.0);
        assert_eq!(s.add(&p, "fixed", 3.7).unwrap(), 2.0);
        assert_eq!(s.difference(&p, &pset(5.0, 5.0), "fixed").unwrap(), 0.0);
    }

    #[test]
    fn difference_respects_coordinates() {
        let s = space();
        let a = pset(7.0, 1000.0);
        let b = pset(2.0, 10.0);
        assert_eq!(s.difference(&a, &b, "lin").unwrap(), 5.0);
        assert!((s.difference(&a, &b, "log").unwrap() - 2.0).abs() < 1e-12);
    }

    #[test]
    fn add_inverts_difference_when_unclamped() {
        let s = space();
        let a = pset(7.25, 500.0);
        let base = pset(3.5, 2.0);
        let d = s.difference(&a, &base, "lin").unwrap();
        assert_eq!(s.add(&base, "lin", d).unwrap(), 7.25);

        let d = s.difference(&a, &base, "log").unwrap();
        assert!((s.add(&base, "log", d).unwrap() - 500.0).abs() < 1e-9);
    }

    #[test]
    fn add_always_stays_in_bounds() {
        let s = space();
        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..500 {
            let p = s.sample(&mut rng);
            let delta = rng.random_range(-100.0..100.0);
            let lin = s.add(&p, "lin", delta).unwrap();
            assert!((0.0..=10.0).contains(&lin));
            let log = s.add(&p, "log", delta / 10.0).unwrap();
            assert!((0.01..=1e5).contains(&log), "log out of bounds: {log}");
        }
    }

    #[test]
    fn samples_respect_declared_bounds() {
        let s = space();
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..200 {
            let p = s.sample(&mut rng);
            assert!(s.contains(&p), "sample out of bounds: {p}");
        }
    }

    #[test]
    fn unknown_variable_is_an_error() {
        let s = space();
        let p = pset(1.0, 1.0);
        assert!(s.add(&p, "nope", 1.0).is_err());
        let partial = ParameterSet::from_pairs([("lin", 1.0)]);
        assert!(s.difference(&partial, &p, "log").is_err());
    }

    #[test]
    fn duplicate_and_empty_declarations_rejected() {
        assert!(ParameterSpace::from_specs(&[]).is_err());
        let dup = [VariableSpec::uniform("x", 0.0, 1.0), VariableSpec::uniform("x", 0.0, 2.0)];
        assert!(ParameterSpace::from_specs(&dup).is_err());
    }

    #[test]
    fn step_moves_every_variable() {
        let s = space();
        let p = pset(5.0, 10.0);
        let moved = s.step(&p, |name| Ok(if name == "lin" { 1.0 } else { 0.0 })).unwrap();
        assert_eq!(moved.get("lin"), Some(6.0));
        assert_eq!(moved.get("log"), Some(10.0));
        assert_eq!(moved.get("fixed"), Some(2.0));
    }

    #[test]
    fn translate_takes_deltas_in_declaration_order() {
        let s = space();
        let p = pset(5.0, 10.0);
        let moved = s.translate(&p, &[-1.0, 1.0, 0.0, 9.0]).unwrap();
        assert_eq!(moved.get("lin"), Some(4.0));
        assert!((moved.get("log").unwrap() - 100.0).abs() < 1e-9);
        assert_eq!(moved.get("fixed"), Some(2.0));
        assert!(s.translate(&p, &[1.0]).is_err());
    }

    #[test]
    fn distinct_points_counts_discrete_spaces() {
        let continuous = ParameterSpace::from_specs(&[
            VariableSpec::choice("c", vec![1.0, 2.0]),
            VariableSpec::uniform("x", 0.0, 1.0),
        ])
        .unwrap();
        assert_eq!(continuous.distinct_points(), None);

        let discrete = ParameterSpace::from_specs(&[
            VariableSpec::choice("c", vec![1.0, 2.0, 2.0, 3.0]),
            VariableSpec::choice("d", vec![0.0, -0.0]),
            VariableSpec::uniform("pinned", 5.0, 5.0),
        ])
        .unwrap();
        assert_eq!(discrete.distinct_points(), Some(3));
    }

    #[test]
    fn log_normal_samples_centre_on_mean_exponent() {
        let space = ParameterSpace::from_specs(&[VariableSpec::log_normal(
            "k", 1.0, 0.5, 0.01, 1e4,
        )])
        .unwrap();
        let mut rng = StdRng::seed_from_u64(5);
        let n = 20_000;
        let mean_exp = (0..n)
            .map(|_| space.sample(&mut rng).get("k").unwrap().log10())
            .sum::<f64>()
            / n as f64;
        assert!((mean_exp - 1.0).abs() < 0.05, "mean exponent = {mean_exp}");
    }
}
