use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::traits::{TraitSpec, TraitValue};

/// Named collection of candidates usable to resolve a reference trait.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetPool {
    pub name: String,
    #[serde(default)]
    pub candidates: Vec<Candidate>,
    /// Child pools, for pool-of-pools (`multi_reference`) traits.
    #[serde(default)]
    pub children: Vec<String>,
}

impl AssetPool {
    pub fn new(name: impl Into<String>, candidates: Vec<Candidate>) -> Self {
        Self {
            name: name.into(),
            candidates,
            children: Vec::new(),
        }
    }

    pub fn with_children(name: impl Into<String>, children: Vec<String>) -> Self {
        Self {
            name: name.into(),
            candidates: Vec::new(),
            children,
        }
    }

    pub fn candidate(&self, name: &str) -> Option<&Candidate> {
        self.candidates.iter().find(|c| c.name == name)
    }

    /// First candidate with a custom weight or restrictions, else the first
    /// candidate. Stands in for the whole pool when it is itself a choice.
    pub fn representative(&self) -> Option<&Candidate> {
        self.candidates
            .iter()
            .find(|c| c.weight < 1.0 || !c.restrictions.is_empty())
            .or_else(|| self.candidates.first())
    }

    pub fn represents_none(&self) -> bool {
        self.candidates.iter().any(|c| c.represents_none)
    }
}

/// One selectable item in an [`AssetPool`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub name: String,
    #[serde(default = "default_weight")]
    pub weight: f64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub restrictions: Vec<Restriction>,
    /// Label written to metadata instead of `name`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trait_value: Option<String>,
    #[serde(default)]
    pub represents_none: bool,
    /// Nested trait set exposed once this candidate is chosen.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub traits: Vec<TraitSpec>,
}

fn default_weight() -> f64 {
    1.0
}

impl Candidate {
    pub fn new(name: impl Into<String>, weight: f64) -> Self {
        Self {
            name: name.into(),
            weight,
            restrictions: Vec::new(),
            trait_value: None,
            represents_none: false,
            traits: Vec::new(),
        }
    }

    pub fn restricted(mut self, restriction: Restriction) -> Self {
        self.restrictions.push(restriction);
        self
    }

    pub fn with_traits(mut self, traits: Vec<TraitSpec>) -> Self {
        self.traits = traits;
        self
    }

    /// Value reported in metadata for this candidate.
    pub fn label(&self) -> &str {
        self.trait_value.as_deref().unwrap_or(&self.name)
    }

    /// Whether a metadata value names this candidate.
    pub fn matches(&self, value: &str) -> bool {
        let value = value.trim();
        self.name.trim().eq_ignore_ascii_case(value) || self.label().trim().eq_ignore_ascii_case(value)
    }

    /// Any-match eligibility: no restrictions, or at least one that holds.
    pub fn is_eligible(&self, context: &HashMap<String, TraitValue>) -> bool {
        self.restrictions.is_empty() || self.restrictions.iter().any(|r| r.holds(context))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparator {
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = ">")]
    Gt,
}

impl fmt::Display for Comparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Comparator::Eq => "==",
            Comparator::Ne => "!=",
            Comparator::Lt => "<",
            Comparator::Gt => ">",
        })
    }
}

/// A `(trait, comparator, value)` predicate gating a candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Restriction {
    #[serde(rename = "trait")]
    pub trait_name: String,
    pub comparator: Comparator,
    pub value: TraitValue,
}

impl Restriction {
    pub fn new(trait_name: impl Into<String>, comparator: Comparator, value: TraitValue) -> Self {
        Self {
            trait_name: trait_name.into(),
            comparator,
            value,
        }
    }

    /// Evaluates against the resolution context. A trait that has not been
    /// resolved yet never satisfies a restriction.
    pub fn holds(&self, context: &HashMap<String, TraitValue>) -> bool {
        let Some(actual) = context.get(&self.trait_name) else {
            return false;
        };
        match self.comparator {
            Comparator::Eq => actual.loosely_eq(&self.value),
            Comparator::Ne => !actual.loosely_eq(&self.value),
            Comparator::Lt => matches!((actual.as_f64(), self.value.as_f64()), (Some(a), Some(b)) if a < b),
            Comparator::Gt => matches!((actual.as_f64(), self.value.as_f64()), (Some(a), Some(b)) if a > b),
        }
    }
}

impl fmt::Display for Restriction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.trait_name, self.comparator, self.value)
    }
}
