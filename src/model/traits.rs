use std::fmt;

use serde::{Deserialize, Serialize};

/// Discretization step used for `Scalar` traits when none is declared.
pub const SCALAR_PRECISION: f64 = 0.01;

/// Declared input describing one generated attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraitSpec {
    pub name: String,
    #[serde(flatten)]
    pub kind: TraitKind,
}

/// The kind of a trait together with its domain.
///
/// Produced once from the authoring schema; the resolver never infers a kind
/// from the shape of a value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TraitKind {
    Scalar {
        min: f64,
        max: f64,
        #[serde(default = "default_precision")]
        precision: f64,
    },
    Integer {
        min: i64,
        max: i64,
    },
    /// One candidate picked from the named pool.
    Reference { pool: String },
    /// One child pool picked from the named pool-of-pools.
    MultiReference { pool: String },
    /// Free text; never sampled.
    String {
        #[serde(default)]
        default: String,
    },
}

fn default_precision() -> f64 {
    SCALAR_PRECISION
}

impl TraitSpec {
    pub fn scalar(name: impl Into<String>, min: f64, max: f64) -> Self {
        Self {
            name: name.into(),
            kind: TraitKind::Scalar {
                min,
                max,
                precision: SCALAR_PRECISION,
            },
        }
    }

    pub fn integer(name: impl Into<String>, min: i64, max: i64) -> Self {
        Self {
            name: name.into(),
            kind: TraitKind::Integer { min, max },
        }
    }

    pub fn reference(name: impl Into<String>, pool: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: TraitKind::Reference { pool: pool.into() },
        }
    }

    pub fn multi_reference(name: impl Into<String>, pool: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: TraitKind::MultiReference { pool: pool.into() },
        }
    }

    pub fn text(name: impl Into<String>, default: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: TraitKind::String {
                default: default.into(),
            },
        }
    }

    /// Pool consulted by reference kinds.
    pub fn pool(&self) -> Option<&str> {
        match &self.kind {
            TraitKind::Reference { pool } | TraitKind::MultiReference { pool } => Some(pool),
            _ => None,
        }
    }
}

/// A resolved value, typed per [`TraitKind`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TraitValue {
    Integer(i64),
    Scalar(f64),
    Reference(String),
    Text(String),
}

impl TraitValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            TraitValue::Scalar(v) => Some(*v),
            TraitValue::Integer(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            TraitValue::Reference(s) | TraitValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Equality used by restrictions: numbers compare numerically, names by text.
    pub fn loosely_eq(&self, other: &TraitValue) -> bool {
        match (self.as_f64(), other.as_f64()) {
            (Some(a), Some(b)) => a == b,
            (None, None) => self.as_str() == other.as_str(),
            _ => false,
        }
    }
}

impl fmt::Display for TraitValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TraitValue::Scalar(v) => write!(f, "{v:.2}"),
            TraitValue::Integer(v) => write!(f, "{v}"),
            TraitValue::Reference(s) | TraitValue::Text(s) => f.write_str(s),
        }
    }
}
