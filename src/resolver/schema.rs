use std::collections::{HashMap, HashSet};

use serde::Serialize;

use super::attribute::NONE_VALUE;
use crate::error::TaskError;
use crate::model::{Attribute, Metadata, TraitKind, TraitSpec, TraitValue};
use crate::scene::SceneAssetProvider;

const RANGE_TOLERANCE: f64 = 1e-9;
/// Scalars travel with two decimals.
const WIRE_HALF_STEP: f64 = 0.005;

/// Accepted values of every trait a scene declares, used to turn wire
/// metadata back into typed values without resampling.
#[derive(Debug, Clone, Serialize)]
pub struct TraitSchema {
    pub filename: String,
    pub traits: Vec<SchemaEntry>,
    #[serde(skip)]
    index: HashMap<String, usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchemaEntry {
    pub name: String,
    #[serde(flatten)]
    pub kind: TraitKind,
    /// Declared at the root, so every metadata must carry it.
    pub required: bool,
    /// Accepted values for reference kinds.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<SchemaOption>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchemaOption {
    pub name: String,
    pub label: String,
}

impl TraitSchema {
    pub fn from_scene<S: SceneAssetProvider + ?Sized>(scene: &S) -> Self {
        let mut schema = TraitSchema {
            filename: scene.filename().to_string(),
            traits: Vec::new(),
            index: HashMap::new(),
        };

        let pools = scene.list_pools();
        let nested: Vec<&TraitSpec> = pools
            .iter()
            .flat_map(|p| p.candidates.iter())
            .flat_map(|c| c.traits.iter())
            .collect();

        for spec in scene.root_traits() {
            schema.insert(scene, spec, true);
        }
        for spec in nested {
            schema.insert(scene, spec, false);
        }
        schema
    }

    fn insert<S: SceneAssetProvider + ?Sized>(&mut self, scene: &S, spec: &TraitSpec, required: bool) {
        if self.index.contains_key(&spec.name) {
            return;
        }
        let options = match &spec.kind {
            TraitKind::Reference { pool } => scene
                .get_candidates(pool)
                .unwrap_or_default()
                .iter()
                .map(|c| SchemaOption {
                    name: c.name.clone(),
                    label: c.label().to_string(),
                })
                .collect(),
            TraitKind::MultiReference { pool } => {
                let children = scene.pool(pool).map(|p| p.children.as_slice()).unwrap_or_default();
                children
                    .iter()
                    .filter_map(|child| scene.pool(child))
                    .map(|child| {
                        let label = if child.represents_none() {
                            NONE_VALUE.to_string()
                        } else {
                            child.name.clone()
                        };
                        SchemaOption {
                            name: child.name.clone(),
                            label,
                        }
                    })
                    .collect()
            }
            _ => Vec::new(),
        };
        self.index.insert(spec.name.clone(), self.traits.len());
        self.traits.push(SchemaEntry {
            name: spec.name.clone(),
            kind: spec.kind.clone(),
            required,
            options,
        });
    }

    pub fn entry(&self, trait_name: &str) -> Option<&SchemaEntry> {
        self.index.get(trait_name).map(|&i| &self.traits[i])
    }

    /// Parses one wire attribute into the canonical value the scene expects.
    /// Reference labels map back to the candidate name.
    pub fn parse(&self, attribute: &Attribute) -> Result<TraitValue, TaskError> {
        let entry = self.entry(&attribute.trait_type).ok_or_else(|| {
            TaskError::SchemaValidation(format!("unknown trait `{}`", attribute.trait_type))
        })?;
        let raw = attribute.value.trim();
        let invalid = |why: String| {
            TaskError::SchemaValidation(format!("`{}` = `{raw}`: {why}", entry.name))
        };

        match &entry.kind {
            TraitKind::Scalar { min, max, precision } => {
                let v: f64 = raw.parse().map_err(|_| invalid("not a number".into()))?;
                let (lo, hi) = sampled_bounds(*min, *max, *precision);
                let slack = WIRE_HALF_STEP + RANGE_TOLERANCE;
                if !v.is_finite() || v < lo - slack || v > hi + slack {
                    return Err(invalid(format!("outside [{min}, {max}]")));
                }
                Ok(TraitValue::Scalar(v))
            }
            TraitKind::Integer { min, max } => {
                let v = parse_integer(raw).ok_or_else(|| invalid("not an integer".into()))?;
                if v < *min || v > *max {
                    return Err(invalid(format!("outside [{min}, {max}]")));
                }
                Ok(TraitValue::Integer(v))
            }
            TraitKind::Reference { .. } | TraitKind::MultiReference { .. } => entry
                .options
                .iter()
                .find(|o| {
                    o.name.eq_ignore_ascii_case(raw) || o.label.eq_ignore_ascii_case(raw)
                })
                .map(|o| {
                    if o.label == NONE_VALUE {
                        TraitValue::Reference(NONE_VALUE.to_string())
                    } else {
                        TraitValue::Reference(o.name.clone())
                    }
                })
                .ok_or_else(|| invalid("not one of the declared options".into())),
            TraitKind::String { .. } => Ok(TraitValue::Text(raw.to_string())),
        }
    }

    /// Parses every attribute of `metadata`, rejecting duplicates and
    /// requiring each root trait to be present.
    pub fn validate(&self, metadata: &Metadata) -> Result<Vec<(String, TraitValue)>, TaskError> {
        let mut seen = HashSet::new();
        let mut parsed = Vec::with_capacity(metadata.attributes.len());
        for attribute in &metadata.attributes {
            if !seen.insert(attribute.trait_type.as_str()) {
                return Err(TaskError::SchemaValidation(format!(
                    "trait `{}` appears more than once",
                    attribute.trait_type
                )));
            }
            parsed.push((attribute.trait_type.clone(), self.parse(attribute)?));
        }

        if let Some(missing) = self
            .traits
            .iter()
            .find(|e| e.required && !seen.contains(e.name.as_str()))
        {
            return Err(TaskError::SchemaValidation(format!(
                "required trait `{}` is missing",
                missing.name
            )));
        }
        Ok(parsed)
    }

    /// Wire form of a canonical value, using the candidate label if any.
    pub fn to_attribute(&self, trait_name: &str, value: &TraitValue) -> Attribute {
        let label = match (self.entry(trait_name), value) {
            (Some(entry), TraitValue::Reference(name)) => entry
                .options
                .iter()
                .find(|o| &o.name == name)
                .map(|o| o.label.clone()),
            _ => None,
        };
        Attribute {
            trait_type: trait_name.to_string(),
            value: label.unwrap_or_else(|| value.to_string()),
        }
    }
}

/// Outermost grid points the sampler can produce for `[min, max]`.
fn sampled_bounds(min: f64, max: f64, precision: f64) -> (f64, f64) {
    if !(precision.is_finite() && precision > 0.0) {
        return (min, max);
    }
    (
        (min / precision).round_ties_even() * precision,
        (max / precision).round_ties_even() * precision,
    )
}

fn parse_integer(raw: &str) -> Option<i64> {
    if let Ok(v) = raw.parse::<i64>() {
        return Some(v);
    }
    let v: f64 = raw.parse().ok()?;
    (v.is_finite() && v.fract() == 0.0).then_some(v as i64)
}
