use std::collections::{HashMap, HashSet};

use rand::Rng;

use super::attribute::{DiscoveredRef, Resolution, Resolver};
use crate::error::TaskError;
use crate::model::{ResolvedAttribute, TraitSpec, TraitValue};
use crate::scene::AssetPoolRegistry;

/// Resolves a root trait set, then every nested trait set exposed by the
/// candidates it reaches, pass by pass, until a pass discovers nothing new.
pub struct TraitGraphWalker<'a, P: AssetPoolRegistry + ?Sized> {
    resolver: Resolver<'a, P>,
}

/// A discovery together with the chain of candidates that led to it.
struct Frontier {
    found: DiscoveredRef,
    ancestry: Vec<String>,
}

impl<'a, P: AssetPoolRegistry + ?Sized> TraitGraphWalker<'a, P> {
    pub fn new(registry: &'a P) -> Self {
        Self {
            resolver: Resolver::new(registry),
        }
    }

    /// Returns one attribute per distinct trait name, in resolution order.
    ///
    /// A candidate that shows up in its own ancestry is a reference cycle and
    /// fails with `Configuration`. A candidate reached again through another
    /// branch is expanded once.
    pub fn walk<R: Rng + ?Sized>(
        &self,
        root: &[TraitSpec],
        rng: &mut R,
    ) -> Result<Vec<ResolvedAttribute>, TaskError> {
        let mut context: HashMap<String, TraitValue> = HashMap::new();
        let mut attributes = Vec::new();

        let resolution = self.resolver.resolve(root, &context, rng)?;
        let mut frontier = absorb(resolution, &[], &mut context, &mut attributes);
        let mut expanded: HashSet<String> = HashSet::new();
        let mut pass = 0usize;

        while !frontier.is_empty() {
            pass += 1;
            let mut next = Vec::new();

            for Frontier { found, ancestry } in frontier {
                let identity = found.identity();
                if ancestry.contains(&identity) {
                    return Err(TaskError::Configuration(format!(
                        "reference cycle through `{identity}` (via {})",
                        ancestry.join(" -> ")
                    )));
                }
                if !expanded.insert(identity.clone()) {
                    continue;
                }

                let candidate = self
                    .resolver
                    .registry()
                    .pool(&found.pool)
                    .and_then(|p| p.candidate(&found.candidate))
                    .ok_or_else(|| {
                        TaskError::Configuration(format!(
                            "trait `{}` resolved to `{identity}` which no longer exists",
                            found.trait_name
                        ))
                    })?;
                if candidate.traits.is_empty() {
                    continue;
                }

                tracing::debug!(pass, candidate = %identity, traits = candidate.traits.len(), "resolving nested trait set");
                let resolution = self.resolver.resolve(&candidate.traits, &context, rng)?;
                let mut lineage = ancestry;
                lineage.push(identity);
                next.extend(absorb(resolution, &lineage, &mut context, &mut attributes));
            }

            frontier = next;
        }

        Ok(attributes)
    }
}

/// Folds a resolution into the running context, keeping the first value per
/// trait name, and returns its discoveries tagged with `lineage`.
fn absorb(
    resolution: Resolution,
    lineage: &[String],
    context: &mut HashMap<String, TraitValue>,
    attributes: &mut Vec<ResolvedAttribute>,
) -> Vec<Frontier> {
    for attribute in resolution.attributes {
        if context.contains_key(&attribute.trait_name) {
            continue;
        }
        context.insert(attribute.trait_name.clone(), attribute.value.clone());
        attributes.push(attribute);
    }
    resolution
        .discovered
        .into_iter()
        .map(|found| Frontier {
            found,
            ancestry: lineage.to_vec(),
        })
        .collect()
}
