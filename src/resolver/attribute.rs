use std::collections::HashMap;

use rand::Rng;
use rand::distr::Distribution;
use rand::distr::weighted::WeightedIndex;

use crate::error::TaskError;
use crate::model::{AssetPool, Candidate, ResolvedAttribute, TraitKind, TraitSpec, TraitValue};
use crate::scene::AssetPoolRegistry;

/// Value reported for a chosen child pool flagged as "none".
pub const NONE_VALUE: &str = "None";

/// A candidate reached through a resolved reference. Its nested trait set,
/// if any, is resolved by the walker.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DiscoveredRef {
    pub trait_name: String,
    pub pool: String,
    pub candidate: String,
}

impl DiscoveredRef {
    pub fn identity(&self) -> String {
        format!("{}/{}", self.pool, self.candidate)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Resolution {
    pub attributes: Vec<ResolvedAttribute>,
    pub discovered: Vec<DiscoveredRef>,
}

/// Weighted, restriction-aware sampling of one trait set.
pub struct Resolver<'a, P: AssetPoolRegistry + ?Sized> {
    registry: &'a P,
}

impl<'a, P: AssetPoolRegistry + ?Sized> Resolver<'a, P> {
    pub fn new(registry: &'a P) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &'a P {
        self.registry
    }

    /// Resolves `specs` in order. Names already in `context` are copied, not
    /// sampled; values resolved earlier in the set are visible to the
    /// restrictions of later ones.
    pub fn resolve<R: Rng + ?Sized>(
        &self,
        specs: &[TraitSpec],
        context: &HashMap<String, TraitValue>,
        rng: &mut R,
    ) -> Result<Resolution, TaskError> {
        let mut scope = context.clone();
        let mut resolution = Resolution::default();

        for spec in specs {
            if let Some(fixed) = scope.get(&spec.name) {
                resolution
                    .attributes
                    .push(ResolvedAttribute::new(&spec.name, fixed.clone()));
                continue;
            }

            let attribute = match &spec.kind {
                TraitKind::Scalar { min, max, precision } => {
                    let k = discretized_index(&spec.name, *min, *max, *precision, rng)?;
                    ResolvedAttribute::new(&spec.name, TraitValue::Scalar(k as f64 * precision))
                }
                TraitKind::Integer { min, max } => {
                    let k = discretized_index(&spec.name, *min as f64, *max as f64, 1.0, rng)?;
                    ResolvedAttribute::new(&spec.name, TraitValue::Integer(k))
                }
                TraitKind::Reference { pool } => {
                    let pool = self.pool_for(spec, pool)?;
                    let chosen = self.pick_candidate(spec, pool, &scope, rng)?;
                    resolution.discovered.push(DiscoveredRef {
                        trait_name: spec.name.clone(),
                        pool: pool.name.clone(),
                        candidate: chosen.name.clone(),
                    });
                    ResolvedAttribute {
                        trait_name: spec.name.clone(),
                        value: TraitValue::Reference(chosen.name.clone()),
                        label: chosen.trait_value.clone(),
                    }
                }
                TraitKind::MultiReference { pool } => {
                    let pool = self.pool_for(spec, pool)?;
                    let child = self.pick_child_pool(spec, pool, &scope, rng)?;
                    resolution
                        .discovered
                        .extend(child.candidates.iter().map(|c| DiscoveredRef {
                            trait_name: spec.name.clone(),
                            pool: child.name.clone(),
                            candidate: c.name.clone(),
                        }));
                    let value = if child.represents_none() {
                        NONE_VALUE.to_string()
                    } else {
                        child.name.clone()
                    };
                    ResolvedAttribute::new(&spec.name, TraitValue::Reference(value))
                }
                TraitKind::String { default } => {
                    ResolvedAttribute::new(&spec.name, TraitValue::Text(default.clone()))
                }
            };

            scope.insert(spec.name.clone(), attribute.value.clone());
            resolution.attributes.push(attribute);
        }

        Ok(resolution)
    }

    fn pool_for(&self, spec: &TraitSpec, name: &str) -> Result<&'a AssetPool, TaskError> {
        self.registry.pool(name).ok_or_else(|| {
            TaskError::Configuration(format!(
                "trait `{}` refers to unknown pool `{name}`",
                spec.name
            ))
        })
    }

    fn pick_candidate<R: Rng + ?Sized>(
        &self,
        spec: &TraitSpec,
        pool: &'a AssetPool,
        scope: &HashMap<String, TraitValue>,
        rng: &mut R,
    ) -> Result<&'a Candidate, TaskError> {
        let eligible: Vec<(&Candidate, f64)> = pool
            .candidates
            .iter()
            .filter(|c| c.is_eligible(scope))
            .map(|c| (c, c.weight))
            .collect();

        weighted_pick(&eligible, rng).ok_or_else(|| TaskError::NoEligibleCandidate {
            trait_name: spec.name.clone(),
            pool: pool.name.clone(),
        })
    }

    fn pick_child_pool<R: Rng + ?Sized>(
        &self,
        spec: &TraitSpec,
        pool: &'a AssetPool,
        scope: &HashMap<String, TraitValue>,
        rng: &mut R,
    ) -> Result<&'a AssetPool, TaskError> {
        if pool.children.is_empty() {
            return Err(TaskError::Configuration(format!(
                "trait `{}` needs child pools but `{}` has none",
                spec.name, pool.name
            )));
        }

        let mut eligible = Vec::with_capacity(pool.children.len());
        for child_name in &pool.children {
            let child = self.pool_for(spec, child_name)?;
            let representative = child.representative().ok_or_else(|| {
                TaskError::Configuration(format!("child pool `{child_name}` is empty"))
            })?;
            if representative.is_eligible(scope) {
                eligible.push((child, representative.weight));
            }
        }

        weighted_pick(&eligible, rng).ok_or_else(|| TaskError::NoEligibleCandidate {
            trait_name: spec.name.clone(),
            pool: pool.name.clone(),
        })
    }
}

/// Maps `[min, max]` onto integer steps of `precision` and draws one step,
/// inclusive at both ends. Bounds round half to even.
fn discretized_index<R: Rng + ?Sized>(
    trait_name: &str,
    min: f64,
    max: f64,
    precision: f64,
    rng: &mut R,
) -> Result<i64, TaskError> {
    if precision.is_nan() || precision <= 0.0 || !min.is_finite() || !max.is_finite() {
        return Err(TaskError::Configuration(format!(
            "trait `{trait_name}` has an invalid range [{min}, {max}] with precision {precision}"
        )));
    }
    let lo = (min / precision).round_ties_even() as i64;
    let hi = (max / precision).round_ties_even() as i64;
    if lo > hi {
        return Err(TaskError::Configuration(format!(
            "trait `{trait_name}` has min {min} above max {max}"
        )));
    }
    Ok(rng.random_range(lo..=hi))
}

/// `None` when there is nothing to pick from or every weight is zero.
fn weighted_pick<T: Copy, R: Rng + ?Sized>(items: &[(T, f64)], rng: &mut R) -> Option<T> {
    let dist = WeightedIndex::new(items.iter().map(|(_, w)| *w)).ok()?;
    Some(items[dist.sample(rng)].0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Comparator, Restriction, SCALAR_PRECISION};
    use crate::scene::fixtures::character_scene;
    use crate::scene::{InMemoryScene, SceneAssetProvider, SceneDocument};
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn scene_with(pools: Vec<AssetPool>) -> InMemoryScene {
        InMemoryScene::new(SceneDocument {
            pools,
            ..Default::default()
        })
        .unwrap()
    }

    fn ctx(pairs: &[(&str, TraitValue)]) -> HashMap<String, TraitValue> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn scalar_values_stay_on_the_grid() {
        let scene = scene_with(vec![]);
        let resolver = Resolver::new(&scene);
        let specs = [TraitSpec::scalar("Height", 0.0, 1.0)];
        let mut rng = StdRng::seed_from_u64(7);

        for _ in 0..10_000 {
            let res = resolver.resolve(&specs, &HashMap::new(), &mut rng).unwrap();
            let TraitValue::Scalar(v) = res.attributes[0].value else {
                panic!("expected scalar");
            };
            assert!((0.0..=1.0).contains(&v), "{v} out of range");
            let steps = v / SCALAR_PRECISION;
            assert!((steps - steps.round()).abs() < 1e-6, "{v} is off the 0.01 grid");
            assert_eq!(format!("{:.2}", v).parse::<f64>().unwrap(), (v * 100.0).round() / 100.0);
        }
    }

    #[test]
    fn scalar_grid_is_anchored_at_min() {
        let scene = scene_with(vec![]);
        let resolver = Resolver::new(&scene);
        let specs = [TraitSpec {
            name: "Angle".into(),
            kind: TraitKind::Scalar {
                min: 0.25,
                max: 1.0,
                precision: 0.25,
            },
        }];
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..500 {
            let res = resolver.resolve(&specs, &HashMap::new(), &mut rng).unwrap();
            let v = res.attributes[0].value.as_f64().unwrap();
            assert!([0.25, 0.5, 0.75, 1.0].contains(&v), "{v}");
        }
    }

    #[test]
    fn bounds_round_half_to_even() {
        // 0.5 / 1 and 2.5 / 1 round to 0 and 2 under half-to-even.
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..200 {
            let k = discretized_index("t", 0.5, 2.5, 1.0, &mut rng).unwrap();
            assert!((0..=2).contains(&k));
        }
        let mut seen_zero = false;
        for _ in 0..200 {
            seen_zero |= discretized_index("t", 0.5, 2.5, 1.0, &mut rng).unwrap() == 0;
        }
        assert!(seen_zero);
    }

    #[test]
    fn integer_range_is_inclusive() {
        let scene = scene_with(vec![]);
        let resolver = Resolver::new(&scene);
        let specs = [TraitSpec::integer("Legs", 2, 4)];
        let mut rng = StdRng::seed_from_u64(11);
        let mut seen = [false; 3];
        for _ in 0..300 {
            let res = resolver.resolve(&specs, &HashMap::new(), &mut rng).unwrap();
            let TraitValue::Integer(v) = res.attributes[0].value else {
                panic!("expected integer");
            };
            seen[(v - 2) as usize] = true;
        }
        assert_eq!(seen, [true; 3]);
    }

    #[test]
    fn inverted_range_is_a_configuration_error() {
        let scene = scene_with(vec![]);
        let resolver = Resolver::new(&scene);
        let mut rng = StdRng::seed_from_u64(0);
        let err = resolver
            .resolve(&[TraitSpec::integer("Legs", 5, 1)], &HashMap::new(), &mut rng)
            .unwrap_err();
        assert!(matches!(err, TaskError::Configuration(_)));
    }

    #[test]
    fn context_values_are_never_resampled() {
        let scene = character_scene();
        let resolver = Resolver::new(&scene);
        let context = ctx(&[
            ("Height", TraitValue::Scalar(0.42)),
            ("Hat", TraitValue::Reference("Beanie".into())),
        ]);
        for seed in 0..50 {
            let mut rng = StdRng::seed_from_u64(seed);
            let res = resolver
                .resolve(scene.root_traits(), &context, &mut rng)
                .unwrap();
            let height = res.attributes.iter().find(|a| a.trait_name == "Height").unwrap();
            let hat = res.attributes.iter().find(|a| a.trait_name == "Hat").unwrap();
            assert_eq!(height.value, TraitValue::Scalar(0.42));
            assert_eq!(hat.value, TraitValue::Reference("Beanie".into()));
            assert!(res.discovered.iter().all(|d| d.trait_name != "Hat"));
        }
    }

    #[test]
    fn restricted_candidate_is_excluded() {
        // Hats: A (no restriction) and B (Tier == gold); context Tier = silver.
        let gold = Restriction::new("Tier", Comparator::Eq, TraitValue::Reference("gold".into()));
        let scene = scene_with(vec![AssetPool::new(
            "Hats",
            vec![Candidate::new("A", 1.0), Candidate::new("B", 1.0).restricted(gold)],
        )]);
        let resolver = Resolver::new(&scene);
        let context = ctx(&[("Tier", TraitValue::Reference("silver".into()))]);
        let specs = [TraitSpec::reference("Hat", "Hats")];
        let mut rng = StdRng::seed_from_u64(99);

        for _ in 0..100 {
            let res = resolver.resolve(&specs, &context, &mut rng).unwrap();
            assert_eq!(res.attributes[0].value, TraitValue::Reference("A".into()));
        }
    }

    #[test]
    fn weighted_reference_follows_declared_ratios() {
        let scene = scene_with(vec![AssetPool::new(
            "Gems",
            vec![
                Candidate::new("Ruby", 1.0),
                Candidate::new("Jade", 2.0),
                Candidate::new("Onyx", 5.0),
            ],
        )]);
        let resolver = Resolver::new(&scene);
        let specs = [TraitSpec::reference("Gem", "Gems")];
        let mut rng = StdRng::seed_from_u64(2024);
        let trials = 16_000;
        let mut counts: HashMap<String, f64> = HashMap::new();
        for _ in 0..trials {
            let res = resolver.resolve(&specs, &HashMap::new(), &mut rng).unwrap();
            *counts.entry(res.attributes[0].value.to_string()).or_default() += 1.0;
        }

        // Chi-square, 2 degrees of freedom; 13.82 is the 0.001 critical value.
        let expected = [("Ruby", 1.0 / 8.0), ("Jade", 2.0 / 8.0), ("Onyx", 5.0 / 8.0)];
        let chi2: f64 = expected
            .iter()
            .map(|(name, p)| {
                let e = p * trials as f64;
                let o = counts.get(*name).copied().unwrap_or(0.0);
                (o - e).powi(2) / e
            })
            .sum();
        assert!(chi2 < 13.82, "chi-square {chi2} too large: {counts:?}");
    }

    #[test]
    fn zero_eligible_candidates_fails() {
        let gold = Restriction::new("Tier", Comparator::Eq, TraitValue::Reference("gold".into()));
        let scene = scene_with(vec![AssetPool::new(
            "Hats",
            vec![Candidate::new("Crown", 1.0).restricted(gold)],
        )]);
        let resolver = Resolver::new(&scene);
        let mut rng = StdRng::seed_from_u64(0);
        let err = resolver
            .resolve(&[TraitSpec::reference("Hat", "Hats")], &HashMap::new(), &mut rng)
            .unwrap_err();
        assert_eq!(
            err,
            TaskError::NoEligibleCandidate {
                trait_name: "Hat".into(),
                pool: "Hats".into()
            }
        );
    }

    #[test]
    fn all_zero_weights_fails() {
        let scene = scene_with(vec![AssetPool::new("Hats", vec![Candidate::new("A", 0.0)])]);
        let resolver = Resolver::new(&scene);
        let mut rng = StdRng::seed_from_u64(0);
        let err = resolver
            .resolve(&[TraitSpec::reference("Hat", "Hats")], &HashMap::new(), &mut rng)
            .unwrap_err();
        assert!(matches!(err, TaskError::NoEligibleCandidate { .. }));
    }

    #[test]
    fn unknown_pool_names_the_trait() {
        let scene = scene_with(vec![]);
        let resolver = Resolver::new(&scene);
        let mut rng = StdRng::seed_from_u64(0);
        let err = resolver
            .resolve(&[TraitSpec::reference("Hat", "Nope")], &HashMap::new(), &mut rng)
            .unwrap_err();
        match err {
            TaskError::Configuration(msg) => assert!(msg.contains("`Hat`"), "{msg}"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn earlier_values_gate_later_restrictions() {
        let scene = character_scene();
        let resolver = Resolver::new(&scene);
        let specs = [TraitSpec::reference("Tier", "Tiers"), TraitSpec::reference("Hat", "Hats")];
        for seed in 0..200 {
            let mut rng = StdRng::seed_from_u64(seed);
            let res = resolver.resolve(&specs, &HashMap::new(), &mut rng).unwrap();
            if res.attributes[1].value == TraitValue::Reference("hat_crown".into()) {
                assert_eq!(res.attributes[0].value, TraitValue::Reference("gold".into()));
                assert_eq!(res.attributes[1].to_wire().value, "Crown");
            }
        }
    }

    #[test]
    fn multi_reference_picks_child_pool_and_discovers_members() {
        let scene = character_scene();
        let resolver = Resolver::new(&scene);
        let specs = [TraitSpec::multi_reference("Outfit", "Outfits")];
        let mut rng = StdRng::seed_from_u64(5);
        let res = resolver.resolve(&specs, &HashMap::new(), &mut rng).unwrap();
        let chosen = res.attributes[0].value.to_string();
        assert!(chosen == "Casual" || chosen == "Armor");
        assert!(res.discovered.iter().all(|d| d.pool == chosen));
        assert_eq!(res.discovered.len(), 1);
    }

    #[test]
    fn multi_reference_uses_representative_eligibility() {
        let gold = Restriction::new("Tier", Comparator::Eq, TraitValue::Reference("gold".into()));
        let scene = scene_with(vec![
            AssetPool::with_children("Outfits", vec!["Royal".into(), "Plain".into()]),
            AssetPool::new(
                "Royal",
                vec![Candidate::new("robe", 1.0), Candidate::new("cape", 0.5).restricted(gold)],
            ),
            AssetPool::new("Plain", vec![Candidate::new("shirt", 1.0)]),
        ]);
        let resolver = Resolver::new(&scene);
        let context = ctx(&[("Tier", TraitValue::Reference("silver".into()))]);
        let specs = [TraitSpec::multi_reference("Outfit", "Outfits")];
        for seed in 0..50 {
            let mut rng = StdRng::seed_from_u64(seed);
            let res = resolver.resolve(&specs, &context, &mut rng).unwrap();
            assert_eq!(res.attributes[0].value, TraitValue::Reference("Plain".into()));
        }
    }

    #[test]
    fn none_child_pool_reports_none() {
        let mut empty = Candidate::new("nothing", 1.0);
        empty.represents_none = true;
        let scene = scene_with(vec![
            AssetPool::with_children("Backpacks", vec!["NoBackpack".into()]),
            AssetPool::new("NoBackpack", vec![empty]),
        ]);
        let resolver = Resolver::new(&scene);
        let mut rng = StdRng::seed_from_u64(0);
        let res = resolver
            .resolve(
                &[TraitSpec::multi_reference("Backpack", "Backpacks")],
                &HashMap::new(),
                &mut rng,
            )
            .unwrap();
        assert_eq!(res.attributes[0].value, TraitValue::Reference(NONE_VALUE.into()));
    }

    #[test]
    fn empty_child_pool_is_a_configuration_error() {
        let scene = scene_with(vec![
            AssetPool::with_children("Outfits", vec!["Ghost".into()]),
            AssetPool::new("Ghost", vec![]),
        ]);
        let resolver = Resolver::new(&scene);
        let mut rng = StdRng::seed_from_u64(0);
        let err = resolver
            .resolve(
                &[TraitSpec::multi_reference("Outfit", "Outfits")],
                &HashMap::new(),
                &mut rng,
            )
            .unwrap_err();
        assert!(matches!(err, TaskError::Configuration(_)));
    }

    #[test]
    fn string_trait_uses_default() {
        let scene = scene_with(vec![]);
        let resolver = Resolver::new(&scene);
        let mut rng = StdRng::seed_from_u64(0);
        let res = resolver
            .resolve(&[TraitSpec::text("Name", "Unit-01")], &HashMap::new(), &mut rng)
            .unwrap();
        assert_eq!(res.attributes[0].value, TraitValue::Text("Unit-01".into()));
    }
}
