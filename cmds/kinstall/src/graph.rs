//! Dependency resolution and tiered apply plans.

use std::{
	collections::{BTreeMap, BTreeSet},
	sync::Arc,
};

use thiserror::Error;
use tracing::debug;

use crate::manifest::{ResourceKey, ResourceSpec};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
	#[error("cyclic dependency between {}", ResourceKey::join(.0))]
	CyclicDependency(Vec<ResourceKey>),

	#[error("{resource} depends on `{dependency}`, which matches no loaded resource")]
	UnknownDependency {
		resource: ResourceKey,
		dependency: String,
	},
}

/// A resolved dependency edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edge {
	pub target: ResourceKey,
	pub soft: bool,
}

/// Resources that can be applied concurrently.
#[derive(Debug, Clone)]
pub struct Tier {
	pub index: usize,
	/// Sorted by (kind, name, namespace).
	pub resources: Vec<Arc<ResourceSpec>>,
}

/// Tiers in apply order. Every dependency of a resource sits in an earlier tier.
#[derive(Debug, Clone, Default)]
pub struct ApplyPlan {
	pub tiers: Vec<Tier>,
}

impl ApplyPlan {
	pub fn len(&self) -> usize {
		self.tiers.iter().map(|t| t.resources.len()).sum()
	}

	pub fn is_empty(&self) -> bool {
		self.tiers.is_empty()
	}

	pub fn resources(&self) -> impl Iterator<Item = &Arc<ResourceSpec>> {
		self.tiers.iter().flat_map(|t| t.resources.iter())
	}
}

#[derive(Debug)]
pub struct DependencyGraph {
	specs: BTreeMap<ResourceKey, Arc<ResourceSpec>>,
	dependencies: BTreeMap<ResourceKey, Vec<Edge>>,
	dependents: BTreeMap<ResourceKey, BTreeSet<ResourceKey>>,
	plan: ApplyPlan,
}

impl DependencyGraph {
	/// Resolve `dependsOn` references and layer the specs with Kahn's algorithm.
	///
	/// A reference matches every resource in reach with that name (see
	/// [`crate::manifest::DependencyRef::matches`]) except the declaring one.
	/// A reference that only matches its own resource is a cycle.
	pub fn build(specs: Vec<ResourceSpec>) -> Result<Self, GraphError> {
		let specs: BTreeMap<ResourceKey, Arc<ResourceSpec>> = specs
			.into_iter()
			.map(|s| (s.key.clone(), Arc::new(s)))
			.collect();

		let mut dependencies: BTreeMap<ResourceKey, Vec<Edge>> = BTreeMap::new();
		let mut dependents: BTreeMap<ResourceKey, BTreeSet<ResourceKey>> = BTreeMap::new();

		for (key, spec) in &specs {
			// Duplicate references collapse into one edge; hard wins over soft.
			let mut resolved: BTreeMap<ResourceKey, bool> = BTreeMap::new();
			for dep in &spec.depends_on {
				let mut targets: Vec<&ResourceKey> =
					specs.keys().filter(|k| dep.target.matches(key, k)).collect();
				if targets.len() > 1 {
					targets.retain(|k| *k != key);
				}
				if targets.is_empty() {
					return Err(GraphError::UnknownDependency {
						resource: key.clone(),
						dependency: dep.target.to_string(),
					});
				}
				for target in targets {
					resolved
						.entry(target.clone())
						.and_modify(|soft| *soft &= dep.soft)
						.or_insert(dep.soft);
				}
			}

			for target in resolved.keys() {
				dependents
					.entry(target.clone())
					.or_default()
					.insert(key.clone());
			}
			dependencies.insert(
				key.clone(),
				resolved
					.into_iter()
					.map(|(target, soft)| Edge { target, soft })
					.collect(),
			);
		}

		let plan = layer(&specs, &dependencies, &dependents)?;
		debug!(
			resources = specs.len(),
			tiers = plan.tiers.len(),
			"built dependency graph"
		);

		Ok(Self {
			specs,
			dependencies,
			dependents,
			plan,
		})
	}

	pub fn plan(&self) -> &ApplyPlan {
		&self.plan
	}

	/// Direct dependencies of `key`.
	pub fn dependencies(&self, key: &ResourceKey) -> &[Edge] {
		self.dependencies.get(key).map(Vec::as_slice).unwrap_or(&[])
	}

	/// Resources that directly depend on `key`.
	pub fn dependents(&self, key: &ResourceKey) -> impl Iterator<Item = &ResourceKey> {
		self.dependents.get(key).into_iter().flatten()
	}

	pub fn spec(&self, key: &ResourceKey) -> Option<&Arc<ResourceSpec>> {
		self.specs.get(key)
	}

	pub fn len(&self) -> usize {
		self.specs.len()
	}

	pub fn is_empty(&self) -> bool {
		self.specs.is_empty()
	}
}

fn layer(
	specs: &BTreeMap<ResourceKey, Arc<ResourceSpec>>,
	dependencies: &BTreeMap<ResourceKey, Vec<Edge>>,
	dependents: &BTreeMap<ResourceKey, BTreeSet<ResourceKey>>,
) -> Result<ApplyPlan, GraphError> {
	let mut in_degree: BTreeMap<&ResourceKey, usize> = dependencies
		.iter()
		.map(|(key, edges)| (key, edges.len()))
		.collect();

	let mut current: Vec<&ResourceKey> = in_degree
		.iter()
		.filter(|(_, degree)| **degree == 0)
		.map(|(key, _)| *key)
		.collect();
	let mut tiers = Vec::new();

	while !current.is_empty() {
		let mut next = BTreeSet::new();
		for key in &current {
			in_degree.remove(*key);
			for dependent in dependents.get(*key).into_iter().flatten() {
				if let Some(degree) = in_degree.get_mut(dependent) {
					*degree -= 1;
					if *degree == 0 {
						next.insert(dependent);
					}
				}
			}
		}

		// `current` is already in key order: it came from a BTreeMap or BTreeSet.
		tiers.push(Tier {
			index: tiers.len(),
			resources: current.iter().map(|key| Arc::clone(&specs[*key])).collect(),
		});
		current = next.into_iter().collect();
	}

	if in_degree.is_empty() {
		return Ok(ApplyPlan { tiers });
	}

	let remaining: BTreeSet<&ResourceKey> = in_degree.keys().copied().collect();
	let cyclic = remaining
		.iter()
		.filter(|key| reaches_itself(key, &remaining, dependencies))
		.map(|key| (*key).clone())
		.collect();
	Err(GraphError::CyclicDependency(cyclic))
}

/// Whether `start` lies on a cycle within `remaining`.
fn reaches_itself(
	start: &ResourceKey,
	remaining: &BTreeSet<&ResourceKey>,
	dependencies: &BTreeMap<ResourceKey, Vec<Edge>>,
) -> bool {
	let mut stack = vec![start];
	let mut seen = BTreeSet::new();
	while let Some(key) = stack.pop() {
		for edge in dependencies.get(key).into_iter().flatten() {
			if edge.target == *start {
				return true;
			}
			if remaining.contains(&edge.target) && seen.insert(&edge.target) {
				stack.push(&edge.target);
			}
		}
	}
	false
}
