//! Rollback and teardown.
//!
//! Deletes run in reverse plan order: last tier first, and within a tier by
//! descending (kind, name). Deletion is best-effort; failures are collected
//! and never replace the run's own outcome.

use std::{fmt, sync::Arc, time::Duration};

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::{
	graph::ApplyPlan,
	k8s::{Condition, ClusterClient, DeleteOutcome, WaitOutcome},
	manifest::{ResourceKey, ResourceSpec},
	reconcile::ResourceState,
	report::RunReport,
};

/// Which resources to remove after an unsuccessful install.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RollbackPolicy {
	/// Leave everything in place.
	#[default]
	None,

	/// Remove resources that ended `Failed`.
	FailedOnly,

	/// Remove everything this run applied.
	#[value(name = "full", alias = "full-reverse")]
	#[serde(rename = "full", alias = "full-reverse")]
	FullReverse,
}

impl fmt::Display for RollbackPolicy {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			RollbackPolicy::None => write!(f, "none"),
			RollbackPolicy::FailedOnly => write!(f, "failed-only"),
			RollbackPolicy::FullReverse => write!(f, "full"),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackError {
	pub resource: String,
	pub error: String,
}

/// What a rollback or teardown did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackSummary {
	pub policy: RollbackPolicy,
	/// Removed, in deletion order.
	pub deleted: Vec<String>,
	/// Already gone.
	pub missing: Vec<String>,
	pub errors: Vec<RollbackError>,
}

impl RollbackSummary {
	fn new(policy: RollbackPolicy) -> Self {
		Self {
			policy,
			..Default::default()
		}
	}

	pub fn is_clean(&self) -> bool {
		self.errors.is_empty()
	}

	fn record(&mut self, key: &ResourceKey, outcome: Result<DeleteOutcome, String>) {
		match outcome {
			Ok(DeleteOutcome::Deleted) => self.deleted.push(key.to_string()),
			Ok(DeleteOutcome::NotFound) => self.missing.push(key.to_string()),
			Err(error) => {
				warn!(resource = %key, error = %error, "delete failed");
				self.errors.push(RollbackError {
					resource: key.to_string(),
					error,
				});
			}
		}
	}
}

impl fmt::Display for RollbackSummary {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(
			f,
			"rollback ({}): {} deleted, {} already absent, {} failed",
			self.policy,
			self.deleted.len(),
			self.missing.len(),
			self.errors.len()
		)
	}
}

/// Tiers last-first, each tier in descending (kind, name).
fn reverse_order(plan: &ApplyPlan) -> impl Iterator<Item = Vec<&Arc<ResourceSpec>>> {
	plan.tiers.iter().rev().map(|tier| {
		let mut specs: Vec<_> = tier.resources.iter().collect();
		specs.sort_by(|a, b| b.key.cmp(&a.key));
		specs
	})
}

pub struct RollbackManager<C: ?Sized> {
	client: Arc<C>,
}

impl<C: ClusterClient + ?Sized> RollbackManager<C> {
	pub fn new(client: Arc<C>) -> Self {
		Self { client }
	}

	/// Delete what `policy` selects from `report`.
	#[instrument(skip_all, fields(policy = %policy))]
	pub async fn rollback(
		&self,
		plan: &ApplyPlan,
		report: &RunReport,
		policy: RollbackPolicy,
	) -> RollbackSummary {
		let mut summary = RollbackSummary::new(policy);
		if policy == RollbackPolicy::None {
			return summary;
		}

		for tier in reverse_order(plan) {
			for spec in tier {
				let Some(result) = report.results.iter().find(|r| r.key == spec.key) else {
					continue;
				};
				let selected = match policy {
					RollbackPolicy::None => false,
					RollbackPolicy::FailedOnly => result.state == ResourceState::Failed,
					RollbackPolicy::FullReverse => result.applied(),
				};
				if !selected {
					continue;
				}
				info!(resource = %spec.key, "rolling back");
				let outcome = self.client.delete(&spec.key).await.map_err(|e| e.to_string());
				summary.record(&spec.key, outcome);
			}
		}
		summary
	}

	/// Remove every resource of the plan in reverse order.
	///
	/// Replicated workloads are scaled to zero first, then each tier is
	/// deleted and awaited before the next one starts.
	#[instrument(skip_all, fields(resources = plan.len()))]
	pub async fn teardown(&self, plan: &ApplyPlan, wait_timeout: Duration) -> RollbackSummary {
		let mut summary = RollbackSummary::new(RollbackPolicy::FullReverse);

		for tier in reverse_order(plan) {
			for spec in &tier {
				if spec.kind_info().readiness != ::k8s::ReadinessSignal::Replicas {
					continue;
				}
				match self.client.get(&spec.key).await {
					Ok(Some(_)) => {
						if let Err(e) = self.client.scale(&spec.key, 0).await {
							warn!(resource = %spec.key, error = %e, "could not scale down");
						}
					}
					Ok(None) => {}
					Err(e) => warn!(resource = %spec.key, error = %e, "could not read before scale down"),
				}
			}

			let mut deleted = Vec::new();
			for spec in &tier {
				let outcome = self.client.delete(&spec.key).await.map_err(|e| e.to_string());
				if matches!(outcome, Ok(DeleteOutcome::Deleted)) {
					deleted.push(&spec.key);
				}
				summary.record(&spec.key, outcome);
			}

			for key in deleted {
				match self
					.client
					.wait_for_condition(key, &Condition::Deleted, wait_timeout)
					.await
				{
					Ok(WaitOutcome::Ready) => {}
					Ok(WaitOutcome::TimedOut) => warn!(resource = %key, "still present after delete"),
					Err(e) => warn!(resource = %key, error = %e, "could not confirm deletion"),
				}
			}
		}
		summary
	}
}

#[cfg(test)]
mod tests {
	use rstest::rstest;
	use tokio_util::sync::CancellationToken;

	use super::*;
	use crate::{
		probe::{ProbeSettings, Prober},
		reconcile::{ReconcileOptions, Reconciler},
		test_utils::{graph_from_yaml, spec_from_yaml, FakeCluster, FakeVerb, SCENARIO},
	};

	async fn run(cluster: &FakeCluster, yaml: &str) -> (crate::graph::DependencyGraph, RunReport) {
		let graph = graph_from_yaml(yaml).unwrap();
		let prober = Prober::new(
			ProbeSettings::builder()
				.poll_interval(Duration::from_millis(10))
				.build(),
		)
		.unwrap();
		let reconciler = Reconciler::new(
			Arc::new(cluster.clone()),
			Arc::new(prober),
			ReconcileOptions::builder()
				.workers(2)
				.timeout(Duration::from_millis(500))
				.build(),
		);
		let report = reconciler.run(&graph, &CancellationToken::new()).await;
		(graph, report)
	}

	#[rstest]
	#[case::none("none", RollbackPolicy::None)]
	#[case::failed_only("failed-only", RollbackPolicy::FailedOnly)]
	#[case::full("full", RollbackPolicy::FullReverse)]
	#[case::alias("full-reverse", RollbackPolicy::FullReverse)]
	fn test_policy_names(#[case] name: &str, #[case] expected: RollbackPolicy) {
		assert_eq!(RollbackPolicy::from_str(name, false).unwrap(), expected);
		let parsed: RollbackPolicy = serde_yaml::from_str(name).unwrap();
		assert_eq!(parsed, expected);
	}

	#[tokio::test(start_paused = true)]
	async fn test_full_rollback_reverses_scenario() {
		let cluster = FakeCluster::new().stall("api-server");
		let (graph, report) = run(&cluster, SCENARIO).await;

		let summary = RollbackManager::new(Arc::new(cluster.clone()))
			.rollback(graph.plan(), &report, RollbackPolicy::FullReverse)
			.await;

		assert_eq!(cluster.names(FakeVerb::Delete), vec!["api-server", "object-store"]);
		assert_eq!(
			summary.deleted,
			vec!["Deployment/default/api-server", "Deployment/default/object-store"]
		);
		assert!(summary.is_clean());
	}

	#[tokio::test(start_paused = true)]
	async fn test_full_rollback_keeps_unchanged() {
		let existing = spec_from_yaml("kind: Deployment\nmetadata: { name: object-store }");
		let cluster = FakeCluster::new().seed(&existing).stall("api-server");
		let (graph, report) = run(&cluster, SCENARIO).await;

		RollbackManager::new(Arc::new(cluster.clone()))
			.rollback(graph.plan(), &report, RollbackPolicy::FullReverse)
			.await;

		assert_eq!(cluster.names(FakeVerb::Delete), vec!["api-server"]);
		assert!(cluster.object(&existing.key).is_some());
	}

	#[tokio::test(start_paused = true)]
	async fn test_failed_only_rollback() {
		let cluster = FakeCluster::new().reject("bad");
		let (graph, report) = run(
			&cluster,
			"kind: ConfigMap\nmetadata: { name: bad }\n---\nkind: ConfigMap\nmetadata: { name: good }",
		)
		.await;

		let summary = RollbackManager::new(Arc::new(cluster.clone()))
			.rollback(graph.plan(), &report, RollbackPolicy::FailedOnly)
			.await;

		// The rejected apply never created anything.
		assert_eq!(summary.missing, vec!["ConfigMap/default/bad"]);
		assert!(summary.deleted.is_empty());
		assert_eq!(cluster.names(FakeVerb::Delete), Vec::<String>::new());
	}

	#[tokio::test]
	async fn test_none_policy_deletes_nothing() {
		let cluster = FakeCluster::new();
		let (graph, report) = run(&cluster, SCENARIO).await;

		let summary = RollbackManager::new(Arc::new(cluster.clone()))
			.rollback(graph.plan(), &report, RollbackPolicy::None)
			.await;

		assert_eq!(summary, RollbackSummary::new(RollbackPolicy::None));
		assert_eq!(cluster.names(FakeVerb::Delete), Vec::<String>::new());
	}

	#[tokio::test]
	async fn test_delete_errors_are_collected() {
		let cluster = FakeCluster::new();
		let (graph, report) = run(&cluster, SCENARIO).await;
		let broken = cluster.clone().unreachable();

		let summary = RollbackManager::new(Arc::new(broken))
			.rollback(graph.plan(), &report, RollbackPolicy::FullReverse)
			.await;

		assert_eq!(summary.errors.len(), 3);
		assert_eq!(summary.errors[0].resource, "Deployment/default/ui");
		assert!(!summary.is_clean());
	}

	#[tokio::test]
	async fn test_teardown_scales_then_deletes() {
		let cluster = FakeCluster::new();
		let (graph, _) = run(
			&cluster,
			"kind: Deployment\nmetadata: { name: api }\ndependsOn: [cfg]\n---\nkind: ConfigMap\nmetadata: { name: cfg }",
		)
		.await;

		let summary = RollbackManager::new(Arc::new(cluster.clone()))
			.teardown(graph.plan(), Duration::from_secs(1))
			.await;

		let verbs: Vec<_> = cluster
			.mutations()
			.into_iter()
			.skip(2)
			.map(|m| (m.verb, m.key.name))
			.collect();
		assert_eq!(
			verbs,
			vec![
				(FakeVerb::Scale, "api".to_string()),
				(FakeVerb::Delete, "api".to_string()),
				(FakeVerb::Delete, "cfg".to_string()),
			]
		);
		assert_eq!(summary.deleted.len(), 2);

		let again = RollbackManager::new(Arc::new(cluster.clone()))
			.teardown(graph.plan(), Duration::from_secs(1))
			.await;
		assert_eq!(again.missing.len(), 2);
	}
}
