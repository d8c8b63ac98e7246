//! Install, uninstall and status over one cluster client.

use std::{path::Path, sync::Arc};

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::{
	config::InstallerConfig,
	error::InstallError,
	graph::DependencyGraph,
	k8s::ClusterClient,
	manifest::{Loader, ResourceKey},
	probe::{ProbeSpec, ProbeStatus, Prober},
	reconcile::{PlannedChange, ReconcileOptions, Reconciler},
	report::{RunReport, RunVerdict},
	rollback::{RollbackManager, RollbackPolicy, RollbackSummary},
};

/// Load manifests from `dir` and order them.
///
/// Runs before any cluster connection exists, so a bad manifest set never
/// reaches the cluster.
#[instrument(skip_all, fields(dir = %dir.display()))]
pub fn load_graph(config: &InstallerConfig, dir: &Path) -> Result<DependencyGraph, InstallError> {
	let mut loader = Loader::new(config.namespace.clone());
	loader.load_dir(dir)?;
	let graph = DependencyGraph::build(loader.finish()?)?;
	info!(
		resources = graph.len(),
		tiers = graph.plan().tiers.len(),
		"built apply plan"
	);
	Ok(graph)
}

/// Result of [`Installer::install`].
#[derive(Debug)]
pub struct InstallOutcome {
	pub report: RunReport,
	/// Set when a rollback ran.
	pub rollback: Option<RollbackSummary>,
}

impl InstallOutcome {
	pub fn verdict(&self) -> RunVerdict {
		self.report.verdict()
	}
}

/// One row of `kinstall status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusRow {
	#[serde(flatten)]
	pub key: ResourceKey,
	pub tier: usize,
	pub present: bool,
	pub healthy: bool,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub detail: Option<String>,
}

pub struct Installer<C: ?Sized> {
	client: Arc<C>,
	config: InstallerConfig,
	prober: Arc<Prober>,
}

impl<C: ClusterClient + ?Sized + 'static> Installer<C> {
	pub fn new(client: Arc<C>, config: InstallerConfig) -> Result<Self, InstallError> {
		let prober = Prober::new(config.probe_settings())?;
		Ok(Self {
			client,
			config,
			prober: Arc::new(prober),
		})
	}

	pub fn config(&self) -> &InstallerConfig {
		&self.config
	}

	fn reconciler(&self) -> Reconciler<C> {
		Reconciler::new(
			Arc::clone(&self.client),
			Arc::clone(&self.prober),
			ReconcileOptions::builder()
				.workers(self.config.workers())
				.timeout(self.config.timeout)
				.build(),
		)
	}

	/// Reconcile the plan, then roll back per policy if the run fell short.
	///
	/// A cancelled run always rolls back at least the failed resources.
	#[instrument(skip_all)]
	pub async fn install(&self, graph: &DependencyGraph, cancel: &CancellationToken) -> InstallOutcome {
		let report = self.reconciler().run(graph, cancel).await;
		let verdict = report.verdict();
		info!(verdict = ?verdict, elapsed = ?report.elapsed, "reconcile finished");

		let policy = match self.config.rollback {
			RollbackPolicy::FullReverse => RollbackPolicy::FullReverse,
			_ if report.cancelled => RollbackPolicy::FailedOnly,
			configured => configured,
		};
		let rollback = if verdict != RunVerdict::Success && policy != RollbackPolicy::None {
			let summary = RollbackManager::new(Arc::clone(&self.client))
				.rollback(graph.plan(), &report, policy)
				.await;
			if !summary.is_clean() {
				warn!(errors = summary.errors.len(), "rollback left resources behind");
			}
			Some(summary)
		} else {
			None
		};

		InstallOutcome { report, rollback }
	}

	pub async fn preview(&self, graph: &DependencyGraph) -> Vec<PlannedChange> {
		self.reconciler().preview(graph).await
	}

	/// Delete every resource of the plan in reverse dependency order.
	#[instrument(skip_all)]
	pub async fn uninstall(&self, graph: &DependencyGraph) -> RollbackSummary {
		RollbackManager::new(Arc::clone(&self.client))
			.teardown(graph.plan(), self.config.timeout)
			.await
	}

	/// One probe per resource, in plan order. Mutates nothing.
	pub async fn status(&self, graph: &DependencyGraph) -> Vec<StatusRow> {
		let mut rows = Vec::with_capacity(graph.len());
		for tier in &graph.plan().tiers {
			for spec in &tier.resources {
				let present = match self.client.get(&spec.key).await {
					Ok(live) => live.is_some(),
					Err(e) => {
						rows.push(StatusRow {
							key: spec.key.clone(),
							tier: tier.index,
							present: false,
							healthy: false,
							detail: Some(e.to_string()),
						});
						continue;
					}
				};
				let status = if present {
					let probe = ProbeSpec::for_spec(spec);
					self.prober.probe_once(self.client.as_ref(), spec, &probe).await
				} else {
					ProbeStatus::Unknown("not installed".to_string())
				};
				rows.push(StatusRow {
					key: spec.key.clone(),
					tier: tier.index,
					present,
					healthy: status == ProbeStatus::Healthy,
					detail: (status != ProbeStatus::Healthy).then(|| status.to_string()),
				});
			}
		}
		rows
	}
}

#[cfg(test)]
mod tests {
	use std::time::Duration;

	use assert_matches::assert_matches;
	use tempfile::TempDir;

	use super::*;
	use crate::{
		graph::GraphError,
		manifest::LoadError,
		reconcile::ResourceState,
		retry::BackoffPolicy,
		test_utils::{graph_from_yaml, write_manifests, FakeCluster, FakeVerb, SCENARIO},
	};

	fn config(rollback: RollbackPolicy) -> InstallerConfig {
		InstallerConfig {
			timeout: Duration::from_millis(300),
			poll_interval: Duration::from_millis(10),
			max_poll_interval: Duration::from_millis(50),
			workers: Some(2),
			rollback,
			retry: BackoffPolicy::immediate(2),
			..Default::default()
		}
	}

	fn installer(cluster: &FakeCluster, rollback: RollbackPolicy) -> Installer<FakeCluster> {
		Installer::new(Arc::new(cluster.clone()), config(rollback)).unwrap()
	}

	#[test]
	fn test_load_graph_from_dir() {
		let dir = TempDir::new().unwrap();
		write_manifests(
			dir.path(),
			&[
				("10-store.yaml", "kind: Deployment\nmetadata: { name: object-store }"),
				(
					"20-api/api.yaml",
					"kind: Deployment\nmetadata: { name: api-server }\ndependsOn: [object-store]",
				),
			],
		);

		let graph = load_graph(&InstallerConfig::default(), dir.path()).unwrap();
		assert_eq!(graph.plan().tiers.len(), 2);
	}

	#[test]
	fn test_load_graph_errors() {
		let dir = TempDir::new().unwrap();
		assert_matches!(
			load_graph(&InstallerConfig::default(), dir.path()),
			Err(InstallError::Load(LoadError::NoManifests))
		);

		write_manifests(
			dir.path(),
			&[(
				"cycle.yaml",
				"kind: ConfigMap\nmetadata: { name: a }\ndependsOn: [b]\n---\nkind: ConfigMap\nmetadata: { name: b }\ndependsOn: [a]",
			)],
		);
		assert_matches!(
			load_graph(&InstallerConfig::default(), dir.path()),
			Err(InstallError::Graph(GraphError::CyclicDependency(_)))
		);
	}

	#[tokio::test(start_paused = true)]
	async fn test_install_with_full_rollback() {
		let cluster = FakeCluster::new().stall("api-server");
		let graph = graph_from_yaml(SCENARIO).unwrap();

		let outcome = installer(&cluster, RollbackPolicy::FullReverse)
			.install(&graph, &CancellationToken::new())
			.await;

		assert_eq!(outcome.verdict(), RunVerdict::PartialFailure);
		let summary = outcome.rollback.unwrap();
		assert_eq!(summary.policy, RollbackPolicy::FullReverse);
		assert_eq!(cluster.names(FakeVerb::Delete), vec!["api-server", "object-store"]);
	}

	#[tokio::test]
	async fn test_success_skips_rollback() {
		let cluster = FakeCluster::new();
		let graph = graph_from_yaml(SCENARIO).unwrap();

		let outcome = installer(&cluster, RollbackPolicy::FullReverse)
			.install(&graph, &CancellationToken::new())
			.await;

		assert_eq!(outcome.verdict(), RunVerdict::Success);
		assert!(outcome.rollback.is_none());
	}

	#[tokio::test(start_paused = true)]
	async fn test_cancelled_install_rolls_back_failed() {
		let cluster = FakeCluster::new().stall("object-store");
		let graph = graph_from_yaml(SCENARIO).unwrap();
		let cancel = CancellationToken::new();
		let trigger = cancel.clone();
		tokio::spawn(async move {
			tokio::time::sleep(Duration::from_millis(50)).await;
			trigger.cancel();
		});

		let outcome = installer(&cluster, RollbackPolicy::None)
			.install(&graph, &cancel)
			.await;

		assert!(outcome.report.cancelled);
		assert_eq!(
			outcome.report.result("object-store").unwrap().state,
			ResourceState::Failed
		);
		let summary = outcome.rollback.unwrap();
		assert_eq!(summary.policy, RollbackPolicy::FailedOnly);
		assert_eq!(cluster.names(FakeVerb::Delete), vec!["object-store"]);
	}

	#[tokio::test]
	async fn test_uninstall_and_status() {
		let cluster = FakeCluster::new();
		let graph = graph_from_yaml(SCENARIO).unwrap();
		let installer = installer(&cluster, RollbackPolicy::None);

		let before = installer.status(&graph).await;
		assert!(before.iter().all(|row| !row.present));
		assert_eq!(cluster.mutation_count(), 0);

		installer.install(&graph, &CancellationToken::new()).await;
		let after = installer.status(&graph).await;
		assert!(after.iter().all(|row| row.present && row.healthy));
		assert_eq!(
			after.iter().map(|row| row.tier).collect::<Vec<_>>(),
			vec![0, 1, 2]
		);

		let summary = installer.uninstall(&graph).await;
		assert_eq!(
			summary.deleted,
			vec![
				"Deployment/default/ui",
				"Deployment/default/api-server",
				"Deployment/default/object-store"
			]
		);
		assert!(installer.status(&graph).await.iter().all(|row| !row.present));
	}

	#[test]
	fn test_status_row_json() {
		let graph = graph_from_yaml("kind: Namespace\nmetadata: { name: kubeflow }").unwrap();
		let row = StatusRow {
			key: graph.plan().tiers[0].resources[0].key.clone(),
			tier: 0,
			present: true,
			healthy: true,
			detail: None,
		};
		assert_eq!(
			serde_json::to_value(&row).unwrap(),
			serde_json::json!({
				"kind": "Namespace",
				"name": "kubeflow",
				"tier": 0,
				"present": true,
				"healthy": true
			})
		);
	}
}
