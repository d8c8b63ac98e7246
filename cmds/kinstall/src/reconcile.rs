//! The reconcile loop.
//!
//! Each resource moves through
//! `Pending -> Applying -> AwaitingReady -> Ready | Failed | TimedOut`.
//! Tiers run strictly in order; resources inside a tier run concurrently on a
//! bounded worker pool. A resource only leaves `Pending` once every hard
//! dependency is `Ready`, so failures stay confined to their dependents.

use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

use bon::Builder;
use serde::Serialize;
use thiserror::Error;
use tokio::{sync::Semaphore, task::JoinSet, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::{
	diff::{Change, ClusterSnapshot},
	duration::format_duration,
	graph::DependencyGraph,
	k8s::{ClientError, ClusterClient},
	manifest::{ResourceKey, ResourceSpec},
	probe::{ProbeOutcome, ProbeSpec, Prober},
	report::RunReport,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ResourceState {
	Pending,
	Applying,
	AwaitingReady,
	Ready,
	Failed,
	TimedOut,
}

impl ResourceState {
	pub fn is_terminal(self) -> bool {
		matches!(self, Self::Ready | Self::Failed | Self::TimedOut)
	}
}

impl fmt::Display for ResourceState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		fmt::Debug::fmt(self, f)
	}
}

/// What the apply step did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ApplyAction {
	Applied,
	Unchanged,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FailureReason {
	#[error("apply rejected: {0}")]
	ApplyRejected(String),

	#[error("{0}")]
	Client(String),

	#[error("not ready after {}: last probe {last}", format_duration(*.after))]
	ProbeTimeout { after: Duration, last: String },

	#[error("cancelled")]
	Cancelled,

	#[error("blocked by {}", ResourceKey::join(.0))]
	BlockedBy(Vec<ResourceKey>),
}

impl From<ClientError> for FailureReason {
	fn from(err: ClientError) -> Self {
		match err {
			ClientError::Rejected { .. } => Self::ApplyRejected(err.to_string()),
			other => Self::Client(other.to_string()),
		}
	}
}

/// Final outcome for one resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceResult {
	pub key: ResourceKey,
	pub state: ResourceState,
	/// Set once the apply step completed.
	pub action: Option<ApplyAction>,
	pub duration: Duration,
	pub failure: Option<FailureReason>,
}

impl ResourceResult {
	fn new(key: ResourceKey, state: ResourceState) -> Self {
		Self {
			key,
			state,
			action: None,
			duration: Duration::ZERO,
			failure: None,
		}
	}

	fn pending(key: ResourceKey, reason: FailureReason) -> Self {
		Self {
			failure: Some(reason),
			..Self::new(key, ResourceState::Pending)
		}
	}

	/// Whether this run's apply call went through for the resource.
	pub fn applied(&self) -> bool {
		self.action == Some(ApplyAction::Applied)
	}
}

fn default_workers() -> usize {
	std::thread::available_parallelism().map_or(4, usize::from)
}

#[derive(Debug, Clone, Builder)]
pub struct ReconcileOptions {
	/// Upper bound on resources reconciled at once.
	#[builder(default = default_workers())]
	pub workers: usize,
	/// Readiness timeout for resources without their own.
	#[builder(default = Duration::from_secs(300))]
	pub timeout: Duration,
}

impl Default for ReconcileOptions {
	fn default() -> Self {
		Self::builder().build()
	}
}

/// One row of a dry run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedChange {
	pub tier: usize,
	#[serde(flatten)]
	pub key: ResourceKey,
	pub change: Change,
}

pub struct Reconciler<C: ?Sized> {
	client: Arc<C>,
	prober: Arc<Prober>,
	options: ReconcileOptions,
}

impl<C: ClusterClient + ?Sized + 'static> Reconciler<C> {
	pub fn new(client: Arc<C>, prober: Arc<Prober>, options: ReconcileOptions) -> Self {
		Self {
			client,
			prober,
			options,
		}
	}

	/// Reconcile every resource of the plan and report the outcome.
	///
	/// Once `cancel` fires, running applies finish, readiness waits end as
	/// `Failed(Cancelled)`, and nothing else starts.
	#[instrument(skip_all, fields(resources = graph.len(), workers = self.options.workers))]
	pub async fn run(&self, graph: &DependencyGraph, cancel: &CancellationToken) -> RunReport {
		let started = Instant::now();
		let semaphore = Arc::new(Semaphore::new(self.options.workers.max(1)));
		let mut results: HashMap<ResourceKey, ResourceResult> = HashMap::new();

		for tier in &graph.plan().tiers {
			let mut runnable = Vec::new();
			for spec in &tier.resources {
				if cancel.is_cancelled() {
					results.insert(
						spec.key.clone(),
						ResourceResult::pending(spec.key.clone(), FailureReason::Cancelled),
					);
					continue;
				}

				let blockers: Vec<ResourceKey> = graph
					.dependencies(&spec.key)
					.iter()
					.filter(|edge| !edge.soft)
					.filter(|edge| {
						results.get(&edge.target).map(|r| r.state) != Some(ResourceState::Ready)
					})
					.map(|edge| edge.target.clone())
					.collect();
				if blockers.is_empty() {
					runnable.push(Arc::clone(spec));
				} else {
					debug!(resource = %spec.key, blocked_by = %ResourceKey::join(&blockers), "staying pending");
					results.insert(
						spec.key.clone(),
						ResourceResult::pending(spec.key.clone(), FailureReason::BlockedBy(blockers)),
					);
				}
			}
			if runnable.is_empty() {
				continue;
			}

			let snapshot =
				ClusterSnapshot::capture(self.client.as_ref(), runnable.iter().map(|s| &s.key)).await;

			let mut join_set = JoinSet::new();
			let mut task_keys = HashMap::new();
			for spec in runnable {
				let change = snapshot.change_for(&spec);
				let key = spec.key.clone();
				let handle = join_set.spawn(reconcile_one(
					Arc::clone(&self.client),
					Arc::clone(&self.prober),
					Arc::clone(&semaphore),
					spec,
					change,
					self.options.timeout,
					cancel.clone(),
				));
				task_keys.insert(handle.id(), key);
			}

			while let Some(joined) = join_set.join_next_with_id().await {
				match joined {
					Ok((_, result)) => {
						results.insert(result.key.clone(), result);
					}
					Err(e) => {
						let Some(key) = task_keys.remove(&e.id()) else {
							continue;
						};
						warn!(resource = %key, error = %e, "reconcile task panicked");
						let mut result = ResourceResult::new(key.clone(), ResourceState::Failed);
						result.failure = Some(FailureReason::Client(format!("task failed: {e}")));
						results.insert(key, result);
					}
				}
			}

			info!(
				tier = tier.index,
				ready = tier
					.resources
					.iter()
					.filter(|s| results.get(&s.key).is_some_and(|r| r.state == ResourceState::Ready))
					.count(),
				total = tier.resources.len(),
				"tier finished"
			);
		}

		let ordered = graph
			.plan()
			.resources()
			.filter_map(|spec| results.remove(&spec.key))
			.collect();

		RunReport {
			results: ordered,
			cancelled: cancel.is_cancelled(),
			elapsed: started.elapsed(),
		}
	}

	/// What a run would do, without mutating anything.
	pub async fn preview(&self, graph: &DependencyGraph) -> Vec<PlannedChange> {
		let plan = graph.plan();
		let snapshot =
			ClusterSnapshot::capture(self.client.as_ref(), plan.resources().map(|s| &s.key)).await;

		plan.tiers
			.iter()
			.flat_map(|tier| {
				tier.resources.iter().map(|spec| PlannedChange {
					tier: tier.index,
					key: spec.key.clone(),
					change: snapshot.change_for(spec),
				})
			})
			.collect()
	}
}

#[instrument(skip_all, fields(resource = %spec.key))]
async fn reconcile_one<C: ClusterClient + ?Sized>(
	client: Arc<C>,
	prober: Arc<Prober>,
	permits: Arc<Semaphore>,
	spec: Arc<ResourceSpec>,
	change: Change,
	default_timeout: Duration,
	cancel: CancellationToken,
) -> ResourceResult {
	let key = spec.key.clone();
	let _permit = tokio::select! {
		biased;
		() = cancel.cancelled() => return ResourceResult::pending(key, FailureReason::Cancelled),
		permit = permits.acquire_owned() => match permit {
			Ok(permit) => permit,
			Err(_) => {
				return ResourceResult::pending(key, FailureReason::Client("worker pool closed".to_string()))
			}
		},
	};

	let started = Instant::now();
	let mut result = ResourceResult::new(key, ResourceState::Applying);
	debug!(change = change.as_str(), "applying");

	let action = if change == Change::Unchanged {
		ApplyAction::Unchanged
	} else {
		match client.apply(&spec).await {
			Ok(_) => ApplyAction::Applied,
			Err(e) => {
				warn!(error = %e, "apply failed");
				result.state = ResourceState::Failed;
				result.failure = Some(e.into());
				result.duration = started.elapsed();
				return result;
			}
		}
	};
	result.action = Some(action);
	result.state = ResourceState::AwaitingReady;

	let timeout = spec.readiness.timeout.unwrap_or(default_timeout);
	let probe = ProbeSpec::for_spec(&spec);
	debug!(probe = %probe, timeout = %format_duration(timeout), "awaiting readiness");

	match prober
		.wait_until_healthy(client.as_ref(), &spec, &probe, timeout, &cancel)
		.await
	{
		ProbeOutcome::Healthy => {
			result.state = ResourceState::Ready;
		}
		ProbeOutcome::TimedOut { last } => {
			warn!(last = %last, "readiness timed out");
			result.state = ResourceState::TimedOut;
			result.failure = Some(FailureReason::ProbeTimeout {
				after: timeout,
				last: last.to_string(),
			});
		}
		ProbeOutcome::Cancelled => {
			result.state = ResourceState::Failed;
			result.failure = Some(FailureReason::Cancelled);
		}
	}
	result.duration = started.elapsed();
	info!(state = %result.state, action = ?action, "reconciled");
	result
}
