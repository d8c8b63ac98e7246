//! Cluster access: the [`ClusterClient`] seam, the kube-backed implementation
//! and connection setup.

pub mod client;
pub mod cluster;

use std::time::Duration;

use async_trait::async_trait;
use ::k8s::ReadinessSignal;
use serde_json::Value;
use thiserror::Error;
use tokio::time::Instant;

pub use self::{
	client::{ClusterConnection, ConnectionError},
	cluster::KubeCluster,
};
use crate::{
	duration::deadline_after,
	manifest::{ResourceKey, ResourceSpec},
	retry::Transient,
};

/// A live object as returned by the API server.
pub type ObservedResource = Value;

#[derive(Debug, Error)]
pub enum ClientError {
	#[error("{operation} {key}: cluster unavailable after retries: {message}")]
	Transient {
		operation: &'static str,
		key: String,
		message: String,
	},

	#[error("{operation} {key} rejected by the API server ({code}): {message}")]
	Rejected {
		operation: &'static str,
		key: String,
		code: u16,
		message: String,
	},

	#[error("decoding {key}")]
	Serialization {
		key: String,
		#[source]
		source: serde_json::Error,
	},
}

impl Transient for ClientError {
	fn is_transient(&self) -> bool {
		matches!(self, Self::Transient { .. })
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
	Deleted,
	NotFound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
	Ready,
	TimedOut,
}

/// A readiness condition checked against a live object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Condition {
	Exists,
	Deleted,
	ReplicasReady { desired: i64 },
	JobComplete,
	PvcBound,
}

impl Condition {
	/// The default readiness condition for a spec's kind.
	pub fn for_spec(spec: &ResourceSpec) -> Self {
		match spec.kind_info().readiness {
			ReadinessSignal::Exists => Self::Exists,
			ReadinessSignal::Replicas => Self::ReplicasReady {
				desired: ::k8s::kinds::desired_replicas(&spec.manifest),
			},
			ReadinessSignal::Completion => Self::JobComplete,
			ReadinessSignal::Bound => Self::PvcBound,
		}
	}

	/// `None` when the object is missing and the condition needs it to exist.
	pub fn is_met(&self, observed: Option<&Value>) -> Option<bool> {
		if let Self::Deleted = self {
			return Some(observed.is_none());
		}
		let obj = observed?;
		Some(match self {
			Self::Exists => true,
			Self::Deleted => false,
			Self::ReplicasReady { desired } => ::k8s::kinds::ready_replicas(obj) >= *desired,
			Self::JobComplete => job_complete(obj),
			Self::PvcBound => obj.pointer("/status/phase").and_then(Value::as_str) == Some("Bound"),
		})
	}
}

fn job_complete(obj: &Value) -> bool {
	let complete = obj
		.pointer("/status/conditions")
		.and_then(Value::as_array)
		.is_some_and(|conditions| {
			conditions.iter().any(|c| {
				c.get("type").and_then(Value::as_str) == Some("Complete")
					&& c.get("status").and_then(Value::as_str) == Some("True")
			})
		});
	complete
		|| obj
			.pointer("/status/succeeded")
			.and_then(Value::as_i64)
			.is_some_and(|n| n > 0)
}

/// Operations the installer needs from a cluster.
///
/// Transient failures are retried inside each call; errors returned here are final.
#[async_trait]
pub trait ClusterClient: Send + Sync {
	/// `Ok(None)` when the object does not exist.
	async fn get(&self, key: &ResourceKey) -> Result<Option<ObservedResource>, ClientError>;

	/// Server-side apply of the spec's manifest.
	async fn apply(&self, spec: &ResourceSpec) -> Result<ObservedResource, ClientError>;

	/// Delete with background propagation. A missing object is not an error.
	async fn delete(&self, key: &ResourceKey) -> Result<DeleteOutcome, ClientError>;

	async fn scale(&self, key: &ResourceKey, replicas: i32) -> Result<(), ClientError>;

	/// Interval between polls in [`ClusterClient::wait_for_condition`].
	fn poll_interval(&self) -> Duration;

	/// Poll `get` at a fixed interval until `condition` holds or `timeout` passes.
	///
	/// A `get` still in flight at the deadline is abandoned.
	async fn wait_for_condition(
		&self,
		key: &ResourceKey,
		condition: &Condition,
		timeout: Duration,
	) -> Result<WaitOutcome, ClientError> {
		let deadline = deadline_after(timeout);
		loop {
			let Ok(observed) = tokio::time::timeout_at(deadline, self.get(key)).await else {
				return Ok(WaitOutcome::TimedOut);
			};
			let observed = observed?;
			if condition.is_met(observed.as_ref()) == Some(true) {
				return Ok(WaitOutcome::Ready);
			}
			let now = Instant::now();
			if now >= deadline {
				return Ok(WaitOutcome::TimedOut);
			}
			tokio::time::sleep(self.poll_interval().min(deadline - now)).await;
		}
	}
}
