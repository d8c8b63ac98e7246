//! Static registry of the resource kinds kinstall knows how to reconcile.

use std::fmt;

use phf::phf_map;
use serde::Serialize;
use thiserror::Error;

/// Kubernetes API resource scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ResourceScope {
	/// Resource lives inside a namespace (e.g., Deployment, ConfigMap).
	Namespaced,

	/// Resource is cluster-wide (e.g., Namespace).
	ClusterWide,
}

/// Status signal that tells whether a live object of a kind is ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ReadinessSignal {
	/// Object existing is enough (ConfigMap, Secret, Service, ...).
	Exists,

	/// `status.readyReplicas` must reach the desired replica count.
	Replicas,

	/// Job must report a `Complete` condition or a successful pod.
	Completion,

	/// PersistentVolumeClaim must be in the `Bound` phase.
	Bound,
}

/// Everything needed to talk to the API about one kind.
#[derive(Debug, PartialEq, Eq)]
pub struct KindInfo {
	pub kind: &'static str,
	pub group: &'static str,
	pub version: &'static str,
	pub plural: &'static str,
	pub scope: ResourceScope,
	pub readiness: ReadinessSignal,
}

static KINDS: phf::Map<&'static str, KindInfo> = phf_map! {
	"Namespace" => KindInfo {
		kind: "Namespace",
		group: "",
		version: "v1",
		plural: "namespaces",
		scope: ResourceScope::ClusterWide,
		readiness: ReadinessSignal::Exists,
	},
	"ServiceAccount" => KindInfo {
		kind: "ServiceAccount",
		group: "",
		version: "v1",
		plural: "serviceaccounts",
		scope: ResourceScope::Namespaced,
		readiness: ReadinessSignal::Exists,
	},
	"ConfigMap" => KindInfo {
		kind: "ConfigMap",
		group: "",
		version: "v1",
		plural: "configmaps",
		scope: ResourceScope::Namespaced,
		readiness: ReadinessSignal::Exists,
	},
	"Secret" => KindInfo {
		kind: "Secret",
		group: "",
		version: "v1",
		plural: "secrets",
		scope: ResourceScope::Namespaced,
		readiness: ReadinessSignal::Exists,
	},
	"Service" => KindInfo {
		kind: "Service",
		group: "",
		version: "v1",
		plural: "services",
		scope: ResourceScope::Namespaced,
		readiness: ReadinessSignal::Exists,
	},
	"PersistentVolumeClaim" => KindInfo {
		kind: "PersistentVolumeClaim",
		group: "",
		version: "v1",
		plural: "persistentvolumeclaims",
		scope: ResourceScope::Namespaced,
		readiness: ReadinessSignal::Bound,
	},
	"Deployment" => KindInfo {
		kind: "Deployment",
		group: "apps",
		version: "v1",
		plural: "deployments",
		scope: ResourceScope::Namespaced,
		readiness: ReadinessSignal::Replicas,
	},
	"StatefulSet" => KindInfo {
		kind: "StatefulSet",
		group: "apps",
		version: "v1",
		plural: "statefulsets",
		scope: ResourceScope::Namespaced,
		readiness: ReadinessSignal::Replicas,
	},
	"Job" => KindInfo {
		kind: "Job",
		group: "batch",
		version: "v1",
		plural: "jobs",
		scope: ResourceScope::Namespaced,
		readiness: ReadinessSignal::Completion,
	},
};

/// Returned when a manifest names a kind outside the registry.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("unsupported resource kind `{0}`")]
pub struct UnknownKind(pub String);

/// Look up a kind by its `kind` field.
pub fn lookup(kind: &str) -> Result<&'static KindInfo, UnknownKind> {
	KINDS.get(kind).ok_or_else(|| UnknownKind(kind.to_string()))
}

/// Find the kind served under a group/version and plural resource name.
pub fn lookup_plural(group: &str, version: &str, plural: &str) -> Option<&'static KindInfo> {
	KINDS
		.values()
		.find(|k| k.group == group && k.version == version && k.plural == plural)
}

/// Iterate over every registered kind.
pub fn all() -> impl Iterator<Item = &'static KindInfo> {
	KINDS.values()
}

impl KindInfo {
	/// The `apiVersion` string for manifests of this kind.
	pub fn api_version(&self) -> String {
		if self.group.is_empty() {
			self.version.to_string()
		} else {
			format!("{}/{}", self.group, self.version)
		}
	}

	pub fn is_namespaced(&self) -> bool {
		self.scope == ResourceScope::Namespaced
	}

	/// REST path of the collection holding objects of this kind.
	///
	/// `namespace` is ignored for cluster-wide kinds.
	pub fn collection_path(&self, namespace: Option<&str>) -> String {
		let root = if self.group.is_empty() {
			format!("/api/{}", self.version)
		} else {
			format!("/apis/{}/{}", self.group, self.version)
		};
		match (self.scope, namespace) {
			(ResourceScope::Namespaced, Some(ns)) => {
				format!("{}/namespaces/{}/{}", root, ns, self.plural)
			}
			_ => format!("{}/{}", root, self.plural),
		}
	}

	/// REST path of a single named object.
	pub fn object_path(&self, namespace: Option<&str>, name: &str) -> String {
		format!("{}/{}", self.collection_path(namespace), name)
	}
}

impl fmt::Display for KindInfo {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}/{}", self.api_version(), self.kind)
	}
}

/// Desired replica count declared by a workload manifest (`spec.replicas`, default 1).
pub fn desired_replicas(object: &serde_json::Value) -> i64 {
	object
		.pointer("/spec/replicas")
		.and_then(serde_json::Value::as_i64)
		.unwrap_or(1)
}

/// Ready replica count reported by a live workload (`status.readyReplicas`, default 0).
pub fn ready_replicas(object: &serde_json::Value) -> i64 {
	object
		.pointer("/status/readyReplicas")
		.and_then(serde_json::Value::as_i64)
		.unwrap_or(0)
}
