//! Desired vs observed state.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;
use tracing::{instrument, warn};

use crate::{
	k8s::{ClusterClient, ObservedResource},
	manifest::{ResourceKey, ResourceSpec},
};

/// What applying a spec would do to the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Change {
	Create,
	Update,
	Unchanged,
}

impl Change {
	pub fn as_str(self) -> &'static str {
		match self {
			Self::Create => "create",
			Self::Update => "update",
			Self::Unchanged => "unchanged",
		}
	}
}

/// Whether every field set in `desired` has the same value in `live`.
///
/// Fields only the server writes (status, uid, managedFields, defaults) are
/// ignored because they never appear in `desired`. Arrays must match in
/// length. Numbers compare by value, so `1` equals `1.0`.
pub fn is_subset(desired: &Value, live: &Value) -> bool {
	match (desired, live) {
		(Value::Object(want), Value::Object(have)) => want.iter().all(|(key, want_val)| {
			match have.get(key) {
				Some(have_val) => is_subset(want_val, have_val),
				None => want_val.is_null(),
			}
		}),
		(Value::Array(want), Value::Array(have)) => {
			want.len() == have.len() && want.iter().zip(have).all(|(w, h)| is_subset(w, h))
		}
		(Value::Number(want), Value::Number(have)) => match (want.as_f64(), have.as_f64()) {
			(Some(w), Some(h)) => w == h,
			_ => want == have,
		},
		(want, have) => want == have,
	}
}

#[derive(Debug, Clone, PartialEq)]
pub enum Observation {
	Present(ObservedResource),
	Absent,
	/// The read failed after retries.
	Unreadable(String),
}

/// Point-in-time reads of a set of resources. Never updated after capture.
#[derive(Debug, Default)]
pub struct ClusterSnapshot {
	observations: BTreeMap<ResourceKey, Observation>,
}

impl ClusterSnapshot {
	#[instrument(skip_all)]
	pub async fn capture<'a, C: ClusterClient + ?Sized>(
		client: &C,
		keys: impl IntoIterator<Item = &'a ResourceKey>,
	) -> Self {
		let mut observations = BTreeMap::new();
		for key in keys {
			let observation = match client.get(key).await {
				Ok(Some(live)) => Observation::Present(live),
				Ok(None) => Observation::Absent,
				Err(e) => {
					warn!(resource = %key, error = %e, "could not read live state");
					Observation::Unreadable(e.to_string())
				}
			};
			observations.insert(key.clone(), observation);
		}
		Self { observations }
	}

	pub fn observation(&self, key: &ResourceKey) -> Option<&Observation> {
		self.observations.get(key)
	}

	/// An unreadable or uncaptured resource counts as an update.
	pub fn change_for(&self, spec: &ResourceSpec) -> Change {
		match self.observations.get(&spec.key) {
			Some(Observation::Present(live)) if is_subset(&spec.manifest, live) => Change::Unchanged,
			Some(Observation::Absent) => Change::Create,
			_ => Change::Update,
		}
	}
}

#[cfg(test)]
mod tests {
	use rstest::rstest;
	use serde_json::json;

	use super::*;
	use crate::test_utils::{spec_from_yaml, FakeCluster};

	#[rstest]
	#[case::equal(json!({"a": 1}), json!({"a": 1}), true)]
	#[case::server_fields(
		json!({"metadata": {"name": "x"}, "spec": {"replicas": 2}}),
		json!({"metadata": {"name": "x", "uid": "u", "managedFields": []}, "spec": {"replicas": 2, "paused": false}, "status": {}}),
		true
	)]
	#[case::changed_value(json!({"spec": {"replicas": 2}}), json!({"spec": {"replicas": 3}}), false)]
	#[case::missing_key(json!({"data": {"k": "v"}}), json!({"data": {}}), false)]
	#[case::null_is_absent(json!({"data": null}), json!({}), true)]
	#[case::array_length(json!({"ports": [{"port": 80}]}), json!({"ports": [{"port": 80}, {"port": 443}]}), false)]
	#[case::array_elements(
		json!({"ports": [{"port": 80}]}),
		json!({"ports": [{"port": 80, "protocol": "TCP"}]}),
		true
	)]
	#[case::float_int(json!({"weight": 1}), json!({"weight": 1.0}), true)]
	fn test_is_subset(#[case] desired: Value, #[case] live: Value, #[case] expected: bool) {
		assert_eq!(is_subset(&desired, &live), expected);
	}

	#[tokio::test]
	async fn test_snapshot_change() {
		let spec = spec_from_yaml("kind: ConfigMap\nmetadata: { name: cfg }\ndata: { a: b }");
		let cluster = FakeCluster::new();

		let snapshot = ClusterSnapshot::capture(&cluster, [&spec.key]).await;
		assert_eq!(snapshot.observation(&spec.key), Some(&Observation::Absent));
		assert_eq!(snapshot.change_for(&spec), Change::Create);

		cluster.apply(&spec).await.unwrap();
		let snapshot = ClusterSnapshot::capture(&cluster, [&spec.key]).await;
		assert_eq!(snapshot.change_for(&spec), Change::Unchanged);

		let edited = spec_from_yaml("kind: ConfigMap\nmetadata: { name: cfg }\ndata: { a: c }");
		assert_eq!(snapshot.change_for(&edited), Change::Update);
	}
}
