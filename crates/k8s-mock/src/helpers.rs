//! Helper functions for mock Kubernetes testing.

use k8s::{KindInfo, ReadinessSignal};
use serde_json::{json, Value};

/// Deep merge two JSON values (patch into base).
///
/// Good enough to stand in for server-side apply when a single field manager
/// owns every field it sends.
pub fn merge_json(base: Value, patch: Value) -> Value {
	match (base, patch) {
		(Value::Object(mut base_map), Value::Object(patch_map)) => {
			for (key, patch_value) in patch_map {
				let base_value = base_map.remove(&key).unwrap_or(Value::Null);
				base_map.insert(key, merge_json(base_value, patch_value));
			}
			Value::Object(base_map)
		}
		(_, patch) => patch,
	}
}

/// Status a controller would eventually write for an object of this kind.
///
/// Stalled objects get a status that never satisfies the readiness signal.
pub fn synthesize_status(info: &KindInfo, object: &Value, stalled: bool) -> Option<Value> {
	match info.readiness {
		ReadinessSignal::Exists => None,
		ReadinessSignal::Replicas => {
			let desired = k8s::kinds::desired_replicas(object);
			let ready = if stalled { 0 } else { desired };
			Some(json!({
				"replicas": desired,
				"readyReplicas": ready,
				"availableReplicas": ready,
			}))
		}
		ReadinessSignal::Completion if stalled => Some(json!({ "active": 1 })),
		ReadinessSignal::Completion => Some(json!({
			"succeeded": 1,
			"conditions": [{ "type": "Complete", "status": "True" }],
		})),
		ReadinessSignal::Bound => Some(json!({
			"phase": if stalled { "Pending" } else { "Bound" },
		})),
	}
}

/// Kubernetes `Status` body for error responses.
pub fn status_body(code: u16, reason: &str, message: &str) -> Value {
	json!({
		"kind": "Status",
		"apiVersion": "v1",
		"metadata": {},
		"status": "Failure",
		"message": message,
		"reason": reason,
		"code": code,
	})
}
