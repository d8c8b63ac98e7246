//! HTTP-based mock Kubernetes server using wiremock.
//!
//! This provides a real HTTP server that can be used with actual kubeconfig-based
//! connections. Objects are addressed by their REST path, which is resolved
//! through the [`k8s`] kind registry instead of a discovery document.

use std::{
	collections::{BTreeMap, HashSet},
	sync::{
		atomic::{AtomicU64, Ordering},
		Arc, Mutex, RwLock,
	},
};

use bon::Builder;
use k8s::KindInfo;
use kube::config::{
	AuthInfo, Cluster, Context, Kubeconfig, NamedAuthInfo, NamedCluster, NamedContext,
};
use serde_json::{json, Value};
use tracing::{debug, trace};
use wiremock::{
	matchers::{method, path, path_regex},
	Mock, MockServer, Request, ResponseTemplate,
};

use super::helpers::{merge_json, status_body, synthesize_status};

/// (collection path, object name)
type ObjectKey = (String, String);

/// What a request did to the stored cluster state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationVerb {
	Apply,
	Delete,
	Scale,
}

/// One recorded state change, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mutation {
	pub verb: MutationVerb,
	pub kind: String,
	pub namespace: Option<String>,
	pub name: String,
}

/// A mock Kubernetes server exposed over HTTP.
#[derive(Builder)]
pub struct HttpMockK8sServer {
	/// Objects present in the cluster before the test starts.
	#[builder(default)]
	resources: Vec<Value>,
	/// Names whose synthesized status never becomes ready.
	#[builder(default)]
	stalled: Vec<String>,
	/// Names whose apply is refused with `422 Invalid`.
	#[builder(default)]
	rejected: Vec<String>,
}

struct State {
	resources: RwLock<BTreeMap<ObjectKey, Value>>,
	mutations: Mutex<Vec<Mutation>>,
	stalled: RwLock<HashSet<String>>,
	rejected: HashSet<String>,
	resource_version: AtomicU64,
}

/// A running HTTP mock server instance.
pub struct RunningHttpMockK8sServer {
	server: MockServer,
	state: Arc<State>,
}

/// REST path of a request, resolved against the kind registry.
#[derive(Debug)]
struct Target {
	info: &'static KindInfo,
	namespace: Option<String>,
	name: Option<String>,
	subresource: Option<String>,
}

impl Target {
	/// Parse `/api/v1/...` or `/apis/<group>/<version>/...` paths.
	///
	/// Examples:
	/// - `/api/v1/namespaces/default/configmaps/cfg` -> ConfigMap `cfg` in `default`
	/// - `/apis/apps/v1/namespaces/ns/deployments/web/scale` -> scale of Deployment `web`
	/// - `/api/v1/namespaces/kubeflow` -> Namespace `kubeflow`
	fn parse(path: &str) -> Option<Self> {
		let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
		let (group, version, rest) = match segments.as_slice() {
			["api", version, rest @ ..] => ("", *version, rest),
			["apis", group, version, rest @ ..] => (*group, *version, rest),
			_ => return None,
		};
		let (namespace, plural, tail) = match rest {
			["namespaces", ns, plural, tail @ ..] => (Some(ns.to_string()), *plural, tail),
			[plural, tail @ ..] => (None, *plural, tail),
			[] => return None,
		};
		let info = k8s::kinds::lookup_plural(group, version, plural)?;
		Some(Self {
			info,
			namespace: namespace.filter(|_| info.is_namespaced()),
			name: tail.first().map(|s| s.to_string()),
			subresource: tail.get(1).map(|s| s.to_string()),
		})
	}

	fn key(&self, name: &str) -> ObjectKey {
		(
			self.info.collection_path(self.namespace.as_deref()),
			name.to_string(),
		)
	}
}

impl State {
	fn record(&self, verb: MutationVerb, target: &Target, name: &str) {
		self.mutations
			.lock()
			.expect("mutation log poisoned")
			.push(Mutation {
				verb,
				kind: target.info.kind.to_string(),
				namespace: target.namespace.clone(),
				name: name.to_string(),
			});
	}

	/// Fill in the fields a real API server owns: uid, resourceVersion,
	/// managedFields and controller-written status.
	fn finalize(&self, info: &KindInfo, mut object: Value, name: &str, manager: &str) -> Value {
		let stalled = self
			.stalled
			.read()
			.expect("stalled set poisoned")
			.contains(name);
		let version = self.resource_version.fetch_add(1, Ordering::SeqCst) + 1;
		let status = synthesize_status(info, &object, stalled);

		if let Value::Object(map) = &mut object {
			if let Some(Value::Object(metadata)) = map.get_mut("metadata") {
				metadata
					.entry("uid")
					.or_insert_with(|| json!(format!("uid-{name}")));
				metadata.insert("resourceVersion".into(), json!(version.to_string()));
				metadata.insert(
					"managedFields".into(),
					json!([{ "manager": manager, "operation": "Apply" }]),
				);
			}
			match status {
				Some(status) => {
					map.insert("status".into(), status);
				}
				None => {
					map.remove("status");
				}
			}
		}
		object
	}
}

impl HttpMockK8sServer {
	/// Start the mock server with all configured resources.
	pub async fn start(self) -> RunningHttpMockK8sServer {
		let server = MockServer::start().await;
		debug!(uri = %server.uri(), "Started mock K8s server");

		let state = Arc::new(State {
			resources: RwLock::new(BTreeMap::new()),
			mutations: Mutex::new(Vec::new()),
			stalled: RwLock::new(self.stalled.into_iter().collect()),
			rejected: self.rejected.into_iter().collect(),
			resource_version: AtomicU64::new(0),
		});

		{
			let mut resources = state.resources.write().expect("resources poisoned");
			for manifest in self.resources {
				let Some((key, info, name)) = key_for_manifest(&manifest) else {
					continue;
				};
				trace!(path = %key.0, name = %name, "Registered resource");
				let object = state.finalize(info, manifest, &name, "seed");
				resources.insert(key, object);
			}
		}

		mount_version(&server).await;
		mount_resources(&server, &state).await;

		RunningHttpMockK8sServer { server, state }
	}
}

/// Derive the storage key for a seeded manifest.
fn key_for_manifest(manifest: &Value) -> Option<(ObjectKey, &'static KindInfo, String)> {
	let kind = manifest.get("kind")?.as_str()?;
	let info = k8s::lookup(kind).ok()?;
	let name = manifest.pointer("/metadata/name")?.as_str()?.to_string();
	let namespace = info.is_namespaced().then(|| {
		manifest
			.pointer("/metadata/namespace")
			.and_then(Value::as_str)
			.unwrap_or("default")
			.to_string()
	});
	let key = (info.collection_path(namespace.as_deref()), name.clone());
	Some((key, info, name))
}

impl RunningHttpMockK8sServer {
	/// Get the server's URI (e.g., "http://127.0.0.1:12345").
	pub fn uri(&self) -> String {
		self.server.uri()
	}

	/// Every state change so far, in the order the server saw it.
	pub fn mutations(&self) -> Vec<Mutation> {
		self.state
			.mutations
			.lock()
			.expect("mutation log poisoned")
			.clone()
	}

	pub fn mutation_count(&self) -> usize {
		self.state
			.mutations
			.lock()
			.expect("mutation log poisoned")
			.len()
	}

	/// Read a stored object.
	pub fn object(&self, kind: &str, namespace: Option<&str>, name: &str) -> Option<Value> {
		let info = k8s::lookup(kind).ok()?;
		let key = (info.collection_path(namespace), name.to_string());
		self.state
			.resources
			.read()
			.expect("resources poisoned")
			.get(&key)
			.cloned()
	}

	/// Let a stalled object become ready on its next status refresh.
	pub fn release(&self, name: &str) {
		self.state
			.stalled
			.write()
			.expect("stalled set poisoned")
			.remove(name);

		let mut resources = self.state.resources.write().expect("resources poisoned");
		for ((_, object_name), object) in resources.iter_mut() {
			if object_name != name {
				continue;
			}
			let Some(info) = object
				.get("kind")
				.and_then(Value::as_str)
				.and_then(|k| k8s::lookup(k).ok())
			else {
				continue;
			};
			if let Some(status) = synthesize_status(info, object, false) {
				object["status"] = status;
			}
		}
	}

	/// Create a Kubeconfig pointing to this mock server.
	pub fn kubeconfig(&self) -> Kubeconfig {
		self.kubeconfig_with_context("mock-context")
	}

	/// Create a Kubeconfig pointing to this mock server with a custom context name.
	pub fn kubeconfig_with_context(&self, context_name: &str) -> Kubeconfig {
		let cluster_name = "mock-cluster";
		let user_name = "mock-user";

		Kubeconfig {
			clusters: vec![NamedCluster {
				name: cluster_name.to_string(),
				cluster: Some(Cluster {
					server: Some(self.uri()),
					insecure_skip_tls_verify: Some(true),
					..Default::default()
				}),
			}],
			contexts: vec![NamedContext {
				name: context_name.to_string(),
				context: Some(Context {
					cluster: cluster_name.to_string(),
					user: Some(user_name.to_string()),
					namespace: Some("default".to_string()),
					..Default::default()
				}),
			}],
			auth_infos: vec![NamedAuthInfo {
				name: user_name.to_string(),
				auth_info: Some(AuthInfo::default()),
			}],
			current_context: Some(context_name.to_string()),
			..Default::default()
		}
	}
}

async fn mount_version(server: &MockServer) {
	Mock::given(method("GET"))
		.and(path("/version"))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({
			"major": "1",
			"minor": "31",
			"gitVersion": "v1.31.0",
			"gitCommit": "fake",
			"gitTreeState": "clean",
			"buildDate": "2024-01-01T00:00:00Z",
			"goVersion": "go1.22.0",
			"compiler": "gc",
			"platform": "linux/amd64"
		})))
		.mount(server)
		.await;
}

async fn mount_resources(server: &MockServer, state: &Arc<State>) {
	let patch_state = Arc::clone(state);
	let delete_state = Arc::clone(state);
	let get_state = Arc::clone(state);

	Mock::given(method("PATCH"))
		.and(path_regex(r"^/api(s)?/.*"))
		.respond_with(move |req: &Request| handle_patch(&patch_state, req))
		.mount(server)
		.await;

	Mock::given(method("DELETE"))
		.and(path_regex(r"^/api(s)?/.*"))
		.respond_with(move |req: &Request| handle_delete(&delete_state, req))
		.mount(server)
		.await;

	Mock::given(method("GET"))
		.and(path_regex(r"^/api(s)?/.*"))
		.respond_with(move |req: &Request| handle_get(&get_state, req))
		.mount(server)
		.await;
}

fn not_found(what: &str) -> ResponseTemplate {
	ResponseTemplate::new(404).set_body_json(status_body(
		404,
		"NotFound",
		&format!("{what} not found"),
	))
}

fn handle_patch(state: &State, req: &Request) -> ResponseTemplate {
	let Some(target) = Target::parse(req.url.path()) else {
		return not_found(req.url.path());
	};
	let Some(name) = target.name.clone() else {
		return ResponseTemplate::new(405).set_body_json(status_body(
			405,
			"MethodNotAllowed",
			"cannot patch a collection",
		));
	};
	let body: Value = match serde_json::from_slice(&req.body) {
		Ok(body) => body,
		Err(e) => {
			return ResponseTemplate::new(400).set_body_json(status_body(
				400,
				"BadRequest",
				&e.to_string(),
			))
		}
	};

	if target.subresource.as_deref() == Some("scale") {
		return handle_scale(state, &target, &name, &body);
	}

	if state.rejected.contains(&name) {
		return ResponseTemplate::new(422).set_body_json(status_body(
			422,
			"Invalid",
			&format!("{} \"{}\" is invalid", target.info.kind, name),
		));
	}

	let manager = req
		.url
		.query_pairs()
		.find(|(k, _)| k == "fieldManager")
		.map(|(_, v)| v.into_owned())
		.unwrap_or_else(|| "unknown".to_string());

	let key = target.key(&name);
	let object = {
		let mut resources = state.resources.write().expect("resources poisoned");
		let mut merged = match resources.remove(&key) {
			Some(existing) => merge_json(existing, body),
			None => body,
		};
		if let Some(ns) = &target.namespace {
			merged["metadata"]["namespace"] = json!(ns);
		}
		let object = state.finalize(target.info, merged, &name, &manager);
		resources.insert(key, object.clone());
		object
	};
	state.record(MutationVerb::Apply, &target, &name);

	ResponseTemplate::new(200).set_body_json(object)
}

fn handle_scale(state: &State, target: &Target, name: &str, body: &Value) -> ResponseTemplate {
	let Some(replicas) = body.pointer("/spec/replicas").and_then(Value::as_i64) else {
		return ResponseTemplate::new(400).set_body_json(status_body(
			400,
			"BadRequest",
			"spec.replicas is required",
		));
	};

	{
		let mut resources = state.resources.write().expect("resources poisoned");
		let Some(existing) = resources.remove(&target.key(name)) else {
			return not_found(name);
		};
		let mut updated = existing;
		updated["spec"]["replicas"] = json!(replicas);
		let object = state.finalize(target.info, updated, name, "scale");
		resources.insert(target.key(name), object);
	}
	state.record(MutationVerb::Scale, target, name);

	ResponseTemplate::new(200).set_body_json(json!({
		"apiVersion": "autoscaling/v1",
		"kind": "Scale",
		"metadata": { "name": name, "namespace": target.namespace },
		"spec": { "replicas": replicas },
		"status": { "replicas": replicas },
	}))
}

fn handle_delete(state: &State, req: &Request) -> ResponseTemplate {
	let Some(target) = Target::parse(req.url.path()) else {
		return not_found(req.url.path());
	};
	let Some(name) = target.name.clone() else {
		return ResponseTemplate::new(405).set_body_json(status_body(
			405,
			"MethodNotAllowed",
			"collection delete is not supported",
		));
	};

	let removed = state
		.resources
		.write()
		.expect("resources poisoned")
		.remove(&target.key(&name));
	if removed.is_none() {
		return not_found(&name);
	}
	state.record(MutationVerb::Delete, &target, &name);

	ResponseTemplate::new(200).set_body_json(json!({
		"kind": "Status",
		"apiVersion": "v1",
		"metadata": {},
		"status": "Success",
		"details": { "name": name, "kind": target.info.plural },
	}))
}

fn handle_get(state: &State, req: &Request) -> ResponseTemplate {
	let Some(target) = Target::parse(req.url.path()) else {
		return not_found(req.url.path());
	};
	let resources = state.resources.read().expect("resources poisoned");

	if let Some(name) = &target.name {
		return match resources.get(&target.key(name)) {
			Some(object) => ResponseTemplate::new(200).set_body_json(object.clone()),
			None => not_found(name),
		};
	}

	// A namespace-less request for a namespaced kind lists across namespaces.
	let collection = target.info.collection_path(target.namespace.as_deref());
	let items: Vec<Value> = resources
		.iter()
		.filter(|((path, _), object)| {
			if target.namespace.is_some() || !target.info.is_namespaced() {
				*path == collection
			} else {
				object.get("kind").and_then(Value::as_str) == Some(target.info.kind)
			}
		})
		.map(|(_, object)| object.clone())
		.collect();

	ResponseTemplate::new(200).set_body_json(json!({
		"kind": format!("{}List", target.info.kind),
		"apiVersion": target.info.api_version(),
		"metadata": { "resourceVersion": "1" },
		"items": items,
	}))
}
