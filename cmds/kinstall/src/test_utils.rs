//! Common test utilities.

use std::{
	collections::{BTreeMap, HashMap, HashSet},
	io::{self, ErrorKind, Write},
	path::Path,
	sync::{
		atomic::{AtomicUsize, Ordering},
		Arc, Mutex,
	},
	time::Duration,
};

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::{
	graph::{DependencyGraph, GraphError},
	k8s::{ClientError, ClusterClient, DeleteOutcome, ObservedResource},
	manifest::{Loader, ResourceKey, ResourceSpec},
	retry::{retry_with_backoff, BackoffPolicy},
};

/// ObjectStore <- ApiServer <- UI, all Deployments.
pub const SCENARIO: &str = "
kind: Deployment
metadata: { name: object-store }
---
kind: Deployment
metadata: { name: api-server }
dependsOn: [object-store]
---
kind: Deployment
metadata: { name: ui }
dependsOn: [api-server]
";

/// A writer that simulates a broken pipe (SIGPIPE scenario).
///
/// This writer immediately returns `ErrorKind::BrokenPipe` on any write attempt,
/// simulating what happens when stdout is connected to a process that has exited.
pub struct BrokenPipeWriter;

impl Write for BrokenPipeWriter {
	fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
		Err(io::Error::new(ErrorKind::BrokenPipe, "broken pipe"))
	}

	fn flush(&mut self) -> io::Result<()> {
		Err(io::Error::new(ErrorKind::BrokenPipe, "broken pipe"))
	}
}

/// Load specs from inline YAML in the `default` namespace.
pub fn specs_from_yaml(yaml: &str) -> Vec<ResourceSpec> {
	let mut loader = Loader::new("default");
	loader.load_str("test.yaml", yaml).unwrap();
	loader.finish().unwrap()
}

/// Load exactly one spec from inline YAML.
pub fn spec_from_yaml(yaml: &str) -> ResourceSpec {
	let mut specs = specs_from_yaml(yaml);
	assert_eq!(specs.len(), 1, "expected a single manifest");
	specs.remove(0)
}

pub fn graph_from_yaml(yaml: &str) -> Result<DependencyGraph, GraphError> {
	DependencyGraph::build(specs_from_yaml(yaml))
}

/// Write `(relative path, contents)` pairs under `dir`.
pub fn write_manifests(dir: &Path, files: &[(&str, &str)]) {
	for (name, contents) in files {
		let path = dir.join(name);
		if let Some(parent) = path.parent() {
			std::fs::create_dir_all(parent).unwrap();
		}
		std::fs::write(path, contents).unwrap();
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FakeVerb {
	Apply,
	Delete,
	Scale,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeMutation {
	pub verb: FakeVerb,
	pub key: ResourceKey,
}

#[derive(Default)]
struct State {
	objects: BTreeMap<ResourceKey, Value>,
	stalled: HashSet<String>,
	rejected: HashSet<String>,
	/// Remaining transient failures per name, for apply.
	flaky: HashMap<String, u32>,
	unreachable: bool,
	mutations: Vec<FakeMutation>,
	apply_attempts: usize,
}

struct Inner {
	state: Mutex<State>,
	apply_delay: Duration,
	retry: BackoffPolicy,
	in_flight: AtomicUsize,
	max_in_flight: AtomicUsize,
}

/// In-memory [`ClusterClient`] with scripted failures and call counters.
///
/// Workloads become ready as soon as they are applied unless their name was
/// passed to [`FakeCluster::stall`].
#[derive(Clone)]
pub struct FakeCluster {
	inner: Arc<Inner>,
}

impl Default for FakeCluster {
	fn default() -> Self {
		Self::new()
	}
}

impl FakeCluster {
	pub fn new() -> Self {
		Self::with_apply_delay(Duration::ZERO)
	}

	/// Each apply sleeps for `delay`, so concurrent applies overlap.
	pub fn with_apply_delay(delay: Duration) -> Self {
		Self {
			inner: Arc::new(Inner {
				state: Mutex::new(State::default()),
				apply_delay: delay,
				retry: BackoffPolicy::immediate(3),
				in_flight: AtomicUsize::new(0),
				max_in_flight: AtomicUsize::new(0),
			}),
		}
	}

	fn state(&self) -> std::sync::MutexGuard<'_, State> {
		self.inner.state.lock().unwrap()
	}

	/// Never report `name` as ready.
	pub fn stall(self, name: &str) -> Self {
		self.state().stalled.insert(name.to_string());
		self
	}

	/// Refuse applies of `name` with a 422.
	pub fn reject(self, name: &str) -> Self {
		self.state().rejected.insert(name.to_string());
		self
	}

	/// Fail the next `failures` apply attempts of `name` transiently.
	pub fn flaky(self, name: &str, failures: u32) -> Self {
		self.state().flaky.insert(name.to_string(), failures);
		self
	}

	/// Fail every call transiently.
	pub fn unreachable(self) -> Self {
		self.state().unreachable = true;
		self
	}

	/// Pre-populate an object as if an earlier run had applied it.
	pub fn seed(self, spec: &ResourceSpec) -> Self {
		{
			let mut state = self.state();
			let stalled = state.stalled.contains(&spec.key.name);
			let object = live_object(spec, stalled);
			state.objects.insert(spec.key.clone(), object);
		}
		self
	}

	/// Let a stalled resource become ready.
	pub fn release(&self, name: &str) {
		let mut state = self.state();
		state.stalled.remove(name);
		for (key, object) in state.objects.iter_mut() {
			if key.name == name {
				set_status(key, object, false);
			}
		}
	}

	pub fn mutations(&self) -> Vec<FakeMutation> {
		self.state().mutations.clone()
	}

	pub fn mutation_count(&self) -> usize {
		self.state().mutations.len()
	}

	/// Names touched by `verb`, in order.
	pub fn names(&self, verb: FakeVerb) -> Vec<String> {
		self.state()
			.mutations
			.iter()
			.filter(|m| m.verb == verb)
			.map(|m| m.key.name.clone())
			.collect()
	}

	pub fn apply_attempts(&self) -> usize {
		self.state().apply_attempts
	}

	pub fn max_in_flight(&self) -> usize {
		self.inner.max_in_flight.load(Ordering::SeqCst)
	}

	pub fn object(&self, key: &ResourceKey) -> Option<Value> {
		self.state().objects.get(key).cloned()
	}

	fn unavailable(operation: &'static str, key: &ResourceKey) -> ClientError {
		ClientError::Transient {
			operation,
			key: key.to_string(),
			message: "connection refused".to_string(),
		}
	}

	fn try_apply(&self, spec: &ResourceSpec) -> Result<ObservedResource, ClientError> {
		let mut state = self.state();
		state.apply_attempts += 1;
		let name = &spec.key.name;

		if state.unreachable {
			return Err(Self::unavailable("apply", &spec.key));
		}
		if let Some(remaining) = state.flaky.get_mut(name) {
			if *remaining > 0 {
				*remaining -= 1;
				return Err(Self::unavailable("apply", &spec.key));
			}
		}
		if state.rejected.contains(name) {
			return Err(ClientError::Rejected {
				operation: "apply",
				key: spec.key.to_string(),
				code: 422,
				message: format!("{} \"{}\" is invalid", spec.key.kind, name),
			});
		}

		let stalled = state.stalled.contains(name);
		let object = live_object(spec, stalled);
		state.objects.insert(spec.key.clone(), object.clone());
		state.mutations.push(FakeMutation {
			verb: FakeVerb::Apply,
			key: spec.key.clone(),
		});
		Ok(object)
	}
}

fn live_object(spec: &ResourceSpec, stalled: bool) -> Value {
	let mut object = spec.manifest.clone();
	object["metadata"]["uid"] = json!(format!("uid-{}", spec.key.name));
	object["metadata"]["managedFields"] = json!([{ "manager": "kinstall", "operation": "Apply" }]);
	set_status(&spec.key, &mut object, stalled);
	object
}

fn set_status(key: &ResourceKey, object: &mut Value, stalled: bool) {
	if let Some(status) = k8s_mock::synthesize_status(key.kind.info(), object, stalled) {
		object["status"] = status;
	}
}

#[async_trait]
impl ClusterClient for FakeCluster {
	async fn get(&self, key: &ResourceKey) -> Result<Option<ObservedResource>, ClientError> {
		let state = self.state();
		if state.unreachable {
			return Err(Self::unavailable("get", key));
		}
		Ok(state.objects.get(key).cloned())
	}

	async fn apply(&self, spec: &ResourceSpec) -> Result<ObservedResource, ClientError> {
		let now = self.inner.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
		self.inner.max_in_flight.fetch_max(now, Ordering::SeqCst);

		if !self.inner.apply_delay.is_zero() {
			tokio::time::sleep(self.inner.apply_delay).await;
		}
		let this = self;
		let result = retry_with_backoff(&self.inner.retry, "apply", move || async move {
			this.try_apply(spec)
		})
		.await;

		self.inner.in_flight.fetch_sub(1, Ordering::SeqCst);
		result
	}

	async fn delete(&self, key: &ResourceKey) -> Result<DeleteOutcome, ClientError> {
		let mut state = self.state();
		if state.unreachable {
			return Err(Self::unavailable("delete", key));
		}
		if state.objects.remove(key).is_none() {
			return Ok(DeleteOutcome::NotFound);
		}
		state.mutations.push(FakeMutation {
			verb: FakeVerb::Delete,
			key: key.clone(),
		});
		Ok(DeleteOutcome::Deleted)
	}

	async fn scale(&self, key: &ResourceKey, replicas: i32) -> Result<(), ClientError> {
		let mut state = self.state();
		let stalled = state.stalled.contains(&key.name);
		let Some(object) = state.objects.get_mut(key) else {
			return Err(ClientError::Rejected {
				operation: "scale",
				key: key.to_string(),
				code: 404,
				message: "not found".to_string(),
			});
		};
		object["spec"]["replicas"] = json!(replicas);
		set_status(key, object, stalled);
		state.mutations.push(FakeMutation {
			verb: FakeVerb::Scale,
			key: key.clone(),
		});
		Ok(())
	}

	fn poll_interval(&self) -> Duration {
		Duration::from_millis(10)
	}
}
