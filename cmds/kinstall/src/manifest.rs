//! Loading resource manifests into [`ResourceSpec`]s.
//!
//! Manifests are ordinary Kubernetes YAML/JSON documents with two optional
//! top-level extension fields that are stripped before anything reaches the
//! cluster:
//!
//! ```yaml
//! dependsOn:
//!   - minio                       # any loaded resource named `minio`
//!   - Secret/mlpipeline-minio     # a specific kind
//!   - Service/storage/minio       # a specific kind in another namespace
//!   - { name: cache, soft: true } # ordering only
//! readiness:
//!   timeout: 2m
//!   httpGet: { url: http://ml-pipeline:8888/apis/v1beta1/healthz }
//! ```
//!
//! A reference without a namespace matches cluster-scoped resources and
//! resources in the declaring resource's own namespace. Reaching into another
//! namespace takes the `Kind/namespace/name` form (or `namespace:` in the
//! object form).

use std::{
	cmp::Ordering,
	collections::BTreeMap,
	fmt,
	hash::{Hash, Hasher},
	path::{Path, PathBuf},
	time::Duration,
};

use ::k8s::KindInfo;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, instrument};
use walkdir::WalkDir;

use crate::probe::ProbeSpec;

/// A supported resource kind, compared by its name.
#[derive(Clone, Copy)]
pub struct Kind(&'static KindInfo);

impl Kind {
	pub fn parse(kind: &str) -> Result<Self, ::k8s::UnknownKind> {
		::k8s::lookup(kind).map(Self)
	}

	pub fn info(&self) -> &'static KindInfo {
		self.0
	}

	pub fn name(&self) -> &'static str {
		self.0.kind
	}
}

impl PartialEq for Kind {
	fn eq(&self, other: &Self) -> bool {
		self.name() == other.name()
	}
}

impl Eq for Kind {}

impl PartialOrd for Kind {
	fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
		Some(self.cmp(other))
	}
}

impl Ord for Kind {
	fn cmp(&self, other: &Self) -> Ordering {
		self.name().cmp(other.name())
	}
}

impl Hash for Kind {
	fn hash<H: Hasher>(&self, state: &mut H) {
		self.name().hash(state);
	}
}

impl fmt::Debug for Kind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.name())
	}
}

impl fmt::Display for Kind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.name())
	}
}

impl Serialize for Kind {
	fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_str(self.name())
	}
}

/// Identity of a resource: kind, name and (for namespaced kinds) namespace.
///
/// Field order gives the (kind, name, namespace) ordering used for stable
/// apply order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ResourceKey {
	pub kind: Kind,
	pub name: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub namespace: Option<String>,
}

impl ResourceKey {
	/// Comma-separated list for messages.
	pub fn join(keys: &[ResourceKey]) -> String {
		keys.iter()
			.map(ToString::to_string)
			.collect::<Vec<_>>()
			.join(", ")
	}

	pub fn new(kind: Kind, namespace: Option<&str>, name: impl Into<String>) -> Self {
		Self {
			kind,
			name: name.into(),
			namespace: namespace
				.filter(|_| kind.info().is_namespaced())
				.map(str::to_string),
		}
	}
}

impl fmt::Display for ResourceKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match &self.namespace {
			Some(ns) => write!(f, "{}/{}/{}", self.kind, ns, self.name),
			None => write!(f, "{}/{}", self.kind, self.name),
		}
	}
}

/// A `dependsOn` entry as written: `name`, `Kind/name` or `Kind/namespace/name`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyRef {
	pub kind: Option<String>,
	pub namespace: Option<String>,
	pub name: String,
}

impl DependencyRef {
	pub fn parse(raw: &str) -> Self {
		let mut parts = raw.splitn(3, '/');
		match (parts.next(), parts.next(), parts.next()) {
			(Some(kind), Some(namespace), Some(name)) => Self {
				kind: Some(kind.to_string()),
				namespace: Some(namespace.to_string()),
				name: name.to_string(),
			},
			(Some(kind), Some(name), None) => Self {
				kind: Some(kind.to_string()),
				namespace: None,
				name: name.to_string(),
			},
			_ => Self {
				kind: None,
				namespace: None,
				name: raw.to_string(),
			},
		}
	}

	/// Whether `key` is a target of this reference declared by `from`.
	pub fn matches(&self, from: &ResourceKey, key: &ResourceKey) -> bool {
		if self.name != key.name || self.kind.as_deref().is_some_and(|k| k != key.kind.name()) {
			return false;
		}
		match (&self.namespace, &key.namespace) {
			(_, None) => true,
			(Some(ns), Some(target)) => ns == target,
			(None, Some(target)) => from.namespace.as_ref() == Some(target),
		}
	}
}

impl fmt::Display for DependencyRef {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match (&self.kind, &self.namespace) {
			(Some(kind), Some(ns)) => write!(f, "{}/{}/{}", kind, ns, self.name),
			(Some(kind), None) => write!(f, "{}/{}", kind, self.name),
			(None, Some(ns)) => write!(f, "{}/{}", ns, self.name),
			(None, None) => f.write_str(&self.name),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependency {
	pub target: DependencyRef,
	/// Soft edges order the apply but never block the dependent.
	pub soft: bool,
}

/// Readiness overrides from the `readiness` extension field.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Readiness {
	pub timeout: Option<Duration>,
	pub probe: Option<ProbeSpec>,
}

/// One desired resource, immutable once loaded.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceSpec {
	pub key: ResourceKey,
	/// The manifest as sent to the cluster, extension fields removed.
	pub manifest: Value,
	pub depends_on: Vec<Dependency>,
	pub readiness: Readiness,
	/// File and document the spec was read from.
	pub origin: String,
}

impl ResourceSpec {
	pub fn kind_info(&self) -> &'static KindInfo {
		self.key.kind.info()
	}
}

#[derive(Debug, Error)]
pub enum LoadError {
	#[error("malformed manifest at {origin}: {reason}")]
	MalformedSpec { origin: String, reason: String },

	#[error("duplicate resource {key}: defined at {first} and {second}")]
	DuplicateResource {
		key: ResourceKey,
		first: String,
		second: String,
	},

	#[error("reading {path}")]
	Io {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},

	#[error("parsing YAML at {origin}")]
	Yaml {
		origin: String,
		#[source]
		source: serde_yaml::Error,
	},

	#[error("walking manifest directory")]
	Walk(#[from] walkdir::Error),

	#[error("no resource manifests found")]
	NoManifests,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawDependency {
	Ref(String),
	Object(RawDependencyObject),
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawDependencyObject {
	name: String,
	kind: Option<String>,
	namespace: Option<String>,
	#[serde(default)]
	soft: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RawReadiness {
	#[serde(default, with = "crate::duration::serde_opt")]
	timeout: Option<Duration>,
	http_get: Option<RawHttpGet>,
	tcp_socket: Option<RawTcpSocket>,
	replicas: Option<i64>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RawHttpGet {
	url: String,
	expect_status: Option<u16>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawTcpSocket {
	host: String,
	port: u16,
}

const MANIFEST_EXTENSIONS: &[&str] = &["yaml", "yml", "json"];

/// Accumulates specs from files and strings, rejecting duplicates.
///
/// Loading never talks to the cluster.
pub struct Loader {
	default_namespace: String,
	specs: BTreeMap<ResourceKey, ResourceSpec>,
}

impl Loader {
	pub fn new(default_namespace: impl Into<String>) -> Self {
		Self {
			default_namespace: default_namespace.into(),
			specs: BTreeMap::new(),
		}
	}

	/// Load every `*.yaml`, `*.yml` and `*.json` file under `path`, in file
	/// name order. Dotfiles are skipped. `path` may also be a single file.
	#[instrument(skip_all, fields(path = %path.display()))]
	pub fn load_dir(&mut self, path: &Path) -> Result<(), LoadError> {
		let walker = WalkDir::new(path)
			.sort_by_file_name()
			.into_iter()
			.filter_entry(|e| e.depth() == 0 || !e.file_name().to_string_lossy().starts_with('.'));

		for entry in walker {
			let entry = entry?;
			if !entry.file_type().is_file() {
				continue;
			}
			let is_manifest = entry
				.path()
				.extension()
				.and_then(|ext| ext.to_str())
				.is_some_and(|ext| MANIFEST_EXTENSIONS.contains(&ext));
			if !is_manifest {
				continue;
			}

			let text = std::fs::read_to_string(entry.path()).map_err(|source| LoadError::Io {
				path: entry.path().to_path_buf(),
				source,
			})?;
			self.load_str(&entry.path().display().to_string(), &text)?;
		}
		Ok(())
	}

	/// Load one multi-document YAML (or JSON) text. `name` identifies it in errors.
	pub fn load_str(&mut self, name: &str, text: &str) -> Result<(), LoadError> {
		for (index, document) in serde_yaml::Deserializer::from_str(text).enumerate() {
			let origin = format!("{name}[{index}]");
			let value = Value::deserialize(document).map_err(|source| LoadError::Yaml {
				origin: origin.clone(),
				source,
			})?;
			self.load_document(origin, value)?;
		}
		Ok(())
	}

	fn load_document(&mut self, origin: String, document: Value) -> Result<(), LoadError> {
		if document.is_null() {
			return Ok(());
		}
		if document.get("kind").and_then(Value::as_str) == Some("List") {
			let items = match document.get("items") {
				Some(Value::Array(items)) => items.clone(),
				Some(Value::Null) | None => Vec::new(),
				Some(_) => return Err(malformed(&origin, "List items must be a sequence")),
			};
			for (i, item) in items.into_iter().enumerate() {
				self.load_document(format!("{origin}.items[{i}]"), item)?;
			}
			return Ok(());
		}

		let spec = parse_spec(origin, document, &self.default_namespace)?;
		debug!(resource = %spec.key, origin = %spec.origin, "loaded manifest");

		if let Some(existing) = self.specs.get(&spec.key) {
			return Err(LoadError::DuplicateResource {
				key: spec.key,
				first: existing.origin.clone(),
				second: spec.origin,
			});
		}
		self.specs.insert(spec.key.clone(), spec);
		Ok(())
	}

	/// Finish loading. An empty manifest set is an error.
	pub fn finish(self) -> Result<Vec<ResourceSpec>, LoadError> {
		if self.specs.is_empty() {
			return Err(LoadError::NoManifests);
		}
		Ok(self.specs.into_values().collect())
	}
}

fn malformed(origin: &str, reason: impl Into<String>) -> LoadError {
	LoadError::MalformedSpec {
		origin: origin.to_string(),
		reason: reason.into(),
	}
}

fn parse_spec(
	origin: String,
	mut document: Value,
	default_namespace: &str,
) -> Result<ResourceSpec, LoadError> {
	let Some(object) = document.as_object_mut() else {
		return Err(malformed(&origin, "document is not a mapping"));
	};

	let kind_name = object
		.get("kind")
		.and_then(Value::as_str)
		.ok_or_else(|| malformed(&origin, "missing kind"))?;
	let kind = Kind::parse(kind_name).map_err(|e| malformed(&origin, e.to_string()))?;
	let info = kind.info();

	match object.get("apiVersion") {
		None | Some(Value::Null) => {
			object.insert("apiVersion".to_string(), Value::String(info.api_version()));
		}
		Some(Value::String(v)) if *v == info.api_version() => {}
		Some(other) => {
			return Err(malformed(
				&origin,
				format!(
					"apiVersion {} does not serve {} (expected {})",
					other,
					info.kind,
					info.api_version()
				),
			))
		}
	}

	let depends_on = match object.remove("dependsOn") {
		None | Some(Value::Null) => Vec::new(),
		Some(raw) => parse_dependencies(&origin, raw)?,
	};
	let readiness = match object.remove("readiness") {
		None | Some(Value::Null) => Readiness::default(),
		Some(raw) => parse_readiness(&origin, raw, info)?,
	};
	object.remove("status");

	let metadata = object
		.get_mut("metadata")
		.and_then(Value::as_object_mut)
		.ok_or_else(|| malformed(&origin, "missing metadata"))?;
	let name = metadata
		.get("name")
		.and_then(Value::as_str)
		.filter(|n| !n.is_empty())
		.ok_or_else(|| malformed(&origin, "missing metadata.name"))?
		.to_string();

	let namespace = if info.is_namespaced() {
		let ns = match metadata.get("namespace") {
			None | Some(Value::Null) => default_namespace.to_string(),
			Some(Value::String(ns)) if !ns.is_empty() => ns.clone(),
			Some(_) => return Err(malformed(&origin, "metadata.namespace must be a string")),
		};
		metadata.insert("namespace".to_string(), Value::String(ns.clone()));
		Some(ns)
	} else {
		metadata.remove("namespace");
		None
	};

	Ok(ResourceSpec {
		key: ResourceKey {
			kind,
			name,
			namespace,
		},
		manifest: document,
		depends_on,
		readiness,
		origin,
	})
}

fn parse_dependencies(origin: &str, raw: Value) -> Result<Vec<Dependency>, LoadError> {
	let raw: Vec<RawDependency> = serde_json::from_value(raw)
		.map_err(|e| malformed(origin, format!("invalid dependsOn: {e}")))?;

	raw.into_iter()
		.map(|dep| {
			let dep = match dep {
				RawDependency::Ref(s) => Dependency {
					target: DependencyRef::parse(&s),
					soft: false,
				},
				RawDependency::Object(o) => Dependency {
					target: DependencyRef {
						kind: o.kind,
						namespace: o.namespace,
						name: o.name,
					},
					soft: o.soft,
				},
			};
			if dep.target.name.is_empty() || dep.target.namespace.as_deref() == Some("") {
				return Err(malformed(origin, "dependsOn entry has an empty name"));
			}
			Ok(dep)
		})
		.collect()
}

fn parse_readiness(origin: &str, raw: Value, info: &KindInfo) -> Result<Readiness, LoadError> {
	let raw: RawReadiness = serde_json::from_value(raw)
		.map_err(|e| malformed(origin, format!("invalid readiness: {e}")))?;

	let mut probes = Vec::new();
	if let Some(http) = raw.http_get {
		probes.push(ProbeSpec::HttpGet {
			url: http.url,
			expect_status: http.expect_status,
		});
	}
	if let Some(tcp) = raw.tcp_socket {
		probes.push(ProbeSpec::TcpSocket {
			host: tcp.host,
			port: tcp.port,
		});
	}
	if let Some(expected) = raw.replicas {
		if info.readiness != ::k8s::ReadinessSignal::Replicas {
			return Err(malformed(
				origin,
				format!("readiness.replicas does not apply to {}", info.kind),
			));
		}
		probes.push(ProbeSpec::ReplicaCount {
			expected: Some(expected),
		});
	}
	if probes.len() > 1 {
		return Err(malformed(origin, "readiness declares more than one probe"));
	}

	Ok(Readiness {
		timeout: raw.timeout,
		probe: probes.pop(),
	})
}
