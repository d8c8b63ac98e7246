//! Configuration file support for kinstall
//!
//! Supports `.kinstall.yaml` files placed anywhere in the directory hierarchy.
//! kinstall searches from the working directory upward to the filesystem root.
//! Flags and `KINSTALL_*` variables override what the file sets.

use std::{
	fs,
	path::{Path, PathBuf},
	time::Duration,
};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::{probe::ProbeSettings, retry::BackoffPolicy, rollback::RollbackPolicy};

/// The name of the config file kinstall looks for
pub const CONFIG_FILE_NAME: &str = ".kinstall.yaml";

/// Everything an install, uninstall or status run needs to know.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InstallerConfig {
	/// Kubeconfig path. `$KUBECONFIG` or `~/.kube/config` when unset.
	pub kubeconfig: Option<PathBuf>,
	/// Kubeconfig context. The current context when unset.
	pub context: Option<String>,
	/// Namespace for manifests that do not set one.
	pub namespace: String,
	/// Manifest directory, relative to the working directory.
	pub manifests: PathBuf,
	pub field_manager: String,
	pub force_conflicts: bool,

	/// Readiness timeout for resources without their own.
	#[serde(with = "crate::duration::serde_str")]
	pub timeout: Duration,
	#[serde(with = "crate::duration::serde_str")]
	pub poll_interval: Duration,
	#[serde(with = "crate::duration::serde_str")]
	pub max_poll_interval: Duration,
	/// Bound on one HTTP or TCP probe attempt.
	#[serde(with = "crate::duration::serde_str")]
	pub probe_attempt_timeout: Duration,
	#[serde(with = "crate::duration::serde_str")]
	pub request_timeout: Duration,
	#[serde(with = "crate::duration::serde_str")]
	pub connect_timeout: Duration,

	/// Worker pool size. The CPU count when unset.
	pub workers: Option<usize>,
	pub rollback: RollbackPolicy,
	pub retry: BackoffPolicy,
}

impl Default for InstallerConfig {
	fn default() -> Self {
		Self {
			kubeconfig: None,
			context: None,
			namespace: "default".to_string(),
			manifests: PathBuf::from("manifests"),
			field_manager: "kinstall".to_string(),
			force_conflicts: false,
			timeout: Duration::from_secs(300),
			poll_interval: Duration::from_secs(2),
			max_poll_interval: Duration::from_secs(10),
			probe_attempt_timeout: Duration::from_secs(2),
			request_timeout: Duration::from_secs(30),
			connect_timeout: Duration::from_secs(10),
			workers: None,
			rollback: RollbackPolicy::None,
			retry: BackoffPolicy::default(),
		}
	}
}

impl InstallerConfig {
	/// Load config by searching from the given directory upward
	pub fn load_from_directory(start_dir: &Path) -> Result<Option<Self>> {
		match find_config_file(start_dir) {
			Some(path) => Self::load_from_file(&path).map(Some),
			None => Ok(None),
		}
	}

	/// Load config from a specific file path
	pub fn load_from_file(path: &Path) -> Result<Self> {
		let content = fs::read_to_string(path)
			.with_context(|| format!("failed to read config file: {}", path.display()))?;
		if content.trim().is_empty() {
			return Ok(Self::default());
		}
		let config: InstallerConfig = serde_yaml::from_str(&content)
			.with_context(|| format!("failed to parse config file: {}", path.display()))?;
		Ok(config)
	}

	pub fn workers(&self) -> usize {
		self.workers
			.unwrap_or_else(|| std::thread::available_parallelism().map_or(4, usize::from))
			.max(1)
	}

	pub fn probe_settings(&self) -> ProbeSettings {
		ProbeSettings::builder()
			.poll_interval(self.poll_interval)
			.max_poll_interval(self.max_poll_interval.max(self.poll_interval))
			.attempt_timeout(self.probe_attempt_timeout)
			.build()
	}
}

/// Search for a config file starting from `start_dir` and walking up to the filesystem root
pub fn find_config_file(start_dir: &Path) -> Option<PathBuf> {
	let start = start_dir
		.canonicalize()
		.unwrap_or_else(|_| start_dir.to_path_buf());

	start
		.ancestors()
		.map(|dir| dir.join(CONFIG_FILE_NAME))
		.find(|path| path.is_file())
}
