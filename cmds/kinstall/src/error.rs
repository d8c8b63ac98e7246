//! Errors that abort an operation before or instead of a reconcile run.

use thiserror::Error;

use crate::{graph::GraphError, k8s::ConnectionError, manifest::LoadError};

#[derive(Debug, Error)]
pub enum InstallError {
	#[error("loading manifests")]
	Load(#[from] LoadError),

	#[error("building dependency graph")]
	Graph(#[from] GraphError),

	#[error("connecting to cluster")]
	Connection(#[from] ConnectionError),

	#[error("creating probe HTTP client")]
	ProbeClient(#[from] reqwest::Error),
}

impl InstallError {
	/// All of these are fatal: nothing was mutated, or nothing could be.
	pub fn exit_code(&self) -> u8 {
		2
	}
}

#[cfg(test)]
mod tests {
	use std::error::Error as _;

	use super::*;
	use crate::test_utils::graph_from_yaml;

	#[test]
	fn test_graph_error_keeps_source() {
		let err: InstallError = graph_from_yaml("kind: ConfigMap\nmetadata: { name: a }\ndependsOn: [a]")
			.unwrap_err()
			.into();
		assert_eq!(err.exit_code(), 2);
		assert_eq!(err.to_string(), "building dependency graph");
		assert!(err
			.source()
			.unwrap()
			.to_string()
			.starts_with("cyclic dependency"));
	}
}
