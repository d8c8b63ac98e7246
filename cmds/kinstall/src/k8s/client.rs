//! Kubernetes cluster connection management.

use std::time::Duration;

use k8s_openapi::apimachinery::pkg::version::Info;
use kube::{
	config::{KubeConfigOptions, Kubeconfig, KubeconfigError},
	Client, Config,
};
use thiserror::Error;
use tracing::{debug, instrument};

use crate::config::InstallerConfig;

/// Errors that can occur when connecting to a Kubernetes cluster.
#[derive(Debug, Error)]
pub enum ConnectionError {
	#[error("no context named `{0}` was found. Please check your $KUBECONFIG")]
	ContextNotFound(String),

	#[error("kubeconfig has no current-context; pass --context")]
	NoContext,

	#[error("cluster {cluster} is unreachable")]
	Unreachable {
		cluster: String,
		#[source]
		source: kube::Error,
	},

	#[error(transparent)]
	Kubeconfig(#[from] KubeconfigError),

	#[error(transparent)]
	Kube(#[from] kube::Error),
}

/// Represents a connection to a Kubernetes cluster.
///
/// This type encapsulates the kube client and server metadata,
/// providing a high-level interface for cluster operations.
#[derive(Clone)]
pub struct ClusterConnection {
	client: Client,
	server_version: Info,
	/// Human-readable identifier for the cluster (API server URL and context).
	cluster_identifier: String,
}

impl std::fmt::Debug for ClusterConnection {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ClusterConnection")
			.field("cluster_identifier", &self.cluster_identifier)
			.field("server_version", &self.server_version)
			.finish_non_exhaustive()
	}
}

impl ClusterConnection {
	/// Connect using the kubeconfig and context named in the installer config.
	///
	/// Falls back to `$KUBECONFIG` / `~/.kube/config` and its current context.
	#[instrument(skip_all)]
	pub async fn connect(config: &InstallerConfig) -> Result<Self, ConnectionError> {
		let kubeconfig = match &config.kubeconfig {
			Some(path) => Kubeconfig::read_from(path)?,
			None => Kubeconfig::read()?,
		};
		Self::from_kubeconfig(
			kubeconfig,
			config.context.as_deref(),
			config.connect_timeout,
			config.request_timeout,
		)
		.await
	}

	/// Connect with an already loaded kubeconfig.
	///
	/// Reachability is checked by fetching `/version`.
	#[instrument(skip(kubeconfig))]
	pub async fn from_kubeconfig(
		kubeconfig: Kubeconfig,
		context: Option<&str>,
		connect_timeout: Duration,
		read_timeout: Duration,
	) -> Result<Self, ConnectionError> {
		let context_name = match context {
			Some(name) => {
				if !kubeconfig.contexts.iter().any(|c| c.name == name) {
					return Err(ConnectionError::ContextNotFound(name.to_string()));
				}
				name.to_string()
			}
			None => kubeconfig
				.current_context
				.clone()
				.ok_or(ConnectionError::NoContext)?,
		};

		let mut config = Config::from_custom_kubeconfig(
			kubeconfig,
			&KubeConfigOptions {
				context: Some(context_name.clone()),
				..Default::default()
			},
		)
		.await?;
		config.connect_timeout = Some(connect_timeout);
		config.read_timeout = Some(read_timeout);

		let cluster_identifier = format!("{}  (context:{})", config.cluster_url, context_name);
		let client = Client::try_from(config)?;

		let server_version =
			client
				.apiserver_version()
				.await
				.map_err(|source| ConnectionError::Unreachable {
					cluster: cluster_identifier.clone(),
					source,
				})?;

		debug!(
			cluster = %cluster_identifier,
			version = %server_version.git_version,
			"connected"
		);

		Ok(Self {
			client,
			server_version,
			cluster_identifier,
		})
	}

	/// Get a reference to the underlying kube client.
	pub fn client(&self) -> &Client {
		&self.client
	}

	/// Get the server version.
	pub fn server_version(&self) -> &Info {
		&self.server_version
	}

	/// Get the cluster identifier (API server URL and context name).
	pub fn cluster_identifier(&self) -> &str {
		&self.cluster_identifier
	}
}

#[cfg(test)]
mod tests {
	use assert_matches::assert_matches;
	use k8s_mock::HttpMockK8sServer;
	use kube::config::{Cluster, Context, NamedCluster, NamedContext};

	use super::*;

	const TIMEOUT: Duration = Duration::from_secs(2);

	#[tokio::test]
	async fn test_connect_without_current_context_errors() {
		let result =
			ClusterConnection::from_kubeconfig(Kubeconfig::default(), None, TIMEOUT, TIMEOUT).await;
		assert_matches!(result, Err(ConnectionError::NoContext));
	}

	#[tokio::test]
	async fn test_connect_context_not_found() {
		let kubeconfig = Kubeconfig {
			contexts: vec![NamedContext {
				name: "other-context".to_string(),
				context: None,
			}],
			..Default::default()
		};

		let result = ClusterConnection::from_kubeconfig(
			kubeconfig,
			Some("kind-kubeflow"),
			TIMEOUT,
			TIMEOUT,
		)
		.await;
		assert_matches!(result, Err(ConnectionError::ContextNotFound(name)) if name == "kind-kubeflow");
	}

	#[tokio::test]
	async fn test_connect_unreachable_cluster() {
		// Nothing listens on port 1.
		let kubeconfig = Kubeconfig {
			clusters: vec![NamedCluster {
				name: "dead".to_string(),
				cluster: Some(Cluster {
					server: Some("http://127.0.0.1:1".to_string()),
					..Default::default()
				}),
			}],
			contexts: vec![NamedContext {
				name: "dead".to_string(),
				context: Some(Context {
					cluster: "dead".to_string(),
					..Default::default()
				}),
			}],
			current_context: Some("dead".to_string()),
			..Default::default()
		};

		let result = ClusterConnection::from_kubeconfig(
			kubeconfig,
			None,
			Duration::from_millis(200),
			Duration::from_millis(200),
		)
		.await;
		assert_matches!(result, Err(ConnectionError::Unreachable { .. }));
	}

	#[tokio::test]
	async fn test_connect_to_mock_server() {
		let server = HttpMockK8sServer::builder().build().start().await;

		let conn = ClusterConnection::from_kubeconfig(
			server.kubeconfig_with_context("kind-kubeflow"),
			Some("kind-kubeflow"),
			TIMEOUT,
			TIMEOUT,
		)
		.await
		.unwrap();

		assert_eq!(conn.server_version().minor, "31");
		assert!(conn.cluster_identifier().ends_with("(context:kind-kubeflow)"));
	}
}
