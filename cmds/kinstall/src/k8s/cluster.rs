//! [`ClusterClient`] backed by a live API server.
//!
//! Applies go through server-side apply under a named field manager, so
//! re-running the installer converges instead of delete-and-recreate.

use std::time::Duration;

use ::k8s::KindInfo;
use async_trait::async_trait;
use kube::{
	api::{Api, ApiResource, DeleteParams, DynamicObject, GroupVersionKind, Patch, PatchParams},
	Client,
};
use serde_json::json;
use tracing::{debug, instrument};

use super::{ClientError, ClusterClient, DeleteOutcome, ObservedResource};
use crate::{
	config::InstallerConfig,
	manifest::{ResourceKey, ResourceSpec},
	retry::{retry_with_backoff, BackoffPolicy},
};

pub struct KubeCluster {
	client: Client,
	field_manager: String,
	force_conflicts: bool,
	retry: BackoffPolicy,
	poll_interval: Duration,
}

impl KubeCluster {
	pub fn new(client: Client, config: &InstallerConfig) -> Self {
		Self {
			client,
			field_manager: config.field_manager.clone(),
			force_conflicts: config.force_conflicts,
			retry: config.retry.clone(),
			poll_interval: config.poll_interval,
		}
	}

	fn api(&self, key: &ResourceKey) -> Api<DynamicObject> {
		let ar = api_resource(key.kind.info());
		match &key.namespace {
			Some(ns) => Api::namespaced_with(self.client.clone(), ns, &ar),
			None => Api::all_with(self.client.clone(), &ar),
		}
	}

	fn patch_params(&self) -> PatchParams {
		let params = PatchParams::apply(&self.field_manager);
		if self.force_conflicts {
			params.force()
		} else {
			params
		}
	}
}

fn api_resource(info: &KindInfo) -> ApiResource {
	let gvk = GroupVersionKind::gvk(info.group, info.version, info.kind);
	ApiResource::from_gvk_with_plural(&gvk, info.plural)
}

/// Split kube errors into retryable and final ones.
///
/// API responses with 429 or 5xx are transient, as is anything that never
/// produced a response (connect failures, timeouts). Other API statuses are
/// rejections.
fn classify(operation: &'static str, key: &ResourceKey, err: kube::Error) -> ClientError {
	match err {
		kube::Error::Api(status) if status.code != 429 && status.code < 500 => {
			ClientError::Rejected {
				operation,
				key: key.to_string(),
				code: status.code,
				message: status.message.clone(),
			}
		}
		other => ClientError::Transient {
			operation,
			key: key.to_string(),
			message: other.to_string(),
		},
	}
}

fn to_value(key: &ResourceKey, object: DynamicObject) -> Result<ObservedResource, ClientError> {
	serde_json::to_value(object).map_err(|source| ClientError::Serialization {
		key: key.to_string(),
		source,
	})
}

#[async_trait]
impl ClusterClient for KubeCluster {
	#[instrument(skip_all, fields(resource = %key))]
	async fn get(&self, key: &ResourceKey) -> Result<Option<ObservedResource>, ClientError> {
		let api = &self.api(key);
		let object = retry_with_backoff(&self.retry, "get", move || async move {
			api.get_opt(&key.name)
				.await
				.map_err(|e| classify("get", key, e))
		})
		.await?;
		object.map(|o| to_value(key, o)).transpose()
	}

	#[instrument(skip_all, fields(resource = %spec.key))]
	async fn apply(&self, spec: &ResourceSpec) -> Result<ObservedResource, ClientError> {
		let key = &spec.key;
		let api = &self.api(key);
		let params = &self.patch_params();
		let patch = &Patch::Apply(&spec.manifest);

		let object = retry_with_backoff(&self.retry, "apply", move || async move {
			api.patch(&key.name, params, patch)
				.await
				.map_err(|e| classify("apply", key, e))
		})
		.await?;
		debug!(field_manager = %self.field_manager, "applied");
		to_value(key, object)
	}

	#[instrument(skip_all, fields(resource = %key))]
	async fn delete(&self, key: &ResourceKey) -> Result<DeleteOutcome, ClientError> {
		let api = &self.api(key);
		let params = &DeleteParams::background();

		retry_with_backoff(&self.retry, "delete", move || async move {
			match api.delete(&key.name, params).await {
				Ok(_) => Ok(DeleteOutcome::Deleted),
				Err(kube::Error::Api(status)) if status.code == 404 => Ok(DeleteOutcome::NotFound),
				Err(e) => Err(classify("delete", key, e)),
			}
		})
		.await
	}

	#[instrument(skip_all, fields(resource = %key, replicas = replicas))]
	async fn scale(&self, key: &ResourceKey, replicas: i32) -> Result<(), ClientError> {
		let api = &self.api(key);
		let params = &PatchParams::default();
		let patch = &Patch::Merge(json!({ "spec": { "replicas": replicas } }));

		retry_with_backoff(&self.retry, "scale", move || async move {
			api.patch_scale(&key.name, params, patch)
				.await
				.map(|_| ())
				.map_err(|e| classify("scale", key, e))
		})
		.await
	}

	fn poll_interval(&self) -> Duration {
		self.poll_interval
	}
}
