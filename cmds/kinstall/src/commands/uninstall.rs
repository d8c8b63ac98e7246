//! Uninstall command handler.

use std::{io::Write, path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use clap::Args;
use tabwriter::TabWriter;

use super::util::{create_tokio_runtime, GlobalArgs, OutputFormat};
use crate::{
	config::InstallerConfig,
	duration::parse_duration,
	installer::{load_graph, Installer},
	k8s::{ClusterConnection, KubeCluster},
	rollback::{RollbackPolicy, RollbackSummary},
};

#[derive(Args, Debug, Default)]
pub struct UninstallArgs {
	/// Directory of manifests to remove
	#[arg(long, env = "KINSTALL_MANIFESTS")]
	pub manifests: Option<PathBuf>,

	/// Removal policy. Only `full` is meaningful here
	#[arg(long, value_enum, default_value = "full")]
	pub rollback: RollbackPolicy,

	/// How long to wait for each tier to disappear
	#[arg(long, env = "KINSTALL_TIMEOUT", value_parser = parse_duration)]
	pub timeout: Option<Duration>,

	/// Output format
	#[arg(short = 'o', long, value_enum, default_value = "table")]
	pub output: OutputFormat,
}

/// Run the uninstall command.
pub fn run<W: Write>(args: UninstallArgs, global: &GlobalArgs, writer: W) -> Result<u8> {
	if args.rollback != RollbackPolicy::FullReverse {
		anyhow::bail!(
			"uninstall removes every resource; --rollback {} is not supported",
			args.rollback
		);
	}

	let mut config = global.resolve_config()?;
	if let Some(manifests) = args.manifests {
		config.manifests = manifests;
	}
	if let Some(timeout) = args.timeout {
		config.timeout = timeout;
	}

	create_tokio_runtime()?.block_on(uninstall(config, None, args.output, writer))
}

/// Tear down everything the manifests describe, dependents first.
///
/// Exits 0 when every delete succeeded or found nothing, 1 otherwise.
pub async fn uninstall<W: Write>(
	config: InstallerConfig,
	connection: Option<ClusterConnection>,
	output: OutputFormat,
	writer: W,
) -> Result<u8> {
	let graph = load_graph(&config, &config.manifests)
		.with_context(|| format!("preparing manifests in {}", config.manifests.display()))?;

	let connection = match connection {
		Some(conn) => conn,
		None => ClusterConnection::connect(&config)
			.await
			.context("connecting to Kubernetes cluster")?,
	};
	let cluster = Arc::new(KubeCluster::new(connection.client().clone(), &config));
	let summary = Installer::new(cluster, config)?.uninstall(&graph).await;

	write_summary(&summary, output, writer).context("writing uninstall summary")?;
	Ok(if summary.is_clean() { 0 } else { 1 })
}

fn write_summary<W: Write>(
	summary: &RollbackSummary,
	output: OutputFormat,
	mut writer: W,
) -> std::io::Result<()> {
	if output == OutputFormat::Json {
		serde_json::to_writer_pretty(&mut writer, summary)?;
		writeln!(writer)?;
		return writer.flush();
	}

	let mut tw = TabWriter::new(writer).padding(2);
	writeln!(tw, "RESOURCE\tRESULT")?;
	for resource in &summary.deleted {
		writeln!(tw, "{resource}\tdeleted")?;
	}
	for resource in &summary.missing {
		writeln!(tw, "{resource}\tnot found")?;
	}
	for failure in &summary.errors {
		writeln!(tw, "{}\tfailed: {}", failure.resource, failure.error)?;
	}
	tw.flush()?;
	writeln!(tw, "{summary}")?;
	tw.flush()
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::rollback::RollbackError;

	#[test]
	fn test_rejects_partial_policies() {
		let args = UninstallArgs {
			rollback: RollbackPolicy::FailedOnly,
			..Default::default()
		};
		let err = run(args, &GlobalArgs::default(), Vec::new()).unwrap_err();
		assert!(err.to_string().contains("--rollback failed-only"));
	}

	#[test]
	fn test_summary_table() {
		let summary = RollbackSummary {
			policy: RollbackPolicy::FullReverse,
			deleted: vec!["Deployment/default/ui".to_string()],
			missing: vec!["ConfigMap/default/cfg".to_string()],
			errors: vec![RollbackError {
				resource: "Secret/default/creds".to_string(),
				error: "forbidden".to_string(),
			}],
		};

		let mut out = Vec::new();
		write_summary(&summary, OutputFormat::Table, &mut out).unwrap();
		let text = String::from_utf8(out).unwrap();
		let lines: Vec<_> = text.lines().collect();

		assert_eq!(lines.len(), 5);
		assert!(lines[1].starts_with("Deployment/default/ui") && lines[1].ends_with("deleted"));
		assert!(lines[3].ends_with("failed: forbidden"));
		assert_eq!(
			lines[4],
			"rollback (full): 1 deleted, 1 already absent, 1 failed"
		);
	}
}
