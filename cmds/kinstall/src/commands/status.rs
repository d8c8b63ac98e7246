//! Status command handler.
//!
//! Probes every resource of the manifest set once. Never mutates the cluster.

use std::{io::Write, path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::Args;
use tabwriter::TabWriter;

use super::util::{create_tokio_runtime, GlobalArgs, OutputFormat};
use crate::{
	config::InstallerConfig,
	installer::{load_graph, Installer, StatusRow},
	k8s::{ClusterConnection, KubeCluster},
};

#[derive(Args, Debug, Default)]
pub struct StatusArgs {
	/// Directory of manifests to check
	#[arg(long, env = "KINSTALL_MANIFESTS")]
	pub manifests: Option<PathBuf>,

	/// Output format
	#[arg(short = 'o', long, value_enum, default_value = "table")]
	pub output: OutputFormat,
}

/// Run the status command.
pub fn run<W: Write>(args: StatusArgs, global: &GlobalArgs, writer: W) -> Result<u8> {
	let mut config = global.resolve_config()?;
	if let Some(manifests) = args.manifests {
		config.manifests = manifests;
	}

	create_tokio_runtime()?.block_on(status(config, None, args.output, writer))
}

/// Exits 0 when every resource is present and healthy, 1 otherwise.
pub async fn status<W: Write>(
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
	let rows = Installer::new(cluster, config)?.status(&graph).await;

	write_rows(&rows, output, writer).context("writing status")?;
	Ok(if rows.iter().all(|row| row.healthy) { 0 } else { 1 })
}

fn write_rows<W: Write>(rows: &[StatusRow], output: OutputFormat, mut writer: W) -> std::io::Result<()> {
	if output == OutputFormat::Json {
		serde_json::to_writer_pretty(&mut writer, rows)?;
		writeln!(writer)?;
		return writer.flush();
	}

	let mut tw = TabWriter::new(writer).padding(2);
	writeln!(tw, "TIER\tKIND\tNAMESPACE\tNAME\tPRESENT\tHEALTHY\tDETAIL")?;
	for row in rows {
		writeln!(
			tw,
			"{}\t{}\t{}\t{}\t{}\t{}\t{}",
			row.tier,
			row.key.kind,
			row.key.namespace.as_deref().unwrap_or("-"),
			row.key.name,
			yes_no(row.present),
			yes_no(row.healthy),
			row.detail.as_deref().unwrap_or(""),
		)?;
	}
	tw.flush()
}

fn yes_no(value: bool) -> &'static str {
	if value {
		"yes"
	} else {
		"no"
	}
}
