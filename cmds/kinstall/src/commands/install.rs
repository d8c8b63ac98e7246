//! Install command handler.
//!
//! Loads and orders the manifests, reconciles them tier by tier and reports a
//! verdict. The exit code follows the verdict: 0 all ready, 1 partial, 2 fatal.

use std::{fs::File, io::Write, path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use clap::Args;
use tabwriter::TabWriter;
use tracing::{debug, instrument};

use super::util::{cancel_on_interrupt, create_tokio_runtime, GlobalArgs, OutputFormat};
use crate::{
	config::InstallerConfig,
	duration::parse_duration,
	graph::DependencyGraph,
	installer::{load_graph, Installer},
	k8s::{ClusterClient, ClusterConnection, KubeCluster},
	reconcile::PlannedChange,
	rollback::RollbackPolicy,
};

#[derive(Args, Debug, Default)]
pub struct InstallArgs {
	/// Directory of manifests to install
	#[arg(long, env = "KINSTALL_MANIFESTS")]
	pub manifests: Option<PathBuf>,

	/// Readiness timeout for resources that do not set their own (e.g. 90s, 5m)
	#[arg(long, env = "KINSTALL_TIMEOUT", value_parser = parse_duration)]
	pub timeout: Option<Duration>,

	/// What to remove when the install does not fully succeed
	#[arg(long, env = "KINSTALL_ROLLBACK", value_enum)]
	pub rollback: Option<RollbackPolicy>,

	/// Maximum resources reconciled at once. Defaults to the CPU count
	#[arg(long, env = "KINSTALL_WORKERS")]
	pub workers: Option<usize>,

	/// Show what would change without touching the cluster
	#[arg(long)]
	pub dry_run: bool,

	/// Output format
	#[arg(short = 'o', long, value_enum, default_value = "table")]
	pub output: OutputFormat,

	/// Also write the JSON report to this file
	#[arg(long)]
	pub report: Option<PathBuf>,

	/// Cancel the whole run after this long (e.g. 15m)
	#[arg(long, value_parser = parse_duration)]
	pub deadline: Option<Duration>,

	/// Take ownership of fields managed by other field managers
	#[arg(long)]
	pub force_conflicts: bool,
}

impl InstallArgs {
	fn apply_to(&self, config: &mut InstallerConfig) {
		if let Some(manifests) = &self.manifests {
			config.manifests = manifests.clone();
		}
		if let Some(timeout) = self.timeout {
			config.timeout = timeout;
		}
		if let Some(rollback) = self.rollback {
			config.rollback = rollback;
		}
		if self.workers.is_some() {
			config.workers = self.workers;
		}
		if self.force_conflicts {
			config.force_conflicts = true;
		}
	}

	fn opts(&self) -> InstallOpts {
		InstallOpts {
			dry_run: self.dry_run,
			output: self.output,
			report: self.report.clone(),
			deadline: self.deadline,
		}
	}
}

/// Options that shape a run but are not part of [`InstallerConfig`].
#[derive(Debug, Clone, Default)]
pub struct InstallOpts {
	pub dry_run: bool,
	pub output: OutputFormat,
	pub report: Option<PathBuf>,
	pub deadline: Option<Duration>,
}

/// Run the install command.
pub fn run<W: Write>(args: InstallArgs, global: &GlobalArgs, writer: W) -> Result<u8> {
	let mut config = global.resolve_config()?;
	args.apply_to(&mut config);

	create_tokio_runtime()?.block_on(install(config, None, args.opts(), writer))
}

/// Install the manifests named by `config`.
///
/// Uses `connection` when given, otherwise connects per `config`. Returns the
/// process exit code.
#[instrument(skip_all, fields(manifests = %config.manifests.display()))]
pub async fn install<W: Write>(
	config: InstallerConfig,
	connection: Option<ClusterConnection>,
	opts: InstallOpts,
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
	debug!(
		cluster = %connection.cluster_identifier(),
		server_version = %format!("{}.{}", connection.server_version().major, connection.server_version().minor),
		"connected to cluster"
	);

	let cluster = Arc::new(KubeCluster::new(connection.client().clone(), &config));
	let installer = Installer::new(cluster, config)?;
	execute(&installer, &graph, &opts, writer).await
}

async fn execute<C, W>(
	installer: &Installer<C>,
	graph: &DependencyGraph,
	opts: &InstallOpts,
	mut writer: W,
) -> Result<u8>
where
	C: ClusterClient + ?Sized + 'static,
	W: Write,
{
	if opts.dry_run {
		let changes = installer.preview(graph).await;
		write_preview(&changes, opts.output, &mut writer).context("writing dry-run output")?;
		return Ok(0);
	}

	let cancel = cancel_on_interrupt(opts.deadline);
	let outcome = installer.install(graph, &cancel).await;

	if let Some(path) = &opts.report {
		let file = File::create(path)
			.with_context(|| format!("creating report file {}", path.display()))?;
		outcome
			.report
			.write_json(file, outcome.rollback.as_ref())
			.with_context(|| format!("writing report file {}", path.display()))?;
	}

	let written = match opts.output {
		OutputFormat::Json => outcome
			.report
			.write_json(&mut writer, outcome.rollback.as_ref()),
		OutputFormat::Table => outcome
			.report
			.write_table(&mut writer, outcome.rollback.as_ref()),
	};
	written.context("writing report")?;

	Ok(outcome.verdict().exit_code())
}

fn write_preview<W: Write>(
	changes: &[PlannedChange],
	output: OutputFormat,
	mut writer: W,
) -> std::io::Result<()> {
	if output == OutputFormat::Json {
		serde_json::to_writer_pretty(&mut writer, changes)?;
		writeln!(writer)?;
		return writer.flush();
	}

	let mut tw = TabWriter::new(writer).padding(2);
	writeln!(tw, "TIER\tKIND\tNAMESPACE\tNAME\tCHANGE")?;
	for change in changes {
		writeln!(
			tw,
			"{}\t{}\t{}\t{}\t{}",
			change.tier,
			change.key.kind,
			change.key.namespace.as_deref().unwrap_or("-"),
			change.key.name,
			change.change.as_str(),
		)?;
	}
	tw.flush()
}
