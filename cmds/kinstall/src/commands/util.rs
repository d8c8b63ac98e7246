//! Utilities for command handlers.

use std::{
	env,
	io::{self, ErrorKind, Write},
	path::PathBuf,
	time::Duration,
};

use anyhow::{Context, Result};
use clap::{Args, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn, Level};

use crate::config::InstallerConfig;

/// A writer wrapper that silently handles broken pipe errors.
///
/// When the underlying writer returns a broken pipe error (EPIPE), this wrapper
/// converts it to a successful write. This allows commands to exit cleanly when
/// output is piped to a process that closes early (e.g., `kinstall status | head -1`).
pub struct BrokenPipeGuard<W> {
	inner: W,
}

impl<W> BrokenPipeGuard<W> {
	pub fn new(inner: W) -> Self {
		Self { inner }
	}
}

impl<W: Write> Write for BrokenPipeGuard<W> {
	fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
		match self.inner.write(buf) {
			Err(e) if e.kind() == ErrorKind::BrokenPipe => Ok(buf.len()),
			other => other,
		}
	}

	fn flush(&mut self) -> io::Result<()> {
		match self.inner.flush() {
			Err(e) if e.kind() == ErrorKind::BrokenPipe => Ok(()),
			other => other,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
	/// Aligned status table with a verdict line
	#[default]
	Table,
	/// JSON document on stdout
	Json,
}

/// Flags shared by every subcommand.
#[derive(Args, Debug, Clone, Default)]
pub struct GlobalArgs {
	/// Config file. Defaults to the nearest .kinstall.yaml upward from the working directory
	#[arg(long, global = true, env = "KINSTALL_CONFIG")]
	pub config: Option<PathBuf>,

	/// Kubeconfig file
	#[arg(long, global = true, env = "KINSTALL_KUBECONFIG")]
	pub kubeconfig: Option<PathBuf>,

	/// Kubeconfig context to use
	#[arg(long, global = true, env = "KINSTALL_CONTEXT")]
	pub context: Option<String>,

	/// Namespace for manifests that do not set one
	#[arg(short = 'n', long, global = true, env = "KINSTALL_NAMESPACE")]
	pub namespace: Option<String>,

	/// Log level (trace, debug, info, warn, error). Overrides RUST_LOG
	#[arg(long, global = true, env = "KINSTALL_LOG_LEVEL")]
	pub log_level: Option<Level>,
}

impl GlobalArgs {
	/// Config file (explicit or discovered) with the global flags applied.
	pub fn resolve_config(&self) -> Result<InstallerConfig> {
		let mut config = match &self.config {
			Some(path) => InstallerConfig::load_from_file(path)?,
			None => {
				let cwd = env::current_dir().context("reading working directory")?;
				InstallerConfig::load_from_directory(&cwd)?.unwrap_or_default()
			}
		};

		if let Some(kubeconfig) = &self.kubeconfig {
			config.kubeconfig = Some(kubeconfig.clone());
		}
		if let Some(context) = &self.context {
			config.context = Some(context.clone());
		}
		if let Some(namespace) = &self.namespace {
			config.namespace = namespace.clone();
		}
		debug!(?config, "resolved configuration");
		Ok(config)
	}
}

/// Create a tokio runtime for async operations
pub fn create_tokio_runtime() -> Result<tokio::runtime::Runtime> {
	tokio::runtime::Builder::new_multi_thread()
		.enable_all()
		.build()
		.context("creating tokio runtime")
}

/// A token cancelled by Ctrl-C or once `deadline` has passed.
///
/// Must be called inside a tokio runtime.
pub fn cancel_on_interrupt(deadline: Option<Duration>) -> CancellationToken {
	let token = CancellationToken::new();
	let trigger = token.clone();

	tokio::spawn(async move {
		let interrupted = async {
			if let Err(e) = tokio::signal::ctrl_c().await {
				warn!(error = %e, "cannot listen for Ctrl-C");
				std::future::pending::<()>().await;
			}
		};
		let expired = async {
			match deadline {
				Some(deadline) => tokio::time::sleep(deadline).await,
				None => std::future::pending().await,
			}
		};

		tokio::select! {
			() = interrupted => warn!("interrupted, letting in-flight applies finish"),
			() = expired => warn!("deadline reached, letting in-flight applies finish"),
		}
		trigger.cancel();
	});

	token
}

#[cfg(test)]
mod tests {
	use std::fs;

	use tempfile::TempDir;

	use super::*;
	use crate::{config::CONFIG_FILE_NAME, test_utils::BrokenPipeWriter};

	#[test]
	fn test_guard_swallows_broken_pipe() {
		let mut writer = BrokenPipeGuard::new(BrokenPipeWriter);
		assert!(writeln!(writer, "hello").is_ok());
		assert!(writer.flush().is_ok());
	}

	#[test]
	fn test_flags_override_config_file() {
		let temp = TempDir::new().unwrap();
		let path = temp.path().join(CONFIG_FILE_NAME);
		fs::write(&path, "namespace: from-file\ncontext: file-context\nworkers: 7").unwrap();

		let args = GlobalArgs {
			config: Some(path),
			namespace: Some("from-flag".to_string()),
			..Default::default()
		};
		let config = args.resolve_config().unwrap();

		assert_eq!(config.namespace, "from-flag");
		assert_eq!(config.context.as_deref(), Some("file-context"));
		assert_eq!(config.workers, Some(7));
	}

	#[test]
	fn test_missing_config_file_is_an_error() {
		let args = GlobalArgs {
			config: Some(PathBuf::from("/nonexistent/.kinstall.yaml")),
			..Default::default()
		};
		assert!(args.resolve_config().is_err());
	}

	#[tokio::test(start_paused = true)]
	async fn test_deadline_cancels() {
		let token = cancel_on_interrupt(Some(Duration::from_secs(5)));
		tokio::time::timeout(Duration::from_secs(6), token.cancelled())
			.await
			.unwrap();
	}
}
