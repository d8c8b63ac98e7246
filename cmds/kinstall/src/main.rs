use std::process::ExitCode;

use clap::{Parser, Subcommand};
use kinstall::commands::{self, util::BrokenPipeGuard, util::GlobalArgs};

#[cfg(all(
	target_os = "linux",
	feature = "mimalloc",
	not(feature = "system-alloc")
))]
#[global_allocator]
static GLOBAL: mimallocator::Mimalloc = mimallocator::Mimalloc;

#[derive(Parser)]
#[command(name = "kinstall")]
#[command(about = "Declarative, idempotent installer for multi-component Kubernetes applications", long_about = None)]
#[command(version = env!("KINSTALL_VERSION"))]
struct Cli {
	#[command(flatten)]
	global: GlobalArgs,

	#[command(subcommand)]
	command: Commands,
}

#[derive(Subcommand)]
enum Commands {
	/// Apply the manifests in dependency order and wait for readiness
	Install(commands::install::InstallArgs),

	/// Delete the manifests from the cluster, dependents first
	Uninstall(commands::uninstall::UninstallArgs),

	/// Probe every resource once and report its health
	Status(commands::status::StatusArgs),
}

fn main() -> ExitCode {
	let cli = Cli::parse();

	let _telemetry = match kinstall::telemetry::init(cli.global.log_level) {
		Ok(guard) => guard,
		Err(e) => {
			eprintln!("Error: initializing telemetry: {e:#}");
			return ExitCode::from(2);
		}
	};

	let stdout = BrokenPipeGuard::new(std::io::stdout());

	let result = match cli.command {
		Commands::Install(args) => commands::install::run(args, &cli.global, stdout),
		Commands::Uninstall(args) => commands::uninstall::run(args, &cli.global, stdout),
		Commands::Status(args) => commands::status::run(args, &cli.global, stdout),
	};

	match result {
		Ok(code) => ExitCode::from(code),
		Err(e) => {
			tracing::error!(error = format!("{e:#}"), "kinstall failed");
			eprintln!("Error: {e:#}");
			ExitCode::from(2)
		}
	}
}
