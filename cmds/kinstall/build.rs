use std::process::Command;

/// Exposes `KINSTALL_VERSION`: the package version for releases, otherwise
/// `git describe` output (`v0.3.1`, `v0.3.1-4-gabc1234` or a bare hash).
fn main() {
	println!("cargo:rerun-if-changed=.git/HEAD");
	println!("cargo:rerun-if-changed=.git/refs/");

	let package = env!("CARGO_PKG_VERSION");
	let version = if package != "0.1.0" {
		package.to_string()
	} else {
		git_describe()
			.map(|v| v.strip_prefix('v').map(str::to_string).unwrap_or(v))
			.unwrap_or_else(|| package.to_string())
	};
	println!("cargo:rustc-env=KINSTALL_VERSION={version}");
}

fn git_describe() -> Option<String> {
	let output = Command::new("git")
		.args(["describe", "--tags", "--always"])
		.output()
		.ok()
		.filter(|out| out.status.success())?;
	let described = String::from_utf8(output.stdout).ok()?;
	Some(described.trim().to_string()).filter(|s| !s.is_empty())
}
