//! Run reports: verdict, per-resource records, table and JSON output.

use std::{io::Write, time::Duration};

use serde::Serialize;
use tabwriter::TabWriter;

use crate::{
	duration::format_duration,
	reconcile::{ApplyAction, ResourceResult, ResourceState},
	rollback::RollbackSummary,
};

/// Overall outcome of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum RunVerdict {
	Success,
	PartialFailure,
	FatalFailure,
}

impl RunVerdict {
	pub fn exit_code(self) -> u8 {
		match self {
			Self::Success => 0,
			Self::PartialFailure => 1,
			Self::FatalFailure => 2,
		}
	}
}

/// Per-resource results of one reconcile run, in plan order.
#[derive(Debug, Clone, Default)]
pub struct RunReport {
	pub results: Vec<ResourceResult>,
	pub cancelled: bool,
	pub elapsed: Duration,
}

/// JSON shape of one resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRecord {
	pub name: String,
	pub kind: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub namespace: Option<String>,
	pub final_state: ResourceState,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub action: Option<ApplyAction>,
	pub duration_ms: u64,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub error_detail: Option<String>,
}

impl From<&ResourceResult> for ResourceRecord {
	fn from(result: &ResourceResult) -> Self {
		Self {
			name: result.key.name.clone(),
			kind: result.key.kind.name().to_string(),
			namespace: result.key.namespace.clone(),
			final_state: result.state,
			action: result.action,
			duration_ms: u64::try_from(result.duration.as_millis()).unwrap_or(u64::MAX),
			error_detail: result.failure.as_ref().map(ToString::to_string),
		}
	}
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct JsonReport<'a> {
	verdict: RunVerdict,
	cancelled: bool,
	resources: Vec<ResourceRecord>,
	#[serde(skip_serializing_if = "Option::is_none")]
	rollback: Option<&'a RollbackSummary>,
}

impl RunReport {
	/// `Success` when everything is Ready, `FatalFailure` when nothing was
	/// applied or found unchanged.
	pub fn verdict(&self) -> RunVerdict {
		if !self.cancelled && self.results.iter().all(|r| r.state == ResourceState::Ready) {
			return RunVerdict::Success;
		}
		if self.results.iter().any(|r| r.action.is_some()) {
			RunVerdict::PartialFailure
		} else {
			RunVerdict::FatalFailure
		}
	}

	pub fn result(&self, name: &str) -> Option<&ResourceResult> {
		self.results.iter().find(|r| r.key.name == name)
	}

	pub fn count(&self, state: ResourceState) -> usize {
		self.results.iter().filter(|r| r.state == state).count()
	}

	pub fn records(&self) -> Vec<ResourceRecord> {
		self.results.iter().map(ResourceRecord::from).collect()
	}

	pub fn write_json<W: Write>(
		&self,
		mut writer: W,
		rollback: Option<&RollbackSummary>,
	) -> std::io::Result<()> {
		let report = JsonReport {
			verdict: self.verdict(),
			cancelled: self.cancelled,
			resources: self.records(),
			rollback,
		};
		serde_json::to_writer_pretty(&mut writer, &report)?;
		writeln!(writer)?;
		writer.flush()
	}

	/// Status table followed by the verdict line.
	pub fn write_table<W: Write>(
		&self,
		writer: W,
		rollback: Option<&RollbackSummary>,
	) -> std::io::Result<()> {
		let mut tw = TabWriter::new(writer).padding(2);
		writeln!(tw, "KIND\tNAMESPACE\tNAME\tSTATE\tACTION\tDURATION\tDETAIL")?;
		for record in self.records() {
			writeln!(
				tw,
				"{}\t{}\t{}\t{}\t{}\t{}\t{}",
				record.kind,
				record.namespace.as_deref().unwrap_or("-"),
				record.name,
				record.final_state,
				record.action.map_or("-", action_label),
				format_duration(Duration::from_millis(record.duration_ms)),
				record.error_detail.as_deref().unwrap_or(""),
			)?;
		}
		tw.flush()?;

		if let Some(summary) = rollback {
			writeln!(tw, "{summary}")?;
		}
		let verdict = self.verdict();
		writeln!(
			tw,
			"{:?}: {}/{} ready in {}{}",
			verdict,
			self.count(ResourceState::Ready),
			self.results.len(),
			format_duration(self.elapsed),
			if self.cancelled { " (cancelled)" } else { "" },
		)?;
		tw.flush()
	}
}

fn action_label(action: ApplyAction) -> &'static str {
	match action {
		ApplyAction::Applied => "applied",
		ApplyAction::Unchanged => "unchanged",
	}
}
