//! Readiness probing.
//!
//! A probe answers "is this resource serving yet?". Single attempts are cheap
//! and bounded by a short per-attempt timeout; [`Prober::wait_until_healthy`]
//! repeats them with growing gaps until the resource's readiness timeout.

use std::{fmt, time::Duration};

use ::k8s::ReadinessSignal;
use bon::Builder;
use tokio::{net::TcpStream, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{instrument, trace};

use crate::{
	duration::deadline_after,
	k8s::{ClusterClient, Condition},
	manifest::ResourceSpec,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeSpec {
	/// Any 2xx passes unless `expect_status` is set.
	HttpGet {
		url: String,
		expect_status: Option<u16>,
	},
	TcpSocket {
		host: String,
		port: u16,
	},
	/// `expected` defaults to the manifest's `spec.replicas` (or 1).
	ReplicaCount {
		expected: Option<i64>,
	},
	Condition(Condition),
}

impl ProbeSpec {
	/// The spec's declared probe, or the default for its kind.
	pub fn for_spec(spec: &ResourceSpec) -> Self {
		spec.readiness
			.probe
			.clone()
			.unwrap_or_else(|| Self::default_for(spec))
	}

	pub fn default_for(spec: &ResourceSpec) -> Self {
		match spec.kind_info().readiness {
			ReadinessSignal::Replicas => Self::ReplicaCount { expected: None },
			_ => Self::Condition(Condition::for_spec(spec)),
		}
	}
}

impl fmt::Display for ProbeSpec {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::HttpGet { url, .. } => write!(f, "GET {url}"),
			Self::TcpSocket { host, port } => write!(f, "tcp {host}:{port}"),
			Self::ReplicaCount { expected: Some(n) } => write!(f, "{n} ready replicas"),
			Self::ReplicaCount { expected: None } => f.write_str("ready replicas"),
			Self::Condition(c) => write!(f, "{c:?}"),
		}
	}
}

/// Result of a single probe attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeStatus {
	Healthy,
	/// The target answered and is not ready.
	Unhealthy(String),
	/// No answer yet: not found, connection refused, attempt timed out.
	Unknown(String),
}

impl fmt::Display for ProbeStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Healthy => f.write_str("healthy"),
			Self::Unhealthy(detail) => write!(f, "unhealthy: {detail}"),
			Self::Unknown(detail) => write!(f, "unknown: {detail}"),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
	Healthy,
	TimedOut { last: ProbeStatus },
	Cancelled,
}

#[derive(Debug, Clone, Builder)]
pub struct ProbeSettings {
	/// First gap between polls.
	#[builder(default = Duration::from_secs(2))]
	pub poll_interval: Duration,
	#[builder(default = Duration::from_secs(10))]
	pub max_poll_interval: Duration,
	/// Bound on a single HTTP or TCP attempt.
	#[builder(default = Duration::from_secs(2))]
	pub attempt_timeout: Duration,
}

impl Default for ProbeSettings {
	fn default() -> Self {
		Self::builder().build()
	}
}

impl ProbeSettings {
	/// Gap after poll number `poll` (0-based): doubles from `poll_interval`
	/// up to `max_poll_interval`.
	pub fn poll_delay(&self, poll: u32) -> Duration {
		let factor = 2u32.saturating_pow(poll.min(16));
		self.poll_interval
			.saturating_mul(factor)
			.min(self.max_poll_interval)
	}
}

pub struct Prober {
	http: reqwest::Client,
	settings: ProbeSettings,
}

impl Prober {
	pub fn new(settings: ProbeSettings) -> Result<Self, reqwest::Error> {
		let http = reqwest::Client::builder()
			.timeout(settings.attempt_timeout)
			.connect_timeout(settings.attempt_timeout)
			.build()?;
		Ok(Self { http, settings })
	}

	pub fn settings(&self) -> &ProbeSettings {
		&self.settings
	}

	/// One probe attempt. Never fails: problems become `Unknown`.
	pub async fn probe_once<C: ClusterClient + ?Sized>(
		&self,
		client: &C,
		spec: &ResourceSpec,
		probe: &ProbeSpec,
	) -> ProbeStatus {
		match probe {
			ProbeSpec::HttpGet { url, expect_status } => self.http_get(url, *expect_status).await,
			ProbeSpec::TcpSocket { host, port } => self.tcp_connect(host, *port).await,
			ProbeSpec::ReplicaCount { expected } => {
				let expected =
					expected.unwrap_or_else(|| ::k8s::kinds::desired_replicas(&spec.manifest));
				match client.get(&spec.key).await {
					Ok(Some(live)) => {
						let ready = ::k8s::kinds::ready_replicas(&live);
						if ready >= expected {
							ProbeStatus::Healthy
						} else {
							ProbeStatus::Unhealthy(format!("{ready}/{expected} replicas ready"))
						}
					}
					Ok(None) => ProbeStatus::Unknown("not found".to_string()),
					Err(e) => ProbeStatus::Unknown(e.to_string()),
				}
			}
			ProbeSpec::Condition(condition) => match client.get(&spec.key).await {
				Ok(live) => match condition.is_met(live.as_ref()) {
					Some(true) => ProbeStatus::Healthy,
					Some(false) => ProbeStatus::Unhealthy(format!("{condition:?} not met")),
					None => ProbeStatus::Unknown("not found".to_string()),
				},
				Err(e) => ProbeStatus::Unknown(e.to_string()),
			},
		}
	}

	async fn http_get(&self, url: &str, expect_status: Option<u16>) -> ProbeStatus {
		match self.http.get(url).send().await {
			Ok(response) => {
				let status = response.status();
				let ok = match expect_status {
					Some(code) => status.as_u16() == code,
					None => status.is_success(),
				};
				if ok {
					ProbeStatus::Healthy
				} else {
					ProbeStatus::Unhealthy(format!("HTTP {status}"))
				}
			}
			Err(e) => ProbeStatus::Unknown(e.to_string()),
		}
	}

	async fn tcp_connect(&self, host: &str, port: u16) -> ProbeStatus {
		match tokio::time::timeout(self.settings.attempt_timeout, TcpStream::connect((host, port)))
			.await
		{
			Ok(Ok(_)) => ProbeStatus::Healthy,
			Ok(Err(e)) => ProbeStatus::Unknown(e.to_string()),
			Err(_) => ProbeStatus::Unknown("connect timed out".to_string()),
		}
	}

	/// Poll until healthy, `timeout` elapses or `cancel` fires.
	///
	/// Never sleeps past the deadline.
	#[instrument(skip_all, fields(resource = %spec.key, probe = %probe))]
	pub async fn wait_until_healthy<C: ClusterClient + ?Sized>(
		&self,
		client: &C,
		spec: &ResourceSpec,
		probe: &ProbeSpec,
		timeout: Duration,
		cancel: &CancellationToken,
	) -> ProbeOutcome {
		let deadline = deadline_after(timeout);
		let mut last = ProbeStatus::Unknown("not probed".to_string());
		let mut poll = 0u32;

		loop {
			let attempt = tokio::select! {
				biased;
				() = cancel.cancelled() => return ProbeOutcome::Cancelled,
				attempt = tokio::time::timeout_at(deadline, self.probe_once(client, spec, probe)) => attempt,
			};
			match attempt {
				Ok(ProbeStatus::Healthy) => return ProbeOutcome::Healthy,
				Ok(status) => {
					trace!(poll, status = %status, "not ready yet");
					last = status;
				}
				Err(_) => return ProbeOutcome::TimedOut { last },
			}

			let now = Instant::now();
			if now >= deadline {
				return ProbeOutcome::TimedOut { last };
			}
			let delay = self.settings.poll_delay(poll).min(deadline - now);
			poll = poll.saturating_add(1);

			tokio::select! {
				biased;
				() = cancel.cancelled() => return ProbeOutcome::Cancelled,
				() = tokio::time::sleep(delay) => {}
			}
		}
	}
}
