//! Bounded exponential backoff for cluster calls.

use std::{future::Future, time::Duration};

use rand::Rng;
use serde::Deserialize;
use tracing::{error, warn};

/// Backoff settings for calls that may fail transiently.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BackoffPolicy {
	/// Total attempts including the first one.
	pub max_attempts: u32,
	#[serde(with = "crate::duration::serde_str")]
	pub base_delay: Duration,
	pub factor: f64,
	#[serde(with = "crate::duration::serde_str")]
	pub max_delay: Duration,
	/// Scale each delay by a random factor in `0.5..1.5`.
	pub jitter: bool,
}

impl Default for BackoffPolicy {
	fn default() -> Self {
		Self {
			max_attempts: 5,
			base_delay: Duration::from_secs(1),
			factor: 2.0,
			max_delay: Duration::from_secs(30),
			jitter: false,
		}
	}
}

impl BackoffPolicy {
	/// Policy that never sleeps, for tests.
	pub fn immediate(max_attempts: u32) -> Self {
		Self {
			max_attempts,
			base_delay: Duration::ZERO,
			max_delay: Duration::ZERO,
			..Self::default()
		}
	}

	/// Delay before retry number `attempt` (1-based), without jitter.
	pub fn delay_for(&self, attempt: u32) -> Duration {
		let exp = attempt.saturating_sub(1).min(63) as i32;
		let secs = self.base_delay.as_secs_f64() * self.factor.powi(exp);
		let capped = secs.min(self.max_delay.as_secs_f64());
		if capped.is_finite() && capped > 0.0 {
			Duration::try_from_secs_f64(capped).unwrap_or(self.max_delay)
		} else {
			Duration::ZERO
		}
	}

	fn jittered(&self, attempt: u32) -> Duration {
		let delay = self.delay_for(attempt);
		if !self.jitter || delay.is_zero() {
			return delay;
		}
		let factor = rand::thread_rng().gen_range(0.5..1.5);
		Duration::try_from_secs_f64(delay.as_secs_f64() * factor).unwrap_or(delay)
	}
}

/// Errors that know whether retrying could help.
pub trait Transient {
	fn is_transient(&self) -> bool;
}

/// Run `operation` until it succeeds, fails non-transiently, or attempts run out.
///
/// The last error is returned unchanged.
pub async fn retry_with_backoff<F, Fut, T, E>(
	policy: &BackoffPolicy,
	operation_name: &str,
	mut operation: F,
) -> Result<T, E>
where
	F: FnMut() -> Fut,
	Fut: Future<Output = Result<T, E>>,
	E: Transient + std::fmt::Display,
{
	let max_attempts = policy.max_attempts.max(1);
	let mut attempt = 0u32;

	loop {
		attempt += 1;

		match operation().await {
			Ok(result) => return Ok(result),
			Err(e) if !e.is_transient() => return Err(e),
			Err(e) if attempt >= max_attempts => {
				error!(
					operation = %operation_name,
					attempt,
					error = %e,
					"giving up after max retries"
				);
				return Err(e);
			}
			Err(e) => {
				let delay = policy.jittered(attempt);
				warn!(
					operation = %operation_name,
					attempt,
					error = %e,
					delay_ms = delay.as_millis() as u64,
					"transient failure, retrying"
				);
				tokio::time::sleep(delay).await;
			}
		}
	}
}
