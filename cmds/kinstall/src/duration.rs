//! Go-style duration strings (`90s`, `5m`, `1h30m`, `250ms`).
//!
//! Used by the config file, manifest `readiness.timeout` fields and CLI flags.

use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DurationError {
	#[error("duration cannot be empty")]
	Empty,

	#[error("expected a number at position {position} in `{input}`")]
	ExpectedNumber { input: String, position: usize },

	#[error("missing unit suffix (ms/s/m/h) in `{0}`")]
	MissingUnit(String),

	#[error("unknown unit `{unit}` in `{input}`")]
	UnknownUnit { input: String, unit: String },

	#[error("duration `{0}` is too large")]
	Overflow(String),
}

/// Stand-in for "no deadline" when `now + timeout` does not fit in an [`Instant`].
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// `Instant::now() + timeout`, clamped to a far-future instant on overflow.
pub fn deadline_after(timeout: Duration) -> Instant {
	let now = Instant::now();
	now.checked_add(timeout)
		.or_else(|| now.checked_add(FAR_FUTURE))
		.unwrap_or(now)
}

/// Parse a duration such as `1h30m` or `500ms`.
///
/// A bare `0` is accepted without a unit.
pub fn parse_duration(input: &str) -> Result<Duration, DurationError> {
	let s = input.trim();
	if s.is_empty() {
		return Err(DurationError::Empty);
	}
	if s == "0" {
		return Ok(Duration::ZERO);
	}

	let mut total = Duration::ZERO;
	let mut remaining = s;

	while !remaining.is_empty() {
		let num_end = remaining
			.find(|c: char| !c.is_ascii_digit())
			.unwrap_or(remaining.len());
		if num_end == 0 {
			return Err(DurationError::ExpectedNumber {
				input: s.to_string(),
				position: s.len() - remaining.len(),
			});
		}
		let value: u64 = remaining[..num_end]
			.parse()
			.map_err(|_| DurationError::ExpectedNumber {
				input: s.to_string(),
				position: s.len() - remaining.len(),
			})?;
		remaining = &remaining[num_end..];

		let unit_end = remaining
			.find(|c: char| c.is_ascii_digit())
			.unwrap_or(remaining.len());
		let unit = &remaining[..unit_end];
		remaining = &remaining[unit_end..];

		let part = match unit {
			"" => return Err(DurationError::MissingUnit(s.to_string())),
			"ms" => Some(Duration::from_millis(value)),
			"s" => Some(Duration::from_secs(value)),
			"m" => value.checked_mul(60).map(Duration::from_secs),
			"h" => value.checked_mul(3600).map(Duration::from_secs),
			other => {
				return Err(DurationError::UnknownUnit {
					input: s.to_string(),
					unit: other.to_string(),
				})
			}
		};
		total = part
			.and_then(|part| total.checked_add(part))
			.ok_or_else(|| DurationError::Overflow(s.to_string()))?;
	}

	Ok(total)
}

/// Render a duration the way [`parse_duration`] reads it.
pub fn format_duration(duration: Duration) -> String {
	let millis = duration.as_millis();
	if millis == 0 {
		return "0s".to_string();
	}
	if millis % 1000 != 0 {
		return format!("{millis}ms");
	}

	let mut secs = duration.as_secs();
	let mut out = String::new();
	for (unit, size) in [("h", 3600), ("m", 60), ("s", 1)] {
		if secs >= size {
			out.push_str(&format!("{}{}", secs / size, unit));
			secs %= size;
		}
	}
	out
}

/// `#[serde(with = "crate::duration::serde_str")]` for `Duration` fields.
pub mod serde_str {
	use std::time::Duration;

	use serde::{Deserialize, Deserializer, Serializer};

	pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_str(&super::format_duration(*duration))
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
		let raw = String::deserialize(deserializer)?;
		super::parse_duration(&raw).map_err(serde::de::Error::custom)
	}
}

/// Same as [`serde_str`], for `Option<Duration>`.
pub mod serde_opt {
	use std::time::Duration;

	use serde::{Deserialize, Deserializer, Serializer};

	pub fn serialize<S: Serializer>(
		duration: &Option<Duration>,
		serializer: S,
	) -> Result<S::Ok, S::Error> {
		match duration {
			Some(d) => serializer.serialize_some(&super::format_duration(*d)),
			None => serializer.serialize_none(),
		}
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(
		deserializer: D,
	) -> Result<Option<Duration>, D::Error> {
		Option::<String>::deserialize(deserializer)?
			.map(|raw| super::parse_duration(&raw).map_err(serde::de::Error::custom))
			.transpose()
	}
}

#[cfg(test)]
mod tests {
	use rstest::rstest;

	use super::*;

	#[rstest]
	#[case("90s", Duration::from_secs(90))]
	#[case("5m", Duration::from_secs(300))]
	#[case("1h30m", Duration::from_secs(5400))]
	#[case("2h0m30s", Duration::from_secs(7230))]
	#[case("250ms", Duration::from_millis(250))]
	#[case("1s500ms", Duration::from_millis(1500))]
	#[case("0", Duration::ZERO)]
	fn test_parse_duration(#[case] input: &str, #[case] expected: Duration) {
		assert_eq!(parse_duration(input), Ok(expected));
	}

	#[rstest]
	#[case("", DurationError::Empty)]
	#[case("10", DurationError::MissingUnit("10".to_string()))]
	#[case("s10", DurationError::ExpectedNumber { input: "s10".to_string(), position: 0 })]
	#[case("3d", DurationError::UnknownUnit { input: "3d".to_string(), unit: "d".to_string() })]
	#[case("5124095576030432h", DurationError::Overflow("5124095576030432h".to_string()))]
	#[case("307445734561825861m", DurationError::Overflow("307445734561825861m".to_string()))]
	#[case("18446744073709551615s1s", DurationError::Overflow("18446744073709551615s1s".to_string()))]
	fn test_parse_duration_errors(#[case] input: &str, #[case] expected: DurationError) {
		assert_eq!(parse_duration(input), Err(expected));
	}

	#[rstest]
	#[case(Duration::from_secs(5400), "1h30m")]
	#[case(Duration::from_secs(2), "2s")]
	#[case(Duration::from_millis(1500), "1500ms")]
	#[case(Duration::ZERO, "0s")]
	fn test_format_duration(#[case] input: Duration, #[case] expected: &str) {
		assert_eq!(format_duration(input), expected);
		assert_eq!(parse_duration(expected), Ok(input));
	}

	#[test]
	fn test_largest_duration_parses() {
		assert_eq!(
			parse_duration("18446744073709551615s"),
			Ok(Duration::from_secs(u64::MAX))
		);
	}

	#[tokio::test(start_paused = true)]
	async fn test_deadline_after_clamps_on_overflow() {
		let now = Instant::now();
		assert_eq!(deadline_after(Duration::from_secs(5)), now + Duration::from_secs(5));

		let clamped = deadline_after(Duration::MAX);
		assert!(clamped > now + Duration::from_secs(86400 * 365));
	}
}
