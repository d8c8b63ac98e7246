pub mod commands;
pub mod config;
pub mod diff;
pub mod duration;
pub mod error;
pub mod graph;
pub mod installer;
pub mod k8s;
pub mod manifest;
pub mod probe;
pub mod reconcile;
pub mod report;
pub mod retry;
pub mod rollback;
pub mod telemetry;
#[cfg(test)]
pub mod test_utils;
