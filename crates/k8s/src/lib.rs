//! Shared Kubernetes utilities for kinstall and its test server.
//!
//! kinstall only reconciles a closed set of resource kinds, so instead of
//! running API discovery against the cluster it looks kinds up in a static
//! registry. The mock API server uses the same registry to route requests.

pub mod kinds;

pub use kinds::{lookup, KindInfo, ReadinessSignal, ResourceScope, UnknownKind};
