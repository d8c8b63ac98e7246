//! Mock Kubernetes API server for testing.
//!
//! Provides an HTTP server that can be used with kubeconfig-based connections.
//! It understands server-side apply, deletion and the scale subresource for the
//! kinds in the [`k8s`] registry, and fakes workload readiness so installers
//! can be driven end to end.

mod helpers;
pub mod http;

pub use helpers::synthesize_status;
pub use http::{HttpMockK8sServer, Mutation, MutationVerb, RunningHttpMockK8sServer};
