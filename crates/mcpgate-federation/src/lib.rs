//! # mcpgate-federation
//!
//! Federation core of the gateway: the entity catalog with visibility
//! scoping, RPC dispatch across the closed set of integration types, the
//! REST passthrough with SSRF guards, protocol adapters for GraphQL and
//! gRPC, and the cluster-wide cancellation service.

pub mod cancellation;
pub mod catalog;
pub mod dispatch;
pub mod graphql;
pub mod grpc;
pub mod passthrough;

pub use cancellation::{CancelOutcome, CancellationService, RunStatus};
pub use catalog::{Catalog, Page};
pub use dispatch::{CodeExecutor, Dispatcher};
pub use passthrough::{Passthrough, PassthroughRequest, PassthroughResponse};
