//! # mcpgate-core
//!
//! Foundation layer of the gateway: the error taxonomy every component
//! speaks, identity construction and propagation, configuration, and the two
//! external contracts the core consumes — the cache backend and the
//! persistence DAO.

pub mod cache;
pub mod config;
pub mod dao;
pub mod error;
pub mod identity;

pub use cache::{Cache, MemoryCache, RedisCache};
pub use config::GatewayConfig;
pub use dao::{Dao, MemoryDao};
pub use error::{GatewayError, GatewayResult, ViolationSeverity};
pub use identity::{AuthMethod, Authenticator, IdentityPropagation, UserContext, identity_hash};
