//! Session Module
//!
//! Pooled remote browser sessions.
//!
//! # Structure
//!
//! - [`model`]: Session records, configuration and pool statistics
//! - [`provider`]: Boundary to the remote session service
//! - [`pool`]: The bounded pool and its scoped leases

pub mod model;
pub mod pool;
pub mod provider;

pub use model::{
    CleanupReport, PoolStats, SessionConfig, SessionHandle, SessionInfo, SessionStatus, TypeStats,
};
pub use pool::{Headroom, SessionLease, SessionPool};
pub use provider::SessionProvider;
