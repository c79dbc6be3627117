//! Job execution record storage.
//!
//! This module defines the storage boundary for [`JobInfo`](jobguard_core::JobInfo)
//! records plus the in-memory and (feature `postgres`) Postgres adapters.

pub mod in_memory;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemoryJobRepository;
#[cfg(feature = "postgres")]
pub use postgres::PostgresJobRepository;
pub use r#trait::{JobRepository, newest_first};
