//! Per-job-type metadata, run locks and disabled flags.

pub mod in_memory;
#[cfg(feature = "redis")]
pub mod redis;
pub mod r#trait;

pub use in_memory::InMemoryJobMetaRepository;
#[cfg(feature = "redis")]
pub use self::redis::RedisJobMetaRepository;
pub use r#trait::JobMetaRepository;
