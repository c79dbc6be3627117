//! Infrastructure layer: stores, run locks, execution, cleanup and scheduling.

pub mod cleanup;
pub mod config;
pub mod definitions;
pub mod error;
pub mod lock;
pub mod log_layer;
pub mod meta;
pub mod meta_handle;
pub mod mutex;
pub mod pool;
pub mod publisher;
pub mod repository;
pub mod runnable;
pub mod runner;
pub mod scheduler;
pub mod service;
pub mod status;


pub use cleanup::{CleanupReport, CleanupStrategy};
pub use config::{CleanupConfig, JobsConfig, StoreKind};
pub use definitions::JobDefinitionService;
pub use error::RepositoryError;
pub use lock::{JobLockError, JobLockService};
pub use log_layer::{JobLogLayer, JobMessageSink};
pub use meta::{InMemoryJobMetaRepository, JobMetaRepository};
pub use meta_handle::JobMetaHandle;
pub use mutex::{JobMutexGroup, JobMutexGroups};
pub use publisher::JobEventPublisher;
pub use repository::{InMemoryJobRepository, JobRepository};
pub use runnable::{JobFn, JobOutcome, JobRunnable};
pub use runner::JobRunner;
pub use scheduler::{Scheduler, SchedulerHandle};
pub use service::{JobService, JobServiceBuilder, JobServiceError};
pub use status::{HealthStatus, JobStatusCalculator, StatusDetail};
