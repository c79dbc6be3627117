//! Standalone cleanup process: runs the housekeeping strategies against the
//! configured stores until interrupted.

use std::process::ExitCode;
use std::sync::{Arc, mpsc};

use anyhow::Context;
use tracing::{error, info};

use jobguard_core::SystemClock;
use jobguard_infra::cleanup::default_strategies;
use jobguard_infra::meta::RedisJobMetaRepository;
use jobguard_infra::repository::PostgresJobRepository;
use jobguard_infra::{
    JobLockService, JobMetaRepository, JobMutexGroups, JobRepository, JobsConfig, Scheduler,
    StoreKind,
};

const MAX_DB_CONNECTIONS: u32 = 4;

type Stores = (Arc<dyn JobRepository>, Arc<dyn JobMetaRepository>);

fn main() -> ExitCode {
    jobguard_observability::init();

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %format!("{e:#}"), "sweeper failed");
            ExitCode::FAILURE
        }
    }
}

fn run() -> anyhow::Result<()> {
    let config = JobsConfig::from_env();
    config.validate().context("invalid configuration")?;

    let (repository, meta) = stores(&config)?;
    // Locks are released per job type, so mutex groups play no part here.
    let locks = JobLockService::new(meta, JobMutexGroups::default());
    let strategies = default_strategies(
        repository,
        locks,
        Arc::new(SystemClock),
        &config.cleanup,
    );
    let handle = Scheduler::new().with_strategies(strategies).start();
    info!(store = ?config.store, loops = handle.len(), "sweeper running");

    let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
    ctrlc::set_handler(move || {
        let _ = shutdown_tx.send(());
    })
    .context("failed to install signal handler")?;

    let _ = shutdown_rx.recv();
    info!("shutdown requested");
    handle.shutdown();
    Ok(())
}

/// Job records live in Postgres and run locks and meta in Redis.
///
/// `memory` and `redis` keep job records inside each job-running process, so
/// a separate sweeper would see no jobs and release every live lock as
/// orphaned. Both are refused.
fn stores(config: &JobsConfig) -> anyhow::Result<Stores> {
    match config.store {
        StoreKind::Memory | StoreKind::Redis => anyhow::bail!(
            "store {:?} keeps job records in process memory; the sweeper needs the postgres store",
            config.store
        ),
        StoreKind::Postgres => {
            let url = config
                .database_url
                .as_deref()
                .context("DATABASE_URL is required for the postgres store")?;
            let repository = PostgresJobRepository::connect(url, MAX_DB_CONNECTIONS)
                .context("failed to connect to postgres")?;
            Ok((Arc::new(repository), redis_meta(config)?))
        }
    }
}

fn redis_meta(config: &JobsConfig) -> anyhow::Result<Arc<dyn JobMetaRepository>> {
    let meta = RedisJobMetaRepository::new(&config.redis_url)
        .with_context(|| format!("failed to open redis at {}", config.redis_url))?;
    Ok(Arc::new(meta))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn process_local_job_stores_are_refused() {
        for store in [StoreKind::Memory, StoreKind::Redis] {
            let config = JobsConfig {
                store,
                ..JobsConfig::default()
            };
            match stores(&config) {
                Ok(_) => panic!("sweeper accepted {store:?}"),
                Err(e) => assert!(e.to_string().contains("needs the postgres store")),
            }
        }
    }

    #[test]
    fn postgres_store_requires_database_url() {
        let config = JobsConfig {
            store: StoreKind::Postgres,
            database_url: None,
            ..JobsConfig::default()
        };
        match stores(&config) {
            Ok(_) => panic!("postgres store without a database url"),
            Err(e) => assert!(e.to_string().contains("DATABASE_URL")),
        }
    }
}
