pub mod artifact;
pub mod db_dump; // native and logical exporters
pub mod integrity;
pub(crate) mod logic;
pub mod progress;
pub mod retention;
pub mod s3_upload;

#[cfg(test)]
pub(crate) mod memory_store;

use std::sync::Arc;

use crate::config::AppConfig;

pub use artifact::{BackupArtifact, BackupTrigger};
pub use logic::{BackupOrchestrator, ComponentFactory, PostgresS3Factory, RunOutcome};

/// Orchestrator wired to PostgreSQL and the configured S3 bucket.
pub fn production_orchestrator(app_config: Arc<AppConfig>) -> BackupOrchestrator {
    BackupOrchestrator::new(app_config, Arc::new(PostgresS3Factory))
}
