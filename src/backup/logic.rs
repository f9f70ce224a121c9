// dbbackup-engine/src/backup/logic.rs
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, timeout_at};
use uuid::Uuid;

use super::artifact::{BackupArtifact, BackupTrigger, artifact_key, file_name_of};
use super::db_dump::{DumpChain, LogicalExporter, NativeDumpExporter};
use super::integrity::{IntegrityReport, IntegrityVerifier, PgSourceInspector};
use super::progress::{BackupStatus, ProgressTracker, RunHandle};
use super::retention::{RetentionEngine, RetentionPlan, RetentionReport};
use super::s3_upload::{ObjectStore, S3ObjectStore, upload_artifact};
use crate::config::{AppConfig, ValidatedConfig};
use crate::errors::BackupError;
use crate::utils::redact_database_url;

/// Builds the collaborators of a run from validated configuration.
#[async_trait]
pub trait ComponentFactory: Send + Sync {
    async fn object_store(&self, config: &ValidatedConfig) -> Result<Arc<dyn ObjectStore>, BackupError>;

    async fn snapshot_pipeline(
        &self,
        config: &ValidatedConfig,
        record_count_tolerance: f64,
    ) -> Result<(DumpChain, IntegrityVerifier), BackupError>;
}

/// PostgreSQL source, S3-compatible sink.
pub struct PostgresS3Factory;

#[async_trait]
impl ComponentFactory for PostgresS3Factory {
    async fn object_store(&self, config: &ValidatedConfig) -> Result<Arc<dyn ObjectStore>, BackupError> {
        let store: Arc<dyn ObjectStore> = Arc::new(S3ObjectStore::connect(&config.spaces).await);
        Ok(store)
    }

    async fn snapshot_pipeline(
        &self,
        config: &ValidatedConfig,
        record_count_tolerance: f64,
    ) -> Result<(DumpChain, IntegrityVerifier), BackupError> {
        let db = &config.database;
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(Duration::from_secs(15))
            .connect_lazy(&config.database_url)
            .map_err(|e| {
                BackupError::Config(format!(
                    "invalid database connection string {}: {}",
                    redact_database_url(&config.database_url),
                    e
                ))
            })?;

        let native = NativeDumpExporter::new(
            &config.database_url,
            db.pg_dump_path.clone(),
            db.native_dump_timeout,
            db.max_dump_bytes,
        );
        let chain = DumpChain::new(Arc::new(native), Arc::new(LogicalExporter::new(pool.clone())));
        let verifier = IntegrityVerifier::new(
            Some(Arc::new(PgSourceInspector::new(pool))),
            record_count_tolerance,
        );
        Ok((chain, verifier))
    }
}

/// Result of a successful run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunOutcome {
    pub run_id: Uuid,
    pub artifact: BackupArtifact,
    pub location: String,
    pub integrity: IntegrityReport,
    pub retention: Option<RetentionReport>,
    pub diagnostics: Vec<String>,
}

pub struct BackupOrchestrator {
    config: Arc<AppConfig>,
    factory: Arc<dyn ComponentFactory>,
    progress: ProgressTracker,
}

impl BackupOrchestrator {
    pub fn new(config: Arc<AppConfig>, factory: Arc<dyn ComponentFactory>) -> Self {
        let progress = ProgressTracker::new(
            config.run.concurrent_trigger,
            config.run.progress_reset_delay,
            config.run.estimated_duration_ms,
        );
        Self {
            config,
            factory,
            progress,
        }
    }

    pub fn progress(&self) -> &ProgressTracker {
        &self.progress
    }

    /// Runs one backup end to end. Every failure lands in the run's progress
    /// state before it is returned.
    pub async fn run_backup(&self, trigger: BackupTrigger) -> Result<RunOutcome, BackupError> {
        let run = self.progress.begin(trigger).await?;
        let run_id = run.run_id();
        let deadline = Instant::now() + self.config.run.run_timeout;

        let result = match timeout_at(deadline, self.create_and_upload(&run, trigger)).await {
            Ok(result) => result,
            Err(_) => Err(BackupError::Timeout(self.config.run.run_timeout)),
        };

        let (mut outcome, store) = match result {
            Ok(done) => done,
            Err(e) => {
                tracing::error!(run_id = %run_id, trigger = %trigger, kind = e.kind(), error = %e, "Backup run failed");
                run.fail(&e).await;
                return Err(e);
            }
        };

        if trigger == BackupTrigger::Automatic {
            run.advance(BackupStatus::Uploading, 95, "Applying retention policy").await;
            let engine = RetentionEngine::new(store, self.config.folder_prefix());
            match timeout_at(deadline, engine.apply_retention_policy(&self.config.retention)).await {
                Ok(Ok(report)) => {
                    for failure in &report.errors {
                        outcome
                            .diagnostics
                            .push(format!("retention: could not delete {}: {}", failure.key, failure.message));
                    }
                    outcome.retention = Some(report);
                }
                Ok(Err(e)) => {
                    tracing::warn!(run_id = %run_id, error = %e, "Retention pass failed; backup kept");
                    outcome.diagnostics.push(format!("retention failed: {}", e));
                }
                Err(_) => {
                    tracing::warn!(run_id = %run_id, "Retention pass ran out of time; backup kept");
                    outcome
                        .diagnostics
                        .push("retention interrupted: run time limit reached".to_string());
                }
            }
        } else {
            outcome
                .diagnostics
                .push("retention skipped for manual backup".to_string());
        }

        tracing::info!(
            run_id = %run_id,
            key = %outcome.artifact.key,
            method = %outcome.artifact.method,
            bytes = outcome.artifact.size_bytes,
            "Backup run completed"
        );
        run.complete(outcome.artifact.clone()).await;
        Ok(outcome)
    }

    /// Runs the backup on its own task and waits for it. Dropping the
    /// returned future leaves the run going to completion.
    pub async fn run_detached(self: Arc<Self>, trigger: BackupTrigger) -> Result<RunOutcome, BackupError> {
        let task = tokio::spawn(async move { self.run_backup(trigger).await });
        match task.await {
            Ok(result) => result,
            Err(e) if e.is_panic() => {
                tracing::error!(trigger = %trigger, "Backup task panicked");
                Err(BackupError::Aborted("backup task panicked".to_string()))
            }
            Err(e) => Err(BackupError::Aborted(e.to_string())),
        }
    }

    async fn create_and_upload(
        &self,
        run: &RunHandle,
        trigger: BackupTrigger,
    ) -> Result<(RunOutcome, Arc<dyn ObjectStore>), BackupError> {
        run.advance(BackupStatus::Creating, 0, "Validating configuration").await;
        let validated = self.config.validate()?;
        let store = self.factory.object_store(&validated).await?;
        let (chain, verifier) = self
            .factory
            .snapshot_pipeline(&validated, self.config.run.record_count_tolerance)
            .await?;
        run.advance(BackupStatus::Creating, 5, "Configuration validated").await;

        let created_at = Utc::now();
        let (bytes, method) = chain.produce_snapshot(run).await?;

        run.advance(BackupStatus::Creating, 65, "Verifying snapshot integrity").await;
        let simplified = match trigger {
            BackupTrigger::Automatic => self.config.run.simplified_integrity_automatic,
            BackupTrigger::Manual => self.config.run.simplified_integrity_manual,
        };
        let integrity = verifier.verify(&bytes, simplified).await;
        if !integrity.is_valid {
            return Err(BackupError::Integrity {
                errors: integrity.validation_errors,
            });
        }
        run.advance(BackupStatus::Creating, 70, "Snapshot verified").await;

        let key = artifact_key(&validated.spaces.folder_prefix, created_at);
        let artifact = BackupArtifact {
            file_name: file_name_of(&key),
            key,
            created_at,
            size_bytes: bytes.len() as u64,
            checksum: integrity.checksum.clone(),
            record_count: integrity.record_count,
            table_count: integrity.tables.len(),
            method,
            trigger,
            validated: true,
        };

        run.advance(BackupStatus::Uploading, 75, "Uploading to object storage").await;
        upload_artifact(store.as_ref(), bytes, &artifact)
            .await
            .map_err(BackupError::Upload)?;
        run.advance(BackupStatus::Uploading, 90, "Upload complete").await;

        let outcome = RunOutcome {
            run_id: run.run_id(),
            location: store.location(&artifact.key),
            artifact,
            integrity,
            retention: None,
            diagnostics: Vec::new(),
        };
        Ok((outcome, store))
    }

    async fn retention_engine(&self) -> Result<RetentionEngine, BackupError> {
        let validated = self.config.validate()?;
        let store = self.factory.object_store(&validated).await?;
        Ok(RetentionEngine::new(store, validated.spaces.folder_prefix))
    }

    /// Artifacts currently in storage, newest first.
    pub async fn list_artifacts(&self) -> Result<Vec<BackupArtifact>, BackupError> {
        let engine = self.retention_engine().await?;
        Ok(engine.list_artifacts().await?)
    }

    /// Standalone retention pass, outside of a backup run.
    pub async fn apply_retention(&self) -> Result<RetentionReport, BackupError> {
        let engine = self.retention_engine().await?;
        Ok(engine.apply_retention_policy(&self.config.retention).await?)
    }

    /// What a retention pass would keep and delete, without deleting.
    pub async fn plan_retention(&self) -> Result<RetentionPlan, BackupError> {
        let engine = self.retention_engine().await?;
        Ok(engine.plan_at(&self.config.retention, Utc::now()).await?)
    }
}
