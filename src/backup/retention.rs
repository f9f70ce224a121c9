// dbbackup-engine/src/backup/retention.rs
//! Grandfather-father-son rotation over uploaded artifacts.
//!
//! Window cutoffs are rolling and anchored at `now`: a day is 24h, a week 7
//! days and a month 30 days. Weekly and monthly buckets are fixed 7-day and
//! 30-day periods counted from the Unix epoch. Nothing is calendar-aligned.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use super::artifact::{BackupArtifact, BackupTrigger};
use super::s3_upload::ObjectStore;
use crate::errors::StorageError;

const DAYS_PER_WEEK: i64 = 7;
const DAYS_PER_MONTH: i64 = 30;
const GIB: u64 = 1024 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionPolicy {
    pub daily_retention_days: u32,
    pub weekly_retention_weeks: u32,
    pub monthly_retention_months: u32,
    pub max_total_size_bytes: Option<u64>,
    pub max_backup_count: Option<usize>,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            daily_retention_days: 7,
            weekly_retention_weeks: 4,
            monthly_retention_months: 6,
            max_total_size_bytes: Some(5 * GIB),
            max_backup_count: Some(50),
        }
    }
}

impl RetentionPolicy {
    pub fn without_caps(self) -> Self {
        Self {
            max_total_size_bytes: None,
            max_backup_count: None,
            ..self
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RetentionTier {
    Daily,
    Weekly,
    Monthly,
}

/// Cutoffs of the three precedence-ordered windows. Each window's lower
/// bound is inclusive; `daily >= weekly >= monthly` always holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionWindows {
    daily_cutoff: DateTime<Utc>,
    weekly_cutoff: DateTime<Utc>,
    monthly_cutoff: DateTime<Utc>,
}

impl RetentionWindows {
    pub fn new(policy: &RetentionPolicy, now: DateTime<Utc>) -> Self {
        let daily_cutoff = now - Duration::days(i64::from(policy.daily_retention_days));
        let weekly_cutoff =
            daily_cutoff.min(now - Duration::days(i64::from(policy.weekly_retention_weeks) * DAYS_PER_WEEK));
        let monthly_cutoff =
            weekly_cutoff.min(now - Duration::days(i64::from(policy.monthly_retention_months) * DAYS_PER_MONTH));
        Self {
            daily_cutoff,
            weekly_cutoff,
            monthly_cutoff,
        }
    }

    /// Tier and bucket id of an artifact created at `created_at`, or `None`
    /// when it is older than every window.
    pub fn classify(&self, created_at: DateTime<Utc>) -> Option<(RetentionTier, i64)> {
        if created_at >= self.daily_cutoff {
            return Some((RetentionTier::Daily, 0));
        }
        if created_at >= self.weekly_cutoff {
            return Some((RetentionTier::Weekly, bucket_of(created_at, DAYS_PER_WEEK)));
        }
        if created_at >= self.monthly_cutoff {
            return Some((RetentionTier::Monthly, bucket_of(created_at, DAYS_PER_MONTH)));
        }
        None
    }
}

/// Index of the fixed-length period holding `created_at`, counted from the
/// Unix epoch. An artifact stays in the same bucket as `now` advances, so a
/// bucket's keeper is not displaced by artifacts aging into the tier.
pub fn bucket_of(created_at: DateTime<Utc>, period_days: i64) -> i64 {
    created_at
        .timestamp_millis()
        .div_euclid(Duration::days(period_days).num_milliseconds())
}

/// Fully resolved keep/delete decision. Computed before any delete is issued.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RetentionPlan {
    /// Newest first; includes manual artifacts.
    pub keep: Vec<BackupArtifact>,
    /// Newest first; never contains a manual artifact.
    pub delete: Vec<BackupArtifact>,
}

fn newest_first(a: &BackupArtifact, b: &BackupArtifact) -> std::cmp::Ordering {
    b.created_at.cmp(&a.created_at).then_with(|| b.key.cmp(&a.key))
}

/// Pure planning step of the rotation.
pub fn plan_retention(
    artifacts: &[BackupArtifact],
    policy: &RetentionPolicy,
    now: DateTime<Utc>,
) -> RetentionPlan {
    let windows = RetentionWindows::new(policy, now);

    let mut sorted: Vec<&BackupArtifact> = artifacts.iter().collect();
    sorted.sort_by(|a, b| newest_first(a, b));

    let mut manual = Vec::new();
    let mut selected: HashSet<&str> = HashSet::new();
    let mut filled: BTreeSet<(RetentionTier, i64)> = BTreeSet::new();
    let mut buckets_used: BTreeMap<RetentionTier, u32> = BTreeMap::new();

    for artifact in &sorted {
        if artifact.trigger == BackupTrigger::Manual {
            manual.push(*artifact);
            continue;
        }
        match windows.classify(artifact.created_at) {
            Some((RetentionTier::Daily, _)) => {
                selected.insert(artifact.key.as_str());
            }
            Some(slot @ (tier, _)) => {
                // Newest-first: the first artifact seen in a bucket is its
                // keeper. A window can straddle one more fixed bucket than
                // it is long, so the oldest extra bucket goes unfilled.
                if filled.contains(&slot) {
                    continue;
                }
                let limit = match tier {
                    RetentionTier::Weekly => policy.weekly_retention_weeks,
                    _ => policy.monthly_retention_months,
                };
                let used = buckets_used.entry(tier).or_insert(0);
                if *used >= limit {
                    continue;
                }
                *used += 1;
                filled.insert(slot);
                selected.insert(artifact.key.as_str());
            }
            None => {}
        }
    }

    let mut automatic_keep: Vec<&BackupArtifact> = sorted
        .iter()
        .copied()
        .filter(|a| a.trigger == BackupTrigger::Automatic && selected.contains(a.key.as_str()))
        .collect();

    if let Some(cap) = policy.max_total_size_bytes {
        let mut running: u64 = 0;
        let within = automatic_keep
            .iter()
            .take_while(|a| {
                running = running.saturating_add(a.size_bytes);
                running <= cap
            })
            .count();
        automatic_keep.truncate(within);
    }

    if let Some(max) = policy.max_backup_count {
        automatic_keep.truncate(max);
    }

    let final_keys: HashSet<&str> = automatic_keep
        .iter()
        .chain(manual.iter())
        .map(|a| a.key.as_str())
        .collect();

    let mut plan = RetentionPlan::default();
    for artifact in sorted {
        if final_keys.contains(artifact.key.as_str()) {
            plan.keep.push(artifact.clone());
        } else {
            plan.delete.push(artifact.clone());
        }
    }
    plan
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetentionFailure {
    pub key: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetentionReport {
    pub kept: Vec<String>,
    pub deleted: Vec<String>,
    pub total_size_before: u64,
    pub total_size_after: u64,
    pub errors: Vec<RetentionFailure>,
}

pub struct RetentionEngine {
    store: Arc<dyn ObjectStore>,
    prefix: String,
}

impl RetentionEngine {
    pub fn new(store: Arc<dyn ObjectStore>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
        }
    }

    /// Every artifact under the prefix, newest first. Foreign objects are
    /// skipped.
    pub async fn list_artifacts(&self) -> Result<Vec<BackupArtifact>, StorageError> {
        let objects = self.store.list_objects(&self.prefix).await?;
        let mut artifacts: Vec<BackupArtifact> =
            objects.iter().filter_map(BackupArtifact::from_stored).collect();
        artifacts.sort_by(newest_first);
        Ok(artifacts)
    }

    pub async fn plan_at(
        &self,
        policy: &RetentionPolicy,
        now: DateTime<Utc>,
    ) -> Result<RetentionPlan, StorageError> {
        let artifacts = self.list_artifacts().await?;
        Ok(plan_retention(&artifacts, policy, now))
    }

    pub async fn apply_retention_policy(
        &self,
        policy: &RetentionPolicy,
    ) -> Result<RetentionReport, StorageError> {
        self.apply_at(policy, Utc::now()).await
    }

    /// Lists, plans, then deletes. A failed delete is recorded and the pass
    /// continues with the next candidate.
    pub async fn apply_at(
        &self,
        policy: &RetentionPolicy,
        now: DateTime<Utc>,
    ) -> Result<RetentionReport, StorageError> {
        let plan = self.plan_at(policy, now).await?;

        let total_size_before: u64 = plan
            .keep
            .iter()
            .chain(plan.delete.iter())
            .map(|a| a.size_bytes)
            .sum();

        let mut report = RetentionReport {
            kept: plan.keep.iter().map(|a| a.key.clone()).collect(),
            total_size_before,
            total_size_after: total_size_before,
            ..Default::default()
        };

        for artifact in &plan.delete {
            match self.store.delete_object(&artifact.key).await {
                Ok(()) => {
                    tracing::info!(key = %artifact.key, created_at = %artifact.created_at, "Deleted expired backup");
                    report.total_size_after -= artifact.size_bytes;
                    report.deleted.push(artifact.key.clone());
                }
                Err(e) => {
                    tracing::warn!(key = %artifact.key, error = %e, "Failed to delete expired backup");
                    report.errors.push(RetentionFailure {
                        key: artifact.key.clone(),
                        message: e.to_string(),
                    });
                }
            }
        }

        tracing::info!(
            kept = report.kept.len(),
            deleted = report.deleted.len(),
            failed = report.errors.len(),
            size_before = report.total_size_before,
            size_after = report.total_size_after,
            "Retention policy applied"
        );
        Ok(report)
    }
}
