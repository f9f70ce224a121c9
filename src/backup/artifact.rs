// dbbackup-engine/src/backup/artifact.rs
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::LazyLock;

use super::s3_upload::StoredObject;

pub const META_TIMESTAMP: &str = "timestamp";
pub const META_TRIGGER: &str = "trigger";
pub const META_SIZE: &str = "size";
pub const META_METHOD: &str = "method";
pub const META_CHECKSUM: &str = "checksum";
pub const META_RECORD_COUNT: &str = "record-count";
pub const META_TABLE_COUNT: &str = "table-count";
pub const META_VALIDATED: &str = "validated";

static KEY_TIMESTAMP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"backup-(\d{4})-(\d{2})-(\d{2})T(\d{2})-(\d{2})-(\d{2})-(\d{3})Z\.sql$")
        .expect("static key pattern")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DumpMethod {
    Native,
    Logical,
}

impl DumpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            DumpMethod::Native => "native",
            DumpMethod::Logical => "logical",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "native" => Some(DumpMethod::Native),
            "logical" => Some(DumpMethod::Logical),
            _ => None,
        }
    }
}

impl fmt::Display for DumpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupTrigger {
    Manual,
    Automatic,
}

impl BackupTrigger {
    pub fn from_manual_flag(manual: bool) -> Self {
        if manual { BackupTrigger::Manual } else { BackupTrigger::Automatic }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BackupTrigger::Manual => "manual",
            BackupTrigger::Automatic => "automatic",
        }
    }
}

impl fmt::Display for BackupTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One uploaded backup object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupArtifact {
    pub key: String,
    pub file_name: String,
    pub created_at: DateTime<Utc>,
    pub size_bytes: u64,
    pub checksum: String,
    pub record_count: u64,
    pub table_count: usize,
    pub method: DumpMethod,
    pub trigger: BackupTrigger,
    pub validated: bool,
}

/// `<prefix>/backup-<timestamp>.sql`, with ':' and '.' in the timestamp
/// replaced by '-'.
pub fn artifact_key(prefix: &str, created_at: DateTime<Utc>) -> String {
    let stamp = created_at
        .to_rfc3339_opts(SecondsFormat::Millis, true)
        .replace([':', '.'], "-");
    let file_name = format!("backup-{}.sql", stamp);
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        file_name
    } else {
        format!("{}/{}", prefix, file_name)
    }
}

/// Recovers the creation time encoded in an artifact key.
pub fn parse_key_timestamp(key: &str) -> Option<DateTime<Utc>> {
    let caps = KEY_TIMESTAMP.captures(key)?;
    let num = |i: usize| caps.get(i).and_then(|m| m.as_str().parse::<u32>().ok());
    let date = NaiveDate::from_ymd_opt(num(1)? as i32, num(2)?, num(3)?)?;
    let time = date.and_hms_milli_opt(num(4)?, num(5)?, num(6)?, num(7)?)?;
    Some(time.and_utc())
}

pub fn is_artifact_key(key: &str) -> bool {
    KEY_TIMESTAMP.is_match(key)
}

pub fn file_name_of(key: &str) -> String {
    key.rsplit('/').next().unwrap_or(key).to_string()
}

impl BackupArtifact {
    /// Flattens the artifact into object metadata; the only place the typed
    /// representation becomes a string map.
    pub fn to_metadata(&self) -> HashMap<String, String> {
        HashMap::from([
            (
                META_TIMESTAMP.to_string(),
                self.created_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            ),
            (META_TRIGGER.to_string(), self.trigger.as_str().to_string()),
            (META_SIZE.to_string(), self.size_bytes.to_string()),
            (META_METHOD.to_string(), self.method.as_str().to_string()),
            (META_CHECKSUM.to_string(), self.checksum.clone()),
            (META_RECORD_COUNT.to_string(), self.record_count.to_string()),
            (META_TABLE_COUNT.to_string(), self.table_count.to_string()),
            (META_VALIDATED.to_string(), self.validated.to_string()),
        ])
    }

    /// Rebuilds an artifact from a listed object. Returns `None` for objects
    /// that are not backup artifacts. Missing metadata falls back to the key
    /// timestamp, then the object's last-modified time; a missing trigger is
    /// treated as automatic.
    pub fn from_stored(object: &StoredObject) -> Option<Self> {
        if !is_artifact_key(&object.key) {
            return None;
        }
        let meta = &object.metadata;
        let created_at = meta
            .get(META_TIMESTAMP)
            .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .or_else(|| parse_key_timestamp(&object.key))
            .or(object.last_modified)?;

        Some(BackupArtifact {
            key: object.key.clone(),
            file_name: file_name_of(&object.key),
            created_at,
            size_bytes: object.size_bytes,
            checksum: meta.get(META_CHECKSUM).cloned().unwrap_or_default(),
            record_count: meta.get(META_RECORD_COUNT).and_then(|v| v.parse().ok()).unwrap_or(0),
            table_count: meta.get(META_TABLE_COUNT).and_then(|v| v.parse().ok()).unwrap_or(0),
            method: meta
                .get(META_METHOD)
                .and_then(|v| DumpMethod::parse(v))
                .unwrap_or(DumpMethod::Native),
            trigger: match meta.get(META_TRIGGER).map(String::as_str) {
                Some("manual") => BackupTrigger::Manual,
                _ => BackupTrigger::Automatic,
            },
            validated: meta.get(META_VALIDATED).is_some_and(|v| v == "true"),
        })
    }
}
