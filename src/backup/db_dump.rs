// dbbackup-engine/src/backup/db_dump.rs
use async_trait::async_trait;
use chrono::Utc;
use sqlx::{PgPool, Row};
use std::io::Write;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

use super::artifact::DumpMethod;
use super::progress::{BackupStatus, RunHandle};
use crate::errors::{BackupError, DumpError};
use crate::utils::{find_pg_dump_executable, redact_database_url};

pub const NATIVE_DUMP_FOOTER: &str = "-- PostgreSQL database dump complete";
pub const LOGICAL_DUMP_FOOTER: &str = "-- Logical dump complete";
const BATCH_SIZE: i64 = 500;

/// Produces a complete plain-SQL snapshot of the source database.
#[async_trait]
pub trait SnapshotExporter: Send + Sync {
    fn method(&self) -> DumpMethod;

    /// Human-readable exporter name for logs and progress steps.
    fn name(&self) -> &str;

    async fn export(&self) -> Result<Vec<u8>, DumpError>;
}

/// Runs `pg_dump` against the configured endpoint.
pub struct NativeDumpExporter {
    database_url: String,
    binary: Option<PathBuf>,
    timeout: Duration,
    max_output_bytes: usize,
}

impl NativeDumpExporter {
    pub fn new(database_url: &str, binary: Option<PathBuf>, timeout: Duration, max_output_bytes: usize) -> Self {
        Self {
            database_url: database_url.to_string(),
            binary,
            timeout,
            max_output_bytes,
        }
    }

    fn resolve_binary(&self) -> Result<PathBuf, DumpError> {
        match &self.binary {
            Some(path) if path.exists() => Ok(path.clone()),
            Some(path) => Err(DumpError::BinaryNotFound(path.display().to_string())),
            None => find_pg_dump_executable().map_err(|e| DumpError::BinaryNotFound(e.to_string())),
        }
    }

    async fn run(&self, binary: PathBuf) -> Result<Vec<u8>, DumpError> {
        let mut child = Command::new(&binary)
            .arg("--format=plain")
            .arg("--no-owner")
            .arg("--no-privileges")
            .arg("--no-password")
            .arg(format!("--dbname={}", self.database_url))
            .env("PGCONNECT_TIMEOUT", "10")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| DumpError::Io(std::io::Error::other("stdout not captured")))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| DumpError::Io(std::io::Error::other("stderr not captured")))?;

        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = stderr.read_to_end(&mut buf).await;
            String::from_utf8_lossy(&buf).into_owned()
        });

        let mut output = Vec::new();
        (&mut stdout)
            .take(self.max_output_bytes as u64 + 1)
            .read_to_end(&mut output)
            .await?;
        if output.len() > self.max_output_bytes {
            // Dropping the child kills it.
            return Err(DumpError::OutputTooLarge {
                limit: self.max_output_bytes,
            });
        }

        let status = child.wait().await?;
        let stderr_text = stderr_task.await.unwrap_or_default();

        if !status.success() {
            return Err(DumpError::ProcessFailed {
                status: status.to_string(),
                stderr: stderr_text.trim().to_string(),
            });
        }
        if let Some(line) = stderr_text
            .lines()
            .find(|l| l.to_ascii_lowercase().contains("error"))
        {
            return Err(DumpError::Stderr(line.trim().to_string()));
        }
        if !stderr_text.trim().is_empty() {
            tracing::warn!(stderr = %stderr_text.trim(), "pg_dump wrote to stderr");
        }
        if output.is_empty() {
            return Err(DumpError::Empty);
        }
        Ok(output)
    }
}

#[async_trait]
impl SnapshotExporter for NativeDumpExporter {
    fn method(&self) -> DumpMethod {
        DumpMethod::Native
    }

    fn name(&self) -> &str {
        "pg_dump"
    }

    async fn export(&self) -> Result<Vec<u8>, DumpError> {
        let binary = self.resolve_binary()?;
        tracing::info!(
            binary = %binary.display(),
            database = %redact_database_url(&self.database_url),
            timeout_secs = self.timeout.as_secs(),
            "Running native dump"
        );
        match tokio::time::timeout(self.timeout, self.run(binary)).await {
            Ok(result) => result,
            Err(_) => Err(DumpError::Timeout(self.timeout)),
        }
    }
}

/// Serializes every table of the `public` schema through sqlx.
pub struct LogicalExporter {
    pool: PgPool,
}

impl LogicalExporter {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SnapshotExporter for LogicalExporter {
    fn method(&self) -> DumpMethod {
        DumpMethod::Logical
    }

    fn name(&self) -> &str {
        "sqlx logical export"
    }

    async fn export(&self) -> Result<Vec<u8>, DumpError> {
        tracing::info!("Running logical dump through the database pool");
        let mut out: Vec<u8> = Vec::new();

        writeln!(out, "-- PostgreSQL logical backup")?;
        writeln!(out, "-- Backup time: {}", Utc::now().to_rfc3339())?;
        writeln!(out, "BEGIN;\n")?;

        let tables = list_tables(&self.pool).await?;
        backup_schema(&self.pool, &tables, &mut out).await?;
        backup_table_data(&self.pool, &tables, &mut out).await?;
        backup_constraints(&self.pool, &tables, &mut out).await?;

        writeln!(out, "\nCOMMIT;")?;
        writeln!(out, "\n{}", LOGICAL_DUMP_FOOTER)?;
        Ok(out)
    }
}

pub(crate) async fn list_tables(pool: &PgPool) -> Result<Vec<String>, sqlx::Error> {
    let rows = sqlx::query(
        "SELECT table_name FROM information_schema.tables
         WHERE table_schema = 'public' AND table_type = 'BASE TABLE'
         ORDER BY table_name",
    )
    .fetch_all(pool)
    .await?;
    rows.iter().map(|row| row.try_get("table_name")).collect()
}

async fn backup_schema(pool: &PgPool, tables: &[String], out: &mut Vec<u8>) -> Result<(), DumpError> {
    writeln!(out, "-- PHASE 1: TABLE STRUCTURES")?;

    for table_name in tables {
        let columns = sqlx::query(
            "SELECT column_name, data_type, is_nullable, column_default
             FROM information_schema.columns
             WHERE table_schema = 'public' AND table_name = $1
             ORDER BY ordinal_position",
        )
        .bind(table_name)
        .fetch_all(pool)
        .await?;

        let mut ddl = format!("CREATE TABLE \"{}\" (\n", table_name);
        for (i, row) in columns.iter().enumerate() {
            let col_name: String = row.try_get("column_name")?;
            let data_type: String = row.try_get("data_type")?;
            let is_nullable: String = row.try_get("is_nullable")?;
            let default: Option<String> = row.try_get("column_default")?;

            if i > 0 {
                ddl.push_str(",\n");
            }
            ddl.push_str(&format!("  \"{}\" {}", col_name, data_type));
            if is_nullable == "NO" {
                ddl.push_str(" NOT NULL");
            }
            if let Some(def) = default {
                if data_type == "timestamp with time zone" && def == "now()" {
                    ddl.push_str(" DEFAULT CURRENT_TIMESTAMP");
                } else {
                    ddl.push_str(&format!(" DEFAULT {}", def));
                }
            }
        }
        ddl.push_str("\n);\n");
        writeln!(out, "{}", ddl)?;
    }

    // Sequences must exist before column defaults referencing them are used.
    writeln!(out, "\n-- PHASE 2: SEQUENCES")?;
    let sequences = sqlx::query(
        "SELECT sequence_name FROM information_schema.sequences
         WHERE sequence_schema = 'public'",
    )
    .fetch_all(pool)
    .await?;
    for seq in sequences {
        let seq_name: String = seq.try_get("sequence_name")?;
        writeln!(out, "CREATE SEQUENCE IF NOT EXISTS \"{}\";", seq_name)?;
    }
    Ok(())
}

async fn backup_table_data(pool: &PgPool, tables: &[String], out: &mut Vec<u8>) -> Result<(), DumpError> {
    writeln!(out, "\n-- PHASE 3: TABLE DATA")?;

    for table_name in tables {
        let columns = sqlx::query(
            "SELECT column_name FROM information_schema.columns
             WHERE table_schema = 'public' AND table_name = $1
             ORDER BY ordinal_position",
        )
        .bind(table_name)
        .fetch_all(pool)
        .await?;
        let column_names: Vec<String> = columns
            .iter()
            .map(|row| row.try_get::<String, _>("column_name"))
            .collect::<Result<_, _>>()?;
        let column_list = column_names
            .iter()
            .map(|c| format!("\"{}\"", c))
            .collect::<Vec<_>>()
            .join(", ");

        // Rows written are counted, not the pre-read COUNT(*), so the marker
        // always matches the INSERTs that follow it.
        let mut rows_out: Vec<String> = Vec::new();
        let mut offset = 0;
        loop {
            let query = format!(
                "SELECT * FROM \"{}\" ORDER BY 1 LIMIT {} OFFSET {}",
                table_name, BATCH_SIZE, offset
            );
            let rows = sqlx::query(&query).fetch_all(pool).await?;
            if rows.is_empty() {
                break;
            }
            for row in &rows {
                let values = column_names
                    .iter()
                    .map(|col| serialize_value(row, col))
                    .collect::<Result<Vec<_>, _>>()?;
                rows_out.push(format!(
                    "INSERT INTO \"{}\" ({}) VALUES ({});",
                    table_name,
                    column_list,
                    values.join(", ")
                ));
            }
            if (rows.len() as i64) < BATCH_SIZE {
                break;
            }
            offset += BATCH_SIZE;
        }

        writeln!(out, "\n-- Data for table: {}", table_name)?;
        writeln!(out, "-- Total rows: {}", rows_out.len())?;
        for line in rows_out {
            writeln!(out, "{}", line)?;
        }
    }
    Ok(())
}

async fn backup_constraints(pool: &PgPool, tables: &[String], out: &mut Vec<u8>) -> Result<(), DumpError> {
    writeln!(out, "\n-- PHASE 4: CONSTRAINTS AND INDEXES")?;

    for table_name in tables {
        // Primary keys first so foreign keys can reference them.
        for contype in ["p", "u", "f"] {
            let defs = sqlx::query(
                "SELECT pg_get_constraintdef(c.oid) AS def
                 FROM pg_constraint c
                 JOIN pg_class t ON t.oid = c.conrelid
                 JOIN pg_namespace n ON n.oid = t.relnamespace
                 WHERE n.nspname = 'public' AND t.relname = $1 AND c.contype::text = $2",
            )
            .bind(table_name)
            .bind(contype)
            .fetch_all(pool)
            .await?;
            for row in defs {
                let def: String = row.try_get("def")?;
                writeln!(out, "ALTER TABLE \"{}\" ADD {};", table_name, def)?;
            }
        }

        let indexes = sqlx::query(
            "SELECT pg_get_indexdef(i.indexrelid) AS def
             FROM pg_index i
             JOIN pg_class t ON t.oid = i.indrelid
             JOIN pg_namespace n ON n.oid = t.relnamespace
             WHERE n.nspname = 'public' AND t.relname = $1
               AND NOT i.indisprimary AND NOT i.indisunique",
        )
        .bind(table_name)
        .fetch_all(pool)
        .await?;
        for row in indexes {
            let def: String = row.try_get("def")?;
            writeln!(out, "{};", def)?;
        }
    }

    writeln!(out, "\n-- PHASE 5: VIEWS")?;
    let views = sqlx::query("SELECT viewname, definition FROM pg_views WHERE schemaname = 'public'")
        .fetch_all(pool)
        .await?;
    for row in views {
        let name: String = row.try_get("viewname")?;
        let def: String = row.try_get("definition")?;
        writeln!(out, "CREATE VIEW \"{}\" AS {}", name, def.trim())?;
    }
    Ok(())
}

/// Quotes a text value. Values with line breaks or backslashes become
/// escape-string literals so that one row stays on one line.
fn quote_literal(v: &str) -> String {
    if !v.contains(['\\', '\n', '\r']) {
        return format!("'{}'", v.replace('\'', "''"));
    }
    let mut escaped = String::with_capacity(v.len() + 8);
    for c in v.chars() {
        match c {
            '\\' => escaped.push_str("\\\\"),
            '\n' => escaped.push_str("\\n"),
            '\r' => escaped.push_str("\\r"),
            '\'' => escaped.push_str("''"),
            other => escaped.push(other),
        }
    }
    format!("E'{}'", escaped)
}

fn null_or<T, F: FnOnce(T) -> String>(value: Option<T>, render: F) -> String {
    value.map(render).unwrap_or_else(|| "NULL".to_string())
}

/// Renders one column of a row as a SQL literal.
fn serialize_value(row: &sqlx::postgres::PgRow, column: &str) -> Result<String, DumpError> {
    if let Ok(val) = row.try_get::<Option<String>, _>(column) {
        return Ok(null_or(val, |v| quote_literal(&v)));
    }
    if let Ok(val) = row.try_get::<Option<Vec<String>>, _>(column) {
        return Ok(null_or(val, |v| {
            let elements = v.iter().map(|s| quote_literal(s)).collect::<Vec<_>>().join(",");
            format!("ARRAY[{}]::text[]", elements)
        }));
    }
    if let Ok(val) = row.try_get::<Option<uuid::Uuid>, _>(column) {
        return Ok(null_or(val, |v| format!("'{}'", v)));
    }
    if let Ok(val) = row.try_get::<Option<i16>, _>(column) {
        return Ok(null_or(val, |v| v.to_string()));
    }
    if let Ok(val) = row.try_get::<Option<i32>, _>(column) {
        return Ok(null_or(val, |v| v.to_string()));
    }
    if let Ok(val) = row.try_get::<Option<i64>, _>(column) {
        return Ok(null_or(val, |v| v.to_string()));
    }
    if let Ok(val) = row.try_get::<Option<f32>, _>(column) {
        return Ok(null_or(val, |v| v.to_string()));
    }
    if let Ok(val) = row.try_get::<Option<f64>, _>(column) {
        return Ok(null_or(val, |v| v.to_string()));
    }
    if let Ok(val) = row.try_get::<Option<sqlx::types::BigDecimal>, _>(column) {
        return Ok(null_or(val, |v| v.to_string()));
    }
    if let Ok(val) = row.try_get::<Option<bool>, _>(column) {
        return Ok(null_or(val, |v| v.to_string()));
    }
    if let Ok(val) = row.try_get::<Option<serde_json::Value>, _>(column) {
        return Ok(null_or(val, |v| quote_literal(&v.to_string())));
    }
    if let Ok(val) = row.try_get::<Option<chrono::DateTime<Utc>>, _>(column) {
        return Ok(null_or(val, |v| format!("'{}'", v.to_rfc3339())));
    }
    if let Ok(val) = row.try_get::<Option<chrono::NaiveDateTime>, _>(column) {
        return Ok(null_or(val, |v| format!("'{}'", v)));
    }
    if let Ok(val) = row.try_get::<Option<chrono::NaiveDate>, _>(column) {
        return Ok(null_or(val, |v| format!("'{}'", v)));
    }
    if let Ok(val) = row.try_get::<Option<chrono::NaiveTime>, _>(column) {
        return Ok(null_or(val, |v| format!("'{}'", v)));
    }
    if let Ok(val) = row.try_get::<Option<Vec<u8>>, _>(column) {
        return Ok(null_or(val, |v| format!("'\\x{}'", hex::encode(v))));
    }
    Err(DumpError::Database(sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: format!("unsupported data type for column {}", column).into(),
    }))
}

/// Native exporter first, logical exporter on any failure.
pub struct DumpChain {
    primary: Arc<dyn SnapshotExporter>,
    fallback: Arc<dyn SnapshotExporter>,
}

impl DumpChain {
    pub fn new(primary: Arc<dyn SnapshotExporter>, fallback: Arc<dyn SnapshotExporter>) -> Self {
        Self { primary, fallback }
    }

    /// Returns the snapshot and the method that produced it. Only a complete
    /// snapshot is ever returned.
    pub async fn produce_snapshot(&self, run: &RunHandle) -> Result<(Vec<u8>, DumpMethod), BackupError> {
        run.advance(BackupStatus::Creating, 10, "Creating database snapshot").await;

        run.advance(
            BackupStatus::Creating,
            20,
            &format!("Running {}", self.primary.name()),
        )
        .await;
        let native_error = match self.primary.export().await {
            Ok(bytes) => {
                run.advance(BackupStatus::Creating, 60, "Snapshot created").await;
                return Ok((bytes, self.primary.method()));
            }
            Err(e) => e,
        };

        tracing::warn!(
            run_id = %run.run_id(),
            error = %native_error,
            primary = self.primary.name(),
            fallback = self.fallback.name(),
            "Primary exporter failed, falling back"
        );
        run.advance(
            BackupStatus::Creating,
            40,
            &format!("Falling back to {}", self.fallback.name()),
        )
        .await;

        match self.fallback.export().await {
            Ok(bytes) => {
                run.advance(BackupStatus::Creating, 60, "Snapshot created").await;
                Ok((bytes, self.fallback.method()))
            }
            Err(logical_error) => Err(BackupError::Dump {
                native: native_error.to_string(),
                logical: logical_error.to_string(),
            }),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::backup::artifact::BackupTrigger;
    use crate::backup::progress::{ConcurrentTriggerPolicy, ProgressTracker};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Exporter returning a canned result.
    pub(crate) struct FakeExporter {
        method: DumpMethod,
        result: Result<Vec<u8>, String>,
        pub(crate) calls: AtomicUsize,
    }

    impl FakeExporter {
        pub(crate) fn ok(method: DumpMethod, bytes: &[u8]) -> Arc<Self> {
            Arc::new(Self {
                method,
                result: Ok(bytes.to_vec()),
                calls: AtomicUsize::new(0),
            })
        }

        pub(crate) fn failing(method: DumpMethod, message: &str) -> Arc<Self> {
            Arc::new(Self {
                method,
                result: Err(message.to_string()),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl SnapshotExporter for FakeExporter {
        fn method(&self) -> DumpMethod {
            self.method
        }

        fn name(&self) -> &str {
            match self.method {
                DumpMethod::Native => "fake native",
                DumpMethod::Logical => "fake logical",
            }
        }

        async fn export(&self) -> Result<Vec<u8>, DumpError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.result {
                Ok(bytes) => Ok(bytes.clone()),
                Err(message) => Err(DumpError::BinaryNotFound(message.clone())),
            }
        }
    }

    async fn run_handle() -> (ProgressTracker, RunHandle) {
        let tracker = ProgressTracker::new(ConcurrentTriggerPolicy::Overwrite, Duration::from_secs(60), 1_000);
        let run = tracker.begin(BackupTrigger::Automatic).await.unwrap();
        (tracker, run)
    }

    #[tokio::test]
    async fn test_native_result_used_when_available() -> anyhow::Result<()> {
        let native = FakeExporter::ok(DumpMethod::Native, b"native dump");
        let logical = FakeExporter::ok(DumpMethod::Logical, b"logical dump");
        let chain = DumpChain::new(native.clone(), logical.clone());
        let (tracker, run) = run_handle().await;

        let (bytes, method) = chain.produce_snapshot(&run).await?;
        assert_eq!(method, DumpMethod::Native);
        assert_eq!(bytes, b"native dump");
        assert_eq!(logical.calls.load(Ordering::SeqCst), 0);
        assert_eq!(tracker.current().await.progress_percent, 60);
        Ok(())
    }

    #[tokio::test]
    async fn test_falls_back_when_native_unavailable() -> anyhow::Result<()> {
        let native = FakeExporter::failing(DumpMethod::Native, "pg_dump");
        let logical = FakeExporter::ok(DumpMethod::Logical, b"logical dump");
        let chain = DumpChain::new(native, logical.clone());
        let (_tracker, run) = run_handle().await;

        let (bytes, method) = chain.produce_snapshot(&run).await?;
        assert_eq!(method, DumpMethod::Logical);
        assert!(!bytes.is_empty());
        assert_eq!(logical.calls.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_both_failures_are_reported() {
        let chain = DumpChain::new(
            FakeExporter::failing(DumpMethod::Native, "pg_dump missing"),
            FakeExporter::failing(DumpMethod::Logical, "pool exhausted"),
        );
        let (_tracker, run) = run_handle().await;
        match chain.produce_snapshot(&run).await {
            Err(BackupError::Dump { native, logical }) => {
                assert!(native.contains("pg_dump missing"));
                assert!(logical.contains("pool exhausted"));
            }
            other => panic!("expected dump error, got {:?}", other.map(|(_, m)| m)),
        }
    }

    #[tokio::test]
    async fn test_progress_step_names_the_running_exporter() -> anyhow::Result<()> {
        let chain = DumpChain::new(
            FakeExporter::failing(DumpMethod::Native, "pg_dump missing"),
            FakeExporter::failing(DumpMethod::Logical, "pool exhausted"),
        );
        let (tracker, run) = run_handle().await;
        assert!(chain.produce_snapshot(&run).await.is_err());
        assert_eq!(tracker.current().await.current_step, "Falling back to fake logical");

        let native = NativeDumpExporter::new("postgres://localhost/app", None, Duration::from_secs(1), 1);
        assert_eq!(native.name(), "pg_dump");
        assert_eq!(native.method(), DumpMethod::Native);
        Ok(())
    }

    #[test]
    fn test_plain_text_uses_standard_literal() {
        assert_eq!(quote_literal("O'Brien"), "'O''Brien'");
        assert_eq!(quote_literal(""), "''");
    }

    #[test]
    fn test_multiline_text_stays_on_one_line() {
        let literal = quote_literal("line one\nit's line two\r\nC:\\temp");
        assert_eq!(literal, "E'line one\\nit''s line two\\r\\nC:\\\\temp'");
        assert!(!literal.contains('\n') && !literal.contains('\r'));
    }

    #[tokio::test]
    async fn test_missing_binary_is_reported() {
        let exporter = NativeDumpExporter::new(
            "postgres://localhost/app",
            Some(PathBuf::from("/nonexistent/bin/pg_dump")),
            Duration::from_secs(5),
            1024,
        );
        assert!(matches!(exporter.export().await, Err(DumpError::BinaryNotFound(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_native_captures_stdout() -> anyhow::Result<()> {
        // `echo` stands in for pg_dump: it prints its arguments and exits 0.
        let exporter = NativeDumpExporter::new(
            "postgres://localhost/app",
            Some(PathBuf::from("/bin/echo")),
            Duration::from_secs(5),
            4096,
        );
        let output = exporter.export().await?;
        let text = String::from_utf8(output)?;
        assert!(text.contains("--dbname=postgres://localhost/app"));
        Ok(())
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_native_output_cap() {
        let exporter = NativeDumpExporter::new(
            "postgres://localhost/app",
            Some(PathBuf::from("/bin/echo")),
            Duration::from_secs(5),
            8,
        );
        assert!(matches!(
            exporter.export().await,
            Err(DumpError::OutputTooLarge { limit: 8 })
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_native_nonzero_exit() {
        let exporter = NativeDumpExporter::new(
            "postgres://localhost/app",
            Some(PathBuf::from("/bin/false")),
            Duration::from_secs(5),
            4096,
        );
        assert!(matches!(exporter.export().await, Err(DumpError::ProcessFailed { .. })));
    }
}
