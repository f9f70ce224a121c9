// dbbackup-engine/src/backup/integrity.rs
use async_trait::async_trait;
use regex::Regex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, LazyLock};

use super::db_dump::{LOGICAL_DUMP_FOOTER, NATIVE_DUMP_FOOTER, list_tables};

static CREATE_TABLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?im)^\s*CREATE\s+(?:UNLOGGED\s+)?TABLE\s+(?:IF\s+NOT\s+EXISTS\s+)?((?:"[^"]+"|[\w$]+)(?:\.(?:"[^"]+"|[\w$]+))?)"#,
    )
    .expect("static create table pattern")
});
static COPY_START: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^COPY\s+(\S+).*\bFROM\s+stdin;\s*$").expect("static copy pattern")
});
static INSERT_INTO: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^INSERT INTO\s+((?:"[^"]+"|[\w$]+)(?:\.(?:"[^"]+"|[\w$]+))?)"#)
        .expect("static insert pattern")
});
static TOTAL_ROWS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^-- Total rows: (\d+)\s*$").expect("static total rows pattern"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IntegrityMode {
    Simplified,
    Full,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrityReport {
    pub is_valid: bool,
    pub checksum: String,
    pub record_count: u64,
    pub tables: Vec<String>,
    pub validation_errors: Vec<String>,
    pub mode: IntegrityMode,
}

/// What a dump says about itself.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DumpStructure {
    pub tables: Vec<String>,
    pub counted_records: u64,
    /// Data rows per normalized table name.
    pub records_by_table: BTreeMap<String, u64>,
    pub declared_records: Option<u64>,
    pub has_footer: bool,
    pub unterminated_copy: Option<String>,
}

impl DumpStructure {
    /// Rows belonging to `public` tables, the only ones the source
    /// inspector counts.
    pub fn public_records(&self) -> u64 {
        self.records_by_table
            .iter()
            .filter(|(table, _)| !table.contains('.'))
            .map(|(_, n)| n)
            .sum()
    }

    fn count_record(&mut self, table: &str) {
        self.counted_records += 1;
        *self.records_by_table.entry(table.to_string()).or_insert(0) += 1;
    }
}

/// Hex-encoded SHA-256 of the whole snapshot.
pub fn checksum(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// `public."Users"` and `"Users"` both become `Users`.
fn normalize_table_name(raw: &str) -> String {
    let unquoted: Vec<String> = raw.split('.').map(|p| p.trim_matches('"').to_string()).collect();
    match unquoted.as_slice() {
        [schema, table] if schema == "public" => table.clone(),
        _ => unquoted.join("."),
    }
}

pub fn parse_dump(text: &str) -> DumpStructure {
    let mut structure = DumpStructure::default();
    let mut tables = BTreeSet::new();
    for caps in CREATE_TABLE.captures_iter(text) {
        tables.insert(normalize_table_name(&caps[1]));
    }
    structure.tables = tables.into_iter().collect();

    let mut in_copy: Option<String> = None;
    for line in text.lines() {
        if let Some(table) = &in_copy {
            if line == "\\." {
                in_copy = None;
            } else {
                structure.count_record(table);
            }
            continue;
        }
        if let Some(caps) = INSERT_INTO.captures(line) {
            structure.count_record(&normalize_table_name(&caps[1]));
        } else if let Some(caps) = COPY_START.captures(line) {
            in_copy = Some(normalize_table_name(&caps[1]));
        } else if let Some(caps) = TOTAL_ROWS.captures(line) {
            let declared: u64 = caps[1].parse().unwrap_or(0);
            *structure.declared_records.get_or_insert(0) += declared;
        } else if line.starts_with(NATIVE_DUMP_FOOTER) || line.starts_with(LOGICAL_DUMP_FOOTER) {
            structure.has_footer = true;
        }
    }
    structure.unterminated_copy = in_copy;
    structure
}

fn beyond_tolerance(expected: u64, actual: u64, tolerance: f64) -> bool {
    let diff = expected.abs_diff(actual) as f64;
    diff > tolerance * expected.max(actual).max(1) as f64
}

/// Row counts of the live source, for full verification.
#[async_trait]
pub trait SourceInspector: Send + Sync {
    async fn table_row_counts(&self) -> Result<Vec<(String, u64)>, sqlx::Error>;
}

pub struct PgSourceInspector {
    pool: PgPool,
}

impl PgSourceInspector {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SourceInspector for PgSourceInspector {
    async fn table_row_counts(&self) -> Result<Vec<(String, u64)>, sqlx::Error> {
        let tables = list_tables(&self.pool).await?;
        let mut counts = Vec::with_capacity(tables.len());
        for table in tables {
            let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM \"{}\"", table))
                .fetch_one(&self.pool)
                .await?;
            counts.push((table, count.max(0) as u64));
        }
        Ok(counts)
    }
}

pub struct IntegrityVerifier {
    inspector: Option<Arc<dyn SourceInspector>>,
    tolerance: f64,
}

impl IntegrityVerifier {
    pub fn new(inspector: Option<Arc<dyn SourceInspector>>, tolerance: f64) -> Self {
        Self { inspector, tolerance }
    }

    /// Validates a snapshot. `simplified` skips every database round-trip.
    pub async fn verify(&self, bytes: &[u8], simplified: bool) -> IntegrityReport {
        let mode = if simplified || self.inspector.is_none() {
            if !simplified {
                tracing::warn!("Full integrity check requested without a source inspector, using simplified mode");
            }
            IntegrityMode::Simplified
        } else {
            IntegrityMode::Full
        };

        let mut report = IntegrityReport {
            is_valid: false,
            checksum: checksum(bytes),
            record_count: 0,
            tables: Vec::new(),
            validation_errors: Vec::new(),
            mode,
        };

        if bytes.is_empty() {
            report.validation_errors.push("snapshot is empty".to_string());
            return report;
        }
        let text = match std::str::from_utf8(bytes) {
            Ok(text) => text,
            Err(e) => {
                report.validation_errors.push(format!("snapshot is not valid UTF-8: {}", e));
                return report;
            }
        };

        let structure = parse_dump(text);
        report.record_count = structure.counted_records;
        report.tables = structure.tables.clone();

        if structure.tables.is_empty() {
            report.validation_errors.push("snapshot contains no tables".to_string());
        }
        if !structure.has_footer {
            report
                .validation_errors
                .push("snapshot is incomplete: completion marker missing".to_string());
        }
        if let Some(table) = &structure.unterminated_copy {
            report
                .validation_errors
                .push(format!("snapshot is incomplete: unterminated COPY block for {}", table));
        }
        if let Some(declared) = structure.declared_records {
            if beyond_tolerance(declared, structure.counted_records, self.tolerance) {
                report.validation_errors.push(format!(
                    "record count mismatch: dump declares {} rows but contains {}",
                    declared, structure.counted_records
                ));
            }
        }

        if let (IntegrityMode::Full, Some(inspector)) = (mode, &self.inspector) {
            self.compare_with_source(inspector.as_ref(), &structure, &mut report).await;
        }

        report.is_valid = report.validation_errors.is_empty();
        tracing::info!(
            valid = report.is_valid,
            mode = ?report.mode,
            tables = report.tables.len(),
            records = report.record_count,
            checksum = %report.checksum,
            "Snapshot verified"
        );
        report
    }

    async fn compare_with_source(
        &self,
        inspector: &dyn SourceInspector,
        structure: &DumpStructure,
        report: &mut IntegrityReport,
    ) {
        let counts = match inspector.table_row_counts().await {
            Ok(counts) => counts,
            Err(e) => {
                report
                    .validation_errors
                    .push(format!("could not query source database: {}", e));
                return;
            }
        };

        let dumped: BTreeSet<&str> = structure.tables.iter().map(String::as_str).collect();
        for (table, _) in &counts {
            if !dumped.contains(table.as_str()) {
                report
                    .validation_errors
                    .push(format!("table {} is missing from the snapshot", table));
            }
        }

        let source_total: u64 = counts.iter().map(|(_, n)| n).sum();
        let dumped_total = structure.public_records();
        if beyond_tolerance(source_total, dumped_total, self.tolerance) {
            report.validation_errors.push(format!(
                "record count mismatch: source has {} rows but snapshot contains {} in public tables",
                source_total, dumped_total
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NATIVE_SAMPLE: &str = "\
--
-- PostgreSQL database dump
--
SET statement_timeout = 0;

CREATE TABLE public.users (
    id integer NOT NULL,
    email text
);

CREATE TABLE public.\"Orders\" (
    id integer NOT NULL
);

COPY public.users (id, email) FROM stdin;
1\ta@example.com
2\tb@example.com
\\.

COPY public.\"Orders\" (id) FROM stdin;
10
\\.

--
-- PostgreSQL database dump complete
--
";

    fn logical_sample() -> String {
        format!(
            "-- PostgreSQL logical backup\nBEGIN;\n\nCREATE TABLE \"users\" (\n  \"id\" integer NOT NULL\n);\n\n\
             -- Data for table: users\n-- Total rows: 2\n\
             INSERT INTO \"users\" (\"id\") VALUES (1);\nINSERT INTO \"users\" (\"id\") VALUES (2);\n\nCOMMIT;\n\n{}\n",
            LOGICAL_DUMP_FOOTER
        )
    }

    struct FixedInspector(Result<Vec<(String, u64)>, String>);

    #[async_trait]
    impl SourceInspector for FixedInspector {
        async fn table_row_counts(&self) -> Result<Vec<(String, u64)>, sqlx::Error> {
            self.0.clone().map_err(sqlx::Error::Protocol)
        }
    }

    fn verifier_with(counts: Vec<(&str, u64)>) -> IntegrityVerifier {
        let counts = counts.into_iter().map(|(t, n)| (t.to_string(), n)).collect();
        IntegrityVerifier::new(Some(Arc::new(FixedInspector(Ok(counts)))), 0.01)
    }

    #[test]
    fn test_parse_native_dump() {
        let structure = parse_dump(NATIVE_SAMPLE);
        assert_eq!(structure.tables, vec!["Orders".to_string(), "users".to_string()]);
        assert_eq!(structure.counted_records, 3);
        assert!(structure.has_footer);
        assert_eq!(structure.declared_records, None);
        assert_eq!(structure.unterminated_copy, None);
    }

    #[test]
    fn test_parse_logical_dump() {
        let structure = parse_dump(&logical_sample());
        assert_eq!(structure.tables, vec!["users".to_string()]);
        assert_eq!(structure.counted_records, 2);
        assert_eq!(structure.declared_records, Some(2));
        assert!(structure.has_footer);
    }

    #[test]
    fn test_checksum_is_sha256_hex() {
        assert_eq!(
            checksum(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn test_simplified_accepts_complete_dumps() {
        let verifier = IntegrityVerifier::new(None, 0.01);
        let report = verifier.verify(NATIVE_SAMPLE.as_bytes(), true).await;
        assert!(report.is_valid, "{:?}", report.validation_errors);
        assert_eq!(report.record_count, 3);
        assert_eq!(report.mode, IntegrityMode::Simplified);

        let report = verifier.verify(logical_sample().as_bytes(), true).await;
        assert!(report.is_valid, "{:?}", report.validation_errors);
    }

    #[tokio::test]
    async fn test_truncated_snapshot_is_invalid() {
        let verifier = IntegrityVerifier::new(None, 0.01);
        let cut = &NATIVE_SAMPLE[..NATIVE_SAMPLE.find("2\tb@example").unwrap()];
        let report = verifier.verify(cut.as_bytes(), true).await;
        assert!(!report.is_valid);
        assert!(report.validation_errors.iter().any(|e| e.contains("completion marker")));
        assert!(report.validation_errors.iter().any(|e| e.contains("unterminated COPY")));
    }

    #[tokio::test]
    async fn test_empty_and_binary_payloads_are_invalid() {
        let verifier = IntegrityVerifier::new(None, 0.01);
        let report = verifier.verify(b"", true).await;
        assert!(!report.is_valid);
        assert_eq!(report.validation_errors, vec!["snapshot is empty".to_string()]);

        let report = verifier.verify(&[0xff, 0xfe, 0x00], true).await;
        assert!(!report.is_valid);
        assert!(report.validation_errors[0].contains("UTF-8"));
    }

    #[tokio::test]
    async fn test_dump_without_tables_is_invalid() {
        let verifier = IntegrityVerifier::new(None, 0.01);
        let text = format!("BEGIN;\nCOMMIT;\n{}\n", LOGICAL_DUMP_FOOTER);
        let report = verifier.verify(text.as_bytes(), true).await;
        assert!(!report.is_valid);
        assert_eq!(report.validation_errors, vec!["snapshot contains no tables".to_string()]);
    }

    #[tokio::test]
    async fn test_declared_count_mismatch_is_invalid() {
        let verifier = IntegrityVerifier::new(None, 0.0);
        let text = logical_sample().replace("-- Total rows: 2", "-- Total rows: 5");
        let report = verifier.verify(text.as_bytes(), true).await;
        assert!(!report.is_valid);
        assert!(report.validation_errors[0].contains("declares 5 rows but contains 2"));
    }

    #[tokio::test]
    async fn test_full_mode_compares_with_source() {
        let verifier = verifier_with(vec![("users", 2), ("Orders", 1)]);
        let report = verifier.verify(NATIVE_SAMPLE.as_bytes(), false).await;
        assert_eq!(report.mode, IntegrityMode::Full);
        assert!(report.is_valid, "{:?}", report.validation_errors);

        let verifier = verifier_with(vec![("users", 2), ("Orders", 1), ("audit_log", 40)]);
        let report = verifier.verify(NATIVE_SAMPLE.as_bytes(), false).await;
        assert!(!report.is_valid);
        assert!(report.validation_errors.iter().any(|e| e.contains("audit_log is missing")));
        assert!(report.validation_errors.iter().any(|e| e.contains("source has 43 rows")));
    }

    #[tokio::test]
    async fn test_full_mode_ignores_rows_outside_public_schema() {
        let text = NATIVE_SAMPLE.replace(
            "--\n-- PostgreSQL database dump complete",
            "COPY auth.sessions (id) FROM stdin;\n1\n2\n3\n4\n5\n\\.\n\n--\n-- PostgreSQL database dump complete",
        );
        let structure = parse_dump(&text);
        assert_eq!(structure.counted_records, 8);
        assert_eq!(structure.public_records(), 3);
        assert_eq!(structure.records_by_table.get("auth.sessions"), Some(&5));

        let verifier = verifier_with(vec![("users", 2), ("Orders", 1)]);
        let report = verifier.verify(text.as_bytes(), false).await;
        assert!(report.is_valid, "{:?}", report.validation_errors);
        assert_eq!(report.record_count, 8);
    }

    #[tokio::test]
    async fn test_multiline_values_from_logical_export_count_once() {
        let text = format!(
            "CREATE TABLE \"notes\" (\"body\" text);\n-- Total rows: 2\n\
             INSERT INTO \"notes\" (\"body\") VALUES (E'first line\\nINSERT INTO x VALUES (1);\\nlast');\n\
             INSERT INTO \"notes\" (\"body\") VALUES ('plain');\n{}\n",
            LOGICAL_DUMP_FOOTER
        );
        let structure = parse_dump(&text);
        assert_eq!(structure.counted_records, 2);
        assert_eq!(structure.records_by_table.get("notes"), Some(&2));

        let report = verifier_with(vec![("notes", 2)]).verify(text.as_bytes(), false).await;
        assert!(report.is_valid, "{:?}", report.validation_errors);
    }

    #[tokio::test]
    async fn test_full_mode_tolerates_small_drift() {
        let many_rows: String = (0..200).map(|i| format!("INSERT INTO \"users\" (\"id\") VALUES ({});\n", i)).collect();
        let text = format!("CREATE TABLE \"users\" (\"id\" integer);\n{}{}\n", many_rows, LOGICAL_DUMP_FOOTER);
        let verifier = verifier_with(vec![("users", 201)]);
        let report = verifier.verify(text.as_bytes(), false).await;
        assert!(report.is_valid, "{:?}", report.validation_errors);
    }

    #[tokio::test]
    async fn test_full_mode_inspector_failure_is_invalid() {
        let verifier = IntegrityVerifier::new(
            Some(Arc::new(FixedInspector(Err("too many connections".into())))),
            0.01,
        );
        let report = verifier.verify(NATIVE_SAMPLE.as_bytes(), false).await;
        assert!(!report.is_valid);
        assert!(report.validation_errors[0].contains("could not query source database"));
    }
}
