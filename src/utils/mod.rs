use anyhow::{Context, Result};
use std::path::PathBuf;
use url::Url;
use which::which;

/// Finds the pg_dump executable in the system PATH.
pub fn find_pg_dump_executable() -> Result<PathBuf> {
    which("pg_dump").context("pg_dump executable not found in PATH. Install the PostgreSQL client tools to enable native dumps.")
}

/// Connection string safe for logs: the password is replaced.
pub fn redact_database_url(database_url: &str) -> String {
    match Url::parse(database_url) {
        Ok(mut parsed) => {
            if parsed.password().is_some() {
                let _ = parsed.set_password(Some("****"));
            }
            parsed.to_string()
        }
        Err(_) => "<unparseable database url>".to_string(),
    }
}

/// `1536` -> `1.50 KB`.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    if bytes < 1024 {
        return format!("{} B", bytes);
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.2} {}", value, UNITS[unit])
}
