//! SQL*Loader invocation.
//!
//! Each load runs in a private scratch directory holding the control file, a
//! parameter file carrying the credentials (so they never appear on the
//! command line) and the loader's log and bad files.

use std::path::Path;

use tokio::process::Command;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::core::ImportBatchArgs;
use crate::error::{MigrateError, Result};

/// Runs `sqlldr` against one database.
#[derive(Clone)]
pub(crate) struct SqlLoader {
    sqlldr_path: String,
    user: String,
    password: String,
    connect_identifier: String,
}

impl std::fmt::Debug for SqlLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlLoader")
            .field("sqlldr_path", &self.sqlldr_path)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("connect_identifier", &self.connect_identifier)
            .finish()
    }
}

impl SqlLoader {
    pub fn new(
        sqlldr_path: impl Into<String>,
        user: impl Into<String>,
        password: impl Into<String>,
        connect_identifier: impl Into<String>,
    ) -> Self {
        Self {
            sqlldr_path: sqlldr_path.into(),
            user: user.into(),
            password: password.into(),
            connect_identifier: connect_identifier.into(),
        }
    }

    fn parfile(&self, control: &Path, log: &Path, bad: &Path) -> String {
        format!(
            "userid={}/\"{}\"@{}\ncontrol={}\nlog={}\nbad={}\nerrors=0\n",
            self.user,
            self.password.replace('"', "\\\""),
            self.connect_identifier,
            control.display(),
            log.display(),
            bad.display()
        )
    }

    /// Load the batch's file with `control_file`, returning rows loaded.
    pub async fn load(&self, control_file: &str, args: &ImportBatchArgs) -> Result<u64> {
        let table = args.table_name.qualified();
        let dir = std::env::temp_dir().join(format!("live-migrate-{}", Uuid::new_v4()));
        tokio::fs::create_dir_all(&dir).await?;
        let result = self.run(&dir, control_file, &table).await;
        if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
            warn!("Could not remove loader scratch directory {}: {}", dir.display(), e);
        }
        result
    }

    async fn run(&self, dir: &Path, control_file: &str, table: &str) -> Result<u64> {
        let control = dir.join("load.ctl");
        let log = dir.join("load.log");
        let bad = dir.join("load.bad");
        let parfile = dir.join("load.par");

        tokio::fs::write(&control, control_file).await?;
        write_private(&parfile, &self.parfile(&control, &log, &bad)).await?;

        debug!("Running {} for {}", self.sqlldr_path, table);
        let output = Command::new(&self.sqlldr_path)
            .arg(format!("parfile={}", parfile.display()))
            .output()
            .await
            .map_err(|e| MigrateError::BulkLoad {
                table: table.to_string(),
                exit_code: None,
                message: format!("cannot start {}: {}", self.sqlldr_path, e),
            })?;

        let log_text = tokio::fs::read_to_string(&log).await.unwrap_or_default();
        if output.status.success() {
            return loaded_row_count(&log_text).ok_or_else(|| MigrateError::BulkLoad {
                table: table.to_string(),
                exit_code: Some(0),
                message: "loader log has no row count".into(),
            });
        }

        let mut message = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let errors = error_lines(&log_text);
        if !errors.is_empty() {
            message.push('\n');
            message.push_str(&errors.join("\n"));
        }
        Err(MigrateError::BulkLoad {
            table: table.to_string(),
            exit_code: output.status.code(),
            message,
        })
    }
}

#[cfg(unix)]
async fn write_private(path: &Path, content: &str) -> Result<()> {
    use tokio::io::AsyncWriteExt;

    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)
        .await?;
    file.write_all(content.as_bytes()).await?;
    file.flush().await?;
    Ok(())
}

#[cfg(not(unix))]
async fn write_private(path: &Path, content: &str) -> Result<()> {
    tokio::fs::write(path, content).await?;
    Ok(())
}

/// Rows reported by a `N Rows successfully loaded.` line of a loader log.
pub(crate) fn loaded_row_count(log: &str) -> Option<u64> {
    log.lines().find_map(|line| {
        let line = line.trim();
        let rest = line
            .strip_suffix("Rows successfully loaded.")
            .or_else(|| line.strip_suffix("Row successfully loaded."))?;
        rest.trim().parse().ok()
    })
}

fn error_lines(log: &str) -> Vec<&str> {
    log.lines()
        .map(str::trim)
        .filter(|l| l.starts_with("ORA-") || l.starts_with("SQL*Loader-") || l.starts_with("Record "))
        .take(10)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    const LOG: &str = "\
SQL*Loader: Release 19.0.0.0.0 - Production on Tue Oct 14 10:12:01 2026

Table SALES.ORDERS:
  1000 Rows successfully loaded.
  0 Rows not loaded due to data errors.
";

    #[test]
    fn test_row_count_from_log() {
        assert_eq!(loaded_row_count(LOG), Some(1000));
        assert_eq!(loaded_row_count("  1 Row successfully loaded.\n"), Some(1));
        assert_eq!(loaded_row_count("nothing here"), None);
    }

    #[test]
    fn test_error_lines() {
        let log = "Record 3: Rejected - Error on table SALES.ORDERS.\nORA-01722: invalid number\n";
        assert_eq!(
            error_lines(log),
            vec!["Record 3: Rejected - Error on table SALES.ORDERS.", "ORA-01722: invalid number"]
        );
    }

    #[test]
    fn test_parfile_quotes_password() {
        let loader = SqlLoader::new("sqlldr", "scott", "ti\"ger", "//ora:1521/ORCL");
        let dir = Path::new("/tmp/x");
        let parfile =
            loader.parfile(&dir.join("load.ctl"), &dir.join("load.log"), &dir.join("load.bad"));
        assert!(parfile.starts_with("userid=scott/\"ti\\\"ger\"@//ora:1521/ORCL\n"));
        assert!(parfile.contains("control=/tmp/x/load.ctl\n"));
        assert!(parfile.ends_with("errors=0\n"));
        assert!(!format!("{:?}", loader).contains("tiger"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_parfile_is_private() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("load.par");
        write_private(&path, "userid=a/b@c\n").await.unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn test_missing_binary_is_bulk_load_error() {
        use crate::core::{FileFormat, TableName};
        let loader = SqlLoader::new("/nonexistent/sqlldr", "scott", "tiger", "ORCL");
        let args = ImportBatchArgs {
            file_path: PathBuf::from("/export/data/ORDERS_data.csv"),
            table_name: TableName::parse("SALES.ORDERS"),
            columns: vec![],
            file_format: FileFormat::Csv,
            has_header: false,
            delimiter: ",".into(),
            quote_char: Some('"'),
            escape_char: None,
            null_string: "null".into(),
            rows_per_transaction: 0,
        };
        let err = loader.load("LOAD DATA\n", &args).await.unwrap_err();
        assert!(matches!(err, MigrateError::BulkLoad { exit_code: None, .. }));
    }
}
