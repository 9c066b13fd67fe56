//! Oracle target engine over ODBC.
//!
//! odbc-api is blocking, so every call runs on the blocking thread pool with
//! the connection moved in and handed back. A semaphore bounds the number of
//! connections in use; a finished transaction's connection goes back to an
//! idle list for the next `begin`. Snapshot batches are loaded by SQL*Loader.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use async_trait::async_trait;
use odbc_api::buffers::TextRowSet;
use odbc_api::{Connection, ConnectionOptions, Cursor, Environment};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use super::dialect::OracleDialect;
use super::loader::SqlLoader;
use crate::config::TargetEngineConfig;
use crate::core::{EngineDialect, ImportBatchArgs, TargetEngine, TargetTx};
use crate::drivers::common::parse_i64_row;
use crate::error::{MigrateError, Result};

const DEFAULT_ODBC_DRIVER: &str = "Oracle";

/// Rows fetched per ODBC round trip.
const FETCH_ROWS: usize = 100;

/// Longest text value read back from a query.
const MAX_TEXT_BYTES: usize = 4096;

static ODBC_ENV: OnceLock<Environment> = OnceLock::new();

fn odbc_env() -> Result<&'static Environment> {
    if let Some(env) = ODBC_ENV.get() {
        return Ok(env);
    }
    let env = Environment::new().map_err(|e| {
        MigrateError::connection(
            format!(
                "Failed to create ODBC environment: {}.\n\n\
                 Oracle targets require the Oracle Instant Client ODBC driver,\n\
                 registered in odbcinst.ini.",
                e
            ),
            "ODBC environment",
        )
    })?;
    // Another thread may have won the race; its environment is kept.
    let _ = ODBC_ENV.set(env);
    ODBC_ENV
        .get()
        .ok_or_else(|| MigrateError::State("ODBC environment unavailable".into()))
}

/// Connect identifier shared by ODBC (`DBQ`) and SQL*Loader (`userid=...@`).
pub(crate) fn connect_identifier(conf: &TargetEngineConfig) -> String {
    if let Some(alias) = conf.tns_alias.as_deref().filter(|a| !a.is_empty()) {
        return alias.to_string();
    }
    let port = conf.effective_port();
    match (conf.service_name.as_deref(), conf.sid.as_deref()) {
        (Some(service), _) if !service.is_empty() => {
            format!("//{}:{}/{}", conf.host, port, service)
        }
        (_, Some(sid)) if !sid.is_empty() => format!(
            "(DESCRIPTION=(ADDRESS=(PROTOCOL=TCP)(HOST={})(PORT={}))(CONNECT_DATA=(SID={})))",
            conf.host, port, sid
        ),
        _ => format!("//{}:{}/{}", conf.host, port, conf.database),
    }
}

fn connection_string(conf: &TargetEngineConfig) -> String {
    format!(
        "Driver={{{}}};DBQ={};UID={};PWD={{{}}};",
        conf.odbc_driver.as_deref().unwrap_or(DEFAULT_ODBC_DRIVER),
        connect_identifier(conf),
        conf.user,
        conf.password.replace('}', "}}")
    )
}

async fn blocking<T, F>(work: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| MigrateError::State(format!("ODBC worker failed: {}", e)))?
}

fn query_text(conn: &Connection<'_>, sql: &str) -> Result<Vec<Vec<String>>> {
    let mut rows = Vec::new();
    if let Some(mut cursor) = conn.execute(sql, ())? {
        let mut buffers = TextRowSet::for_cursor(FETCH_ROWS, &mut cursor, Some(MAX_TEXT_BYTES))?;
        let mut row_cursor = cursor.bind_buffer(&mut buffers)?;
        while let Some(batch) = row_cursor.fetch()? {
            for row in 0..batch.num_rows() {
                rows.push(
                    (0..batch.num_cols())
                        .map(|col| {
                            batch
                                .at(col, row)
                                .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
                                .unwrap_or_default()
                        })
                        .collect(),
                );
            }
        }
    }
    Ok(rows)
}

fn execute_counted(conn: &Connection<'_>, sql: &str) -> Result<u64> {
    let mut statement = conn.preallocate()?;
    statement.execute(sql, ())?;
    Ok(statement.row_count()?.unwrap_or(0) as u64)
}

/// Connections not currently inside a transaction.
///
/// Once closed, returned connections are dropped instead of kept.
struct IdleConnections<C> {
    idle: Mutex<Vec<C>>,
    closed: AtomicBool,
}

impl<C> IdleConnections<C> {
    fn new() -> Self {
        Self {
            idle: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    fn take(&self) -> Option<C> {
        self.idle.lock().ok().and_then(|mut idle| idle.pop())
    }

    fn put(&self, conn: C) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        if let Ok(mut idle) = self.idle.lock() {
            idle.push(conn);
        }
    }

    /// Stop accepting returns and hand back the idle connections.
    fn close(&self) -> Vec<C> {
        self.closed.store(true, Ordering::Release);
        self.idle
            .lock()
            .map(|mut idle| std::mem::take(&mut *idle))
            .unwrap_or_default()
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.idle.lock().map(|idle| idle.len()).unwrap_or(0)
    }
}

type OdbcIdle = Arc<IdleConnections<Connection<'static>>>;

/// An Oracle database reached through the ODBC driver.
pub struct OracleEngine {
    conf: TargetEngineConfig,
    dialect: OracleDialect,
    schema: String,
    max_connections: usize,
    connection_string: String,
    loader: Arc<SqlLoader>,
    version: Option<String>,
    slots: Option<Arc<Semaphore>>,
    idle: OdbcIdle,
}

impl OracleEngine {
    pub fn new(conf: &TargetEngineConfig, max_connections: usize, sqlldr_path: &str) -> Result<Self> {
        Ok(Self {
            conf: conf.clone(),
            dialect: OracleDialect::new(),
            schema: conf.effective_schema(),
            max_connections: conf.max_connections.unwrap_or(max_connections).max(1),
            connection_string: connection_string(conf),
            loader: Arc::new(SqlLoader::new(
                sqlldr_path,
                conf.user.clone(),
                conf.password.clone(),
                connect_identifier(conf),
            )),
            version: None,
            slots: None,
            idle: Arc::new(IdleConnections::new()),
        })
    }

    async fn connect(&self) -> Result<Connection<'static>> {
        let connection_string = self.connection_string.clone();
        let ctx = format!("connecting to {}", self.conf.describe());
        blocking(move || {
            odbc_env()?
                .connect_with_connection_string(&connection_string, ConnectionOptions::default())
                .map_err(|e| MigrateError::connection(e, ctx))
        })
        .await
    }
}

#[async_trait]
impl TargetEngine for OracleEngine {
    fn dialect(&self) -> &dyn EngineDialect {
        &self.dialect
    }

    fn target_schema(&self) -> &str {
        &self.schema
    }

    async fn init(&mut self) -> Result<()> {
        let conn = self.connect().await?;
        let rows = blocking(move || {
            query_text(&conn, "SELECT banner FROM v$version WHERE ROWNUM = 1")
        })
        .await?;
        let version = rows
            .into_iter()
            .next()
            .and_then(|r| r.into_iter().next())
            .unwrap_or_default();
        info!("Connected to {}: {}", self.conf.describe(), version);
        self.version = Some(version);
        Ok(())
    }

    async fn open_pool(&mut self) -> Result<()> {
        let conn = self.connect().await?;
        let conn = blocking(move || {
            query_text(&conn, "SELECT 1 FROM DUAL")?;
            conn.set_autocommit(false)?;
            Ok(conn)
        })
        .await?;
        self.idle = Arc::new(IdleConnections::new());
        self.idle.put(conn);
        debug!(
            "Connection limit {} set for {}",
            self.max_connections,
            self.conf.describe()
        );
        self.slots = Some(Arc::new(Semaphore::new(self.max_connections)));
        Ok(())
    }

    async fn finalize(&mut self) {
        if let Some(slots) = self.slots.take() {
            slots.close();
        }
        let idle = self.idle.close();
        if !idle.is_empty() {
            debug!("Closing {} idle connections to {}", idle.len(), self.conf.describe());
            // Disconnecting is a blocking ODBC call.
            let _ = blocking(move || {
                drop(idle);
                Ok(())
            })
            .await;
        }
    }

    fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    fn max_connections(&self) -> usize {
        self.max_connections
    }

    async fn begin(&self) -> Result<Box<dyn TargetTx>> {
        let slots = self.slots.clone().ok_or_else(|| {
            MigrateError::connection("pool is not open", self.conf.describe())
        })?;
        let permit = slots
            .acquire_owned()
            .await
            .map_err(|_| MigrateError::connection("pool is closed", self.conf.describe()))?;
        let conn = match self.idle.take() {
            Some(conn) => conn,
            None => {
                let conn = self.connect().await?;
                blocking(move || {
                    conn.set_autocommit(false)?;
                    Ok(conn)
                })
                .await?
            }
        };
        Ok(Box::new(OracleTx {
            conn: Some(conn),
            loader: Arc::clone(&self.loader),
            idle: Arc::clone(&self.idle),
            _permit: permit,
        }))
    }
}

/// A manual-commit ODBC connection.
///
/// After a clean commit or rollback the connection returns to the idle list;
/// a connection whose commit or rollback failed is dropped.
struct OracleTx {
    conn: Option<Connection<'static>>,
    loader: Arc<SqlLoader>,
    idle: OdbcIdle,
    _permit: OwnedSemaphorePermit,
}

impl OracleTx {
    fn take_conn(&mut self) -> Result<Connection<'static>> {
        self.conn
            .take()
            .ok_or_else(|| MigrateError::State("transaction already finished".into()))
    }

    async fn with_conn<T, F>(&mut self, work: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection<'static>) -> Result<T> + Send + 'static,
    {
        let conn = self.take_conn()?;
        let (conn, result) = tokio::task::spawn_blocking(move || {
            let result = work(&conn);
            (conn, result)
        })
        .await
        .map_err(|e| MigrateError::State(format!("ODBC worker failed: {}", e)))?;
        self.conn = Some(conn);
        result
    }
}

#[async_trait]
impl TargetTx for OracleTx {
    async fn execute(&mut self, sql: &str) -> Result<u64> {
        let sql = sql.to_string();
        self.with_conn(move |conn| execute_counted(conn, &sql)).await
    }

    async fn query_i64s(&mut self, sql: &str) -> Result<Option<Vec<i64>>> {
        let sql = sql.to_string();
        let rows = self.with_conn(move |conn| query_text(conn, &sql)).await?;
        parse_i64_row(rows)
    }

    async fn query_strings(&mut self, sql: &str) -> Result<Vec<Vec<String>>> {
        let sql = sql.to_string();
        self.with_conn(move |conn| query_text(conn, &sql)).await
    }

    /// `statement` is the control file. SQL*Loader commits on its own session;
    /// the caller's transaction only carries the completion marker.
    async fn copy_from_file(&mut self, statement: &str, args: &ImportBatchArgs) -> Result<u64> {
        let rows = self.loader.load(statement, args).await?;
        debug!("SQL*Loader loaded {} rows into {}", rows, args.table_name);
        Ok(rows)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let mut this = self;
        let conn = this.take_conn()?;
        let conn = blocking(move || {
            conn.commit()?;
            Ok(conn)
        })
        .await?;
        this.idle.put(conn);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        let mut this = self;
        let conn = this.take_conn()?;
        let conn = blocking(move || {
            conn.rollback()?;
            Ok(conn)
        })
        .await?;
        this.idle.put(conn);
        Ok(())
    }
}

impl Drop for OracleTx {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            warn!("transaction dropped while open; rolling back");
            let rollback = move || {
                if let Err(e) = conn.rollback() {
                    warn!("Rollback of dropped transaction failed: {}", e);
                }
            };
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn_blocking(rollback);
                }
                Err(_) => rollback(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineKind;

    fn conf(extra: &str) -> TargetEngineConfig {
        serde_json::from_str(&format!(
            r#"{{"type": "oracle", "host": "ora", "user": "scott", "password": "ti}}ger"{}}}"#,
            extra
        ))
        .unwrap()
    }

    #[test]
    fn test_connect_identifier_variants() {
        assert_eq!(
            connect_identifier(&conf(r#", "service_name": "ORCLPDB1""#)),
            "//ora:1521/ORCLPDB1"
        );
        assert_eq!(
            connect_identifier(&conf(r#", "sid": "ORCL""#)),
            "(DESCRIPTION=(ADDRESS=(PROTOCOL=TCP)(HOST=ora)(PORT=1521))(CONNECT_DATA=(SID=ORCL)))"
        );
        assert_eq!(
            connect_identifier(&conf(r#", "tns_alias": "PROD", "service_name": "X""#)),
            "PROD"
        );
    }

    #[test]
    fn test_connection_string_escapes_password() {
        let c = conf(r#", "service_name": "ORCL", "odbc_driver": "Oracle 21 ODBC driver""#);
        assert_eq!(
            connection_string(&c),
            "Driver={Oracle 21 ODBC driver};DBQ=//ora:1521/ORCL;UID=scott;PWD={ti}}ger};"
        );
    }

    #[test]
    fn test_engine_from_config() {
        let engine = OracleEngine::new(&conf(r#", "max_connections": 2"#), 8, "sqlldr").unwrap();
        assert_eq!(engine.kind(), EngineKind::Oracle);
        assert_eq!(engine.target_schema(), "SCOTT");
        assert_eq!(engine.max_connections(), 2);
    }

    #[test]
    fn test_idle_connections_are_reused_until_closed() {
        let idle = IdleConnections::new();
        assert_eq!(idle.take(), None::<u32>);
        idle.put(1);
        idle.put(2);
        assert_eq!(idle.len(), 2);
        assert_eq!(idle.take(), Some(2));

        assert_eq!(idle.close(), vec![1]);
        idle.put(3);
        assert_eq!(idle.len(), 0);
        assert_eq!(idle.take(), None);
    }

    #[tokio::test]
    async fn test_begin_requires_open_pool() {
        let engine = OracleEngine::new(&conf(""), 4, "sqlldr").unwrap();
        assert!(matches!(
            engine.begin().await,
            Err(MigrateError::Connection { .. })
        ));
    }
}
