//! MySQL target engine on mysql_async.

use async_trait::async_trait;
use futures::StreamExt;
use mysql_async::prelude::*;
use mysql_async::{Conn, Opts, OptsBuilder, Pool, PoolConstraints, PoolOpts, Row, SslOpts, Value};
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

use super::dialect::MysqlDialect;
use crate::config::TargetEngineConfig;
use crate::core::{EngineDialect, ImportBatchArgs, TargetEngine, TargetTx};
use crate::drivers::common::parse_i64_row;
use crate::error::{MigrateError, Result};

/// A MySQL database reached through a mysql_async pool.
pub struct MysqlEngine {
    conf: TargetEngineConfig,
    dialect: MysqlDialect,
    schema: String,
    max_connections: usize,
    version: Option<String>,
    pool: Option<Pool>,
    /// Settled in `init`: false once a `prefer` connection fell back to plaintext.
    tls: bool,
}

/// TLS settings to try in order for an ssl mode: `prefer` retries in plaintext.
fn tls_attempts(ssl_mode: &str) -> &'static [bool] {
    match ssl_mode.to_lowercase().as_str() {
        "disable" => &[false],
        "prefer" => &[true, false],
        _ => &[true],
    }
}

impl MysqlEngine {
    pub fn new(conf: &TargetEngineConfig, max_connections: usize) -> Result<Self> {
        Ok(Self {
            conf: conf.clone(),
            dialect: MysqlDialect::new(),
            schema: conf.effective_schema(),
            max_connections: conf.max_connections.unwrap_or(max_connections).max(1),
            version: None,
            pool: None,
            tls: !conf.ssl_mode.eq_ignore_ascii_case("disable"),
        })
    }

    fn ssl_opts(&self, tls: bool) -> Option<SslOpts> {
        if !tls {
            return None;
        }
        match self.conf.ssl_mode.to_lowercase().as_str() {
            "verify-ca" | "verify-full" => Some(SslOpts::default()),
            _ => Some(SslOpts::default().with_danger_accept_invalid_certs(true)),
        }
    }

    fn opts(&self, tls: bool, pool_opts: Option<PoolOpts>) -> Opts {
        let mut builder = OptsBuilder::default()
            .ip_or_hostname(self.conf.host.clone())
            .tcp_port(self.conf.effective_port())
            .db_name(Some(self.conf.database.clone()))
            .user(Some(self.conf.user.clone()))
            .pass(Some(self.conf.password.clone()))
            .init(vec!["SET NAMES utf8mb4"]);
        if let Some(ssl) = self.ssl_opts(tls) {
            builder = builder.ssl_opts(ssl);
        }
        if let Some(pool_opts) = pool_opts {
            builder = builder.pool_opts(pool_opts);
        }
        builder.into()
    }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::NULL => String::new(),
        Value::Bytes(bytes) => String::from_utf8_lossy(bytes).into_owned(),
        Value::Int(i) => i.to_string(),
        Value::UInt(u) => u.to_string(),
        Value::Float(f) => f.to_string(),
        Value::Double(d) => d.to_string(),
        other => other.as_sql(false).trim_matches('\'').to_string(),
    }
}

fn text_rows(rows: Vec<Row>) -> Vec<Vec<String>> {
    rows.iter()
        .map(|row| {
            (0..row.len())
                .map(|i| row.as_ref(i).map(value_text).unwrap_or_default())
                .collect()
        })
        .collect()
}

#[async_trait]
impl TargetEngine for MysqlEngine {
    fn dialect(&self) -> &dyn EngineDialect {
        &self.dialect
    }

    fn target_schema(&self) -> &str {
        &self.schema
    }

    async fn init(&mut self) -> Result<()> {
        let ctx = format!("connecting to {}", self.conf.describe());
        let attempts = tls_attempts(&self.conf.ssl_mode);
        let mut last_err = None;
        let mut connected = None;
        for (i, &tls) in attempts.iter().enumerate() {
            match Conn::new(self.opts(tls, None)).await {
                Ok(conn) => {
                    connected = Some((conn, tls));
                    break;
                }
                Err(e) if i + 1 < attempts.len() => {
                    warn!(
                        "TLS connection to {} failed ({}), retrying without TLS",
                        self.conf.describe(),
                        e
                    );
                    last_err = Some(e);
                }
                Err(e) => last_err = Some(e),
            }
        }
        let (mut conn, tls) = match connected {
            Some(found) => found,
            None => {
                let cause = last_err.map(|e| e.to_string()).unwrap_or_default();
                return Err(MigrateError::connection(cause, &ctx));
            }
        };
        if !tls {
            warn!("MySQL TLS is disabled. Credentials will be transmitted in plaintext.");
        }
        self.tls = tls;

        let version: Option<String> = conn.query_first("SELECT VERSION()").await?;
        conn.disconnect().await?;
        let version = version.unwrap_or_default();
        info!("Connected to {}: MySQL {}", self.conf.describe(), version);
        self.version = Some(version);
        Ok(())
    }

    async fn open_pool(&mut self) -> Result<()> {
        let constraints = PoolConstraints::new(1, self.max_connections).ok_or_else(|| {
            MigrateError::Config(format!(
                "invalid MySQL pool size {}",
                self.max_connections
            ))
        })?;
        let pool_opts = PoolOpts::new().with_constraints(constraints);
        let pool = Pool::new(self.opts(self.tls, Some(pool_opts)));

        let mut conn = pool.get_conn().await.map_err(|e| {
            MigrateError::connection(e, format!("creating pool for {}", self.conf.describe()))
        })?;
        conn.query_drop("SELECT 1").await?;
        drop(conn);

        self.pool = Some(pool);
        Ok(())
    }

    async fn finalize(&mut self) {
        if let Some(pool) = self.pool.take() {
            if let Err(e) = pool.disconnect().await {
                warn!("Error closing MySQL pool: {}", e);
            }
        }
    }

    fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    fn max_connections(&self) -> usize {
        self.max_connections
    }

    async fn begin(&self) -> Result<Box<dyn TargetTx>> {
        let pool = self.pool.as_ref().ok_or_else(|| {
            MigrateError::connection("pool is not open", self.conf.describe())
        })?;
        let mut conn = pool.get_conn().await.map_err(|e| {
            MigrateError::connection(e, format!("acquiring connection to {}", self.conf.describe()))
        })?;
        conn.query_drop("START TRANSACTION").await?;
        Ok(Box::new(MysqlTx { conn: Some(conn) }))
    }
}

/// An explicit transaction on a pooled connection.
struct MysqlTx {
    conn: Option<Conn>,
}

impl MysqlTx {
    fn conn(&mut self) -> Result<&mut Conn> {
        self.conn
            .as_mut()
            .ok_or_else(|| MigrateError::State("transaction already finished".into()))
    }

    async fn finish(&mut self, statement: &str) -> Result<()> {
        let mut conn = self
            .conn
            .take()
            .ok_or_else(|| MigrateError::State("transaction already finished".into()))?;
        if let Err(e) = conn.query_drop(statement).await {
            let _ = conn.disconnect().await;
            return Err(e.into());
        }
        Ok(())
    }
}

#[async_trait]
impl TargetTx for MysqlTx {
    async fn execute(&mut self, sql: &str) -> Result<u64> {
        let conn = self.conn()?;
        conn.query_drop(sql).await?;
        Ok(conn.affected_rows())
    }

    async fn query_i64s(&mut self, sql: &str) -> Result<Option<Vec<i64>>> {
        let rows: Vec<Row> = self.conn()?.query(sql).await?;
        parse_i64_row(text_rows(rows))
    }

    async fn query_strings(&mut self, sql: &str) -> Result<Vec<Vec<String>>> {
        let rows: Vec<Row> = self.conn()?.query(sql).await?;
        Ok(text_rows(rows))
    }

    async fn copy_from_file(&mut self, statement: &str, args: &ImportBatchArgs) -> Result<u64> {
        let file = tokio::fs::File::open(&args.file_path).await?;
        let conn = self.conn()?;
        // Serves only this batch's file to the server's LOCAL INFILE request.
        conn.set_infile_handler(async move { Ok(ReaderStream::new(file).boxed()) });
        conn.query_drop(statement).await?;
        let rows = conn.affected_rows();
        debug!("LOAD DATA {} loaded {} rows", args.file_path.display(), rows);
        Ok(rows)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let mut this = self;
        this.finish("COMMIT").await
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        let mut this = self;
        this.finish("ROLLBACK").await
    }
}

impl Drop for MysqlTx {
    fn drop(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            warn!("transaction dropped while open; rolling back in the background");
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    if conn.query_drop("ROLLBACK").await.is_err() {
                        let _ = conn.disconnect().await;
                    }
                });
            }
        }
    }
}
