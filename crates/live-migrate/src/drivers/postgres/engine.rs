//! PostgreSQL-family target engine.
//!
//! Uses deadpool-postgres for the bounded pool and the COPY protocol for bulk
//! loads. The same engine serves YugabyteDB with a different dialect.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use deadpool_postgres::{Manager, ManagerConfig, Object, Pool, RecyclingMethod};
use futures::{SinkExt, StreamExt};
use tokio_postgres::{Config as PgConfig, CopyInSink, SimpleQueryMessage};
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

use super::dialect::PostgresDialect;
use crate::config::TargetEngineConfig;
use crate::core::{EngineDialect, ImportBatchArgs, TargetEngine, TargetTx};
use crate::drivers::common::{parse_i64_row, SslMode, TlsBuilder};
use crate::error::{MigrateError, Result};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Read size when streaming a data file into COPY.
const COPY_CHUNK_BYTES: usize = 256 * 1024;

/// A PostgreSQL-compatible database reached through tokio-postgres.
pub struct PostgresEngine<D = PostgresDialect> {
    conf: TargetEngineConfig,
    dialect: D,
    schema: String,
    max_connections: usize,
    tls: TlsBuilder,
    version: Option<String>,
    pool: Option<Pool>,
}

impl PostgresEngine<PostgresDialect> {
    pub fn new(conf: &TargetEngineConfig, max_connections: usize) -> Result<Self> {
        Self::with_dialect(conf, max_connections, PostgresDialect::new())
    }
}

impl<D: EngineDialect> PostgresEngine<D> {
    pub fn with_dialect(conf: &TargetEngineConfig, max_connections: usize, dialect: D) -> Result<Self> {
        Ok(Self {
            conf: conf.clone(),
            dialect,
            schema: conf.effective_schema(),
            max_connections: conf.max_connections.unwrap_or(max_connections).max(1),
            tls: TlsBuilder::parse(&conf.ssl_mode)?,
            version: None,
            pool: None,
        })
    }

    fn pg_config(&self) -> PgConfig {
        let mut pg_config = PgConfig::new();
        pg_config.host(&self.conf.host);
        pg_config.port(self.conf.effective_port());
        pg_config.dbname(&self.conf.database);
        pg_config.user(&self.conf.user);
        if !self.conf.password.is_empty() {
            pg_config.password(&self.conf.password);
        }
        pg_config.application_name("live-migrate");
        pg_config.keepalives(true);
        pg_config.keepalives_idle(Duration::from_secs(30));
        pg_config.connect_timeout(CONNECT_TIMEOUT);
        pg_config.ssl_mode(self.tls.ssl_mode().negotiation());
        pg_config
    }

    fn context(&self, action: &str) -> String {
        format!("{} {}", action, self.conf.describe())
    }

    /// One short-lived connection, used before the pool exists.
    async fn connect_once(&self) -> Result<tokio_postgres::Client> {
        let pg_config = self.pg_config();
        let ctx = self.context("connecting to");
        let client = match self.tls.build()? {
            Some(tls) => {
                let (client, connection) = pg_config
                    .connect(tls)
                    .await
                    .map_err(|e| MigrateError::connection(e, &ctx))?;
                tokio::spawn(async move {
                    if let Err(e) = connection.await {
                        debug!("init connection closed: {}", e);
                    }
                });
                client
            }
            None => {
                let (client, connection) = pg_config
                    .connect(tokio_postgres::NoTls)
                    .await
                    .map_err(|e| MigrateError::connection(e, &ctx))?;
                tokio::spawn(async move {
                    if let Err(e) = connection.await {
                        debug!("init connection closed: {}", e);
                    }
                });
                client
            }
        };
        Ok(client)
    }
}

fn text_rows(messages: Vec<SimpleQueryMessage>) -> Vec<Vec<String>> {
    messages
        .into_iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(row) => Some(
                (0..row.len())
                    .map(|i| row.get(i).unwrap_or_default().to_string())
                    .collect(),
            ),
            _ => None,
        })
        .collect()
}

#[async_trait]
impl<D: EngineDialect + 'static> TargetEngine for PostgresEngine<D> {
    fn dialect(&self) -> &dyn EngineDialect {
        &self.dialect
    }

    fn target_schema(&self) -> &str {
        &self.schema
    }

    async fn init(&mut self) -> Result<()> {
        let client = self.connect_once().await?;
        let rows = text_rows(client.simple_query("SELECT version()").await?);
        let version = rows
            .into_iter()
            .next()
            .and_then(|r| r.into_iter().next())
            .unwrap_or_default();
        info!("Connected to {}: {}", self.conf.describe(), version);
        if self.tls.ssl_mode() == SslMode::Disable {
            warn!("TLS is disabled for {}. Credentials are sent in plaintext.", self.conf.describe());
        }
        self.version = Some(version);
        Ok(())
    }

    async fn open_pool(&mut self) -> Result<()> {
        let mgr_config = ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        };
        let pg_config = self.pg_config();
        let ctx = self.context("creating pool for");
        let pool = match self.tls.build()? {
            Some(tls) => Pool::builder(Manager::from_config(pg_config, tls, mgr_config))
                .max_size(self.max_connections)
                .build(),
            None => Pool::builder(Manager::from_config(
                pg_config,
                tokio_postgres::NoTls,
                mgr_config,
            ))
            .max_size(self.max_connections)
            .build(),
        }
        .map_err(|e| MigrateError::connection(e, &ctx))?;

        let client = pool
            .get()
            .await
            .map_err(|e| MigrateError::connection(e, self.context("testing pool for")))?;
        client.simple_query("SELECT 1").await?;
        drop(client);

        debug!(
            "Pool of {} connections open for {}",
            self.max_connections,
            self.conf.describe()
        );
        self.pool = Some(pool);
        Ok(())
    }

    async fn finalize(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.close();
            debug!("Closed pool for {}", self.conf.describe());
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
        let client = pool
            .get()
            .await
            .map_err(|e| MigrateError::connection(e, self.context("acquiring connection to")))?;
        client.batch_execute("BEGIN").await?;
        Ok(Box::new(PgTx {
            client: Some(client),
        }))
    }
}

/// An open transaction on a pooled connection.
///
/// A transaction dropped without commit or rollback detaches its connection
/// from the pool so an open transaction never gets reused.
struct PgTx {
    client: Option<Object>,
}

impl PgTx {
    fn client(&self) -> Result<&Object> {
        self.client
            .as_ref()
            .ok_or_else(|| MigrateError::State("transaction already finished".into()))
    }

    fn take_client(&mut self) -> Result<Object> {
        self.client
            .take()
            .ok_or_else(|| MigrateError::State("transaction already finished".into()))
    }
}

#[async_trait]
impl TargetTx for PgTx {
    async fn execute(&mut self, sql: &str) -> Result<u64> {
        Ok(self.client()?.execute(sql, &[]).await?)
    }

    async fn query_i64s(&mut self, sql: &str) -> Result<Option<Vec<i64>>> {
        parse_i64_row(text_rows(self.client()?.simple_query(sql).await?))
    }

    async fn query_strings(&mut self, sql: &str) -> Result<Vec<Vec<String>>> {
        Ok(text_rows(self.client()?.simple_query(sql).await?))
    }

    async fn copy_from_file(&mut self, statement: &str, args: &ImportBatchArgs) -> Result<u64> {
        let client = self.client()?;
        let file = tokio::fs::File::open(&args.file_path).await?;
        let sink: CopyInSink<Bytes> = client.copy_in(statement).await?;
        tokio::pin!(sink);

        let mut chunks = ReaderStream::with_capacity(file, COPY_CHUNK_BYTES);
        while let Some(chunk) = chunks.next().await {
            sink.send(chunk?).await?;
        }
        let rows = sink.finish().await?;
        Ok(rows)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let mut this = self;
        let client = this.take_client()?;
        if let Err(e) = client.batch_execute("COMMIT").await {
            drop(Object::take(client));
            return Err(e.into());
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        let mut this = self;
        let client = this.take_client()?;
        if let Err(e) = client.batch_execute("ROLLBACK").await {
            drop(Object::take(client));
            return Err(e.into());
        }
        Ok(())
    }
}

impl Drop for PgTx {
    fn drop(&mut self) {
        if let Some(client) = self.client.take() {
            warn!("transaction dropped while open; discarding its connection");
            drop(Object::take(client));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineKind;

    fn conf() -> TargetEngineConfig {
        serde_json::from_str(
            r#"{"type": "postgresql", "host": "db", "database": "app", "user": "importer",
                "password": "secret", "ssl_mode": "disable", "max_connections": 3}"#,
        )
        .unwrap()
    }

    #[test]
    fn test_engine_from_config() {
        let engine = PostgresEngine::new(&conf(), 8).unwrap();
        assert_eq!(engine.kind(), EngineKind::Postgresql);
        assert_eq!(engine.target_schema(), "public");
        assert_eq!(engine.max_connections(), 3);
        assert!(engine.version().is_none());
    }

    #[tokio::test]
    async fn test_begin_requires_open_pool() {
        let engine = PostgresEngine::new(&conf(), 8).unwrap();
        assert!(matches!(
            engine.begin().await,
            Err(MigrateError::Connection { .. })
        ));
    }

    #[tokio::test]
    async fn test_finalize_is_idempotent_before_init() {
        let mut engine = PostgresEngine::new(&conf(), 8).unwrap();
        engine.finalize().await;
        engine.finalize().await;
    }

    #[test]
    fn test_invalid_ssl_mode_rejected() {
        let mut c = conf();
        c.ssl_mode = "sometimes".into();
        assert!(PostgresEngine::new(&c, 4).is_err());
    }
}
