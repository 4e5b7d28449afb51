use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use stockwise_core::{RetryPolicy, Value};
use tracing::{debug, info, warn};

use crate::{EndpointSwitch, SelectQuery, SourceEndpoint, SourceError};

/// Settings for reaching the legacy source through ODBC.
#[derive(Debug, Clone)]
pub struct SourceConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub charset: String,
    pub live_dsn: Option<String>,
    pub full_dsn: Option<String>,
    pub driver_name: String,
    pub driver_path: String,
    pub select_retry: RetryPolicy,
    pub line_retry: RetryPolicy,
}

impl SourceConfig {
    pub fn dsn_for(&self, endpoint: SourceEndpoint) -> Option<&str> {
        let dsn = match endpoint {
            SourceEndpoint::Live => self.live_dsn.as_deref(),
            SourceEndpoint::Full => self.full_dsn.as_deref(),
        };
        dsn.map(str::trim).filter(|dsn| !dsn.is_empty())
    }

    /// Connection strings tried in order: DSN with charset, bare DSN, then the
    /// driver-name and driver-library forms addressing host/port/path directly.
    pub fn connection_strings(&self, endpoint: SourceEndpoint) -> Vec<String> {
        let mut variants = Vec::new();
        if let Some(dsn) = self.dsn_for(endpoint) {
            variants.push(format!("DSN={dsn};CHARSET={};", self.charset));
            variants.push(format!("DSN={dsn};"));
        }

        let path = self.database.trim().replace('\\', "/");
        if !path.is_empty() {
            let dbname = format!("{}/{}:{}", self.host, self.port, path);
            for driver in [&self.driver_name, &self.driver_path] {
                if driver.trim().is_empty() {
                    continue;
                }
                variants.push(format!(
                    "DRIVER={driver};DBNAME={dbname};CHARSET={};",
                    self.charset
                ));
            }
        }
        variants
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3050,
            database: String::new(),
            charset: "UTF8".to_string(),
            live_dsn: Some("live".to_string()),
            full_dsn: Some("test".to_string()),
            driver_name: "FirebirdODBC".to_string(),
            driver_path: "/usr/lib/libOdbcFb.so".to_string(),
            select_retry: RetryPolicy::default(),
            line_retry: RetryPolicy::default().with_attempts(5),
        }
    }
}

/// Positional result row.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRow(pub Vec<Value>);

static NULL: Value = Value::Null;

impl SourceRow {
    pub fn value(&self, idx: usize) -> &Value {
        self.0.get(idx).unwrap_or(&NULL)
    }

    pub fn key(&self, idx: usize, column: &str) -> Result<i64, SourceError> {
        self.value(idx).as_i64().ok_or_else(|| SourceError::Decode {
            column: column.to_string(),
            message: format!("expected integer key, got {:?}", self.value(idx)),
        })
    }

    pub fn int(&self, idx: usize) -> Option<i64> {
        self.value(idx).as_i64()
    }

    pub fn text(&self, idx: usize) -> Option<String> {
        self.value(idx)
            .as_text()
            .map(|s| s.trim_end().to_string())
    }

    pub fn date(&self, idx: usize) -> Option<NaiveDate> {
        self.value(idx).as_date()
    }

    /// Missing quantities count as zero.
    pub fn quantity(&self, idx: usize) -> f64 {
        self.value(idx).as_f64().unwrap_or(0.0)
    }
}

#[async_trait]
pub trait SourceConnection: Send {
    async fn select(&mut self, query: &SelectQuery) -> Result<Vec<SourceRow>, SourceError>;
}

#[async_trait]
pub trait SourceConnector: Send + Sync {
    async fn connect(
        &self,
        connection_string: &str,
    ) -> Result<Box<dyn SourceConnection>, SourceError>;
}

struct CachedConnection {
    endpoint: SourceEndpoint,
    connection: Box<dyn SourceConnection>,
}

/// Owns the single cached source connection.
///
/// `ensure` connects lazily against the active endpoint; `invalidate` drops the cached
/// connection so the next call reconnects. Queries that fail are retried on a fresh
/// connection with linear backoff.
pub struct SourceClient {
    config: SourceConfig,
    connector: Arc<dyn SourceConnector>,
    endpoint: SourceEndpoint,
    cached: Option<CachedConnection>,
}

impl SourceClient {
    pub fn new(config: SourceConfig, connector: Arc<dyn SourceConnector>) -> Self {
        Self {
            config,
            connector,
            endpoint: SourceEndpoint::Live,
            cached: None,
        }
    }

    pub fn config(&self) -> &SourceConfig {
        &self.config
    }

    pub fn endpoint(&self) -> SourceEndpoint {
        self.endpoint
    }

    pub fn is_connected(&self) -> bool {
        self.cached.is_some()
    }

    pub fn invalidate(&mut self) {
        if let Some(cached) = self.cached.take() {
            debug!(endpoint = %cached.endpoint, "closing cached source connection");
        }
    }

    /// Opens a new connection to `endpoint`, returning on the first variant that works.
    pub async fn connect(
        &mut self,
        endpoint: SourceEndpoint,
    ) -> Result<Box<dyn SourceConnection>, SourceError> {
        let variants = self.config.connection_strings(endpoint);
        if variants.is_empty() {
            return Err(SourceError::Connect {
                endpoint: endpoint.to_string(),
                attempts: 0,
                message: "neither a DSN nor a database path is configured".to_string(),
            });
        }

        let mut last_error = String::new();
        for (idx, connection_string) in variants.iter().enumerate() {
            match self.connector.connect(connection_string).await {
                Ok(connection) => {
                    info!(%endpoint, variant = idx + 1, "connected to source");
                    return Ok(connection);
                }
                Err(err) => {
                    warn!(
                        %endpoint,
                        variant = idx + 1,
                        variants = variants.len(),
                        error = %err,
                        "source connection variant failed"
                    );
                    last_error = err.to_string();
                }
            }
        }

        Err(SourceError::Connect {
            endpoint: endpoint.to_string(),
            attempts: variants.len(),
            message: last_error,
        })
    }

    pub async fn ensure(&mut self) -> Result<&mut Box<dyn SourceConnection>, SourceError> {
        let stale = self
            .cached
            .as_ref()
            .is_some_and(|cached| cached.endpoint != self.endpoint);
        if stale {
            self.invalidate();
        }

        if self.cached.is_none() {
            let connection = self.connect(self.endpoint).await?;
            self.cached = Some(CachedConnection {
                endpoint: self.endpoint,
                connection,
            });
        }

        match self.cached.as_mut() {
            Some(cached) => Ok(&mut cached.connection),
            None => Err(SourceError::Unsupported(
                "source connection vanished after connect".to_string(),
            )),
        }
    }

    pub async fn select_all(&mut self, query: &SelectQuery) -> Result<Vec<SourceRow>, SourceError> {
        let policy = self.config.select_retry;
        self.select_with(query, policy).await
    }

    pub async fn select_with(
        &mut self,
        query: &SelectQuery,
        policy: RetryPolicy,
    ) -> Result<Vec<SourceRow>, SourceError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = match self.ensure().await {
                Ok(connection) => connection.select(query).await,
                Err(err) => Err(err),
            };

            let err = match result {
                Ok(rows) => return Ok(rows),
                Err(err) => err,
            };

            warn!(
                query = query.label(),
                attempt,
                attempts = policy.max_attempts,
                error = %err,
                "source select failed"
            );
            self.invalidate();

            if !err.is_retryable() {
                return Err(err);
            }
            if attempt >= policy.max_attempts {
                return Err(SourceError::RetriesExhausted {
                    attempts: attempt,
                    last: Box::new(err),
                });
            }
            tokio::time::sleep(policy.delay_after_attempt(attempt)).await;
        }
    }
}

impl EndpointSwitch for SourceClient {
    fn switch_endpoint(&mut self, endpoint: SourceEndpoint) -> SourceEndpoint {
        let previous = self.endpoint;
        if previous != endpoint {
            info!(from = %previous, to = %endpoint, "switching source endpoint");
            self.invalidate();
            self.endpoint = endpoint;
        }
        previous
    }
}
