//! Shared connections to monitored endpoints.
//!
//! One `tokio_postgres::Client` per endpoint, multiplexed by the
//! driver task; a per-endpoint semaphore caps concurrent statements.
//! Dormant endpoints (undersized, recovery-ignored) have their cap
//! shrunk to one and restored on reactivation; only the supervisor
//! flips that switch.
//!
//! All metric queries go over the simple-query protocol: pgbouncer and
//! pgpool admin consoles do not implement the extended protocol, and
//! bundling the `SET statement_timeout` into the same wire message as
//! the metric SQL keeps a shared session from picking up another
//! task's timeout.

use anyhow::{anyhow, Context, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio_postgres::{Client, NoTls, SimpleQueryMessage};

use pgsentry_common::types::MonitoredDatabase;

pub const APPLICATION_NAME: &str = "pgsentry";
const CONNECT_TIMEOUT_S: u64 = 5;

struct Endpoint {
    conn_str: Mutex<String>,
    client: tokio::sync::Mutex<Option<Arc<Client>>>,
    permits: Arc<tokio::sync::Semaphore>,
    active_permits: AtomicUsize,
}

impl Endpoint {
    fn new(conn_str: String, max_parallel: usize) -> Self {
        Self {
            conn_str: Mutex::new(conn_str),
            client: tokio::sync::Mutex::new(None),
            permits: Arc::new(tokio::sync::Semaphore::new(max_parallel)),
            active_permits: AtomicUsize::new(max_parallel),
        }
    }

    async fn client(&self) -> Result<Arc<Client>> {
        let mut guard = self.client.lock().await;
        if let Some(client) = guard.as_ref() {
            if !client.is_closed() {
                return Ok(Arc::clone(client));
            }
        }
        let conn_str = self.conn_str.lock().unwrap_or_else(|p| p.into_inner()).clone();
        let (client, connection) = tokio::time::timeout(
            Duration::from_secs(CONNECT_TIMEOUT_S + 1),
            tokio_postgres::connect(&conn_str, NoTls),
        )
        .await
        .map_err(|_| anyhow!("connect timed out"))??;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::debug!(error = %e, "endpoint connection closed");
            }
        });
        let client = Arc::new(client);
        *guard = Some(Arc::clone(&client));
        Ok(client)
    }

    async fn discard_if_closed(&self) {
        let mut guard = self.client.lock().await;
        if guard.as_ref().is_some_and(|c| c.is_closed()) {
            *guard = None;
        }
    }
}

/// Registry of endpoint connections, keyed by unique endpoint name.
pub struct ConnectionManager {
    max_parallel_per_db: usize,
    endpoints: RwLock<HashMap<String, Arc<Endpoint>>>,
}

impl ConnectionManager {
    pub fn new(max_parallel_per_db: usize) -> Self {
        Self {
            max_parallel_per_db: max_parallel_per_db.max(1),
            endpoints: RwLock::new(HashMap::new()),
        }
    }

    /// Ensure an endpoint entry exists and reflects the current
    /// connection parameters. A parameter change drops the cached
    /// client so the next statement reconnects.
    pub async fn register(&self, md: &MonitoredDatabase) {
        let conn_str = md.connect_string(APPLICATION_NAME, CONNECT_TIMEOUT_S);
        let existing = {
            let endpoints = self.endpoints.read().unwrap_or_else(|p| p.into_inner());
            endpoints.get(&md.unique_name).cloned()
        };
        match existing {
            None => {
                let endpoint = Arc::new(Endpoint::new(conn_str, self.max_parallel_per_db));
                self.endpoints
                    .write()
                    .unwrap_or_else(|p| p.into_inner())
                    .insert(md.unique_name.clone(), endpoint);
            }
            Some(endpoint) => {
                let changed = {
                    let mut stored =
                        endpoint.conn_str.lock().unwrap_or_else(|p| p.into_inner());
                    if *stored != conn_str {
                        *stored = conn_str;
                        true
                    } else {
                        false
                    }
                };
                if changed {
                    tracing::info!(db = %md.unique_name, "connection parameters changed, reconnecting");
                    endpoint.client.lock().await.take();
                }
            }
        }
    }

    fn endpoint(&self, db_unique: &str) -> Result<Arc<Endpoint>> {
        self.endpoints
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(db_unique)
            .cloned()
            .ok_or_else(|| anyhow!("no connection registered for \"{db_unique}\""))
    }

    /// Run SQL on an endpoint through the simple-query protocol.
    /// `stmt_timeout` is bundled into the same protocol message when
    /// set; pool frontends get the SQL verbatim.
    pub async fn execute(
        &self,
        db_unique: &str,
        stmt_timeout: Option<Duration>,
        sql: &str,
    ) -> Result<Vec<SimpleQueryMessage>> {
        let endpoint = self.endpoint(db_unique)?;
        let _permit = endpoint
            .permits
            .acquire()
            .await
            .context("endpoint semaphore closed")?;
        let client = endpoint.client().await?;

        let combined = match stmt_timeout {
            Some(t) => format!("SET statement_timeout TO {}; {sql}", t.as_millis()),
            None => sql.to_string(),
        };
        match client.simple_query(&combined).await {
            Ok(messages) => Ok(messages),
            Err(e) => {
                endpoint.discard_if_closed().await;
                Err(e.into())
            }
        }
    }

    /// Open a one-off connection outside the registry, e.g. for listing
    /// child databases on a discovery parent.
    pub async fn execute_adhoc(conn_str: &str, sql: &str) -> Result<Vec<SimpleQueryMessage>> {
        let (client, connection) = tokio::time::timeout(
            Duration::from_secs(CONNECT_TIMEOUT_S + 1),
            tokio_postgres::connect(conn_str, NoTls),
        )
        .await
        .map_err(|_| anyhow!("connect timed out"))??;
        let driver = tokio::spawn(async move {
            let _ = connection.await;
        });
        let result = client.simple_query(sql).await.map_err(Into::into);
        drop(client);
        driver.abort();
        result
    }

    /// Shrink an endpoint's statement cap to one (dormant) or restore
    /// the configured cap (active).
    pub fn set_dormant(&self, db_unique: &str, dormant: bool) {
        let Ok(endpoint) = self.endpoint(db_unique) else {
            return;
        };
        let target = if dormant { 1 } else { self.max_parallel_per_db };
        let current = endpoint.active_permits.load(Ordering::Relaxed);
        if target == current {
            return;
        }
        if target > current {
            endpoint.permits.add_permits(target - current);
        } else {
            endpoint.permits.forget_permits(current - target);
        }
        endpoint.active_permits.store(target, Ordering::Relaxed);
        tracing::debug!(db = %db_unique, permits = target, "adjusted endpoint statement cap");
    }

    /// Drop the connection of a removed endpoint.
    pub fn close(&self, db_unique: &str) {
        let removed = self
            .endpoints
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .remove(db_unique);
        if removed.is_some() {
            tracing::debug!(db = %db_unique, "closed endpoint connection");
        }
    }

    pub fn is_registered(&self, db_unique: &str) -> bool {
        self.endpoints
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .contains_key(db_unique)
    }
}
