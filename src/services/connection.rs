use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions, PgRow, PgSslMode};
use sqlx::{Postgres, Transaction};
use tokio::sync::{RwLock, Semaphore};

use crate::config::{Config, DatabaseConfig, QueryLimits, SshConfig};
use crate::error::{DbResult, QueryError};
use crate::models::{ConnectionStatus, PoolStatus, QueryParam, QueryResult};
use crate::obfuscate::obfuscate;
use crate::services::rows::{field_info, row_to_json};
use crate::services::sql_guard;
use crate::services::tunnel::{SshTunnelManager, TunnelEvent};

const POOL_MAX_CONNECTIONS: u32 = 10;
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(30);
const POOL_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

const MSG_NOT_INITIALIZED: &str = "Connection not initialized";
const MSG_RECONNECTING: &str = "Database connection lost, reconnecting...";

/// Pooled PostgreSQL access with read-only enforcement, cursor-based row
/// capping, a global concurrency gate, and hot pool re-creation when the
/// SSH tunnel reconnects on a different local port.
pub struct ConnectionManager {
    db_config: DatabaseConfig,
    ssh_config: Option<SshConfig>,
    limits: QueryLimits,
    drain_timeout: Duration,
    ssl_enabled: bool,
    tunnel: RwLock<Option<Arc<SshTunnelManager>>>,
    pool: RwLock<Option<PgPool>>,
    query_gate: Arc<Semaphore>,
    in_flight: Arc<AtomicUsize>,
    waiting: Arc<AtomicUsize>,
    initialized: AtomicBool,
    reconnecting: AtomicBool,
}

/// Increments a counter for its lifetime.
struct CounterGuard {
    counter: Arc<AtomicUsize>,
}

impl CounterGuard {
    fn new(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        CounterGuard {
            counter: counter.clone(),
        }
    }
}

impl Drop for CounterGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ConnectionManager {
    pub fn new(config: &Config) -> Self {
        let ssl_enabled = match config.database.ssl {
            Some(explicit) => explicit,
            None => !is_local_host(&config.database.host),
        };
        ConnectionManager {
            db_config: config.database.clone(),
            ssh_config: config.ssh.clone(),
            limits: config.limits.clone(),
            drain_timeout: Duration::from_millis(config.limits.pool_drain_timeout_ms),
            ssl_enabled,
            tunnel: RwLock::new(None),
            pool: RwLock::new(None),
            query_gate: Arc::new(Semaphore::new(config.limits.max_concurrent_queries)),
            in_flight: Arc::new(AtomicUsize::new(0)),
            waiting: Arc::new(AtomicUsize::new(0)),
            initialized: AtomicBool::new(false),
            reconnecting: AtomicBool::new(false),
        }
    }

    pub fn read_only(&self) -> bool {
        self.limits.read_only
    }

    /// Connect the tunnel (when configured), build the pool, and prove the
    /// database is reachable. A failure here leaves the manager closed.
    pub async fn initialize(self: &Arc<Self>) -> anyhow::Result<()> {
        let tunnel_port = match &self.ssh_config {
            Some(ssh_config) => {
                let tunnel = Arc::new(
                    SshTunnelManager::new(
                        ssh_config.clone(),
                        self.db_config.host.clone(),
                        self.db_config.port,
                    )
                    .context("failed to load known_hosts")?,
                );
                let events = tunnel.subscribe();
                let port = tunnel.connect().await?;
                *self.tunnel.write().await = Some(tunnel);

                let manager = Arc::clone(self);
                tokio::spawn(async move {
                    manager.handle_tunnel_events(events).await;
                });
                Some(port)
            }
            None => None,
        };

        let pool = self
            .build_pool(tunnel_port)
            .await
            .context("failed to build connection pool")?;
        sqlx::query("SELECT 1")
            .execute(&pool)
            .await
            .context("database connectivity check failed")?;

        *self.pool.write().await = Some(pool);
        self.reconnecting.store(false, Ordering::SeqCst);
        self.initialized.store(true, Ordering::SeqCst);
        log::info!(
            "connected to database {} ({} mode)",
            self.db_config.database,
            if self.limits.read_only { "read-only" } else { "read-write" }
        );
        Ok(())
    }

    async fn build_pool(&self, tunnel_port: Option<u16>) -> Result<PgPool, sqlx::Error> {
        let (host, port) = self.effective_endpoint(tunnel_port);

        let mut options = PgConnectOptions::new()
            .host(&host)
            .port(port)
            .database(&self.db_config.database)
            .username(&self.db_config.user)
            .application_name("postgresql-ssh-mcp")
            .options([(
                "statement_timeout",
                self.limits.query_timeout_ms.to_string(),
            )]);
        if let Some(password) = &self.db_config.password {
            options = options.password(password);
        }
        options = if self.ssl_enabled {
            let mut options = options.ssl_mode(if self.db_config.ssl_reject_unauthorized {
                PgSslMode::VerifyFull
            } else {
                PgSslMode::Require
            });
            if let Some(ca_path) = &self.db_config.ssl_ca_path {
                options = options.ssl_root_cert(ca_path);
            }
            options
        } else {
            options.ssl_mode(PgSslMode::Disable)
        };

        PgPoolOptions::new()
            .max_connections(POOL_MAX_CONNECTIONS)
            .idle_timeout(POOL_IDLE_TIMEOUT)
            .acquire_timeout(POOL_CONNECT_TIMEOUT)
            .connect_with(options)
            .await
    }

    fn effective_endpoint(&self, tunnel_port: Option<u16>) -> (String, u16) {
        match tunnel_port {
            Some(port) => ("127.0.0.1".to_string(), port),
            None => (self.db_config.host.clone(), self.db_config.port),
        }
    }

    async fn handle_tunnel_events(
        self: Arc<Self>,
        mut events: tokio::sync::broadcast::Receiver<TunnelEvent>,
    ) {
        loop {
            match events.recv().await {
                Ok(TunnelEvent::Disconnecting { old_port }) => {
                    log::warn!("tunnel on port {old_port} lost; queries fail fast until recovery");
                    self.reconnecting.store(true, Ordering::SeqCst);
                }
                Ok(TunnelEvent::Reconnected { old_port, new_port }) => {
                    log::info!("tunnel moved {old_port} -> {new_port}; rebuilding pool");
                    match self.build_pool(Some(new_port)).await {
                        Ok(new_pool) => {
                            let old_pool = self.pool.write().await.replace(new_pool);
                            if let Some(old_pool) = old_pool {
                                let drain_timeout = self.drain_timeout;
                                tokio::spawn(async move {
                                    drain_pool(old_pool, drain_timeout).await;
                                });
                            }
                            self.reconnecting.store(false, Ordering::SeqCst);
                            self.initialized.store(true, Ordering::SeqCst);
                        }
                        Err(e) => {
                            log::error!(
                                "failed to rebuild pool after reconnect: {}",
                                obfuscate(&e.to_string())
                            );
                            self.initialized.store(false, Ordering::SeqCst);
                        }
                    }
                }
                Ok(TunnelEvent::Failed { error }) => {
                    log::error!("tunnel failed permanently: {error}");
                    self.reconnecting.store(false, Ordering::SeqCst);
                    self.initialized.store(false, Ordering::SeqCst);
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    log::warn!("tunnel event stream lagged, skipped {skipped} events");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    /// Run one statement under the safety policy and return its envelope.
    pub async fn execute_query(
        &self,
        sql: &str,
        params: &[QueryParam],
    ) -> DbResult<QueryResult> {
        if self.reconnecting.load(Ordering::SeqCst) {
            return Err(QueryError::Pool(MSG_RECONNECTING.to_string()));
        }
        if !self.initialized.load(Ordering::SeqCst) {
            return Err(QueryError::Pool(MSG_NOT_INITIALIZED.to_string()));
        }

        if self.limits.read_only {
            sql_guard::validate_read_only(sql).map_err(QueryError::Validation)?;
        }

        // FIFO concurrency gate; the permit is released on every exit path.
        let _permit = {
            let _waiting = CounterGuard::new(&self.waiting);
            self.query_gate
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| QueryError::Pool(MSG_NOT_INITIALIZED.to_string()))?
        };
        let _in_flight = CounterGuard::new(&self.in_flight);

        let pool = self
            .pool
            .read()
            .await
            .clone()
            .ok_or_else(|| QueryError::Pool(MSG_NOT_INITIALIZED.to_string()))?;

        let cursor_eligible = sql_guard::is_cursor_eligible(sql);
        let command = sql_guard::first_keyword(sql);

        let (rows, truncated) = if self.limits.read_only {
            self.run_read_only(&pool, sql, params, cursor_eligible).await?
        } else {
            self.run_read_write(&pool, sql, params, cursor_eligible).await?
        };

        let fields = rows.first().map(field_info);
        let json_rows: Vec<serde_json::Value> = rows.iter().map(row_to_json).collect();
        Ok(QueryResult {
            row_count: json_rows.len(),
            rows: json_rows,
            truncated,
            fields,
            command,
        })
    }

    /// Everything runs inside `BEGIN … READ ONLY` and is rolled back.
    async fn run_read_only(
        &self,
        pool: &PgPool,
        sql: &str,
        params: &[QueryParam],
        cursor_eligible: bool,
    ) -> DbResult<(Vec<PgRow>, bool)> {
        let mut tx = pool.begin().await?;
        sqlx::query("SET TRANSACTION READ ONLY")
            .execute(&mut *tx)
            .await?;

        let outcome = if cursor_eligible {
            self.fetch_with_cursor(&mut tx, sql, params).await
        } else {
            run_capped(&mut tx, sql, params, self.limits.max_rows).await
        };

        let _ = tx.rollback().await;
        outcome
    }

    /// Write mode: cursors still bound row consumption, wrapped in a
    /// committed transaction; everything else runs directly with a
    /// client-side cap.
    async fn run_read_write(
        &self,
        pool: &PgPool,
        sql: &str,
        params: &[QueryParam],
        cursor_eligible: bool,
    ) -> DbResult<(Vec<PgRow>, bool)> {
        if cursor_eligible {
            let mut tx = pool.begin().await?;
            match self.fetch_with_cursor(&mut tx, sql, params).await {
                Ok(outcome) => {
                    tx.commit().await?;
                    Ok(outcome)
                }
                Err(e) => {
                    let _ = tx.rollback().await;
                    Err(e)
                }
            }
        } else {
            let query = bind_params(sqlx::query(sql), params).persistent(false);
            let mut rows = query.fetch_all(pool).await?;
            let truncated = rows.len() > self.limits.max_rows;
            rows.truncate(self.limits.max_rows);
            Ok((rows, truncated))
        }
    }

    /// `DECLARE … CURSOR FOR <sql>` then fetch `max_rows + 1` to learn
    /// whether the result was truncated without reading the full set.
    async fn fetch_with_cursor(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        sql: &str,
        params: &[QueryParam],
    ) -> DbResult<(Vec<PgRow>, bool)> {
        let cursor_name = format!(
            "mcp_cursor_{}_{:08x}",
            chrono::Utc::now().timestamp_millis(),
            rand::random::<u32>()
        );

        let declare_sql = format!("DECLARE {cursor_name} CURSOR FOR {sql}");
        bind_params(sqlx::query(&declare_sql), params)
            .persistent(false)
            .execute(&mut **tx)
            .await?;

        let fetch_sql = format!("FETCH {} FROM {cursor_name}", self.limits.max_rows + 1);
        let fetched = sqlx::query(&fetch_sql)
            .persistent(false)
            .fetch_all(&mut **tx)
            .await;

        // Best effort; after a fetch error the transaction is aborted and
        // the cursor dies with it.
        let close_sql = format!("CLOSE {cursor_name}");
        let _ = sqlx::query(&close_sql)
            .persistent(false)
            .execute(&mut **tx)
            .await;

        let mut rows = fetched?;
        let truncated = rows.len() > self.limits.max_rows;
        rows.truncate(self.limits.max_rows);
        Ok((rows, truncated))
    }

    /// Live status snapshot; available even when the pool is down.
    pub async fn get_status(&self) -> ConnectionStatus {
        let tunnel_state = match self.tunnel.read().await.as_ref() {
            Some(tunnel) => Some(tunnel.get_state().await),
            None => None,
        };
        let tunnel_port = tunnel_state.as_ref().and_then(|s| s.local_port);
        let (host, port) = self.effective_endpoint(tunnel_port);

        let pool_status = self.pool.read().await.as_ref().map(|pool| PoolStatus {
            total_connections: pool.size(),
            idle_connections: pool.num_idle() as u32,
            in_flight_queries: self.in_flight.load(Ordering::SeqCst),
            waiting_queries: self.waiting.load(Ordering::SeqCst),
        });

        ConnectionStatus {
            initialized: self.initialized.load(Ordering::SeqCst),
            reconnecting: self.reconnecting.load(Ordering::SeqCst),
            read_only: self.limits.read_only,
            database: self.db_config.database.clone(),
            host,
            port,
            ssl_enabled: self.ssl_enabled,
            tunnel: tunnel_state,
            pool: pool_status,
        }
    }

    /// Cheap readiness probe.
    pub async fn health_check(&self) -> DbResult<()> {
        let pool = self
            .pool
            .read()
            .await
            .clone()
            .ok_or_else(|| QueryError::Pool(MSG_NOT_INITIALIZED.to_string()))?;
        sqlx::query("SELECT 1").execute(&pool).await?;
        Ok(())
    }

    /// Close the pool, then the tunnel. Idempotent.
    pub async fn close(&self) {
        self.initialized.store(false, Ordering::SeqCst);
        self.reconnecting.store(false, Ordering::SeqCst);
        if let Some(pool) = self.pool.write().await.take() {
            drain_pool(pool, self.drain_timeout).await;
        }
        if let Some(tunnel) = self.tunnel.write().await.take() {
            tunnel.close().await;
        }
    }
}

/// Direct execution inside a transaction with a client-side row cap.
async fn run_capped(
    tx: &mut Transaction<'_, Postgres>,
    sql: &str,
    params: &[QueryParam],
    max_rows: usize,
) -> DbResult<(Vec<PgRow>, bool)> {
    let mut rows = bind_params(sqlx::query(sql), params)
        .persistent(false)
        .fetch_all(&mut **tx)
        .await?;
    let truncated = rows.len() > max_rows;
    rows.truncate(max_rows);
    Ok((rows, truncated))
}

async fn drain_pool(pool: PgPool, drain_timeout: Duration) {
    if tokio::time::timeout(drain_timeout, pool.close()).await.is_err() {
        log::warn!(
            "pool drain exceeded {}ms; dropping remaining connections",
            drain_timeout.as_millis()
        );
    }
}

fn bind_params<'q>(
    mut query: sqlx::query::Query<'q, Postgres, sqlx::postgres::PgArguments>,
    params: &[QueryParam],
) -> sqlx::query::Query<'q, Postgres, sqlx::postgres::PgArguments> {
    for param in params {
        query = match param {
            QueryParam::Null => query.bind(None::<String>),
            QueryParam::Bool(b) => query.bind(*b),
            QueryParam::Int(i) => query.bind(*i),
            QueryParam::Float(f) => query.bind(*f),
            QueryParam::Text(s) => query.bind(s.clone()),
        };
    }
    query
}

fn is_local_host(host: &str) -> bool {
    matches!(host, "localhost" | "127.0.0.1" | "::1")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn manager_from(vars: &[(&str, &str)]) -> ConnectionManager {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ConnectionManager::new(&Config::from_map(&map).unwrap())
    }

    fn base_vars() -> Vec<(&'static str, &'static str)> {
        vec![("DATABASE_NAME", "appdb"), ("DATABASE_USER", "app")]
    }

    #[test]
    fn test_ssl_auto_detection() {
        let mut vars = base_vars();
        vars.push(("DATABASE_HOST", "127.0.0.1"));
        assert!(!manager_from(&vars).ssl_enabled);

        let mut vars = base_vars();
        vars.push(("DATABASE_HOST", "db.internal"));
        assert!(manager_from(&vars).ssl_enabled);

        let mut vars = base_vars();
        vars.push(("DATABASE_HOST", "db.internal"));
        vars.push(("DATABASE_SSL", "false"));
        assert!(!manager_from(&vars).ssl_enabled);

        let mut vars = base_vars();
        vars.push(("DATABASE_HOST", "localhost"));
        vars.push(("DATABASE_SSL", "true"));
        assert!(manager_from(&vars).ssl_enabled);
    }

    #[tokio::test]
    async fn test_uninitialized_manager_fails_fast() {
        let manager = Arc::new(manager_from(&base_vars()));
        let err = manager.execute_query("SELECT 1", &[]).await.unwrap_err();
        assert!(matches!(err, QueryError::Pool(_)));
        assert_eq!(err.to_string(), MSG_NOT_INITIALIZED);
    }

    #[tokio::test]
    async fn test_pool_error_precedes_validation() {
        // The pool-absent fast path fires before SQL validation, so even an
        // invalid statement reports the pool error while uninitialized.
        let manager = Arc::new(manager_from(&base_vars()));
        let err = manager
            .execute_query("DELETE FROM users", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, QueryError::Pool(_)));
    }

    #[tokio::test]
    async fn test_status_without_pool() {
        let manager = Arc::new(manager_from(&base_vars()));
        let status = manager.get_status().await;
        assert!(!status.initialized);
        assert!(status.pool.is_none());
        assert!(status.tunnel.is_none());
        assert_eq!(status.database, "appdb");
    }

    #[test]
    fn test_is_local_host() {
        assert!(is_local_host("localhost"));
        assert!(is_local_host("127.0.0.1"));
        assert!(is_local_host("::1"));
        assert!(!is_local_host("db.internal"));
    }
}
