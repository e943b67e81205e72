use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::{broadcast, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::protocol::McpServer;
use crate::tools::ToolRegistry;

/// One stateful HTTP session: a dedicated server instance keyed by the
/// `mcp-session-id` header, plus its SSE notification channel.
pub struct McpSession {
    pub id: String,
    pub server: McpServer,
    pub notifications: broadcast::Sender<String>,
    last_access: StdMutex<Instant>,
}

impl McpSession {
    fn new(id: String, registry: Arc<ToolRegistry>) -> Self {
        let (notifications, _) = broadcast::channel(32);
        McpSession {
            id,
            server: McpServer::new(registry),
            notifications,
            last_access: StdMutex::new(Instant::now()),
        }
    }

    /// Refresh the idle clock. `last_access` only ever moves forward.
    pub fn touch(&self) {
        let mut last_access = self.last_access.lock().expect("session clock poisoned");
        *last_access = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_access
            .lock()
            .expect("session clock poisoned")
            .elapsed()
    }
}

/// Stateful session map with TTL sweeping.
pub struct SessionStore {
    registry: Arc<ToolRegistry>,
    sessions: DashMap<String, Arc<McpSession>>,
    ttl: Duration,
}

impl SessionStore {
    pub fn new(registry: Arc<ToolRegistry>, ttl: Duration) -> Self {
        SessionStore {
            registry,
            sessions: DashMap::new(),
            ttl,
        }
    }

    pub fn create(&self) -> Arc<McpSession> {
        let id = uuid::Uuid::new_v4().to_string();
        let session = Arc::new(McpSession::new(id.clone(), self.registry.clone()));
        self.sessions.insert(id, session.clone());
        session
    }

    /// Look up a session and refresh its idle clock.
    pub fn get(&self, id: &str) -> Option<Arc<McpSession>> {
        let session = self.sessions.get(id)?.clone();
        session.touch();
        Some(session)
    }

    pub fn remove(&self, id: &str) -> bool {
        self.sessions.remove(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn clear(&self) {
        self.sessions.clear();
    }

    /// Periodically drop sessions idle past the TTL. Iterates over a
    /// snapshot of the key set so concurrent mutation is safe.
    pub fn start_sweeper(self: &Arc<Self>, interval: Duration, shutdown: CancellationToken) {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                let keys: Vec<String> = store
                    .sessions
                    .iter()
                    .map(|entry| entry.key().clone())
                    .collect();
                for key in keys {
                    let expired = store
                        .sessions
                        .get(&key)
                        .map(|session| session.idle_for() > store.ttl)
                        .unwrap_or(false);
                    if expired && store.sessions.remove(&key).is_some() {
                        log::info!("expired idle session {key}");
                    }
                }
            }
        });
    }
}

/// Fixed-size pool of protocol server instances for stateless mode.
/// Waiters are woken FIFO as instances come back.
pub struct ServerPool {
    servers: StdMutex<Vec<McpServer>>,
    gate: Arc<Semaphore>,
}

impl ServerPool {
    pub fn new(size: usize, registry: Arc<ToolRegistry>) -> Self {
        let size = size.max(1);
        let servers = (0..size).map(|_| McpServer::new(registry.clone())).collect();
        ServerPool {
            servers: StdMutex::new(servers),
            gate: Arc::new(Semaphore::new(size)),
        }
    }

    /// Borrow a server instance. `None` only if the pool has been shut
    /// down underneath us.
    pub async fn acquire(self: &Arc<Self>) -> Option<ServerLease> {
        let permit = self.gate.clone().acquire_owned().await.ok()?;
        let server = self
            .servers
            .lock()
            .expect("server pool lock poisoned")
            .pop()
            .expect("permit guarantees an available server");
        Some(ServerLease {
            server: Some(server),
            pool: Arc::clone(self),
            _permit: permit,
        })
    }
}

/// A borrowed stateless server. Dropping the lease scrubs client state and
/// returns the instance to the pool.
pub struct ServerLease {
    server: Option<McpServer>,
    pool: Arc<ServerPool>,
    _permit: OwnedSemaphorePermit,
}

impl ServerLease {
    pub fn server(&self) -> &McpServer {
        self.server.as_ref().expect("lease holds a server until drop")
    }
}

impl Drop for ServerLease {
    fn drop(&mut self) {
        if let Some(server) = self.server.take() {
            server.reset();
            self.pool
                .servers
                .lock()
                .expect("server pool lock poisoned")
                .push(server);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::services::ConnectionManager;
    use std::collections::HashMap;

    fn test_registry() -> Arc<ToolRegistry> {
        let vars: HashMap<String, String> = [
            ("DATABASE_NAME".to_string(), "appdb".to_string()),
            ("DATABASE_USER".to_string(), "app".to_string()),
        ]
        .into_iter()
        .collect();
        let config = Config::from_map(&vars).unwrap();
        Arc::new(ToolRegistry::new(Arc::new(ConnectionManager::new(&config))))
    }

    #[tokio::test]
    async fn test_session_lifecycle() {
        let store = SessionStore::new(test_registry(), Duration::from_secs(60));
        let session = store.create();
        assert_eq!(store.len(), 1);
        assert!(store.get(&session.id).is_some());
        assert!(store.remove(&session.id));
        assert!(store.get(&session.id).is_none());
        assert!(!store.remove(&session.id));
    }

    #[tokio::test]
    async fn test_session_ids_are_unique() {
        let store = SessionStore::new(test_registry(), Duration::from_secs(60));
        let a = store.create();
        let b = store.create();
        assert_ne!(a.id, b.id);
    }

    #[tokio::test]
    async fn test_touch_refreshes_idle_clock() {
        let store = SessionStore::new(test_registry(), Duration::from_secs(60));
        let session = store.create();
        std::thread::sleep(Duration::from_millis(10));
        let idle_before = session.idle_for();
        session.touch();
        assert!(session.idle_for() < idle_before);
    }

    #[tokio::test]
    async fn test_sweeper_expires_idle_sessions() {
        let store = Arc::new(SessionStore::new(test_registry(), Duration::from_millis(1)));
        let session = store.create();
        let shutdown = CancellationToken::new();
        store.start_sweeper(Duration::from_millis(5), shutdown.clone());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(store.get(&session.id).is_none());
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_server_pool_recycles_instances() {
        let pool = Arc::new(ServerPool::new(2, test_registry()));
        let lease_a = pool.acquire().await.unwrap();
        let _lease_b = pool.acquire().await.unwrap();
        // Pool exhausted; releasing one lease unblocks the next acquire.
        drop(lease_a);
        let _lease_c = pool.acquire().await.unwrap();
    }
}
