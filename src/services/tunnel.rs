use async_trait::async_trait;
use russh::client::{DisconnectReason, Handle};
use russh::{ChannelMsg, Disconnect};
use russh_keys::key::PublicKey;
use russh_keys::PublicKeyBase64;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::config::SshConfig;
use crate::error::{TunnelError, TunnelResult};
use crate::models::{TunnelStateSnapshot, TunnelStatus};
use crate::obfuscate::obfuscate;
use crate::services::known_hosts::KnownHostsVerifier;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(20);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Events emitted across a tunnel's lifetime.
#[derive(Debug, Clone)]
pub enum TunnelEvent {
    /// The SSH connection dropped; the local listener on `old_port` is gone.
    Disconnecting { old_port: u16 },
    /// A reconnect succeeded. The listener was rebound, so the ports
    /// usually differ.
    Reconnected { old_port: u16, new_port: u16 },
    /// Reconnect attempts are exhausted; the tunnel is dead until `close`.
    Failed { error: String },
}

/// Local TCP forwarder over a single reusable SSH connection.
///
/// Owns the SSH client, the local listener, and every forwarded socket.
/// Consumers hold only an opaque handle plus event subscriptions.
pub struct SshTunnelManager {
    config: SshConfig,
    target_host: String,
    target_port: u16,
    verifier: Option<Arc<KnownHostsVerifier>>,
    state: RwLock<TunnelRuntimeState>,
    events: broadcast::Sender<TunnelEvent>,
    shutdown: CancellationToken,
    session: Mutex<Option<ActiveSession>>,
}

#[derive(Debug, Default)]
struct TunnelRuntimeState {
    status: TunnelStatus,
    local_port: Option<u16>,
    connected_at: Option<Instant>,
    reconnect_attempts: u32,
    last_error: Option<String>,
}

struct ActiveSession {
    handle: Arc<Mutex<Handle<TunnelHandler>>>,
    local_port: u16,
    /// Cancelling this token tears down the accept loop and every live
    /// forwarded socket of this connection generation.
    generation: CancellationToken,
}

/// russh client handler: host key verification plus disconnect signalling.
#[derive(Clone)]
struct TunnelHandler {
    verifier: Option<Arc<KnownHostsVerifier>>,
    host: String,
    port: u16,
    verified: Arc<AtomicBool>,
    rejection: Arc<StdMutex<Option<String>>>,
    disconnect_tx: mpsc::UnboundedSender<String>,
}

#[async_trait]
impl russh::client::Handler for TunnelHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        let Some(verifier) = &self.verifier else {
            // Strict host key checking disabled by configuration.
            self.verified.store(true, Ordering::SeqCst);
            return Ok(true);
        };

        let key_type = server_public_key.name();
        let key_base64 = server_public_key.public_key_base64();
        let decision = verifier.verify(&self.host, self.port, key_type, &key_base64);
        if decision.verified {
            self.verified.store(true, Ordering::SeqCst);
            Ok(true)
        } else {
            let reason = decision
                .reason
                .unwrap_or_else(|| "host key rejected".to_string());
            log::warn!("{reason}");
            *self.rejection.lock().expect("rejection lock poisoned") = Some(reason);
            Ok(false)
        }
    }

    async fn disconnected(
        &mut self,
        reason: DisconnectReason<Self::Error>,
    ) -> Result<(), Self::Error> {
        let message = match &reason {
            DisconnectReason::ReceivedDisconnect(_) => {
                "SSH connection disconnected by server".to_string()
            }
            DisconnectReason::Error(e) => format!("SSH connection error: {e}"),
        };
        let _ = self.disconnect_tx.send(message);
        match reason {
            DisconnectReason::ReceivedDisconnect(_) => Ok(()),
            DisconnectReason::Error(e) => Err(e),
        }
    }
}

impl SshTunnelManager {
    /// `target_host:target_port` is the database endpoint as seen from the
    /// bastion.
    pub fn new(
        config: SshConfig,
        target_host: String,
        target_port: u16,
    ) -> std::io::Result<Self> {
        let verifier = if config.strict_host_key {
            Some(Arc::new(KnownHostsVerifier::new(
                config.known_hosts_path.clone(),
                config.trust_on_first_use,
            )?))
        } else {
            log::warn!("strict host key checking is disabled; accepting any server key");
            None
        };
        let (events, _) = broadcast::channel(16);
        Ok(SshTunnelManager {
            config,
            target_host,
            target_port,
            verifier,
            state: RwLock::new(TunnelRuntimeState::default()),
            events,
            shutdown: CancellationToken::new(),
            session: Mutex::new(None),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.events.subscribe()
    }

    pub async fn is_connected(&self) -> bool {
        self.state.read().await.status == TunnelStatus::Connected
    }

    pub async fn get_state(&self) -> TunnelStateSnapshot {
        let state = self.state.read().await;
        TunnelStateSnapshot {
            status: state.status,
            local_port: state.local_port,
            uptime_seconds: state
                .connected_at
                .map(|at| at.elapsed().as_secs()),
            reconnect_attempts: state.reconnect_attempts,
            last_error: state.last_error.clone(),
        }
    }

    /// Open the SSH connection and start forwarding. Resolves to the local
    /// port once the tunnel is usable. A first-connect failure is final.
    pub async fn connect(self: &Arc<Self>) -> TunnelResult<u16> {
        self.set_status(TunnelStatus::Connecting, None).await;

        let (active, disconnect_rx) = match self.establish().await {
            Ok(result) => result,
            Err(e) => {
                self.set_failed(e.to_string()).await;
                return Err(e);
            }
        };

        let port = active.local_port;
        *self.session.lock().await = Some(active);
        self.set_connected(port).await;

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            manager.supervise(disconnect_rx).await;
        });

        log::info!(
            "SSH tunnel established: 127.0.0.1:{port} -> {}:{} via {}@{}:{}",
            self.target_host,
            self.target_port,
            self.config.username,
            self.config.host,
            self.config.port
        );
        Ok(port)
    }

    /// Stop the tunnel. Suppresses further reconnects, destroys active
    /// sockets, closes the listener and ends the SSH client.
    pub async fn close(&self) {
        self.shutdown.cancel();
        self.teardown_session().await;
        let mut state = self.state.write().await;
        state.status = TunnelStatus::Disconnected;
        state.local_port = None;
        state.connected_at = None;
    }

    /// Open the SSH connection, bind the local listener and start the
    /// accept loop. Shared by first connect and reconnect.
    async fn establish(
        &self,
    ) -> TunnelResult<(ActiveSession, mpsc::UnboundedReceiver<String>)> {
        // Read and validate the private key before dialing the bastion.
        let key = match &self.config.private_key_path {
            Some(key_path) => {
                check_key_permissions(key_path)?;
                let key = russh_keys::load_secret_key(
                    key_path,
                    self.config.private_key_passphrase.as_deref(),
                )
                .map_err(|e| {
                    TunnelError::PrivateKey(format!(
                        "failed to load private key {}: {e}",
                        key_path.display()
                    ))
                })?;
                Some(key)
            }
            None => None,
        };

        let (disconnect_tx, disconnect_rx) = mpsc::unbounded_channel();
        let verified = Arc::new(AtomicBool::new(false));
        let rejection = Arc::new(StdMutex::new(None));

        let handler = TunnelHandler {
            verifier: self.verifier.clone(),
            host: self.config.host.clone(),
            port: self.config.port,
            verified: verified.clone(),
            rejection: rejection.clone(),
            disconnect_tx,
        };

        // Three missed keepalives end the connection and trigger reconnect.
        let ssh_config = Arc::new(russh::client::Config {
            keepalive_interval: Some(Duration::from_millis(self.config.keepalive_interval_ms)),
            keepalive_max: 3,
            ..Default::default()
        });

        let connect = russh::client::connect(
            ssh_config,
            (self.config.host.as_str(), self.config.port),
            handler,
        );
        let mut handle = match tokio::time::timeout(CONNECT_TIMEOUT, connect).await {
            Ok(Ok(handle)) => handle,
            Ok(Err(e)) => {
                if let Some(reason) = rejection.lock().expect("rejection lock poisoned").take() {
                    return Err(TunnelError::HostKeyRejected(reason));
                }
                return Err(TunnelError::ConnectionFailed(format!(
                    "ssh handshake with {}:{} failed: {e}",
                    self.config.host, self.config.port
                )));
            }
            Err(_) => {
                return Err(TunnelError::ConnectionFailed(format!(
                    "ssh handshake with {}:{} timed out after {}s",
                    self.config.host,
                    self.config.port,
                    CONNECT_TIMEOUT.as_secs()
                )));
            }
        };

        if !verified.load(Ordering::SeqCst) {
            // The handshake completed without a positive verification. That
            // should be impossible; treat it as a rejection.
            let _ = handle
                .disconnect(Disconnect::ByApplication, "", "en")
                .await;
            return Err(TunnelError::HostKeyRejected(
                "handshake completed without host key verification".to_string(),
            ));
        }

        self.authenticate(&mut handle, key).await?;

        let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
        let local_port = listener.local_addr()?.port();

        let handle = Arc::new(Mutex::new(handle));
        let generation = self.shutdown.child_token();

        tokio::spawn(accept_loop(
            listener,
            handle.clone(),
            self.target_host.clone(),
            self.target_port,
            generation.clone(),
        ));

        Ok((
            ActiveSession {
                handle,
                local_port,
                generation,
            },
            disconnect_rx,
        ))
    }

    async fn authenticate(
        &self,
        handle: &mut Handle<TunnelHandler>,
        key: Option<russh_keys::key::KeyPair>,
    ) -> TunnelResult<()> {
        if let Some(key) = key {
            let authenticated = handle
                .authenticate_publickey(&self.config.username, Arc::new(key))
                .await
                .map_err(|e| TunnelError::AuthenticationFailed(e.to_string()))?;
            if !authenticated {
                return Err(TunnelError::AuthenticationFailed(format!(
                    "server rejected public key for user {}",
                    self.config.username
                )));
            }
            return Ok(());
        }

        if let Some(password) = &self.config.password {
            let authenticated = handle
                .authenticate_password(&self.config.username, password)
                .await
                .map_err(|e| TunnelError::AuthenticationFailed(e.to_string()))?;
            if !authenticated {
                return Err(TunnelError::AuthenticationFailed(format!(
                    "server rejected password for user {}",
                    self.config.username
                )));
            }
            return Ok(());
        }

        Err(TunnelError::AuthenticationFailed(
            "no SSH authentication method configured; set SSH_PRIVATE_KEY_PATH or SSH_PASSWORD"
                .to_string(),
        ))
    }

    /// Watch for disconnects and drive the reconnect loop until shutdown.
    async fn supervise(self: Arc<Self>, mut disconnect_rx: mpsc::UnboundedReceiver<String>) {
        loop {
            let message = tokio::select! {
                _ = self.shutdown.cancelled() => return,
                message = disconnect_rx.recv() => {
                    message.unwrap_or_else(|| "SSH connection closed".to_string())
                }
            };
            if self.shutdown.is_cancelled() {
                return;
            }

            log::warn!("SSH tunnel lost: {}", obfuscate(&message));
            let old_port = self.teardown_session().await.unwrap_or(0);
            {
                let mut state = self.state.write().await;
                state.status = TunnelStatus::Reconnecting;
                state.local_port = None;
                state.connected_at = None;
                state.last_error = Some(obfuscate(&message));
            }
            let _ = self.events.send(TunnelEvent::Disconnecting { old_port });

            match self.reconnect_loop().await {
                Ok((new_rx, new_port)) => {
                    log::info!("SSH tunnel reconnected on 127.0.0.1:{new_port}");
                    let _ = self
                        .events
                        .send(TunnelEvent::Reconnected { old_port, new_port });
                    disconnect_rx = new_rx;
                }
                Err(TunnelError::Closed) => return,
                Err(e) => {
                    let error = obfuscate(&e.to_string());
                    log::error!("SSH tunnel failed permanently: {error}");
                    self.set_failed(error.clone()).await;
                    let _ = self.events.send(TunnelEvent::Failed { error });
                    return;
                }
            }
        }
    }

    /// Exponential backoff: `min(30s, 1s * 2^attempts)` before each try.
    /// `max_reconnect_attempts == -1` retries forever.
    async fn reconnect_loop(
        &self,
    ) -> TunnelResult<(mpsc::UnboundedReceiver<String>, u16)> {
        let max_attempts = self.config.max_reconnect_attempts;
        loop {
            let attempts = self.state.read().await.reconnect_attempts;
            let backoff = backoff_delay(attempts);
            log::info!(
                "reconnecting SSH tunnel in {:.1}s (attempt {})",
                backoff.as_secs_f64(),
                attempts + 1
            );
            tokio::select! {
                _ = self.shutdown.cancelled() => return Err(TunnelError::Closed),
                _ = tokio::time::sleep(backoff) => {}
            }

            self.set_status(TunnelStatus::Connecting, None).await;
            match self.establish().await {
                Ok((active, disconnect_rx)) => {
                    let port = active.local_port;
                    *self.session.lock().await = Some(active);
                    self.set_connected(port).await;
                    return Ok((disconnect_rx, port));
                }
                Err(e) => {
                    let error = obfuscate(&e.to_string());
                    log::warn!("reconnect attempt failed: {error}");
                    let exhausted = {
                        let mut state = self.state.write().await;
                        state.status = TunnelStatus::Reconnecting;
                        state.reconnect_attempts += 1;
                        state.last_error = Some(error.clone());
                        max_attempts >= 0 && state.reconnect_attempts >= max_attempts as u32
                    };
                    if exhausted {
                        return Err(TunnelError::ReconnectExhausted(error));
                    }
                }
            }
        }
    }

    /// Destroy the active session, returning its local port if one existed.
    async fn teardown_session(&self) -> Option<u16> {
        let session = self.session.lock().await.take()?;
        session.generation.cancel();
        {
            let handle = session.handle.lock().await;
            let _ = handle
                .disconnect(Disconnect::ByApplication, "", "en")
                .await;
        }
        Some(session.local_port)
    }

    async fn set_status(&self, status: TunnelStatus, error: Option<String>) {
        let mut state = self.state.write().await;
        state.status = status;
        if let Some(error) = error {
            state.last_error = Some(error);
        }
    }

    async fn set_connected(&self, port: u16) {
        let mut state = self.state.write().await;
        state.status = TunnelStatus::Connected;
        state.local_port = Some(port);
        state.connected_at = Some(Instant::now());
        state.reconnect_attempts = 0;
        state.last_error = None;
    }

    async fn set_failed(&self, error: String) {
        let mut state = self.state.write().await;
        state.status = TunnelStatus::Failed;
        state.local_port = None;
        state.connected_at = None;
        state.last_error = Some(obfuscate(&error));
    }
}

fn backoff_delay(attempts: u32) -> Duration {
    let exp = Duration::from_secs(2u64.saturating_pow(attempts.min(16)));
    exp.min(MAX_BACKOFF)
}

/// Reject keys readable by group or others, with an actionable message.
#[cfg(unix)]
fn check_key_permissions(path: &std::path::Path) -> TunnelResult<()> {
    use std::os::unix::fs::PermissionsExt;
    let metadata = std::fs::metadata(path).map_err(|e| {
        TunnelError::PrivateKey(format!("cannot read private key {}: {e}", path.display()))
    })?;
    let mode = metadata.permissions().mode();
    if mode & 0o077 != 0 {
        return Err(TunnelError::PrivateKey(format!(
            "private key {} is accessible by group/others (mode {:o}); \
             run: chmod 600 {}",
            path.display(),
            mode & 0o777,
            path.display()
        )));
    }
    Ok(())
}

#[cfg(not(unix))]
fn check_key_permissions(_path: &std::path::Path) -> TunnelResult<()> {
    Ok(())
}

/// Accept inbound TCP connections and forward each through its own
/// direct-tcpip channel until the generation token is cancelled.
async fn accept_loop(
    listener: TcpListener,
    handle: Arc<Mutex<Handle<TunnelHandler>>>,
    target_host: String,
    target_port: u16,
    generation: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = generation.cancelled() => break,
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        let channel = {
                            let guard = handle.lock().await;
                            guard
                                .channel_open_direct_tcpip(
                                    &target_host,
                                    target_port as u32,
                                    "127.0.0.1",
                                    peer.port() as u32,
                                )
                                .await
                        };
                        match channel {
                            Ok(channel) => {
                                tokio::spawn(forward_connection(
                                    stream,
                                    channel,
                                    generation.child_token(),
                                ));
                            }
                            Err(e) => {
                                log::warn!("failed to open forwarding channel: {e}");
                            }
                        }
                    }
                    Err(e) => {
                        log::warn!("failed to accept tunnel connection: {e}");
                    }
                }
            }
        }
    }
}

/// Bidirectionally pipe bytes between the local socket and the SSH channel.
/// Either side closing or erroring tears down both.
async fn forward_connection(
    mut stream: TcpStream,
    mut channel: russh::Channel<russh::client::Msg>,
    cancel: CancellationToken,
) {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let (mut reader, mut writer) = stream.split();
    let mut buffer = [0u8; 8192];

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            result = reader.read(&mut buffer) => {
                match result {
                    Ok(0) => break,
                    Ok(n) => {
                        if channel.data(&buffer[..n]).await.is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
            msg = channel.wait() => {
                match msg {
                    Some(ChannelMsg::Data { ref data }) => {
                        if writer.write_all(data).await.is_err() {
                            break;
                        }
                        if writer.flush().await.is_err() {
                            break;
                        }
                    }
                    Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => break,
                    _ => {}
                }
            }
        }
    }

    let _ = channel.eof().await;
    let _ = channel.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_is_capped_exponential() {
        assert_eq!(backoff_delay(0), Duration::from_secs(1));
        assert_eq!(backoff_delay(1), Duration::from_secs(2));
        assert_eq!(backoff_delay(3), Duration::from_secs(8));
        assert_eq!(backoff_delay(5), Duration::from_secs(30));
        assert_eq!(backoff_delay(30), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_initial_state_is_disconnected() {
        let config = SshConfig {
            host: "bastion".to_string(),
            port: 22,
            username: "deploy".to_string(),
            password: Some("x".to_string()),
            private_key_path: None,
            private_key_passphrase: None,
            strict_host_key: false,
            trust_on_first_use: true,
            known_hosts_path: std::env::temp_dir().join("unused_known_hosts"),
            keepalive_interval_ms: 10_000,
            max_reconnect_attempts: 5,
        };
        let manager = SshTunnelManager::new(config, "db".to_string(), 5432).unwrap();
        let snapshot = manager.get_state().await;
        assert_eq!(snapshot.status, TunnelStatus::Disconnected);
        assert!(snapshot.local_port.is_none());
        assert_eq!(snapshot.reconnect_attempts, 0);
        assert!(!manager.is_connected().await);
    }

    #[cfg(unix)]
    #[test]
    fn test_key_permission_check() {
        use std::os::unix::fs::PermissionsExt;
        let path = std::env::temp_dir().join(format!("key_{}", uuid::Uuid::new_v4()));
        std::fs::write(&path, "dummy").unwrap();

        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();
        let err = check_key_permissions(&path).unwrap_err();
        assert!(err.to_string().contains("chmod 600"));

        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)).unwrap();
        assert!(check_key_permissions(&path).is_ok());

        std::fs::remove_file(&path).unwrap();
    }
}
