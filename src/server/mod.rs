pub mod session;
pub mod table;

use crate::provider::Provider;
use crate::transport::TransportError;
use session::{ChatSession, SessionConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use table::ConnectionTable;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::watch;

const LISTEN_BACKLOG: u32 = 128;
/// How long `run` waits for workers to notice shutdown before aborting them.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);
const ACCEPT_ERROR_PAUSE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    pub max_connections: usize,
    pub session: SessionConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 8080)),
            max_connections: 10,
            session: SessionConfig::default(),
        }
    }
}

/// Listening socket plus the table of live connections.
pub struct ConnectionServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    table: Arc<ConnectionTable>,
    provider: Arc<dyn Provider>,
    session: SessionConfig,
    running: Arc<watch::Sender<bool>>,
}

/// Cloneable control handle for a running server.
#[derive(Clone)]
pub struct ServerHandle {
    running: Arc<watch::Sender<bool>>,
    table: Arc<ConnectionTable>,
}

impl ServerHandle {
    /// Stop accepting and close every active connection.
    pub fn stop(&self) {
        if !self.running.send_replace(false) {
            return;
        }
        let closed = self.table.close_all();
        tracing::info!(closed, "stopping server");
    }

    pub fn is_running(&self) -> bool {
        *self.running.borrow()
    }

    pub fn active_connections(&self) -> usize {
        self.table.active()
    }
}

impl ConnectionServer {
    pub async fn bind(
        config: &ServerConfig,
        provider: Arc<dyn Provider>,
    ) -> Result<Self, TransportError> {
        let addr = config.bind;
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(|source| TransportError::Bind { addr, source })?;
        socket
            .set_reuseaddr(true)
            .map_err(|source| TransportError::Bind { addr, source })?;
        socket
            .bind(addr)
            .map_err(|source| TransportError::Bind { addr, source })?;
        let listener = socket
            .listen(LISTEN_BACKLOG)
            .map_err(|source| TransportError::Listen { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| TransportError::Listen { addr, source })?;

        let (running, _) = watch::channel(true);
        tracing::info!(
            %local_addr,
            max_connections = config.max_connections,
            provider = provider.name(),
            "server listening"
        );

        Ok(Self {
            listener,
            local_addr,
            table: ConnectionTable::new(config.max_connections),
            provider,
            session: config.session.clone(),
            running: Arc::new(running),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            running: Arc::clone(&self.running),
            table: Arc::clone(&self.table),
        }
    }

    /// Accept connections until stopped, then tear down.
    pub async fn run(self) {
        let mut running = self.running.subscribe();

        while *running.borrow_and_update() {
            tokio::select! {
                _ = running.changed() => continue,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => self.admit(stream, peer),
                    Err(e) => {
                        if *running.borrow() {
                            tracing::warn!(error = %e, "failed to accept client connection");
                        }
                        pause_unless_stopped(&mut running, ACCEPT_ERROR_PAUSE).await;
                    }
                },
            }
        }

        let Self { listener, table, .. } = self;
        drop(listener);
        table.close_all();

        let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
        while table.active() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let aborted = table.abort_remaining();
        tracing::info!(aborted, "server stopped");
    }

    fn admit(&self, stream: TcpStream, peer: SocketAddr) {
        let provider = Arc::clone(&self.provider);
        let config = self.session.clone();

        let claimed = self.table.try_claim(peer, move |lease, close| {
            tokio::spawn(async move {
                let summary = ChatSession::new(stream, provider, config, close).run().await;
                tracing::debug!(
                    %peer,
                    slot = lease.slot(),
                    exchanges = summary.exchanges,
                    reason = ?summary.reason,
                    "session ended"
                );
                drop(lease);
            })
        });

        match claimed {
            Some(slot) => tracing::info!(
                %peer,
                slot,
                active = self.table.active(),
                "client connected"
            ),
            // The stream was dropped along with the unused closure, closing it.
            None => tracing::warn!(%peer, "maximum number of clients reached; connection closed"),
        }
    }
}

/// Sleep for `pause`, returning early if the running flag changes.
async fn pause_unless_stopped(running: &mut watch::Receiver<bool>, pause: Duration) {
    tokio::select! {
        _ = running.changed() => {}
        _ = tokio::time::sleep(pause) => {}
    }
}
