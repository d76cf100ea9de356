//! Outbound connection establishment.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{lookup_host, TcpSocket};
use tracing::debug;
use transport_secure::{EngineFactory, HandshakeCoordinator};

use crate::error::TransportError;
use crate::handler::ProtocolHandler;
use crate::options::{apply_socket, apply_stream, SocketOption};
use crate::session::{ConnectionSession, SessionConfig};

/// Connector tunables.
#[derive(Debug, Clone, Default)]
pub struct ConnectorConfig {
    /// Deadline for the TCP connect itself; `None` leaves it to the
    /// operating system.
    pub connect_timeout: Option<Duration>,
    /// Socket options applied to the outbound socket and stream.
    pub options: Vec<SocketOption>,
    /// Configuration for sessions created by this connector.
    pub session: SessionConfig,
}

/// Dials endpoints and turns the resulting connections into sessions.
///
/// One connector can dial any number of endpoints; every session it
/// creates shares the same handler, engine factory and configuration.
#[derive(Debug)]
pub struct ConnectionConnector {
    handler: Arc<dyn ProtocolHandler>,
    factory: Option<Arc<dyn EngineFactory>>,
    config: ConnectorConfig,
}

impl ConnectionConnector {
    /// Creates a connector. A present `factory` makes every dialed
    /// connection run the client-side handshake before its session is
    /// established.
    pub fn new(
        handler: Arc<dyn ProtocolHandler>,
        factory: Option<Arc<dyn EngineFactory>>,
        config: ConnectorConfig,
    ) -> Self {
        Self {
            handler,
            factory,
            config,
        }
    }

    /// Resolves `addr` (a `host:port` string), connects, runs the
    /// handshake when an engine factory is present and returns the
    /// established session. The established callback has already fired
    /// when this returns.
    pub async fn connect(&self, addr: &str) -> Result<Arc<ConnectionSession>, TransportError> {
        let connect_err = |source: io::Error| TransportError::Connect {
            addr: addr.to_string(),
            source,
        };
        let target = lookup_host(addr)
            .await
            .map_err(connect_err)?
            .next()
            .ok_or_else(|| {
                connect_err(io::Error::new(
                    io::ErrorKind::NotFound,
                    "address did not resolve",
                ))
            })?;
        let socket = if target.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(connect_err)?;
        apply_socket(&socket, &self.config.options)?;
        let connecting = socket.connect(target);
        let stream = match self.config.connect_timeout {
            Some(deadline) => tokio::time::timeout(deadline, connecting)
                .await
                .unwrap_or_else(|_| {
                    Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "connect deadline expired",
                    ))
                }),
            None => connecting.await,
        }
        .map_err(connect_err)?;
        apply_stream(&stream, &self.config.options)?;
        let local = stream.local_addr()?;
        let peer = stream.peer_addr()?;

        let session = match &self.factory {
            Some(factory) => {
                let engine = factory.new_engine().map_err(TransportError::HandshakeFailed)?;
                let channel = HandshakeCoordinator::new(engine)
                    .run(stream)
                    .await
                    .map_err(TransportError::HandshakeFailed)?;
                ConnectionSession::secure(
                    channel,
                    local,
                    peer,
                    Arc::clone(&self.handler),
                    self.config.session,
                    None,
                )
            }
            None => ConnectionSession::plain(
                stream,
                local,
                peer,
                Arc::clone(&self.handler),
                self.config.session,
                None,
            ),
        };
        debug!(session = session.id(), %peer, "outbound session established");
        self.handler.on_established(&session);
        Ok(session)
    }
}
