//! Inbound connection acceptance.
//!
//! The acceptor keeps exactly one accept outstanding at a time and hands
//! each accepted stream to a spawned setup task, so a slow handshake never
//! stalls the accept loop. Shutdown is level-triggered through a watch
//! channel: a close issued before the loop even polls is still observed.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, warn};
use transport_secure::{EngineFactory, HandshakeCoordinator};

use crate::error::TransportError;
use crate::handler::ProtocolHandler;
use crate::options::{apply_socket, apply_stream, SocketOption};
use crate::session::{ConnectionSession, SessionConfig};

/// Acceptor tunables.
#[derive(Debug, Clone)]
pub struct AcceptorConfig {
    /// Listen backlog handed to the kernel.
    pub backlog: u32,
    /// Cap on concurrently established inbound sessions; `None` is
    /// unlimited. The permit is acquired before the accept and travels
    /// with the session until it closes.
    pub max_connections: Option<usize>,
    /// Socket options applied to the listener and to accepted streams.
    pub options: Vec<SocketOption>,
    /// Configuration for sessions created by this acceptor.
    pub session: SessionConfig,
}

impl Default for AcceptorConfig {
    fn default() -> Self {
        Self {
            backlog: 1024,
            max_connections: None,
            options: Vec::new(),
            session: SessionConfig::default(),
        }
    }
}

/// Listens on one endpoint and turns inbound connections into sessions.
#[derive(Debug)]
pub struct ConnectionAcceptor {
    local_addr: SocketAddr,
    handler: Arc<dyn ProtocolHandler>,
    factory: Option<Arc<dyn EngineFactory>>,
    config: AcceptorConfig,
    limiter: Option<Arc<Semaphore>>,
    listener: StdMutex<Option<TcpListener>>,
    open: AtomicBool,
    closing_tx: watch::Sender<bool>,
    closing_rx: watch::Receiver<bool>,
    done_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
}

impl ConnectionAcceptor {
    /// Creates the listening socket, applies socket-phase options, binds
    /// and listens.
    ///
    /// Must be called from within a tokio runtime. A present `factory`
    /// makes every accepted connection run the server-side handshake
    /// before its session is established.
    pub fn bind(
        addr: SocketAddr,
        handler: Arc<dyn ProtocolHandler>,
        factory: Option<Arc<dyn EngineFactory>>,
        config: AcceptorConfig,
    ) -> Result<Self, TransportError> {
        let socket = match addr {
            SocketAddr::V4(_) => TcpSocket::new_v4(),
            SocketAddr::V6(_) => TcpSocket::new_v6(),
        }
        .map_err(|source| TransportError::Bind { addr, source })?;
        apply_socket(&socket, &config.options)?;
        socket
            .bind(addr)
            .map_err(|source| TransportError::Bind { addr, source })?;
        let listener = socket
            .listen(config.backlog)
            .map_err(|source| TransportError::Bind { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| TransportError::Bind { addr, source })?;

        let limiter = config
            .max_connections
            .map(|cap| Arc::new(Semaphore::new(cap)));
        let (closing_tx, closing_rx) = watch::channel(false);
        let (done_tx, done_rx) = watch::channel(false);
        debug!(%local_addr, "acceptor bound");
        Ok(Self {
            local_addr,
            handler,
            factory,
            config,
            limiter,
            listener: StdMutex::new(Some(listener)),
            open: AtomicBool::new(true),
            closing_tx,
            closing_rx,
            done_tx,
            done_rx,
        })
    }

    /// Runs the accept loop until [`close`](Self::close) or a repeated
    /// accept failure stops it.
    ///
    /// One accept is outstanding at a time; each accepted stream is
    /// dispatched to a spawned setup task. A failed accept is retried
    /// once; a second consecutive failure is reported to the handler's
    /// failure callback and stops the loop.
    pub async fn run(&self) {
        let listener = match self.take_listener() {
            Some(listener) => listener,
            None => {
                let _ = self.done_tx.send(true);
                return;
            }
        };
        let mut closing = self.closing_rx.clone();
        let mut failed_once = false;
        loop {
            let permit = match &self.limiter {
                Some(limiter) => {
                    let acquired = tokio::select! {
                        biased;
                        _ = closing.wait_for(|closed| *closed) => break,
                        acquired = Arc::clone(limiter).acquire_owned() => acquired,
                    };
                    match acquired {
                        Ok(permit) => Some(permit),
                        Err(_) => break,
                    }
                }
                None => None,
            };
            tokio::select! {
                biased;
                _ = closing.wait_for(|closed| *closed) => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        failed_once = false;
                        self.spawn_setup(stream, peer, permit);
                    }
                    Err(source) => {
                        if failed_once {
                            let err = TransportError::Accept(source);
                            error!(error = %err, "accept failed twice, stopping acceptor");
                            self.handler.on_failure(&err, None);
                            break;
                        }
                        warn!(error = %source, "accept failed, retrying");
                        failed_once = true;
                    }
                },
            }
        }
        self.open.store(false, Ordering::SeqCst);
        drop(listener);
        let _ = self.done_tx.send(true);
        debug!(local = %self.local_addr, "acceptor stopped");
    }

    fn spawn_setup(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        permit: Option<OwnedSemaphorePermit>,
    ) {
        debug!(%peer, "connection accepted");
        let handler = Arc::clone(&self.handler);
        let factory = self.factory.clone();
        let config = self.config.session;
        let options = self.config.options.clone();
        tokio::spawn(async move {
            if let Err(error) =
                setup_inbound(stream, peer, &handler, factory, config, options, permit).await
            {
                warn!(%peer, %error, "inbound connection setup failed");
                handler.on_failure(&error, None);
            }
        });
    }

    /// Stops the acceptor: wakes the accept loop (which drops the
    /// listening socket) and releases [`await_shutdown`](Self::await_shutdown)
    /// waiters once the loop has stopped. Idempotent.
    pub fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        let _ = self.closing_tx.send(true);
        if self.take_listener().is_some() {
            // the accept loop never started, nothing else reports done
            let _ = self.done_tx.send(true);
        }
    }

    /// Suspends until the accept loop has fully stopped.
    pub async fn await_shutdown(&self) {
        let mut done = self.done_rx.clone();
        let _ = done.wait_for(|stopped| *stopped).await;
    }

    /// True while the accept loop is able to accept further connections.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// The bound address, with the real port when 0 was requested.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn take_listener(&self) -> Option<TcpListener> {
        self.listener
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }
}

async fn setup_inbound(
    stream: TcpStream,
    peer: SocketAddr,
    handler: &Arc<dyn ProtocolHandler>,
    factory: Option<Arc<dyn EngineFactory>>,
    config: SessionConfig,
    options: Vec<SocketOption>,
    permit: Option<OwnedSemaphorePermit>,
) -> Result<(), TransportError> {
    apply_stream(&stream, &options)?;
    let local = stream.local_addr()?;
    let session = match factory {
        Some(factory) => {
            let engine = factory.new_engine().map_err(TransportError::HandshakeFailed)?;
            let channel = HandshakeCoordinator::new(engine)
                .run(stream)
                .await
                .map_err(TransportError::HandshakeFailed)?;
            ConnectionSession::secure(channel, local, peer, Arc::clone(handler), config, permit)
        }
        None => ConnectionSession::plain(stream, local, peer, Arc::clone(handler), config, permit),
    };
    debug!(session = session.id(), %peer, "inbound session established");
    handler.on_established(&session);
    Ok(())
}
