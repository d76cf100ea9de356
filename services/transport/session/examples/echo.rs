//! Basic usage example for the transport session layer.

use std::sync::Arc;

use tokio::sync::mpsc;
use transport_session::{
    AcceptorConfig, ConnectionAcceptor, ConnectionConnector, ConnectionSession, ConnectorConfig,
    ProtocolHandler, TransportError,
};

/// Server-side handler: echoes every payload straight back.
#[derive(Debug)]
struct EchoHandler;

impl ProtocolHandler for EchoHandler {
    fn on_established(&self, session: &Arc<ConnectionSession>) {
        println!(
            "   [server] session {} established from {}",
            session.id(),
            session.peer_addr()
        );
        let session = Arc::clone(session);
        tokio::spawn(async move {
            loop {
                match session.read().await {
                    Ok(0) | Err(_) => {
                        session.close().await;
                        break;
                    }
                    Ok(_) => {}
                }
            }
        });
    }

    fn on_data(&self, session: &Arc<ConnectionSession>, bytes: &[u8]) {
        let session = Arc::clone(session);
        let echo = bytes.to_vec();
        tokio::spawn(async move {
            let _ = session.write(&echo).await;
        });
    }

    fn on_failure(&self, error: &TransportError, _session: Option<&Arc<ConnectionSession>>) {
        eprintln!("   [server] failure: {error}");
    }
}

/// Client-side handler: forwards echoed payloads back to main.
#[derive(Debug)]
struct ClientHandler {
    echoes: mpsc::UnboundedSender<Vec<u8>>,
}

impl ProtocolHandler for ClientHandler {
    fn on_established(&self, session: &Arc<ConnectionSession>) {
        println!("   [client] connected to {}", session.peer_addr());
    }

    fn on_data(&self, _session: &Arc<ConnectionSession>, bytes: &[u8]) {
        let _ = self.echoes.send(bytes.to_vec());
    }

    fn on_failure(&self, error: &TransportError, _session: Option<&Arc<ConnectionSession>>) {
        eprintln!("   [client] failure: {error}");
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("=== Transport Session Example ===\n");

    // 1. Bind the echo acceptor on an ephemeral port
    println!("1. Binding the echo acceptor...");
    let acceptor = Arc::new(ConnectionAcceptor::bind(
        "127.0.0.1:0".parse()?,
        Arc::new(EchoHandler),
        None,
        AcceptorConfig::default(),
    )?);
    let addr = acceptor.local_addr();
    println!("   Listening on {addr}");
    tokio::spawn({
        let acceptor = Arc::clone(&acceptor);
        async move { acceptor.run().await }
    });

    // 2. Dial it
    println!("\n2. Connecting...");
    let (echo_tx, mut echoes) = mpsc::unbounded_channel();
    let connector = ConnectionConnector::new(
        Arc::new(ClientHandler { echoes: echo_tx }),
        None,
        ConnectorConfig::default(),
    );
    let session = connector.connect(&addr.to_string()).await?;

    // 3. Send a few messages and collect the echoes
    println!("\n3. Echoing messages...");
    for message in ["hello", "transport", "session"] {
        session.write(message.as_bytes()).await?;
        session.read().await?;
        if let Some(echoed) = echoes.recv().await {
            println!(
                "   Sent {message:?}, got {:?} back",
                String::from_utf8_lossy(&echoed)
            );
        }
    }

    // 4. Tear everything down
    println!("\n4. Shutting down...");
    session.close().await;
    acceptor.close();
    acceptor.await_shutdown().await;

    println!("\n=== Example completed successfully! ===");
    Ok(())
}
