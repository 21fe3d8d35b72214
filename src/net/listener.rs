// TCP listener and server
// Accepts connections and hands each one to an async handler

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{info, warn};

use super::connection::Connection;

/// TCP server that accepts and manages client connections
pub struct TcpServer {
    addr: SocketAddr,
    shutdown_tx: Option<mpsc::Sender<()>>,
}

impl TcpServer {
    /// Start a new TCP server on the given address
    ///
    /// # Arguments
    /// * `addr` - Socket address to bind to (port 0 picks a free port)
    /// * `handler` - Called with each accepted connection; runs on its own task
    pub async fn start<F, Fut>(addr: SocketAddr, handler: F) -> io::Result<Self>
    where
        F: Fn(Connection) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(addr).await?;
        let actual_addr = listener.local_addr()?;

        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let handler = Arc::new(handler);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, peer_addr)) => {
                                let connection = Connection::new(stream, peer_addr);
                                tokio::spawn(handler(connection));
                            }
                            Err(e) => {
                                warn!("Accept error: {}", e);
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("TCP server on {} shutting down", actual_addr);
                        break;
                    }
                }
            }
        });

        info!("Listening on {} (TCP)", actual_addr);

        Ok(TcpServer {
            addr: actual_addr,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    /// Get the address the server is listening on
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting new connections
    pub async fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(()).await;
        }
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.try_send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpStream;

    #[tokio::test]
    async fn test_tcp_server_start() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();

        let server = TcpServer::start(addr, |_conn| async {}).await.unwrap();

        assert!(server.addr().port() > 0);
    }

    #[tokio::test]
    async fn test_tcp_server_accept_connection() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();

        let (tx, mut rx) = mpsc::channel(1);

        let server = TcpServer::start(addr, move |conn| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(conn.peer_addr()).await;
            }
        })
        .await
        .unwrap();

        let client = TcpStream::connect(server.addr()).await.unwrap();
        let local = client.local_addr().unwrap();

        let seen = tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(seen, local);
    }
}
