//! Listen server.
//!
//! One listen task per distinct (host, port) server address. An
//! accepted connection runs the server side of the transporter
//! handshake, which names the peer node; the connection is then handed
//! to that node's send task. The task exits when its last dependent
//! send node deregisters.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::mgmt::transporter;
use crate::proto::{Connection, Listener};

/// A shared listen point for server-side transporter connections.
pub struct ListenServer {
    address: String,
    my_node_id: u32,
    /// peer node id -> where to deliver its accepted connection
    dependents: Mutex<HashMap<u32, mpsc::Sender<Connection>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl ListenServer {
    pub fn new(address: impl Into<String>, my_node_id: u32) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            address: address.into(),
            my_node_id,
            dependents: Mutex::new(HashMap::new()),
            shutdown_tx,
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Register a send node that expects its peer to connect here.
    pub async fn register(&self, peer_node_id: u32, tx: mpsc::Sender<Connection>) {
        let mut deps = self.dependents.lock().await;
        deps.insert(peer_node_id, tx);
    }

    /// Remove a dependent; the listen task exits once none remain.
    pub async fn deregister(&self, peer_node_id: u32) {
        let mut deps = self.dependents.lock().await;
        deps.remove(&peer_node_id);
        if deps.is_empty() {
            let _ = self.shutdown_tx.send(true);
        }
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Accept loop. Reports the bound address through `bound_tx` so
    /// callers can bind port 0.
    pub async fn run(
        self: Arc<Self>,
        bound_tx: Option<tokio::sync::oneshot::Sender<std::net::SocketAddr>>,
    ) -> Result<()> {
        let mut listener = Listener::bind(&self.address, self.shutdown_tx.subscribe()).await?;
        let addr = listener.local_addr()?;
        info!(%addr, "transporter listen server started");
        if let Some(tx) = bound_tx {
            let _ = tx.send(addr);
        }
        while let Some(mut conn) = listener.accept().await? {
            let me = Arc::clone(&self);
            tokio::spawn(async move {
                let peer_addr = conn.peer_addr().to_string();
                match transporter::server_handshake(&mut conn, me.my_node_id).await {
                    Ok(peer_node_id) => {
                        // hold our own lock while finding the dependent;
                        // the send node's state is only touched by the
                        // send task after the channel delivery
                        let tx = {
                            let deps = me.dependents.lock().await;
                            deps.get(&peer_node_id).cloned()
                        };
                        match tx {
                            Some(tx) => {
                                debug!(node = peer_node_id, "handing accepted connection to send node");
                                let _ = tx.send(conn).await;
                            }
                            None => {
                                warn!(
                                    node = peer_node_id,
                                    peer = %peer_addr,
                                    "no send node registered for peer, dropping connection"
                                );
                            }
                        }
                    }
                    Err(e) => {
                        warn!(peer = %peer_addr, error = %e, "transporter handshake failed");
                    }
                }
            });
        }
        info!("transporter listen server stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_accept_and_route_to_dependent() {
        let server = ListenServer::new("127.0.0.1:0", 1);
        let (tx, mut rx) = mpsc::channel(1);
        server.register(2, tx).await;
        let (bound_tx, bound_rx) = tokio::sync::oneshot::channel();
        let handle = tokio::spawn(Arc::clone(&server).run(Some(bound_tx)));
        let addr = bound_rx.await.unwrap();

        let mut conn = Connection::connect(&addr.to_string(), Duration::from_secs(5))
            .await
            .unwrap();
        transporter::client_handshake(&mut conn, 2, 1).await.unwrap();
        let delivered = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap();
        assert!(delivered.is_some());
        server.shutdown();
        let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;
    }

    #[tokio::test]
    async fn test_unknown_peer_dropped() {
        let server = ListenServer::new("127.0.0.1:0", 1);
        let (bound_tx, bound_rx) = tokio::sync::oneshot::channel();
        let handle = tokio::spawn(Arc::clone(&server).run(Some(bound_tx)));
        let addr = bound_rx.await.unwrap();

        let mut conn = Connection::connect(&addr.to_string(), Duration::from_secs(5))
            .await
            .unwrap();
        // handshake completes, but nobody is registered for node 9
        transporter::client_handshake(&mut conn, 9, 1).await.unwrap();
        server.shutdown();
        let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;
    }

    #[tokio::test]
    async fn test_exit_when_last_dependent_leaves() {
        let server = ListenServer::new("127.0.0.1:0", 1);
        let (tx, _rx) = mpsc::channel(1);
        server.register(2, tx).await;
        let (bound_tx, bound_rx) = tokio::sync::oneshot::channel();
        let handle = tokio::spawn(Arc::clone(&server).run(Some(bound_tx)));
        let _ = bound_rx.await.unwrap();
        server.deregister(2).await;
        let finished = tokio::time::timeout(Duration::from_secs(3), handle).await;
        assert!(finished.is_ok(), "listen task exits after last deregister");
    }
}
