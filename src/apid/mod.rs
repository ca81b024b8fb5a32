//! Data-API I/O Core
//!
//! Per-peer send nodes with an adaptive batching algorithm, receive
//! tasks carving messages out of shared pages, listen servers for the
//! server side of each link, and per-user-thread delivery queues.

pub mod listener;
pub mod message;
pub mod pool;
pub mod receive;
pub mod send;
pub mod thread;

pub use listener::ListenServer;
pub use message::{MessageBuilder, MessageView};
pub use pool::{PagePool, PAGE_SIZE};
pub use receive::{ReceiveNode, ReceiveThread};
pub use send::{ConnectSource, SendNode};
pub use thread::{HandlerRegistry, ThreadConnection, UserThread, MAX_THREAD_CONNECTIONS};

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::info;

use crate::error::{Error, Result};
use crate::model::ClusterConfig;

/// Everything one process needs to speak the data protocol in one
/// cluster: pools, user-thread table, send nodes and listen servers.
pub struct ApidGlobal {
    pub cluster_id: u32,
    pub my_node_id: u32,
    pool: Arc<PagePool>,
    threads: Arc<Vec<Arc<ThreadConnection>>>,
    send_nodes: Mutex<HashMap<u32, Arc<SendNode>>>,
    listeners: Mutex<HashMap<String, Arc<ListenServer>>>,
    recv_tx: mpsc::Sender<ReceiveNode>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ApidGlobal {
    /// Create the core with `num_receive_threads` receive tasks and a
    /// user-thread table of `num_threads` connections. New peers are
    /// spread over the receive tasks round robin.
    pub fn new(
        cluster_id: u32,
        my_node_id: u32,
        num_receive_threads: usize,
        num_threads: usize,
    ) -> Arc<Self> {
        let pool = PagePool::new(PAGE_SIZE, 32);
        let threads: Arc<Vec<Arc<ThreadConnection>>> = Arc::new(
            (0..num_threads.min(MAX_THREAD_CONNECTIONS))
                .map(|_| ThreadConnection::new())
                .collect(),
        );
        let (recv_tx, mut intake_rx) = mpsc::channel::<ReceiveNode>(64);
        let mut tasks = Vec::new();
        let mut thread_txs = Vec::new();
        for _ in 0..num_receive_threads.max(1) {
            let (tx, rx) = mpsc::channel::<ReceiveNode>(16);
            thread_txs.push(tx);
            let rt = ReceiveThread::new(Arc::clone(&pool), Arc::clone(&threads), rx);
            tasks.push(tokio::spawn(rt.run()));
        }
        tasks.push(tokio::spawn(async move {
            let mut next = 0usize;
            while let Some(peer) = intake_rx.recv().await {
                if thread_txs[next % thread_txs.len()].send(peer).await.is_err() {
                    break;
                }
                next += 1;
            }
        }));
        Arc::new(Self {
            cluster_id,
            my_node_id,
            pool,
            threads,
            send_nodes: Mutex::new(HashMap::new()),
            listeners: Mutex::new(HashMap::new()),
            recv_tx,
            tasks: Mutex::new(tasks),
        })
    }

    pub fn pool(&self) -> Arc<PagePool> {
        Arc::clone(&self.pool)
    }

    pub fn thread_connection(&self, module_id: u16) -> Option<Arc<ThreadConnection>> {
        self.threads.get(module_id as usize).cloned()
    }

    /// Build the send node for one peer from the cluster configuration
    /// and start its task. Server-side links register with the shared
    /// listen server for our advertised port.
    pub async fn add_peer(self: &Arc<Self>, cluster: &ClusterConfig, peer_id: u32) -> Result<()> {
        let comm = cluster.comm_for_pair(self.my_node_id, peer_id)?;
        let we_serve = comm.server_node_id() == self.my_node_id;
        let max_wait = comm.max_wait_in_nanos();
        let source = if we_serve {
            let me = cluster
                .node(self.my_node_id)
                .ok_or(Error::NoSuchNode(self.my_node_id))?;
            let bind = format!("{}:{}", me.hostname(), comm.server_port());
            let (tx, rx) = mpsc::channel(1);
            let listener = {
                let mut listeners = self.listeners.lock().await;
                match listeners.get(&bind) {
                    Some(l) => Arc::clone(l),
                    None => {
                        let l = ListenServer::new(bind.clone(), self.my_node_id);
                        listeners.insert(bind.clone(), Arc::clone(&l));
                        let run = Arc::clone(&l);
                        let task = tokio::spawn(async move {
                            if let Err(e) = run.run(None).await {
                                tracing::warn!(error = %e, "listen server failed");
                            }
                        });
                        self.tasks.lock().await.push(task);
                        l
                    }
                }
            };
            listener.register(peer_id, tx).await;
            ConnectSource::Server { rx: Mutex::new(rx) }
        } else {
            let server = cluster
                .node(comm.server_node_id())
                .ok_or(Error::NoSuchNode(comm.server_node_id()))?;
            ConnectSource::Client {
                address: format!("{}:{}", server.hostname(), comm.server_port()),
            }
        };
        let node = SendNode::new(
            self.cluster_id,
            peer_id,
            self.my_node_id,
            source,
            max_wait,
            Some(self.recv_tx.clone()),
        );
        let task = tokio::spawn(Arc::clone(&node).run());
        self.tasks.lock().await.push(task);
        self.send_nodes.lock().await.insert(peer_id, node);
        Ok(())
    }

    pub async fn send_node(&self, peer_id: u32) -> Option<Arc<SendNode>> {
        self.send_nodes.lock().await.get(&peer_id).cloned()
    }

    /// Submit pages to a peer, `force_send` bypassing the adaptive wait.
    pub async fn send(&self, peer_id: u32, pages: Vec<Vec<u8>>, force_send: bool) -> Result<()> {
        let node = self
            .send_nodes
            .lock()
            .await
            .get(&peer_id)
            .cloned()
            .ok_or(Error::NoSuchNode(peer_id))?;
        node.submit(pages, force_send).await
    }

    /// Order every send node to stop, stop the listeners, and reap the
    /// worker tasks.
    pub async fn shutdown(&self) {
        info!(cluster = self.cluster_id, "data-api core shutting down");
        let nodes: Vec<Arc<SendNode>> = self.send_nodes.lock().await.values().cloned().collect();
        for node in nodes {
            node.order_stop().await;
        }
        for listener in self.listeners.lock().await.values() {
            listener.shutdown();
        }
        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for task in tasks {
            task.abort();
        }
    }
}
