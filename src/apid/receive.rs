//! Receive pipeline.
//!
//! A receive task owns a set of peer connections and a page pool
//! handle. Each iteration reads up to one page from a peer, carves
//! complete messages out of the buffer, groups them per target thread
//! in bucketed anchor lists, and posts each group as one batch so the
//! target thread is locked once per round. A short tail that does not
//! yet form a full message is copied to a fresh page so the filled page
//! can be released independently.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::proto::ReadConn;

use super::message::{peek_header, MIN_HEADER_SIZE};
use super::pool::PagePool;
use super::thread::{MessageBatch, MsgRef, ThreadConnection, NUM_THREAD_LISTS};

/// Bound on carve iterations per read round.
const MAX_RECEIVE_LOOPS: usize = 16;

/// Per-peer receive state.
pub struct ReceiveNode {
    pub node_id: u32,
    pub my_node_id: u32,
    conn: ReadConn,
    /// Partially received data carried between rounds.
    partial: Vec<u8>,
}

impl ReceiveNode {
    pub fn new(node_id: u32, my_node_id: u32, conn: ReadConn) -> Self {
        Self {
            node_id,
            my_node_id,
            conn,
            partial: Vec::new(),
        }
    }
}

/// A receive task: several peers, one pool, one thread table.
pub struct ReceiveThread {
    pool: Arc<PagePool>,
    threads: Arc<Vec<Arc<ThreadConnection>>>,
    peers: Vec<ReceiveNode>,
    new_peers: Mutex<mpsc::Receiver<ReceiveNode>>,
}

impl ReceiveThread {
    pub fn new(
        pool: Arc<PagePool>,
        threads: Arc<Vec<Arc<ThreadConnection>>>,
        new_peers: mpsc::Receiver<ReceiveNode>,
    ) -> Self {
        Self {
            pool,
            threads,
            peers: Vec::new(),
            new_peers: Mutex::new(new_peers),
        }
    }

    /// Serve until the peer channel closes and the last peer is gone.
    pub async fn run(mut self) {
        loop {
            // adopt newly handed over connections
            let mut closed = false;
            {
                let mut rx = self.new_peers.lock().await;
                loop {
                    match rx.try_recv() {
                        Ok(peer) => {
                            debug!(node = peer.node_id, "receive task adopted peer");
                            self.peers.push(peer);
                        }
                        Err(mpsc::error::TryRecvError::Empty) => break,
                        Err(mpsc::error::TryRecvError::Disconnected) => {
                            closed = true;
                            break;
                        }
                    }
                }
            }
            if self.peers.is_empty() {
                if closed {
                    return;
                }
                let mut rx = self.new_peers.lock().await;
                match rx.recv().await {
                    Some(peer) => self.peers.push(peer),
                    None => return,
                }
                continue;
            }
            let mut dead: Vec<usize> = Vec::new();
            for ix in 0..self.peers.len() {
                match receive_from_peer(&self.pool, &self.threads, &mut self.peers[ix]).await {
                    Ok(()) => {}
                    Err(Error::DataTimeout) => {} // nothing arrived, next peer
                    Err(e) => {
                        debug!(node = self.peers[ix].node_id, error = %e, "peer receive ended");
                        dead.push(ix);
                    }
                }
            }
            for ix in dead.into_iter().rev() {
                let peer = self.peers.swap_remove(ix);
                warn!(node = peer.node_id, "receive side closed for node");
            }
        }
    }
}

/// One receive round for one peer: read, carve, post.
async fn receive_from_peer(
    pool: &PagePool,
    threads: &[Arc<ThreadConnection>],
    peer: &mut ReceiveNode,
) -> Result<()> {
    let mut loops = 0;
    loop {
        // Assemble the working buffer: leftover first, fresh bytes after.
        let mut buf = pool.get_buffer();
        buf.extend_from_slice(&peer.partial);
        let have = buf.len();
        buf.resize(pool.page_size(), 0);
        peer.conn.set_read_timeout(Duration::from_millis(10));
        let n = match peer.conn.read_into(&mut buf[have..]).await {
            Ok(0) => {
                pool.put_buffer(buf);
                return Err(Error::Network("peer closed".into()));
            }
            Ok(n) => n,
            Err(e) => {
                pool.put_buffer(buf);
                return Err(e);
            }
        };
        buf.truncate(have + n);
        peer.partial.clear();
        let read_more = buf.len() == pool.page_size();

        carve_and_post(pool, threads, peer, buf);

        loops += 1;
        if !read_more || loops >= MAX_RECEIVE_LOOPS {
            return Ok(());
        }
    }
}

/// Walk `buf`, cut complete messages, bucket them per receiver module,
/// post one batch per target thread, and keep any tail for next round.
fn carve_and_post(
    pool: &PagePool,
    threads: &[Arc<ThreadConnection>],
    peer: &mut ReceiveNode,
    buf: Vec<u8>,
) {
    // anchors: bucket -> (module id -> refs)
    let mut anchors: Vec<HashMap<u16, Vec<MsgRef>>> =
        (0..NUM_THREAD_LISTS).map(|_| HashMap::new()).collect();
    let mut offset = 0usize;
    let mut any_message = false;
    while buf.len() - offset >= MIN_HEADER_SIZE {
        let Some(header) = peek_header(&buf[offset..]) else {
            warn!(node = peer.node_id, "unparseable message header, dropping peer data");
            break;
        };
        if header.message_len > buf.len() - offset {
            break; // incomplete message, keep as tail
        }
        let bucket = (header.receiver_module_id as usize) & (NUM_THREAD_LISTS - 1);
        anchors[bucket]
            .entry(header.receiver_module_id)
            .or_default()
            .push(MsgRef {
                offset,
                len: header.message_len,
                sender_node_id: peer.node_id,
                receiver_node_id: peer.my_node_id,
                receiver_module_id: header.receiver_module_id,
                big_endian: header.big_endian,
            });
        any_message = true;
        offset += header.message_len;
    }

    let tail = &buf[offset..];
    if !tail.is_empty() {
        // copy the remainder to a fresh buffer so the filled page can be
        // freed as soon as its messages are dispatched
        peer.partial = tail.to_vec();
    }

    if !any_message {
        pool.put_buffer(buf);
        return;
    }
    let page = pool.share(buf);
    for bucket in anchors {
        for (module_id, refs) in bucket {
            let Some(thread) = threads.get(module_id as usize) else {
                warn!(module = module_id, "no such receiver module, dropping messages");
                continue;
            };
            thread.post(MessageBatch {
                page: Arc::clone(&page),
                refs,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apid::message::MessageBuilder;
    use crate::apid::pool::PAGE_SIZE;
    use crate::apid::thread::{HandlerRegistry, UserThread};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::{TcpListener, TcpStream};

    async fn pair() -> (crate::proto::Connection, ReadConn) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
        let (server, _) = listener.accept().await.unwrap();
        let client = client.await.unwrap();
        let (read_half, _write_half) = crate::proto::Connection::from_stream(server).into_halves();
        (crate::proto::Connection::from_stream(client), read_half)
    }

    fn thread_table(n: usize) -> Arc<Vec<Arc<ThreadConnection>>> {
        Arc::new((0..n).map(|_| ThreadConnection::new()).collect())
    }

    #[tokio::test]
    async fn test_carve_multiple_messages_one_page() {
        let (mut sender, receiver) = pair().await;
        let pool = PagePool::new(PAGE_SIZE, 4);
        let threads = thread_table(4);
        let mut wire = Vec::new();
        for i in 0..5u32 {
            wire.extend_from_slice(
                &MessageBuilder::new(100 + i, 1, 2).payload(vec![i]).build(),
            );
        }
        sender.write_all(&wire).await.unwrap();
        let mut peer = ReceiveNode::new(7, 1, receiver);
        receive_from_peer(&pool, &threads, &mut peer).await.unwrap();
        let batches = threads[2].poll(Duration::from_millis(50)).await;
        let total: usize = batches.iter().map(|b| b.refs.len()).sum();
        assert_eq!(total, 5);
        // all five arrived in order
        let mut numbers = Vec::new();
        for b in &batches {
            for r in &b.refs {
                numbers.push(b.view(r).message_number());
            }
        }
        assert_eq!(numbers, vec![100, 101, 102, 103, 104]);
    }

    #[tokio::test]
    async fn test_partial_message_kept_for_next_round() {
        let (mut sender, receiver) = pair().await;
        let pool = PagePool::new(PAGE_SIZE, 4);
        let threads = thread_table(4);
        let msg = MessageBuilder::new(55, 1, 3).payload(vec![1, 2, 3, 4]).build();
        let (head, tail) = msg.split_at(10);
        sender.write_all(head).await.unwrap();
        let mut peer = ReceiveNode::new(7, 1, receiver);
        receive_from_peer(&pool, &threads, &mut peer).await.unwrap();
        assert_eq!(threads[3].queued_batches(), 0);
        assert_eq!(peer.partial.len(), 10);
        sender.write_all(tail).await.unwrap();
        receive_from_peer(&pool, &threads, &mut peer).await.unwrap();
        let batches = threads[3].poll(Duration::from_millis(50)).await;
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].view(&batches[0].refs[0]).message_number(), 55);
    }

    #[tokio::test]
    async fn test_messages_routed_to_distinct_threads() {
        let (mut sender, receiver) = pair().await;
        let pool = PagePool::new(PAGE_SIZE, 4);
        let threads = thread_table(8);
        let mut wire = Vec::new();
        wire.extend_from_slice(&MessageBuilder::new(1, 1, 5).build());
        wire.extend_from_slice(&MessageBuilder::new(2, 1, 6).build());
        wire.extend_from_slice(&MessageBuilder::new(3, 1, 5).build());
        sender.write_all(&wire).await.unwrap();
        let mut peer = ReceiveNode::new(9, 1, receiver);
        receive_from_peer(&pool, &threads, &mut peer).await.unwrap();
        let five = threads[5].poll(Duration::from_millis(50)).await;
        let six = threads[6].poll(Duration::from_millis(50)).await;
        assert_eq!(five.iter().map(|b| b.refs.len()).sum::<usize>(), 2);
        assert_eq!(six.iter().map(|b| b.refs.len()).sum::<usize>(), 1);
        // per-module order is preserved
        let nums: Vec<u32> = five
            .iter()
            .flat_map(|b| b.refs.iter().map(|r| b.view(r).message_number()))
            .collect();
        assert_eq!(nums, vec![1, 3]);
    }

    #[tokio::test]
    async fn test_page_returns_after_dispatch() {
        let (mut sender, receiver) = pair().await;
        let pool = PagePool::new(PAGE_SIZE, 2);
        let threads = thread_table(2);
        sender
            .write_all(&MessageBuilder::new(42, 1, 1).payload(vec![7]).build())
            .await
            .unwrap();
        let mut peer = ReceiveNode::new(3, 1, receiver);
        receive_from_peer(&pool, &threads, &mut peer).await.unwrap();
        assert_eq!(pool.outstanding(), 1);
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = Arc::clone(&count);
        let mut registry = HandlerRegistry::new();
        registry.register(
            0,
            42,
            Box::new(move |v| {
                assert_eq!(v.payload(), vec![7]);
                count2.fetch_add(1, Ordering::SeqCst);
            }),
        );
        let user = UserThread::new(Arc::clone(&threads[1]), Arc::new(registry));
        assert_eq!(user.poll(Duration::from_millis(50)).await, 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(pool.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_receive_thread_adopts_and_serves() {
        let (mut sender, receiver) = pair().await;
        let pool = PagePool::new(PAGE_SIZE, 2);
        let threads = thread_table(2);
        let (tx, rx) = mpsc::channel(4);
        let rt = ReceiveThread::new(Arc::clone(&pool), Arc::clone(&threads), rx);
        let handle = tokio::spawn(rt.run());
        tx.send(ReceiveNode::new(4, 1, receiver)).await.unwrap();
        sender
            .write_all(&MessageBuilder::new(8, 2, 0).build())
            .await
            .unwrap();
        let batches = threads[0].poll(Duration::from_secs(2)).await;
        assert_eq!(batches.len(), 1);
        drop(tx);
        drop(sender);
        let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;
    }
}
