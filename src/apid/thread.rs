//! User-thread message delivery.
//!
//! Each user thread owns a `ThreadConnection`: an inbound queue of
//! message batches plus the condition used to wake it. A batch carries
//! one page reference for all the messages carved from that page and
//! destined for this thread, so posting costs one queue lock and one
//! reference count operation per thread per round, not one per message.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;

use super::message::MessageView;
use super::pool::PageRef;

/// Size of the per-process user thread table; receiver module ids
/// address into it directly.
pub const MAX_THREAD_CONNECTIONS: usize = 256;

/// Buckets used while collecting messages in the receive loop.
pub const NUM_THREAD_LISTS: usize = 16;

/// Location of one message within a shared page.
#[derive(Debug, Clone, Copy)]
pub struct MsgRef {
    pub offset: usize,
    pub len: usize,
    pub sender_node_id: u32,
    pub receiver_node_id: u32,
    pub receiver_module_id: u16,
    pub big_endian: bool,
}

/// All messages of one receive round that share a page and a target
/// thread. Dropping the batch releases the page share.
pub struct MessageBatch {
    pub page: PageRef,
    pub refs: Vec<MsgRef>,
}

impl MessageBatch {
    pub fn view(&self, r: &MsgRef) -> MessageView<'_> {
        MessageView::new(
            &self.page.bytes()[r.offset..r.offset + r.len],
            r.sender_node_id,
            r.receiver_node_id,
            r.big_endian,
        )
    }
}

/// Inbound queue of one user thread.
#[derive(Default)]
pub struct ThreadConnection {
    queue: Mutex<Vec<MessageBatch>>,
    notify: Notify,
    /// Set while the thread is parked; posters only signal when it is,
    /// which keeps wakeups from being issued for every batch.
    thread_wait_cond: AtomicBool,
}

impl ThreadConnection {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Post a batch; wakes the thread only if it is waiting.
    pub fn post(&self, batch: MessageBatch) {
        {
            let mut queue = self.queue.lock().expect("thread queue lock");
            queue.push(batch);
        }
        if self.thread_wait_cond.swap(false, Ordering::AcqRel) {
            self.notify.notify_one();
        }
    }

    fn drain(&self) -> Vec<MessageBatch> {
        let mut queue = self.queue.lock().expect("thread queue lock");
        std::mem::take(&mut *queue)
    }

    /// Wait up to `wait` for messages and drain the queue.
    pub async fn poll(&self, wait: Duration) -> Vec<MessageBatch> {
        let batches = self.drain();
        if !batches.is_empty() {
            return batches;
        }
        self.thread_wait_cond.store(true, Ordering::Release);
        // re-check after announcing the wait, a poster may have slipped in
        let batches = self.drain();
        if !batches.is_empty() {
            self.thread_wait_cond.store(false, Ordering::Release);
            return batches;
        }
        let _ = tokio::time::timeout(wait, self.notify.notified()).await;
        self.thread_wait_cond.store(false, Ordering::Release);
        self.drain()
    }

    pub fn queued_batches(&self) -> usize {
        self.queue.lock().expect("thread queue lock").len()
    }
}

/// Handler invoked for one dispatched message.
pub type MessageHandler = Box<dyn Fn(&MessageView<'_>) + Send + Sync>;

/// Dispatch table keyed by `(version, message_number)`.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<(u8, u32), MessageHandler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, version: u8, message_number: u32, handler: MessageHandler) {
        self.handlers.insert((version, message_number), handler);
    }

    pub fn dispatch(&self, view: &MessageView<'_>) -> bool {
        match self.handlers.get(&(view.version, view.message_number())) {
            Some(h) => {
                h(view);
                true
            }
            None => false,
        }
    }
}

/// One API user thread: drains its connection and runs handlers.
pub struct UserThread {
    pub conn: Arc<ThreadConnection>,
    registry: Arc<HandlerRegistry>,
}

impl UserThread {
    pub fn new(conn: Arc<ThreadConnection>, registry: Arc<HandlerRegistry>) -> Self {
        Self { conn, registry }
    }

    /// Block up to `wait`, dispatch everything queued, and return the
    /// number of messages executed. Pages are released as their
    /// batches are dropped after the last handler returns.
    pub async fn poll(&self, wait: Duration) -> usize {
        let batches = self.conn.poll(wait).await;
        let mut executed = 0;
        for batch in &batches {
            for r in &batch.refs {
                let view = batch.view(r);
                if !view.verify_checksum() {
                    tracing::warn!(
                        sender = view.sender_node_id,
                        message = view.message_number(),
                        "dropping message with bad checksum"
                    );
                    continue;
                }
                if !self.registry.dispatch(&view) {
                    tracing::debug!(
                        message = view.message_number(),
                        version = view.version,
                        "no handler registered"
                    );
                }
                executed += 1;
            }
        }
        executed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apid::message::MessageBuilder;
    use crate::apid::pool::PagePool;
    use std::sync::atomic::AtomicUsize;

    fn batch_with(pool: &PagePool, messages: &[(u32, u16)]) -> MessageBatch {
        let mut buf = pool.get_buffer();
        let mut refs = Vec::new();
        for &(number, module) in messages {
            let bytes = MessageBuilder::new(number, 1, module).build();
            refs.push(MsgRef {
                offset: buf.len(),
                len: bytes.len(),
                sender_node_id: 2,
                receiver_node_id: 1,
                receiver_module_id: module,
                big_endian: cfg!(target_endian = "big"),
            });
            buf.extend_from_slice(&bytes);
        }
        MessageBatch {
            page: pool.share(buf),
            refs,
        }
    }

    #[tokio::test]
    async fn test_post_then_poll() {
        let pool = PagePool::new(4096, 1);
        let conn = ThreadConnection::new();
        conn.post(batch_with(&pool, &[(5, 0), (6, 0)]));
        let batches = conn.poll(Duration::from_millis(10)).await;
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].refs.len(), 2);
    }

    #[tokio::test]
    async fn test_poll_wakes_on_post() {
        let pool = PagePool::new(4096, 1);
        let conn = ThreadConnection::new();
        let conn2 = Arc::clone(&conn);
        let waiter = tokio::spawn(async move { conn2.poll(Duration::from_secs(5)).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        conn.post(batch_with(&pool, &[(1, 0)]));
        let batches = waiter.await.unwrap();
        assert_eq!(batches.len(), 1);
    }

    #[tokio::test]
    async fn test_dispatch_and_page_release() {
        let pool = PagePool::new(4096, 1);
        let conn = ThreadConnection::new();
        let mut registry = HandlerRegistry::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = Arc::clone(&seen);
        registry.register(
            0,
            9,
            Box::new(move |view| {
                assert_eq!(view.message_number(), 9);
                seen2.fetch_add(1, Ordering::SeqCst);
            }),
        );
        let thread = UserThread::new(Arc::clone(&conn), Arc::new(registry));
        conn.post(batch_with(&pool, &[(9, 0), (9, 0), (9, 0)]));
        assert_eq!(pool.outstanding(), 1);
        let executed = thread.poll(Duration::from_millis(10)).await;
        assert_eq!(executed, 3);
        assert_eq!(seen.load(Ordering::SeqCst), 3);
        // all batches dropped, the page is home again
        assert_eq!(pool.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_poll_timeout_returns_empty() {
        let conn = ThreadConnection::new();
        let batches = conn.poll(Duration::from_millis(20)).await;
        assert!(batches.is_empty());
    }
}
