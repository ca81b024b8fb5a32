//! Per-peer send node.
//!
//! Owns the outbound FIFO and, once established, the peer connection.
//! A submitter appends its pages under the node lock; if nobody is
//! sending it becomes the sender, asks the adaptive algorithm whether
//! to send now or let the data sit a little longer, and either writes
//! the head of the queue to the socket or returns. Whatever remains
//! after a real send is handed to the node's send task.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Mutex, Notify};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::mgmt::transporter;
use crate::proto::{Connection, WriteConn};

/// Most buffers a single gathered write will carry.
pub const MAX_SEND_BUFFERS: usize = 16;

/// Most bytes a single gathered write will carry.
pub const MAX_SEND_SIZE: usize = 128 * 1024;

/// Slots in the send-timestamp ring.
pub const MAX_SEND_TIMERS: usize = 16;

/// Entries kept when the ring is compacted; also the ceiling for
/// `max_num_waits`.
pub const MAX_SENDS_TRACKED: usize = 8;

/// How often the adaptive state is re-balanced by the send task.
const ADJUST_INTERVAL: Duration = Duration::from_millis(10);

/// Where this node's connection comes from.
pub enum ConnectSource {
    /// We connect out and run the client side of the handshake.
    Client { address: String },
    /// A listen server hands us accepted connections.
    Server { rx: Mutex<mpsc::Receiver<Connection>> },
}

struct SendState {
    queue: VecDeque<Vec<u8>>,
    queued_bytes: usize,
    send_active: bool,
    send_thread_is_sending: bool,
    node_up: bool,
    stop_ordered: bool,
    conn: Option<WriteConn>,
    // adaptive send state
    max_wait_in_nanos: u64,
    num_waits: u32,
    max_num_waits: u32,
    first_buffered_at: Option<Instant>,
    send_timers: [u64; MAX_SEND_TIMERS],
    send_timer_index: usize,
    tot_curr_wait_time: u64,
    tot_wait_time_plus_one: u64,
    num_stats: u64,
}

/// One peer's send side.
pub struct SendNode {
    pub cluster_id: u32,
    pub node_id: u32,
    pub my_node_id: u32,
    source: ConnectSource,
    state: Mutex<SendState>,
    wakeup: Notify,
    epoch: Instant,
    /// Where the read half goes once the connection is established.
    recv_tx: Option<mpsc::Sender<super::receive::ReceiveNode>>,
}

/// What `submit` decided to do with the head of the queue.
struct Prepared {
    bufs: Vec<Vec<u8>>,
    send_size: usize,
}

impl SendNode {
    pub fn new(
        cluster_id: u32,
        node_id: u32,
        my_node_id: u32,
        source: ConnectSource,
        max_wait_in_nanos: u64,
        recv_tx: Option<mpsc::Sender<super::receive::ReceiveNode>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            cluster_id,
            node_id,
            my_node_id,
            source,
            state: Mutex::new(SendState {
                queue: VecDeque::new(),
                queued_bytes: 0,
                send_active: false,
                send_thread_is_sending: false,
                node_up: false,
                stop_ordered: false,
                conn: None,
                max_wait_in_nanos,
                num_waits: 0,
                max_num_waits: 0,
                first_buffered_at: None,
                send_timers: [0; MAX_SEND_TIMERS],
                send_timer_index: 0,
                tot_curr_wait_time: 0,
                tot_wait_time_plus_one: 0,
                num_stats: 0,
            }),
            wakeup: Notify::new(),
            epoch: Instant::now(),
            recv_tx,
        })
    }

    fn now_nanos(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }

    pub async fn queued_bytes(&self) -> usize {
        self.state.lock().await.queued_bytes
    }

    pub async fn is_up(&self) -> bool {
        self.state.lock().await.node_up
    }

    /// Ask the node to stop; the send task exits cleanly.
    pub async fn order_stop(&self) {
        let mut st = self.state.lock().await;
        st.stop_ordered = true;
        drop(st);
        self.wakeup.notify_one();
    }

    /// Submit pages for delivery. FIFO order per node is strict; the
    /// bytes arrive at the peer exactly in submit order.
    pub async fn submit(&self, pages: Vec<Vec<u8>>, force_send: bool) -> Result<()> {
        if pages.is_empty() {
            return Ok(());
        }
        let now = self.now_nanos();
        let mut st = self.state.lock().await;
        if !st.node_up {
            return Err(Error::NodeDown(self.node_id));
        }
        for page in pages {
            st.queued_bytes += page.len();
            st.queue.push_back(page);
        }
        let mut prepared = None;
        if !st.send_active {
            st.send_active = true;
            let mut will_wait = false;
            if !force_send {
                adaptive_send_decision(&mut st, now, &mut will_wait);
            }
            if will_wait {
                // stay buffered; a later submit or the send task flushes
                st.send_active = false;
            } else {
                prepared = Some(prepare_real_send(&mut st));
            }
        }
        adaptive_send_statistics(&mut st, now);
        let Some(prepared) = prepared else {
            return Ok(());
        };
        let mut conn = match st.conn.take() {
            Some(conn) => conn,
            None => {
                // connection not established yet; leave the data queued
                // for the send task and put the pages back at the front
                requeue_front(&mut st, prepared);
                st.send_active = false;
                return Ok(());
            }
        };
        drop(st);

        let send_result = real_send(&mut conn, &prepared).await;
        let mut st = self.state.lock().await;
        match send_result {
            Ok(()) => {
                st.conn = Some(conn);
                self.send_done(&mut st)
            }
            Err(e) => {
                warn!(node = self.node_id, error = %e, "send failed, running node failure handling");
                node_failure_handling(&mut st);
                Err(Error::NodeDown(self.node_id))
            }
        }
    }

    /// After a real send: hand any remainder to the send task, or clear
    /// the active flag.
    fn send_done(&self, st: &mut SendState) -> Result<()> {
        if !st.node_up {
            return Err(Error::NodeDown(self.node_id));
        }
        if !st.queue.is_empty() {
            st.send_thread_is_sending = true;
            self.wakeup.notify_one();
        } else {
            st.send_active = false;
        }
        Ok(())
    }

    /// The node's send task: establish the connection, then drain the
    /// queue whenever a submitter leaves work behind, re-balancing the
    /// adaptive state on a timer.
    pub async fn run(self: Arc<Self>) {
        loop {
            {
                let st = self.state.lock().await;
                if st.stop_ordered {
                    break;
                }
            }
            match self.establish().await {
                Ok(()) => {}
                Err(Error::ShuttingDown) => break,
                Err(e) => {
                    debug!(node = self.node_id, error = %e, "connect attempt failed");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            }
            info!(
                cluster = self.cluster_id,
                node = self.node_id,
                "send node connected"
            );
            self.drain_until_down().await;
        }
        debug!(node = self.node_id, "send task exits");
    }

    async fn establish(&self) -> Result<()> {
        let conn = match &self.source {
            ConnectSource::Client { address } => {
                let mut conn = Connection::connect(address, Duration::from_secs(10)).await?;
                transporter::client_handshake(&mut conn, self.my_node_id, self.node_id).await?;
                conn
            }
            ConnectSource::Server { rx } => {
                let mut rx = rx.lock().await;
                rx.recv().await.ok_or(Error::ShuttingDown)?
            }
        };
        let (read_half, write_half) = conn.into_halves();
        if let Some(tx) = &self.recv_tx {
            let peer = super::receive::ReceiveNode::new(self.node_id, self.my_node_id, read_half);
            tx.send(peer).await.map_err(|_| Error::ShuttingDown)?;
        }
        let mut st = self.state.lock().await;
        st.conn = Some(write_half);
        st.node_up = true;
        Ok(())
    }

    /// Serve wakeups until the node goes down or stop is ordered.
    async fn drain_until_down(&self) {
        let mut adjust = tokio::time::interval(ADJUST_INTERVAL);
        adjust.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.wakeup.notified() => {}
                _ = adjust.tick() => {
                    let now = self.now_nanos();
                    let mut st = self.state.lock().await;
                    if st.stop_ordered || !st.node_up {
                        return;
                    }
                    adaptive_send_adjust(&mut st, now);
                    // flush anything that outstayed its welcome
                    if !st.send_active && !st.queue.is_empty() {
                        let expired = st
                            .first_buffered_at
                            .map(|t| t.elapsed().as_nanos() as u64 > st.max_wait_in_nanos)
                            .unwrap_or(true);
                        if expired {
                            st.send_active = true;
                            st.send_thread_is_sending = true;
                        } else {
                            continue;
                        }
                    } else {
                        continue;
                    }
                }
            }
            loop {
                let mut st = self.state.lock().await;
                if st.stop_ordered {
                    return;
                }
                if !st.node_up {
                    node_failure_handling(&mut st);
                    return;
                }
                if !st.send_thread_is_sending {
                    break;
                }
                if st.queue.is_empty() {
                    st.send_active = false;
                    st.send_thread_is_sending = false;
                    break;
                }
                let prepared = prepare_real_send(&mut st);
                let Some(mut conn) = st.conn.take() else {
                    requeue_front(&mut st, prepared);
                    st.send_active = false;
                    st.send_thread_is_sending = false;
                    return;
                };
                drop(st);
                let result = real_send(&mut conn, &prepared).await;
                let mut st = self.state.lock().await;
                match result {
                    Ok(()) => {
                        st.conn = Some(conn);
                        st.num_waits = 0;
                        st.first_buffered_at = None;
                    }
                    Err(e) => {
                        warn!(node = self.node_id, error = %e, "send task write failed");
                        node_failure_handling(&mut st);
                        return;
                    }
                }
            }
        }
    }
}

/// Pull up to `MAX_SEND_BUFFERS`/`MAX_SEND_SIZE` from the queue head.
fn prepare_real_send(st: &mut SendState) -> Prepared {
    let mut bufs = Vec::new();
    let mut send_size = 0usize;
    while let Some(front) = st.queue.front() {
        if !bufs.is_empty()
            && (bufs.len() >= MAX_SEND_BUFFERS || send_size + front.len() > MAX_SEND_SIZE)
        {
            break;
        }
        let page = st.queue.pop_front().expect("checked front");
        send_size += page.len();
        st.queued_bytes -= page.len();
        bufs.push(page);
        if send_size >= MAX_SEND_SIZE || bufs.len() >= MAX_SEND_BUFFERS {
            break;
        }
    }
    Prepared { bufs, send_size }
}

fn requeue_front(st: &mut SendState, prepared: Prepared) {
    for page in prepared.bufs.into_iter().rev() {
        st.queued_bytes += page.len();
        st.queue.push_front(page);
    }
}

async fn real_send(conn: &mut WriteConn, prepared: &Prepared) -> Result<()> {
    let slices: Vec<&[u8]> = prepared.bufs.iter().map(|b| b.as_slice()).collect();
    conn.write_vectored_all(&slices).await?;
    debug_assert!(prepared.send_size == slices.iter().map(|s| s.len()).sum::<usize>());
    Ok(())
}

/// Drop the outbound queue and mark the node down. The send task stays
/// alive and waits for a reconnect.
fn node_failure_handling(st: &mut SendState) {
    st.queue.clear();
    st.queued_bytes = 0;
    st.send_active = false;
    st.send_thread_is_sending = false;
    st.node_up = false;
    st.conn = None;
    st.num_waits = 0;
    st.first_buffered_at = None;
}

/// Decide whether this submit may stay buffered. Holds the node lock.
fn adaptive_send_decision(st: &mut SendState, _now: u64, will_wait: &mut bool) {
    if st.max_wait_in_nanos == 0 {
        *will_wait = false;
        return;
    }
    if st.num_waits >= st.max_num_waits {
        st.first_buffered_at = None;
        st.num_waits = 0;
        *will_wait = false;
        return;
    }
    if let Some(first) = st.first_buffered_at {
        if first.elapsed().as_nanos() as u64 > st.max_wait_in_nanos {
            st.first_buffered_at = None;
            st.num_waits = 0;
            *will_wait = false;
            return;
        }
    }
    if st.num_waits == 0 {
        st.first_buffered_at = Some(Instant::now());
    }
    st.num_waits += 1;
    *will_wait = true;
}

/// Track wait-time statistics on every submit; the ring of recent send
/// timestamps is compacted down to the most recent entries when full.
fn adaptive_send_statistics(st: &mut SendState, now: u64) {
    let ix1 = st.send_timer_index.saturating_sub(st.max_num_waits as usize);
    let ix2 = st.send_timer_index.saturating_sub(st.max_num_waits as usize + 1);
    let elapsed1 = now.saturating_sub(st.send_timers[ix1]);
    let elapsed2 = now.saturating_sub(st.send_timers[ix2]);
    st.tot_curr_wait_time += elapsed1;
    st.tot_wait_time_plus_one += elapsed2;
    st.num_stats += 1;

    let mut index = st.send_timer_index + 1;
    if index == MAX_SEND_TIMERS {
        for i in 0..MAX_SENDS_TRACKED {
            st.send_timers[i] = st.send_timers[MAX_SEND_TIMERS - MAX_SENDS_TRACKED + i];
        }
        index = MAX_SENDS_TRACKED;
    }
    st.send_timers[index] = now;
    st.send_timer_index = index;
}

/// Re-balance `max_num_waits` against the configured wait budget.
fn adaptive_send_adjust(st: &mut SendState, now: u64) {
    adaptive_send_statistics(st, now);
    if st.num_stats == 0 {
        return;
    }
    let limit = st.max_wait_in_nanos / 2;
    let mean_curr = st.tot_curr_wait_time / st.num_stats;
    let mean_plus_one = st.tot_wait_time_plus_one / st.num_stats;
    st.tot_curr_wait_time = 0;
    st.tot_wait_time_plus_one = 0;
    st.num_stats = 0;
    if mean_curr > limit && st.max_num_waits > 0 {
        st.max_num_waits -= 1;
    }
    if mean_plus_one < limit && (st.max_num_waits as usize) < MAX_SENDS_TRACKED {
        st.max_num_waits += 1;
    }
}
