//! Buffer page pool.
//!
//! Fixed-size pages lent to the receive pipeline and the send path.
//! A received page is shared by every message carved from it; the share
//! count lives in the `Arc` and the buffer returns to the free list
//! when the last reference drops. Posting a batch of messages costs one
//! reference, not one per message.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// Size of one buffer page.
pub const PAGE_SIZE: usize = 32 * 1024;

struct PoolInner {
    free: Mutex<Vec<Vec<u8>>>,
    lent: AtomicU64,
    returned: AtomicU64,
}

/// The process-wide page pool.
pub struct PagePool {
    inner: Arc<PoolInner>,
    page_size: usize,
}

impl PagePool {
    pub fn new(page_size: usize, prealloc: usize) -> Arc<PagePool> {
        let free = (0..prealloc).map(|_| vec![0u8; page_size]).collect();
        Arc::new(PagePool {
            inner: Arc::new(PoolInner {
                free: Mutex::new(free),
                lent: AtomicU64::new(0),
                returned: AtomicU64::new(0),
            }),
            page_size,
        })
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Borrow a zero-length buffer with page capacity.
    pub fn get_buffer(&self) -> Vec<u8> {
        self.inner.lent.fetch_add(1, Ordering::Relaxed);
        let mut buf = {
            let mut free = self.inner.free.lock().expect("pool lock");
            free.pop().unwrap_or_else(|| Vec::with_capacity(self.page_size))
        };
        buf.clear();
        buf
    }

    /// Give a buffer back without sharing it first.
    pub fn put_buffer(&self, buf: Vec<u8>) {
        self.inner.returned.fetch_add(1, Ordering::Relaxed);
        let mut free = self.inner.free.lock().expect("pool lock");
        free.push(buf);
    }

    /// Freeze a filled buffer into a shared page. The page returns to
    /// this pool when its last reference drops.
    pub fn share(&self, buf: Vec<u8>) -> PageRef {
        Arc::new(Page {
            buf: Some(buf),
            pool: Arc::downgrade(&self.inner),
        })
    }

    /// Pages currently out of the pool.
    pub fn outstanding(&self) -> u64 {
        self.inner.lent.load(Ordering::Relaxed) - self.inner.returned.load(Ordering::Relaxed)
    }
}

/// A shared, read-only page. Reference count is the `Arc` strong count;
/// it can never observe a negative value and the buffer is back on the
/// free list exactly when it reaches zero.
pub struct Page {
    buf: Option<Vec<u8>>,
    pool: Weak<PoolInner>,
}

pub type PageRef = Arc<Page>;

impl Page {
    pub fn bytes(&self) -> &[u8] {
        self.buf.as_deref().unwrap_or(&[])
    }
}

impl Drop for Page {
    fn drop(&mut self) {
        if let (Some(buf), Some(pool)) = (self.buf.take(), self.pool.upgrade()) {
            pool.returned.fetch_add(1, Ordering::Relaxed);
            let mut free = pool.free.lock().expect("pool lock");
            free.push(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lend_and_return() {
        let pool = PagePool::new(1024, 2);
        let buf = pool.get_buffer();
        assert_eq!(pool.outstanding(), 1);
        pool.put_buffer(buf);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_shared_page_returns_on_last_drop() {
        let pool = PagePool::new(1024, 1);
        let mut buf = pool.get_buffer();
        buf.extend_from_slice(b"abcd");
        let page = pool.share(buf);
        let clone = Arc::clone(&page);
        assert_eq!(pool.outstanding(), 1);
        drop(page);
        assert_eq!(pool.outstanding(), 1, "page still referenced");
        assert_eq!(clone.bytes(), b"abcd");
        drop(clone);
        assert_eq!(pool.outstanding(), 0, "last drop returns the page");
    }

    #[test]
    fn test_buffer_reuse() {
        let pool = PagePool::new(1024, 1);
        let buf = pool.get_buffer();
        let cap = buf.capacity();
        pool.put_buffer(buf);
        let buf2 = pool.get_buffer();
        assert_eq!(buf2.capacity(), cap);
    }
}
