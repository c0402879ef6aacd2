//! Allocator for tags and fids.
//!
//! Ids live in a bitmap that grows by doubling up to `maxid`. When every id is
//! taken `get` waits, and `put` hands the released id straight to the oldest
//! waiter instead of clearing its bit.

use std::collections::VecDeque;
use std::sync::Mutex;

use log::{trace, warn};
use tokio::sync::oneshot;

use crate::utils::lock;

const INITIAL_BYTES: usize = 8;

struct Bitmap {
    bits: Vec<u8>,
    waiters: VecDeque<oneshot::Sender<u32>>,
}

impl Bitmap {
    fn alloc(&mut self, maxid: u32) -> Option<u32> {
        if let Some((i, b)) = self.bits.iter_mut().enumerate().find(|(_, b)| **b != 0xff) {
            let bit = (!*b).trailing_zeros();
            let id = (i as u64) * 8 + bit as u64;
            if id >= maxid as u64 {
                return None;
            }
            *b |= 1 << bit;
            return Some(id as u32);
        }

        let cap = (maxid as usize).div_ceil(8);
        let old = self.bits.len();
        if old >= cap {
            return None;
        }
        self.bits.resize((old * 2).clamp(1, cap), 0);
        let id = old as u64 * 8;
        if id >= maxid as u64 {
            return None;
        }
        self.bits[old] |= 1;
        Some(id as u32)
    }
}

/// Pool of ids in `[0, maxid)`
pub struct Pool {
    maxid: u32,
    inner: Mutex<Bitmap>,
}

// Gives the id back if the waiting `get` is dropped after `put` chose it
struct Waiter<'a> {
    pool: &'a Pool,
    rx: oneshot::Receiver<u32>,
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        self.rx.close();
        if let Ok(id) = self.rx.try_recv() {
            self.pool.put(id);
        }
    }
}

impl Pool {
    pub fn new(maxid: u32) -> Pool {
        let cap = (maxid as usize).div_ceil(8);
        Pool {
            maxid,
            inner: Mutex::new(Bitmap {
                bits: vec![0; INITIAL_BYTES.min(cap)],
                waiters: VecDeque::new(),
            }),
        }
    }

    /// Take an id without waiting
    pub fn try_get(&self) -> Option<u32> {
        lock(&self.inner).alloc(self.maxid)
    }

    /// Take an id, waiting for a `put` while the pool is exhausted
    pub async fn get(&self) -> u32 {
        loop {
            let mut waiter = {
                let mut inner = lock(&self.inner);
                if let Some(id) = inner.alloc(self.maxid) {
                    trace!("pool: get {}", id);
                    return id;
                }
                let (tx, rx) = oneshot::channel();
                inner.waiters.push_back(tx);
                Waiter { pool: self, rx }
            };

            trace!("pool: exhausted, waiting");
            if let Ok(id) = (&mut waiter.rx).await {
                trace!("pool: get {} from put", id);
                return id;
            }
        }
    }

    /// Release an id
    pub fn put(&self, id: u32) {
        if id >= self.maxid {
            warn!("pool: put of out of range id {}", id);
            return;
        }

        let mut inner = lock(&self.inner);
        while let Some(tx) = inner.waiters.pop_front() {
            if tx.send(id).is_ok() {
                return;
            }
        }

        if let Some(b) = inner.bits.get_mut((id / 8) as usize) {
            *b &= !(1 << (id % 8));
        }
        trace!("pool: put {}", id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn lowest_free_id_first() {
        let pool = Pool::new(1000);
        for expected in 0..100 {
            assert_eq!(pool.try_get(), Some(expected));
        }
        pool.put(42);
        pool.put(7);
        assert_eq!(pool.try_get(), Some(7));
        assert_eq!(pool.try_get(), Some(42));
        assert_eq!(pool.try_get(), Some(100));
    }

    #[test]
    fn never_exceeds_maxid() {
        let pool = Pool::new(11);
        let ids: Vec<u32> = std::iter::from_fn(|| pool.try_get()).collect();
        assert_eq!(ids, (0..11).collect::<Vec<_>>());
        pool.put(11);
        assert_eq!(pool.try_get(), None);
    }

    #[tokio::test]
    async fn put_hands_id_to_oldest_waiter() {
        let pool = Arc::new(Pool::new(2));
        assert_eq!(pool.get().await, 0);
        assert_eq!(pool.get().await, 1);

        let first = tokio::spawn({
            let pool = pool.clone();
            async move { pool.get().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        let second = tokio::spawn({
            let pool = pool.clone();
            async move { pool.get().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        pool.put(1);
        assert_eq!(first.await.unwrap(), 1);
        pool.put(0);
        assert_eq!(second.await.unwrap(), 0);
        assert_eq!(pool.try_get(), None);
    }

    #[tokio::test]
    async fn abandoned_waiter_does_not_leak() {
        let pool = Pool::new(1);
        assert_eq!(pool.get().await, 0);

        let timed_out = tokio::time::timeout(Duration::from_millis(10), pool.get()).await;
        assert!(timed_out.is_err());

        pool.put(0);
        assert_eq!(pool.try_get(), Some(0));
    }
}
