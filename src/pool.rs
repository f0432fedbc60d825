//! Connection pool and read-buffer freelist.
//!
//! Closed-loop workers borrow connections through a [`CheckoutQueue`]; the
//! returned [`PooledConnection`] guard puts the connection back when it is
//! dropped, on every exit path. Open-loop workers instead get a fixed
//! [`ConnectionPool::teams`] partition for the whole run.

use crate::ws::Connection;
use anyhow::{bail, Context, Result};
use crossbeam::queue::ArrayQueue;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::debug;

/// Fixed membership set of upgraded connections.
#[derive(Debug, Clone)]
pub struct ConnectionPool {
    conns: Vec<Arc<Connection>>,
}

impl ConnectionPool {
    pub fn new(conns: Vec<Connection>) -> Self {
        Self {
            conns: conns.into_iter().map(Arc::new).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    pub fn connections(&self) -> &[Arc<Connection>] {
        &self.conns
    }

    /// Total messages sent across every connection
    pub fn total_sent(&self) -> u64 {
        self.conns.iter().map(|c| c.sent()).sum()
    }

    /// Total messages received across every connection
    pub fn total_received(&self) -> u64 {
        self.conns.iter().map(|c| c.received()).sum()
    }

    /// Build a checkout queue holding every connection `overlap` times.
    ///
    /// With `overlap > 1` up to `overlap` workers may hold the same
    /// connection; their round trips still serialize on the connection
    /// itself.
    pub fn checkout_queue(&self, overlap: usize) -> CheckoutQueue {
        let overlap = overlap.max(1);
        let slots = (self.conns.len() * overlap).max(1);
        let queue = ArrayQueue::new(slots);
        for _ in 0..overlap {
            for conn in &self.conns {
                // Capacity is exact, so push cannot fail here.
                let _ = queue.push(Arc::clone(conn));
            }
        }
        let available = Semaphore::new(queue.len());
        debug!("Checkout queue holds {} slots", queue.len());
        CheckoutQueue { queue, available }
    }

    /// Split the pool into `n` disjoint teams by round-robin assignment.
    ///
    /// `n` is clamped to `1..=len`, so no team is ever empty.
    pub fn teams(&self, n: usize) -> Vec<Vec<Arc<Connection>>> {
        if self.conns.is_empty() {
            return Vec::new();
        }
        let n = n.clamp(1, self.conns.len());
        let mut teams: Vec<Vec<Arc<Connection>>> = (0..n)
            .map(|_| Vec::with_capacity(self.conns.len() / n + 1))
            .collect();
        for (i, conn) in self.conns.iter().enumerate() {
            teams[i % n].push(Arc::clone(conn));
        }
        teams
    }
}

/// Bounded queue of connections acting as a counting semaphore.
pub struct CheckoutQueue {
    queue: ArrayQueue<Arc<Connection>>,
    available: Semaphore,
}

impl CheckoutQueue {
    /// Wait until a connection is free and borrow it.
    pub async fn checkout(&self) -> Result<PooledConnection<'_>> {
        let permit = self
            .available
            .acquire()
            .await
            .context("Checkout queue semaphore closed")?;
        permit.forget();
        match self.queue.pop() {
            Some(conn) => Ok(PooledConnection { conn, owner: self }),
            None => {
                self.available.add_permits(1);
                bail!("Checkout permit granted with no idle connection")
            }
        }
    }

    /// Connections currently sitting in the queue
    pub fn idle(&self) -> usize {
        self.queue.len()
    }

    fn give_back(&self, conn: Arc<Connection>) {
        if self.queue.push(conn).is_ok() {
            self.available.add_permits(1);
        }
    }
}

/// Exclusive borrow of a connection from a [`CheckoutQueue`].
pub struct PooledConnection<'a> {
    conn: Arc<Connection>,
    owner: &'a CheckoutQueue,
}

impl Deref for PooledConnection<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.conn
    }
}

impl Drop for PooledConnection<'_> {
    fn drop(&mut self) {
        self.owner.give_back(Arc::clone(&self.conn));
    }
}

/// Freelist of read buffers pre-sized for the expected response.
pub struct BufferPool {
    free: ArrayQueue<Vec<u8>>,
    default_capacity: usize,
}

impl BufferPool {
    /// Create a pool of `slots` buffers, each with `default_capacity` bytes.
    pub fn new(slots: usize, default_capacity: usize) -> Self {
        let free = ArrayQueue::new(slots.max(1));
        for _ in 0..slots.max(1) {
            let _ = free.push(Vec::with_capacity(default_capacity));
        }
        Self {
            free,
            default_capacity,
        }
    }

    /// Take a buffer, allocating only when the freelist is empty.
    pub fn get(&self) -> PooledBuffer<'_> {
        let buf = self
            .free
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(self.default_capacity));
        PooledBuffer { buf, owner: self }
    }

    pub fn available(&self) -> usize {
        self.free.len()
    }
}

/// Buffer borrowed from a [`BufferPool`], returned on drop.
pub struct PooledBuffer<'a> {
    buf: Vec<u8>,
    owner: &'a BufferPool,
}

impl Deref for PooledBuffer<'_> {
    type Target = Vec<u8>;

    fn deref(&self) -> &Vec<u8> {
        &self.buf
    }
}

impl DerefMut for PooledBuffer<'_> {
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        &mut self.buf
    }
}

impl Drop for PooledBuffer<'_> {
    fn drop(&mut self) {
        let mut buf = std::mem::take(&mut self.buf);
        buf.clear();
        let _ = self.owner.free.push(buf);
    }
}
