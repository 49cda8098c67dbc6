use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// One live entry in the table.
#[derive(Debug)]
struct Connection {
    id: u64,
    peer: SocketAddr,
    worker: Option<JoinHandle<()>>,
    close: watch::Sender<bool>,
}

#[derive(Debug)]
struct Slots {
    entries: Vec<Option<Connection>>,
    active: usize,
}

/// Fixed-capacity registry of active connections behind one mutex.
///
/// The lock is only held for slot bookkeeping, never across an await.
#[derive(Debug)]
pub struct ConnectionTable {
    slots: Mutex<Slots>,
    next_id: AtomicU64,
}

/// Handed to a worker together with its slot; releases the slot when dropped.
#[derive(Debug)]
pub struct SlotLease {
    table: Arc<ConnectionTable>,
    slot: usize,
    id: u64,
}

impl SlotLease {
    pub fn slot(&self) -> usize {
        self.slot
    }
}

impl Drop for SlotLease {
    fn drop(&mut self) {
        let remaining = self.table.release(self.slot, self.id);
        tracing::info!(slot = self.slot, active = remaining, "client disconnected");
    }
}

impl ConnectionTable {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            slots: Mutex::new(Slots {
                entries: (0..capacity).map(|_| None).collect(),
                active: 0,
            }),
            next_id: AtomicU64::new(1),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Slots> {
        // A panic while holding the lock cannot leave the slots half-updated.
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn active(&self) -> usize {
        self.lock().active
    }

    /// Claim a free slot and start its worker, all under one lock.
    ///
    /// `spawn` receives the slot lease and a close signal and must start the
    /// worker without waiting for it. Returns `None` when the table is full,
    /// in which case `spawn` is not called.
    pub fn try_claim<F>(self: &Arc<Self>, peer: SocketAddr, spawn: F) -> Option<usize>
    where
        F: FnOnce(SlotLease, watch::Receiver<bool>) -> JoinHandle<()>,
    {
        let mut slots = self.lock();
        let slot = slots.entries.iter().position(Option::is_none)?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (close, close_rx) = watch::channel(false);
        slots.entries[slot] = Some(Connection {
            id,
            peer,
            worker: None,
            close,
        });
        slots.active += 1;

        let lease = SlotLease {
            table: Arc::clone(self),
            slot,
            id,
        };
        let worker = spawn(lease, close_rx);
        if let Some(conn) = slots.entries[slot].as_mut() {
            conn.worker = Some(worker);
        }
        Some(slot)
    }

    /// Clear a slot. Ignored if the slot was already cleared or reassigned.
    fn release(&self, slot: usize, id: u64) -> usize {
        let mut slots = self.lock();
        let owned = matches!(slots.entries.get(slot), Some(Some(conn)) if conn.id == id);
        if owned {
            slots.entries[slot] = None;
            slots.active -= 1;
        }
        slots.active
    }

    /// Signal every active worker to close its connection.
    pub fn close_all(&self) -> usize {
        let slots = self.lock();
        let mut signalled = 0;
        for conn in slots.entries.iter().flatten() {
            tracing::debug!(peer = %conn.peer, "closing connection");
            conn.close.send_replace(true);
            signalled += 1;
        }
        signalled
    }

    /// Abort workers that are still running and clear their slots.
    pub fn abort_remaining(&self) -> usize {
        let mut slots = self.lock();
        let mut aborted = 0;
        for entry in slots.entries.iter_mut() {
            if let Some(conn) = entry.take() {
                if let Some(worker) = conn.worker {
                    worker.abort();
                }
                tracing::warn!(peer = %conn.peer, "aborted worker that outlived shutdown");
                aborted += 1;
            }
        }
        slots.active = 0;
        aborted
    }
}
