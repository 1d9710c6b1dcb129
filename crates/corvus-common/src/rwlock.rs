//! Readers-writer spin lock gating index operations.
//!
//! Many concurrent readers, one writer, no reader-writer overlap. Readers
//! bump a sharded counter and a thread-local holds count; nested reader
//! acquisitions on the same thread are counted rather than re-queued, and a
//! read taken while the thread holds the write lock is a no-op. Writers
//! queue through an atomic swap of per-thread wait nodes: each writer
//! spin-parks on its predecessor's `locked` flag, then waits for the total
//! reader count to drain to zero before taking ownership. Releasing a
//! writer clears its node, unparks the queued successor and all readers
//! that registered while the node was locked, and recycles node storage by
//! swapping with the predecessor.
//!
//! Acquisitions are not cancellable and carry no timeout.

use parking_lot::Mutex;
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicIsize, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, Thread};

const READER_SHARDS: usize = 32;

/// Spin rounds on the reader drain before yielding the CPU.
const DRAIN_SPIN_ROUNDS: u32 = 1 << 10;

static NEXT_LOCK_ID: AtomicUsize = AtomicUsize::new(0);
static NEXT_THREAD_SLOT: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    /// Per-instance holds counter: > 0 while reading, < 0 while writing.
    static LOCK_HOLDS: RefCell<HashMap<usize, i32>> = RefCell::new(HashMap::new());
    /// Per-instance recycled writer wait nodes: (own node, predecessor).
    static WRITER_NODES: RefCell<HashMap<usize, WriterSlot>> = RefCell::new(HashMap::new());
    /// Stable shard assignment for this thread.
    static THREAD_SLOT: usize = NEXT_THREAD_SLOT.fetch_add(1, Ordering::Relaxed);
}

struct WriterSlot {
    node: Arc<WaitNode>,
    predecessor: Option<Arc<WaitNode>>,
}

/// A node in the writer queue.
struct WaitNode {
    locked: AtomicBool,
    waiting_writer: Mutex<Option<Thread>>,
    waiting_readers: Mutex<Vec<Thread>>,
}

impl WaitNode {
    fn new(locked: bool) -> Arc<Self> {
        Arc::new(Self {
            locked: AtomicBool::new(locked),
            waiting_writer: Mutex::new(None),
            waiting_readers: Mutex::new(Vec::new()),
        })
    }
}

/// Counter shard, padded to its own cache line.
#[repr(align(64))]
struct ReaderShard(AtomicIsize);

/// The lock itself. See the module docs for the protocol.
pub struct ReadersWriterSpinLock {
    id: usize,
    tail: Mutex<Arc<WaitNode>>,
    readers: [ReaderShard; READER_SHARDS],
}

impl Default for ReadersWriterSpinLock {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadersWriterSpinLock {
    /// Creates an unlocked instance.
    pub fn new() -> Self {
        Self {
            id: NEXT_LOCK_ID.fetch_add(1, Ordering::Relaxed),
            tail: Mutex::new(WaitNode::new(false)),
            readers: [(); READER_SHARDS].map(|_| ReaderShard(AtomicIsize::new(0))),
        }
    }

    fn holds(&self) -> i32 {
        LOCK_HOLDS.with(|holds| holds.borrow().get(&self.id).copied().unwrap_or(0))
    }

    fn set_holds(&self, value: i32) {
        LOCK_HOLDS.with(|holds| {
            holds.borrow_mut().insert(self.id, value);
        });
    }

    fn shard(&self) -> &AtomicIsize {
        let slot = THREAD_SLOT.with(|slot| *slot);
        &self.readers[slot % READER_SHARDS].0
    }

    fn tail_node(&self) -> Arc<WaitNode> {
        self.tail.lock().clone()
    }

    /// Total reader count. Individual shards may be transiently non-zero
    /// during reader release; the writer only cares about the sum.
    fn readers_drained(&self) -> bool {
        self.readers
            .iter()
            .map(|shard| shard.0.load(Ordering::SeqCst))
            .sum::<isize>()
            == 0
    }

    /// Acquires the lock for shared access.
    pub fn acquire_read(&self) {
        let holds = self.holds();
        if holds > 0 {
            // Nested read on this thread.
            self.set_holds(holds + 1);
            return;
        }
        if holds < 0 {
            // Write lock already held by this thread.
            return;
        }

        let shard = self.shard();
        shard.fetch_add(1, Ordering::SeqCst);

        let mut node = self.tail_node();
        while node.locked.load(Ordering::SeqCst) {
            shard.fetch_sub(1, Ordering::SeqCst);

            while node.locked.load(Ordering::SeqCst) {
                node.waiting_readers.lock().push(thread::current());

                let current_tail = self.tail_node();
                if Arc::ptr_eq(&node, &current_tail) && node.locked.load(Ordering::SeqCst) {
                    thread::park();
                }
                node = self.tail_node();
            }

            shard.fetch_add(1, Ordering::SeqCst);
            node = self.tail_node();
        }

        self.set_holds(1);
    }

    /// Releases a shared acquisition.
    pub fn release_read(&self) {
        let holds = self.holds();
        if holds > 1 {
            self.set_holds(holds - 1);
            return;
        }
        if holds < 0 {
            // Write lock held by this thread; the read was a no-op.
            return;
        }
        debug_assert_eq!(holds, 1, "read lock released without acquisition");

        self.shard().fetch_sub(1, Ordering::SeqCst);
        self.set_holds(0);
    }

    /// Acquires the lock for exclusive access.
    pub fn acquire_write(&self) {
        let holds = self.holds();
        if holds < 0 {
            // Recursive write on this thread.
            self.set_holds(holds - 1);
            return;
        }
        debug_assert_eq!(holds, 0, "write lock requested while holding read lock");

        let node = self.writer_node();
        node.locked.store(true, Ordering::SeqCst);

        let predecessor = {
            let mut tail = self.tail.lock();
            std::mem::replace(&mut *tail, node.clone())
        };

        while predecessor.locked.load(Ordering::SeqCst) {
            *predecessor.waiting_writer.lock() = Some(thread::current());

            if predecessor.locked.load(Ordering::SeqCst) {
                thread::park();
            }
        }
        *predecessor.waiting_writer.lock() = None;

        self.store_predecessor(predecessor);

        let mut rounds = 0u32;
        while !self.readers_drained() {
            std::hint::spin_loop();
            rounds += 1;
            if rounds >= DRAIN_SPIN_ROUNDS {
                thread::yield_now();
                rounds = 0;
            }
        }

        self.set_holds(-1);
    }

    /// Releases an exclusive acquisition.
    pub fn release_write(&self) {
        let holds = self.holds();
        if holds < -1 {
            self.set_holds(holds + 1);
            return;
        }
        debug_assert_eq!(holds, -1, "write lock released without acquisition");

        let node = self.writer_node();
        node.locked.store(false, Ordering::SeqCst);

        if let Some(writer) = node.waiting_writer.lock().clone() {
            writer.unpark();
        }

        for reader in node.waiting_readers.lock().drain(..) {
            reader.unpark();
        }

        self.recycle_node();
        self.set_holds(0);
    }

    /// Shared acquisition released on drop.
    pub fn shared(&self) -> SharedGuard<'_> {
        self.acquire_read();
        SharedGuard { lock: self }
    }

    /// Exclusive acquisition released on drop.
    pub fn exclusive(&self) -> ExclusiveGuard<'_> {
        self.acquire_write();
        ExclusiveGuard { lock: self }
    }

    fn writer_node(&self) -> Arc<WaitNode> {
        WRITER_NODES.with(|nodes| {
            nodes
                .borrow_mut()
                .entry(self.id)
                .or_insert_with(|| WriterSlot {
                    node: WaitNode::new(false),
                    predecessor: None,
                })
                .node
                .clone()
        })
    }

    fn store_predecessor(&self, predecessor: Arc<WaitNode>) {
        WRITER_NODES.with(|nodes| {
            if let Some(slot) = nodes.borrow_mut().get_mut(&self.id) {
                slot.predecessor = Some(predecessor);
            }
        });
    }

    /// Swaps the thread's node with its predecessor so the storage is
    /// reused on the next acquisition.
    fn recycle_node(&self) {
        WRITER_NODES.with(|nodes| {
            if let Some(slot) = nodes.borrow_mut().get_mut(&self.id) {
                if let Some(predecessor) = slot.predecessor.take() {
                    slot.node = predecessor;
                }
            }
        });
    }
}

/// RAII guard for a shared acquisition.
pub struct SharedGuard<'a> {
    lock: &'a ReadersWriterSpinLock,
}

impl Drop for SharedGuard<'_> {
    fn drop(&mut self) {
        self.lock.release_read();
    }
}

/// RAII guard for an exclusive acquisition.
pub struct ExclusiveGuard<'a> {
    lock: &'a ReadersWriterSpinLock,
}

impl Drop for ExclusiveGuard<'_> {
    fn drop(&mut self) {
        self.lock.release_write();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;
    use std::sync::Arc;

    #[test]
    fn test_uncontended_read_write() {
        let lock = ReadersWriterSpinLock::new();

        lock.acquire_read();
        lock.release_read();

        lock.acquire_write();
        lock.release_write();

        lock.acquire_read();
        lock.release_read();
    }

    #[test]
    fn test_nested_reads_are_counted() {
        let lock = ReadersWriterSpinLock::new();

        lock.acquire_read();
        lock.acquire_read();
        lock.acquire_read();
        lock.release_read();
        lock.release_read();
        lock.release_read();

        // Fully released: a writer can now enter.
        lock.acquire_write();
        lock.release_write();
    }

    #[test]
    fn test_read_inside_write_is_noop() {
        let lock = ReadersWriterSpinLock::new();

        lock.acquire_write();
        lock.acquire_read();
        lock.release_read();
        lock.release_write();

        lock.acquire_write();
        lock.release_write();
    }

    #[test]
    fn test_recursive_write() {
        let lock = ReadersWriterSpinLock::new();

        lock.acquire_write();
        lock.acquire_write();
        lock.release_write();
        // Still held after the inner release.
        lock.release_write();

        lock.acquire_write();
        lock.release_write();
    }

    #[test]
    fn test_guards_release_on_drop() {
        let lock = ReadersWriterSpinLock::new();

        {
            let _guard = lock.shared();
        }
        {
            let _guard = lock.exclusive();
        }
        let _guard = lock.exclusive();
    }

    #[test]
    fn test_writers_are_mutually_exclusive() {
        let lock = Arc::new(ReadersWriterSpinLock::new());
        let counter = Arc::new(AtomicU64::new(0));

        let threads: Vec<_> = (0..4)
            .map(|_| {
                let lock = lock.clone();
                let counter = counter.clone();
                thread::spawn(move || {
                    for _ in 0..1000 {
                        let _guard = lock.exclusive();
                        // Unsynchronized read-modify-write: only correct if
                        // the lock provides mutual exclusion.
                        let value = counter.load(Ordering::Relaxed);
                        counter.store(value + 1, Ordering::Relaxed);
                    }
                })
            })
            .collect();

        for handle in threads {
            handle.join().unwrap();
        }

        assert_eq!(counter.load(Ordering::SeqCst), 4000);
    }

    #[test]
    fn test_readers_never_observe_torn_state() {
        let lock = Arc::new(ReadersWriterSpinLock::new());
        let pair = Arc::new((AtomicU64::new(0), AtomicU64::new(0)));

        let writer = {
            let lock = lock.clone();
            let pair = pair.clone();
            thread::spawn(move || {
                for i in 1..=2000u64 {
                    let _guard = lock.exclusive();
                    pair.0.store(i, Ordering::Relaxed);
                    pair.1.store(i, Ordering::Relaxed);
                }
            })
        };

        let readers: Vec<_> = (0..3)
            .map(|_| {
                let lock = lock.clone();
                let pair = pair.clone();
                thread::spawn(move || {
                    for _ in 0..2000 {
                        let _guard = lock.shared();
                        let a = pair.0.load(Ordering::Relaxed);
                        let b = pair.1.load(Ordering::Relaxed);
                        assert_eq!(a, b, "reader overlapped a writer");
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for handle in readers {
            handle.join().unwrap();
        }
    }
}
