use std::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed, Release};
use std::sync::atomic::{AtomicU32, AtomicU64};
use std::sync::{Arc, OnceLock};

use sdd::{Shared, Tag};

use super::node::{Entry, NodeState, Slot, NIL};

/// Slots in the first chunk; chunk `c` holds `64 << c` slots.
const FIRST_CHUNK_BITS: u32 = 6;
const CHUNK_BASE: u64 = 1 << FIRST_CHUNK_BITS;
const NUM_CHUNKS: usize = 26;

/// A chunked slot arena handing out stable `u32` node handles.
///
/// Handle `0` is the shared sentinel. Chunks are installed on demand and
/// never move, so a handle observed by a reader stays valid; freed slots
/// re-enter circulation only through [`Arena::retire`], which defers the
/// free-list push past every active [`sdd::Guard`].
pub(super) struct Arena<T: 'static> {
    inner: Arc<Inner<T>>,
}

struct Inner<T: 'static> {
    chunks: Box<[OnceLock<Box<[Slot<T>]>>]>,
    /// Next never-used handle; slot `0` is the sentinel.
    high_water: AtomicU32,
    /// Tagged head of the free list: upper half ABA tag, lower half handle.
    free_head: AtomicU64,
}

/// Maps a handle to its chunk and the offset within the chunk.
fn locate(id: u32) -> (usize, usize) {
    let biased = u64::from(id) + CHUNK_BASE;
    let msb = 63 - u64::leading_zeros(biased);
    let chunk = (msb - FIRST_CHUNK_BITS) as usize;
    let offset = (biased - (1_u64 << msb)) as usize;
    (chunk, offset)
}

impl<T: 'static> Arena<T> {
    pub(super) fn new() -> Self {
        let chunks: Box<[OnceLock<Box<[Slot<T>]>>]> =
            (0..NUM_CHUNKS).map(|_| OnceLock::new()).collect();
        let inner = Arc::new(Inner {
            chunks,
            high_water: AtomicU32::new(1),
            free_head: AtomicU64::new(0),
        });
        // The sentinel occupies slot `0` of the first chunk.
        inner.chunk(0);
        Self { inner }
    }

    pub(super) fn slot(&self, id: u32) -> &Slot<T> {
        self.inner.slot(id)
    }

    /// Takes a slot out of circulation and installs the entry.
    ///
    /// The slot comes back at level `1` with sentinel links, in the
    /// [`NodeState::Inserting`] state, unpublished.
    pub(super) fn allocate(&self, entry: Entry<T>) -> u32 {
        let id = if let Some(id) = self.inner.pop_free() {
            id
        } else {
            let id = self.inner.high_water.fetch_add(1, Relaxed);
            assert!(locate(id).0 < NUM_CHUNKS, "arena exhausted");
            id
        };
        let slot = self.inner.slot(id);
        slot.reset(1, NodeState::Inserting);
        // A recycled slot may still carry the entry of its previous life.
        let _previous = slot
            .entry()
            .swap((Some(Shared::new(entry)), Tag::None), Release);
        id
    }

    /// Returns a never-published slot to the free list immediately.
    pub(super) fn recycle(&self, id: u32) {
        self.inner.slot(id).set_state(NodeState::Retired);
        self.inner.push_free(id);
    }

    /// Returns a detached slot to the free list once no reader can reach it.
    pub(super) fn retire(&self, id: u32) {
        debug_assert_ne!(id, NIL);
        drop(Shared::new(Reclaim {
            arena: Arc::clone(&self.inner),
            id,
        }));
    }
}

impl<T: 'static> Inner<T> {
    fn chunk(&self, index: usize) -> &[Slot<T>] {
        self.chunks[index].get_or_init(|| {
            (0..(CHUNK_BASE << index))
                .map(|_| Slot::vacant())
                .collect::<Vec<_>>()
                .into_boxed_slice()
        })
    }

    fn slot(&self, id: u32) -> &Slot<T> {
        let (chunk, offset) = locate(id);
        &self.chunk(chunk)[offset]
    }

    fn push_free(&self, id: u32) {
        loop {
            let head = self.free_head.load(Acquire);
            self.slot(id).set_left(head as u32);
            let tag = (head >> 32).wrapping_add(1) & u64::from(u32::MAX);
            let tagged = (tag << 32) | u64::from(id);
            if self
                .free_head
                .compare_exchange(head, tagged, AcqRel, Relaxed)
                .is_ok()
            {
                return;
            }
        }
    }

    fn pop_free(&self) -> Option<u32> {
        loop {
            let head = self.free_head.load(Acquire);
            let id = head as u32;
            if id == NIL {
                return None;
            }
            let next = self.slot(id).left();
            let tag = (head >> 32).wrapping_add(1) & u64::from(u32::MAX);
            let tagged = (tag << 32) | u64::from(next);
            if self
                .free_head
                .compare_exchange(head, tagged, AcqRel, Relaxed)
                .is_ok()
            {
                return Some(id);
            }
        }
    }
}

/// Free-list push token; dropped by the collector after a grace period.
struct Reclaim<T: 'static> {
    arena: Arc<Inner<T>>,
    id: u32,
}

impl<T: 'static> Drop for Reclaim<T> {
    fn drop(&mut self) {
        self.arena.push_free(self.id);
    }
}
