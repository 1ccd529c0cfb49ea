use std::mem::ManuallyDrop;
use std::ptr;
use std::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed, Release};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8};

use sdd::AtomicShared;

/// Handle of the shared sentinel slot standing for "no child" and "no parent".
///
/// The sentinel sits at level `0` and is never claimed or written.
pub(super) const NIL: u32 = 0;

/// Concurrency state of a node slot.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(super) enum NodeState {
    /// Not reserved by any operation.
    Idle,
    /// Reserved while a new leaf is being attached at this node.
    Inserting,
    /// Reserved by a structural fix-up or an unlink.
    Balancing,
    /// The slot has left the tree; terminal until the slot is reused.
    Retired,
}

const IDLE: u8 = 0;
const INSERTING: u8 = 1;
const BALANCING: u8 = 2;
const RETIRED: u8 = 3;

impl NodeState {
    const fn as_u8(self) -> u8 {
        match self {
            NodeState::Idle => IDLE,
            NodeState::Inserting => INSERTING,
            NodeState::Balancing => BALANCING,
            NodeState::Retired => RETIRED,
        }
    }

    fn from_u8(state: u8) -> NodeState {
        match state {
            IDLE => NodeState::Idle,
            INSERTING => NodeState::Inserting,
            BALANCING => NodeState::Balancing,
            _ => NodeState::Retired,
        }
    }
}

/// A node slot in the arena.
///
/// Child and parent links are arena handles. The parent link is a hint for
/// ascending operations; the claimed parent's child edge is the authority.
pub(super) struct Slot<T> {
    left: AtomicU32,
    right: AtomicU32,
    parent: AtomicU32,
    level: AtomicU32,
    state: AtomicU8,
    entry: AtomicShared<Entry<T>>,
}

impl<T: 'static> Slot<T> {
    /// Creates an unoccupied slot; also the sentinel layout.
    pub(super) fn vacant() -> Self {
        Self {
            left: AtomicU32::new(NIL),
            right: AtomicU32::new(NIL),
            parent: AtomicU32::new(NIL),
            level: AtomicU32::new(0),
            state: AtomicU8::new(RETIRED),
            entry: AtomicShared::null(),
        }
    }

    pub(super) fn left(&self) -> u32 {
        self.left.load(Acquire)
    }

    pub(super) fn set_left(&self, child: u32) {
        self.left.store(child, Release);
    }

    pub(super) fn right(&self) -> u32 {
        self.right.load(Acquire)
    }

    pub(super) fn set_right(&self, child: u32) {
        self.right.store(child, Release);
    }

    pub(super) fn parent(&self) -> u32 {
        self.parent.load(Acquire)
    }

    pub(super) fn set_parent(&self, parent: u32) {
        self.parent.store(parent, Release);
    }

    pub(super) fn level(&self) -> u32 {
        self.level.load(Acquire)
    }

    pub(super) fn set_level(&self, level: u32) {
        self.level.store(level, Release);
    }

    pub(super) fn state(&self) -> NodeState {
        NodeState::from_u8(self.state.load(Acquire))
    }

    /// Sets the state unconditionally; the caller owns the current claim.
    pub(super) fn set_state(&self, state: NodeState) {
        self.state.store(state.as_u8(), Release);
    }

    /// Tries to move the slot from [`NodeState::Idle`] into `state`.
    pub(super) fn claim(&self, state: NodeState) -> bool {
        self.state
            .compare_exchange(IDLE, state.as_u8(), AcqRel, Relaxed)
            .is_ok()
    }

    pub(super) fn entry(&self) -> &AtomicShared<Entry<T>> {
        &self.entry
    }

    /// Prepares a recycled or fresh slot for publication.
    pub(super) fn reset(&self, level: u32, state: NodeState) {
        self.left.store(NIL, Relaxed);
        self.right.store(NIL, Relaxed);
        self.parent.store(NIL, Relaxed);
        self.level.store(level, Relaxed);
        self.state.store(state.as_u8(), Release);
    }
}

/// Payload cell of a node.
///
/// The value can be moved back out of an [`Entry`] that was never published,
/// in which case the [`Drop`] implementation leaves it alone.
pub(super) struct Entry<T> {
    value: ManuallyDrop<T>,
    taken: AtomicBool,
}

impl<T> Entry<T> {
    pub(super) fn new(value: T) -> Self {
        Self {
            value: ManuallyDrop::new(value),
            taken: AtomicBool::new(false),
        }
    }

    pub(super) fn get(&self) -> &T {
        &self.value
    }

    /// Moves the value out.
    ///
    /// # Safety
    ///
    /// The caller must have exclusive logical access to the [`Entry`]: it was
    /// never linked into the tree, therefore no other thread reads it.
    pub(super) unsafe fn take(&self) -> T {
        debug_assert!(!self.taken.load(Relaxed));
        self.taken.store(true, Relaxed);
        ptr::read(&*self.value)
    }
}

impl<T> Drop for Entry<T> {
    fn drop(&mut self) {
        if !self.taken.load(Relaxed) {
            // Safety: the value was not moved out, and this is the only drop.
            unsafe {
                ManuallyDrop::drop(&mut self.value);
            }
        }
    }
}
