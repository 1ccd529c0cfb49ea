//! [`AaTree`].

mod arena;
mod balance;
mod claim;
mod error;
mod node;

use std::cmp::Ordering;
use std::fmt;
use std::fmt::Debug;
use std::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize};

use sdd::{Guard, Tag};

use self::arena::Arena;
use self::claim::{Backoff, HeldClaims};
use self::error::{InsertError, RemoveError, SearchError};
use self::node::{Entry, NodeState, NIL};

pub use self::error::IntegrityError;

/// Traversal orders accepted by [`AaTree::walk`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WalkOrder {
    /// A node is visited before its subtrees.
    PreOrder,
    /// The left subtree, the node, then the right subtree: ascending order.
    InOrder,
    /// Both subtrees are visited before the node.
    PostOrder,
}

/// Child edge selector.
#[derive(Clone, Copy, Eq, PartialEq)]
enum Side {
    Left,
    Right,
}

/// Attempts at reserving the in-order successor neighborhood before the
/// whole removal backs out and retries from the top.
const STEAL_ATTEMPTS: usize = 16;

/// Capacity of the recorded descent path to the in-order successor.
///
/// Every left child sits exactly one level below its parent, so the path
/// can never be longer than the root level; the capacity doubles that for
/// stale reads, which are re-verified and abandoned anyway.
const SUCCESSOR_PATH_CAP: usize = 64;

/// Scalable concurrent self-balancing ordered tree.
///
/// [`AaTree`] is an [AA tree](https://en.wikipedia.org/wiki/AA_tree): a
/// binary search tree where every node carries a level, a left child is
/// always exactly one level below its parent, and a right child is at most
/// one level below, with at most one right child per level. Two local
/// rotations, skew and split, restore the rules after every insert and
/// remove, which keeps the height logarithmic.
///
/// Every operation can run concurrently with every other operation on any
/// number of threads.
///
/// ## Concurrency
///
/// * Structural mutations reserve a bounded neighborhood of nodes through a
///   per-node compare-and-swap state machine. Acquisition is all-or-nothing
///   and in a fixed order, so writers never deadlock; a writer that loses a
///   reservation race backs off and retries.
/// * [`AaTree::read`] and [`AaTree::contains`] are lock-free: they never
///   reserve nodes and never block writers. A successful lookup is returned
///   as-is; an unsuccessful descent is accepted only if no structural change
///   overlapped it, so a key that stays in the tree is never reported
///   absent.
///
/// ## Ordering and ownership
///
/// The tree does not require `T: Ord`; it is ordered by the comparator
/// supplied to [`AaTree::new`], which compares a probe key against a stored
/// entry. The release callback is invoked exactly once for every entry that
/// leaves the tree, at the moment it is detached; the entry's memory is
/// reclaimed afterwards, once no thread can still be reading it. The
/// comparator and the release callback must not panic.
pub struct AaTree<K, T>
where
    K: 'static,
    T: 'static,
{
    arena: Arena<T>,
    root: AtomicU32,
    num_entries: AtomicUsize,
    /// Completed structural changes.
    mutations: AtomicU64,
    /// Structural changes in flight.
    writers: AtomicUsize,
    compare: Box<dyn Fn(&K, &T) -> Ordering + Send + Sync>,
    release: Box<dyn Fn(&T) + Send + Sync>,
}

impl<K, T> AaTree<K, T>
where
    K: 'static,
    T: 'static,
{
    /// Creates an empty [`AaTree`] ordered by `compare`.
    ///
    /// `release` is invoked exactly once for every entry that leaves the
    /// tree, whether through [`AaTree::remove`], [`AaTree::clear`], or drop.
    ///
    /// # Examples
    ///
    /// ```
    /// use aatree::AaTree;
    ///
    /// let tree: AaTree<u64, u64> = AaTree::new(|key: &u64, entry: &u64| key.cmp(entry), |_| ());
    /// assert!(tree.is_empty());
    /// ```
    #[inline]
    pub fn new<C, R>(compare: C, release: R) -> Self
    where
        C: Fn(&K, &T) -> Ordering + Send + Sync + 'static,
        R: Fn(&T) + Send + Sync + 'static,
    {
        Self {
            arena: Arena::new(),
            root: AtomicU32::new(NIL),
            num_entries: AtomicUsize::new(0),
            mutations: AtomicU64::new(0),
            writers: AtomicUsize::new(0),
            compare: Box::new(compare),
            release: Box::new(release),
        }
    }

    /// Inserts an entry.
    ///
    /// Returns the value if an entry comparing equal to `key` is already
    /// present; the value never enters the tree in that case.
    ///
    /// # Examples
    ///
    /// ```
    /// use aatree::AaTree;
    ///
    /// let tree: AaTree<u64, u64> = AaTree::new(|key: &u64, entry: &u64| key.cmp(entry), |_| ());
    ///
    /// assert!(tree.insert(&11, 11).is_ok());
    /// assert_eq!(tree.insert(&11, 17), Err(17));
    /// assert_eq!(tree.len(), 1);
    /// ```
    #[inline]
    pub fn insert(&self, key: &K, value: T) -> Result<(), T> {
        let guard = Guard::new();
        let pending = self.arena.allocate(Entry::new(value));
        let mut backoff = Backoff::new();
        loop {
            let root = self.root.load(Acquire);
            if root == NIL {
                if self
                    .root
                    .compare_exchange(NIL, pending, AcqRel, Acquire)
                    .is_ok()
                {
                    self.num_entries.fetch_add(1, Relaxed);
                    self.arena.slot(pending).set_state(NodeState::Idle);
                    return Ok(());
                }
                backoff.snooze();
                continue;
            }
            match self.insert_sub(root, key, pending, &guard) {
                Ok(()) => return Ok(()),
                Err(InsertError::Duplicate) => {
                    let ptr = self.arena.slot(pending).entry().load(Acquire, &guard);
                    let Some(entry) = ptr.as_ref() else {
                        unreachable!("unpublished slot lost its entry");
                    };
                    // The pending slot was never linked into the tree, so
                    // the entry is still exclusively ours.
                    let value = unsafe { entry.take() };
                    self.arena.recycle(pending);
                    return Err(value);
                }
                Err(InsertError::Retry) => backoff.snooze(),
            }
        }
    }

    /// Removes the entry comparing equal to `key`.
    ///
    /// Returns `true` if an entry was removed; the release callback has been
    /// invoked on it by the time this method returns.
    ///
    /// # Examples
    ///
    /// ```
    /// use aatree::AaTree;
    ///
    /// let tree: AaTree<u64, u64> = AaTree::new(|key: &u64, entry: &u64| key.cmp(entry), |_| ());
    ///
    /// assert!(tree.insert(&11, 11).is_ok());
    /// assert!(tree.remove(&11));
    /// assert!(!tree.remove(&11));
    /// ```
    #[inline]
    pub fn remove(&self, key: &K) -> bool {
        let guard = Guard::new();
        let mut backoff = Backoff::new();
        loop {
            let snapshot = self.mutations.load(Acquire);
            let root = self.root.load(Acquire);
            let verdict = if root == NIL {
                Ok(false)
            } else {
                self.remove_sub(root, key, &guard)
            };
            match verdict {
                Ok(true) => return true,
                Ok(false) => {
                    // A structural change may have routed the descent past
                    // the entry; accept the verdict only for a quiet window.
                    if self.writers.load(Acquire) == 0 && self.mutations.load(Acquire) == snapshot
                    {
                        return false;
                    }
                    backoff.snooze();
                }
                Err(RemoveError::Retry) => backoff.snooze(),
            }
        }
    }

    /// Reads the entry comparing equal to `key`.
    ///
    /// Returns the closure's result, or `None` if no entry matched. The
    /// reference handed to the closure stays valid for the duration of the
    /// call even if the entry is concurrently removed.
    ///
    /// # Examples
    ///
    /// ```
    /// use aatree::AaTree;
    ///
    /// let tree: AaTree<u64, u64> = AaTree::new(|key: &u64, entry: &u64| key.cmp(entry), |_| ());
    ///
    /// assert!(tree.insert(&11, 11).is_ok());
    /// assert_eq!(tree.read(&11, |entry| *entry + 6), Some(17));
    /// assert_eq!(tree.read(&12, |entry| *entry), None);
    /// ```
    #[inline]
    pub fn read<R, F: FnOnce(&T) -> R>(&self, key: &K, reader: F) -> Option<R> {
        let guard = Guard::new();
        let mut backoff = Backoff::new();
        let found = loop {
            match self.search_sub(key, &guard) {
                Ok(found) => break found,
                Err(SearchError::Retry) => backoff.snooze(),
            }
        };
        found.map(reader)
    }

    /// Returns `true` if an entry comparing equal to `key` is present.
    ///
    /// # Examples
    ///
    /// ```
    /// use aatree::AaTree;
    ///
    /// let tree: AaTree<u64, u64> = AaTree::new(|key: &u64, entry: &u64| key.cmp(entry), |_| ());
    ///
    /// assert!(!tree.contains(&11));
    /// assert!(tree.insert(&11, 11).is_ok());
    /// assert!(tree.contains(&11));
    /// ```
    #[inline]
    pub fn contains(&self, key: &K) -> bool {
        self.read(key, |_| ()).is_some()
    }

    /// Visits every entry in the requested order.
    ///
    /// The traversal is read-only and does not reserve nodes; entries
    /// inserted or removed during the traversal may or may not be visited.
    ///
    /// # Examples
    ///
    /// ```
    /// use aatree::{AaTree, WalkOrder};
    ///
    /// let tree: AaTree<u64, u64> = AaTree::new(|key: &u64, entry: &u64| key.cmp(entry), |_| ());
    ///
    /// for v in [3, 1, 2] {
    ///     assert!(tree.insert(&v, v).is_ok());
    /// }
    ///
    /// let mut entries = Vec::new();
    /// tree.walk(WalkOrder::InOrder, |entry| entries.push(*entry));
    /// assert_eq!(entries, [1, 2, 3]);
    /// ```
    #[inline]
    pub fn walk<F: FnMut(&T)>(&self, order: WalkOrder, mut visitor: F) {
        let guard = Guard::new();
        self.walk_sub(self.root.load(Acquire), order, &mut visitor, &guard);
    }

    /// Removes every entry.
    ///
    /// The release callback is invoked exactly once per entry, children
    /// before parents. Exact only at quiescence: entries inserted while
    /// `clear` is running may survive.
    ///
    /// # Examples
    ///
    /// ```
    /// use aatree::AaTree;
    ///
    /// let tree: AaTree<u64, u64> = AaTree::new(|key: &u64, entry: &u64| key.cmp(entry), |_| ());
    ///
    /// for v in 0..64 {
    ///     assert!(tree.insert(&v, v).is_ok());
    /// }
    /// tree.clear();
    /// assert!(tree.is_empty());
    /// ```
    #[inline]
    pub fn clear(&self) {
        let guard = Guard::new();
        let mut backoff = Backoff::new();
        // The old root is reserved before the handle is reset, so a
        // rebalance that proved itself topmost cannot publish a rotated
        // head into the empty handle afterwards.
        let root = loop {
            let root = self.root.load(Acquire);
            if root == NIL {
                return;
            }
            if self.arena.slot(root).claim(NodeState::Balancing) {
                if self.root.load(Acquire) == root {
                    break root;
                }
                self.arena.slot(root).set_state(NodeState::Idle);
            }
            backoff.snooze();
        };
        {
            let _shape = self.shape_guard();
            let detached = self.root.swap(NIL, AcqRel);
            debug_assert_eq!(detached, root);
        }
        self.teardown(root, &guard);
    }

    /// Returns the number of entries; exact only at quiescence.
    ///
    /// # Examples
    ///
    /// ```
    /// use aatree::AaTree;
    ///
    /// let tree: AaTree<u64, u64> = AaTree::new(|key: &u64, entry: &u64| key.cmp(entry), |_| ());
    ///
    /// assert!(tree.insert(&11, 11).is_ok());
    /// assert_eq!(tree.len(), 1);
    /// ```
    #[inline]
    pub fn len(&self) -> usize {
        self.num_entries.load(Acquire)
    }

    /// Returns `true` if the tree holds no entries.
    ///
    /// # Examples
    ///
    /// ```
    /// use aatree::AaTree;
    ///
    /// let tree: AaTree<u64, u64> = AaTree::new(|key: &u64, entry: &u64| key.cmp(entry), |_| ());
    /// assert!(tree.is_empty());
    /// ```
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the level of the root node: `0` for an empty tree, and at
    /// most the number of levels on any root-to-leaf path otherwise.
    ///
    /// # Examples
    ///
    /// ```
    /// use aatree::AaTree;
    ///
    /// let tree: AaTree<u64, u64> = AaTree::new(|key: &u64, entry: &u64| key.cmp(entry), |_| ());
    ///
    /// assert_eq!(tree.depth(), 0);
    /// assert!(tree.insert(&11, 11).is_ok());
    /// assert_eq!(tree.depth(), 1);
    /// ```
    #[inline]
    pub fn depth(&self) -> usize {
        self.arena.slot(self.root.load(Acquire)).level() as usize
    }

    /// Checks every structural rule of the tree: level relations, the
    /// single-right-link-per-level rule, parent back-links, in-order
    /// ordering under `pair_compare`, and the entry count.
    ///
    /// Meaningful only at quiescence; a concurrent mutation can legally
    /// leave a transient state that this method reports as a defect.
    ///
    /// # Examples
    ///
    /// ```
    /// use aatree::AaTree;
    ///
    /// let tree: AaTree<u64, u64> = AaTree::new(|key: &u64, entry: &u64| key.cmp(entry), |_| ());
    ///
    /// for v in 0..256 {
    ///     assert!(tree.insert(&v, v).is_ok());
    /// }
    /// assert!(tree.validate(|a, b| a.cmp(b)).is_ok());
    /// ```
    #[inline]
    pub fn validate<C: FnMut(&T, &T) -> Ordering>(
        &self,
        mut pair_compare: C,
    ) -> Result<(), IntegrityError> {
        let guard = Guard::new();
        let root = self.root.load(Acquire);
        if root != NIL && self.arena.slot(root).parent() != NIL {
            return Err(IntegrityError::DanglingParent);
        }
        let mut count = 0;
        self.validate_sub(root, &mut count, &guard)?;
        let mut previous = None;
        self.in_order_check(root, &mut pair_compare, &mut previous, &guard)?;
        let recorded = self.num_entries.load(Acquire);
        if recorded != count {
            return Err(IntegrityError::CountMismatch {
                recorded,
                actual: count,
            });
        }
        Ok(())
    }

    /// Descends towards the landing edge for `pending`, attaching it there
    /// and rebalancing every node on the way back up.
    fn insert_sub(
        &self,
        current: u32,
        key: &K,
        pending: u32,
        guard: &Guard,
    ) -> Result<(), InsertError> {
        let sc = self.arena.slot(current);
        let Some(entry) = sc.entry().load(Acquire, guard).as_ref() else {
            return Err(InsertError::Retry);
        };
        match (self.compare)(key, entry.get()) {
            Ordering::Equal => return Err(InsertError::Duplicate),
            Ordering::Less => {
                let child = sc.left();
                if child == NIL {
                    self.attach(current, Side::Left, key, pending, guard)?;
                } else {
                    self.insert_sub(child, key, pending, guard)?;
                }
            }
            Ordering::Greater => {
                let child = sc.right();
                if child == NIL {
                    self.attach(current, Side::Right, key, pending, guard)?;
                } else {
                    self.insert_sub(child, key, pending, guard)?;
                }
            }
        }
        self.rebalance_on_insert(current);
        Ok(())
    }

    /// Publishes `pending` as a leaf under `parent`.
    ///
    /// The parent is reserved in the inserting state, and both the routing
    /// decision and the landing edge are re-checked under the reservation:
    /// the parent's entry may have been exchanged and the edge may have
    /// gained a child since the descent read them. Either way the insert
    /// restarts from the top.
    fn attach(
        &self,
        parent: u32,
        side: Side,
        key: &K,
        pending: u32,
        guard: &Guard,
    ) -> Result<(), InsertError> {
        let sp = self.arena.slot(parent);
        if !sp.claim(NodeState::Inserting) {
            return Err(InsertError::Retry);
        }
        let Some(entry) = sp.entry().load(Acquire, guard).as_ref() else {
            sp.set_state(NodeState::Idle);
            return Err(InsertError::Retry);
        };
        let routed = match (self.compare)(key, entry.get()) {
            Ordering::Less => Side::Left,
            Ordering::Greater => Side::Right,
            Ordering::Equal => {
                sp.set_state(NodeState::Idle);
                return Err(InsertError::Duplicate);
            }
        };
        let edge = match side {
            Side::Left => sp.left(),
            Side::Right => sp.right(),
        };
        if routed != side || edge != NIL {
            sp.set_state(NodeState::Idle);
            return Err(InsertError::Retry);
        }
        let sn = self.arena.slot(pending);
        sn.set_parent(parent);
        match side {
            Side::Left => sp.set_left(pending),
            Side::Right => sp.set_right(pending),
        }
        self.num_entries.fetch_add(1, Relaxed);
        sn.set_state(NodeState::Idle);
        sp.set_state(NodeState::Idle);
        Ok(())
    }

    /// Descends towards `key`, detaching the matching node and rebalancing
    /// every node on the way back up.
    fn remove_sub(&self, current: u32, key: &K, guard: &Guard) -> Result<bool, RemoveError> {
        if current == NIL {
            return Ok(false);
        }
        let sc = self.arena.slot(current);
        let Some(entry) = sc.entry().load(Acquire, guard).as_ref() else {
            return Err(RemoveError::Retry);
        };
        let (found, target) = match (self.compare)(key, entry.get()) {
            Ordering::Less => (self.remove_sub(sc.left(), key, guard)?, current),
            Ordering::Greater => (self.remove_sub(sc.right(), key, guard)?, current),
            Ordering::Equal => (true, self.detach(current, key, guard)?),
        };
        self.rebalance_on_remove(target);
        Ok(found)
    }

    /// Unlinks the matched node.
    ///
    /// A node with at most one child is spliced out and retired. A node
    /// with two children keeps its position: the in-order successor is
    /// unlinked instead and its entry moves over, then the successor's
    /// former ancestors are rebalanced bottom-up. Returns the handle now
    /// occupying the matched position, or the sentinel if the position
    /// disappeared.
    fn detach(&self, x: u32, key: &K, guard: &Guard) -> Result<u32, RemoveError> {
        let mut backoff = Backoff::new();
        let claims = loop {
            if self.arena.slot(x).state() == NodeState::Retired {
                return Err(RemoveError::Retry);
            }
            if let Some(claims) = self.try_acquire_remove(x) {
                break claims;
            }
            backoff.snooze();
        };
        let sx = self.arena.slot(x);
        let mut held = HeldClaims::new(self, claims);
        // The node may have been given another entry between the descent
        // and the reservation.
        let matched = sx
            .entry()
            .load(Acquire, guard)
            .as_ref()
            .is_some_and(|entry| (self.compare)(key, entry.get()) == Ordering::Equal);
        if !matched {
            return Err(RemoveError::Retry);
        }
        let l = sx.left();
        let r = sx.right();
        if l == NIL || r == NIL {
            let replacement = if l == NIL { r } else { l };
            let p = sx.parent();
            {
                let _shape = self.shape_guard();
                if replacement != NIL {
                    self.arena.slot(replacement).set_parent(p);
                }
                self.relink(p, x, replacement);
            }
            if let Some(entry) = sx.entry().load(Acquire, guard).as_ref() {
                (self.release)(entry.get());
            }
            self.num_entries.fetch_sub(1, Relaxed);
            held.release_retiring(x);
            self.arena.retire(x);
            return Ok(replacement);
        }
        // Two children: reserve the leftmost node of the right subtree,
        // its parent, and its right child. Deep links can move between the
        // walk and the reservation, so the attempt is re-verified and
        // bounded; nothing has been written yet when it gives up, so the
        // unwind is complete.
        let mut path = [NIL; SUCCESSOR_PATH_CAP];
        let mut path_len;
        let mut attempts = 0;
        let (successor, successor_parent) = loop {
            attempts += 1;
            if attempts > STEAL_ATTEMPTS {
                return Err(RemoveError::Retry);
            }
            path_len = 0;
            let mut s = r;
            let mut overrun = false;
            loop {
                let next = self.arena.slot(s).left();
                if next == NIL {
                    break;
                }
                if path_len == SUCCESSOR_PATH_CAP {
                    // Longer than any coherent left spine: stale links.
                    overrun = true;
                    break;
                }
                path[path_len] = s;
                path_len += 1;
                s = next;
            }
            if overrun {
                backoff.snooze();
                continue;
            }
            let s_parent = if path_len == 0 { x } else { path[path_len - 1] };
            let mut reserved = self
                .try_claim_layered(&held.primary, &mut held.steal, s_parent, NodeState::Balancing)
                && self.try_claim_layered(&held.primary, &mut held.steal, s, NodeState::Balancing);
            if reserved {
                let s_right = self.arena.slot(s).right();
                reserved =
                    self.try_claim_layered(&held.primary, &mut held.steal, s_right, NodeState::Balancing);
            }
            let verified = reserved
                && self.arena.slot(s).left() == NIL
                && if s_parent == x {
                    sx.right() == s
                } else {
                    self.arena.slot(s_parent).left() == s
                };
            if verified {
                break (s, s_parent);
            }
            self.release_claims_from(&mut held.steal, 0);
            backoff.snooze();
        };
        {
            let _shape = self.shape_guard();
            let ss = self.arena.slot(successor);
            let s_right = ss.right();
            if successor_parent == x {
                sx.set_right(s_right);
            } else {
                self.arena.slot(successor_parent).set_left(s_right);
            }
            if s_right != NIL {
                self.arena.slot(s_right).set_parent(successor_parent);
            }
            let moved = ss.entry().get_shared(Acquire, guard);
            let (old, _) = sx.entry().swap((moved, Tag::None), AcqRel);
            if let Some(old) = old.as_ref() {
                (self.release)(old.get());
            }
            self.num_entries.fetch_sub(1, Relaxed);
        }
        held.release_retiring(successor);
        self.arena.retire(successor);
        // The successor's former ancestors lost a node below them.
        for &ancestor in path[..path_len].iter().rev() {
            self.rebalance_on_remove(ancestor);
        }
        Ok(x)
    }

    /// Lock-free descent; a not-found verdict is only accepted if no
    /// structural change overlapped it.
    fn search_sub<'g>(&self, key: &K, guard: &'g Guard) -> Result<Option<&'g T>, SearchError> {
        let snapshot = self.mutations.load(Acquire);
        let mut current = self.root.load(Acquire);
        while current != NIL {
            let slot = self.arena.slot(current);
            let Some(entry) = slot.entry().load(Acquire, guard).as_ref() else {
                return Err(SearchError::Retry);
            };
            match (self.compare)(key, entry.get()) {
                Ordering::Equal => return Ok(Some(entry.get())),
                Ordering::Less => current = slot.left(),
                Ordering::Greater => current = slot.right(),
            }
        }
        if self.writers.load(Acquire) == 0 && self.mutations.load(Acquire) == snapshot {
            Ok(None)
        } else {
            Err(SearchError::Retry)
        }
    }

    fn walk_sub(&self, current: u32, order: WalkOrder, visitor: &mut dyn FnMut(&T), guard: &Guard) {
        if current == NIL {
            return;
        }
        let slot = self.arena.slot(current);
        let (left, right) = (slot.left(), slot.right());
        match order {
            WalkOrder::PreOrder => {
                self.visit(current, visitor, guard);
                self.walk_sub(left, order, visitor, guard);
                self.walk_sub(right, order, visitor, guard);
            }
            WalkOrder::InOrder => {
                self.walk_sub(left, order, visitor, guard);
                self.visit(current, visitor, guard);
                self.walk_sub(right, order, visitor, guard);
            }
            WalkOrder::PostOrder => {
                self.walk_sub(left, order, visitor, guard);
                self.walk_sub(right, order, visitor, guard);
                self.visit(current, visitor, guard);
            }
        }
    }

    fn visit(&self, current: u32, visitor: &mut dyn FnMut(&T), guard: &Guard) {
        if let Some(entry) = self.arena.slot(current).entry().load(Acquire, guard).as_ref() {
            visitor(entry.get());
        }
    }

    /// Tears down a detached subtree rooted at a node this thread has
    /// already reserved.
    ///
    /// Every node is reserved before its links are read, so writers that
    /// still hold nodes of the subtree drain out first instead of finding
    /// their reservations retired underneath them. Release callbacks fire
    /// children before parents.
    fn teardown(&self, current: u32, guard: &Guard) {
        let slot = self.arena.slot(current);
        for child in [slot.left(), slot.right()] {
            if child != NIL {
                let cs = self.arena.slot(child);
                let mut backoff = Backoff::new();
                while !cs.claim(NodeState::Balancing) {
                    backoff.snooze();
                }
                self.teardown(child, guard);
            }
        }
        if let Some(entry) = slot.entry().load(Acquire, guard).as_ref() {
            (self.release)(entry.get());
        }
        slot.set_state(NodeState::Retired);
        self.num_entries.fetch_sub(1, Relaxed);
        self.arena.retire(current);
    }

    fn validate_sub(
        &self,
        current: u32,
        count: &mut usize,
        guard: &Guard,
    ) -> Result<(), IntegrityError> {
        if current == NIL {
            return Ok(());
        }
        *count += 1;
        let slot = self.arena.slot(current);
        let left = slot.left();
        let right = slot.right();
        let level = slot.level();
        if left == current || right == current || slot.parent() == current {
            return Err(IntegrityError::SelfReference);
        }
        let left_level = self.arena.slot(left).level();
        if left_level + 1 != level {
            return Err(IntegrityError::LeftLevel { level, left_level });
        }
        let right_level = self.arena.slot(right).level();
        if right_level != level && right_level + 1 != level {
            return Err(IntegrityError::RightLevel { level, right_level });
        }
        if right != NIL {
            let right_right = self.arena.slot(right).right();
            if right_right != NIL && self.arena.slot(right_right).level() == level {
                return Err(IntegrityError::DoubleRightLink);
            }
        }
        if slot.entry().load(Acquire, guard).as_ref().is_none() {
            return Err(IntegrityError::MissingEntry);
        }
        for child in [left, right] {
            if child != NIL && self.arena.slot(child).parent() != current {
                return Err(IntegrityError::DanglingParent);
            }
        }
        self.validate_sub(left, count, guard)?;
        self.validate_sub(right, count, guard)
    }

    fn in_order_check<'g, C: FnMut(&T, &T) -> Ordering>(
        &self,
        current: u32,
        pair_compare: &mut C,
        previous: &mut Option<&'g T>,
        guard: &'g Guard,
    ) -> Result<(), IntegrityError> {
        if current == NIL {
            return Ok(());
        }
        let slot = self.arena.slot(current);
        self.in_order_check(slot.left(), pair_compare, previous, guard)?;
        let Some(entry) = slot.entry().load(Acquire, guard).as_ref() else {
            return Err(IntegrityError::MissingEntry);
        };
        if let Some(previous) = *previous {
            if pair_compare(previous, entry.get()) != Ordering::Less {
                return Err(IntegrityError::OrderViolation);
            }
        }
        *previous = Some(entry.get());
        self.in_order_check(slot.right(), pair_compare, previous, guard)
    }
}

impl<K, T> Debug for AaTree<K, T>
where
    K: 'static,
    T: 'static,
{
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AaTree")
            .field("len", &self.len())
            .field("depth", &self.depth())
            .finish_non_exhaustive()
    }
}

impl<K, T> Drop for AaTree<K, T>
where
    K: 'static,
    T: 'static,
{
    #[inline]
    fn drop(&mut self) {
        self.clear();
    }
}
