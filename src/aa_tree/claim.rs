use std::hint;
use std::sync::atomic::Ordering::{AcqRel, Acquire, Release};
use std::sync::atomic::{AtomicU64, AtomicUsize};
use std::thread;

use super::node::{NodeState, NIL};
use super::AaTree;

/// Upper bound on the number of nodes reserved by one acquisition batch.
pub(super) const MAX_CLAIMS: usize = 10;

/// The set of nodes reserved by one acquisition batch.
///
/// Acquisition is all-or-nothing: the moment a single reservation fails, the
/// whole set is released and the operation backs off, so two operations can
/// never hold partial, mutually blocking sets.
pub(super) struct Claims {
    ids: [u32; MAX_CLAIMS],
    len: usize,
}

impl Claims {
    pub(super) fn new() -> Self {
        Self {
            ids: [NIL; MAX_CLAIMS],
            len: 0,
        }
    }

    fn push(&mut self, id: u32) {
        debug_assert!(self.len < MAX_CLAIMS);
        self.ids[self.len] = id;
        self.len += 1;
    }

    fn holds(&self, id: u32) -> bool {
        self.ids[..self.len].contains(&id)
    }

    pub(super) fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.ids[..self.len].iter().copied()
    }
}

/// Bounded exponential backoff: short spins first, yields afterwards.
pub(super) struct Backoff {
    attempt: u32,
}

impl Backoff {
    const SPIN_LIMIT: u32 = 6;

    pub(super) fn new() -> Self {
        Self { attempt: 0 }
    }

    pub(super) fn snooze(&mut self) {
        if self.attempt < Self::SPIN_LIMIT {
            for _ in 0..(1_u32 << self.attempt) {
                hint::spin_loop();
            }
            self.attempt += 1;
        } else {
            thread::yield_now();
        }
    }
}

/// Claim sets held by a removal, released on every exit path.
///
/// The primary set is the remove fix-up neighborhood of the matched node;
/// the steal set layers the successor reservation on top of it. Dropping
/// the guard releases both, so an early return or a panic in a user
/// callback cannot leak a reservation.
pub(super) struct HeldClaims<'t, K: 'static, T: 'static> {
    tree: &'t AaTree<K, T>,
    pub(super) primary: Claims,
    pub(super) steal: Claims,
    armed: bool,
}

impl<'t, K: 'static, T: 'static> HeldClaims<'t, K, T> {
    pub(super) fn new(tree: &'t AaTree<K, T>, primary: Claims) -> Self {
        Self {
            tree,
            primary,
            steal: Claims::new(),
            armed: true,
        }
    }

    /// Releases both sets, moving `retired` into the terminal state.
    pub(super) fn release_retiring(&mut self, retired: u32) {
        self.armed = false;
        self.tree.release_claims_retiring(&self.primary, retired);
        self.tree.release_claims_retiring(&self.steal, retired);
    }
}

impl<K: 'static, T: 'static> Drop for HeldClaims<'_, K, T> {
    fn drop(&mut self) {
        if self.armed {
            self.tree.release_claims(&self.primary);
            self.tree.release_claims(&self.steal);
        }
    }
}

/// Marks a structural change in flight while alive, and records its
/// completion on drop; not-found search verdicts validate against both.
pub(super) struct ShapeGuard<'t> {
    writers: &'t AtomicUsize,
    mutations: &'t AtomicU64,
}

impl<'t> ShapeGuard<'t> {
    pub(super) fn new(writers: &'t AtomicUsize, mutations: &'t AtomicU64) -> Self {
        writers.fetch_add(1, AcqRel);
        Self { writers, mutations }
    }
}

impl Drop for ShapeGuard<'_> {
    fn drop(&mut self) {
        self.mutations.fetch_add(1, Release);
        self.writers.fetch_sub(1, Release);
    }
}

impl<K: 'static, T: 'static> AaTree<K, T> {
    pub(super) fn shape_guard(&self) -> ShapeGuard<'_> {
        ShapeGuard::new(&self.writers, &self.mutations)
    }

    /// Tries to add `id` to the claim set.
    ///
    /// The sentinel and already-held nodes count as claimed; nothing is
    /// pushed for them, so a later partial release stays balanced.
    pub(super) fn try_claim(&self, claims: &mut Claims, id: u32, state: NodeState) -> bool {
        if id == NIL || claims.holds(id) {
            return true;
        }
        if self.arena.slot(id).claim(state) {
            claims.push(id);
            true
        } else {
            false
        }
    }

    /// Variant of [`Self::try_claim`] for a second claim set layered on top
    /// of an already-acquired one.
    pub(super) fn try_claim_layered(
        &self,
        held: &Claims,
        claims: &mut Claims,
        id: u32,
        state: NodeState,
    ) -> bool {
        if held.holds(id) {
            return true;
        }
        self.try_claim(claims, id, state)
    }

    fn try_claim_all(&self, claims: &mut Claims, ids: &[u32]) -> bool {
        ids.iter()
            .all(|&id| self.try_claim(claims, id, NodeState::Balancing))
    }

    /// Claims the parent and checks that it still links down to `x`; a
    /// sentinel parent is checked against the root handle instead. The
    /// parent link is only a hint, so a failed check means the tree moved
    /// and the caller must release and retry.
    fn claim_parent(&self, claims: &mut Claims, x: u32, p: u32) -> bool {
        if !self.try_claim(claims, p, NodeState::Balancing) {
            return false;
        }
        if p == NIL {
            self.root.load(Acquire) == x
        } else {
            let sp = self.arena.slot(p);
            sp.left() == x || sp.right() == x
        }
    }

    /// Claims the insert fix-up neighborhood of `x`: the node, its parent,
    /// its grandparent, and both children, in that order.
    pub(super) fn try_acquire_insert(&self, x: u32) -> Option<Claims> {
        let mut claims = Claims::new();
        if !self.try_claim(&mut claims, x, NodeState::Balancing) {
            return None;
        }
        let sx = self.arena.slot(x);
        let p = sx.parent();
        if !self.claim_parent(&mut claims, x, p) {
            self.release_claims(&claims);
            return None;
        }
        let gp = self.arena.slot(p).parent();
        if !self.try_claim_all(&mut claims, &[gp, sx.left(), sx.right()]) {
            self.release_claims(&claims);
            return None;
        }
        Some(claims)
    }

    /// Claims the remove fix-up neighborhood of `x`.
    ///
    /// The ten reserved positions are exactly the nodes the decrease-skew-
    /// split chain can write: the node, its parent, both children, and the
    /// descendants `left.right`, `right.left`, `right.right`,
    /// `left.right.right`, `right.left.right` and `right.right.right`.
    /// Each stage reads links only of nodes claimed in the previous stage,
    /// so every handle is stable by the time it is reserved.
    pub(super) fn try_acquire_remove(&self, x: u32) -> Option<Claims> {
        let mut claims = Claims::new();
        if !self.try_claim(&mut claims, x, NodeState::Balancing) {
            return None;
        }
        let sx = self.arena.slot(x);
        let p = sx.parent();
        if !self.claim_parent(&mut claims, x, p) {
            self.release_claims(&claims);
            return None;
        }
        let l = sx.left();
        let r = sx.right();
        if !self.try_claim_all(&mut claims, &[l, r]) {
            self.release_claims(&claims);
            return None;
        }
        let lr = self.arena.slot(l).right();
        let rl = self.arena.slot(r).left();
        let rr = self.arena.slot(r).right();
        if !self.try_claim_all(&mut claims, &[lr, rl, rr]) {
            self.release_claims(&claims);
            return None;
        }
        let lrr = self.arena.slot(lr).right();
        let rlr = self.arena.slot(rl).right();
        let rrr = self.arena.slot(rr).right();
        if !self.try_claim_all(&mut claims, &[lrr, rlr, rrr]) {
            self.release_claims(&claims);
            return None;
        }
        Some(claims)
    }

    pub(super) fn release_claims(&self, claims: &Claims) {
        for id in claims.iter() {
            self.arena.slot(id).set_state(NodeState::Idle);
        }
    }

    /// Releases the set, leaving `retired` in the terminal state.
    pub(super) fn release_claims_retiring(&self, claims: &Claims, retired: u32) {
        for id in claims.iter() {
            let state = if id == retired {
                NodeState::Retired
            } else {
                NodeState::Idle
            };
            self.arena.slot(id).set_state(state);
        }
    }

    /// Releases claims acquired after `mark`, keeping the first `mark`.
    pub(super) fn release_claims_from(&self, claims: &mut Claims, mark: usize) {
        for id in claims.ids[mark..claims.len].iter().copied() {
            self.arena.slot(id).set_state(NodeState::Idle);
        }
        claims.len = mark;
    }
}
