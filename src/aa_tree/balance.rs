use std::sync::atomic::Ordering::Release;

use super::claim::Backoff;
use super::node::{NodeState, NIL};
use super::AaTree;

impl<K: 'static, T: 'static> AaTree<K, T> {
    /// Right rotation fixing a left link on the node's own level; identity
    /// when the rule already holds.
    ///
    /// The caller holds claims on every node the rotation writes; children
    /// that merely change position get their parent hints refreshed.
    pub(super) fn skew(&self, x: u32) -> u32 {
        if x == NIL {
            return x;
        }
        let sx = self.arena.slot(x);
        let l = sx.left();
        if l == NIL || self.arena.slot(l).level() != sx.level() {
            return x;
        }
        let sl = self.arena.slot(l);
        let carried = sl.right();
        sx.set_left(carried);
        if carried != NIL {
            self.arena.slot(carried).set_parent(x);
        }
        sl.set_parent(sx.parent());
        sl.set_right(x);
        sx.set_parent(l);
        l
    }

    /// Left rotation fixing two consecutive right links on one level; the
    /// new head gains a level.
    pub(super) fn split(&self, x: u32) -> u32 {
        if x == NIL {
            return x;
        }
        let sx = self.arena.slot(x);
        let r = sx.right();
        if r == NIL {
            return x;
        }
        let sr = self.arena.slot(r);
        if self.arena.slot(sr.right()).level() != sx.level() {
            return x;
        }
        let carried = sr.left();
        sx.set_right(carried);
        if carried != NIL {
            self.arena.slot(carried).set_parent(x);
        }
        sr.set_parent(sx.parent());
        sr.set_left(x);
        sx.set_parent(r);
        sr.set_level(sr.level() + 1);
        r
    }

    /// Redirects the claimed parent's child edge, or the root handle, from
    /// `from` to `to`.
    pub(super) fn relink(&self, parent: u32, from: u32, to: u32) {
        if parent == NIL {
            self.root.store(to, Release);
        } else {
            let sp = self.arena.slot(parent);
            if sp.left() == from {
                sp.set_left(to);
            } else {
                debug_assert_eq!(sp.right(), from);
                sp.set_right(to);
            }
        }
    }

    /// Restores the level rules at `x` after an insert below it, returning
    /// the head of the rebalanced position.
    ///
    /// Acquires the fix-up neighborhood first and re-checks the rules under
    /// the claims; a node that left the tree in the meantime is skipped.
    pub(super) fn rebalance_on_insert(&self, x: u32) -> u32 {
        let mut backoff = Backoff::new();
        loop {
            let sx = self.arena.slot(x);
            if sx.state() == NodeState::Retired {
                return x;
            }
            let Some(claims) = self.try_acquire_insert(x) else {
                backoff.snooze();
                continue;
            };
            let level = sx.level();
            let skew_due = self.arena.slot(sx.left()).level() == level;
            let split_due = {
                let r = self.arena.slot(sx.right());
                self.arena.slot(r.right()).level() == level
            };
            if !skew_due && !split_due {
                self.release_claims(&claims);
                return x;
            }
            let p = sx.parent();
            let head = {
                let _shape = self.shape_guard();
                let head = self.split(self.skew(x));
                if head != x {
                    self.relink(p, x, head);
                }
                head
            };
            self.release_claims(&claims);
            return head;
        }
    }

    /// Restores the level rules at `x` after a removal below it: drop the
    /// level if a child sits two levels down, cap the right child, then run
    /// the three-skew, two-split fix-up chain down the right spine.
    pub(super) fn rebalance_on_remove(&self, x: u32) -> u32 {
        if x == NIL {
            return x;
        }
        let mut backoff = Backoff::new();
        loop {
            let sx = self.arena.slot(x);
            if sx.state() == NodeState::Retired {
                return x;
            }
            let Some(claims) = self.try_acquire_remove(x) else {
                backoff.snooze();
                continue;
            };
            let level = sx.level();
            let l = sx.left();
            let r = sx.right();
            if self.arena.slot(l).level() + 1 >= level && self.arena.slot(r).level() + 1 >= level {
                self.release_claims(&claims);
                return x;
            }
            let p = sx.parent();
            let head = {
                let _shape = self.shape_guard();
                let level = level - 1;
                sx.set_level(level);
                if r != NIL && self.arena.slot(r).level() > level {
                    self.arena.slot(r).set_level(level);
                }
                let head = self.skew(x);
                let sh = self.arena.slot(head);
                let right = sh.right();
                let skewed = self.skew(right);
                if skewed != right {
                    sh.set_right(skewed);
                    self.arena.slot(skewed).set_parent(head);
                }
                let sr = self.arena.slot(skewed);
                let right = sr.right();
                let skewed_deep = self.skew(right);
                if skewed_deep != right {
                    sr.set_right(skewed_deep);
                    self.arena.slot(skewed_deep).set_parent(skewed);
                }
                let head = self.split(head);
                let sh = self.arena.slot(head);
                let right = sh.right();
                let splitted = self.split(right);
                if splitted != right {
                    sh.set_right(splitted);
                    self.arena.slot(splitted).set_parent(head);
                }
                if head != x {
                    self.relink(p, x, head);
                }
                head
            };
            self.release_claims(&claims);
            return head;
        }
    }
}
