//! Concurrent self-balancing ordered containers.
//!
//! # [`AaTree`]
//! A concurrent [AA tree](https://en.wikipedia.org/wiki/AA_tree) ordered by a
//! user-supplied comparator: structural changes reserve a bounded node
//! neighborhood through per-node state machines, and reads are lock-free.

mod aa_tree;

pub use aa_tree::{AaTree, IntegrityError, WalkOrder};

#[cfg(feature = "serde")]
mod serde;

#[cfg(test)]
mod tests;
