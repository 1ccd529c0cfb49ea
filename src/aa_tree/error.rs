use std::error::Error;
use std::fmt;
use std::fmt::Display;

/// Transient outcome of an insert descent.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(super) enum InsertError {
    /// The key is already present.
    Duplicate,
    /// A conflicting structural operation was encountered.
    Retry,
}

/// Transient outcome of a remove descent.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(super) enum RemoveError {
    /// A conflicting structural operation was encountered.
    Retry,
}

/// Transient outcome of a search descent.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(super) enum SearchError {
    /// A structural change overlapped the descent.
    Retry,
}

/// Structural defects reported by [`AaTree::validate`](super::AaTree::validate).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum IntegrityError {
    /// A node links to itself.
    SelfReference,
    /// A left child is not exactly one level below its parent.
    LeftLevel {
        /// Level of the parent.
        level: u32,
        /// Level of the left child.
        left_level: u32,
    },
    /// A right child is neither at its parent's level nor one below it.
    RightLevel {
        /// Level of the parent.
        level: u32,
        /// Level of the right child.
        right_level: u32,
    },
    /// A right grandchild shares its grandparent's level.
    DoubleRightLink,
    /// A node carries no payload.
    MissingEntry,
    /// A child does not point back at its parent.
    DanglingParent,
    /// In-order neighbors are out of order.
    OrderViolation,
    /// The recorded entry count disagrees with the tree contents.
    CountMismatch {
        /// Count maintained by insert and remove.
        recorded: usize,
        /// Number of nodes actually reachable from the root.
        actual: usize,
    },
}

impl Display for IntegrityError {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntegrityError::SelfReference => write!(f, "node links to itself"),
            IntegrityError::LeftLevel { level, left_level } => write!(
                f,
                "left child at level {left_level} under a node at level {level}"
            ),
            IntegrityError::RightLevel { level, right_level } => write!(
                f,
                "right child at level {right_level} under a node at level {level}"
            ),
            IntegrityError::DoubleRightLink => {
                write!(f, "two consecutive right links on the same level")
            }
            IntegrityError::MissingEntry => write!(f, "node carries no payload"),
            IntegrityError::DanglingParent => write!(f, "child does not point back at its parent"),
            IntegrityError::OrderViolation => write!(f, "in-order neighbors are out of order"),
            IntegrityError::CountMismatch { recorded, actual } => {
                write!(f, "recorded {recorded} entries, found {actual}")
            }
        }
    }
}

impl Error for IntegrityError {}
