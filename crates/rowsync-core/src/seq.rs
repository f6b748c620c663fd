//! Seq: a causal position within one database's change log.
//!
//! A `Seq` is `(db_version, local_seq)`. The version advances once per
//! committed transaction; `local_seq` numbers the changes inside that
//! transaction starting at 0. Positions from the same log are totally
//! ordered lexicographically, which is exactly the derived `Ord`.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A position in a database's change log.
///
/// Serializes as a two-element array `[db_version, local_seq]`.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Seq(pub u64, pub u32);

impl Seq {
    /// The position before any change. The first change of a log is at `(1, 0)`.
    pub const ZERO: Self = Self(0, 0);

    pub const fn new(db_version: u64, local_seq: u32) -> Self {
        Self(db_version, local_seq)
    }

    pub const fn db_version(&self) -> u64 {
        self.0
    }

    pub const fn local_seq(&self) -> u32 {
        self.1
    }

    /// The next position inside the same transaction.
    pub const fn next_in_version(&self) -> Self {
        Self(self.0, self.1.saturating_add(1))
    }

    /// The first position of the following transaction.
    pub const fn first_of_next_version(&self) -> Self {
        Self(self.0.saturating_add(1), 0)
    }

    /// Classify a batch start against the last position already applied.
    ///
    /// The receiver cannot know how many changes the last version held, so
    /// both `(v, s + 1)` and `(v + 1, 0)` are valid continuations of `(v, s)`.
    pub fn continuity(last_applied: Seq, start: Seq) -> Continuity {
        if start <= last_applied {
            Continuity::Retransmission
        } else if start == last_applied.next_in_version()
            || start == last_applied.first_of_next_version()
        {
            Continuity::Contiguous
        } else {
            Continuity::Gap
        }
    }
}

impl fmt::Debug for Seq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Seq({}, {})", self.0, self.1)
    }
}

impl fmt::Display for Seq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.0, self.1)
    }
}

impl From<(u64, u32)> for Seq {
    fn from((version, local): (u64, u32)) -> Self {
        Self(version, local)
    }
}

/// How a batch start relates to what a receiver has already applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Continuity {
    /// Starts exactly at a valid next position.
    Contiguous,
    /// Starts at or before the last applied position (a resend).
    Retransmission,
    /// One or more positions in between were never received.
    Gap,
}

impl Continuity {
    /// Whether a batch with this continuity may be applied.
    pub fn is_acceptable(&self) -> bool {
        !matches!(self, Continuity::Gap)
    }
}
