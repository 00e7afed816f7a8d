//! Conflict resolution between local state and incoming oplog entries.
//!
//! A resolver is a pure function of `(local document or absent, remote entry)`.
//! Replaying the same log against the same resolver always produces the same
//! materialized state, whatever order peers delivered the entries in.

mod lww;
mod merge;

pub use lww::LastWriteWinsResolver;
pub use merge::RecursiveMergeResolver;

use crate::document::{Document, OplogEntry};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Outcome of resolving one remote entry.
///
/// When `should_apply` is false the entry is still recorded in the log but
/// does not change materialized state.
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictResolutionResult {
    /// Whether `merged_document` replaces the local state.
    pub should_apply: bool,
    /// The resulting document when applied.
    pub merged_document: Option<Document>,
}

impl ConflictResolutionResult {
    /// Applies the given document.
    pub fn apply(document: Document) -> Self {
        Self {
            should_apply: true,
            merged_document: Some(document),
        }
    }

    /// Keeps the local state.
    pub fn ignore() -> Self {
        Self {
            should_apply: false,
            merged_document: None,
        }
    }
}

/// Strategy deciding how a remote entry merges with local state.
pub trait ConflictResolver: Send + Sync {
    /// Resolves `remote` against the current local document.
    fn resolve(&self, local: Option<&Document>, remote: &OplogEntry) -> ConflictResolutionResult;
}

/// Built-in resolver selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResolverKind {
    /// Whole-document last write wins.
    #[default]
    LastWriteWins,
    /// Field-level recursive merge of JSON content.
    RecursiveMerge,
}

impl ResolverKind {
    /// Creates the resolver for this kind.
    pub fn build(&self) -> Arc<dyn ConflictResolver> {
        match self {
            ResolverKind::LastWriteWins => Arc::new(LastWriteWinsResolver),
            ResolverKind::RecursiveMerge => Arc::new(RecursiveMergeResolver),
        }
    }

    /// Converts to a code.
    pub fn to_code(&self) -> u8 {
        match self {
            ResolverKind::LastWriteWins => 1,
            ResolverKind::RecursiveMerge => 2,
        }
    }

    /// Converts from a code.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(ResolverKind::LastWriteWins),
            2 => Some(ResolverKind::RecursiveMerge),
            _ => None,
        }
    }
}

impl fmt::Display for ResolverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolverKind::LastWriteWins => f.write_str("lww"),
            ResolverKind::RecursiveMerge => f.write_str("merge"),
        }
    }
}

impl FromStr for ResolverKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "lww" | "last-write-wins" => Ok(ResolverKind::LastWriteWins),
            "merge" | "recursive-merge" => Ok(ResolverKind::RecursiveMerge),
            other => Err(format!("unknown conflict resolver: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolver_kind_codes() {
        for kind in [ResolverKind::LastWriteWins, ResolverKind::RecursiveMerge] {
            assert_eq!(ResolverKind::from_code(kind.to_code()), Some(kind));
        }
        assert_eq!(ResolverKind::from_code(0), None);
    }

    #[test]
    fn resolver_kind_parse() {
        assert_eq!("merge".parse(), Ok(ResolverKind::RecursiveMerge));
        assert_eq!("LWW".parse(), Ok(ResolverKind::LastWriteWins));
        assert!("manual".parse::<ResolverKind>().is_err());
        assert_eq!(ResolverKind::RecursiveMerge.to_string(), "merge");
    }

    #[test]
    fn ignore_has_no_document() {
        let result = ConflictResolutionResult::ignore();
        assert!(!result.should_apply);
        assert!(result.merged_document.is_none());
    }
}
