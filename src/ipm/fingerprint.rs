//! `PatternFingerprint`, the key the Adaptive Constraint Store uses to
//! correlate a soft constraint with the grammar slot it was learned at
//! (`spec.md` §4.6). Derived from a [`super::ParserState`]'s frontier rather
//! than from raw byte history, so two unrelated decodes that happen to reach
//! "the same place in the same grammar" share learned weight.
use crate::grammar::Grammar;

use super::ParserState;

/// A content hash over the set of terminal classes a [`super::ParserState`]'s
/// (already epsilon-closed) frontier is currently waiting on. Two states
/// with the same fingerprint are not necessarily derivationally identical,
/// but are "the same kind of place" for the purpose of soft-constraint
/// lookup — the frontier only ever holds terminal-matching threads, so this
/// is the cheapest stable proxy for "grammar position" available post-closure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PatternFingerprint(u64);

impl PatternFingerprint {
    pub(crate) fn of(state: &ParserState, _grammar: &Grammar) -> Self {
        let mut classes: Vec<u64> = state
            .frontier
            .iter()
            .map(super::Thread::terminal_class_tag)
            .collect();
        classes.sort_unstable();
        classes.dedup();
        let mut bytes = Vec::with_capacity(classes.len() * 8 + 1);
        bytes.push(state.can_accept as u8);
        for tag in classes {
            bytes.extend_from_slice(&tag.to_le_bytes());
        }
        Self(crate::utils::content_hash(&bytes))
    }
}
