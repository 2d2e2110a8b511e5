//! The grammar module that stores the compiled grammar in HIR (high-level
//! intermediate representation) form: an arena of rules, each a set of
//! alternatives over terminal/regex/nonterminal symbols.
//!
//! This mirrors the teacher's `grammar.rs` in spirit (`TerminalID`,
//! `NonterminalID`, `RegexID`, `HIRNode`, an arena indexed by small integer
//! ids) but drops its six-type-parameter, bit-width-selected generics in
//! favor of a single `u32` index type — the redesign note in `spec.md` §9
//! asks for "an arena of rule nodes, edges are indices", not for the
//! teacher's specific memory-packing scheme.
use ahash::AHashMap;
use kbnf_regex_automata::dfa::{dense, Automaton};
use kbnf_regex_automata::util::primitives::StateID;
use string_interner::{backend::StringBackend, StringInterner, Symbol};

use crate::utils::ByteSet;

/// An interned identifier for a nonterminal (a lowercase rule name).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NonterminalID(pub u32);

/// An interned identifier for a terminal (an inline literal string).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TerminalID(pub u32);

/// An interned identifier for a named, regex-backed terminal class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegexID(pub u32);

/// One symbol on the right-hand side of a production.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HIRNode {
    /// A literal string terminal.
    Terminal(TerminalID),
    /// A named, regex-backed terminal class.
    RegexString(RegexID),
    /// A reference to another rule.
    Nonterminal(NonterminalID),
}

/// One alternative (concatenation of symbols) for a nonterminal.
pub type Alternative = Vec<HIRNode>;

/// The compiled grammar: an arena of rules plus the terminal DFA table.
///
/// `rules[nt.0 as usize]` gives the alternatives for nonterminal `nt`; each
/// alternative is a concatenation of symbols. Grouping, `?`, `*`, and
/// bounded repetition are desugared into additional synthetic nonterminals
/// before this structure is built (see `grammar::dialect::lower`), so by the
/// time a `Grammar` exists, it is pure BNF.
#[derive(Clone)]
pub struct Grammar {
    pub(crate) start: NonterminalID,
    pub(crate) rules: Vec<Vec<Alternative>>,
    pub(crate) nonterminal_names: StringInterner<StringBackend>,
    pub(crate) terminal_bytes: Vec<Box<[u8]>>,
    pub(crate) regex_names: Vec<String>,
    pub(crate) regex_dfas: Vec<dense::DFA<Vec<u32>>>,
    /// For each (regex id, dfa state), the set of bytes that keep the DFA
    /// alive (accepting or in-progress) — precomputed per `spec.md` §4.1
    /// step 4 ("tokenizer alignment"), consulted on the IPM hot path.
    pub(crate) regex_first_bytes: AHashMap<(u32, StateID), ByteSet>,
}

#[derive(Debug, thiserror::Error)]
/// Errors while assembling the HIR from a lowered AST.
pub enum BuildError {
    /// The start nonterminal was never defined.
    #[error("start rule `{0}` is never defined")]
    UndefinedStart(String),
    /// A rule references a nonterminal that is never defined.
    #[error("rule `{0}` is never defined but is referenced")]
    UndefinedNonterminal(String),
    /// A named terminal is never defined.
    #[error("terminal `{0}` is never defined but is referenced")]
    UndefinedTerminal(String),
    /// A DFA failed to build from the minimized regex IR.
    #[error("regex compile error: {0}")]
    Regex(#[from] kbnf_regex_automata::dfa::dense::BuildError),
}

impl Grammar {
    #[inline]
    pub fn start(&self) -> NonterminalID {
        self.start
    }

    #[inline]
    pub fn alternatives(&self, nt: NonterminalID) -> &[Alternative] {
        &self.rules[nt.0 as usize]
    }

    #[inline]
    pub fn nonterminal_count(&self) -> usize {
        self.rules.len()
    }

    #[inline]
    pub fn nonterminal_name(&self, nt: NonterminalID) -> &str {
        self.nonterminal_names
            .resolve(string_interner::symbol::SymbolU32::try_from_usize(nt.0 as usize).unwrap())
            .unwrap()
    }

    #[inline]
    pub fn terminal_bytes(&self, id: TerminalID) -> &[u8] {
        &self.terminal_bytes[id.0 as usize]
    }

    #[inline]
    pub fn regex_dfa(&self, id: RegexID) -> &dense::DFA<Vec<u32>> {
        &self.regex_dfas[id.0 as usize]
    }

    #[inline]
    pub fn regex_name(&self, id: RegexID) -> &str {
        &self.regex_names[id.0 as usize]
    }

    pub(crate) fn first_bytes_for_regex_state(&self, id: RegexID, state: StateID) -> &ByteSet {
        static EMPTY: std::sync::OnceLock<ByteSet> = std::sync::OnceLock::new();
        self.regex_first_bytes
            .get(&(id.0, state))
            .unwrap_or_else(|| EMPTY.get_or_init(|| ByteSet::with_capacity(256)))
    }
}
