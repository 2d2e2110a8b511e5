//! [`Session`]: the public handle a caller drives one decode loop through —
//! binds a compiled grammar to a vocabulary and exposes `begin`/`mask`/
//! `advance` (`spec.md` §3, §4.2), mirroring the teacher's `Engine` as the
//! user-facing façade over the lower-level recognizer.
use std::sync::Arc;

use crate::grammar::{CompiledGrammar, Grammar};
use crate::vocabulary::Vocabulary;

use super::{AllowMask, ParserError, ParserState, PatternFingerprint, StateShape};

/// A bound incremental parser: one compiled grammar, one vocabulary, driven
/// one decode step at a time. `Clone` is cheap — the grammar and vocabulary
/// are `Arc`-shared; only the current [`ParserState`] is per-session.
#[derive(Clone)]
pub struct Session {
    grammar: Arc<CompiledGrammar>,
    vocabulary: Arc<Vocabulary>,
}

impl Session {
    pub fn new(grammar: Arc<CompiledGrammar>, vocabulary: Arc<Vocabulary>) -> Self {
        Self { grammar, vocabulary }
    }

    pub fn grammar(&self) -> &Grammar {
        self.grammar.hir()
    }

    pub fn vocabulary(&self) -> &Vocabulary {
        &self.vocabulary
    }

    /// A content-hash key identifying the compiled grammar bound to this
    /// session (`spec.md` §4.3) — used by the Decode Orchestrator to key
    /// the mask cache without reaching into `CompiledGrammar`'s internals.
    pub fn grammar_key(&self) -> u64 {
        self.grammar.source_hash()
    }

    /// Starts a new parse at the grammar's start rule.
    pub fn begin(&self) -> ParserState {
        super::begin(self.grammar.hir())
    }

    /// Computes the allow-mask for `state` (`spec.md` §4.2).
    pub fn mask(&self, state: &ParserState) -> AllowMask {
        super::mask(state, &self.vocabulary, self.grammar.hir())
    }

    /// Advances `state` by `token_id`'s bytes (`spec.md` §4.2).
    pub fn advance(&self, state: &ParserState, token_id: u32) -> Result<ParserState, ParserError> {
        super::advance(state, token_id, &self.vocabulary, self.grammar.hir())
    }

    /// Classifies `state`'s shape (`spec.md` §4.2, §9).
    pub fn shape(&self, state: &ParserState) -> StateShape {
        super::classify(state)
    }

    /// Derives the Adaptive Constraint Store lookup key for `state`
    /// (`spec.md` §4.6).
    pub fn fingerprint(&self, state: &ParserState) -> PatternFingerprint {
        PatternFingerprint::of(state, self.grammar.hir())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::grammar;
    use ahash::AHashMap;
    use crate::vocabulary::Token;

    fn make_vocab() -> Vocabulary {
        let mut id_to_token = AHashMap::default();
        let mut id_to_token_string = AHashMap::default();
        let mut push = |id: u32, s: &str| {
            id_to_token.insert(id, Token(s.as_bytes().to_vec().into_boxed_slice()));
            id_to_token_string.insert(id, s.to_string());
        };
        push(0, "return ");
        push(1, "1");
        push(2, "23");
        push(3, "<eos>");
        Vocabulary::new(id_to_token, id_to_token_string, 3).unwrap()
    }

    #[test]
    fn drives_a_trivial_decode_loop() {
        let config = Config::default();
        let compiled =
            grammar::compile(r#"start ::= "return " NUMBER ; NUMBER ::= /[0-9]+/ ;"#, &config).unwrap();
        let session = Session::new(Arc::new(compiled), Arc::new(make_vocab()));
        let state = session.begin();
        let mask = session.mask(&state);
        assert!(mask.is_allowed(0));
        assert!(!mask.is_allowed(3));
        let state = session.advance(&state, 0).unwrap();
        let mask = session.mask(&state);
        assert!(mask.is_allowed(1) || mask.is_allowed(2));
        let state = session.advance(&state, 1).unwrap();
        let mask = session.mask(&state);
        assert!(mask.is_allowed(3), "EOS should be legal once a NUMBER has matched");
    }
}
