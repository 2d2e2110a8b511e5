//! Deterministic checks of the quantified invariants and boundary behaviors
//! in `spec.md` §8, exercised over small hand-built grammars rather than a
//! property-testing crate — each test picks one concrete witness per law.
use std::sync::Arc;

use ahash::AHashMap;
use cdc::acs::{AcsStore, LanguageId};
use cdc::cache::GrammarCache;
use cdc::config::Config;
use cdc::grammar::{self, GrammarError};
use cdc::ipm::Session;
use cdc::repair::DiagnosticKind;
use cdc::request::ConstraintPlan;
use cdc::vocabulary::{Token, Vocabulary};

fn vocab(entries: &[(u32, &str)], eos: u32) -> Vocabulary {
    let mut id_to_token = AHashMap::default();
    let mut id_to_token_string = AHashMap::default();
    for &(id, s) in entries {
        id_to_token.insert(id, Token(s.as_bytes().to_vec().into_boxed_slice()));
        id_to_token_string.insert(id, s.to_string());
    }
    Vocabulary::new(id_to_token, id_to_token_string, eos).unwrap()
}

fn number_session() -> Session {
    let config = Config::default();
    let compiled =
        grammar::compile(r#"start ::= "return " NUMBER ; NUMBER ::= /[0-9]+/ ;"#, &config).unwrap();
    let vocab = vocab(
        &[(0, "return "), (1, "1"), (2, "23"), (3, "x"), (4, "<eos>")],
        4,
    );
    Session::new(Arc::new(compiled), Arc::new(vocab))
}

/// 1+3. Mask soundness / advance safety: every token the mask allows can be
/// advanced through without error, and a token the mask forbids cannot.
#[test]
fn mask_soundness_and_advance_safety() {
    let session = number_session();
    let state = session.begin();
    let mask = session.mask(&state);

    assert!(mask.is_allowed(0), "\"return \" must be legal at the start");
    assert!(session.advance(&state, 0).is_ok());

    assert!(!mask.is_allowed(3), "\"x\" is not a digit and must be forbidden");
    assert!(session.advance(&state, 3).is_err());
}

/// 2. Mask completeness, witnessed on a forced-continuation state: once
/// `"return "` has been consumed, every vocabulary entry that is a run of
/// digits is allowed, and nothing else is.
#[test]
fn mask_completeness_on_forced_state() {
    let session = number_session();
    let state = session.begin();
    let state = session.advance(&state, 0).unwrap();
    let mask = session.mask(&state);
    assert!(mask.is_allowed(1), "\"1\" is a valid NUMBER token");
    assert!(mask.is_allowed(2), "\"23\" is a valid NUMBER token");
    assert!(!mask.is_allowed(3), "\"x\" is never a valid NUMBER token");
}

/// 4. Monotonicity under refinement: a grammar restricted to a single digit
/// allows a subset of what the unrestricted digit-run grammar allows, on
/// every state the two share.
#[test]
fn mask_shrinks_under_refinement() {
    let config = Config::default();
    let general =
        grammar::compile(r#"start ::= "return " NUMBER ; NUMBER ::= /[0-9]+/ ;"#, &config).unwrap();
    let refined =
        grammar::compile(r#"start ::= "return " NUMBER ; NUMBER ::= /[0-9]/ ;"#, &config).unwrap();
    let vocab = Arc::new(vocab(
        &[(0, "return "), (1, "1"), (2, "23"), (3, "<eos>")],
        3,
    ));

    let general_session = Session::new(Arc::new(general), vocab.clone());
    let refined_session = Session::new(Arc::new(refined), vocab);

    let g_state = general_session.advance(&general_session.begin(), 0).unwrap();
    let r_state = refined_session.advance(&refined_session.begin(), 0).unwrap();

    let g_mask = general_session.mask(&g_state);
    let r_mask = refined_session.mask(&r_state);

    assert!(g_mask.is_allowed(2), "\"23\" is a run of digits, legal under the general grammar");
    assert!(
        !r_mask.is_allowed(2),
        "\"23\" is two digits, illegal once NUMBER is refined to a single digit"
    );
    for id in r_mask.allowed_ids() {
        assert!(
            g_mask.is_allowed(id),
            "refined mask must be a subset of the general mask on the shared state"
        );
    }
}

/// 5. Cache correctness: two lookups with the same source text return the
/// same interned compiled-grammar object.
#[test]
fn grammar_cache_returns_the_same_object() {
    let config = Config::default();
    let cache = GrammarCache::new(&config.cache);
    let source = r#"start ::= "a" ;"#;
    let first = cache.get_or_compile(source, &config).unwrap();
    let second = cache.get_or_compile(source, &config).unwrap();
    assert!(Arc::ptr_eq(&first, &second));
}

/// 6. Soft-weight safety: blending a learned penalty into a mask never
/// enables a token outside the hard-masked allowed set.
#[test]
fn soft_constraints_never_widen_the_hard_mask() {
    let session = number_session();
    let state = session.begin();
    let mut mask = session.mask(&state);
    let fingerprint = session.fingerprint(&state);

    let store = AcsStore::new(Config::default().penalty_table);
    let lang = LanguageId::new(0);
    // Token 3 ("x") is already hard-forbidden; recording a failure against it
    // must not cause blending to allow it.
    store.record_failure(lang, fingerprint, 3, DiagnosticKind::Lint);
    let before = mask.allowed_ids().collect::<Vec<_>>();
    let snapshot = store.snapshot(lang);
    snapshot.blend_into(&mut mask, fingerprint);
    let after = mask.allowed_ids().collect::<Vec<_>>();
    assert_eq!(before, after, "blending must never change which tokens are allowed");
    assert!(!mask.is_allowed(3));
}

/// 7. Repair monotonicity: each rung of the ladder produces a strictly
/// more-constrained plan than its predecessor.
#[test]
fn repair_ladder_is_monotonic() {
    let plan = ConstraintPlan {
        grammar_source: "start ::= \"a\" ;".to_string(),
        language: "test".to_string(),
        prefix: String::new(),
        completion_offset: 0,
        max_tokens: 64,
        wall_clock_budget: std::time::Duration::from_secs(1),
        temperature: 0.0,
        forbidden_fragments: Vec::new(),
        injected_examples: Vec::new(),
        template_fallback: false,
        simplify: false,
    };
    let tightened = plan.refine(cdc::repair::RepairStrategy::Tighten);
    assert!(tightened.forbidden_fragments.len() > plan.forbidden_fragments.len());
    let narrowed = tightened.refine(cdc::repair::RepairStrategy::Narrow);
    assert!(narrowed.max_tokens < tightened.max_tokens);
    // Narrowing never relaxes a prior rung's fragment list.
    assert_eq!(narrowed.forbidden_fragments.len(), tightened.forbidden_fragments.len());
}

/// Boundary: EOS is allowed iff the state is accepting.
#[test]
fn eos_only_allowed_when_accepting() {
    let session = number_session();
    let state = session.begin();
    assert!(!session.mask(&state).is_allowed(4), "EOS is illegal before anything has been emitted");

    let state = session.advance(&state, 0).unwrap();
    let state = session.advance(&state, 1).unwrap();
    assert!(session.mask(&state).is_allowed(4), "EOS must be legal once a NUMBER has matched");
}

/// Boundary: an undefined start rule is rejected at compile time rather than
/// surfacing as a generic parse failure.
#[test]
fn undefined_start_rejected_at_compile_time() {
    let mut config = Config::default();
    config.start_nonterminal = "missing".to_string();
    let err = grammar::compile(r#"start ::= "a" ;"#, &config).unwrap_err();
    assert!(matches!(err, GrammarError::Build(_)));
}
