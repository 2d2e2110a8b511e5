//! Benchmarks the per-step cost of [`cdc::ipm::Session::mask`] against a
//! grammar with both a recursive rule and a regex terminal, the two shapes
//! `spec.md` §9's "prefer regex over recursion" performance note contrasts.
use std::sync::Arc;

use ahash::AHashMap;
use cdc::config::Config;
use cdc::grammar;
use cdc::ipm::Session;
use cdc::vocabulary::{Token, Vocabulary};
use criterion::{black_box, criterion_group, criterion_main, Criterion};

fn make_vocab() -> Vocabulary {
    let mut id_to_token = AHashMap::default();
    let mut id_to_token_string = AHashMap::default();
    let mut push = |id: u32, s: &str| {
        id_to_token.insert(id, Token(s.as_bytes().to_vec().into_boxed_slice()));
        id_to_token_string.insert(id, s.to_string());
    };
    push(0, "(");
    push(1, ")");
    push(2, "42");
    push(3, "<eos>");
    Vocabulary::new(id_to_token, id_to_token_string, 3).unwrap()
}

fn recursive_session() -> Session {
    let config = Config::default();
    let compiled = grammar::compile(
        r#"start ::= "(" start ")" | NUMBER ; NUMBER ::= /[0-9]+/ ;"#,
        &config,
    )
    .unwrap();
    Session::new(Arc::new(compiled), Arc::new(make_vocab()))
}

fn regex_session() -> Session {
    let config = Config::default();
    let compiled = grammar::compile(r#"start ::= NUMBER ; NUMBER ::= /[0-9]+/ ;"#, &config).unwrap();
    Session::new(Arc::new(compiled), Arc::new(make_vocab()))
}

fn bench_mask(c: &mut Criterion) {
    let recursive = recursive_session();
    let recursive_state = recursive.begin();
    c.bench_function("mask_recursive_rule", |b| {
        b.iter(|| black_box(recursive.mask(black_box(&recursive_state))));
    });

    let regex = regex_session();
    let regex_state = regex.begin();
    c.bench_function("mask_regex_terminal", |b| {
        b.iter(|| black_box(regex.mask(black_box(&regex_state))));
    });
}

criterion_group!(benches, bench_mask);
criterion_main!(benches);
