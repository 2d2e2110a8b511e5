/*!
# cdc

This crate provides a constrained decoding core: it compiles a portable
grammar/schema dialect into an incremental parser, uses that parser to mask
a language model's token distribution at every decode step, and wraps the
resulting decode loop with a validation-repair cycle and a store that learns
from repeated validation failures.

Six subsystems cooperate:

- [`grammar`]: the Grammar Compiler. Parses the dialect, expands `%schema`
  directives, desugars repetition/grouping, and compiles named regex
  terminals into DFAs.
- [`ipm`]: the Incremental Parser / Mask Engine. A GLL-style recognizer over
  a graph-structured stack that, at each step, computes the set of
  vocabulary tokens consistent with the grammar ([`ipm::Session`]).
- [`cache`]: the Cache Hierarchy. Bounded, content-addressed caches for
  compiled grammars, per-state masks, and accepted artifacts.
- [`decode`]: the Decode Orchestrator. Drives one generation loop against a
  [`decode::Provider`], sampling under the incremental parser's mask.
- [`repair`]: the Validation-Repair Loop. Runs external [`repair::Validator`]s
  against a candidate artifact and, on failure, walks a repair ladder that
  tightens the constraint plan and retries.
- [`acs`]: the Adaptive Constraint Store. Learns a soft per-grammar-position
  bias away from continuations that have previously triggered validation
  failures.
- [`request`]: the Request Compiler. Turns a caller's [`request::RawRequest`]
  into the [`request::ConstraintPlan`] the other subsystems execute.

# Example

```rust
use std::sync::Arc;
use ahash::AHashMap;
use cdc::config::Config;
use cdc::grammar;
use cdc::ipm::Session;
use cdc::vocabulary::{Token, Vocabulary};

let config = Config::default();
let compiled = grammar::compile(
    r#"start ::= "return " NUMBER ; NUMBER ::= /[0-9]+/ ;"#,
    &config,
)
.unwrap();

let mut id_to_token = AHashMap::default();
let mut id_to_token_string = AHashMap::default();
for (id, s) in [(0, "return "), (1, "1"), (2, "23"), (3, "<eos>")] {
    id_to_token.insert(id, Token(s.as_bytes().to_vec().into_boxed_slice()));
    id_to_token_string.insert(id, s.to_string());
}
let vocab = Vocabulary::new(id_to_token, id_to_token_string, 3).unwrap();

let session = Session::new(Arc::new(compiled), Arc::new(vocab));
let state = session.begin();
let mask = session.mask(&state);
assert!(mask.is_allowed(0));
assert!(!mask.is_allowed(3));

let state = session.advance(&state, 0).unwrap();
let state = session.advance(&state, 1).unwrap();
assert!(session.mask(&state).is_allowed(3));
```

# Grammar dialect

The dialect is a portable EBNF with embeddable regex terminals: uppercase
names are terminals, lowercase names are rules, alternatives are separated
by `|`, and `()`, `?`, `*`, `+`, `{m,n}` behave as in standard EBNF. A
`%schema "<json-pointer>" { <json schema> }` directive lowers a JSON Schema
subset (object/properties/required, array/items, string/enum,
integer/number, boolean, null, oneOf/anyOf) into synthetic rules, so API
response shapes can be declared directly rather than hand-transcribed into
grammar rules. See [`grammar`] for the full desugaring pipeline.

# Performance

Prefer regular expressions over recursive rules where the shape of a
terminal permits it: a named regex terminal compiles once into a DFA, while
a recursive rule is re-walked by the incremental parser on every step.
Caches are shared across sessions targeting the same engine instance
([`cache::Caches`]) — reuse one engine rather than constructing fresh caches
per request.
*/
#![warn(missing_docs)]
#![warn(rustdoc::broken_intra_doc_links)]
pub mod acs;
pub mod cache;
pub mod config;
pub mod decode;
pub mod error;
pub mod grammar;
pub mod ipm;
pub mod repair;
pub mod request;
pub mod utils;
pub mod vocabulary;

pub use cache::Caches;
pub use config::Config;
pub use error::CdcError;
pub use grammar::{CompiledGrammar, Grammar, GrammarError};
pub use ipm::{ParserState, Session};
pub use vocabulary::{Token, Vocabulary};

#[cfg(feature = "mimalloc")]
use mimalloc::MiMalloc;

#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;
