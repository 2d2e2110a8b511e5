//! The configuration module of the constrained decoding core.
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::repair::DiagnosticKind;

/// The type of the Finite State Automaton used to compile terminal regexes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Fsa {
    /// A deterministic finite automaton that eagerly computes all state
    /// transitions. Fastest at match time; construction time and space are
    /// worst-case exponential in the regex size, so untrusted regexes should
    /// set [`RegexConfig::max_memory_usage`].
    Dfa,
}

/// The configuration of regular expression terminal compilation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct RegexConfig {
    /// The maximum memory usage in bytes allowed when compiling a terminal
    /// regex. `None` means no limit. Set this when compiling untrusted
    /// grammars to bound the DFA-construction DoS surface.
    pub max_memory_usage: Option<usize>,
    /// The type of automaton to compile regex terminals into.
    pub fsa_type: Fsa,
}

impl Default for RegexConfig {
    fn default() -> Self {
        Self {
            max_memory_usage: None,
            fsa_type: Fsa::Dfa,
        }
    }
}

/// Cache sizing, mirroring the three layers in the cache hierarchy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct CacheConfig {
    /// Bound on the compiled-grammar cache (default 1000).
    pub compiled_grammar_capacity: usize,
    /// Bound on the parser-state mask cache (default 100_000).
    pub mask_capacity: usize,
    /// Bound on the artifact cache (default 10_000).
    pub artifact_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            compiled_grammar_capacity: 1_000,
            mask_capacity: 100_000,
            artifact_capacity: 10_000,
        }
    }
}

/// Per-failure-kind penalty weights for the Adaptive Constraint Store.
/// Exposed as configuration per Open Question 3 in `spec.md` §9 — these are
/// policy, not invariants, and must never be hard-coded into `acs`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PenaltyTable {
    /// Learning rate `alpha` applied to both success and failure updates.
    pub learning_rate: f32,
    /// Penalty `p` applied on failure, per diagnostic kind.
    pub penalty_by_kind: ahash::AHashMap<DiagnosticKind, f32>,
    /// Multiplicative decay applied to every weight on each decay tick.
    pub decay_factor: f32,
    /// Weights at or below this floor are pruned on decay.
    pub prune_floor: f32,
}

impl Default for PenaltyTable {
    fn default() -> Self {
        let mut penalty_by_kind = ahash::AHashMap::default();
        penalty_by_kind.insert(DiagnosticKind::Syntax, 0.2);
        penalty_by_kind.insert(DiagnosticKind::Type, 0.25);
        penalty_by_kind.insert(DiagnosticKind::Test, 0.3);
        penalty_by_kind.insert(DiagnosticKind::Lint, 0.1);
        // Security-critical failures carry the largest penalty, per spec.md §4.6.
        penalty_by_kind.insert(DiagnosticKind::Security, 0.9);
        // Exhausting the token budget is a hard stop, not a quality defect;
        // penalize moderately so the ladder still tries a narrower plan.
        penalty_by_kind.insert(DiagnosticKind::Budget, 0.4);
        Self {
            learning_rate: 0.1,
            penalty_by_kind,
            decay_factor: 0.98,
            prune_floor: 0.02,
        }
    }
}

/// Budgets and the repair ladder ceiling for the Validation-Repair Loop.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct RepairConfig {
    /// Hard ceiling on repair attempts (default 3, per `spec.md` §4.5).
    pub max_attempts: u32,
}

impl Default for RepairConfig {
    fn default() -> Self {
        Self { max_attempts: 3 }
    }
}

/// The configuration of a [`crate::ipm::Session`]. This should suffice most
/// scenarios.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// The configuration of regular expression terminals.
    pub regex_config: RegexConfig,
    /// Whether the mask cache is consulted/populated for this session.
    /// Caching speeds up the engine once the grammar is reused across
    /// generations of similar length, or is "simple" (regular-ish).
    pub cache_enabled: bool,
    /// The start nonterminal of the grammar. Default is `start`.
    pub start_nonterminal: String,
    /// Sizing for the three cache layers.
    pub cache: CacheConfig,
    /// Penalty/learning-rate policy for the Adaptive Constraint Store.
    pub penalty_table: PenaltyTable,
    /// Repair ladder ceiling.
    pub repair: RepairConfig,
    /// Default wall-clock budget for a decode request.
    pub default_wall_clock_budget: Duration,
    /// Default `max_tokens` for a decode request.
    pub default_max_tokens: usize,
    /// Temperature in `[0, 1]` scaling how strongly soft constraints from
    /// the ACS boost already-allowed tokens. `0` disables soft constraints.
    pub default_temperature: f32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            regex_config: RegexConfig::default(),
            cache_enabled: true,
            start_nonterminal: "start".to_string(),
            cache: CacheConfig::default(),
            penalty_table: PenaltyTable::default(),
            repair: RepairConfig::default(),
            default_wall_clock_budget: Duration::from_secs(30),
            default_max_tokens: 2048,
            default_temperature: 0.5,
        }
    }
}
