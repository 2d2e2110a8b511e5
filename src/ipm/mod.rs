//! The Incremental Parser / Mask Engine (`spec.md` §4.2): a GLL-style
//! recognizer over a graph-structured stack that computes, at each decode
//! step, the set of vocabulary tokens consistent with the grammar.
//!
//! Per the redesign note in `spec.md` §9 ("cyclic rule graphs... represented
//! as explicit indexed graphs... parser state is an integer or small struct
//! indexing into that arena"), this replaces the teacher's six-type-parameter
//! Earley/Leo `EngineBase` with a frontier of `Thread`s, each a grammar
//! "slot" (`Item`) plus a shared return-address stack (`StackNode`, a
//! persistent linked list via `Arc`, i.e. a graph-structured stack). The
//! frontier is a *set*, so left recursion converges by deduplication rather
//! than needing Leo's cycle-shortcutting optimization.
mod fingerprint;
mod session;

use std::hash::{Hash, Hasher};
use std::sync::Arc;

use ahash::AHashSet;
use fixedbitset_stack::FixedBitSet;
use kbnf_regex_automata::dfa::Automaton;
use kbnf_regex_automata::util::primitives::StateID;

use crate::grammar::{Grammar, HIRNode, NonterminalID};
use crate::utils::{self, FsaStateStatus};
use crate::vocabulary::Vocabulary;

pub use fingerprint::PatternFingerprint;
pub use session::Session;

/// A position within one alternative of one nonterminal's right-hand side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct Item {
    nt: NonterminalID,
    alt: u32,
    dot: u32,
}

/// A frame on a thread's return stack: "once the nonterminal currently being
/// matched finishes, resume at this slot". Structural (value) equality
/// rather than pointer identity is what lets the frontier's `AHashSet`
/// deduplicate recursive derivations — `Arc<T>`'s `PartialEq`/`Hash`
/// compare the pointee, not the pointer, so this falls out of `#[derive]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct StackNode {
    resume: Item,
    parent: Option<Arc<StackNode>>,
}

/// Where a terminal-matching thread is within its terminal's automaton.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum TerminalCursor {
    Literal { id: crate::grammar::TerminalID, pos: u32 },
    Regex { id: crate::grammar::RegexID, state: StateID },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Phase {
    /// Sitting at a grammar slot, not yet inside a terminal.
    Call(Item),
    /// Mid-terminal; bytes have already been partially consumed.
    Match(TerminalCursor),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct Thread {
    phase: Phase,
    stack: Option<Arc<StackNode>>,
}

impl Thread {
    /// A coarse tag identifying which terminal/nonterminal this thread is
    /// waiting on, ignoring in-progress byte/DFA-state position — used by
    /// [`fingerprint::PatternFingerprint`] to group "the same kind of
    /// grammar position" across otherwise-distinct parser states.
    pub(crate) fn terminal_class_tag(&self) -> u64 {
        match self.phase {
            Phase::Match(TerminalCursor::Literal { id, .. }) => (0u64 << 32) | id.0 as u64,
            Phase::Match(TerminalCursor::Regex { id, .. }) => (1u64 << 32) | id.0 as u64,
            Phase::Call(item) => (2u64 << 32) | item.nt.0 as u64,
        }
    }
}

/// A cursor into an in-progress parse (`spec.md` §3). Cheap to `Clone`: the
/// frontier's `Arc<StackNode>` chains are shared, not copied.
#[derive(Debug, Clone)]
pub struct ParserState {
    frontier: AHashSet<Thread>,
    /// Whether the input accepted so far is already a complete derivation
    /// (i.e. the end-of-sequence token is currently legal).
    can_accept: bool,
}

impl ParserState {
    /// An exact, order-independent content key over the full frontier —
    /// distinct from [`PatternFingerprint`], which only hashes each
    /// thread's coarse `terminal_class_tag` and is explicitly documented as
    /// *not* guaranteeing derivational identity. The mask cache needs an
    /// exact key (two states with this same key must have the same allow
    /// set), so it hashes every `Thread`'s full structural content — phase,
    /// cursor position, and return stack — rather than the fingerprint's
    /// coarse grouping.
    pub(crate) fn structural_key(&self) -> u64 {
        let mut combined: u64 = self.can_accept as u64;
        for thread in &self.frontier {
            let mut hasher = ahash::AHasher::default();
            thread.hash(&mut hasher);
            combined ^= hasher.finish();
        }
        combined
    }
}

#[derive(Debug, thiserror::Error)]
/// Errors raised while driving a [`ParserState`] (`spec.md` §4.2, §7).
pub enum ParserError {
    /// `advance` was called with a token id absent from the bound vocabulary.
    #[error("token id {0} has no entry in the bound vocabulary")]
    UnknownToken(u32),
    /// The token's bytes are not consistent with any thread in the frontier;
    /// the caller should have consulted `mask` first.
    #[error("token id {0} is not allowed from the current parser state")]
    IllegalToken(u32),
    /// `advance` was called on a state with an empty frontier and no pending
    /// acceptance — the grammar has no valid continuation.
    #[error("parser state is dead: the grammar admits no continuation")]
    Dead,
}

/// The four shapes a [`ParserState`] can take, classified cheaply from
/// frontier size and terminal-class cardinality (`spec.md` §4.2, §9).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateShape {
    /// Only the end-of-sequence token is legal; generation must stop.
    AcceptingOnly,
    /// Exactly one terminal class is live and the derivation cannot yet
    /// finish: the continuation is forced, sampling is unnecessary.
    ForcedContinuation,
    /// More than one distinct continuation is live.
    Branching,
    /// No continuation and no acceptance: the grammar is unsatisfiable from
    /// here. Should never surface to a caller that consults `mask` first.
    Dead,
}

/// A per-step allow-mask over the bound vocabulary (`spec.md` §3, §4.2):
/// a bitset plus an optional soft-score companion from the Adaptive
/// Constraint Store (`spec.md` §4.6).
#[derive(Debug, Clone)]
pub struct AllowMask {
    bits: FixedBitSet,
    /// Per-token additive bias, populated by `acs::blend_into` when soft
    /// constraints are in play; `None` means "hard mask only".
    pub(crate) soft_scores: Option<Vec<f32>>,
}

impl AllowMask {
    fn new(vocab_size: usize) -> Self {
        Self {
            bits: FixedBitSet::with_capacity(vocab_size),
            soft_scores: None,
        }
    }

    #[inline]
    pub fn is_allowed(&self, token_id: u32) -> bool {
        self.bits.contains(token_id as usize)
    }

    #[inline]
    pub fn allowed_ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.bits.ones().map(|x| x as u32)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.bits.count_ones(..)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Begins a fresh parse from the grammar's start rule.
pub(crate) fn begin(grammar: &Grammar) -> ParserState {
    let mut frontier = AHashSet::default();
    for (alt_idx, _) in grammar.alternatives(grammar.start()).iter().enumerate() {
        frontier.insert(Thread {
            phase: Phase::Call(Item {
                nt: grammar.start(),
                alt: alt_idx as u32,
                dot: 0,
            }),
            stack: None,
        });
    }
    close(frontier, grammar)
}

/// Epsilon-closes a raw frontier: expands `Call` threads positioned on a
/// nonterminal, pops threads at the end of their alternative, and leaves
/// `Match` threads (positioned on a terminal) as the reduced frontier.
fn close(mut pending: AHashSet<Thread>, grammar: &Grammar) -> ParserState {
    let mut reduced: AHashSet<Thread> = AHashSet::default();
    let mut can_accept = false;
    let mut seen: AHashSet<Thread> = AHashSet::default();

    while let Some(thread) = pending.iter().next().cloned() {
        pending.remove(&thread);
        if seen.contains(&thread) {
            continue;
        }
        seen.insert(thread.clone());

        let Phase::Call(item) = thread.phase else {
            reduced.insert(thread);
            continue;
        };
        let alt = &grammar.alternatives(item.nt)[item.alt as usize];
        if (item.dot as usize) == alt.len() {
            match &thread.stack {
                None => can_accept = true,
                Some(node) => {
                    pending.insert(Thread {
                        phase: Phase::Call(node.resume),
                        stack: node.parent.clone(),
                    });
                }
            }
            continue;
        }
        match alt[item.dot as usize] {
            HIRNode::Nonterminal(nt2) => {
                let resume = Item {
                    nt: item.nt,
                    alt: item.alt,
                    dot: item.dot + 1,
                };
                let new_stack = Arc::new(StackNode {
                    resume,
                    parent: thread.stack.clone(),
                });
                for (alt2_idx, _) in grammar.alternatives(nt2).iter().enumerate() {
                    pending.insert(Thread {
                        phase: Phase::Call(Item {
                            nt: nt2,
                            alt: alt2_idx as u32,
                            dot: 0,
                        }),
                        stack: Some(new_stack.clone()),
                    });
                }
            }
            HIRNode::Terminal(id) => {
                reduced.insert(Thread {
                    phase: Phase::Match(TerminalCursor::Literal { id, pos: 0 }),
                    stack: thread.stack.clone(),
                });
            }
            HIRNode::RegexString(id) => {
                let dfa = grammar.regex_dfa(id);
                let start = dfa
                    .start_state(
                        &kbnf_regex_automata::util::start::Config::new()
                            .anchored(kbnf_regex_automata::Anchored::Yes),
                    )
                    .expect("anchored start state always resolves for compiled terminals");
                reduced.insert(Thread {
                    phase: Phase::Match(TerminalCursor::Regex { id, state: start }),
                    stack: thread.stack.clone(),
                });
            }
        }
    }
    ParserState {
        frontier: reduced,
        can_accept,
    }
}

/// Feeds one byte through a single terminal cursor, returning the cursor's
/// new status and (if it did not reject) the advanced cursor.
fn step_cursor(
    cursor: TerminalCursor,
    byte: u8,
    grammar: &Grammar,
) -> Option<(TerminalCursor, FsaStateStatus)> {
    match cursor {
        TerminalCursor::Literal { id, pos } => {
            let bytes = grammar.terminal_bytes(id);
            if (pos as usize) >= bytes.len() || bytes[pos as usize] != byte {
                return None;
            }
            let next_pos = pos + 1;
            let status = if next_pos as usize == bytes.len() {
                FsaStateStatus::Accept
            } else {
                FsaStateStatus::InProgress
            };
            Some((TerminalCursor::Literal { id, pos: next_pos }, status))
        }
        TerminalCursor::Regex { id, state } => {
            let dfa = grammar.regex_dfa(id);
            let next = dfa.next_state(state, byte);
            let status = utils::check_dfa_state_status(next, dfa);
            if status == FsaStateStatus::Reject {
                None
            } else {
                Some((TerminalCursor::Regex { id, state: next }, status))
            }
        }
    }
}

/// Whether `bytes` can be consumed in full starting from `threads`,
/// following every branch that stays alive — including popping a completed
/// terminal and continuing into the next grammar symbols mid-token, which is
/// what lets masking stay correct across tokenizer/terminal misalignment
/// (`spec.md` §4.2 step 4, §9). Bounded by `bytes.len()` recursion depth.
fn bytes_continue(threads: &[Thread], bytes: &[u8], grammar: &Grammar) -> bool {
    if bytes.is_empty() {
        return true;
    }
    let byte = bytes[0];
    let mut next_threads: Vec<Thread> = Vec::new();
    for thread in threads {
        let Phase::Match(cursor) = thread.phase else {
            continue;
        };
        let Some((advanced, status)) = step_cursor(cursor, byte, grammar) else {
            continue;
        };
        if status == FsaStateStatus::Accept {
            // The terminal just completed; pop and epsilon-close to see
            // what comes next, then keep consuming the remaining bytes
            // against that continuation too (a token may straddle a
            // terminal boundary).
            let closed = close_from_completed_terminal(thread, grammar);
            if closed.can_accept && bytes.len() == 1 {
                return true;
            }
            next_threads.extend(closed.frontier);
        }
        if status != FsaStateStatus::Reject {
            next_threads.push(Thread {
                phase: Phase::Match(advanced),
                stack: thread.stack.clone(),
            });
        }
    }
    if next_threads.is_empty() {
        false
    } else {
        bytes_continue(&next_threads, &bytes[1..], grammar)
    }
}

/// Closes the frontier that results from one `Match` thread's terminal
/// having just completed: pop its stack frame and epsilon-close onward.
fn close_from_completed_terminal(thread: &Thread, grammar: &Grammar) -> ParserState {
    let mut pending = AHashSet::default();
    match &thread.stack {
        None => {
            return ParserState {
                frontier: AHashSet::default(),
                can_accept: true,
            };
        }
        Some(node) => {
            pending.insert(Thread {
                phase: Phase::Call(node.resume),
                stack: node.parent.clone(),
            });
        }
    }
    close(pending, grammar)
}

/// Computes the allow-mask for `state` against `vocab` (`spec.md` §4.2).
pub(crate) fn mask(state: &ParserState, vocab: &Vocabulary, grammar: &Grammar) -> AllowMask {
    let mut out = AllowMask::new(vocab.vocab_size());
    if state.can_accept {
        out.bits.insert(vocab.eos_token_id() as usize);
    }
    let threads: Vec<Thread> = state.frontier.iter().cloned().collect();
    if threads.is_empty() {
        return out;
    }
    let mut first_bytes: AHashSet<u8> = AHashSet::default();
    for thread in &threads {
        if let Phase::Match(cursor) = thread.phase {
            collect_first_bytes(cursor, grammar, &mut first_bytes);
        }
    }
    for byte in first_bytes {
        for token_id in vocab.tokens_with_first_byte(byte) {
            if out.is_allowed(token_id) {
                continue;
            }
            if let Some(token) = vocab.token(token_id) {
                if bytes_continue(&threads, &token.0, grammar) {
                    out.bits.insert(token_id as usize);
                }
            }
        }
    }
    out
}

fn collect_first_bytes(cursor: TerminalCursor, grammar: &Grammar, out: &mut AHashSet<u8>) {
    match cursor {
        TerminalCursor::Literal { id, pos } => {
            let bytes = grammar.terminal_bytes(id);
            if (pos as usize) < bytes.len() {
                out.insert(bytes[pos as usize]);
            }
        }
        TerminalCursor::Regex { id, state } => {
            let set = grammar.first_bytes_for_regex_state(id, state);
            for b in set.ones() {
                out.insert(b as u8);
            }
        }
    }
}

/// Classifies `state`'s shape (`spec.md` §4.2, §9).
pub(crate) fn classify(state: &ParserState) -> StateShape {
    if state.frontier.is_empty() {
        return if state.can_accept {
            StateShape::AcceptingOnly
        } else {
            StateShape::Dead
        };
    }
    let mut distinct: AHashSet<TerminalCursor> = AHashSet::default();
    for thread in &state.frontier {
        if let Phase::Match(cursor) = thread.phase {
            distinct.insert(cursor);
        }
    }
    if !state.can_accept && distinct.len() == 1 {
        StateShape::ForcedContinuation
    } else {
        StateShape::Branching
    }
}

/// Advances `state` by one token's bytes, re-closing the frontier
/// (`spec.md` §4.2). Callers are expected to have consulted `mask` first;
/// this still revalidates, returning [`ParserError::IllegalToken`] rather
/// than silently producing an inconsistent state.
pub(crate) fn advance(
    state: &ParserState,
    token_id: u32,
    vocab: &Vocabulary,
    grammar: &Grammar,
) -> Result<ParserState, ParserError> {
    if token_id == vocab.eos_token_id() {
        if state.can_accept {
            return Ok(ParserState {
                frontier: AHashSet::default(),
                can_accept: true,
            });
        }
        return Err(ParserError::IllegalToken(token_id));
    }
    let token = vocab.token(token_id).ok_or(ParserError::UnknownToken(token_id))?;
    if state.frontier.is_empty() {
        return Err(ParserError::Dead);
    }
    let mut current: AHashSet<Thread> = state.frontier.clone();
    let mut can_accept = false;
    for &byte in token.0.iter() {
        let mut next: AHashSet<Thread> = AHashSet::default();
        can_accept = false;
        for thread in &current {
            let Phase::Match(cursor) = thread.phase else {
                continue;
            };
            let Some((advanced, status)) = step_cursor(cursor, byte, grammar) else {
                continue;
            };
            if status == FsaStateStatus::Accept {
                let closed = close_from_completed_terminal(thread, grammar);
                can_accept |= closed.can_accept;
                next.extend(closed.frontier);
            }
            if status != FsaStateStatus::Reject {
                next.insert(Thread {
                    phase: Phase::Match(advanced),
                    stack: thread.stack.clone(),
                });
            }
        }
        if next.is_empty() && !can_accept {
            return Err(ParserError::IllegalToken(token_id));
        }
        current = next;
    }
    Ok(ParserState {
        frontier: current,
        can_accept,
    })
}
