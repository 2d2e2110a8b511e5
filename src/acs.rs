//! The Adaptive Constraint Store (`spec.md` §4.6): learns, per grammar
//! position, a soft bias over which legal continuations have historically
//! led to validation failures — so the next decode at "the same kind of
//! place" steers away from them before a repair cycle is even needed.
//!
//! Mirrors the teacher's cache layers in shape (a hash map behind a
//! `parking_lot::RwLock`, `lru`-style bounded growth) but the keyed payload
//! here is a learned weight rather than a compiled artifact.
use std::time::{SystemTime, UNIX_EPOCH};

use ahash::AHashMap;
use parking_lot::RwLock;

use crate::config::PenaltyTable;
use crate::ipm::{AllowMask, PatternFingerprint};
use crate::repair::DiagnosticKind;

/// A per-language, per-fingerprint learned weight (`spec.md` §3, §4.6).
/// Positive weight biases sampling *away* from the token this constraint
/// targets; this is soft, never a hard mask edit — the hard mask from the
/// grammar is always the ceiling.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SoftConstraint {
    pub weight: f32,
    pub last_updated_unix_ms: u64,
}

impl SoftConstraint {
    fn fresh(weight: f32) -> Self {
        Self {
            weight,
            last_updated_unix_ms: now_unix_ms(),
        }
    }
}

fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// A language identifier, scoping soft constraints so that "forbidden after
/// a `)` in Python" and "forbidden after a `)` in Rust" never collide even
/// if their grammars happen to produce the same fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LanguageId(u32);

impl LanguageId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }
}

/// The live, mutable store (`spec.md` §4.6). One per engine instance, shared
/// across sessions for the same caller.
pub struct AcsStore {
    table: RwLock<AHashMap<(LanguageId, PatternFingerprint, u32), SoftConstraint>>,
    penalties: PenaltyTable,
}

impl AcsStore {
    pub fn new(penalties: PenaltyTable) -> Self {
        Self {
            table: RwLock::new(AHashMap::default()),
            penalties,
        }
    }

    /// Records a repair-triggering diagnostic of `kind` against the
    /// fingerprint the parser was at when the offending token was emitted,
    /// nudging that token's weight down by the configured penalty.
    pub fn record_failure(
        &self,
        language: LanguageId,
        fingerprint: PatternFingerprint,
        token_id: u32,
        kind: DiagnosticKind,
    ) {
        let penalty = crate::repair::penalty_for(kind, &self.penalties.penalty_by_kind);
        let mut table = self.table.write();
        let entry = table
            .entry((language, fingerprint, token_id))
            .or_insert_with(|| SoftConstraint::fresh(0.0));
        entry.weight += self.penalties.learning_rate * penalty;
        entry.last_updated_unix_ms = now_unix_ms();
    }

    /// Records that `token_id` at this fingerprint led to an accepted
    /// artifact, relaxing any accumulated penalty toward zero.
    pub fn record_success(&self, language: LanguageId, fingerprint: PatternFingerprint, token_id: u32) {
        let mut table = self.table.write();
        if let Some(entry) = table.get_mut(&(language, fingerprint, token_id)) {
            entry.weight -= self.penalties.learning_rate * entry.weight.abs();
            entry.last_updated_unix_ms = now_unix_ms();
        }
    }

    /// Applies `decay_factor` to every stored weight and prunes entries at
    /// or below `prune_floor` (`spec.md` §4.6) — call periodically, not on
    /// the decode hot path.
    pub fn decay(&self) {
        let mut table = self.table.write();
        table.retain(|_, c| {
            c.weight *= self.penalties.decay_factor;
            c.weight.abs() > self.penalties.prune_floor
        });
    }

    /// Takes an immutable point-in-time view for one decode loop to consult
    /// (`spec.md` §4.6: "taken at decode-loop start, so mid-loop learning in
    /// other concurrent sessions never perturbs an in-flight decode").
    pub fn snapshot(&self, language: LanguageId) -> Snapshot {
        let table = self.table.read();
        let mut entries = AHashMap::default();
        for (&(lang, fp, token_id), &constraint) in table.iter() {
            if lang == language {
                entries.insert((fp, token_id), constraint);
            }
        }
        Snapshot { language, entries }
    }
}

/// An immutable clone of one language's soft constraints, bound to a single
/// decode loop (`spec.md` §4.6).
#[derive(Clone)]
pub struct Snapshot {
    language: LanguageId,
    entries: AHashMap<(PatternFingerprint, u32), SoftConstraint>,
}

impl Snapshot {
    pub fn language(&self) -> LanguageId {
        self.language
    }

    /// Populates `mask`'s soft-score companion vector from this snapshot for
    /// the parser state at `fingerprint` (`spec.md` §4.2, §4.6). Only
    /// touches tokens already hard-allowed by `mask` — the ACS can never
    /// widen or narrow the hard mask, only bias sampling within it.
    pub fn blend_into(&self, mask: &mut AllowMask, fingerprint: PatternFingerprint) {
        if self.entries.is_empty() {
            return;
        }
        let allowed: Vec<u32> = mask.allowed_ids().collect();
        let mut scores = vec![0.0f32; allowed.iter().copied().max().map(|m| m as usize + 1).unwrap_or(0)];
        let mut any = false;
        for &token_id in &allowed {
            if let Some(constraint) = self.entries.get(&(fingerprint, token_id)) {
                scores[token_id as usize] = -constraint.weight;
                any = true;
            }
        }
        if any {
            mask.soft_scores = Some(scores);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_then_success_moves_weight_toward_zero() {
        let store = AcsStore::new(PenaltyTable::default());
        let lang = LanguageId::new(0);
        let fp = dummy_fingerprint();
        store.record_failure(lang, fp, 7, DiagnosticKind::Lint);
        let snap = store.snapshot(lang);
        let weight_after_failure = snap.entries.get(&(fp, 7)).unwrap().weight;
        assert!(weight_after_failure > 0.0);
        store.record_success(lang, fp, 7);
        let snap = store.snapshot(lang);
        let weight_after_success = snap.entries.get(&(fp, 7)).unwrap().weight;
        assert!(weight_after_success < weight_after_failure);
    }

    #[test]
    fn decay_prunes_small_weights() {
        let mut penalties = PenaltyTable::default();
        penalties.decay_factor = 0.0;
        penalties.prune_floor = 0.0001;
        let store = AcsStore::new(penalties);
        let lang = LanguageId::new(0);
        let fp = dummy_fingerprint();
        store.record_failure(lang, fp, 1, DiagnosticKind::Syntax);
        store.decay();
        let snap = store.snapshot(lang);
        assert!(snap.entries.is_empty());
    }

    fn dummy_fingerprint() -> PatternFingerprint {
        let config = crate::config::Config::default();
        let compiled = crate::grammar::compile(r#"start ::= "a" ;"#, &config).unwrap();
        let session = crate::ipm::Session::new(
            std::sync::Arc::new(compiled),
            std::sync::Arc::new(test_vocab()),
        );
        let state = session.begin();
        session.fingerprint(&state)
    }

    fn test_vocab() -> crate::vocabulary::Vocabulary {
        use crate::vocabulary::{Token, Vocabulary};
        let mut id_to_token = ahash::AHashMap::default();
        let mut id_to_token_string = ahash::AHashMap::default();
        id_to_token.insert(0, Token(b"a".to_vec().into_boxed_slice()));
        id_to_token_string.insert(0, "a".to_string());
        id_to_token.insert(1, Token(b"<eos>".to_vec().into_boxed_slice()));
        id_to_token_string.insert(1, "<eos>".to_string());
        Vocabulary::new(id_to_token, id_to_token_string, 1).unwrap()
    }
}
