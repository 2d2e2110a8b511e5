//! The Decode Orchestrator (`spec.md` §4.4): drives one token-by-token
//! generation loop against a [`Provider`], consulting the Incremental
//! Parser/Mask Engine for the legal continuation set at every step and the
//! Adaptive Constraint Store for a soft bias over it.
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;

use crate::acs::Snapshot as AcsSnapshot;
use crate::cache::Caches;
use crate::config::Config;
use crate::error::CdcError;
use crate::ipm::{Session, StateShape};
use crate::repair::{Diagnostic, DiagnosticKind, Level, ValidationFailure};
use crate::request::ConstraintPlan;

/// Transport, auth, timeout, or malformed-response failures talking to a
/// [`Provider`] (`spec.md` §7).
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// The transport to the provider failed (connection reset, DNS, etc).
    #[error("provider transport error: {0}")]
    Transport(String),
    /// The provider rejected the credentials used to reach it. Never retried
    /// — per `spec.md` §7, auth failures are not a transient class.
    #[error("provider authentication failed: {0}")]
    Auth(String),
    /// The provider did not respond within its own deadline.
    #[error("provider timed out")]
    Timeout,
    /// The provider responded, but the logits were malformed (wrong
    /// dimension, NaN, etc).
    #[error("provider returned malformed logits: {0}")]
    Malformed(String),
}

impl ProviderError {
    /// Whether bounded exponential-backoff retry applies to this error
    /// class. Only [`ProviderError::Auth`] is excluded — retrying a bad
    /// credential just burns the budget for an outcome that won't change.
    pub fn is_transient(&self) -> bool {
        !matches!(self, ProviderError::Auth(_))
    }
}

/// The seam a language model backend plugs into (`spec.md` §6). Synchronous:
/// batching, streaming, and async transport are the caller's concern, not
/// this engine's — the orchestrator calls `next_logits` once per token.
pub trait Provider {
    /// Returns one row of logits, indexed by vocabulary token id, for the
    /// next token given everything generated so far.
    fn next_logits(&self, prefix: &str, emitted: &[u32]) -> Result<Vec<f32>, ProviderError>;

    /// Whether this provider can accept an out-of-band grammar hint (e.g. a
    /// vendor-specific constrained-decoding flag) that the orchestrator may
    /// use to bias sampling even before masking. Providers that return
    /// `false` are masked purely post-hoc.
    fn supports_grammar_hint(&self) -> bool {
        false
    }
}

/// Bounded exponential-backoff policy for transient [`ProviderError`]s.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
        }
    }
}

fn call_with_retry(
    provider: &dyn Provider,
    prefix: &str,
    emitted: &[u32],
    policy: &RetryPolicy,
) -> Result<Vec<f32>, ProviderError> {
    let mut attempt = 0;
    loop {
        match provider.next_logits(prefix, emitted) {
            Ok(logits) => return Ok(logits),
            Err(err) if err.is_transient() && attempt + 1 < policy.max_attempts => {
                let backoff = policy.base_delay * 2u32.saturating_pow(attempt).min(u32::MAX);
                thread::sleep(backoff.min(policy.max_delay));
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Samples one token id from `logits`, restricted to `mask`'s allowed set
/// and biased by any soft scores it carries (`spec.md` §4.2, §4.6).
/// `temperature` in `[0, 1]` scales how strongly the soft bias perturbs an
/// otherwise-greedy-over-hard-mask distribution; `0` disables it.
pub fn sample(
    logits: &[f32],
    mask: &crate::ipm::AllowMask,
    temperature: f32,
    rng: &mut impl Rng,
) -> Option<u32> {
    let allowed: Vec<u32> = mask.allowed_ids().collect();
    if allowed.is_empty() {
        return None;
    }
    let max_logit = allowed
        .iter()
        .map(|&id| logits.get(id as usize).copied().unwrap_or(f32::NEG_INFINITY))
        .fold(f32::NEG_INFINITY, f32::max);
    let weights: Vec<f32> = allowed
        .iter()
        .map(|&id| {
            let logit = logits.get(id as usize).copied().unwrap_or(f32::NEG_INFINITY);
            let mut w = (logit - max_logit).exp();
            if let Some(soft) = &mask.soft_scores {
                let bias = soft.get(id as usize).copied().unwrap_or(0.0);
                w *= (temperature * bias).exp();
            }
            w.max(f32::MIN_POSITIVE)
        })
        .collect();
    let dist = WeightedIndex::new(&weights).ok()?;
    Some(allowed[dist.sample(rng)])
}

/// The result of one full generation attempt.
pub struct DecodeResult {
    pub text: String,
    pub token_ids: Vec<u32>,
}

/// Builds the content-hash parts identifying `plan`'s decode identity for
/// the artifact cache (`spec.md` §4.3) — every field the repair ladder can
/// mutate must be included, or two distinct rungs would collide on one key.
fn artifact_cache_parts(plan: &ConstraintPlan) -> Vec<String> {
    vec![
        plan.language.clone(),
        plan.grammar_source.clone(),
        plan.prefix.clone(),
        plan.completion_offset.to_string(),
        plan.max_tokens.to_string(),
        plan.temperature.to_string(),
        plan.forbidden_fragments.join("\u{1}"),
        plan.injected_examples.join("\u{1}"),
        plan.template_fallback.to_string(),
        plan.simplify.to_string(),
    ]
}

fn budget_exhausted_failure() -> ValidationFailure {
    ValidationFailure {
        diagnostics: vec![Diagnostic {
            kind: DiagnosticKind::Budget,
            level: Level::Error,
            location: None,
            message: "max_tokens is 0: no token budget to generate a continuation".to_string(),
            suggested_fix: None,
            code: None,
        }],
    }
}

fn parser_failure_as_validation(token_id: u32, err: crate::ipm::ParserError) -> ValidationFailure {
    ValidationFailure {
        diagnostics: vec![Diagnostic {
            kind: DiagnosticKind::Syntax,
            level: Level::Error,
            location: None,
            message: format!("token {token_id} was rejected mid-decode: {err}"),
            suggested_fix: None,
            code: None,
        }],
    }
}

/// Drives the decode loop described in `spec.md` §4.2/§4.4: mask, sample,
/// advance, repeat until EOS, `max_tokens`, or the wall-clock budget is hit.
///
/// Consults `caches` for the mask and artifact layers when
/// `config.cache_enabled` is set (`spec.md` §4.3); a `ParserState` whose
/// `advance` turns out illegal — an internal invariant breach, since a
/// well-formed `mask` should have ruled it out — is converted to a
/// `ValidationFailure` rather than surfaced as a raw parser error, so a
/// caller driving the Validation-Repair Loop can route it through the
/// repair ladder instead of aborting the whole request (`spec.md` §7).
pub fn run(
    provider: &dyn Provider,
    session: &Session,
    plan: &ConstraintPlan,
    acs: Option<&AcsSnapshot>,
    config: &Config,
    caches: &Caches,
    retry: &RetryPolicy,
    rng: &mut impl Rng,
) -> Result<DecodeResult, CdcError> {
    if plan.max_tokens == 0 {
        return Err(CdcError::Validation(budget_exhausted_failure()));
    }

    let artifact_key = if config.cache_enabled {
        let parts = artifact_cache_parts(plan);
        let refs: Vec<&str> = parts.iter().map(String::as_str).collect();
        let key = crate::cache::ArtifactCache::key_for(&refs);
        if let Some(cached) = caches.artifacts.get(key) {
            return Ok(DecodeResult {
                text: cached.to_string(),
                token_ids: Vec::new(),
            });
        }
        Some(key)
    } else {
        None
    };

    let grammar_key = session.grammar_key();
    let deadline = Instant::now() + plan.wall_clock_budget;
    let mut state = session.begin();
    let mut token_ids = Vec::new();
    let mut text = String::new();

    loop {
        if Instant::now() >= deadline {
            return Err(CdcError::Cancelled);
        }
        let mut mask = if config.cache_enabled {
            let state_key = state.structural_key();
            if let Some(cached) = caches.masks.get(grammar_key, state_key) {
                (*cached).clone()
            } else {
                let computed = session.mask(&state);
                caches.masks.insert(grammar_key, state_key, Arc::new(computed.clone()));
                computed
            }
        } else {
            session.mask(&state)
        };
        if let Some(snapshot) = acs {
            let fingerprint = session.fingerprint(&state);
            snapshot.blend_into(&mut mask, fingerprint);
        }
        if mask.is_empty() {
            break;
        }
        if matches!(session.shape(&state), StateShape::AcceptingOnly) && mask.len() == 1 {
            break;
        }
        let logits = call_with_retry(provider, &plan.prefix, &token_ids, retry)?;
        let Some(token_id) = sample(&logits, &mask, plan.temperature, rng) else {
            break;
        };
        if token_id == session.vocabulary().eos_token_id() {
            break;
        }
        state = match session.advance(&state, token_id) {
            Ok(next) => next,
            Err(err) => return Err(CdcError::Validation(parser_failure_as_validation(token_id, err))),
        };
        if let Some(piece) = session.vocabulary().token_string(token_id) {
            text.push_str(piece);
        }
        token_ids.push(token_id);
        if token_ids.len() >= plan.max_tokens {
            break;
        }
    }

    if let Some(key) = artifact_key {
        caches.artifacts.insert(key, Arc::from(text.as_str()));
    }

    Ok(DecodeResult { text, token_ids })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::grammar;
    use crate::vocabulary::{Token, Vocabulary};
    use ahash::AHashMap;
    use rand::SeedableRng;
    use std::sync::Arc;

    struct FixedProvider;

    impl Provider for FixedProvider {
        fn next_logits(&self, _prefix: &str, _emitted: &[u32]) -> Result<Vec<f32>, ProviderError> {
            Ok(vec![1.0, 1.0, 1.0, 1.0])
        }
    }

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
    fn decode_loop_terminates_and_respects_grammar() {
        let config = Config::default();
        let compiled =
            grammar::compile(r#"start ::= "return " NUMBER ; NUMBER ::= /[0-9]+/ ;"#, &config).unwrap();
        let session = Session::new(Arc::new(compiled), Arc::new(make_vocab()));
        let plan = ConstraintPlan {
            grammar_source: String::new(),
            language: "test".to_string(),
            prefix: String::new(),
            completion_offset: 0,
            max_tokens: 10,
            wall_clock_budget: Duration::from_secs(5),
            temperature: 0.0,
            forbidden_fragments: Vec::new(),
            injected_examples: Vec::new(),
            template_fallback: false,
            simplify: false,
        };
        let mut rng = rand::rngs::StdRng::seed_from_u64(0);
        let caches = crate::cache::Caches::new(&config.cache);
        let result = run(
            &FixedProvider,
            &session,
            &plan,
            None,
            &config,
            &caches,
            &RetryPolicy::default(),
            &mut rng,
        )
        .unwrap();
        assert!(result.text.starts_with("return "));
    }

    #[test]
    fn zero_max_tokens_is_a_budget_validation_failure() {
        let config = Config::default();
        let compiled = grammar::compile(r#"start ::= "return " NUMBER ; NUMBER ::= /[0-9]+/ ;"#, &config).unwrap();
        let session = Session::new(Arc::new(compiled), Arc::new(make_vocab()));
        let plan = ConstraintPlan {
            grammar_source: String::new(),
            language: "test".to_string(),
            prefix: String::new(),
            completion_offset: 0,
            max_tokens: 0,
            wall_clock_budget: Duration::from_secs(5),
            temperature: 0.0,
            forbidden_fragments: Vec::new(),
            injected_examples: Vec::new(),
            template_fallback: false,
            simplify: false,
        };
        let mut rng = rand::rngs::StdRng::seed_from_u64(0);
        let caches = crate::cache::Caches::new(&config.cache);
        let err = run(&FixedProvider, &session, &plan, None, &config, &caches, &RetryPolicy::default(), &mut rng)
            .unwrap_err();
        match err {
            CdcError::Validation(failure) => {
                assert!(failure.diagnostics.iter().any(|d| d.kind == DiagnosticKind::Budget));
            }
            other => panic!("expected a budget ValidationFailure, got {other:?}"),
        }
    }

    #[test]
    fn repeated_runs_reuse_the_mask_cache() {
        let config = Config::default();
        let compiled = grammar::compile(r#"start ::= "return " NUMBER ; NUMBER ::= /[0-9]+/ ;"#, &config).unwrap();
        let session = Session::new(Arc::new(compiled), Arc::new(make_vocab()));
        let plan = ConstraintPlan {
            grammar_source: String::new(),
            language: "test".to_string(),
            prefix: String::new(),
            completion_offset: 0,
            max_tokens: 10,
            wall_clock_budget: Duration::from_secs(5),
            temperature: 0.0,
            forbidden_fragments: Vec::new(),
            injected_examples: Vec::new(),
            template_fallback: false,
            simplify: false,
        };
        let caches = crate::cache::Caches::new(&config.cache);
        let mut rng_a = rand::rngs::StdRng::seed_from_u64(0);
        run(&FixedProvider, &session, &plan, None, &config, &caches, &RetryPolicy::default(), &mut rng_a).unwrap();
        let state_key = session.begin().structural_key();
        assert!(
            caches.masks.get(session.grammar_key(), state_key).is_some(),
            "the first decode step's mask should have been populated into the cache"
        );
    }
}
