//! The Validation–Repair Loop (`spec.md` §4.5): once a Decode Orchestrator
//! run produces a candidate artifact, external validators return
//! diagnostics; this module decides whether to accept, tighten the
//! constraint plan and retry, or give up once the repair budget is spent.
//!
//! Modeled as the explicit state machine `spec.md` §9 calls for
//! (`Running → Validating → Repairing → Running | Done | Failed`) rather
//! than scattering retries through the orchestrator, matching the way the
//! teacher keeps its own engine's control flow as an explicit loop over a
//! small state enum (`engine_base.rs`'s Earley-set advance loop) instead of
//! recursive descent.
use ahash::AHashMap;
use serde::{Deserialize, Serialize};

use crate::config::RepairConfig;
use crate::request::ConstraintPlan;

/// The category of problem a validator found, per `spec.md` §6.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
pub enum DiagnosticKind {
    /// syntax
    Syntax,
    /// type
    Type,
    /// test
    Test,
    /// lint
    Lint,
    /// security
    Security,
    /// budget
    Budget,
}

/// Severity of a [`Diagnostic`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Level {
    Error,
    Warning,
}

/// One finding from a [`Validator`] (`spec.md` §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    pub level: Level,
    pub location: Option<String>,
    pub message: String,
    pub suggested_fix: Option<String>,
    pub code: Option<String>,
}

/// Error-level diagnostics the repair loop could not clear within budget,
/// or any diagnostics at all on the first validation pass (`spec.md` §7:
/// "`ValidationFailure` is always recoverable up to the repair budget").
#[derive(Debug, Clone, thiserror::Error)]
#[error("{} diagnostic(s), {} at error level", diagnostics.len(), diagnostics.iter().filter(|d| d.level == Level::Error).count())]
pub struct ValidationFailure {
    pub diagnostics: Vec<Diagnostic>,
}

impl ValidationFailure {
    pub fn has_errors(&self) -> bool {
        self.diagnostics.iter().any(|d| d.level == Level::Error)
    }
}

/// External checker a candidate artifact is run through (`spec.md` §6).
/// The core never parses or type-checks the artifact itself — it only
/// consumes whatever diagnostics a `Validator` returns.
pub trait Validator {
    fn validate(&self, artifact: &str, language: &str, context: Option<&str>) -> Vec<Diagnostic>;
}

/// One rung of the repair ladder (`spec.md` §4.5), applied in order until
/// one produces a clean validation or the budget (`RepairConfig::max_attempts`)
/// is exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairStrategy {
    /// Narrow the grammar to forbid the exact failing construct.
    Tighten,
    /// Remove an overly permissive alternative identified by the diagnostic.
    Narrow,
    /// Inject a worked example into the prompt to steer the next attempt.
    InjectExample,
    /// Fall back to a known-good template for the target language.
    TemplateFallback,
    /// Ask for a strictly simpler artifact (fewer optional fields, etc).
    Simplify,
}

const LADDER: [RepairStrategy; 5] = [
    RepairStrategy::Tighten,
    RepairStrategy::Narrow,
    RepairStrategy::InjectExample,
    RepairStrategy::TemplateFallback,
    RepairStrategy::Simplify,
];

/// A record of one repair attempt, appended to the log and — on success —
/// promoted to a [`crate::acs::SoftConstraint`] (`spec.md` §3, §4.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepairRecord {
    pub attempt: u32,
    pub strategy: RepairStrategy,
    pub triggering: Vec<Diagnostic>,
    pub success: bool,
}

impl Serialize for RepairStrategy {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(match self {
            RepairStrategy::Tighten => "tighten",
            RepairStrategy::Narrow => "narrow",
            RepairStrategy::InjectExample => "inject_example",
            RepairStrategy::TemplateFallback => "template_fallback",
            RepairStrategy::Simplify => "simplify",
        })
    }
}

impl<'de> Deserialize<'de> for RepairStrategy {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        match s.as_str() {
            "tighten" => Ok(RepairStrategy::Tighten),
            "narrow" => Ok(RepairStrategy::Narrow),
            "inject_example" => Ok(RepairStrategy::InjectExample),
            "template_fallback" => Ok(RepairStrategy::TemplateFallback),
            "simplify" => Ok(RepairStrategy::Simplify),
            other => Err(serde::de::Error::unknown_variant(
                other,
                &["tighten", "narrow", "inject_example", "template_fallback", "simplify"],
            )),
        }
    }
}

/// The explicit state machine driving one repair loop (`spec.md` §9).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepairState {
    Running,
    Validating,
    Repairing { attempt: u32 },
    Done,
    Failed { attempts: u32 },
}

/// Outcome of running the repair loop to completion.
pub struct Outcome {
    pub state: RepairState,
    pub plan: ConstraintPlan,
    pub records: Vec<RepairRecord>,
    pub last_artifact: String,
}

/// Runs the validate → (accept | repair) loop starting from a freshly
/// produced `artifact` (`spec.md` §4.5).
///
/// `attempt_fn` reruns the decode loop under a refined plan and returns the
/// next candidate artifact; it is supplied by the caller (the Decode
/// Orchestrator) rather than called directly from here, keeping VRL's state
/// machine decoupled from DO's Provider generic.
pub fn repair(
    mut artifact: String,
    mut plan: ConstraintPlan,
    language: &str,
    context: Option<&str>,
    validator: &dyn Validator,
    config: &RepairConfig,
    mut attempt_fn: impl FnMut(&ConstraintPlan) -> Result<String, crate::decode::ProviderError>,
) -> Result<Outcome, crate::error::CdcError> {
    let mut records = Vec::new();
    let mut state = RepairState::Validating;
    let mut attempt: u32 = 0;

    loop {
        match state {
            RepairState::Validating => {
                let diagnostics = validator.validate(&artifact, language, context);
                let failing: Vec<_> = diagnostics.into_iter().filter(|d| d.level == Level::Error).collect();
                if failing.is_empty() {
                    state = RepairState::Done;
                } else if attempt >= config.max_attempts {
                    state = RepairState::Failed { attempts: attempt };
                    return Ok(Outcome {
                        state,
                        plan,
                        records,
                        last_artifact: artifact,
                    });
                } else {
                    state = RepairState::Repairing { attempt };
                    records.push(PendingFailure(failing).into());
                }
            }
            RepairState::Repairing { attempt: a } => {
                let strategy = LADDER[(a as usize).min(LADDER.len() - 1)];
                plan = plan.refine(strategy);
                artifact = attempt_fn(&plan)?;
                attempt = a + 1;
                if let Some(last) = records.last_mut() {
                    last.strategy = strategy;
                    last.attempt = attempt;
                }
                state = RepairState::Validating;
            }
            RepairState::Done => {
                if let Some(last) = records.last_mut() {
                    last.success = true;
                }
                return Ok(Outcome {
                    state,
                    plan,
                    records,
                    last_artifact: artifact,
                });
            }
            RepairState::Failed { .. } => unreachable!("returned directly above"),
            RepairState::Running => unreachable!("repair() always starts at Validating"),
        }
    }
}

/// A placeholder record created while the strategy/attempt for this failure
/// is still being decided; filled in once `Repairing` picks a rung.
struct PendingFailure(Vec<Diagnostic>);

impl From<PendingFailure> for RepairRecord {
    fn from(p: PendingFailure) -> Self {
        RepairRecord {
            attempt: 0,
            strategy: RepairStrategy::Tighten,
            triggering: p.0,
            success: false,
        }
    }
}

/// Per-diagnostic-kind penalty lookup used by the Adaptive Constraint Store
/// when a repair fails (`spec.md` §4.6); kept here so `acs` does not need to
/// know about [`Diagnostic`] internals beyond its `kind`.
pub fn penalty_for(kind: DiagnosticKind, table: &AHashMap<DiagnosticKind, f32>) -> f32 {
    table.get(&kind).copied().unwrap_or(0.1)
}
