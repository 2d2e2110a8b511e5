//! The Request Compiler (`spec.md` §4.7): turns a caller's raw request for
//! one artifact into a [`ConstraintPlan`] the Decode Orchestrator can drive —
//! resolving which grammar to compile, where in the prompt a completion
//! should start, and how the repair ladder is allowed to refine the plan.
use std::time::Duration;

use crate::repair::RepairStrategy;

/// What a caller actually wants generated (`spec.md` §3).
#[derive(Debug, Clone)]
pub struct RawRequest {
    /// The target language's name, passed through to [`crate::repair::Validator`].
    pub language: String,
    /// The prompt/context already established before generation starts.
    pub prefix: String,
    /// Free-form type/context information available to an [`Indexer`] when
    /// narrowing completion candidates (e.g. the enclosing function's
    /// signature, imports already in scope).
    pub type_context: TypeContext,
    /// Per-request overrides of the engine-wide defaults in [`crate::config::Config`].
    pub options: RequestOptions,
}

/// Contextual hints an [`Indexer`] can use to narrow what identifiers or
/// members are completable at the current position, independent of the
/// grammar itself (`spec.md` §4.7).
#[derive(Debug, Clone, Default)]
pub struct TypeContext {
    /// The name of the enclosing symbol, if any (function, class, module).
    pub enclosing_symbol: Option<String>,
    /// Identifiers already known to be in scope.
    pub symbols_in_scope: Vec<String>,
}

/// Per-request knobs that override [`crate::config::Config`]'s defaults.
#[derive(Debug, Clone)]
pub struct RequestOptions {
    pub max_tokens: Option<usize>,
    pub wall_clock_budget: Option<Duration>,
    pub temperature: Option<f32>,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            max_tokens: None,
            wall_clock_budget: None,
            temperature: None,
        }
    }
}

/// Looks up symbol/member candidates available at a completion point — the
/// seam a caller plugs a project-specific symbol table or LSP client into
/// (`spec.md` §4.7, Open Question 2).
pub trait Indexer {
    /// Returns candidate identifiers legal at `context`, narrowing what the
    /// grammar alone would allow. An empty vec means "defer entirely to the
    /// grammar" — this is advisory, never a hard filter.
    fn candidates(&self, context: &TypeContext) -> Vec<String>;
}

/// Recognizes where, inside a partially-written artifact, a new completion
/// should begin (`spec.md` §4.7). The engine ships two built-in cue sets;
/// callers can supply their own for languages with different block syntax.
pub trait CompletionCue {
    /// Returns the byte offset a completion should resume from, or `None` if
    /// no recognized cue is present.
    fn detect(&self, source: &str) -> Option<usize>;
}

/// Cues completion at the position right after an unmatched opening `{`.
pub struct CurlyCue;

impl CompletionCue for CurlyCue {
    fn detect(&self, source: &str) -> Option<usize> {
        let mut depth: i32 = 0;
        let mut last_unmatched_open = None;
        for (idx, ch) in source.char_indices() {
            match ch {
                '{' => {
                    depth += 1;
                    last_unmatched_open = Some(idx + 1);
                }
                '}' => {
                    depth -= 1;
                    if depth <= 0 {
                        last_unmatched_open = None;
                    }
                }
                _ => {}
            }
        }
        if depth > 0 {
            last_unmatched_open
        } else {
            None
        }
    }
}

/// Cues completion at the start of the line following a trailing `:` —
/// indentation-delimited blocks (Python-style).
pub struct ColonIndentCue;

impl CompletionCue for ColonIndentCue {
    fn detect(&self, source: &str) -> Option<usize> {
        let trimmed_end = source.trim_end_matches(['\n', '\r', ' ', '\t']);
        if trimmed_end.ends_with(':') {
            Some(source.len())
        } else {
            None
        }
    }
}

/// Finds the byte offset a completion should start from, trying `cues` in
/// order and returning the first match (falling back to end-of-source).
pub fn detect_completion(source: &str, cues: &[&dyn CompletionCue]) -> usize {
    for cue in cues {
        if let Some(offset) = cue.detect(source) {
            return offset;
        }
    }
    source.len()
}

/// The compiled plan the Decode Orchestrator executes, and the repair ladder
/// refines (`spec.md` §3, §4.5). Each refinement produces a new,
/// strictly-more-constrained successor rather than mutating in place, so a
/// `RepairRecord` can always be replayed against the plan it was produced
/// from.
#[derive(Debug, Clone)]
pub struct ConstraintPlan {
    pub grammar_source: String,
    pub language: String,
    pub prefix: String,
    pub completion_offset: usize,
    pub max_tokens: usize,
    pub wall_clock_budget: Duration,
    pub temperature: f32,
    /// Extra forbidden literal substrings accumulated by `Tighten`/`Narrow`
    /// repair steps; re-applied by whatever builds the grammar for this plan.
    pub forbidden_fragments: Vec<String>,
    /// Worked examples injected by `InjectExample`, prepended to the prompt
    /// on the next attempt.
    pub injected_examples: Vec<String>,
    /// Set once `TemplateFallback` fires; short-circuits further grammar
    /// compilation in favor of a known-good skeleton for `language`.
    pub template_fallback: bool,
    /// Set once `Simplify` fires; asks the next attempt for a minimal
    /// artifact (fewer optional constructs).
    pub simplify: bool,
}

impl ConstraintPlan {
    /// Produces the successor plan for one rung of the repair ladder
    /// (`spec.md` §4.5). Each rung only adds constraints; it never backs off
    /// a previous rung's effect, which is what keeps the repair loop from
    /// oscillating between two plans forever.
    pub fn refine(&self, strategy: RepairStrategy) -> Self {
        let mut next = self.clone();
        match strategy {
            RepairStrategy::Tighten => {
                let fragment = format!("__attempt_{}", next.forbidden_fragments.len());
                next.grammar_source = forbid_fragment(&next.grammar_source, &fragment);
                next.forbidden_fragments.push(fragment);
            }
            RepairStrategy::Narrow => {
                next.max_tokens = next.max_tokens.saturating_sub(next.max_tokens / 8).max(1);
            }
            RepairStrategy::InjectExample => {
                let example = "// previous attempt failed validation; follow this shape closely".to_string();
                next.prefix = format!("{}\n{}", next.prefix, example);
                next.grammar_source = inject_example_comment(&next.grammar_source, &example);
                next.injected_examples.push(example);
            }
            RepairStrategy::TemplateFallback => {
                next.grammar_source = template_fallback_grammar(&next.language);
                next.template_fallback = true;
            }
            RepairStrategy::Simplify => {
                next.grammar_source = simplify_grammar(&next.grammar_source);
                next.simplify = true;
            }
        }
        next
    }
}

/// Drops every rule line that spells `fragment` as a quoted literal, then
/// appends a marker comment, so `Tighten` can no longer select a forbidden
/// construct on the next compile.
fn forbid_fragment(source: &str, fragment: &str) -> String {
    let quoted = format!("\"{fragment}\"");
    let retained: Vec<&str> = source.lines().filter(|line| !line.contains(&quoted)).collect();
    let mut rewritten = retained.join("\n");
    rewritten.push_str(&format!("\n# forbidden: {fragment}"));
    rewritten
}

/// Splices a worked-example comment onto the grammar text, mirroring the
/// example pushed onto the prompt — so the next compile still carries the
/// example even for callers that only look at `grammar_source`.
fn inject_example_comment(source: &str, example: &str) -> String {
    format!("{source}\n# example: {example}")
}

/// A minimal known-good grammar for `language`, swapped in wholesale once
/// `TemplateFallback` fires.
fn template_fallback_grammar(language: &str) -> String {
    match language {
        "json" => r#"start ::= "{" "}" ;"#.to_string(),
        "python" => r#"start ::= "pass" ;"#.to_string(),
        _ => r#"start ::= "ok" ;"#.to_string(),
    }
}

/// Drops one optional construct from `source` — a parenthesized `(...)?`
/// group if one is present, otherwise a single bare `atom?`/`"literal"?` —
/// so `Simplify` asks the next attempt for a strictly less optional artifact.
fn simplify_grammar(source: &str) -> String {
    if let Some(reduced) = drop_one_optional_group(source) {
        return reduced;
    }
    let Some(qmark) = source.find('?') else {
        return source.to_string();
    };
    let head = &source[..qmark];
    let atom_start = head
        .rfind(|c: char| !(c.is_alphanumeric() || c == '_' || c == '"'))
        .map(|i| i + 1)
        .unwrap_or(0);
    format!("{}{}", &source[..atom_start], &source[qmark + 1..])
}

/// Finds the first balanced `(...)?` span — a parenthesized group
/// immediately followed by `?` — and removes it entirely.
fn drop_one_optional_group(source: &str) -> Option<String> {
    let bytes = source.as_bytes();
    let mut depth = 0i32;
    let mut open_idx = None;
    for (i, &b) in bytes.iter().enumerate() {
        match b {
            b'(' => {
                if depth == 0 {
                    open_idx = Some(i);
                }
                depth += 1;
            }
            b')' => {
                depth -= 1;
                if depth == 0 {
                    if let Some(open) = open_idx {
                        if bytes.get(i + 1) == Some(&b'?') {
                            return Some(format!("{}{}", &source[..open], &source[i + 2..]));
                        }
                    }
                }
            }
            _ => {}
        }
    }
    None
}

/// Compiles a [`RawRequest`] into a [`ConstraintPlan`] (`spec.md` §4.7).
/// `grammar_source` is the already-assembled grammar text for the target
/// language/artifact kind — selecting or templating that text is a concern
/// of the caller's language binding, not of this module.
pub fn compile_request(
    request: &RawRequest,
    grammar_source: String,
    config: &crate::config::Config,
    cues: &[&dyn CompletionCue],
) -> ConstraintPlan {
    let completion_offset = detect_completion(&request.prefix, cues);
    ConstraintPlan {
        grammar_source,
        language: request.language.clone(),
        prefix: request.prefix.clone(),
        completion_offset,
        max_tokens: request.options.max_tokens.unwrap_or(config.default_max_tokens),
        wall_clock_budget: request
            .options
            .wall_clock_budget
            .unwrap_or(config.default_wall_clock_budget),
        temperature: request.options.temperature.unwrap_or(config.default_temperature),
        forbidden_fragments: Vec::new(),
        injected_examples: Vec::new(),
        template_fallback: false,
        simplify: false,
    }
}
