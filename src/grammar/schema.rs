//! Expansion of the `%schema` directive (`spec.md` §4.1, §6) into ordinary
//! grammar rules: a minimal JSON-Schema subset (`object`/`properties`/
//! `required`, `array`/`items`, `string`/`enum`, `integer`, `number`,
//! `boolean`, `null`, `oneOf`/`anyOf`) compiled down to the same
//! [`Factor`]/[`Atom`] vocabulary the surface dialect itself produces, so
//! the rest of the compiler never needs to know a rule originated from a
//! schema rather than from hand-written grammar text.
use std::collections::HashMap;

use ahash::AHashMap;

use super::dialect::{Atom, Factor, Postfix, TerminalDef};

#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    /// The `%schema` body used a JSON-Schema feature this compiler does not
    /// lower (`spec.md` §4.1's subset is intentionally small).
    #[error("unsupported schema construct at `{0}`: {1}")]
    Unsupported(String, &'static str),
    /// A `type` keyword held a value that was not a known JSON type name.
    #[error("unknown schema type `{0}` at `{1}`")]
    UnknownType(String, String),
}

pub(crate) struct Expander<'a> {
    rules: &'a mut AHashMap<String, Vec<Vec<Factor>>>,
    terminals: &'a mut AHashMap<String, TerminalDef>,
    order: &'a mut Vec<String>,
    fresh_counter: u32,
    /// The document a `$ref` JSON pointer is resolved against — the
    /// top-level schema passed to [`Expander::expand`], cloned once so
    /// `$ref` targets can be looked up while the rest of the document is
    /// still being walked.
    root: serde_json::Value,
    /// Maps an already-resolved `$ref` pointer to the rule name standing
    /// for it. Populated *before* the referenced schema is expanded, so a
    /// cycle back to the same pointer reuses this name instead of
    /// re-expanding forever (`SPEC_FULL.md` §4.1).
    ref_names: HashMap<String, String>,
}

impl<'a> Expander<'a> {
    pub(crate) fn new(
        rules: &'a mut AHashMap<String, Vec<Vec<Factor>>>,
        terminals: &'a mut AHashMap<String, TerminalDef>,
        order: &'a mut Vec<String>,
    ) -> Self {
        Self {
            rules,
            terminals,
            order,
            fresh_counter: 0,
            root: serde_json::Value::Null,
            ref_names: HashMap::new(),
        }
    }

    fn fresh_rule_name(&mut self, hint: &str) -> String {
        self.fresh_counter += 1;
        format!("__schema_{}_{}", sanitize(hint), self.fresh_counter)
    }

    fn fresh_terminal_name(&mut self, hint: &str) -> String {
        self.fresh_counter += 1;
        format!("__SCHEMA_{}_{}", sanitize(hint).to_uppercase(), self.fresh_counter)
    }

    fn literal(text: impl Into<String>) -> Factor {
        Factor {
            atom: Atom::Literal(text.into()),
            postfix: Postfix::None,
        }
    }

    fn define_rule(&mut self, name: String, alternatives: Vec<Vec<Factor>>) {
        self.order.push(name.clone());
        self.rules.insert(name, alternatives);
    }

    fn define_terminal(&mut self, name: String, def: TerminalDef) {
        self.order.push(name.clone());
        self.terminals.insert(name, def);
    }

    /// Expands `schema` into one or more synthetic rules, returning the
    /// name of the rule that stands for `schema` as a whole.
    pub(crate) fn expand(
        &mut self,
        pointer: &str,
        schema: &serde_json::Value,
    ) -> Result<String, SchemaError> {
        self.root = schema.clone();
        self.expand_inner(pointer, schema)
    }

    fn expand_inner(
        &mut self,
        hint: &str,
        schema: &serde_json::Value,
    ) -> Result<String, SchemaError> {
        if let Some(pointer) = schema.get("$ref").and_then(|v| v.as_str()) {
            return self.expand_ref(hint, pointer);
        }
        if let Some(variants) = schema.get("enum").and_then(|v| v.as_array()) {
            return self.expand_enum(hint, variants);
        }
        if let Some(branches) = schema.get("oneOf").or_else(|| schema.get("anyOf")) {
            let branches = branches
                .as_array()
                .ok_or_else(|| SchemaError::Unsupported(hint.to_string(), "oneOf/anyOf must be an array"))?;
            return self.expand_union(hint, branches);
        }
        let ty = schema
            .get("type")
            .and_then(|v| v.as_str())
            .unwrap_or("object");
        match ty {
            "object" => self.expand_object(hint, schema),
            "array" => self.expand_array(hint, schema),
            "string" => self.expand_string(hint),
            "integer" => self.expand_regex_terminal(hint, "integer", r"-?[0-9]+"),
            "number" => self.expand_regex_terminal(hint, "number", r"-?[0-9]+(\.[0-9]+)?"),
            "boolean" => {
                let name = self.fresh_rule_name(hint);
                self.define_rule(
                    name.clone(),
                    vec![vec![Self::literal("true")], vec![Self::literal("false")]],
                );
                Ok(name)
            }
            "null" => {
                let name = self.fresh_rule_name(hint);
                self.define_rule(name.clone(), vec![vec![Self::literal("null")]]);
                Ok(name)
            }
            other => Err(SchemaError::UnknownType(other.to_string(), hint.to_string())),
        }
    }

    /// Resolves a `$ref` JSON pointer against [`Expander::root`], reusing
    /// the rule already minted for `pointer` if it has been seen before
    /// (directly or through a cycle) rather than re-expanding its target.
    fn expand_ref(&mut self, hint: &str, pointer: &str) -> Result<String, SchemaError> {
        let normalized = normalize_pointer(pointer);
        if let Some(existing) = self.ref_names.get(&normalized) {
            return Ok(existing.clone());
        }
        let name = self.fresh_rule_name(hint);
        // Reserve the name before recursing: a schema that refers back to
        // `pointer` while we are still expanding its target hits the branch
        // above and gets this same name, which is what makes a recursive
        // `$ref` terminate instead of looping forever.
        self.ref_names.insert(normalized.clone(), name.clone());
        let target = resolve_pointer(&self.root, &normalized)
            .ok_or_else(|| SchemaError::Unsupported(pointer.to_string(), "$ref did not resolve within the schema document"))?
            .clone();
        let inner = self.expand_inner(hint, &target)?;
        self.define_rule(
            name.clone(),
            vec![vec![Factor {
                atom: Atom::Ref(inner),
                postfix: Postfix::None,
            }]],
        );
        Ok(name)
    }

    fn expand_enum(
        &mut self,
        hint: &str,
        variants: &[serde_json::Value],
    ) -> Result<String, SchemaError> {
        let name = self.fresh_rule_name(hint);
        let mut alts = Vec::with_capacity(variants.len());
        for v in variants {
            let literal = serde_json::to_string(v).map_err(|_| {
                SchemaError::Unsupported(hint.to_string(), "enum value was not serializable")
            })?;
            alts.push(vec![Self::literal(literal)]);
        }
        self.define_rule(name.clone(), alts);
        Ok(name)
    }

    fn expand_union(
        &mut self,
        hint: &str,
        branches: &[serde_json::Value],
    ) -> Result<String, SchemaError> {
        let name = self.fresh_rule_name(hint);
        let mut alts = Vec::with_capacity(branches.len());
        for (i, branch) in branches.iter().enumerate() {
            let branch_hint = format!("{hint}_{i}");
            let sub = self.expand_inner(&branch_hint, branch)?;
            alts.push(vec![Factor {
                atom: Atom::Ref(sub),
                postfix: Postfix::None,
            }]);
        }
        self.define_rule(name.clone(), alts);
        Ok(name)
    }

    fn expand_string(&mut self, hint: &str) -> Result<String, SchemaError> {
        self.expand_regex_terminal(hint, "string", r#""([^"\\]|\\.)*""#)
    }

    fn expand_regex_terminal(
        &mut self,
        hint: &str,
        kind: &str,
        pattern: &str,
    ) -> Result<String, SchemaError> {
        let terminal_name = self.fresh_terminal_name(&format!("{hint}_{kind}"));
        self.define_terminal(terminal_name.clone(), TerminalDef::Regex(pattern.to_string()));
        let rule_name = self.fresh_rule_name(hint);
        self.define_rule(
            rule_name.clone(),
            vec![vec![Factor {
                atom: Atom::Ref(terminal_name),
                postfix: Postfix::None,
            }]],
        );
        Ok(rule_name)
    }

    fn expand_object(
        &mut self,
        hint: &str,
        schema: &serde_json::Value,
    ) -> Result<String, SchemaError> {
        let properties = schema
            .get("properties")
            .and_then(|v| v.as_object())
            .cloned()
            .unwrap_or_default();
        let required: Vec<String> = schema
            .get("required")
            .and_then(|v| v.as_array())
            .map(|a| {
                a.iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();

        let mut fields: Vec<Vec<Factor>> = Vec::new();
        let mut first = true;
        for (key, value_schema) in properties.iter() {
            if !required.iter().any(|r| r == key) {
                return Err(SchemaError::Unsupported(
                    format!("{hint}/{key}"),
                    "declared-but-not-required object properties have no canonical BNF ordering",
                ));
            }
            let mut field = Vec::new();
            if !first {
                field.push(Self::literal(","));
            }
            first = false;
            field.push(Self::literal(format!("\"{key}\":")));
            let sub_hint = format!("{hint}_{key}");
            let sub_name = self.expand_inner(&sub_hint, value_schema)?;
            field.push(Factor {
                atom: Atom::Ref(sub_name),
                postfix: Postfix::None,
            });
            fields.push(field);
        }
        let name = self.fresh_rule_name(hint);
        let mut body = vec![Self::literal("{")];
        for field in fields {
            body.extend(field);
        }
        body.push(Self::literal("}"));
        self.define_rule(name.clone(), vec![body]);
        Ok(name)
    }

    fn expand_array(
        &mut self,
        hint: &str,
        schema: &serde_json::Value,
    ) -> Result<String, SchemaError> {
        let items = schema
            .get("items")
            .cloned()
            .unwrap_or(serde_json::json!({"type": "string"}));
        let item_hint = format!("{hint}_item");
        let item_rule = self.expand_inner(&item_hint, &items)?;

        let tail_name = self.fresh_rule_name(&format!("{hint}_tail"));
        self.define_rule(
            tail_name.clone(),
            vec![
                vec![
                    Self::literal(","),
                    Factor {
                        atom: Atom::Ref(item_rule.clone()),
                        postfix: Postfix::None,
                    },
                    Factor {
                        atom: Atom::Ref(tail_name.clone()),
                        postfix: Postfix::None,
                    },
                ],
                vec![],
            ],
        );
        let body_name = self.fresh_rule_name(&format!("{hint}_body"));
        self.define_rule(
            body_name.clone(),
            vec![
                vec![
                    Factor {
                        atom: Atom::Ref(item_rule),
                        postfix: Postfix::None,
                    },
                    Factor {
                        atom: Atom::Ref(tail_name),
                        postfix: Postfix::None,
                    },
                ],
                vec![],
            ],
        );
        let name = self.fresh_rule_name(hint);
        self.define_rule(
            name.clone(),
            vec![vec![
                Self::literal("["),
                Factor {
                    atom: Atom::Ref(body_name),
                    postfix: Postfix::None,
                },
                Self::literal("]"),
            ]],
        );
        Ok(name)
    }
}

fn sanitize(hint: &str) -> String {
    hint.chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect()
}

/// Strips a leading `#` so `"#/$defs/Node"` and `"/$defs/Node"` resolve to
/// the same cache entry.
fn normalize_pointer(pointer: &str) -> String {
    pointer.strip_prefix('#').unwrap_or(pointer).to_string()
}

/// Resolves an RFC-6901 JSON pointer against `root`. `""`, `"/"`, and `"#"`
/// (already stripped by [`normalize_pointer`]) all resolve to `root` itself.
fn resolve_pointer<'a>(root: &'a serde_json::Value, pointer: &str) -> Option<&'a serde_json::Value> {
    let trimmed = pointer.trim_start_matches('/');
    if trimmed.is_empty() {
        return Some(root);
    }
    let mut current = root;
    for raw in trimmed.split('/') {
        let segment = raw.replace("~1", "/").replace("~0", "~");
        current = match current {
            serde_json::Value::Object(map) => map.get(&segment)?,
            serde_json::Value::Array(arr) => arr.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}
