//! Structured-dialect template engine
//!
//! The structured dialect is a mustache-like expression language with
//! dotted attribute access (`{{ .a.b.c }}`), conditionals
//! (`if` / `else if` / `else` / `end`), ranges, and prefix helper
//! functions (`ternary`, `index`, `default`, comparisons, boolean logic).
//!
//! It is implemented on minijinja behind a translation pass: each
//! `{{ ... }}` expression is rewritten into minijinja syntax
//! (`{% if %}`, `{% for %}`, function-call form) and rendered with the
//! helper functions registered on the environment. A parse error or an
//! unknown helper is a render error; undefined values render empty and are
//! falsy in conditionals.

use minijinja::value::{Rest, Value as TValue};
use minijinja::{Environment, ErrorKind, UndefinedBehavior};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::crd::ParamMap;
use crate::error::Error;

use super::flat::replace_legacy_flat;

/// One `{{ ... }}` expression, with optional trim markers
static EXPR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{-?\s*(.*?)\s*-?\}\}").expect("expression regex is valid"));

/// Structured-dialect engine
pub struct StructuredEngine {
    env: Environment<'static>,
}

impl Default for StructuredEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl StructuredEngine {
    /// Create an engine with the helper functions registered.
    pub fn new() -> Self {
        let mut env = Environment::new();
        // Undefined values render empty and chain through attribute access,
        // so `{{ if .hpa.enabled }}` is simply false when `hpa` is absent.
        env.set_undefined_behavior(UndefinedBehavior::Chainable);

        env.add_function("ternary", fn_ternary);
        env.add_function("index", fn_index);
        env.add_function("default", fn_default);
        env.add_function("len", fn_len);
        env.add_function("eq", fn_eq);
        env.add_function("ne", fn_ne);
        env.add_function("lt", fn_lt);
        env.add_function("le", fn_le);
        env.add_function("gt", fn_gt);
        env.add_function("ge", fn_ge);
        env.add_function("and", fn_and);
        env.add_function("or", fn_or);
        env.add_function("not", fn_not);
        env.add_function("print", fn_print);

        Self { env }
    }

    /// Render `template` with `params`, applying the legacy rewrite first
    /// when the input carries no structured construct.
    pub fn render(&self, template: &str, params: &ParamMap) -> Result<String, Error> {
        let upgraded = replace_legacy_flat(template);
        let translated = translate(&upgraded)?;
        self.env
            .render_str(&translated, TValue::from_serialize(params))
            .map_err(|e| match e.kind() {
                ErrorKind::SyntaxError => Error::template_parse(e.to_string()),
                _ => Error::template_execute(e.to_string()),
            })
    }
}

#[derive(Debug, PartialEq, Eq)]
enum BlockKind {
    If,
    For,
}

struct Scope {
    kind: BlockKind,
    /// Loop variable that `.`-relative paths resolve against
    dot: Option<String>,
    /// Declared index variable, mapped to minijinja's `loop.index0`
    index_alias: Option<String>,
}

/// Rewrite the whole template from the structured dialect into minijinja
/// syntax. Block balance is checked here so unterminated or stray blocks
/// surface as parse errors with positions the user can act on.
fn translate(input: &str) -> Result<String, Error> {
    let mut out = String::with_capacity(input.len());
    let mut scopes: Vec<Scope> = Vec::new();
    let mut loop_counter = 0usize;
    let mut last = 0usize;

    for caps in EXPR_RE.captures_iter(input) {
        let whole = caps.get(0).expect("match always has group 0");
        out.push_str(&input[last..whole.start()]);
        last = whole.end();

        // Templates usually arrive JSON-serialised, so string literals in
        // expressions carry escaped quotes
        let expr = caps.get(1).expect("expression group").as_str().replace("\\\"", "\"");
        let expr = expr.as_str();
        if expr == "end" {
            let scope = scopes
                .pop()
                .ok_or_else(|| Error::template_parse("unexpected {{ end }}"))?;
            out.push_str(match scope.kind {
                BlockKind::If => "{% endif %}",
                BlockKind::For => "{% endfor %}",
            });
        } else if expr == "else" {
            if !scopes.iter().rev().any(|s| s.kind == BlockKind::If) {
                return Err(Error::template_parse("{{ else }} outside of if block"));
            }
            out.push_str("{% else %}");
        } else if let Some(rest) = expr.strip_prefix("else if ") {
            let condition = translate_expression(rest, &scopes)?;
            out.push_str(&format!("{{% elif {condition} %}}"));
        } else if let Some(rest) = expr.strip_prefix("if ") {
            let condition = translate_expression(rest, &scopes)?;
            out.push_str(&format!("{{% if {condition} %}}"));
            scopes.push(Scope {
                kind: BlockKind::If,
                dot: None,
                index_alias: None,
            });
        } else if let Some(rest) = expr.strip_prefix("range ") {
            let (header, scope) = translate_range(rest, &scopes, &mut loop_counter)?;
            out.push_str(&header);
            scopes.push(scope);
        } else {
            let value = translate_expression(expr, &scopes)?;
            out.push_str(&format!("{{{{ {value} }}}}"));
        }
    }
    out.push_str(&input[last..]);

    if !scopes.is_empty() {
        return Err(Error::template_parse("unterminated block, missing {{ end }}"));
    }
    Ok(out)
}

/// Translate a `range` clause. Supported forms:
///
/// - `range .items` - `.`-relative paths in the body refer to the element
/// - `range $e := .items`
/// - `range $i, $e := .items`
fn translate_range(
    clause: &str,
    scopes: &[Scope],
    loop_counter: &mut usize,
) -> Result<(String, Scope), Error> {
    if let Some((vars, expr)) = clause.split_once(":=") {
        let names: Vec<&str> = vars.split(',').map(str::trim).collect();
        let source = translate_expression(expr.trim(), scopes)?;
        match names.as_slice() {
            [element] => {
                let element = strip_variable(element)?;
                Ok((
                    format!("{{% for {element} in {source} %}}"),
                    Scope {
                        kind: BlockKind::For,
                        // range rebinds `.` to the element even when a
                        // variable is declared
                        dot: Some(element),
                        index_alias: None,
                    },
                ))
            }
            [index, element] => {
                let index = strip_variable(index)?;
                let element = strip_variable(element)?;
                Ok((
                    format!("{{% for {element} in {source} %}}"),
                    Scope {
                        kind: BlockKind::For,
                        dot: Some(element),
                        index_alias: Some(index),
                    },
                ))
            }
            _ => Err(Error::template_parse(format!(
                "range declares too many variables: {clause}"
            ))),
        }
    } else {
        let source = translate_expression(clause.trim(), scopes)?;
        *loop_counter += 1;
        let element = format!("_dot{loop_counter}");
        Ok((
            format!("{{% for {element} in {source} %}}"),
            Scope {
                kind: BlockKind::For,
                dot: Some(element),
                index_alias: None,
            },
        ))
    }
}

fn strip_variable(name: &str) -> Result<String, Error> {
    name.strip_prefix('$')
        .filter(|rest| !rest.is_empty() && rest.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'))
        .map(str::to_string)
        .ok_or_else(|| Error::template_parse(format!("invalid range variable: {name}")))
}

/// Translate one expression: either a single operand or a prefix helper
/// call (`ternary "a" "b" .cond` becomes `ternary("a", "b", cond)`).
fn translate_expression(expr: &str, scopes: &[Scope]) -> Result<String, Error> {
    let tokens = tokenize(expr)?;
    match tokens.as_slice() {
        [] => Err(Error::template_parse("empty expression")),
        [single] => translate_operand(single, scopes),
        [head, args @ ..] if is_bare_identifier(head) => {
            let translated: Vec<String> = args
                .iter()
                .map(|a| translate_operand(a, scopes))
                .collect::<Result<_, _>>()?;
            Ok(format!("{head}({})", translated.join(", ")))
        }
        _ => Err(Error::template_parse(format!(
            "cannot parse expression: {expr}"
        ))),
    }
}

/// Split an expression into tokens on whitespace, honouring quoted strings
/// and parenthesised groups.
fn tokenize(expr: &str) -> Result<Vec<String>, Error> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;
    let mut in_string = false;

    for c in expr.chars() {
        match c {
            '"' => {
                in_string = !in_string;
                current.push(c);
            }
            '(' if !in_string => {
                depth += 1;
                current.push(c);
            }
            ')' if !in_string => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| Error::template_parse("unbalanced parentheses"))?;
                current.push(c);
            }
            c if c.is_whitespace() && !in_string && depth == 0 => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if in_string {
        return Err(Error::template_parse("unterminated string literal"));
    }
    if depth != 0 {
        return Err(Error::template_parse("unbalanced parentheses"));
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    Ok(tokens)
}

fn is_bare_identifier(token: &str) -> bool {
    !token.is_empty()
        && !token.starts_with(|c: char| c.is_ascii_digit())
        && token.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && token != "true"
        && token != "false"
}

/// Translate one operand of an expression.
fn translate_operand(token: &str, scopes: &[Scope]) -> Result<String, Error> {
    let dot = scopes.iter().rev().find_map(|s| s.dot.as_deref());

    if token.starts_with('"') {
        return Ok(token.to_string());
    }
    if let Some(inner) = token.strip_prefix('(').and_then(|t| t.strip_suffix(')')) {
        return Ok(format!("({})", translate_expression(inner, scopes)?));
    }
    if token == "." {
        return dot.map(str::to_string).ok_or_else(|| {
            Error::template_parse("bare '.' is only meaningful inside a range body")
        });
    }
    if let Some(path) = token.strip_prefix("$.") {
        // `$.` escapes back to the root context inside a range body
        return Ok(path.to_string());
    }
    if let Some(name) = token.strip_prefix('$') {
        for scope in scopes.iter().rev() {
            if scope.index_alias.as_deref() == Some(name) {
                return Ok("loop.index0".to_string());
            }
        }
        return Ok(name.to_string());
    }
    if let Some(path) = token.strip_prefix('.') {
        return Ok(match dot {
            Some(d) => format!("{d}.{path}"),
            None => path.to_string(),
        });
    }
    // Numbers, booleans, and bare names pass through
    Ok(token.to_string())
}

// ---------------------------------------------------------------------------
// Helper functions registered on the environment
// ---------------------------------------------------------------------------

fn fn_ternary(true_value: TValue, false_value: TValue, condition: TValue) -> TValue {
    if condition.is_true() {
        true_value
    } else {
        false_value
    }
}

fn fn_index(base: TValue, keys: Rest<TValue>) -> Result<TValue, minijinja::Error> {
    let mut current = base;
    for key in keys.0 {
        current = current.get_item(&key)?;
    }
    Ok(current)
}

fn fn_default(default: TValue, value: Option<TValue>) -> TValue {
    match value {
        Some(v) if !v.is_undefined() && !v.is_none() && v.is_true() => v,
        _ => default,
    }
}

fn fn_len(value: TValue) -> usize {
    value.len().unwrap_or(0)
}

fn fn_eq(a: TValue, b: TValue) -> bool {
    a == b
}

fn fn_ne(a: TValue, b: TValue) -> bool {
    a != b
}

fn compare(a: &TValue, b: &TValue) -> Option<std::cmp::Ordering> {
    let a = serde_json::to_value(a).ok()?;
    let b = serde_json::to_value(b).ok()?;
    match (&a, &b) {
        (serde_json::Value::Number(x), serde_json::Value::Number(y)) => {
            x.as_f64().partial_cmp(&y.as_f64())
        }
        (serde_json::Value::String(x), serde_json::Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn fn_lt(a: TValue, b: TValue) -> bool {
    matches!(compare(&a, &b), Some(std::cmp::Ordering::Less))
}

fn fn_le(a: TValue, b: TValue) -> bool {
    matches!(
        compare(&a, &b),
        Some(std::cmp::Ordering::Less | std::cmp::Ordering::Equal)
    )
}

fn fn_gt(a: TValue, b: TValue) -> bool {
    matches!(compare(&a, &b), Some(std::cmp::Ordering::Greater))
}

fn fn_ge(a: TValue, b: TValue) -> bool {
    matches!(
        compare(&a, &b),
        Some(std::cmp::Ordering::Greater | std::cmp::Ordering::Equal)
    )
}

/// Returns the first falsy argument, or the last argument when all are
/// truthy (so `and` can be used for both logic and value selection).
fn fn_and(args: Rest<TValue>) -> TValue {
    let mut last = TValue::from(true);
    for arg in args.0 {
        if !arg.is_true() {
            return arg;
        }
        last = arg;
    }
    last
}

/// Returns the first truthy argument, or the last argument when none are.
fn fn_or(args: Rest<TValue>) -> TValue {
    let mut last = TValue::from(false);
    for arg in args.0 {
        if arg.is_true() {
            return arg;
        }
        last = arg;
    }
    last
}

fn fn_not(value: TValue) -> bool {
    !value.is_true()
}

fn fn_print(args: Rest<TValue>) -> String {
    args.0
        .iter()
        .map(|v| match v.as_str() {
            Some(s) => s.to_string(),
            None => v.to_string(),
        })
        .collect::<Vec<_>>()
        .join("")
}
