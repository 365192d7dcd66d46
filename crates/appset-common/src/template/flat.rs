//! Flat-dialect substitution and legacy template rewriting
//!
//! The flat dialect replaces every `{{ key }}` occurrence with the
//! stringified parameter value in a single, non-recursive pass. Unresolved
//! placeholders are left byte-identical (historical behaviour, not an
//! error). The legacy rewriter upgrades flat placeholders to structured
//! dotted-path syntax; it is skipped whenever the template already contains
//! a structured-dialect construct.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::crd::ParamMap;

/// Any `{{ ... }}` placeholder, with optional surrounding whitespace
static TOKEN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{\s*([^{}]+?)\s*\}\}").expect("placeholder regex is valid"));

/// Legacy `{{ path[n] }}` form
static PATH_INDEX_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^path\[(\d+)\]$").expect("path index regex is valid"));

/// Legacy `{{ path[n] }}` placeholders, for the whole-template rewrite
static PATH_INDEX_TOKEN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{\{\s*path\[(\d+)\]\s*\}\}").expect("path index token regex is valid")
});

/// Legacy `{{ path }}` placeholders, for the whole-template rewrite
static PATH_TOKEN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{\s*path\s*\}\}").expect("path token regex is valid"));

/// Detects structured-dialect constructs inside `{{ ... }}`: keywords,
/// helpers, quoted literals, variables, and leading-dot attribute paths.
/// Compiled once per process; the keyword list mirrors the expression
/// language the structured engine accepts.
static STRUCTURED_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"\{\{-?\s*(?:if\s|else\b|end\b|range\s|with\s|and\s|or\s|not\s|eq\s|ne\s|lt\s|le\s|gt\s|ge\s|len\s|index\s|ternary\s|default\s|print\s|printf\s|template\s|define\s|block\s|nil\b|"|\$|\.)"#,
    )
    .expect("structured-construct regex is valid")
});

/// True if the template contains any structured-dialect construct.
pub fn is_structured_template(input: &str) -> bool {
    STRUCTURED_RE.is_match(input)
}

/// Rewrite legacy flat placeholders into structured dotted-path syntax:
///
/// - `{{ path[n] }}` becomes `{{ .path.segments[n] }}`
/// - `{{ path }}` becomes `{{ .path.path }}`
/// - any other `{{ token }}` without a leading dot becomes `{{ .token }}`
///
/// A template already containing structured constructs is returned
/// unchanged.
pub fn replace_legacy_flat(input: &str) -> String {
    if is_structured_template(input) {
        return input.to_string();
    }

    let tmp = PATH_INDEX_TOKEN_RE.replace_all(input, "{{ .path.segments[$1] }}");
    let tmp = PATH_TOKEN_RE.replace_all(&tmp, "{{ .path.path }}");
    TOKEN_RE
        .replace_all(&tmp, |caps: &regex::Captures<'_>| {
            let token = &caps[1];
            if token.starts_with('.') {
                caps[0].to_string()
            } else {
                format!("{{{{ .{token} }}}}")
            }
        })
        .into_owned()
}

/// Substitute flat placeholders in `text` from `params`.
///
/// The pass is non-recursive: replacement values are never rescanned for
/// placeholders. Unresolved placeholders stay exactly as written. When
/// `escape_json` is set, replacement values are escaped for embedding in a
/// JSON string (the renderer substitutes on the JSON-serialised template).
pub fn substitute(text: &str, params: &ParamMap, escape_json: bool) -> String {
    TOKEN_RE
        .replace_all(text, |caps: &regex::Captures<'_>| {
            match lookup(params, &caps[1]) {
                Some(value) => {
                    let rendered = stringify(&value);
                    if escape_json {
                        escape_json_string(&rendered)
                    } else {
                        rendered
                    }
                }
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// Resolve a placeholder token against the parameter map.
///
/// The legacy aliases `path` -> `path.path` and `path[n]` ->
/// `path.segments[n]` are tried first; when they don't resolve (the
/// producer emitted flat keys) the literal key wins, and finally the token
/// is treated as a dotted path into nested maps.
fn lookup(params: &ParamMap, token: &str) -> Option<Value> {
    if let Some(rest) = token.strip_prefix('.') {
        return resolve_path(params, rest);
    }

    let alias = legacy_alias(token);
    if alias != token {
        if let Some(value) = resolve_path(params, &alias) {
            return Some(value);
        }
    }

    if let Some(value) = params.get(token) {
        return Some(value.clone());
    }
    resolve_path(params, token)
}

fn legacy_alias(token: &str) -> String {
    if token == "path" {
        return "path.path".to_string();
    }
    if let Some(caps) = PATH_INDEX_RE.captures(token) {
        return format!("path.segments[{}]", &caps[1]);
    }
    token.to_string()
}

/// Walk a dotted path (with optional `[n]` index suffixes) through the map.
fn resolve_path(params: &ParamMap, path: &str) -> Option<Value> {
    let mut current = Value::Object(params.clone());
    for segment in path.split('.') {
        let (name, indices) = split_indices(segment)?;
        if !name.is_empty() {
            current = current.get(name)?.clone();
        }
        for index in indices {
            current = current.get(index)?.clone();
        }
    }
    Some(current)
}

/// Split `segments[0][1]` into `("segments", [0, 1])`.
fn split_indices(segment: &str) -> Option<(&str, Vec<usize>)> {
    match segment.find('[') {
        None => Some((segment, Vec::new())),
        Some(pos) => {
            let name = &segment[..pos];
            let mut indices = Vec::new();
            let mut rest = &segment[pos..];
            while let Some(stripped) = rest.strip_prefix('[') {
                let close = stripped.find(']')?;
                indices.push(stripped[..close].parse().ok()?);
                rest = &stripped[close + 1..];
            }
            if rest.is_empty() {
                Some((name, indices))
            } else {
                None
            }
        }
    }
}

/// Render a parameter value as the replacement string. Strings are used
/// verbatim; everything else is compact JSON.
fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// JSON-escape a replacement value for embedding inside a JSON string,
/// without the surrounding quotes.
fn escape_json_string(s: &str) -> String {
    let quoted = serde_json::to_string(s).expect("string serialization cannot fail");
    quoted[1..quoted.len() - 1].to_string()
}
