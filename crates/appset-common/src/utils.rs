//! Small shared helpers: DNS-label sanitisation, deep JSON merge, SCM path rules

use serde_json::Value;

/// Sanitise a string so it can be used inside a DNS-1123 label.
///
/// Lowercases the input and replaces every character outside `[a-z0-9-]`
/// with `-`. Leading and trailing dashes are trimmed so the result can be
/// embedded directly in resource names.
pub fn sanitize_dns_label(input: &str) -> String {
    let lowered = input.to_lowercase();
    let replaced: String = lowered
        .chars()
        .map(|c| {
            if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect();
    replaced.trim_matches('-').to_string()
}

/// Shorten a commit SHA to the conventional 8 characters.
pub fn short_sha(sha: &str) -> String {
    sha.chars().take(8).collect()
}

/// Deep-merge `overlay` into `base`.
///
/// Objects are merged recursively; any other value in `overlay` replaces the
/// corresponding value in `base`. Keys only present in `base` are kept.
pub fn deep_merge(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, overlay_value) in overlay_map {
                match base_map.get_mut(key) {
                    Some(base_value) => deep_merge(base_value, overlay_value),
                    None => {
                        base_map.insert(key.clone(), overlay_value.clone());
                    }
                }
            }
        }
        (base_slot, overlay_value) => {
            *base_slot = overlay_value.clone();
        }
    }
}

/// Normalise a Bitbucket Server base path to end in `/rest` without a
/// trailing slash.
pub fn normalize_bitbucket_base_path(base_path: &str) -> String {
    if let Some(stripped) = base_path.strip_suffix("/rest/") {
        return format!("{stripped}/rest");
    }
    if base_path.ends_with("/rest") {
        return base_path.to_string();
    }
    format!("{base_path}/rest")
}
