//! Template codec
//!
//! Entity fields often carry the platform's own Jinja-style templates
//! (`{{ }}`, `{% %}`, `{# #}`, `{% raw %}` blocks). Those must survive a
//! round-trip through a bundle untouched, while operators may add their own
//! `{{ variable }}` placeholders to a bundle to be filled in at import time.
//!
//! The two layers are kept apart with two explicit passes:
//!
//! - [`escape`] (export) swaps every delimiter of the host syntax for a
//!   marker token, so nothing in an exported field looks like a template.
//! - [`render`] (import) substitutes live operator placeholders first, then
//!   swaps the markers back to the original delimiters.
//!
//! `render(&escape(t)?, &Variables::new())? == t` for any `t` that does not
//! already contain [`MARKER_PREFIX`].

use regex::{Captures, Regex};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::LazyLock;
use thiserror::Error;

/// Operator-supplied variables for [`render`].
pub type Variables = BTreeMap<String, String>;

/// Every marker token starts with this sequence (SUB control character).
pub const MARKER_PREFIX: &str = "\u{1A}ferry:";

const MARKER_END: char = '\u{1A}';

/// Delimiters of the host syntax with their marker names.
///
/// Longest first: the raw tags must win over the bare `{%` delimiter.
const DELIMITERS: &[(&str, &str)] = &[
    ("{% endraw %}", "raw_close"),
    ("{% raw %}", "raw_open"),
    ("{{", "expr_open"),
    ("}}", "expr_close"),
    ("{%", "stmt_open"),
    ("%}", "stmt_close"),
    ("{#", "comment_open"),
    ("#}", "comment_close"),
];

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"\{\{\s*([A-Za-z_][A-Za-z0-9_.]*)\s*(?:\|\s*default\(\s*(?:"([^"]*)"|'([^']*)')\s*\)\s*)?\}\}"#,
    )
    .expect("placeholder pattern is valid")
});

/// Errors raised by the codec.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    /// The text already contains the marker sequence
    #[error("field `{field}` already contains the escape marker sequence")]
    UnsafeInput { field: String },

    /// A live placeholder names a variable nobody supplied
    #[error("undefined template variable `{name}` in field `{field}`")]
    UnresolvedVariable { name: String, field: String },
}

/// Whether `text` contains the marker sequence.
pub fn contains_marker(text: &str) -> bool {
    text.contains(MARKER_PREFIX)
}

/// Replace every host template delimiter in `text` with a marker token.
pub fn escape(text: &str) -> Result<String, TemplateError> {
    escape_field(text, "")
}

fn escape_field(text: &str, field: &str) -> Result<String, TemplateError> {
    if contains_marker(text) {
        return Err(TemplateError::UnsafeInput {
            field: field.to_string(),
        });
    }

    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    'scan: while !rest.is_empty() {
        for (delimiter, name) in DELIMITERS {
            if let Some(tail) = rest.strip_prefix(delimiter) {
                out.push_str(MARKER_PREFIX);
                out.push_str(name);
                out.push(MARKER_END);
                rest = tail;
                continue 'scan;
            }
        }
        let mut chars = rest.chars();
        if let Some(c) = chars.next() {
            out.push(c);
        }
        rest = chars.as_str();
    }
    Ok(out)
}

/// Substitute operator placeholders, then restore escaped delimiters.
pub fn render(text: &str, variables: &Variables) -> Result<String, TemplateError> {
    render_field(text, variables, "")
}

fn render_field(text: &str, variables: &Variables, field: &str) -> Result<String, TemplateError> {
    let substituted = substitute(text, variables, field)?;
    Ok(unescape(&substituted))
}

fn substitute(text: &str, variables: &Variables, field: &str) -> Result<String, TemplateError> {
    let mut missing = None;
    let replaced = PLACEHOLDER.replace_all(text, |caps: &Captures<'_>| {
        let name = &caps[1];
        if let Some(value) = variables.get(name) {
            return value.clone();
        }
        if let Some(default) = caps.get(2).or_else(|| caps.get(3)) {
            return default.as_str().to_string();
        }
        missing.get_or_insert_with(|| name.to_string());
        caps[0].to_string()
    });

    match missing {
        Some(name) => Err(TemplateError::UnresolvedVariable {
            name,
            field: field.to_string(),
        }),
        None => Ok(replaced.into_owned()),
    }
}

/// Swap marker tokens back to their delimiters. Unknown markers are kept.
fn unescape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find(MARKER_PREFIX) {
        out.push_str(&rest[..start]);
        let after = &rest[start + MARKER_PREFIX.len()..];
        let restored = after.find(MARKER_END).and_then(|end| {
            let name = &after[..end];
            DELIMITERS
                .iter()
                .find(|(_, n)| *n == name)
                .map(|(delimiter, _)| (*delimiter, end))
        });
        match restored {
            Some((delimiter, end)) => {
                out.push_str(delimiter);
                rest = &after[end + MARKER_END.len_utf8()..];
            }
            None => {
                out.push_str(MARKER_PREFIX);
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Escape every string inside a JSON value tree.
///
/// `path` names the value in error messages, e.g. `payload`.
pub fn escape_value(value: &mut Value, path: &str) -> Result<(), TemplateError> {
    walk_strings(value, path, &mut |text, field| escape_field(text, field))
}

/// Render every string inside a JSON value tree.
pub fn render_value(
    value: &mut Value,
    path: &str,
    variables: &Variables,
) -> Result<(), TemplateError> {
    walk_strings(value, path, &mut |text, field| {
        render_field(text, variables, field)
    })
}

fn walk_strings<F>(value: &mut Value, path: &str, f: &mut F) -> Result<(), TemplateError>
where
    F: FnMut(&str, &str) -> Result<String, TemplateError>,
{
    match value {
        Value::String(text) => {
            *text = f(text, path)?;
        }
        Value::Array(items) => {
            for (i, item) in items.iter_mut().enumerate() {
                walk_strings(item, &format!("{path}[{i}]"), f)?;
            }
        }
        Value::Object(map) => {
            for (key, item) in map.iter_mut() {
                walk_strings(item, &format!("{path}.{key}"), f)?;
            }
        }
        Value::Null | Value::Bool(_) | Value::Number(_) => {}
    }
    Ok(())
}
