//! Dotted/indexed path evaluation over decoded JSON.
//!
//! Paths look like `data.items.0.id` or `data.items[0].id`. A leading `$`
//! (or `$.`) refers to the root and is ignored. Anything that cannot be
//! walked resolves to "no value" (`None`) instead of an error: a missing
//! key, an index into a non-list, a non-integer index against a list, an
//! out-of-range index or a malformed bracket.

use std::borrow::Cow;

use serde_json::Value;

/// Resolve `path` against `root`.
pub fn extract<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let path = strip_root(path);
    let mut current = root;

    for part in path.split('.') {
        if part.is_empty() {
            continue;
        }

        let (name, indices) = match part.find('[') {
            Some(pos) => (&part[..pos], &part[pos..]),
            None => (part, ""),
        };

        if !name.is_empty() {
            current = step(current, name)?;
        }

        let mut rest = indices;
        while !rest.is_empty() {
            let inner = rest.strip_prefix('[')?;
            let close = inner.find(']')?;
            let index: usize = inner[..close].trim().parse().ok()?;
            current = current.as_array()?.get(index)?;
            rest = &inner[close + 1..];
        }
    }

    Some(current)
}

fn strip_root(path: &str) -> &str {
    match path.strip_prefix('$') {
        Some(rest) => rest.strip_prefix('.').unwrap_or(rest),
        None => path,
    }
}

fn step<'a>(current: &'a Value, segment: &str) -> Option<&'a Value> {
    match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => items.get(segment.parse::<usize>().ok()?),
        _ => None,
    }
}

/// Render a value the way conditions compare it: strings verbatim, every
/// other value as compact JSON (`200`, `true`, `null`, `{"a":1}`).
pub fn stringify(value: &Value) -> Cow<'_, str> {
    match value {
        Value::String(s) => Cow::Borrowed(s.as_str()),
        other => Cow::Owned(other.to_string()),
    }
}

/// String-compare two values using [`stringify`].
pub fn values_equal(actual: &Value, expected: &Value) -> bool {
    stringify(actual) == stringify(expected)
}

/// Check a path predicate against `root`.
///
/// With an `expected` value the resolved value must string-compare equal to
/// it; without one the path only has to resolve to a non-null value.
pub fn matches(root: &Value, path: &str, expected: Option<&Value>) -> bool {
    match (extract(root, path), expected) {
        (Some(actual), Some(expected)) => values_equal(actual, expected),
        (Some(actual), None) => !actual.is_null(),
        (None, _) => false,
    }
}
