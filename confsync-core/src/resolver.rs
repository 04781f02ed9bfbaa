use globset::{Glob, GlobMatcher};
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::snapshot::Snapshot;

pub const PLACEHOLDER_PREFIX: &str = "${";
const PLACEHOLDER_SUFFIX: char = '}';
const DEFAULT_SEPARATOR: char = ':';

/// Secondary lookup consulted when a placeholder key is absent from the
/// active snapshot.
pub trait PropertySource: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
}

/// Process environment as the fallback property source.
pub struct EnvSource;

impl PropertySource for EnvSource {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

pub fn is_pattern(key: &str) -> bool {
    key.contains('*')
}

pub fn compile_pattern(pattern: &str) -> Result<GlobMatcher> {
    Glob::new(pattern)
        .map(|glob| glob.compile_matcher())
        .map_err(|err| Error::Config(format!("invalid key pattern '{pattern}': {err}")))
}

/// Expands `${key}` / `${key:default}` expressions against the snapshot,
/// then the fallback source, then the inline default. A placeholder with
/// no value anywhere is a resolution failure.
pub fn resolve(raw: &str, snapshot: &Snapshot, fallback: &dyn PropertySource) -> Result<String> {
    expand(raw, snapshot, fallback, true)
}

/// Same expansion, but unresolved placeholders are left in place instead
/// of failing. Used by the diff path, where a value must still be
/// comparable even when one of its references is missing.
pub fn resolve_lenient(raw: &str, snapshot: &Snapshot, fallback: &dyn PropertySource) -> String {
    expand(raw, snapshot, fallback, false).unwrap_or_else(|_| raw.to_owned())
}

// Single left-to-right pass. Substituted text is never re-scanned, so
// placeholders inside placeholder values do not expand.
fn expand(
    raw: &str,
    snapshot: &Snapshot,
    fallback: &dyn PropertySource,
    strict: bool,
) -> Result<String> {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;

    while let Some(start) = rest.find(PLACEHOLDER_PREFIX) {
        out.push_str(&rest[..start]);
        let body = &rest[start + PLACEHOLDER_PREFIX.len()..];
        let Some(end) = body.find(PLACEHOLDER_SUFFIX) else {
            // Unterminated expression, keep the literal text.
            out.push_str(&rest[start..]);
            return Ok(out);
        };

        let expression = &body[..end];
        let (key, default) = match expression.split_once(DEFAULT_SEPARATOR) {
            Some((key, default)) => (key, Some(default)),
            None => (expression, None),
        };

        let value = snapshot
            .get(key)
            .map(str::to_owned)
            .or_else(|| fallback.get(key))
            .or_else(|| default.map(str::to_owned));
        match value {
            Some(value) => out.push_str(&value),
            None if strict => {
                return Err(Error::Resolution(format!(
                    "no value for placeholder '{key}'"
                )));
            }
            None => out.push_str(&rest[start..start + PLACEHOLDER_PREFIX.len() + end + 1]),
        }

        rest = &body[end + 1..];
    }

    out.push_str(rest);
    Ok(out)
}

/// Renders every snapshot key matching the wildcard pattern into a single
/// JSON object. Member values are expanded first; a value that is itself
/// a JSON object or array is embedded structurally rather than as a
/// string.
pub fn aggregate_pattern(
    pattern: &str,
    snapshot: &Snapshot,
    fallback: &dyn PropertySource,
) -> Result<String> {
    let matcher = compile_pattern(pattern)?;
    let mut members = Map::new();
    for (key, raw) in snapshot.iter() {
        if !matcher.is_match(key) {
            continue;
        }
        let resolved = resolve_lenient(raw, snapshot, fallback);
        members.insert(key.clone(), json_member(&resolved));
    }
    Ok(serde_json::to_string(&Value::Object(members))?)
}

fn json_member(resolved: &str) -> Value {
    let trimmed = resolved.trim_start();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        if let Ok(value) = serde_json::from_str(resolved) {
            return value;
        }
    }
    Value::String(resolved.to_owned())
}
