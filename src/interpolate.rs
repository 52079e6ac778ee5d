//! `${Key}` interpolation for values read through the façade
//!
//! `${Other:Key}` is replaced by that key's value, `${Key:-fallback}` supplies a
//! default when the reference is missing and `$${` produces a literal `${`.

use crate::error::{ConfigError, Result};
use regex::{Captures, Regex};
use std::sync::OnceLock;

/// Maximum reference nesting
pub const MAX_DEPTH: usize = 8;

fn reference_pattern(key: &str) -> Result<&'static Regex> {
    static PATTERN: OnceLock<std::result::Result<Regex, regex::Error>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"\$\$\{|\$\{([^}]*)\}"))
        .as_ref()
        .map_err(|e| interpolation_error(key, e.to_string()))
}

/// True if `value` contains something to expand or unescape
pub fn has_references(value: &str) -> bool {
    value.contains("${")
}

/// Expand `value`, read under `key`, looking references up with `resolve`.
pub fn expand<F>(key: &str, value: &str, resolve: &F) -> Result<String>
where
    F: Fn(&str) -> Result<Option<String>>,
{
    let mut stack = vec![key.to_ascii_lowercase()];
    expand_inner(key, value, resolve, &mut stack)
}

fn expand_inner<F>(key: &str, value: &str, resolve: &F, stack: &mut Vec<String>) -> Result<String>
where
    F: Fn(&str) -> Result<Option<String>>,
{
    if !has_references(value) {
        return Ok(value.to_string());
    }

    let mut failure: Option<ConfigError> = None;
    let expanded = reference_pattern(key)?.replace_all(value, |caps: &Captures| {
        if failure.is_some() {
            return String::new();
        }
        let Some(reference) = caps.get(1) else {
            return "${".to_string();
        };
        match resolve_reference(key, reference.as_str(), resolve, stack) {
            Ok(resolved) => resolved,
            Err(e) => {
                failure = Some(e);
                String::new()
            }
        }
    });

    match failure {
        Some(e) => Err(e),
        None => Ok(expanded.into_owned()),
    }
}

fn resolve_reference<F>(key: &str, reference: &str, resolve: &F, stack: &mut Vec<String>) -> Result<String>
where
    F: Fn(&str) -> Result<Option<String>>,
{
    let (name, fallback) = match reference.split_once(":-") {
        Some((name, fallback)) => (name.trim(), Some(fallback)),
        None => (reference.trim(), None),
    };
    if name.is_empty() {
        return Err(interpolation_error(key, "empty reference"));
    }

    let normalized = name.to_ascii_lowercase();
    if stack.contains(&normalized) {
        return Err(interpolation_error(
            key,
            format!("cycle through '{}' ({})", name, stack.join(" -> ")),
        ));
    }
    if stack.len() > MAX_DEPTH {
        return Err(interpolation_error(key, format!("nesting deeper than {}", MAX_DEPTH)));
    }

    match resolve(name)? {
        Some(found) => {
            stack.push(normalized);
            let expanded = expand_inner(key, &found, resolve, stack);
            stack.pop();
            expanded
        }
        None => match fallback {
            Some(fallback) => expand_inner(key, fallback, resolve, stack),
            None => Err(interpolation_error(key, format!("'{}' is not defined", name))),
        },
    }
}

fn interpolation_error(key: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Interpolation {
        key: key.to_string(),
        reason: reason.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Result<Option<String>> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_lowercase(), v.to_string()))
            .collect();
        move |key: &str| Ok(map.get(&key.to_lowercase()).cloned())
    }

    #[test]
    fn test_expands_nested_references() {
        let resolve = lookup(&[("Db:Host", "db.local"), ("Db:Port", "5432"), ("Db:Addr", "${Db:Host}:${Db:Port}")]);
        let url = expand("Db:Url", "postgres://${Db:Addr}/app", &resolve).unwrap();
        assert_eq!(url, "postgres://db.local:5432/app");
    }

    #[test]
    fn test_fallback_and_escape() {
        let resolve = lookup(&[]);
        assert_eq!(expand("K", "${Missing:-none}", &resolve).unwrap(), "none");
        assert_eq!(expand("K", "literal $${Missing}", &resolve).unwrap(), "literal ${Missing}");
        assert_eq!(expand("K", "no refs", &resolve).unwrap(), "no refs");
    }

    #[test]
    fn test_missing_reference_is_an_error() {
        let err = expand("K", "${Missing}", &lookup(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::Interpolation { key, .. } if key == "K"));
    }

    #[test]
    fn test_cycle_is_detected() {
        let resolve = lookup(&[("A", "${B}"), ("B", "${a}")]);
        let err = expand("A", "${B}", &resolve).unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    fn chain(references: usize) -> Vec<(String, String)> {
        (1..=references)
            .map(|i| {
                let value = if i == references { "end".to_string() } else { format!("${{K{}}}", i + 1) };
                (format!("K{}", i), value)
            })
            .collect()
    }

    #[test]
    fn test_depth_limit_is_exact() {
        let allowed = chain(MAX_DEPTH);
        let refs: Vec<(&str, &str)> = allowed.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
        assert_eq!(expand("Root", "${K1}", &lookup(&refs)).unwrap(), "end");

        let too_deep = chain(MAX_DEPTH + 1);
        let refs: Vec<(&str, &str)> = too_deep.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
        let err = expand("Root", "${K1}", &lookup(&refs)).unwrap_err();
        assert!(err.to_string().contains("nesting"));
    }

    #[test]
    fn test_depth_is_bounded() {
        let pairs: Vec<(String, String)> = (0..20).map(|i| (format!("K{}", i), format!("${{K{}}}", i + 1))).collect();
        let refs: Vec<(&str, &str)> = pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
        let err = expand("K0", "${K1}", &lookup(&refs)).unwrap_err();
        assert!(err.to_string().contains("nesting"));
    }
}
