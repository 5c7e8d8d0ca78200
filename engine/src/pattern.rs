// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! Route selection patterns.
//!

use regex::Regex;
use tracing::trace;

/// Matches `value` against one pattern.
///
/// In order: `*` matches everything, then an exact match, then a wildcard
/// match where `*` is any run of characters and `?` is one character, and
/// finally the pattern is tried as a full regular expression.
pub fn match_pattern(value: &str, pattern: &str) -> bool {
    if pattern == "*" || value == pattern {
        return true;
    }
    if match_wildcard(value, pattern) {
        return true;
    }
    match Regex::new(&format!("^(?:{})$", pattern)) {
        Ok(regex) => regex.is_match(value),
        Err(error) => {
            trace!("Pattern {} is not a valid regular expression: {}", pattern, error);
            false
        }
    }
}

/// True if any of the comma separated patterns matches `value`.
pub fn match_any(value: &str, patterns: &str) -> bool {
    split_patterns(patterns).any(|pattern| match_pattern(value, pattern))
}

/// Non-empty, trimmed parts of a comma separated pattern list.
pub fn split_patterns(patterns: &str) -> impl Iterator<Item = &str> {
    patterns
        .split(',')
        .map(str::trim)
        .filter(|pattern| !pattern.is_empty())
}

fn match_wildcard(value: &str, pattern: &str) -> bool {
    if !pattern.contains(['*', '?']) {
        return false;
    }
    let mut expression = String::with_capacity(pattern.len() + 8);
    expression.push('^');
    for c in pattern.chars() {
        match c {
            '*' => expression.push_str(".*"),
            '?' => expression.push('.'),
            other => expression.push_str(&regex::escape(&other.to_string())),
        }
    }
    expression.push('$');
    Regex::new(&expression)
        .map(|regex| regex.is_match(value))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_and_everything() {
        assert!(match_pattern("orders", "orders"));
        assert!(match_pattern("orders", "*"));
        assert!(!match_pattern("orders", "order"));
    }

    #[test]
    fn test_wildcards() {
        assert!(match_pattern("timer:tick", "timer:*"));
        assert!(match_pattern("route-1", "route-?"));
        assert!(!match_pattern("route-12", "route-?"));
        assert!(match_pattern("a.b", "a.*"));
    }

    #[test]
    fn test_regex_fallback() {
        assert!(match_pattern("route-42", "route-[0-9]+"));
        assert!(!match_pattern("route-x", "route-[0-9]+"));
        assert!(!match_pattern("anything", "[invalid"));
    }

    #[test]
    fn test_match_any() {
        assert!(match_any("kafka:orders", "timer:*, kafka:*"));
        assert!(!match_any("file:inbox", "timer:*,kafka:*"));
        assert!(!match_any("file:inbox", ""));
        assert_eq!(split_patterns(" a, ,b ").collect::<Vec<_>>(), vec!["a", "b"]);
    }
}
