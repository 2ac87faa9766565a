//! Dotted metric names.
//!
//! A metric recorded as `http.200.get` is also counted under `http.200` and
//! `http`, so every ancestor prefix sees the totals of its children.

use crate::error::RecordError;

/// Separator between name segments.
pub const SEPARATOR: char = '.';

/// Expands a dotted name into itself and all of its ancestor prefixes.
///
/// The longest name comes first.
///
/// ```rust
/// assert_eq!(tally::name::expand("a.b.c"), vec!["a.b.c", "a.b", "a"]);
/// assert_eq!(tally::name::expand("a"), vec!["a"]);
/// ```
pub fn expand(name: &str) -> Vec<String> {
    let mut names = vec![name.to_string()];
    let mut rest = name;
    while let Some(idx) = rest.rfind(SEPARATOR) {
        rest = &rest[..idx];
        names.push(rest.to_string());
    }
    names
}

/// Checks that a name can be recorded and survives the line protocol.
///
/// # Errors
///
/// Returns [`RecordError::InvalidName`] if the name is empty, contains an
/// empty segment (`a..b`, `.a`, `a.`), or contains whitespace.
pub fn validate(name: &str) -> Result<(), RecordError> {
    let reason = if name.is_empty() {
        "name is empty"
    } else if name.chars().any(char::is_whitespace) {
        "name contains whitespace"
    } else if name.split(SEPARATOR).any(str::is_empty) {
        "name has an empty segment"
    } else {
        return Ok(());
    };

    Err(RecordError::InvalidName {
        name: name.to_string(),
        reason,
    })
}
