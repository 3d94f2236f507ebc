//! Partition rule deciding whether a class belongs to the "excluded" surface
//! (generated controllers and the like) or to core logic.

/// Pattern used when the caller does not supply one.
pub const DEFAULT_EXCLUSION_PATTERN: &str = ".Controller";

/// Case-insensitive substring test of `pattern` against a fully-qualified
/// class name. An empty pattern never excludes anything.
#[must_use]
pub fn is_excluded(full_name: &str, pattern: &str) -> bool {
    if pattern.is_empty() {
        return false;
    }
    contains_ignore_case(full_name, pattern)
}

/// Substring test comparing characters by their simple uppercase mapping.
/// Characters whose uppercase form is more than one character (`ß`) only
/// match themselves.
#[must_use]
pub fn contains_ignore_case(haystack: &str, needle: &str) -> bool {
    fold_case(haystack).contains(fold_case(needle).as_str())
}

fn fold_case(s: &str) -> String {
    s.chars().map(simple_upper).collect()
}

fn simple_upper(c: char) -> char {
    let mut upper = c.to_uppercase();
    match (upper.next(), upper.next()) {
        (Some(u), None) => u,
        _ => c,
    }
}
