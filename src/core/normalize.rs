// Canonical index keys for municipality names.
// Build and query share this one function; any divergence breaks index soundness.
use unicode_normalization::UnicodeNormalization;
use unicode_normalization::char::is_combining_mark;

/// Canonicalizes `text` into an index key: trimmed, lowercased, accents stripped,
/// whitespace runs collapsed to one space.
pub fn normalize(text: &str) -> String {
    let mut current = normalize_pass(text);
    // Case mapping and compatibility decomposition can each expose work for the other
    // (e.g. `İ` lowercases to `i` + combining dot), so repeat until nothing changes.
    loop {
        let next = normalize_pass(&current);
        if next == current {
            return current;
        }
        current = next;
    }
}

/// Absent input normalizes to the empty key.
pub fn normalize_opt(text: Option<&str>) -> String {
    text.map(normalize).unwrap_or_default()
}

fn normalize_pass(text: &str) -> String {
    let stripped: String = text
        .trim()
        .to_lowercase()
        .nfkd()
        .filter(|ch| !is_combining_mark(*ch))
        .collect();
    stripped.split_whitespace().collect::<Vec<_>>().join(" ")
}
