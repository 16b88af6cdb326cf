//! Canonical form for group identifiers.

/// Latin capitals that render identically to a Cyrillic capital.
const LOOKALIKES: [(char, char); 12] = [
    ('A', 'А'),
    ('B', 'В'),
    ('E', 'Е'),
    ('K', 'К'),
    ('M', 'М'),
    ('H', 'Н'),
    ('O', 'О'),
    ('P', 'Р'),
    ('C', 'С'),
    ('T', 'Т'),
    ('X', 'Х'),
    ('Y', 'У'),
];

/// Trim, upper-case, fold Latin look-alikes onto Cyrillic and turn spaces into hyphens.
///
/// Used for spreadsheet headers and for user queries alike, so `"и 255"` and
/// `"И-255"` end up comparable.
pub fn normalize_group(raw: &str) -> String {
    raw.trim()
        .to_uppercase()
        .chars()
        .map(|c| match LOOKALIKES.iter().find(|(latin, _)| *latin == c) {
            Some((_, cyrillic)) => *cyrillic,
            None if c == ' ' => '-',
            None => c,
        })
        .collect()
}

/// Group name with separators removed, used for fuzzy matching.
pub fn compact_group(raw: &str) -> String {
    raw.to_uppercase()
        .chars()
        .filter(|c| *c != '-' && !c.is_whitespace())
        .collect()
}
