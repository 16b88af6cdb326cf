//! Resolve what a user typed to one of the groups present in the schedule.

use thiserror::Error;

use crate::normalize::{compact_group, normalize_group};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GroupLookupError {
    #[error("Введите номер группы.")]
    Empty,
    #[error("Группа не найдена в расписании.")]
    NotFound,
    #[error("Найдено несколько групп: {}. Уточните ввод (добавьте букву).", .0.join(", "))]
    Ambiguous(Vec<String>),
}

/// Exact normalized match first, then a unique substring/suffix match on the
/// separator-free form. With no known groups the normalized input is returned.
pub fn resolve_group_name(input: &str, known: &[String]) -> Result<String, GroupLookupError> {
    if input.trim().is_empty() {
        return Err(GroupLookupError::Empty);
    }
    let normalized = normalize_group(input);
    if known.is_empty() || known.iter().any(|g| *g == normalized) {
        return Ok(normalized);
    }

    let needle = compact_group(&normalized);
    let matches: Vec<String> = known
        .iter()
        .filter(|g| compact_group(g).contains(&needle))
        .cloned()
        .collect();

    match matches.len() {
        0 => Err(GroupLookupError::NotFound),
        1 => Ok(matches.into_iter().next().unwrap_or_default()),
        _ => Err(GroupLookupError::Ambiguous(matches)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn known() -> Vec<String> {
        ["И-255", "ПКС-21", "ПКС-22", "Т-101Б"]
            .into_iter()
            .map(String::from)
            .collect()
    }

    #[test]
    fn exact_after_normalization() {
        assert_eq!(resolve_group_name("и 255", &known()).unwrap(), "И-255");
    }

    #[test]
    fn unique_partial_match() {
        assert_eq!(resolve_group_name("255", &known()).unwrap(), "И-255");
        assert_eq!(resolve_group_name("101б", &known()).unwrap(), "Т-101Б");
    }

    #[test]
    fn ambiguous_and_missing() {
        assert_eq!(
            resolve_group_name("ПКС", &known()),
            Err(GroupLookupError::Ambiguous(vec!["ПКС-21".into(), "ПКС-22".into()]))
        );
        assert_eq!(resolve_group_name("999", &known()), Err(GroupLookupError::NotFound));
        assert_eq!(resolve_group_name("  ", &known()), Err(GroupLookupError::Empty));
    }

    #[test]
    fn nothing_known_passes_through() {
        assert_eq!(resolve_group_name("и 255", &[]).unwrap(), "И-255");
    }
}
