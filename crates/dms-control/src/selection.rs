//! Grammaire de sélection d'hôtes par index (1-based).
//!
//! `1,3,5`, `2-4`, `all` ; les jetons invalides ou hors bornes sont ignorés
//! un par un. C'est à l'appelant de refuser un résultat vide.

use std::collections::BTreeSet;

/// Retourne les index 0-based sélectionnés parmi `count` entrées, triés et
/// sans doublon
pub fn parse_selection(input: &str, count: usize) -> Vec<usize> {
    let mut selected = BTreeSet::new();

    for part in input.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }

        if part.eq_ignore_ascii_case("all") {
            return (0..count).collect();
        }

        if let Some((start_str, end_str)) = part.split_once('-') {
            if let (Ok(start), Ok(end)) = (
                start_str.trim().parse::<usize>(),
                end_str.trim().parse::<usize>(),
            ) {
                // Bornage avant itération : `1-4000000000` reste borné par `count`
                let first = start.max(1);
                let last = end.min(count);
                for n in first..=last {
                    selected.insert(n - 1);
                }
            }
        } else if let Ok(n) = part.parse::<usize>() {
            if (1..=count).contains(&n) {
                selected.insert(n - 1);
            }
        }
    }

    selected.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list() {
        assert_eq!(parse_selection("1,3,5", 5), vec![0, 2, 4]);
    }

    #[test]
    fn test_range() {
        assert_eq!(parse_selection("1-4", 5), vec![0, 1, 2, 3]);
        assert_eq!(parse_selection(" 2 - 3 ", 5), vec![1, 2]);
    }

    #[test]
    fn test_all_case_insensitive() {
        assert_eq!(parse_selection("all", 5), vec![0, 1, 2, 3, 4]);
        assert_eq!(parse_selection("ALL", 3), vec![0, 1, 2]);
        assert_eq!(parse_selection("all", 0), Vec::<usize>::new());
    }

    #[test]
    fn test_invalid_tokens_are_dropped() {
        assert!(parse_selection("7,abc", 5).is_empty());
        assert_eq!(parse_selection("2,abc,0,9", 5), vec![1]);
        assert!(parse_selection("", 5).is_empty());
        assert!(parse_selection("3-1", 5).is_empty());
        assert!(parse_selection("1-x", 5).is_empty());
    }

    #[test]
    fn test_overlaps_and_partial_ranges() {
        assert_eq!(parse_selection("1,1-2,2", 5), vec![0, 1]);
        assert_eq!(parse_selection("4-9", 5), vec![3, 4]);
        assert_eq!(parse_selection("0-2", 5), vec![0, 1]);
        assert_eq!(parse_selection("1-4000000000", 2), vec![0, 1]);
    }
}
