use std::collections::BTreeSet;

/// Look-alike letters folded to one canonical form
const LETTER_REPLACEMENTS: &[(char, char)] = &[('ё', 'е'), ('й', 'и'), ('ъ', 'ь')];
const STRING_REPLACEMENTS: &[(&str, &str)] = &[("ыо", "ью")];

/// Lower-case, fold look-alikes and turn every non-alphanumeric character into a space
pub fn prepare_text(value: &str) -> String {
    let mut prepared: String = value
        .chars()
        .flat_map(char::to_lowercase)
        .map(|ch| {
            if let Some((_, to)) = LETTER_REPLACEMENTS.iter().find(|(from, _)| *from == ch) {
                *to
            } else if ch.is_alphanumeric() {
                ch
            } else {
                ' '
            }
        })
        .collect();

    for (from, to) in STRING_REPLACEMENTS {
        if prepared.contains(from) {
            prepared = prepared.replace(from, to);
        }
    }
    prepared
}

/// Token set of a title. Letters of each word form one token and every
/// run of digits becomes a token of its own, so "Book 2" and "Book2" agree.
pub fn normalize_title(value: &str) -> BTreeSet<String> {
    let mut tokens = BTreeSet::new();

    for word in prepare_text(value).split_whitespace() {
        let mut letters = String::new();
        let mut digits = String::new();
        for ch in word.chars() {
            if ch.is_numeric() {
                digits.push(ch);
                continue;
            }
            if !digits.is_empty() {
                tokens.insert(std::mem::take(&mut digits));
            }
            if ch.is_lowercase() {
                letters.push(ch);
            }
        }
        if !digits.is_empty() {
            tokens.insert(digits);
        }
        if !letters.is_empty() {
            tokens.insert(letters);
        }
    }

    tokens
}

/// Two titles overlap when they share at least one token
pub fn titles_overlap(lhs: &BTreeSet<String>, rhs: &BTreeSet<String>) -> bool {
    !lhs.is_disjoint(rhs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_digits_split_from_words() {
        assert_eq!(normalize_title("Book 2"), tokens(&["book", "2"]));
        assert_eq!(normalize_title("Book2"), tokens(&["book", "2"]));
        assert_eq!(normalize_title("Vol.12-b3"), tokens(&["vol", "12", "b", "3"]));
    }

    #[test]
    fn test_punctuation_becomes_separator() {
        assert_eq!(
            normalize_title("War, and — Peace!"),
            tokens(&["war", "and", "peace"])
        );
    }

    #[test]
    fn test_lookalike_letters_fold() {
        assert_eq!(normalize_title("Ёлка"), normalize_title("елка"));
        assert_eq!(normalize_title("Линейный"), normalize_title("линеиныи"));
        assert_eq!(normalize_title("подъезд"), normalize_title("подьезд"));
        assert_eq!(prepare_text("воробыошек"), "воробьюшек");
    }

    #[test]
    fn test_titles_overlap() {
        let a = normalize_title("The Hobbit");
        let b = normalize_title("hobbit, or there and back again");
        let c = normalize_title("Dune");
        assert!(titles_overlap(&a, &b));
        assert!(!titles_overlap(&a, &c));
        assert!(!titles_overlap(&BTreeSet::new(), &c));
    }
}
