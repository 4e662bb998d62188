//! Deterministic code tokenizer.
//!
//! Both the chunker's token budgets and the learning loop's lexical features
//! count tokens the same way, so budgets agree between ingest and query time.
//! A token is a run of identifier characters, a run of digits, or a single
//! symbol character; whitespace separates tokens and produces none.

/// Count tokens in a piece of source text.
pub fn count(text: &str) -> usize {
    let mut count = 0usize;
    let mut in_word = false;
    for ch in text.chars() {
        if ch.is_alphanumeric() || ch == '_' {
            if !in_word {
                count += 1;
                in_word = true;
            }
        } else {
            in_word = false;
            if !ch.is_whitespace() {
                count += 1;
            }
        }
    }
    count
}

/// Lowercased keyword terms for lexical-overlap scoring. Short fragments are
/// noise and dropped.
pub fn keywords(text: &str) -> Vec<String> {
    let mut terms = Vec::new();
    for raw in text.split(|c: char| !(c.is_alphanumeric() || c == '_')) {
        let term = raw.trim().to_ascii_lowercase();
        if term.len() >= 3 {
            terms.push(term);
        }
    }
    terms.sort();
    terms.dedup();
    terms
}

/// Fraction of `terms` present in `haystack`, in [0, 1].
pub fn overlap_score(terms: &[String], haystack: &str) -> f32 {
    if terms.is_empty() {
        return 0.0;
    }
    let lower = haystack.to_ascii_lowercase();
    let matches = terms.iter().filter(|term| lower.contains(term.as_str())).count();
    (matches as f32) / (terms.len() as f32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_identifiers_and_symbols() {
        // fn / login / ( / user_id / : / u64 / ) = 7
        assert_eq!(count("fn login(user_id: u64)"), 7);
    }

    #[test]
    fn whitespace_produces_no_tokens() {
        assert_eq!(count("   \n\t  "), 0);
    }

    #[test]
    fn counting_is_deterministic() {
        let text = "let total = items.iter().map(|i| i.len()).sum::<usize>();";
        assert_eq!(count(text), count(text));
    }

    #[test]
    fn keywords_dedup_and_lowercase() {
        let terms = keywords("Login login LOGIN handler");
        assert_eq!(terms, vec!["handler".to_owned(), "login".to_owned()]);
    }

    #[test]
    fn overlap_is_fractional() {
        let terms = keywords("login session token");
        let score = overlap_score(&terms, "fn login() -> Session");
        assert!(score > 0.3 && score < 1.0);
    }
}
