//! NATS subject wildcard matching.
//!
//! Subjects are dot-delimited token sequences. In a subscription pattern,
//! `*` matches exactly one token and a trailing `>` matches any remaining
//! tokens. Publish subjects must be fully literal.

use crate::error::NatsError;

/// Splits a delimited list, trimming tokens and dropping empties.
#[must_use]
pub fn parse_list(list: &str, delimiter: char) -> Vec<String> {
    list.split(delimiter)
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(ToOwned::to_owned)
        .collect()
}

/// Tests whether a literal subject matches one subscription pattern.
#[must_use]
pub fn matches_subject(subject: &str, pattern: &str) -> bool {
    let subject_tokens: Vec<&str> = subject.split('.').collect();
    let pattern_tokens: Vec<&str> = pattern.split('.').collect();

    let levels_to_check = if pattern_tokens.last() == Some(&">") {
        let head = pattern_tokens.len() - 1;
        if subject_tokens.len() < head {
            return false;
        }
        head
    } else {
        if subject_tokens.len() != pattern_tokens.len() {
            return false;
        }
        pattern_tokens.len()
    };

    (0..levels_to_check)
        .all(|level| pattern_tokens[level] == "*" || pattern_tokens[level] == subject_tokens[level])
}

/// Tests whether a literal subject belongs to a subscription set.
#[must_use]
pub fn is_subject_in_subscriptions(subject: &str, subscriptions: &[String]) -> bool {
    subscriptions
        .iter()
        .any(|pattern| matches_subject(subject, pattern))
}

/// Validates that a subject can be published to.
///
/// # Errors
///
/// Returns [`NatsError::BadArguments`] for empty or wildcard subjects.
pub fn validate_publish_subject(subject: &str) -> Result<(), NatsError> {
    if subject.is_empty() {
        return Err(NatsError::BadArguments("empty publish subject".into()));
    }
    if subject.contains('*') || subject.ends_with('>') {
        return Err(NatsError::BadArguments(format!(
            "cannot publish to wildcard subject '{subject}'"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(subjects: &[&str]) -> Vec<String> {
        subjects.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn test_parse_list() {
        assert_eq!(parse_list("a, b ,c", ','), vec!["a", "b", "c"]);
        assert_eq!(parse_list("", ','), Vec::<String>::new());
        assert_eq!(parse_list(" , ", ','), Vec::<String>::new());
    }

    #[test]
    fn test_literal_match() {
        assert!(matches_subject("orders", "orders"));
        assert!(!matches_subject("orders", "payments"));
        assert!(!matches_subject("orders.new", "orders"));
    }

    #[test]
    fn test_single_level_wildcard() {
        assert!(matches_subject("a.b.c", "a.*.c"));
        assert!(!matches_subject("a.c", "a.*.c"));
        assert!(!matches_subject("a.b.b.c", "a.*.c"));
        assert!(matches_subject("t.a", "t.*"));
        assert!(!matches_subject("t.a.b", "t.*"));
    }

    #[test]
    fn test_tail_wildcard() {
        assert!(matches_subject("x.y.z.w", "x.>"));
        assert!(matches_subject("x.y", "x.>"));
        assert!(!matches_subject("y.x", "x.>"));
        // the bare prefix itself is part of the set
        assert!(matches_subject("x", "x.>"));
    }

    #[test]
    fn test_wildcard_combinations() {
        let subjects = set(&["a.*.c", "x.>"]);
        assert!(is_subject_in_subscriptions("a.b.c", &subjects));
        assert!(is_subject_in_subscriptions("x.y.z.w", &subjects));
        assert!(!is_subject_in_subscriptions("a.c", &subjects));
        assert!(is_subject_in_subscriptions("x", &subjects));
        assert!(!is_subject_in_subscriptions("y", &subjects));
    }

    #[test]
    fn test_match_is_idempotent_under_union() {
        // adding a pattern that already matches never changes the outcome
        let base = set(&["t.*"]);
        let extended = set(&["t.*", "t.a"]);
        for candidate in ["t.a", "t.b", "t.a.b", "s"] {
            assert_eq!(
                is_subject_in_subscriptions(candidate, &base),
                is_subject_in_subscriptions(candidate, &extended)
                    || !is_subject_in_subscriptions(candidate, &base)
            );
        }
        assert!(is_subject_in_subscriptions("t.a", &extended));
    }

    #[test]
    fn test_validate_publish_subject() {
        assert!(validate_publish_subject("orders.new").is_ok());
        assert!(validate_publish_subject("").is_err());
        assert!(validate_publish_subject("orders.*").is_err());
        assert!(validate_publish_subject("*.orders").is_err());
        assert!(validate_publish_subject("orders.>").is_err());
    }
}
