//! PII tokenization at the sandbox boundary
//!
//! Configured PII categories are replaced with stable per-session tokens on
//! the way into the sandbox and restored on output. The mapping lives only
//! in the session row and disappears with it.

use std::collections::HashMap;

use regex::Regex;

use mcpgate_core::dao::TokenizationPolicy;

/// Stateful tokenizer bound to one session's mapping.
#[derive(Debug)]
pub struct Tokenizer {
    rules: Vec<(String, Regex)>,
}

impl Tokenizer {
    /// Tokenizer for the configured PII categories; unknown categories are
    /// ignored.
    #[must_use]
    pub fn new(policy: &TokenizationPolicy) -> Self {
        let mut rules = Vec::new();
        if policy.enabled {
            for category in &policy.pii_types {
                let pattern = match category.as_str() {
                    "email" => r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}",
                    "ssn" => r"\b\d{3}-\d{2}-\d{4}\b",
                    "phone" => r"\+?\d{1,3}[-. ]?\(?\d{3}\)?[-. ]?\d{3}[-. ]?\d{4}",
                    "credit_card" => r"\b\d{4}[- ]?\d{4}[- ]?\d{4}[- ]?\d{4}\b",
                    _ => continue,
                };
                rules.push((
                    category.clone(),
                    Regex::new(pattern).expect("built-in PII pattern compiles"),
                ));
            }
        }
        Self { rules }
    }

    /// Whether any rule is active.
    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.rules.is_empty()
    }

    /// Replace PII with stable tokens, extending `mapping` (token → original).
    /// Re-tokenizing the same value yields the same token within a session.
    #[must_use]
    pub fn tokenize(&self, text: &str, mapping: &mut HashMap<String, String>) -> String {
        let mut out = text.to_string();
        for (category, pattern) in &self.rules {
            loop {
                let Some(found) = pattern.find(&out) else { break };
                let original = found.as_str().to_string();
                let token = mapping
                    .iter()
                    .find(|(_, v)| **v == original)
                    .map(|(k, _)| k.clone())
                    .unwrap_or_else(|| {
                        let token = format!("tok_{category}_{}", mapping.len() + 1);
                        mapping.insert(token.clone(), original.clone());
                        token
                    });
                out = out.replacen(&original, &token, 1);
                // Loop re-scans: the replacement may expose later matches.
            }
        }
        out
    }

    /// Restore tokens to their original values on the way out.
    ///
    /// Single pass over the text: tokens are matched longest-first so a
    /// token that is a prefix of another (`tok_email_1` / `tok_email_10`)
    /// can never corrupt the longer one.
    #[must_use]
    pub fn detokenize(text: &str, mapping: &HashMap<String, String>) -> String {
        if mapping.is_empty() {
            return text.to_string();
        }
        let mut tokens: Vec<&str> = mapping.keys().map(String::as_str).collect();
        tokens.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        let pattern = tokens
            .iter()
            .map(|t| regex::escape(t))
            .collect::<Vec<_>>()
            .join("|");
        let matcher = Regex::new(&pattern).expect("escaped token alternation compiles");
        matcher
            .replace_all(text, |caps: &regex::Captures<'_>| {
                mapping[&caps[0]].clone()
            })
            .into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn policy(types: &[&str]) -> TokenizationPolicy {
        TokenizationPolicy {
            enabled: true,
            pii_types: types.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn round_trip_restores_originals() {
        let tokenizer = Tokenizer::new(&policy(&["email", "ssn"]));
        let mut mapping = HashMap::new();
        let tokenized = tokenizer.tokenize(
            "contact alice@example.com, ssn 123-45-6789",
            &mut mapping,
        );
        assert!(!tokenized.contains("alice@example.com"));
        assert!(!tokenized.contains("123-45-6789"));

        let restored = Tokenizer::detokenize(&tokenized, &mapping);
        assert_eq!(restored, "contact alice@example.com, ssn 123-45-6789");
    }

    #[test]
    fn repeated_values_share_a_token() {
        let tokenizer = Tokenizer::new(&policy(&["email"]));
        let mut mapping = HashMap::new();
        let tokenized = tokenizer.tokenize(
            "bob@example.com wrote to bob@example.com",
            &mut mapping,
        );
        assert_eq!(mapping.len(), 1);
        let token = mapping.keys().next().unwrap();
        assert_eq!(tokenized.matches(token.as_str()).count(), 2);
    }

    #[test]
    fn round_trip_survives_ten_plus_values_in_one_category() {
        let tokenizer = Tokenizer::new(&policy(&["email"]));
        let mut mapping = HashMap::new();
        let input = (0..12)
            .map(|i| format!("user{i}@example.com"))
            .collect::<Vec<_>>()
            .join(", ");
        let tokenized = tokenizer.tokenize(&input, &mut mapping);
        assert_eq!(mapping.len(), 12);
        // tok_email_1 is a prefix of tok_email_10..12; restoration must not
        // corrupt the longer tokens.
        let restored = Tokenizer::detokenize(&tokenized, &mapping);
        assert_eq!(restored, input);
    }

    #[test]
    fn disabled_policy_is_inert() {
        let tokenizer = Tokenizer::new(&TokenizationPolicy::default());
        assert!(!tokenizer.is_active());
        let mut mapping = HashMap::new();
        assert_eq!(
            tokenizer.tokenize("alice@example.com", &mut mapping),
            "alice@example.com"
        );
        assert!(mapping.is_empty());
    }
}
