//! Profile memory extraction.
//!
//! Scans a user message for durable self-assertions ("my name is Ada",
//! "I live in Lisbon") and returns them as key/value facts. Extraction is
//! local and synchronous: no backend calls.

use regex_lite::Regex;
use std::collections::BTreeMap;
use tracing::warn;

/// Pulls profile facts out of free text.
pub trait ProfileExtractor: Send + Sync {
    /// Facts asserted in `text`, keyed by normalized fact name. Usually empty.
    fn extract(&self, text: &str) -> BTreeMap<String, String>;
}

/// Where a rule's key comes from.
#[derive(Clone, Copy)]
enum KeySource {
    /// Always this key
    Fixed(&'static str),
    /// The `key` capture group, normalized
    Captured,
    /// `prefix` + the `key` capture group
    Prefixed(&'static str),
}

struct Rule {
    pattern: Regex,
    key: KeySource,
}

/// Case-insensitive patterns. Each captures `value`, and some capture `key`.
const RULES: &[(&str, KeySource)] = &[
    (
        r"(?i)\bremember that my (?P<key>[a-z][a-z ]{0,30}?) is (?P<value>[^.,!?;\n]+)",
        KeySource::Captured,
    ),
    (
        r"(?i)\bremember that i(?:'m| am) called (?P<value>[^.,!?;\n]+)",
        KeySource::Fixed("name"),
    ),
    (r"(?i)\bmy name is (?P<value>[^.,!?;\n]+)", KeySource::Fixed("name")),
    (r"(?i)\bcall me (?P<value>[^.,!?;\n]+)", KeySource::Fixed("name")),
    (r"(?i)\bi live in (?P<value>[^.,!?;\n]+)", KeySource::Fixed("location")),
    (
        r"(?i)\bi work as (?:an? )?(?P<value>[^.,!?;\n]+)",
        KeySource::Fixed("occupation"),
    ),
    (
        r"(?i)\bmy favou?rite (?P<key>[a-z]+) is (?P<value>[^.,!?;\n]+)",
        KeySource::Prefixed("favorite_"),
    ),
];

/// The default extractor: a fixed table of assertion patterns.
pub struct RegexProfileExtractor {
    rules: Vec<Rule>,
}

impl RegexProfileExtractor {
    pub fn new() -> Self {
        let rules = RULES
            .iter()
            .filter_map(|(pattern, key)| match Regex::new(pattern) {
                Ok(pattern) => Some(Rule { pattern, key: *key }),
                Err(e) => {
                    warn!("Skipping profile pattern {pattern}: {e}");
                    None
                }
            })
            .collect();
        Self { rules }
    }
}

impl Default for RegexProfileExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl ProfileExtractor for RegexProfileExtractor {
    fn extract(&self, text: &str) -> BTreeMap<String, String> {
        let mut facts = BTreeMap::new();

        for rule in &self.rules {
            for caps in rule.pattern.captures_iter(text) {
                let Some(value) = caps.name("value").map(|m| clean_value(m.as_str())) else {
                    continue;
                };
                if value.is_empty() {
                    continue;
                }

                let key = match rule.key {
                    KeySource::Fixed(k) => Some(k.to_string()),
                    KeySource::Captured => caps.name("key").map(|m| normalize_key(m.as_str())),
                    KeySource::Prefixed(prefix) => caps
                        .name("key")
                        .map(|m| format!("{prefix}{}", normalize_key(m.as_str()))),
                };

                if let Some(key) = key.filter(|k| !k.is_empty()) {
                    facts.insert(key, value);
                }
            }
        }

        facts
    }
}

/// `"Favourite  Colour"` → `"favorite_colour"`.
fn normalize_key(raw: &str) -> String {
    raw.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join("_")
        .replace("favourite", "favorite")
}

/// Trim the captured value and cut it at a following clause.
fn clean_value(raw: &str) -> String {
    let lower = raw.to_ascii_lowercase();
    let end = [" and ", " but ", " so "]
        .iter()
        .filter_map(|sep| lower.find(sep))
        .min()
        .unwrap_or(raw.len());
    raw[..end].trim().trim_matches(|c| c == '"' || c == '\'').trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extract(text: &str) -> BTreeMap<String, String> {
        RegexProfileExtractor::new().extract(text)
    }

    #[test]
    fn all_rules_compile() {
        assert_eq!(RegexProfileExtractor::new().rules.len(), RULES.len());
    }

    #[test]
    fn plain_chat_has_no_facts() {
        assert!(extract("What's the weather like tomorrow?").is_empty());
        assert!(extract("").is_empty());
    }

    #[test]
    fn name_assertions() {
        assert_eq!(extract("Hi, my name is Ada Lovelace.")["name"], "Ada Lovelace");
        assert_eq!(extract("please call me Grace")["name"], "Grace");
        assert_eq!(extract("Remember that I am called Turing!")["name"], "Turing");
    }

    #[test]
    fn multiple_facts_in_one_message() {
        let facts = extract("My name is Ada and I live in London. I work as an engineer");
        assert_eq!(facts["name"], "Ada");
        assert_eq!(facts["location"], "London");
        assert_eq!(facts["occupation"], "engineer");
    }

    #[test]
    fn favorites_get_prefixed_keys() {
        let facts = extract("my favourite colour is teal");
        assert_eq!(facts["favorite_colour"], "teal");
        assert_eq!(extract("My favorite food is ramen")["favorite_food"], "ramen");
    }

    #[test]
    fn generic_remember_that() {
        let facts = extract("Remember that my project codename is Bluebird.");
        assert_eq!(facts["project_codename"], "Bluebird");
    }

    #[test]
    fn unicode_values_survive() {
        let facts = extract("I live in São Paulo");
        assert_eq!(facts["location"], "São Paulo");
    }
}
