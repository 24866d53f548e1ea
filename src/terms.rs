//! Evidence-term extraction and expansion.
//!
//! The term set drives query planning: [`initial_terms`] derives a seed
//! set from the question, and [`expand_terms`] grows it after each
//! iteration from candidate phrases observed in fetched bodies plus sender
//! domains that recur across messages. Terms are only ever added — removal
//! is reported by the orchestrator as a set difference for the audit
//! trail, never enforced.
//!
//! Sets are ordered (`BTreeSet`) so extraction and expansion are
//! deterministic for a given question and message set.

use std::collections::{BTreeMap, BTreeSet};

use crate::models::MailMessage;

/// Question tokens that never become search terms.
const STOP_WORDS: &[&str] = &[
    "the", "and", "was", "were", "that", "this", "with", "from", "for", "are", "have", "has",
    "been", "will", "would", "could", "should", "about", "into", "over", "show", "what", "when",
    "where", "how", "why", "who", "which", "does", "did", "can",
];

/// Domain seed vocabulary merged into every initial term set.
const SEED_TERMS: &[&str] = &["CoolSculpting", "Elite", "return", "RMA", "thermal", "sensor"];

/// Candidate phrases scanned for during expansion, by category.
const LOGISTICS_PHRASES: &[&str] = &[
    "waybill",
    "bill of lading",
    "palletize",
    "freight",
    "ltl",
    "pickup",
    "carrier",
    "logistics",
    "shipping",
    "label",
];

const TECHNICAL_PHRASES: &[&str] = &[
    "thermal sensor",
    "error code",
    "manufacturing defect",
    "protocol",
    "bypass",
    "temperature regulation",
];

const PROCESS_PHRASES: &[&str] = &[
    "credit memo",
    "restocking fee",
    "inspection",
    "warranty",
    "replacement",
    "manufacturing year",
];

/// Fixed domain-term list backing the precision-proxy metric.
const DOMAIN_TERMS: &[&str] = &[
    "coolsculpting",
    "elite",
    "return",
    "rma",
    "thermal",
    "sensor",
    "freight",
    "packaging",
    "credit",
    "allergan",
    "abbvie",
];

/// Derive the initial term set from the question.
///
/// Tokenizes on non-alphanumeric boundaries, drops stop-words and tokens
/// of three characters or fewer, title-cases the survivors, and merges
/// the domain seed vocabulary. Deterministic for a given question.
pub fn initial_terms(question: &str) -> BTreeSet<String> {
    let mut terms: BTreeSet<String> = SEED_TERMS.iter().map(|t| t.to_string()).collect();

    for token in question
        .split(|c: char| !c.is_alphanumeric() && c != '-')
        .map(str::trim)
    {
        let lower = token.to_lowercase();
        if lower.len() > 3 && !STOP_WORDS.contains(&lower.as_str()) {
            terms.insert(title_case(&lower));
        }
    }

    terms
}

/// Expand the term set from fetched message bodies.
///
/// Scans the concatenated bodies for the fixed candidate-phrase
/// vocabulary and adds every phrase that occurs; also adds sender domains
/// appearing in two or more of this iteration's messages. Never removes
/// anything from `current`.
pub fn expand_terms(messages: &[MailMessage], current: &BTreeSet<String>) -> BTreeSet<String> {
    let mut expanded = current.clone();

    let corpus: String = messages
        .iter()
        .map(|m| m.body.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ");

    for phrase in LOGISTICS_PHRASES
        .iter()
        .chain(TECHNICAL_PHRASES)
        .chain(PROCESS_PHRASES)
    {
        if corpus.contains(phrase) {
            expanded.insert(title_case(phrase));
        }
    }

    let mut domain_counts: BTreeMap<String, usize> = BTreeMap::new();
    for message in messages {
        if let Some((_, domain)) = message.meta.from_email.split_once('@') {
            *domain_counts.entry(domain.to_lowercase()).or_default() += 1;
        }
    }
    for (domain, count) in domain_counts {
        if count >= 2 {
            expanded.insert(domain);
        }
    }

    expanded
}

/// Whether `text` contains at least one term from the fixed domain list.
pub fn matches_domain_terms(text: &str) -> bool {
    let lower = text.to_lowercase();
    DOMAIN_TERMS.iter().any(|term| lower.contains(term))
}

/// Title-case each whitespace-separated word.
fn title_case(s: &str) -> String {
    s.split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    use crate::models::MessageMeta;

    fn message(from_email: &str, body: &str) -> MailMessage {
        MailMessage {
            meta: MessageMeta {
                id: "m1".to_string(),
                thread_id: "t1".to_string(),
                date: Utc::now(),
                from_email: from_email.to_string(),
                subject: String::new(),
                labels: vec![],
                snippet: String::new(),
            },
            body: body.to_string(),
        }
    }

    #[test]
    fn test_initial_terms_deterministic() {
        let question = "Why was the CoolSculpting Elite machine returned?";
        assert_eq!(initial_terms(question), initial_terms(question));
    }

    #[test]
    fn test_initial_terms_include_seeds_and_question_words() {
        let terms = initial_terms("Why was the CoolSculpting Elite machine returned?");
        assert!(terms.contains("RMA"));
        assert!(terms.contains("Thermal") || terms.contains("thermal"));
        assert!(terms.contains("Machine"));
        assert!(terms.contains("Returned"));
        // Stop-words and short tokens are dropped.
        assert!(!terms.iter().any(|t| t.eq_ignore_ascii_case("why")));
        assert!(!terms.iter().any(|t| t.eq_ignore_ascii_case("was")));
    }

    #[test]
    fn test_expand_adds_phrases_and_recurring_domains() {
        let messages = vec![
            message(
                "returns@allergan.com",
                "The freight carrier needs a bill of lading before LTL pickup.",
            ),
            message(
                "logistics@allergan.com",
                "Root cause was a manufacturing defect in the thermal sensor.",
            ),
            message("one-off@example.com", "unrelated"),
        ];
        let current = initial_terms("machine return");
        let expanded = expand_terms(&messages, &current);

        assert!(expanded.contains("Freight"));
        assert!(expanded.contains("Bill Of Lading"));
        assert!(expanded.contains("Manufacturing Defect"));
        assert!(expanded.contains("allergan.com"));
        // Single-occurrence domains do not qualify.
        assert!(!expanded.contains("example.com"));
        // Expansion never removes existing terms.
        assert!(current.is_subset(&expanded));
    }

    #[test]
    fn test_domain_term_matching() {
        assert!(matches_domain_terms("Subject: CoolSculpting return label"));
        assert!(matches_domain_terms("please issue the CREDIT memo"));
        assert!(!matches_domain_terms("lunch on thursday?"));
    }
}
