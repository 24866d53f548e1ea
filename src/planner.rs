//! Search query planning.
//!
//! Turns a term set plus iteration index into a small ordered list of
//! [`QueryPlan`]s. Iteration 0 issues seed patterns built from the domain
//! vocabulary and the question's own terms; later iterations partition the
//! learned term set into semantic buckets and issue one disjunctive
//! quoted-term query per non-empty bucket.
//!
//! The planner owns term and bucket logic only. Provider-specific query
//! syntax for constraints arrives pre-rendered as `constraint_clause` and
//! is appended verbatim.

use std::collections::BTreeSet;

use crate::models::QueryPlan;

/// Keyword membership tests for the expansion-query buckets.
const LOGISTICS_KEYWORDS: &[&str] = &["ship", "freight", "label", "pickup", "crate", "ltl"];
const TECHNICAL_KEYWORDS: &[&str] = &["error", "e-47", "thermal", "sensor", "p3"];
const PROCESS_KEYWORDS: &[&str] = &["rma", "return", "credit", "refund"];

/// Quoted terms per bucket query.
const TERMS_PER_BUCKET: usize = 3;

/// Plan this iteration's queries.
///
/// Returns at most `max_queries` plans for iteration ≥ 1; iteration 0
/// returns the fixed seed set.
pub fn plan(
    question: &str,
    terms: &BTreeSet<String>,
    iteration: u32,
    constraint_clause: &str,
    max_queries: usize,
) -> Vec<QueryPlan> {
    if iteration == 0 {
        seed_plans(question, terms, constraint_clause)
    } else {
        let mut plans = bucket_plans(terms, constraint_clause);
        plans.truncate(max_queries);
        plans
    }
}

/// Fixed seed patterns plus one query derived from the question's terms.
fn seed_plans(question: &str, terms: &BTreeSet<String>, constraint_clause: &str) -> Vec<QueryPlan> {
    let mut plans = vec![
        QueryPlan {
            query: with_clause(
                r#"("return" OR "RMA" OR "ship back" OR "pickup" OR "return label") ("CoolSculpting Elite")"#,
                constraint_clause,
            ),
            rationale: "return-process vocabulary against the product name".to_string(),
        },
        QueryPlan {
            query: with_clause(
                r#"("CoolSculpting" AND "Elite") AND ("thermal" OR "sensor" OR "E-47" OR "error")"#,
                constraint_clause,
            ),
            rationale: "technical fault vocabulary".to_string(),
        },
        QueryPlan {
            query: with_clause(
                r#"("packaging" OR "crate" OR "freight" OR "LTL") ("CoolSculpting")"#,
                constraint_clause,
            ),
            rationale: "shipping and packaging vocabulary".to_string(),
        },
        QueryPlan {
            query: with_clause(
                r#"("credit" OR "refund" OR "credit memo") ("CoolSculpting Elite")"#,
                constraint_clause,
            ),
            rationale: "credit and refund vocabulary".to_string(),
        },
    ];

    // One query straight from the question's own terms, skipping the terms
    // the fixed patterns already cover.
    let question_terms: Vec<&String> = terms
        .iter()
        .filter(|t| !bucket_member(t, LOGISTICS_KEYWORDS))
        .filter(|t| !bucket_member(t, TECHNICAL_KEYWORDS))
        .filter(|t| !bucket_member(t, PROCESS_KEYWORDS))
        .take(4)
        .collect();
    if !question_terms.is_empty() {
        let quoted: Vec<String> = question_terms.iter().map(|t| format!("\"{}\"", t)).collect();
        plans.push(QueryPlan {
            query: with_clause(&format!("({})", quoted.join(" OR ")), constraint_clause),
            rationale: format!("terms taken directly from the question: {}", question),
        });
    }

    plans
}

/// One disjunctive quoted-term query per non-empty semantic bucket.
fn bucket_plans(terms: &BTreeSet<String>, constraint_clause: &str) -> Vec<QueryPlan> {
    let buckets: [(&str, &[&str]); 3] = [
        ("logistics", LOGISTICS_KEYWORDS),
        ("technical", TECHNICAL_KEYWORDS),
        ("process", PROCESS_KEYWORDS),
    ];

    let mut plans = Vec::new();
    for (name, keywords) in buckets {
        let members: Vec<&String> = terms
            .iter()
            .filter(|t| bucket_member(t, keywords))
            .take(TERMS_PER_BUCKET)
            .collect();
        if members.is_empty() {
            continue;
        }
        let quoted: Vec<String> = members.iter().map(|t| format!("\"{}\"", t)).collect();
        plans.push(QueryPlan {
            query: with_clause(&format!("({})", quoted.join(" OR ")), constraint_clause),
            rationale: format!("{} terms learned from prior iterations", name),
        });
    }
    plans
}

fn bucket_member(term: &str, keywords: &[&str]) -> bool {
    let lower = term.to_lowercase();
    keywords.iter().any(|k| lower.contains(k))
}

fn with_clause(pattern: &str, constraint_clause: &str) -> String {
    if constraint_clause.is_empty() {
        pattern.to_string()
    } else {
        format!("{} {}", pattern, constraint_clause)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::terms::initial_terms;

    #[test]
    fn test_seed_iteration_produces_fixed_patterns() {
        let terms = initial_terms("Why was the CoolSculpting Elite machine returned?");
        let plans = plan("why returned", &terms, 0, "", 3);
        assert!(plans.len() >= 4);
        assert!(plans[0].query.contains("CoolSculpting Elite"));
        assert!(plans.iter().all(|p| !p.rationale.is_empty()));
    }

    #[test]
    fn test_expansion_iteration_caps_queries() {
        let mut terms = BTreeSet::new();
        for t in [
            "Freight", "Pickup", "Label", "Thermal", "Sensor", "Error Code", "RMA", "Credit Memo",
            "Refund",
        ] {
            terms.insert(t.to_string());
        }
        let plans = plan("q", &terms, 1, "", 3);
        assert!(plans.len() <= 3);
        // All three buckets have members here, so all three fire.
        assert_eq!(plans.len(), 3);
        assert!(plans[0].rationale.contains("logistics"));
    }

    #[test]
    fn test_empty_buckets_are_skipped() {
        let mut terms = BTreeSet::new();
        terms.insert("Freight".to_string());
        let plans = plan("q", &terms, 2, "", 3);
        assert_eq!(plans.len(), 1);
        assert!(plans[0].query.contains("\"Freight\""));
    }

    #[test]
    fn test_constraint_clause_appended_verbatim() {
        let mut terms = BTreeSet::new();
        terms.insert("Freight".to_string());
        let clause = "after:2025/01/01 (from:allergan.com)";
        let plans = plan("q", &terms, 1, clause, 3);
        assert!(plans[0].query.ends_with(clause));

        let seeded = plan("q", &initial_terms("q"), 0, clause, 3);
        assert!(seeded.iter().all(|p| p.query.ends_with(clause)));
    }

    #[test]
    fn test_deterministic_for_same_inputs() {
        let terms = initial_terms("thermal sensor freight credit");
        let a = plan("q", &terms, 1, "", 3);
        let b = plan("q", &terms, 1, "", 3);
        assert_eq!(a, b);
    }
}
